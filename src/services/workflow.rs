use crate::core::config::GenerationConfig;
use crate::core::error::{Degradable, GenerationError};
use crate::core::state::{BookRequest, BookStructure, CoherenceState, GeneratedPage};
use crate::services::context::{assemble, ContextLimits};
use crate::services::extractor::Extractor;
use crate::services::ledger;
use crate::services::llm::{GenerationRequest, LlmClient};
use crate::services::outline::OutlinePlanner;
use crate::services::store::BookStore;
use crate::services::summarizer::{should_summarize, Summarizer};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::sync::Arc;

/// Where the page loop currently is.
///
/// `Outlined` doubles as the idle state between pages. `Error` is entered only
/// when the page text itself could not be produced or saved, and is absorbing:
/// reopen the book to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Outlined,
    GeneratingPage,
    Extracting,
    Summarizing,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub index: u32,
    pub label: String,
    pub text: String,
    pub coherence: CoherenceState,
}

/// Drives one book, one page at a time. Owns the book's pages and coherence
/// state exclusively; separate books get separate workflows.
pub struct BookWorkflow {
    book_id: String,
    config: GenerationConfig,
    llm: Box<dyn LlmClient>,
    store: Arc<dyn BookStore>,
    structure: BookStructure,
    pages: Vec<GeneratedPage>,
    coherence: CoherenceState,
    phase: GenerationPhase,
    unattended: bool,
}

impl BookWorkflow {
    /// Loads a book from `store`, planning and saving its outline first when
    /// the book does not exist yet and a `request` is given.
    pub async fn open(
        book_id: &str,
        config: GenerationConfig,
        llm: Box<dyn LlmClient>,
        store: Arc<dyn BookStore>,
        request: Option<&BookRequest>,
    ) -> Result<Self, GenerationError> {
        let structure = match store
            .load_structure(book_id)
            .await
            .map_err(GenerationError::Storage)?
        {
            Some(structure) => structure,
            None => {
                let request = request.ok_or_else(|| {
                    GenerationError::InvalidState(format!(
                        "book '{}' has no outline and no request to plan one",
                        book_id
                    ))
                })?;
                println!("Planning outline for \"{}\"...", request.title);
                let structure = OutlinePlanner::new(llm.as_ref(), &config)
                    .plan(request)
                    .await?;
                store
                    .save_structure(book_id, &structure)
                    .await
                    .map_err(GenerationError::Storage)?;
                structure
            }
        };
        structure
            .validate()
            .map_err(GenerationError::InvalidOutline)?;

        let pages = store
            .load_pages(book_id)
            .await
            .map_err(GenerationError::Storage)?;
        check_contiguous(&pages, structure.target_length())?;

        let coherence = store
            .load_coherence_state(book_id)
            .await
            .map_err(GenerationError::Storage)?;
        let written = pages.len() as u32;
        if coherence.last_summary_index > written || coherence.last_enriched_index > written {
            return Err(GenerationError::InvalidState(format!(
                "coherence state covers page {} but only {} pages exist",
                coherence.last_summary_index.max(coherence.last_enriched_index),
                written
            )));
        }

        let phase = if written == structure.target_length() {
            GenerationPhase::Complete
        } else {
            GenerationPhase::Outlined
        };
        info!(
            "Opened book '{}': {}/{} pages written",
            book_id,
            written,
            structure.target_length()
        );

        Ok(Self {
            book_id: book_id.to_string(),
            config,
            llm,
            store,
            structure,
            pages,
            coherence,
            phase,
            unattended: false,
        })
    }

    pub fn with_unattended(mut self, unattended: bool) -> Self {
        self.unattended = unattended;
        self
    }

    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub fn structure(&self) -> &BookStructure {
        &self.structure
    }

    pub fn pages(&self) -> &[GeneratedPage] {
        &self.pages
    }

    pub fn coherence(&self) -> &CoherenceState {
        &self.coherence
    }

    pub fn next_page_index(&self) -> u32 {
        self.pages.len() as u32 + 1
    }

    pub fn is_complete(&self) -> bool {
        self.pages.len() as u32 >= self.structure.target_length()
    }

    pub async fn generate_next_page(&mut self) -> Result<PageResult, GenerationError> {
        self.generate_page(self.next_page_index()).await
    }

    /// Writes page `index`, which must be the next page. Contract violations are
    /// rejected before any backend call.
    pub async fn generate_page(&mut self, index: u32) -> Result<PageResult, GenerationError> {
        if self.phase == GenerationPhase::Error {
            return Err(GenerationError::InvalidState(
                "a previous page attempt failed; reopen the book to retry".to_string(),
            ));
        }
        if self.is_complete() {
            return Err(GenerationError::AlreadyComplete {
                target: self.structure.target_length(),
            });
        }
        let expected = self.next_page_index();
        if index != expected {
            return Err(GenerationError::OutOfOrder {
                expected,
                requested: index,
            });
        }

        // Page N must see the facts of pages 1..N-1.
        self.catch_up_coherence().await;

        self.phase = GenerationPhase::GeneratingPage;
        let page = match self.write_page(index).await {
            Ok(page) => page,
            Err(e) => {
                self.phase = GenerationPhase::Error;
                return Err(e);
            }
        };
        self.pages.push(page.clone());
        info!("Page {}/{} saved", index, self.structure.target_length());

        self.enrich(index).await;

        self.phase = if self.is_complete() {
            GenerationPhase::Complete
        } else {
            GenerationPhase::Outlined
        };

        Ok(PageResult {
            index: page.index,
            label: page.label,
            text: page.text,
            coherence: self.coherence.clone(),
        })
    }

    /// Generates and saves one page. Nothing is persisted unless the whole page is.
    async fn write_page(&self, index: u32) -> Result<GeneratedPage, GenerationError> {
        let entry = self.structure.entry(index).ok_or_else(|| {
            GenerationError::InvalidState(format!("no outline entry for page {}", index))
        })?;

        let user = if index == 1 {
            self.lead_page_prompt()
        } else {
            let limits = ContextLimits::from(&self.config);
            let context = assemble(&self.pages, &self.coherence, index, &limits);
            self.page_prompt(index, &context.render())
        };

        let request = GenerationRequest::new(self.system_prompt(), user)
            .temperature(self.config.page_temperature)
            .max_output_tokens(self.config.page_max_tokens)
            .timeout(self.config.page_timeout());

        let text = self.llm.generate(&request).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::EmptyPage { index });
        }

        let page = GeneratedPage {
            index,
            label: entry.label.clone(),
            text: text.to_string(),
            is_lead_page: index == 1,
        };
        self.store
            .save_page(&self.book_id, &page)
            .await
            .map_err(GenerationError::Storage)?;
        Ok(page)
    }

    /// Runs the coherence stage for every saved page the ledger has not seen yet.
    async fn catch_up_coherence(&mut self) {
        let pending: Vec<u32> = self
            .pages
            .iter()
            .map(|p| p.index)
            .filter(|&i| i > self.coherence.last_enriched_index)
            .collect();
        for index in pending {
            debug!("Catching up coherence for page {}", index);
            self.enrich(index).await;
        }
    }

    /// Best-effort: extraction, ledger merge, optional summary, then save.
    /// Failures are logged and leave the previous state in place.
    async fn enrich(&mut self, index: u32) {
        let Some(page) = self.pages.iter().find(|p| p.index == index) else {
            return;
        };

        self.phase = GenerationPhase::Extracting;
        let extraction = Extractor::new(self.llm.as_ref(), &self.config)
            .extract(&page.text, page.index, &page.label)
            .await;
        if extraction.is_degraded() {
            warn!("Page {}: continuing without new ledger entries", index);
        }
        ledger::apply(&mut self.coherence, &extraction.into_inner(), index);
        self.coherence.last_enriched_index = self.coherence.last_enriched_index.max(index);

        if should_summarize(
            index,
            self.coherence.last_summary_index,
            self.config.summary_cadence,
        ) {
            self.phase = GenerationPhase::Summarizing;
            let last = self.coherence.last_summary_index;
            let since: Vec<GeneratedPage> = self
                .pages
                .iter()
                .filter(|p| p.index > last && p.index <= index)
                .cloned()
                .collect();
            let outcome = Summarizer::new(self.llm.as_ref(), &self.config)
                .summarize(&self.coherence.rolling_summary, &since, last, index)
                .await;
            match outcome {
                Degradable::Fresh(summary) => {
                    self.coherence.rolling_summary = summary;
                    self.coherence.last_summary_index = index;
                }
                Degradable::Degraded { reason, .. } => {
                    warn!(
                        "Page {}: keeping summary through page {} ({})",
                        index, last, reason
                    );
                }
            }
        }

        if let Err(e) = self
            .store
            .save_coherence_state(&self.book_id, &self.coherence)
            .await
        {
            warn!("Failed to save coherence state after page {}: {:#}", index, e);
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are an accomplished author writing the book \"{}\" one page at a time.",
            self.structure.title
        );
        if !self.structure.tone.is_empty() {
            prompt.push_str(&format!(" Keep the tone {}.", self.structure.tone));
        }
        prompt.push_str(" Return only the text of the requested page, without headings or commentary.");
        prompt
    }

    fn book_header(&self) -> String {
        let themes = self
            .structure
            .themes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut header = format!("Title: {}", self.structure.title);
        if !themes.is_empty() {
            header.push_str(&format!("\nThemes: {}", themes));
        }
        if !self.structure.tone.is_empty() {
            header.push_str(&format!("\nTone: {}", self.structure.tone));
        }
        if !self.structure.premise.is_empty() {
            header.push_str(&format!("\nPremise: {}", self.structure.premise));
        }
        header
    }

    fn page_task(&self, index: u32) -> String {
        let total = self.structure.target_length();
        let mut task = String::new();
        if let Some(entry) = self.structure.entry(index) {
            task.push_str(&format!(
                "Write page {} of {}: \"{}\".\nWhat happens on this page: {}",
                index, total, entry.label, entry.brief
            ));
        }
        match self.structure.entry(index + 1) {
            Some(next) => task.push_str(&format!(
                "\nThe following page will be \"{}\", so leave room for it.",
                next.label
            )),
            None => task.push_str("\nThis is the final page: bring the book to a close."),
        }
        task
    }

    fn lead_page_prompt(&self) -> String {
        let outline = self
            .structure
            .outline
            .iter()
            .map(|e| format!("{}. {}: {}", e.index, e.label, e.brief))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\n\nOUTLINE:\n{}\n\n{}\n\nThis is the opening page. Establish the setting, the voice and the main characters.",
            self.book_header(),
            outline,
            self.page_task(1)
        )
    }

    fn page_prompt(&self, index: u32, context: &str) -> String {
        format!(
            "{}\n\n{}\n\n{}\n\nContinue seamlessly from the most recent page. Stay consistent with the characters, locations and established facts above, and do not reuse the listed figurative language.",
            self.book_header(),
            context,
            self.page_task(index)
        )
    }

    /// Generates pages until the book is complete, asking between pages unless unattended.
    pub async fn run(&mut self) -> Result<()> {
        let total = self.structure.target_length();
        if self.is_complete() {
            println!("Book '{}' is already complete ({} pages).", self.book_id, total);
            return Ok(());
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_position(self.pages.len() as u64);

        while !self.is_complete() {
            let index = self.next_page_index();
            if let Some(entry) = self.structure.entry(index) {
                pb.set_message(entry.label.clone());
            }
            let result = self.generate_next_page().await?;
            pb.inc(1);

            if !self.unattended && !self.is_complete() {
                pb.suspend(|| println!("\n--- Page {}: {} ---\n{}\n", result.index, result.label, result.text));
                let ans = pb.suspend(|| {
                    inquire::Confirm::new("Continue to next page?")
                        .with_default(true)
                        .prompt()
                });

                match ans {
                    Ok(true) => {}
                    Ok(false) => {
                        pb.abandon_with_message("stopped");
                        println!("Stopping as requested.");
                        return Ok(());
                    }
                    Err(_) => {
                        pb.abandon_with_message("stopped");
                        println!("Error reading input, stopping.");
                        return Ok(());
                    }
                }
            }
        }

        pb.finish_with_message("done");
        println!("All {} pages written!", total);
        Ok(())
    }
}

fn check_contiguous(pages: &[GeneratedPage], target: u32) -> Result<(), GenerationError> {
    for (position, page) in pages.iter().enumerate() {
        let expected = position as u32 + 1;
        if page.index != expected {
            return Err(GenerationError::InvalidState(format!(
                "saved pages are not contiguous: found page {} where page {} belongs",
                page.index, expected
            )));
        }
    }
    if pages.len() as u32 > target {
        return Err(GenerationError::InvalidState(format!(
            "{} pages saved but the outline has {}",
            pages.len(),
            target
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, LlmError};
    use crate::core::io::MemoryStorage;
    use crate::core::state::OutlineEntry;
    use crate::services::store::StorageBookStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CallKind {
        Outline,
        Page,
        Extraction,
        Summary,
    }

    fn classify(request: &GenerationRequest) -> CallKind {
        if request.user.starts_with("Plan a book") {
            CallKind::Outline
        } else if request.user.starts_with("Analyse page") {
            CallKind::Extraction
        } else if request.user.starts_with("Update the running synopsis") {
            CallKind::Summary
        } else {
            CallKind::Page
        }
    }

    #[derive(Default)]
    struct Script {
        calls: Vec<(CallKind, String)>,
        page_failures: usize,
        summary_failures: usize,
        extraction_reply: Option<String>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockLlm {
        script: Arc<Mutex<Script>>,
    }

    impl std::fmt::Debug for Script {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Script({} calls)", self.calls.len())
        }
    }

    impl MockLlm {
        fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            f(&mut self.script.lock().unwrap())
        }

        fn count(&self, kind: CallKind) -> usize {
            self.with(|s| s.calls.iter().filter(|(k, _)| *k == kind).count())
        }

        fn prompts(&self, kind: CallKind) -> Vec<String> {
            self.with(|s| {
                s.calls
                    .iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, u)| u.clone())
                    .collect()
            })
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
            let kind = classify(request);
            self.with(|s| {
                s.calls.push((kind, request.user.clone()));
                match kind {
                    CallKind::Outline => Ok(r#"{"pages": [{"label": "One", "brief": "b1"}, {"label": "Two", "brief": "b2"}, {"label": "Three", "brief": "b3"}]}"#.to_string()),
                    CallKind::Page => {
                        if s.page_failures > 0 {
                            s.page_failures -= 1;
                            return Err(LlmError::Timeout(request.timeout));
                        }
                        let n = s.calls.iter().filter(|(k, _)| *k == CallKind::Page).count();
                        Ok(format!("Generated text number {}.", n))
                    }
                    CallKind::Extraction => Ok(s
                        .extraction_reply
                        .clone()
                        .unwrap_or_else(|| "{}".to_string())),
                    CallKind::Summary => {
                        if s.summary_failures > 0 {
                            s.summary_failures -= 1;
                            return Err(LlmError::Backend {
                                status: 500,
                                body: "down".to_string(),
                            });
                        }
                        Ok("A fresh synopsis.".to_string())
                    }
                }
            })
        }
    }

    fn structure(n: u32) -> BookStructure {
        BookStructure {
            title: "The Lighthouse Keeper".to_string(),
            themes: ["solitude".to_string()].into_iter().collect(),
            tone: "melancholic".to_string(),
            premise: String::new(),
            outline: (1..=n)
                .map(|i| OutlineEntry {
                    index: i,
                    label: format!("Part {}", i),
                    brief: format!("Brief {}", i),
                })
                .collect(),
        }
    }

    fn request() -> BookRequest {
        BookRequest {
            id: "book".to_string(),
            title: "The Lighthouse Keeper".to_string(),
            themes: Default::default(),
            tone: "melancholic".to_string(),
            premise: String::new(),
            target_length: 3,
        }
    }

    fn store() -> Arc<StorageBookStore> {
        Arc::new(StorageBookStore::new(Arc::new(MemoryStorage::new()), "build"))
    }

    async fn open_with(
        store: Arc<StorageBookStore>,
        llm: &MockLlm,
        config: GenerationConfig,
    ) -> Result<BookWorkflow, GenerationError> {
        BookWorkflow::open("book", config, Box::new(llm.clone()), store, Some(&request())).await
    }

    fn assert_contiguous(pages: &[GeneratedPage]) {
        for (i, p) in pages.iter().enumerate() {
            assert_eq!(p.index, i as u32 + 1);
        }
    }

    #[tokio::test]
    async fn test_three_page_scenario() -> Result<()> {
        let store = store();
        let llm = MockLlm::default();
        let mut workflow = open_with(store.clone(), &llm, GenerationConfig::default()).await?;
        assert_eq!(workflow.phase(), GenerationPhase::Outlined);
        assert_eq!(llm.count(CallKind::Outline), 1);

        let first = workflow.generate_next_page().await?;
        assert_eq!(first.index, 1);
        assert_eq!(first.label, "One");
        assert!(workflow.pages()[0].is_lead_page);

        let second = workflow.generate_next_page().await?;
        assert_eq!(second.index, 2);
        let third = workflow.generate_next_page().await?;
        assert_eq!(third.index, 3);

        assert_eq!(workflow.phase(), GenerationPhase::Complete);
        assert_eq!(store.load_pages("book").await?.len(), 3);
        assert_eq!(llm.count(CallKind::Summary), 0);
        assert_eq!(llm.count(CallKind::Extraction), 3);
        assert!(workflow.coherence().rolling_summary.is_empty());
        assert_eq!(workflow.coherence().last_enriched_index, 3);

        let page_prompts = llm.prompts(CallKind::Page);
        assert!(page_prompts[0].contains("OUTLINE:"));
        assert!(!page_prompts[0].contains("RECENT PAGES"));
        assert!(page_prompts[1].contains("RECENT PAGES"));
        assert!(page_prompts[1].contains(&first.text));
        assert!(!page_prompts[1].contains("first page of the book"));
        assert!(page_prompts[2].contains("final page"));
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_order_and_complete_are_rejected_without_backend_calls() -> Result<()> {
        let llm = MockLlm::default();
        let mut workflow = open_with(store(), &llm, GenerationConfig::default()).await?;
        let calls_before = llm.with(|s| s.calls.len());

        let err = workflow.generate_page(2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(matches!(
            err,
            GenerationError::OutOfOrder {
                expected: 1,
                requested: 2
            }
        ));
        assert_eq!(llm.with(|s| s.calls.len()), calls_before);

        for _ in 0..3 {
            workflow.generate_next_page().await?;
        }
        let calls_before = llm.with(|s| s.calls.len());
        let err = workflow.generate_next_page().await.unwrap_err();
        assert!(matches!(err, GenerationError::AlreadyComplete { target: 3 }));
        assert_eq!(llm.with(|s| s.calls.len()), calls_before);
        Ok(())
    }

    #[tokio::test]
    async fn test_page_failure_persists_nothing_and_is_absorbing() -> Result<()> {
        let store = store();
        let llm = MockLlm::default();
        let mut workflow = open_with(store.clone(), &llm, GenerationConfig::default()).await?;
        workflow.generate_next_page().await?;
        let state_before = workflow.coherence().clone();

        llm.with(|s| s.page_failures = 1);
        let err = workflow.generate_next_page().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(workflow.phase(), GenerationPhase::Error);
        assert_eq!(workflow.pages().len(), 1);
        assert_eq!(store.load_pages("book").await?.len(), 1);
        assert_eq!(workflow.coherence(), &state_before);

        let err = workflow.generate_next_page().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);

        let mut reopened = open_with(store.clone(), &llm, GenerationConfig::default()).await?;
        let retry = reopened.generate_next_page().await?;
        assert_eq!(retry.index, 2);
        assert_contiguous(&store.load_pages("book").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_pages_stay_contiguous_across_failures_and_reopens() -> Result<()> {
        let store = store();
        store.save_structure("book", &structure(8)).await?;
        let llm = MockLlm::default();

        let mut failures = [0, 1, 0, 2, 0, 0, 1, 0, 0, 0, 0, 0].into_iter();
        while store.load_pages("book").await?.len() < 8 {
            llm.with(|s| s.page_failures = failures.next().unwrap_or(0));
            let mut workflow = open_with(store.clone(), &llm, GenerationConfig::default()).await?;
            while !workflow.is_complete() {
                if workflow.generate_next_page().await.is_err() {
                    break;
                }
            }
            assert_contiguous(&store.load_pages("book").await?);
        }
        let pages = store.load_pages("book").await?;
        assert_eq!(pages.len(), 8);
        assert_contiguous(&pages);
        Ok(())
    }

    #[tokio::test]
    async fn test_extraction_failure_does_not_block_pages() -> Result<()> {
        let llm = MockLlm::default();
        llm.with(|s| s.extraction_reply = Some("not json at all".to_string()));
        let mut workflow = open_with(store(), &llm, GenerationConfig::default()).await?;

        let result = workflow.generate_next_page().await?;
        assert_eq!(result.index, 1);
        assert!(result.coherence.characters.is_empty());
        assert_eq!(result.coherence.last_enriched_index, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_extracted_entities_reach_the_next_page_prompt() -> Result<()> {
        let llm = MockLlm::default();
        llm.with(|s| {
            s.extraction_reply = Some(
                r#"{"characters": [{"name": "Mara", "traits": ["stubborn"], "role": "keeper"}],
                    "facts": ["The lamp has been dark for ten years"],
                    "figurative_language": ["fog like wet wool"]}"#
                    .to_string(),
            )
        });
        let mut workflow = open_with(store(), &llm, GenerationConfig::default()).await?;

        workflow.generate_next_page().await?;
        workflow.generate_next_page().await?;

        let prompt = &llm.prompts(CallKind::Page)[1];
        assert!(prompt.contains("- Mara (keeper): stubborn"));
        assert!(prompt.contains("The lamp has been dark for ten years"));
        assert!(prompt.contains("fog like wet wool"));
        Ok(())
    }

    #[tokio::test]
    async fn test_summary_runs_on_cadence_and_retries_after_failure() -> Result<()> {
        let store = store();
        store.save_structure("book", &structure(6)).await?;
        let llm = MockLlm::default();
        llm.with(|s| s.summary_failures = 1);
        let config = GenerationConfig {
            summary_cadence: 2,
            ..Default::default()
        };
        let mut workflow = open_with(store.clone(), &llm, config).await?;

        workflow.generate_next_page().await?;
        assert_eq!(llm.count(CallKind::Summary), 0);

        // Page 2 hits the cadence but the summarizer fails.
        workflow.generate_next_page().await?;
        assert_eq!(llm.count(CallKind::Summary), 1);
        assert_eq!(workflow.coherence().last_summary_index, 0);
        assert!(workflow.coherence().rolling_summary.is_empty());

        // Page 3 is still past the cadence, so the same window is retried.
        workflow.generate_next_page().await?;
        assert_eq!(llm.count(CallKind::Summary), 2);
        assert_eq!(workflow.coherence().last_summary_index, 3);
        assert_eq!(workflow.coherence().rolling_summary, "A fresh synopsis.");
        let retry_prompt = &llm.prompts(CallKind::Summary)[1];
        assert!(retry_prompt.contains("--- Page 1:"));
        assert!(retry_prompt.contains("--- Page 3:"));

        workflow.generate_next_page().await?;
        assert_eq!(llm.count(CallKind::Summary), 2);
        workflow.generate_next_page().await?;
        assert_eq!(llm.count(CallKind::Summary), 3);
        assert_eq!(workflow.coherence().last_summary_index, 5);

        let saved = store.load_coherence_state("book").await?;
        assert_eq!(saved.last_summary_index, 5);

        let next_prompt = {
            workflow.generate_next_page().await?;
            llm.prompts(CallKind::Page).last().cloned().unwrap()
        };
        assert!(next_prompt.contains("STORY SO FAR (pages 1-5)"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unenriched_pages_are_caught_up_before_next_page() -> Result<()> {
        let store = store();
        store.save_structure("book", &structure(3)).await?;
        for i in 1..=2 {
            store
                .save_page(
                    "book",
                    &GeneratedPage {
                        index: i,
                        label: format!("Part {}", i),
                        text: format!("Saved text {}", i),
                        is_lead_page: i == 1,
                    },
                )
                .await?;
        }
        let llm = MockLlm::default();
        let mut workflow = open_with(store.clone(), &llm, GenerationConfig::default()).await?;
        assert_eq!(workflow.next_page_index(), 3);

        workflow.generate_next_page().await?;

        let kinds: Vec<CallKind> = llm.with(|s| s.calls.iter().map(|(k, _)| *k).collect());
        assert_eq!(
            kinds,
            vec![
                CallKind::Extraction,
                CallKind::Extraction,
                CallKind::Page,
                CallKind::Extraction
            ]
        );
        assert_eq!(workflow.coherence().last_enriched_index, 3);
        assert_eq!(workflow.phase(), GenerationPhase::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_rejects_gaps_and_missing_outline() -> Result<()> {
        let store = store();
        let llm = MockLlm::default();

        let err = BookWorkflow::open(
            "book",
            GenerationConfig::default(),
            Box::new(llm.clone()),
            store.clone(),
            None,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(llm.count(CallKind::Outline), 0);

        store.save_structure("book", &structure(5)).await?;
        for i in [1, 3] {
            store
                .save_page(
                    "book",
                    &GeneratedPage {
                        index: i,
                        label: String::new(),
                        text: "t".to_string(),
                        is_lead_page: i == 1,
                    },
                )
                .await?;
        }
        let err = open_with(store, &llm, GenerationConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GenerationError::InvalidState(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_unattended_completes_book() -> Result<()> {
        let store = store();
        let llm = MockLlm::default();
        let mut workflow = open_with(store.clone(), &llm, GenerationConfig::default())
            .await?
            .with_unattended(true);

        workflow.run().await?;

        assert!(workflow.is_complete());
        assert_eq!(store.load_pages("book").await?.len(), 3);
        Ok(())
    }
}
