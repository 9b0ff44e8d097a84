use crate::core::config::GenerationConfig;
use crate::core::error::Degradable;
use crate::core::state::GeneratedPage;
use crate::services::llm::{GenerationRequest, LlmClient};
use log::{info, warn};

pub const DEFAULT_SUMMARY_CADENCE: u32 = 5;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a story editor who keeps a concise running synopsis of a book in progress.";

/// True once `cadence` pages have accumulated since the last summary.
/// A cadence of zero disables summarization.
pub fn should_summarize(page_index: u32, last_summary_index: u32, cadence: u32) -> bool {
    cadence > 0 && page_index.saturating_sub(last_summary_index) >= cadence
}

pub struct Summarizer<'a> {
    llm: &'a dyn LlmClient,
    config: &'a GenerationConfig,
}

impl<'a> Summarizer<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &'a GenerationConfig) -> Self {
        Self { llm, config }
    }

    /// Produces a summary of pages `1..=page_index` that replaces `prior_summary`.
    /// On failure the prior summary comes back as the degraded fallback.
    pub async fn summarize(
        &self,
        prior_summary: &str,
        pages_since: &[GeneratedPage],
        last_summary_index: u32,
        page_index: u32,
    ) -> Degradable<String> {
        if pages_since.is_empty() {
            return Degradable::degraded(prior_summary.to_string(), "no new pages to summarize");
        }

        let request = GenerationRequest::new(
            SUMMARY_SYSTEM_PROMPT,
            summary_prompt(prior_summary, pages_since, last_summary_index, page_index),
        )
        .temperature(self.config.summary_temperature)
        .max_output_tokens(self.config.summary_max_tokens)
        .timeout(self.config.summary_timeout());

        match self.llm.generate(&request).await {
            Ok(summary) if !summary.trim().is_empty() => {
                info!(
                    "Rolling summary updated through page {} ({} chars)",
                    page_index,
                    summary.trim().len()
                );
                Degradable::Fresh(summary.trim().to_string())
            }
            Ok(_) => {
                warn!("Summarizer returned nothing for pages {}..={}", last_summary_index + 1, page_index);
                Degradable::degraded(prior_summary.to_string(), "empty summary")
            }
            Err(e) => {
                warn!(
                    "Summarizer failed for pages {}..={}: {}",
                    last_summary_index + 1,
                    page_index,
                    e
                );
                Degradable::degraded(prior_summary.to_string(), e.to_string())
            }
        }
    }
}

fn summary_prompt(
    prior_summary: &str,
    pages_since: &[GeneratedPage],
    last_summary_index: u32,
    page_index: u32,
) -> String {
    let previous = if prior_summary.trim().is_empty() {
        "(none yet: this is the first summary)".to_string()
    } else {
        format!("Covers pages 1-{}:\n{}", last_summary_index, prior_summary.trim())
    };

    let new_pages = pages_since
        .iter()
        .map(|p| format!("--- Page {}: {} ---\n{}", p.index, p.label, p.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Update the running synopsis of the book so it covers pages 1-{}.\
        \n\nPrevious synopsis:\n{}\
        \n\nNew pages since then:\n{}\
        \n\nInstructions:\
        \n- Write one self-contained synopsis of 500-800 words that replaces the previous one; do not append to it.\
        \n- Keep every character, location, open question and unresolved thread a later page might need.\
        \n- Preserve the order of events.\
        \n- Return only the synopsis prose, without headings or commentary.",
        page_index, previous, new_pages
    )
}
