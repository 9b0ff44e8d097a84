use crate::core::config::GenerationConfig;
use crate::core::error::GenerationError;
use crate::core::state::{BookRequest, BookStructure, OutlineEntry};
use crate::services::llm::{GenerationRequest, LlmClient};
use crate::utils::text::strip_code_blocks;
use log::{info, warn};
use serde::Deserialize;

const OUTLINE_SYSTEM_PROMPT: &str =
    "You are an experienced book editor who plans books page by page. Respond with valid JSON only.";

#[derive(Deserialize)]
struct OutlineResponse {
    pages: Vec<OutlinePage>,
}

#[derive(Deserialize)]
struct OutlinePage {
    label: String,
    #[serde(default)]
    brief: String,
}

pub struct OutlinePlanner<'a> {
    llm: &'a dyn LlmClient,
    config: &'a GenerationConfig,
}

impl<'a> OutlinePlanner<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &'a GenerationConfig) -> Self {
        Self { llm, config }
    }

    /// Plans exactly `request.target_length` pages. Without an outline there is no book,
    /// so every failure here is fatal.
    pub async fn plan(&self, request: &BookRequest) -> Result<BookStructure, GenerationError> {
        if request.target_length == 0 {
            return Err(GenerationError::InvalidOutline(
                "target_length must be at least 1".to_string(),
            ));
        }

        let llm_request = GenerationRequest::new(OUTLINE_SYSTEM_PROMPT, outline_prompt(request))
            .temperature(self.config.outline_temperature)
            .max_output_tokens(self.config.outline_max_tokens)
            .timeout(self.config.outline_timeout())
            .json();

        let raw = self.llm.generate(&llm_request).await?;
        let structure = parse_outline(&raw, request)?;
        info!(
            "Planned outline for \"{}\" with {} pages",
            structure.title,
            structure.target_length()
        );
        Ok(structure)
    }
}

pub fn parse_outline(raw: &str, request: &BookRequest) -> Result<BookStructure, GenerationError> {
    let clean_json = strip_code_blocks(raw);
    let response: OutlineResponse = serde_json::from_str(&clean_json)
        .map_err(|e| GenerationError::InvalidOutline(format!("Failed to parse outline JSON: {}", e)))?;

    let wanted = request.target_length as usize;
    if response.pages.len() < wanted {
        return Err(GenerationError::InvalidOutline(format!(
            "expected {} pages, got {}",
            wanted,
            response.pages.len()
        )));
    }
    if response.pages.len() > wanted {
        warn!(
            "Outline returned {} pages, keeping the first {}",
            response.pages.len(),
            wanted
        );
    }

    let outline = response
        .pages
        .into_iter()
        .take(wanted)
        .enumerate()
        .map(|(i, page)| {
            let index = i as u32 + 1;
            let label = page.label.trim();
            OutlineEntry {
                index,
                label: if label.is_empty() {
                    format!("Page {}", index)
                } else {
                    label.to_string()
                },
                brief: page.brief.trim().to_string(),
            }
        })
        .collect();

    let structure = BookStructure {
        title: request.title.clone(),
        themes: request.themes.clone(),
        tone: request.tone.clone(),
        premise: request.premise.clone(),
        outline,
    };
    structure.validate().map_err(GenerationError::InvalidOutline)?;
    Ok(structure)
}

fn outline_prompt(request: &BookRequest) -> String {
    let themes = request
        .themes
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let premise = if request.premise.trim().is_empty() {
        "(choose one that fits the title and themes)"
    } else {
        request.premise.trim()
    };

    format!(
        "Plan a book page by page.\
        \n\nTitle: {}\
        \nThemes: {}\
        \nTone: {}\
        \nPremise: {}\
        \nNumber of pages: {}\
        \n\nInstructions:\
        \n- Produce exactly {} pages in reading order.\
        \n- Each page gets a short label (a section or chapter heading) and a brief of 2-4 sentences describing what happens on it.\
        \n- The first page opens the book; the last page brings it to a satisfying close.\
        \n\nReturn only one JSON object:\
        \n{{ \"pages\": [ {{ \"label\": \"...\", \"brief\": \"...\" }} ] }}",
        request.title,
        if themes.is_empty() { "(none given)" } else { themes.as_str() },
        if request.tone.is_empty() { "(none given)" } else { request.tone.as_str() },
        premise,
        request.target_length,
        request.target_length,
    )
}
