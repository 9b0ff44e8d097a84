use crate::core::config::GenerationConfig;
use crate::core::error::Degradable;
use crate::services::ledger::ExtractionResult;
use crate::services::llm::{GenerationRequest, LlmClient};
use crate::utils::text::strip_code_blocks;
use log::{debug, warn};

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You are a meticulous continuity editor. Respond with valid JSON only.";

/// Pulls entities and events out of a freshly written page.
pub struct Extractor<'a> {
    llm: &'a dyn LlmClient,
    config: &'a GenerationConfig,
}

impl<'a> Extractor<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &'a GenerationConfig) -> Self {
        Self { llm, config }
    }

    /// Never fails: backend or parse errors yield an empty result tagged as degraded.
    pub async fn extract(&self, text: &str, page_index: u32, label: &str) -> Degradable<ExtractionResult> {
        let request = GenerationRequest::new(EXTRACTION_SYSTEM_PROMPT, extraction_prompt(text, page_index, label))
            .temperature(self.config.extraction_temperature)
            .max_output_tokens(self.config.extraction_max_tokens)
            .timeout(self.config.extraction_timeout())
            .json();

        let raw = match self.llm.generate(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Extraction for page {} failed: {}", page_index, e);
                return Degradable::degraded(ExtractionResult::default(), e.to_string());
            }
        };

        match parse_extraction(&raw) {
            Ok(result) => {
                debug!(
                    "Page {}: extracted {} characters, {} locations, {} plot points, {} facts",
                    page_index,
                    result.characters.len(),
                    result.locations.len(),
                    result.plot_points.len(),
                    result.facts.len()
                );
                Degradable::Fresh(result)
            }
            Err(reason) => {
                warn!("Extraction for page {} returned malformed JSON: {}", page_index, reason);
                Degradable::degraded(ExtractionResult::default(), reason)
            }
        }
    }
}

/// Accepts only a JSON object; any other JSON shape is a parse failure.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, String> {
    let clean_json = strip_code_blocks(raw);
    let value: serde_json::Value = serde_json::from_str(&clean_json)
        .map_err(|e| format!("Failed to parse extraction JSON: {}", e))?;
    if !value.is_object() {
        return Err(format!("Extraction JSON is not an object: {}", clean_json));
    }
    serde_json::from_value(value).map_err(|e| format!("Failed to parse extraction JSON: {}", e))
}

fn extraction_prompt(text: &str, page_index: u32, label: &str) -> String {
    format!(
        "Analyse page {} (\"{}\") of a book and extract continuity information.\
        \n\nInstructions:\
        \n- characters: every named character on this page, with personality or physical traits and their role in the story.\
        \n- locations: every named place, with a short physical description.\
        \n- plot_points: events that move the story forward; importance is low, medium or high.\
        \n- subplots: secondary threads touched on this page and their status (introduced, developing, resolved).\
        \n- facts: concrete statements later pages must not contradict (ages, distances, relationships, rules of the world).\
        \n- figurative_language: distinctive metaphors and similes used verbatim.\
        \n- key_concepts: recurring ideas or themes.\
        \n- Omit anything not present on this page. Use empty arrays when nothing applies.\
        \n\nReturn only one JSON object with exactly these keys:\
        \n{{ \"characters\": [ {{ \"name\": \"...\", \"traits\": [\"...\"], \"role\": \"...\" }} ], \
        \"locations\": [ {{ \"name\": \"...\", \"description\": \"...\" }} ], \
        \"plot_points\": [ {{ \"event\": \"...\", \"importance\": \"low|medium|high\" }} ], \
        \"subplots\": [ {{ \"name\": \"...\", \"status\": \"...\" }} ], \
        \"facts\": [\"...\"], \"figurative_language\": [\"...\"], \"key_concepts\": [\"...\"] }}\
        \n\nPage text:\n{}",
        page_index, label, text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::LlmError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct CannedLlm {
        reply: Result<String, fn() -> LlmError>,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    impl CannedLlm {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing(error: fn() -> LlmError) -> Self {
            Self {
                reply: Err(error),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    #[tokio::test]
    async fn test_extract_parses_fenced_json() {
        let llm = CannedLlm::ok(
            "```json\n{\"characters\": [{\"name\": \"Mara\", \"traits\": [\"brave\"]}], \"facts\": [\"The tide turns at noon\"]}\n```",
        );
        let config = GenerationConfig::default();

        let result = Extractor::new(&llm, &config).extract("text", 3, "The Storm").await;

        assert!(!result.is_degraded());
        let result = result.into_inner();
        assert_eq!(result.characters[0].name, "Mara");
        assert_eq!(result.facts, vec!["The tide turns at noon".to_string()]);
        assert!(result.locations.is_empty());
    }

    #[tokio::test]
    async fn test_extract_uses_low_temperature_json_mode() {
        let llm = CannedLlm::ok("{}");
        let config = GenerationConfig::default();

        Extractor::new(&llm, &config).extract("text", 1, "Opening").await;

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].temperature, config.extraction_temperature);
        assert!(requests[0].user.contains("\"Opening\""));
    }

    #[tokio::test]
    async fn test_malformed_json_degrades_to_empty() {
        let llm = CannedLlm::ok("Sure! Here are the characters: Mara, Tom.");
        let config = GenerationConfig::default();

        let result = Extractor::new(&llm, &config).extract("text", 2, "x").await;

        assert!(result.is_degraded());
        assert!(result.into_inner().is_empty());
        assert_eq!(llm.requests.lock().unwrap().len(), 1, "no retry within the same page");
    }

    #[tokio::test]
    async fn test_schema_violation_degrades_to_empty() {
        // A character without a name fails validation.
        let llm = CannedLlm::ok(r#"{"characters": [{"traits": ["tall"]}]}"#);
        let config = GenerationConfig::default();

        let result = Extractor::new(&llm, &config).extract("text", 2, "x").await;
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn test_backend_error_degrades_to_empty() {
        let llm = CannedLlm::failing(|| LlmError::Backend {
            status: 500,
            body: "boom".to_string(),
        });
        let config = GenerationConfig::default();

        match Extractor::new(&llm, &config).extract("text", 2, "x").await {
            Degradable::Degraded { fallback, reason } => {
                assert!(fallback.is_empty());
                assert!(reason.contains("500"));
            }
            Degradable::Fresh(_) => panic!("Expected degraded extraction"),
        }
    }

    #[test]
    fn test_parse_extraction_defaults_missing_fields() {
        let result = parse_extraction(r#"{"key_concepts": ["memory"]}"#).unwrap();
        assert_eq!(result.key_concepts, vec!["memory".to_string()]);
        assert!(result.characters.is_empty());
        assert!(parse_extraction("[]").is_err());
        assert!(parse_extraction(r#""characters""#).is_err());
    }

    #[tokio::test]
    async fn test_non_object_reply_degrades() {
        let llm = CannedLlm::ok("```json\n[]\n```");
        let config = GenerationConfig::default();

        let result = Extractor::new(&llm, &config).extract("text", 2, "x").await;
        assert!(result.is_degraded());
        assert!(result.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_null_field_keeps_rest_of_page() {
        let llm = CannedLlm::ok(
            r#"{"characters": [{"name": "Mara", "traits": ["brave"]}], "subplots": [{"name": "ledger", "status": null}]}"#,
        );
        let config = GenerationConfig::default();

        let result = Extractor::new(&llm, &config).extract("text", 2, "x").await;
        assert!(!result.is_degraded());
        let result = result.into_inner();
        assert_eq!(result.characters[0].name, "Mara");
        assert_eq!(result.subplots[0].name, "ledger");
    }
}
