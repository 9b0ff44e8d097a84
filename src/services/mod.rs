pub mod context;
pub mod extractor;
pub mod ledger;
pub mod llm;
pub mod outline;
pub mod store;
pub mod summarizer;
pub mod workflow;
