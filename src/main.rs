use anyhow::{Context, Result};
use bookweaver::core::config::Config;
use bookweaver::core::io::NativeStorage;
use bookweaver::services::llm::create_llm;
use bookweaver::services::store::StorageBookStore;
use bookweaver::services::workflow::BookWorkflow;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    // 2. Resolve the book: an id on the command line resumes it, otherwise the
    // `book` section of the config seeds (or resumes) one.
    let book_id = std::env::args()
        .nth(1)
        .or_else(|| config.book.as_ref().map(|b| b.id.clone()))
        .context("No book to write: pass a book id or add a `book` section to config.yml")?;
    let request = config.book.as_ref().filter(|b| b.id == book_id);

    // 3. Initialize LLM and storage
    let llm = create_llm(&config)?;
    let store = Arc::new(StorageBookStore::new(
        Arc::new(NativeStorage::new()),
        config.build_folder.clone(),
    ));

    // 4. Open and run
    let mut workflow = BookWorkflow::open(&book_id, config.generation.clone(), llm, store, request)
        .await?
        .with_unattended(config.unattended);
    workflow.run().await?;

    Ok(())
}
