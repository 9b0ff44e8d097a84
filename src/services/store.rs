use crate::core::io::Storage;
use crate::core::state::{BookStructure, CoherenceState, GeneratedPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Record-level persistence for one or more books. Every call is atomic for
/// the single record it touches.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn save_structure(&self, book_id: &str, structure: &BookStructure) -> Result<()>;
    async fn load_structure(&self, book_id: &str) -> Result<Option<BookStructure>>;
    async fn save_page(&self, book_id: &str, page: &GeneratedPage) -> Result<()>;
    /// Pages sorted by index.
    async fn load_pages(&self, book_id: &str) -> Result<Vec<GeneratedPage>>;
    async fn save_coherence_state(&self, book_id: &str, state: &CoherenceState) -> Result<()>;
    /// Empty state when nothing was saved yet.
    async fn load_coherence_state(&self, book_id: &str) -> Result<CoherenceState>;
}

/// Lays a book out as JSON files under `{root}/{book_id}/`.
pub struct StorageBookStore {
    storage: Arc<dyn Storage>,
    root: String,
}

impl StorageBookStore {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        Self {
            storage,
            root: root.into(),
        }
    }

    fn book_path(&self, book_id: &str, tail: &str) -> String {
        Path::new(&self.root)
            .join(book_id)
            .join(tail)
            .to_string_lossy()
            .to_string()
    }

    fn pages_dir(&self, book_id: &str) -> String {
        self.book_path(book_id, "pages")
    }

    fn page_path(&self, book_id: &str, index: u32) -> String {
        self.book_path(book_id, &format!("pages/{:05}.json", index))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(path).await?;
        let content = String::from_utf8(bytes)?;
        let value = serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        Ok(Some(value))
    }

    async fn write_json<T: serde::Serialize + Sync>(&self, path: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.storage
            .write(path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path))
    }
}

#[async_trait]
impl BookStore for StorageBookStore {
    async fn save_structure(&self, book_id: &str, structure: &BookStructure) -> Result<()> {
        self.write_json(&self.book_path(book_id, "structure.json"), structure)
            .await
    }

    async fn load_structure(&self, book_id: &str) -> Result<Option<BookStructure>> {
        self.read_json(&self.book_path(book_id, "structure.json"))
            .await
    }

    async fn save_page(&self, book_id: &str, page: &GeneratedPage) -> Result<()> {
        self.write_json(&self.page_path(book_id, page.index), page).await
    }

    async fn load_pages(&self, book_id: &str) -> Result<Vec<GeneratedPage>> {
        let mut pages = Vec::new();
        for path in self.storage.list(&self.pages_dir(book_id)).await? {
            if !path.ends_with(".json") {
                continue;
            }
            if let Some(page) = self.read_json::<GeneratedPage>(&path).await? {
                pages.push(page);
            }
        }
        pages.sort_by_key(|p| p.index);
        Ok(pages)
    }

    async fn save_coherence_state(&self, book_id: &str, state: &CoherenceState) -> Result<()> {
        self.write_json(&self.book_path(book_id, "coherence.json"), state)
            .await
    }

    async fn load_coherence_state(&self, book_id: &str) -> Result<CoherenceState> {
        Ok(self
            .read_json(&self.book_path(book_id, "coherence.json"))
            .await?
            .unwrap_or_default())
    }
}
