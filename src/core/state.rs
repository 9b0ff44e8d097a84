use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the caller asks for when a book is first created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub premise: String,
    pub target_length: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutlineEntry {
    pub index: u32,
    pub label: String,
    pub brief: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BookStructure {
    pub title: String,
    #[serde(default)]
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub premise: String,
    pub outline: Vec<OutlineEntry>,
}

impl BookStructure {
    pub fn target_length(&self) -> u32 {
        self.outline.len() as u32
    }

    pub fn entry(&self, index: u32) -> Option<&OutlineEntry> {
        index
            .checked_sub(1)
            .and_then(|i| self.outline.get(i as usize))
            .filter(|e| e.index == index)
    }

    /// Outline indices must be exactly `1..=n` in order.
    pub fn validate(&self) -> Result<(), String> {
        if self.outline.is_empty() {
            return Err("outline is empty".to_string());
        }
        for (position, entry) in self.outline.iter().enumerate() {
            let expected = position as u32 + 1;
            if entry.index != expected {
                return Err(format!(
                    "outline entry at position {} has index {}, expected {}",
                    position, entry.index, expected
                ));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeneratedPage {
    pub index: u32,
    pub label: String,
    pub text: String,
    #[serde(default)]
    pub is_lead_page: bool,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct CharacterRecord {
    pub traits: BTreeSet<String>,
    #[serde(default)]
    pub role: String,
    pub first_seen: u32,
    pub last_seen: u32,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct LocationRecord {
    #[serde(default)]
    pub description: String,
    pub first_seen: u32,
}

#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
}

impl From<String> for Importance {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" => Importance::Low,
            "high" | "major" | "critical" => Importance::High,
            _ => Importance::Medium,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Importance::Low => "low",
            Importance::Medium => "medium",
            Importance::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlotPoint {
    pub page_index: u32,
    pub event: String,
    #[serde(default)]
    pub importance: Importance,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Subplot {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EstablishedFact {
    pub fact: String,
    pub first_stated: u32,
}

/// Everything the tracker knows about the book so far. One per book.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CoherenceState {
    pub rolling_summary: String,
    /// Pages `1..=last_summary_index` are covered by `rolling_summary`.
    pub last_summary_index: u32,
    /// Highest page whose extraction has been merged into the ledger.
    pub last_enriched_index: u32,
    pub characters: BTreeMap<String, CharacterRecord>,
    pub locations: BTreeMap<String, LocationRecord>,
    pub plot_points: Vec<PlotPoint>,
    pub active_subplots: Vec<Subplot>,
    /// Keyed by fact text, kept in the order facts were first stated.
    pub established_facts: Vec<EstablishedFact>,
    pub used_figurative_language: Vec<String>,
    pub key_concepts: BTreeSet<String>,
}

impl CoherenceState {
    pub fn fact_first_stated(&self, fact: &str) -> Option<u32> {
        self.established_facts
            .iter()
            .find(|f| f.fact == fact)
            .map(|f| f.first_stated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure(indices: &[u32]) -> BookStructure {
        BookStructure {
            title: "T".to_string(),
            themes: BTreeSet::new(),
            tone: String::new(),
            premise: String::new(),
            outline: indices
                .iter()
                .map(|&i| OutlineEntry {
                    index: i,
                    label: format!("Page {}", i),
                    brief: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_outline_validation() {
        assert!(structure(&[1, 2, 3]).validate().is_ok());
        assert!(structure(&[]).validate().is_err());
        assert!(structure(&[1, 3]).validate().is_err());
        assert!(structure(&[0, 1]).validate().is_err());
        assert!(structure(&[2, 1]).validate().is_err());
    }

    #[test]
    fn test_outline_entry_lookup() {
        let s = structure(&[1, 2, 3]);
        assert_eq!(s.target_length(), 3);
        assert_eq!(s.entry(2).map(|e| e.label.as_str()), Some("Page 2"));
        assert!(s.entry(0).is_none());
        assert!(s.entry(4).is_none());
    }

    #[test]
    fn test_importance_is_lenient() {
        let p: PlotPoint =
            serde_json::from_str(r#"{"page_index": 1, "event": "x", "importance": "Critical"}"#)
                .unwrap();
        assert_eq!(p.importance, Importance::High);
        let p: PlotPoint =
            serde_json::from_str(r#"{"page_index": 1, "event": "x", "importance": "whatever"}"#)
                .unwrap();
        assert_eq!(p.importance, Importance::Medium);
    }

    #[test]
    fn test_empty_state_deserializes_from_empty_object() {
        let state: CoherenceState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, CoherenceState::default());
    }
}
