//! Entity ledger: the extraction schema and the rules for folding one
//! page's extraction into the book's `CoherenceState`.
//!
//! Merging is total. Blank names and empty fields are skipped, never rejected.
//! Characters, locations, facts and key concepts are idempotent under a repeated
//! merge; plot points, subplots and figurative language are append-only.

use crate::core::state::{
    CharacterRecord, CoherenceState, EstablishedFact, Importance, LocationRecord, PlotPoint,
    Subplot,
};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExtractionResult {
    #[serde(deserialize_with = "null_as_default")]
    pub characters: Vec<ExtractedCharacter>,
    #[serde(deserialize_with = "null_as_default")]
    pub locations: Vec<ExtractedLocation>,
    #[serde(deserialize_with = "null_as_default")]
    pub plot_points: Vec<ExtractedPlotPoint>,
    #[serde(deserialize_with = "null_as_default")]
    pub subplots: Vec<ExtractedSubplot>,
    #[serde(deserialize_with = "strings_skipping_nulls")]
    pub facts: Vec<String>,
    #[serde(deserialize_with = "strings_skipping_nulls")]
    pub figurative_language: Vec<String>,
    #[serde(deserialize_with = "strings_skipping_nulls")]
    pub key_concepts: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExtractedCharacter {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "strings_skipping_nulls")]
    pub traits: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExtractedLocation {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExtractedPlotPoint {
    #[serde(deserialize_with = "null_as_default")]
    pub event: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub importance: Importance,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExtractedSubplot {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
}

/// Models emit `null` for fields they have nothing to say about; read it as absent.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn strings_skipping_nulls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = Option::<Vec<Option<String>>>::deserialize(deserializer)?;
    Ok(items.into_iter().flatten().flatten().collect())
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
            && self.locations.is_empty()
            && self.plot_points.is_empty()
            && self.subplots.is_empty()
            && self.facts.is_empty()
            && self.figurative_language.is_empty()
            && self.key_concepts.is_empty()
    }
}

/// Returns `state` with `extracted` folded in as seen on page `page_index`.
pub fn merge(state: &CoherenceState, extracted: &ExtractionResult, page_index: u32) -> CoherenceState {
    let mut next = state.clone();
    apply(&mut next, extracted, page_index);
    next
}

/// In-place form of [`merge`].
pub fn apply(state: &mut CoherenceState, extracted: &ExtractionResult, page_index: u32) {
    merge_characters(state, &extracted.characters, page_index);
    merge_locations(state, &extracted.locations, page_index);

    for point in &extracted.plot_points {
        let event = point.event.trim();
        if !event.is_empty() {
            state.plot_points.push(PlotPoint {
                page_index,
                event: event.to_string(),
                importance: point.importance,
            });
        }
    }

    for subplot in &extracted.subplots {
        let name = subplot.name.trim();
        if !name.is_empty() {
            state.active_subplots.push(Subplot {
                name: name.to_string(),
                status: subplot.status.trim().to_string(),
            });
        }
    }

    for fact in &extracted.facts {
        let fact = fact.trim();
        if !fact.is_empty() && state.fact_first_stated(fact).is_none() {
            state.established_facts.push(EstablishedFact {
                fact: fact.to_string(),
                first_stated: page_index,
            });
        }
    }

    state.used_figurative_language.extend(
        extracted
            .figurative_language
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_string),
    );

    state.key_concepts.extend(
        extracted
            .key_concepts
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string),
    );
}

fn merge_characters(state: &mut CoherenceState, characters: &[ExtractedCharacter], page_index: u32) {
    for character in characters {
        let name = character.name.trim();
        if name.is_empty() {
            continue;
        }
        let traits = character
            .traits
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let role = character
            .role
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());

        let record = state
            .characters
            .entry(name.to_string())
            .or_insert_with(|| CharacterRecord {
                first_seen: page_index,
                last_seen: page_index,
                ..Default::default()
            });
        record.traits.extend(traits);
        if let Some(role) = role {
            record.role = role.to_string();
        }
        record.first_seen = record.first_seen.min(page_index);
        record.last_seen = record.last_seen.max(page_index);
    }
}

fn merge_locations(state: &mut CoherenceState, locations: &[ExtractedLocation], page_index: u32) {
    for location in locations {
        let name = location.name.trim();
        if name.is_empty() {
            continue;
        }
        let description = location
            .description
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();

        let record = state
            .locations
            .entry(name.to_string())
            .or_insert_with(|| LocationRecord {
                description: String::new(),
                first_seen: page_index,
            });
        // The first description sticks; a later one only fills a blank.
        if record.description.is_empty() {
            record.description = description.to_string();
        }
    }
}
