//! Context assembly for the next page.
//!
//! The payload balances recency (verbatim recent pages) against long-range
//! consistency (rolling summary plus ledger excerpts). Sections always appear
//! in the order of [`SectionKind`] and are left out entirely when empty.

use crate::core::config::GenerationConfig;
use crate::core::state::{CoherenceState, GeneratedPage};
use crate::utils::text::truncate_chars;

pub const FIRST_PAGE_SENTINEL: &str =
    "This is the first page of the book. Nothing has been written before it.";

/// Upper bound on a page label inside the recent-pages section.
const LABEL_CHAR_CAP: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    FirstPage,
    Summary,
    RecentPages,
    Characters,
    Locations,
    PlotPoints,
    Subplots,
    Facts,
    FigurativeLanguage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSection {
    pub kind: SectionKind,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextPayload {
    pub sections: Vec<ContextSection>,
}

impl ContextPayload {
    pub fn section(&self, kind: SectionKind) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.body.as_str())
    }

    pub fn is_first_page(&self) -> bool {
        self.section(SectionKind::FirstPage).is_some()
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.body.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextLimits {
    pub recent_window_size: usize,
    pub page_char_cap: usize,
    pub plot_point_limit: usize,
    pub subplot_limit: usize,
    pub fact_limit: usize,
    pub figurative_limit: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for ContextLimits {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            recent_window_size: config.recent_window_size,
            page_char_cap: config.page_char_cap,
            plot_point_limit: config.plot_point_limit,
            subplot_limit: config.subplot_limit,
            fact_limit: config.fact_limit,
            figurative_limit: config.figurative_limit,
        }
    }
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

/// Builds the context for writing page `target_page_index`.
///
/// Only pages before `target_page_index` are considered. When there are none the
/// payload holds just the first-page sentinel.
pub fn assemble(
    pages_so_far: &[GeneratedPage],
    state: &CoherenceState,
    target_page_index: u32,
    limits: &ContextLimits,
) -> ContextPayload {
    let prior: Vec<&GeneratedPage> = pages_so_far
        .iter()
        .filter(|p| p.index < target_page_index)
        .collect();

    if prior.is_empty() {
        return ContextPayload {
            sections: vec![ContextSection {
                kind: SectionKind::FirstPage,
                body: FIRST_PAGE_SENTINEL.to_string(),
            }],
        };
    }

    let mut sections = Vec::new();
    let mut push = |kind: SectionKind, body: String| sections.push(ContextSection { kind, body });

    if !state.rolling_summary.trim().is_empty() {
        push(
            SectionKind::Summary,
            format!(
                "STORY SO FAR (pages 1-{}):\n{}",
                state.last_summary_index,
                state.rolling_summary.trim()
            ),
        );
    }

    if let Some(body) = recent_pages_section(tail(&prior, limits.recent_window_size), limits.page_char_cap) {
        push(SectionKind::RecentPages, body);
    }

    if !state.characters.is_empty() {
        let lines = state
            .characters
            .iter()
            .map(|(name, c)| {
                let traits = c.traits.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
                let role = if c.role.is_empty() { "unspecified role" } else { c.role.as_str() };
                if traits.is_empty() {
                    format!("- {} ({})", name, role)
                } else {
                    format!("- {} ({}): {}", name, role, traits)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        push(SectionKind::Characters, format!("CHARACTERS:\n{}", lines));
    }

    if !state.locations.is_empty() {
        let lines = state
            .locations
            .iter()
            .map(|(name, l)| {
                if l.description.is_empty() {
                    format!("- {}", name)
                } else {
                    format!("- {}: {}", name, l.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        push(SectionKind::Locations, format!("LOCATIONS:\n{}", lines));
    }

    let plot_points = tail(&state.plot_points, limits.plot_point_limit);
    if !plot_points.is_empty() {
        let lines = plot_points
            .iter()
            .map(|p| format!("- (page {}, {}) {}", p.page_index, p.importance, p.event))
            .collect::<Vec<_>>()
            .join("\n");
        push(SectionKind::PlotPoints, format!("RECENT PLOT POINTS:\n{}", lines));
    }

    let subplots = tail(&state.active_subplots, limits.subplot_limit);
    if !subplots.is_empty() {
        let lines = subplots
            .iter()
            .map(|s| {
                if s.status.is_empty() {
                    format!("- {}", s.name)
                } else {
                    format!("- {} [{}]", s.name, s.status)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        push(SectionKind::Subplots, format!("ACTIVE SUBPLOTS:\n{}", lines));
    }

    let facts = tail(&state.established_facts, limits.fact_limit);
    if !facts.is_empty() {
        let lines = facts
            .iter()
            .map(|f| format!("- {}", f.fact))
            .collect::<Vec<_>>()
            .join("\n");
        push(
            SectionKind::Facts,
            format!("ESTABLISHED FACTS (you must not contradict these):\n{}", lines),
        );
    }

    let figurative = tail(&state.used_figurative_language, limits.figurative_limit);
    if !figurative.is_empty() {
        let lines = figurative
            .iter()
            .map(|f| format!("- \"{}\"", f))
            .collect::<Vec<_>>()
            .join("\n");
        push(
            SectionKind::FigurativeLanguage,
            format!("FIGURATIVE LANGUAGE ALREADY USED (avoid repeating):\n{}", lines),
        );
    }

    ContextPayload { sections }
}

fn recent_pages_section(pages: &[&GeneratedPage], char_cap: usize) -> Option<String> {
    if pages.is_empty() {
        return None;
    }
    let blocks = pages
        .iter()
        .map(|p| {
            format!(
                "--- Page {}: {} ---\n{}",
                p.index,
                truncate_chars(&p.label, LABEL_CHAR_CAP),
                truncate_chars(&p.text, char_cap)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(format!("RECENT PAGES:\n{}", blocks))
}
