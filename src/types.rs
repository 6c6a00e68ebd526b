//! Core type definitions for completion aggregation

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Immutable snapshot of the editing state at request time.
///
/// Created fresh per request by the (out of scope) editor transport and
/// owned by the request pipeline for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub change_id: Uuid,
    pub commit_id: Uuid,
    pub buf_id: u64,
    pub row: u32,
    pub col: u32,
    /// Current line text.
    pub line: String,
    /// Text on the current line strictly before the cursor.
    pub line_before: String,
    /// Visible buffer lines, the basis of the proximity table.
    pub lines: Vec<String>,
    /// User-initiated request (as opposed to keystroke-triggered).
    pub manual: bool,
    pub tabstop: usize,
    /// Case-insensitive session.
    pub is_lower: bool,
}

/// Replacement text over a byte span of the current line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEdit {
    pub new_text: String,
    pub begin: usize,
    pub end: usize,
}

/// One candidate suggestion, immutable once produced by a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub uid: Uuid,
    /// Name of the producing source.
    pub source: String,
    pub label: String,
    pub kind: String,
    pub sort_by: String,
    /// Raw per-item weight adjust; bounded by the reviewer's transform.
    pub weight_adjust: f64,
    pub primary_edit: RangeEdit,
    pub secondary_edits: Vec<RangeEdit>,
    pub doc: Option<String>,
}

/// Ranking inputs for one completion in one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Weights {
    /// Length of the longest common leading run with the current word.
    pub prefix_matches: usize,
    /// Bounded edit distance against the current word.
    pub edit_distance: usize,
    /// Recency rank of the sort key, 1 = most recent, 0 = never inserted.
    pub recency: u32,
    /// Occurrences of the sort key in the visible buffer.
    pub proximity: usize,
}

/// A scored, rankable wrapper around a Completion.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub instance: Uuid,
    pub comp: Completion,
    /// Resolved weight adjust in (0.5, 1.5).
    pub weight_adjust: f64,
    pub weight: Weights,
    pub label_width: usize,
    pub kind_width: usize,
}

/// Static registration record for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Source-wide bias added to each item's raw weight adjust.
    pub weight_adjust: f64,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight_adjust: 0.0,
        }
    }
}

/// Approximate-matching knobs shared by scoring and cache validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    pub unifying_chars: BTreeSet<char>,
    /// Bounded scan width for fuzzy matching.
    pub look_ahead: usize,
    /// Similarity threshold for cache reuse.
    pub fuzzy_cutoff: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            unifying_chars: ['_', '-'].into_iter().collect(),
            look_ahead: 2,
            fuzzy_cutoff: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompleteOptions {
    /// Split cached sort keys into word tokens when populating the store.
    pub smart: bool,
    /// Cap on cached results per automatic request; manual requests are
    /// unlimited.
    pub max_results: usize,
    /// Retention window for recency ranking.
    pub recency_window: usize,
}

impl Default for CompleteOptions {
    fn default() -> Self {
        Self {
            smart: true,
            max_results: 33,
            recency_window: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub manual_timeout: Duration,
    pub auto_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            manual_timeout: Duration::from_secs(1),
            auto_timeout: Duration::from_millis(100),
        }
    }
}

/// Bundled configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub match_opts: MatchOptions,
    pub complete: CompleteOptions,
    pub limits: Limits,
}
