//! Per-batch scoring context
//!
//! Turns raw completions into rankable metrics and records each provider
//! instance's lifecycle into the recency store. Store failures never
//! propagate into the scoring path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::fuzzy::metrics;
use crate::parse::{coalesce, cword_before, display_width, lower};
use crate::store::{RecencyStore, StoreError};
use crate::types::{Completion, Context, MatchOptions, Metric, SourceDescriptor, Weights};

/// Bound any real weight adjust into (0.5, 1.5), so a single misbehaving
/// source cannot dominate ranking regardless of match quality.
pub fn sigmoid(x: f64) -> f64 {
    x / (1.0 + x.abs()) / 2.0 + 1.0
}

/// Ranking context for one batch, handed to every participating worker.
pub struct ReviewToken {
    batch: Uuid,
    cword: String,
    tabstop: usize,
    is_lower: bool,
    proximity: HashMap<String, usize>,
    inserted: HashMap<String, u32>,
    biases: Mutex<HashMap<Uuid, f64>>,
}

impl ReviewToken {
    pub fn batch(&self) -> Uuid {
        self.batch
    }
}

pub struct Reviewer {
    options: MatchOptions,
    recency_window: usize,
    store: Arc<RecencyStore>,
}

impl Reviewer {
    pub fn new(options: MatchOptions, recency_window: usize, store: Arc<RecencyStore>) -> Self {
        Self {
            options,
            recency_window,
            store,
        }
    }

    pub async fn register(&self, descriptor: &SourceDescriptor) {
        if let Err(err) = self.store.new_source(&descriptor.name).await {
            warn!(source = %descriptor.name, "source registration failed: {err}");
        }
    }

    /// Open a fresh batch: proximity table over the visible buffer, the
    /// recency-rank table from the store, and the current word.
    pub async fn begin(&self, context: &Context) -> Arc<ReviewToken> {
        let batch = Uuid::new_v4();
        // abort any read still serving the superseded request
        self.store.interrupt();
        let inserted = match self.store.insertion_order(self.recency_window).await {
            Ok(order) => order,
            Err(StoreError::Interrupted) => HashMap::new(),
            Err(err) => {
                warn!("insertion order unavailable: {err}");
                HashMap::new()
            }
        };

        let words = coalesce(
            context.lines.iter().map(String::as_str),
            &self.options.unifying_chars,
            context.is_lower,
        );
        let mut proximity: HashMap<String, usize> = HashMap::new();
        for word in words {
            *proximity.entry(word).or_insert(0) += 1;
        }
        let cword = cword_before(
            &self.options.unifying_chars,
            context.is_lower,
            &context.line_before,
        );

        if let Err(err) = self.store.new_batch(batch).await {
            warn!(%batch, "batch record failed: {err}");
        }

        Arc::new(ReviewToken {
            batch,
            cword,
            tabstop: context.tabstop,
            is_lower: context.is_lower,
            proximity,
            inserted,
            biases: Mutex::new(HashMap::new()),
        })
    }

    /// A provider instance started participating in this batch.
    pub async fn s_begin(&self, token: &ReviewToken, descriptor: &SourceDescriptor, instance: Uuid) {
        token
            .biases
            .lock()
            .expect("poisoned")
            .insert(instance, descriptor.weight_adjust);
        if let Err(err) = self
            .store
            .new_instance(instance, &descriptor.name, token.batch)
            .await
        {
            warn!(source = %descriptor.name, "instance record failed: {err}");
        }
    }

    /// Score one completion against the batch's ranking context.
    pub fn trans(&self, token: &ReviewToken, instance: Uuid, completion: Completion) -> Metric {
        let sort_by = if token.is_lower {
            lower(&completion.sort_by)
        } else {
            completion.sort_by.clone()
        };
        let match_metrics = metrics(&token.cword, &sort_by, self.options.look_ahead);
        let weight = Weights {
            prefix_matches: match_metrics.prefix_matches,
            edit_distance: match_metrics.edit_distance,
            recency: token
                .inserted
                .get(&completion.sort_by)
                .copied()
                .unwrap_or(0),
            proximity: token.proximity.get(&sort_by).copied().unwrap_or(0),
        };
        let bias = token
            .biases
            .lock()
            .expect("poisoned")
            .get(&instance)
            .copied()
            .unwrap_or(0.0);
        let label_width = display_width(&completion.label, token.tabstop);
        let kind_width = display_width(&completion.kind, token.tabstop);
        Metric {
            instance,
            weight_adjust: sigmoid(completion.weight_adjust + bias),
            weight,
            label_width,
            kind_width,
            comp: completion,
        }
    }

    /// Terminal stat for one instance. Called exactly once per started
    /// instance, cancellation included.
    pub async fn s_end(&self, instance: Uuid, interrupted: bool, elapsed: Duration, items: usize) {
        if let Err(err) = self
            .store
            .new_stat(instance, interrupted, elapsed, items)
            .await
        {
            warn!(%instance, "stat write failed: {err}");
        }
    }
}
