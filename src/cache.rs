//! Single-slot cache over the most recent completion batch
//!
//! Only the immediately previous request is ever worth reusing in an
//! interactive typing session, so the fingerprint and batch are one slot
//! replaced wholesale on every request, not a general cache map.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::fuzzy::multi_set_ratio;
use crate::parse::coalesce;
use crate::store::{RecencyStore, StoreError};
use crate::types::{CompleteOptions, Completion, Context, MatchOptions, RangeEdit};

/// Fingerprint of the request the cached batch was computed for.
#[derive(Debug, Clone)]
struct CacheContext {
    change_id: Uuid,
    commit_id: Uuid,
    buf_id: u64,
    row: u32,
    text_before: String,
}

impl CacheContext {
    fn of(context: &Context) -> Self {
        Self {
            change_id: context.change_id,
            commit_id: context.commit_id,
            buf_id: context.buf_id,
            row: context.row,
            text_before: context.line_before.clone(),
        }
    }
}

fn use_cache(options: &MatchOptions, cache: &CacheContext, context: &Context) -> bool {
    !context.manual
        && cache.commit_id == context.commit_id
        && cache.buf_id == context.buf_id
        && cache.row == context.row
        && multi_set_ratio(&context.line_before, &cache.text_before, options.look_ahead)
            >= options.fuzzy_cutoff
}

/// Replay copy of a cached completion: primary edit only, collapsed to
/// insert-at-cursor, sort key overridden by the freshly ordered word.
pub fn sanitize_cached(comp: &Completion, sort_by: Option<&str>) -> Completion {
    Completion {
        primary_edit: RangeEdit {
            new_text: comp.primary_edit.new_text.clone(),
            begin: 0,
            end: 0,
        },
        secondary_edits: Vec::new(),
        sort_by: sort_by
            .map(str::to_owned)
            .unwrap_or_else(|| comp.sort_by.clone()),
        ..comp.clone()
    }
}

#[derive(Default)]
struct CacheState {
    fingerprint: Option<CacheContext>,
    cached: HashMap<Uuid, Completion>,
    clients: BTreeSet<String>,
}

pub struct CacheWorker {
    store: Arc<RecencyStore>,
    match_opts: MatchOptions,
    options: CompleteOptions,
    state: Mutex<CacheState>,
}

impl CacheWorker {
    pub fn new(store: Arc<RecencyStore>, match_opts: MatchOptions, options: CompleteOptions) -> Self {
        Self {
            store,
            match_opts,
            options,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Decide reuse for this request and replace the fingerprint.
    ///
    /// Returns the decision, the set of sources that contributed to the
    /// cached batch, and a pending lookup that yields the replayable
    /// completions with their count (empty on refusal, after clearing the
    /// stored rows).
    pub fn apply_cache(
        &self,
        context: &Context,
    ) -> (
        bool,
        BTreeSet<String>,
        impl Future<Output = (Vec<Completion>, usize)> + Send + 'static,
    ) {
        let (reusable, clients, snapshot) = {
            let mut state = self.state.lock().expect("poisoned");
            let prev = state.fingerprint.replace(CacheContext::of(context));
            let reusable = prev
                .as_ref()
                .map(|cache| use_cache(&self.match_opts, cache, context))
                .unwrap_or(false)
                && !state.cached.is_empty();
            debug!(
                reusable,
                prev_change = ?prev.as_ref().map(|cache| cache.change_id),
                change = %context.change_id,
                "cache decision"
            );
            let clients = state.clients.clone();
            if !reusable {
                state.clients.clear();
                state.cached.clear();
            }
            let snapshot = if reusable {
                state.cached.clone()
            } else {
                HashMap::new()
            };
            (reusable, clients, snapshot)
        };

        let store = Arc::clone(&self.store);
        let limit = if context.manual {
            None
        } else {
            Some(self.options.max_results)
        };
        let pending = async move {
            if !reusable {
                if let Err(err) = store.cache_clear().await {
                    warn!("cache clear failed: {err}");
                }
                return (Vec::new(), 0);
            }
            let keys = match store.cache_select(limit).await {
                Ok(keys) => keys,
                Err(StoreError::Interrupted) => Vec::new(),
                Err(err) => {
                    warn!("cache lookup failed: {err}");
                    Vec::new()
                }
            };
            let count = keys.len();
            let comps = keys
                .iter()
                .filter_map(|(key, word)| {
                    snapshot
                        .get(key)
                        .map(|comp| sanitize_cached(comp, Some(word)))
                })
                .collect();
            (comps, count)
        };
        (reusable, clients, pending)
    }

    /// Store a fresh batch, keyed by completion id, and record the sort
    /// keys for ordered retrieval: one row per word token when smart
    /// splitting is on, else one row per whole sort key.
    pub async fn set_cache(&self, completions: &[Completion]) {
        let rows: Vec<(Uuid, String)> = completions
            .iter()
            .flat_map(|comp| {
                if self.options.smart {
                    coalesce(
                        [comp.sort_by.as_str()],
                        &self.match_opts.unifying_chars,
                        false,
                    )
                    .into_iter()
                    .map(|word| (comp.uid, word))
                    .collect::<Vec<_>>()
                } else {
                    vec![(comp.uid, comp.sort_by.clone())]
                }
            })
            .collect();
        if let Err(err) = self.store.cache_replace(&rows).await {
            warn!("cache population failed: {err}");
        }

        let mut state = self.state.lock().expect("poisoned");
        for comp in completions {
            state.clients.insert(comp.source.clone());
            state.cached.insert(comp.uid, comp.clone());
        }
    }
}
