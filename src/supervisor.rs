//! Collection cycles
//!
//! The supervisor owns the registered workers and guarantees at most one
//! active collection cycle: each `collect` cancels the previous cycle and
//! awaits its teardown before starting its own timeout window.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::CacheWorker;
use crate::reviewer::Reviewer;
use crate::types::{Completion, Context, EngineOptions, Metric, SourceDescriptor};
use crate::worker::{CompletionSource, Production, Worker};

pub type SharedSupervisor = Arc<Supervisor>;

pub struct Supervisor {
    options: EngineOptions,
    reviewer: Arc<Reviewer>,
    cache: Arc<CacheWorker>,
    workers: std::sync::Mutex<Vec<Arc<Worker>>>,
    idling: Notify,
    cycle_lock: Mutex<()>,
    current: Mutex<Option<(CancellationToken, Production)>>,
}

impl Supervisor {
    pub fn new(
        options: EngineOptions,
        reviewer: Arc<Reviewer>,
        cache: Arc<CacheWorker>,
    ) -> SharedSupervisor {
        Arc::new(Self {
            options,
            reviewer,
            cache,
            workers: std::sync::Mutex::new(Vec::new()),
            idling: Notify::new(),
            cycle_lock: Mutex::new(()),
            current: Mutex::new(None),
        })
    }

    /// Add a worker for `source`. Called once per source at startup.
    pub async fn register(&self, source: Arc<dyn CompletionSource>) {
        self.reviewer.register(source.descriptor()).await;
        let worker = Arc::new(Worker::new(source, Arc::clone(&self.reviewer)));
        self.workers.lock().expect("poisoned").push(worker);
    }

    /// Signal that no collection is pending; wakes `idle` waiters.
    pub fn notify_idle(&self) {
        self.idling.notify_waiters();
    }

    pub async fn idle(&self) {
        self.idling.notified().await;
    }

    /// Cancel the in-flight cycle, if any, and await its teardown.
    pub async fn interrupt(&self) {
        let prev = self.current.lock().await.take();
        if let Some((cancel, production)) = prev {
            cancel.cancel();
            production.await;
        }
    }

    /// Sole entry point for a ranking request. Returns the metrics that
    /// were available in time; the caller applies [`crate::rank::rank`].
    pub async fn collect(self: &Arc<Self>, context: Context) -> Vec<Metric> {
        let now = Instant::now();
        self.interrupt().await;

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let supervisor = Arc::clone(self);
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            let metrics = supervisor.cycle(context, child, now).await;
            let _ = tx.send(metrics);
        });
        *self.current.lock().await = Some((cancel, handle.map(|_| ()).boxed().shared()));

        rx.await.unwrap_or_default()
    }

    async fn cycle(
        self: Arc<Self>,
        context: Context,
        cancel: CancellationToken,
        now: Instant,
    ) -> Vec<Metric> {
        // at most one active collection system-wide
        let _guard = self.cycle_lock.lock().await;
        let timeout = if context.manual {
            self.options.limits.manual_timeout
        } else {
            self.options.limits.auto_timeout
        };

        let (reusable, prior_sources, pending) = self.cache.apply_cache(&context);
        let token = self.reviewer.begin(&context).await;
        let (cached, cached_len) = pending.await;

        if reusable {
            debug!(
                count = cached_len,
                sources = ?prior_sources,
                "replaying cached batch"
            );
            // the replayed batch runs under a real registered instance, so
            // accepting one of its suggestions still lands in the insertion
            // log and keeps feeding recency
            let descriptor = SourceDescriptor::new("cache");
            self.reviewer.register(&descriptor).await;
            let instance = Uuid::new_v4();
            self.reviewer.s_begin(&token, &descriptor, instance).await;
            let metrics: Vec<Metric> = cached
                .into_iter()
                .map(|comp| self.reviewer.trans(&token, instance, comp))
                .collect();
            self.reviewer
                .s_end(instance, false, now.elapsed(), metrics.len())
                .await;
            return metrics;
        }

        let workers: Vec<Arc<Worker>> = self.workers.lock().expect("poisoned").clone();
        info!(
            workers = workers.len(),
            manual = context.manual,
            batch = %token.batch(),
            "collecting"
        );

        let acc = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut productions: FuturesUnordered<Production> = workers
            .iter()
            .map(|worker| {
                worker.supervised(
                    context.clone(),
                    Arc::clone(&token),
                    now,
                    Arc::clone(&acc),
                    &cancel,
                )
            })
            .collect();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = cancel.cancelled() => break,
                next = productions.next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }

        // scheduling jitter can leave nothing collected at the deadline;
        // keep waiting, one production at a time, for the first result
        if acc.lock().expect("poisoned").is_empty() && !cancel.is_cancelled() {
            while productions.next().await.is_some() {
                if !acc.lock().expect("poisoned").is_empty() {
                    break;
                }
            }
        }

        let superseded = cancel.is_cancelled();
        // cancel stragglers and await teardown: their final stat writes
        // complete before the next cycle begins
        cancel.cancel();
        while productions.next().await.is_some() {}

        let metrics: Vec<Metric> = acc.lock().expect("poisoned").clone();
        // a superseded cycle must not publish its partial batch as the
        // cached batch for the request that replaced it
        if !superseded {
            let comps: Vec<Completion> = metrics.iter().map(|m| m.comp.clone()).collect();
            self.cache.set_cache(&comps).await;
        }
        info!(
            items = metrics.len(),
            elapsed_ms = now.elapsed().as_millis() as u64,
            "collection done"
        );
        metrics
    }
}
