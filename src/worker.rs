//! Worker: one cancellable production of completions per provider
//!
//! Each worker owns at most one in-flight production and cancels its own
//! previous one before starting anew, independently of the supervisor's
//! global cancellation, so a slow provider from request N never emits
//! into a later request's result set.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::reviewer::{ReviewToken, Reviewer};
use crate::types::{Completion, Context, Metric, SourceDescriptor};

/// A pluggable completion provider.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Lazily produce candidates for one request. Long I/O must suspend,
    /// never block the scheduler.
    async fn work(&self, context: &Context) -> Result<BoxStream<'static, Result<Completion>>>;
}

/// Awaitable-from-many-places handle to one production.
pub type Production = Shared<BoxFuture<'static, ()>>;

pub struct Worker {
    source: Arc<dyn CompletionSource>,
    reviewer: Arc<Reviewer>,
    current: Mutex<Option<(CancellationToken, Production)>>,
}

impl Worker {
    pub fn new(source: Arc<dyn CompletionSource>, reviewer: Arc<Reviewer>) -> Self {
        Self {
            source,
            reviewer,
            current: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        self.source.descriptor().clone()
    }

    /// Cancel the previous production, then run a new supervised one that
    /// scores each item into `acc` and always ends with exactly one stat
    /// write, cancellation and provider failure included.
    pub fn supervised(
        &self,
        context: Context,
        token: Arc<ReviewToken>,
        now: Instant,
        acc: Arc<Mutex<Vec<Metric>>>,
        parent: &CancellationToken,
    ) -> Production {
        let prev = self.current.lock().expect("poisoned").take();
        let cancel = parent.child_token();
        let child = cancel.clone();
        let source = Arc::clone(&self.source);
        let reviewer = Arc::clone(&self.reviewer);

        let handle = tokio::spawn(async move {
            if let Some((prev_cancel, prev_production)) = prev {
                prev_cancel.cancel();
                prev_production.await;
            }
            run_one(source, reviewer, context, token, child, now, acc).await;
        });
        let production: Production = handle.map(|_| ()).boxed().shared();
        *self.current.lock().expect("poisoned") = Some((cancel, production.clone()));
        production
    }
}

async fn run_one(
    source: Arc<dyn CompletionSource>,
    reviewer: Arc<Reviewer>,
    context: Context,
    token: Arc<ReviewToken>,
    cancel: CancellationToken,
    now: Instant,
    acc: Arc<Mutex<Vec<Metric>>>,
) {
    let descriptor = source.descriptor().clone();
    let instance = Uuid::new_v4();
    reviewer.s_begin(&token, &descriptor, instance).await;

    let mut items = 0usize;
    let mut interrupted = false;

    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            interrupted = true;
            None
        }
        produced = source.work(&context) => match produced {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(source = %descriptor.name, "source failed to start: {err:#}");
                interrupted = true;
                None
            }
        }
    };

    if let Some(mut stream) = stream {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                item = stream.next() => match item {
                    None => break,
                    Some(Ok(completion)) => {
                        items += 1;
                        let metric = reviewer.trans(&token, instance, completion);
                        acc.lock().expect("poisoned").push(metric);
                    }
                    Some(Err(err)) => {
                        warn!(source = %descriptor.name, "source failed mid-stream: {err:#}");
                        interrupted = true;
                        break;
                    }
                }
            }
        }
    }

    // the final stat write happens on every exit path
    reviewer.s_end(instance, interrupted, now.elapsed(), items).await;
}
