//! Unit and engine-level tests

use crate::*;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sqlx::Row;
use uuid::Uuid;

/// Helper to create a plain word completion
fn completion(source: &str, text: &str) -> Completion {
    Completion {
        uid: Uuid::new_v4(),
        source: source.to_string(),
        label: text.to_string(),
        kind: "word".to_string(),
        sort_by: text.to_string(),
        weight_adjust: 0.0,
        primary_edit: RangeEdit {
            new_text: text.to_string(),
            begin: 0,
            end: 0,
        },
        secondary_edits: Vec::new(),
        doc: None,
    }
}

fn context_with(commit: Uuid, line_before: &str, manual: bool) -> Context {
    Context {
        change_id: Uuid::new_v4(),
        commit_id: commit,
        buf_id: 1,
        row: 0,
        col: line_before.chars().count() as u32,
        line: line_before.to_string(),
        line_before: line_before.to_string(),
        lines: vec![line_before.to_string()],
        manual,
        tabstop: 4,
        is_lower: true,
    }
}

struct MockSource {
    descriptor: SourceDescriptor,
    words: Vec<&'static str>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl MockSource {
    fn new(name: &str, words: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            descriptor: SourceDescriptor::new(name),
            words: words.to_vec(),
            delay: None,
            fail_after: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn with_bias(name: &str, bias: f64, words: &[&'static str]) -> Arc<Self> {
        let mut source = Self::new(name, words);
        Arc::get_mut(&mut source)
            .expect("fresh Arc")
            .descriptor
            .weight_adjust = bias;
        source
    }

    fn with_delay(name: &str, delay: Duration, words: &[&'static str]) -> Arc<Self> {
        let mut source = Self::new(name, words);
        Arc::get_mut(&mut source).expect("fresh Arc").delay = Some(delay);
        source
    }

    fn with_failure(name: &str, fail_after: usize, words: &[&'static str]) -> Arc<Self> {
        let mut source = Self::new(name, words);
        Arc::get_mut(&mut source).expect("fresh Arc").fail_after = Some(fail_after);
        source
    }
}

#[async_trait]
impl CompletionSource for MockSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn work(&self, _context: &Context) -> Result<BoxStream<'static, Result<Completion>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = self.descriptor.name.clone();
        let delay = self.delay;
        let fail_after = self.fail_after;
        let words = self.words.clone();
        let stream = stream::iter(words.into_iter().enumerate())
            .then(move |(idx, word)| {
                let name = name.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if fail_after.map(|n| idx >= n).unwrap_or(false) {
                        anyhow::bail!("synthetic failure at item {idx}");
                    }
                    Ok(completion(&name, word))
                }
            })
            .boxed();
        Ok(stream)
    }
}

async fn engine(options: EngineOptions) -> (SharedSupervisor, Arc<RecencyStore>) {
    let store = Arc::new(RecencyStore::in_memory().await.expect("in-memory store"));
    let reviewer = Arc::new(Reviewer::new(
        options.match_opts.clone(),
        options.complete.recency_window,
        Arc::clone(&store),
    ));
    let cache = Arc::new(CacheWorker::new(
        Arc::clone(&store),
        options.match_opts.clone(),
        options.complete.clone(),
    ));
    let supervisor = Supervisor::new(options, reviewer, cache);
    (supervisor, store)
}

fn words(metrics: &[Metric]) -> Vec<String> {
    metrics.iter().map(|m| m.comp.sort_by.clone()).collect()
}

#[test]
fn sigmoid_bounds() {
    use crate::reviewer::sigmoid;

    assert_eq!(sigmoid(0.0), 1.0);
    assert!(sigmoid(1e9) < 1.5);
    assert!(sigmoid(-1e9) > 0.5);
    assert!(sigmoid(-1.0) < sigmoid(0.0));
    assert!(sigmoid(0.0) < sigmoid(1.0));
}

#[test]
fn fuzzy_window_bounds_the_scan() {
    use crate::fuzzy::{metrics, multi_set_ratio, prefix_matches};

    assert_eq!(prefix_matches("foo", "foobar"), 3);
    assert_eq!(prefix_matches("foo", "bar"), 0);

    // "foobar" is scanned as "foob" with look_ahead 2
    let m = metrics("fo", "foobar", 2);
    assert_eq!(m.prefix_matches, 2);
    assert_eq!(m.edit_distance, 2);
    let m = metrics("fo", "for", 2);
    assert_eq!(m.edit_distance, 1);

    assert_eq!(multi_set_ratio("a", "abcdef", 2), 0.0);
    assert_eq!(multi_set_ratio("", "", 2), 1.0);
    assert!((multi_set_ratio("foo", "fo", 2) - 0.8).abs() < 1e-9);
}

#[test]
fn parse_words_and_widths() {
    use crate::parse::{coalesce, cword_before, display_width};

    let unifying: BTreeSet<char> = ['_', '-'].into_iter().collect();
    assert_eq!(cword_before(&unifying, true, "let foo_Bar"), "foo_bar");
    assert_eq!(cword_before(&unifying, false, "x + "), "");
    assert_eq!(
        coalesce(["foo bar, foo"], &unifying, false),
        vec!["foo", "bar", "foo"]
    );

    assert_eq!(display_width("日本語", 4), 6);
    assert_eq!(display_width("\ta", 4), 5);
}

#[tokio::test]
async fn ranking_prefers_close_then_short_matches() {
    let (supervisor, _store) = engine(EngineOptions::default()).await;
    supervisor
        .register(MockSource::new("path", &["foo", "foobar"]))
        .await;
    supervisor
        .register(MockSource::with_bias("buffer", -0.5, &["for"]))
        .await;

    let mut metrics = supervisor
        .collect(context_with(Uuid::new_v4(), "fo", false))
        .await;
    rank(&mut metrics);

    assert_eq!(words(&metrics), vec!["foo", "for", "foobar"]);
}

#[tokio::test]
async fn insertion_order_keeps_only_the_window() {
    let store = RecencyStore::in_memory().await.expect("in-memory store");
    let batch = Uuid::new_v4();
    let instance = Uuid::new_v4();
    store.new_source("buffer").await.expect("source");
    store.new_batch(batch).await.expect("batch");
    store
        .new_instance(instance, "buffer", batch)
        .await
        .expect("instance");
    for i in 0..150 {
        store
            .inserted(instance, &format!("w{i}"))
            .await
            .expect("insertion");
    }

    let order = store.insertion_order(100).await.expect("order");
    assert_eq!(order.len(), 100);
    assert_eq!(order.get("w149"), Some(&1), "newest key ranks first");
    assert_eq!(order.get("w50"), Some(&100), "oldest key inside the window");
    assert_eq!(order.get("w49"), None, "keys beyond the window are dropped");
}

#[tokio::test]
async fn stats_aggregate_per_source() {
    let store = RecencyStore::in_memory().await.expect("in-memory store");
    let batch = Uuid::new_v4();
    let (i1, i2) = (Uuid::new_v4(), Uuid::new_v4());
    store.new_source("alpha").await.expect("source");
    store.new_batch(batch).await.expect("batch");
    store.new_instance(i1, "alpha", batch).await.expect("i1");
    store.new_instance(i2, "alpha", batch).await.expect("i2");
    store
        .new_stat(i1, false, Duration::from_millis(100), 5)
        .await
        .expect("stat");
    store
        .new_stat(i2, true, Duration::from_millis(300), 1)
        .await
        .expect("stat");
    store.inserted(i1, "word").await.expect("insertion");
    store.inserted(i1, "word").await.expect("insertion");

    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.len(), 1);
    let alpha = &stats[0];
    assert_eq!(alpha.source, "alpha");
    assert_eq!(alpha.interrupted, 1);
    assert_eq!(alpha.inserted, 2);
    assert!((alpha.avg_duration - 0.2).abs() < 1e-9);
    assert!((alpha.q0_duration - 0.1).abs() < 1e-9);
    assert!((alpha.q100_duration - 0.3).abs() < 1e-9);
    assert!((alpha.avg_items - 3.0).abs() < 1e-9);
    assert_eq!(alpha.q100_items, 5);
}

#[tokio::test]
async fn typing_through_a_word_replays_the_cache() {
    let (supervisor, _store) = engine(EngineOptions::default()).await;
    let source = MockSource::new("path", &["foo", "foobar"]);
    supervisor.register(source.clone()).await;

    let commit = Uuid::new_v4();
    let first = supervisor
        .collect(context_with(commit, "fo", false))
        .await;
    assert_eq!(first.len(), 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    // same commit, one more typed character: served from the cached batch
    let second = supervisor
        .collect(context_with(commit, "foo", false))
        .await;
    assert!(!second.is_empty());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1, "source not re-queried");

    let got: BTreeSet<String> = words(&second).into_iter().collect();
    assert!(got.contains("foo"));
}

#[tokio::test]
async fn accepting_a_replayed_suggestion_feeds_recency() {
    let (supervisor, store) = engine(EngineOptions::default()).await;
    supervisor
        .register(MockSource::new("path", &["foo", "foobar"]))
        .await;

    let commit = Uuid::new_v4();
    supervisor
        .collect(context_with(commit, "fo", false))
        .await;
    let replayed = supervisor
        .collect(context_with(commit, "foo", false))
        .await;
    assert!(!replayed.is_empty());

    // the replayed metric carries a registered instance, so the accept
    // path can attribute the insertion to it
    let accepted = &replayed[0];
    store
        .inserted(accepted.instance, &accepted.comp.sort_by)
        .await
        .expect("accept writes an insertion row");
    let order = store.insertion_order(100).await.expect("order");
    assert_eq!(order.get(accepted.comp.sort_by.as_str()), Some(&1));

    let cache_stats: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM instance_stat s \
         JOIN instance i ON i.id = s.instance_id WHERE i.source = 'cache'",
    )
    .fetch_one(store.pool())
    .await
    .expect("count")
    .get("n");
    assert_eq!(cache_stats, 1, "replay closed its own instance");
}

#[tokio::test]
async fn interrupt_aborts_reads_without_poisoning_the_store() {
    let store = Arc::new(RecencyStore::in_memory().await.expect("in-memory store"));

    // park the only connection so the read is stuck acquiring it
    let held = store.pool().acquire().await.expect("connection");
    let reader = Arc::clone(&store);
    let read = tokio::spawn(async move { reader.insertion_order(100).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.interrupt();

    let result = read.await.expect("read task");
    assert!(matches!(result, Err(StoreError::Interrupted)));

    // later writes and reads are unaffected
    drop(held);
    let batch = Uuid::new_v4();
    let instance = Uuid::new_v4();
    store.new_source("buffer").await.expect("source");
    store.new_batch(batch).await.expect("batch");
    store
        .new_instance(instance, "buffer", batch)
        .await
        .expect("instance");
    store.inserted(instance, "word").await.expect("insertion");
    let order = store
        .insertion_order(100)
        .await
        .expect("order after interrupt");
    assert_eq!(order.get("word"), Some(&1));
}

#[tokio::test]
async fn cache_worker_replays_sanitized_and_refuses_manual() {
    let store = Arc::new(RecencyStore::in_memory().await.expect("in-memory store"));
    let cache = CacheWorker::new(
        Arc::clone(&store),
        MatchOptions::default(),
        CompleteOptions::default(),
    );
    let commit = Uuid::new_v4();

    // no previous batch to reuse
    let (reusable, _, pending) = cache.apply_cache(&context_with(commit, "fo", false));
    assert!(!reusable);
    pending.await;

    cache
        .set_cache(&[completion("path", "foo bar"), completion("buffer", "baz")])
        .await;

    let (reusable, clients, pending) = cache.apply_cache(&context_with(commit, "foo", false));
    assert!(reusable);
    let expected: BTreeSet<String> = ["buffer", "path"].into_iter().map(String::from).collect();
    assert_eq!(clients, expected);
    let (comps, count) = pending.await;
    assert_eq!(count, 3, "smart splitting stores one row per word token");
    let sort_bys: BTreeSet<&str> = comps.iter().map(|c| c.sort_by.as_str()).collect();
    let expected: BTreeSet<&str> = ["bar", "baz", "foo"].into_iter().collect();
    assert_eq!(sort_bys, expected);
    for comp in &comps {
        assert_eq!(comp.primary_edit.begin, 0);
        assert_eq!(comp.primary_edit.end, 0);
        assert!(comp.secondary_edits.is_empty());
    }

    // manual requests always requery
    let (reusable, _, pending) = cache.apply_cache(&context_with(commit, "foo", true));
    assert!(!reusable);
    pending.await;

    // a dissimilar prefix invalidates even on the same row
    cache.set_cache(&[completion("path", "foo")]).await;
    let (reusable, _, pending) = cache.apply_cache(&context_with(commit, "zzzzzz", false));
    assert!(!reusable);
    pending.await;
}

#[tokio::test]
async fn superseded_request_is_cancelled_but_still_accounted() {
    let (supervisor, store) = engine(EngineOptions::default()).await;
    supervisor
        .register(MockSource::with_delay(
            "slow",
            Duration::from_millis(50),
            &["alpha", "beta", "gamma"],
        ))
        .await;

    let racing = Arc::clone(&supervisor);
    let first = tokio::spawn(async move {
        racing
            .collect(context_with(Uuid::new_v4(), "a", true))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = supervisor
        .collect(context_with(Uuid::new_v4(), "b", true))
        .await;
    first.await.expect("first request");

    assert_eq!(second.len(), 3);

    let instances: i64 = sqlx::query("SELECT COUNT(*) AS n FROM instance")
        .fetch_one(store.pool())
        .await
        .expect("count")
        .get("n");
    let stats: i64 = sqlx::query("SELECT COUNT(*) AS n FROM instance_stat")
        .fetch_one(store.pool())
        .await
        .expect("count")
        .get("n");
    let interrupted: i64 = sqlx::query("SELECT COUNT(*) AS n FROM instance_stat WHERE interrupted")
        .fetch_one(store.pool())
        .await
        .expect("count")
        .get("n");
    assert_eq!(instances, 2, "both requests started an instance");
    assert_eq!(stats, 2, "every started instance wrote its stat");
    assert_eq!(interrupted, 1, "only the superseded one was interrupted");
}

#[tokio::test]
async fn provider_failure_is_isolated_and_recorded() {
    let (supervisor, store) = engine(EngineOptions::default()).await;
    supervisor
        .register(MockSource::with_failure("flaky", 2, &["a", "b", "c"]))
        .await;
    supervisor.register(MockSource::new("steady", &["x"])).await;

    let metrics = supervisor
        .collect(context_with(Uuid::new_v4(), "", true))
        .await;

    let got: BTreeSet<String> = words(&metrics).into_iter().collect();
    assert!(got.contains("x"), "sibling results survive the failure");
    assert!(got.contains("a") && got.contains("b"));
    assert!(!got.contains("c"), "nothing after the failure point");

    let row = sqlx::query(
        "SELECT s.interrupted AS interrupted, s.items AS items \
         FROM instance_stat s JOIN instance i ON i.id = s.instance_id \
         WHERE i.source = 'flaky'",
    )
    .fetch_one(store.pool())
    .await
    .expect("flaky stat");
    assert_eq!(row.get::<i64, _>("items"), 2);
    assert_eq!(row.get::<bool, _>("interrupted"), true);
}

#[tokio::test]
async fn deadline_stretches_for_the_first_result() {
    let (supervisor, _store) = engine(EngineOptions::default()).await;
    supervisor
        .register(MockSource::with_delay(
            "slow",
            Duration::from_millis(150),
            &["answer"],
        ))
        .await;

    // slower than the automatic deadline, yet never empty-handed
    let metrics = supervisor
        .collect(context_with(Uuid::new_v4(), "a", false))
        .await;
    assert_eq!(words(&metrics), vec!["answer"]);
}

#[tokio::test]
async fn idle_wakes_on_notify() {
    let (supervisor, _store) = engine(EngineOptions::default()).await;

    let waiting = Arc::clone(&supervisor);
    let waiter = tokio::spawn(async move { waiting.idle().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    supervisor.notify_idle();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("notified in time")
        .expect("waiter task");
}
