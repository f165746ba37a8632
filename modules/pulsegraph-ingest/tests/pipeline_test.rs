// End-to-end coordinator behaviour over the in-memory graph store.
//
// Run with: cargo test -p pulsegraph-ingest --test pipeline_test

use std::sync::Arc;
use std::time::Duration;

use pulsegraph_common::{PostEvent, ReferenceKind};
use pulsegraph_graph::testing::{MemoryGraphStore, StoreOp};
use pulsegraph_graph::{GraphProjector, GraphStore, KnownDomains, RetryPolicy};
use pulsegraph_ingest::shutdown;
use pulsegraph_ingest::testing::{post, repost_event, with_annotation, with_reference, ScriptedSource};
use pulsegraph_ingest::{
    Coordinator, IngestOptions, IngestStats, MirrorSink, PostFilter, PostgresMirror,
    RecordProcessor, SourceError, StatsSnapshot, StoredOriginalPredicate,
};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

struct Pipeline {
    store: Arc<MemoryGraphStore>,
    source: Arc<ScriptedSource>,
    coordinator: Coordinator,
}

fn options(workers: usize) -> IngestOptions {
    IngestOptions::builder()
        .workers(workers)
        .queue_capacity(8)
        .restart_cooldown(Duration::from_millis(10))
        .rate_limit_cooldown(Duration::from_millis(50))
        .build()
}

fn pipeline(source: ScriptedSource, filter: PostFilter, workers: usize) -> Pipeline {
    pipeline_on(Arc::new(MemoryGraphStore::new()), source, filter, workers)
}

fn pipeline_on(
    store: Arc<MemoryGraphStore>,
    source: ScriptedSource,
    filter: PostFilter,
    workers: usize,
) -> Pipeline {
    pipeline_mirroring(store, source, filter, MirrorSink::Disabled, workers)
}

fn pipeline_mirroring(
    store: Arc<MemoryGraphStore>,
    source: ScriptedSource,
    filter: PostFilter,
    mirror: MirrorSink,
    workers: usize,
) -> Pipeline {
    let source = Arc::new(source);
    let projector = GraphProjector::new(
        store.clone(),
        Arc::new(KnownDomains::new()),
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        },
    );
    let processor = RecordProcessor::new(
        filter,
        projector,
        mirror,
        Arc::new(IngestStats::new()),
    );
    let coordinator = Coordinator::new(source.clone(), processor, options(workers));
    Pipeline {
        store,
        source,
        coordinator,
    }
}

async fn run_to_end(pipeline: &Pipeline) -> StatsSnapshot {
    let (_trigger, shutdown) = shutdown::channel();
    tokio::time::timeout(Duration::from_secs(5), pipeline.coordinator.run(shutdown))
        .await
        .expect("finite source should end the run")
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn allow_listed_posts_are_projected_and_counted() {
    let source = ScriptedSource::finite().events(vec![
        PostEvent::single(post("1", "en", &["a"])),
        PostEvent::single(post("2", "en", &["a", "b"])),
        PostEvent::single(post("3", "fr", &["a"])),
    ]);
    let p = pipeline(source, PostFilter::new().allow_languages(["en"]), 4);

    let totals = run_to_end(&p).await;

    assert_eq!(p.store.hashtag_count("a"), Some(2));
    assert_eq!(p.store.hashtag_count("b"), Some(1));
    assert_eq!(p.store.post_ids(), vec!["1", "2"]);
    assert!(p.store.post("3").is_none());
    assert_eq!(totals.received, 3);
    assert_eq!(totals.admitted, 2);
    assert_eq!(totals.ignored, 1);
    assert_eq!(totals.failed, 0);
}

#[tokio::test]
async fn repost_with_included_original_stores_only_the_original() {
    let source = ScriptedSource::finite().events(vec![repost_event("10", post("5", "en", &["a"]))]);
    let p = pipeline(source, PostFilter::new(), 2);

    let totals = run_to_end(&p).await;

    assert_eq!(p.store.post_ids(), vec!["5"]);
    let original = p.store.post("5").unwrap();
    assert!(!original.derived);
    assert_eq!(original.author_id.as_deref(), Some("author-5"));
    assert_eq!(totals.received, 1);
    assert_eq!(totals.admitted, 1);
}

#[tokio::test]
async fn bare_repost_collapses_onto_its_target() {
    let wrapper = with_reference(post("10", "en", &["a"]), ReferenceKind::Repost, "5");
    let source = ScriptedSource::finite().events(vec![PostEvent::single(wrapper)]);
    let p = pipeline(source, PostFilter::new(), 2);

    run_to_end(&p).await;

    assert!(p.store.post("10").is_none());
    let collapsed = p.store.post("5").unwrap();
    assert!(collapsed.derived);
    assert_eq!(collapsed.author_id, None);
    assert_eq!(p.store.used_in_edges("a", "5"), 1);
}

#[tokio::test]
async fn repeated_post_is_stored_once() {
    let source = ScriptedSource::finite().events(vec![
        PostEvent::single(post("1", "en", &["a"])),
        PostEvent::single(post("1", "en", &["a"])),
        PostEvent::single(post("1", "en", &["a"])),
    ]);
    let p = pipeline(source, PostFilter::new(), 4);

    let totals = run_to_end(&p).await;

    assert_eq!(p.store.post_count(), 1);
    assert_eq!(p.store.hashtag_count("a"), Some(1));
    assert_eq!(p.store.used_in_edges("a", "1"), 1);
    assert_eq!(totals.admitted, 1);
    assert_eq!(totals.ignored, 2);
}

#[tokio::test]
async fn reposts_of_stored_posts_are_skipped_before_projection() {
    let store = Arc::new(MemoryGraphStore::new());
    let filter = PostFilter::new().ignore_if_async(Arc::new(StoredOriginalPredicate::new(
        store.clone() as Arc<dyn GraphStore>,
    )));
    let source = ScriptedSource::finite().events(vec![
        PostEvent::single(post("5", "en", &["a"])),
        PostEvent::single(with_reference(post("10", "en", &["a"]), ReferenceKind::Repost, "5")),
    ]);
    // One worker keeps arrival order.
    let p = pipeline_on(store, source, filter, 1);

    let totals = run_to_end(&p).await;

    assert_eq!(totals.admitted, 1);
    assert_eq!(totals.ignored, 1);
    assert_eq!(p.store.hashtag_count("a"), Some(1));
    assert_eq!(p.store.calls(StoreOp::CreatePost), 1);
}

#[tokio::test]
async fn hung_mirror_does_not_hold_up_projection() {
    // Accepts connections but never answers, like a wedged Postgres.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy(&format!("postgres://u:p@{addr}/db"))
        .unwrap();
    let mirror = PostgresMirror::new(pool)
        .with_write_timeout(Duration::from_millis(100))
        .with_outage_backoff(Duration::from_secs(60));

    let events = (1..=8)
        .map(|i| PostEvent::single(post(&i.to_string(), "en", &["a"])))
        .collect();
    let p = pipeline_mirroring(
        Arc::new(MemoryGraphStore::new()),
        ScriptedSource::finite().events(events),
        PostFilter::new(),
        MirrorSink::Postgres(mirror),
        2,
    );

    let started = std::time::Instant::now();
    let totals = run_to_end(&p).await;

    // At most one write timeout per worker before the mirror pauses.
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(totals.admitted, 8);
    assert_eq!(totals.failed, 0);
    assert_eq!(p.store.hashtag_count("a"), Some(8));
    drop(listener);
}

#[tokio::test]
async fn annotations_are_projected_with_the_post() {
    let record = with_annotation(post("1", "en", &[]), "66", "847");
    let source = ScriptedSource::finite().events(vec![PostEvent::single(record)]);
    let p = pipeline(source, PostFilter::new(), 2);

    run_to_end(&p).await;

    assert!(p.store.domain("66").is_some());
    assert_eq!(p.store.mentioned_in_edges("847", "1"), 1);
    assert!(p.store.has_domain_edge("847", "66"));
}

#[tokio::test]
async fn malformed_records_are_skipped_without_stopping_the_run() {
    let source = ScriptedSource::finite().session(vec![
        Ok(PostEvent::single(post("", "en", &["a"]))),
        Err(SourceError::Decode("expected value at line 1".into())),
        Ok(PostEvent::single(with_reference(post("2", "en", &["a"]), ReferenceKind::Quote, ""))),
        Ok(PostEvent::single(post("3", "en", &["a"]))),
    ]);
    let p = pipeline(source, PostFilter::new(), 2);

    let totals = run_to_end(&p).await;

    assert_eq!(totals.malformed, 3);
    assert_eq!(totals.admitted, 1);
    assert_eq!(p.store.post_ids(), vec!["3"]);
    // A record-level error is not a disconnect.
    assert_eq!(p.source.starts(), 1);
}

#[tokio::test]
async fn store_failure_is_counted_and_ingestion_continues() {
    let store = Arc::new(MemoryGraphStore::new());
    store.make_unavailable(StoreOp::MergeHashtag);
    let source = ScriptedSource::finite().events(vec![
        PostEvent::single(post("1", "en", &["a"])),
        PostEvent::single(with_annotation(post("2", "en", &[]), "66", "847")),
    ]);
    let p = pipeline_on(store, source, PostFilter::new(), 2);

    let totals = run_to_end(&p).await;

    assert_eq!(totals.failed, 1);
    assert_eq!(totals.admitted, 1);
    assert_eq!(p.store.mentioned_in_edges("847", "2"), 1);
}

#[tokio::test]
async fn conflicts_beyond_the_retry_bound_fail_only_that_post() {
    let store = Arc::new(MemoryGraphStore::new());
    store.inject_conflicts(StoreOp::MergeHashtag, 4);
    let source = ScriptedSource::finite().events(vec![
        PostEvent::single(post("1", "en", &["a"])),
        PostEvent::single(post("2", "en", &["b"])),
    ]);
    let p = pipeline_on(store, source, PostFilter::new(), 1);

    let totals = run_to_end(&p).await;

    assert_eq!(totals.failed, 1);
    assert_eq!(totals.admitted, 1);
    assert_eq!(p.store.hashtag_count("a"), None);
    assert_eq!(p.store.hashtag_count("b"), Some(1));
}

#[tokio::test]
async fn interrupted_stream_is_restarted() {
    let source = ScriptedSource::new()
        .session(vec![
            Ok(PostEvent::single(post("1", "en", &["a"]))),
            Err(SourceError::Status {
                status: 503,
                body: "service unavailable".into(),
            }),
        ])
        .refuse(SourceError::RateLimited {
            retry_after: Some(Duration::from_millis(20)),
        })
        .events(vec![PostEvent::single(post("2", "en", &["a"]))]);
    let p = Arc::new(pipeline(source, PostFilter::new(), 2));

    let (trigger, shutdown) = shutdown::channel();
    let running = {
        let p = p.clone();
        tokio::spawn(async move { p.coordinator.run(shutdown).await })
    };

    // Session 1 errors, session 2 is refused, session 3 closes, session 4 idles.
    wait_until("restarts", || p.source.starts() >= 4).await;
    wait_until("both posts", || p.store.post_count() == 2).await;

    trigger.trigger();
    let totals = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("shutdown should stop the run")
        .unwrap();

    assert_eq!(totals.received, 2);
    assert_eq!(totals.admitted, 2);
    assert_eq!(p.store.hashtag_count("a"), Some(2));
}

#[tokio::test]
async fn shutdown_stops_an_idle_live_source() {
    let p = Arc::new(pipeline(ScriptedSource::new(), PostFilter::new(), 2));

    let (trigger, shutdown) = shutdown::channel();
    let running = {
        let p = p.clone();
        tokio::spawn(async move { p.coordinator.run(shutdown).await })
    };

    wait_until("first session", || p.source.starts() == 1).await;
    trigger.trigger();

    let totals = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("shutdown should stop the run")
        .unwrap();
    assert_eq!(totals, StatsSnapshot::default());
    assert_eq!(p.source.starts(), 1);
    assert_eq!(p.source.stops(), 1);
}
