// Ingestion coordinator.
//
//   source session -> expand -> validate -> bounded queue -> workers
//   worker: resolve -> filter -> (project || mirror) -> count
//
// The receive loop owns the source. It restarts the session after a cooldown
// whenever the stream errors or closes, until shutdown is requested or a
// finite source runs dry. Workers drain whatever is still queued before
// `run` returns.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

use pulsegraph_common::{Config, PostRecord};
use pulsegraph_graph::{GraphProjector, ProjectOutcome};

use crate::expansion::expand_event;
use crate::filter::PostFilter;
use crate::mirror::MirrorSink;
use crate::resolver::resolve;
use crate::source::{EventStream, SourceError, StreamSource};
use crate::stats::{IngestStats, StatsSnapshot};
use crate::Shutdown;

#[derive(Debug, Clone, TypedBuilder)]
pub struct IngestOptions {
    #[builder(default = 16)]
    pub workers: usize,
    #[builder(default = 1024)]
    pub queue_capacity: usize,
    /// Delay before reopening a dropped session.
    #[builder(default = Duration::from_secs(18))]
    pub restart_cooldown: Duration,
    /// Delay after the endpoint refused us without saying for how long.
    #[builder(default = Duration::from_secs(900))]
    pub rate_limit_cooldown: Duration,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .workers(config.workers)
            .queue_capacity(config.queue_capacity)
            .restart_cooldown(config.restart_cooldown())
            .rate_limit_cooldown(config.rate_limit_window)
            .build()
    }
}

/// Per-record pipeline run by each worker. Every outcome ends in exactly one
/// counter increment; nothing propagates out.
#[derive(Clone)]
pub struct RecordProcessor {
    filter: Arc<PostFilter>,
    projector: Arc<GraphProjector>,
    mirror: MirrorSink,
    stats: Arc<IngestStats>,
}

impl RecordProcessor {
    pub fn new(
        filter: PostFilter,
        projector: GraphProjector,
        mirror: MirrorSink,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            filter: Arc::new(filter),
            projector: Arc::new(projector),
            mirror,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub async fn process(&self, record: PostRecord) {
        let post = resolve(&record);

        if let Some(reason) = self.filter.verdict(&post).await {
            trace!(post_id = post.id.as_str(), %reason, "Ignoring post");
            self.stats.record_ignored();
            return;
        }

        let (outcome, ()) = tokio::join!(
            self.projector.project(&post),
            self.mirror.store(&post.record)
        );

        match outcome {
            ProjectOutcome::Inserted => self.stats.record_admitted(),
            ProjectOutcome::Duplicate => self.stats.record_ignored(),
            ProjectOutcome::Failed => self.stats.record_failed(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
    Failed(SourceError),
}

pub struct Coordinator {
    source: Arc<dyn StreamSource>,
    processor: RecordProcessor,
    options: IngestOptions,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn StreamSource>,
        processor: RecordProcessor,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            processor,
            options,
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        self.processor.stats()
    }

    /// Ingest until `shutdown` fires or a finite source is exhausted.
    /// Returns the final counters.
    pub async fn run(&self, shutdown: Shutdown) -> StatsSnapshot {
        let (tx, rx) = mpsc::channel::<PostRecord>(self.options.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.options.workers.max(1) {
            let rx = rx.clone();
            let processor = self.processor.clone();
            workers.spawn(async move {
                loop {
                    // Guard is released before processing starts.
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(record) => processor.process(record).await,
                        None => break,
                    }
                }
            });
        }

        info!(
            source = self.source.name(),
            workers = self.options.workers.max(1),
            queue_capacity = self.options.queue_capacity.max(1),
            "Ingestion started"
        );

        self.receive_loop(&tx, shutdown).await;

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Ingest worker panicked");
            }
        }

        let totals = self.stats().snapshot();
        info!(
            received = totals.received,
            admitted = totals.admitted,
            ignored = totals.ignored,
            failed = totals.failed,
            malformed = totals.malformed,
            "Ingestion stopped"
        );
        totals
    }

    async fn receive_loop(&self, tx: &mpsc::Sender<PostRecord>, mut shutdown: Shutdown) {
        let mut session: u64 = 0;

        while !shutdown.is_triggered() {
            session += 1;
            let cooldown = match self.source.start().await {
                Ok(stream) => {
                    debug!(source = self.source.name(), session, "Stream session opened");
                    let end = self.consume(stream, tx, &mut shutdown).await;
                    self.source.stop().await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed if self.source.is_finite() => {
                            info!(source = self.source.name(), "Source exhausted");
                            break;
                        }
                        SessionEnd::Closed => {
                            warn!(source = self.source.name(), session, "Stream closed unexpectedly");
                            self.options.restart_cooldown
                        }
                        SessionEnd::Failed(e) => {
                            warn!(source = self.source.name(), session, error = %e, "Stream interrupted");
                            self.cooldown_for(&e)
                        }
                    }
                }
                Err(e) => {
                    error!(source = self.source.name(), session, error = %e, "Could not start stream");
                    self.cooldown_for(&e)
                }
            };

            info!(cooldown_ms = cooldown.as_millis() as u64, "Restarting stream after cooldown");
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(cooldown) => {}
            }
        }
    }

    async fn consume(
        &self,
        mut stream: EventStream,
        tx: &mpsc::Sender<PostRecord>,
        shutdown: &mut Shutdown,
    ) -> SessionEnd {
        let stats = self.stats();
        loop {
            let next = tokio::select! {
                _ = shutdown.wait() => return SessionEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                None => return SessionEnd::Closed,
                Some(Ok(event)) => {
                    stats.record_received();
                    for record in expand_event(event) {
                        if let Err(e) = record.validate() {
                            debug!(error = %e, "Skipping malformed record");
                            stats.record_malformed();
                            continue;
                        }
                        if tx.send(record).await.is_err() {
                            // Every worker is gone; nothing left to feed.
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Some(Err(e)) if e.is_record_level() => {
                    stats.record_received();
                    stats.record_malformed();
                    debug!(error = %e, "Skipping undecodable record");
                }
                Some(Err(e)) => return SessionEnd::Failed(e),
            }
        }
    }

    fn cooldown_for(&self, error: &SourceError) -> Duration {
        match error {
            SourceError::RateLimited { retry_after } => {
                retry_after.unwrap_or(self.options.rate_limit_cooldown)
            }
            _ => self.options.restart_cooldown,
        }
    }
}
