//! Raw-record mirror into Postgres.
//!
//! Every admitted record is written in its wire form into the `posts` table
//! so a later run can replay it. The mirror is best-effort: a failed write is
//! logged and never holds up projection. Each write is bounded by a timeout,
//! and once the store looks unreachable writes are skipped for a backoff
//! period instead of each post waiting out its own timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{trace, warn};

use pulsegraph_common::PostRecord;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_OUTAGE_BACKOFF: Duration = Duration::from_secs(30);

/// Apply the document-store migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Where admitted raw records go. Disabled when the records were read from
/// the mirror in the first place.
#[derive(Clone)]
pub enum MirrorSink {
    Postgres(PostgresMirror),
    Disabled,
}

impl MirrorSink {
    pub async fn store(&self, record: &PostRecord) {
        if let MirrorSink::Postgres(mirror) = self {
            mirror.store(record).await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, MirrorSink::Postgres(_))
    }
}

#[derive(Clone)]
pub struct PostgresMirror {
    pool: PgPool,
    write_timeout: Duration,
    outage: Arc<OutageGate>,
}

impl PostgresMirror {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outage: Arc::new(OutageGate::new(DEFAULT_OUTAGE_BACKOFF)),
        }
    }

    /// Give up on a single write after this long.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Skip writes for this long after the store turned out unreachable.
    pub fn with_outage_backoff(mut self, backoff: Duration) -> Self {
        self.outage = Arc::new(OutageGate::new(backoff));
        self
    }

    /// Best-effort write. Never fails and never takes longer than the write
    /// timeout.
    pub async fn store(&self, record: &PostRecord) {
        let post_id = record.id.as_str();
        if !self.outage.is_open() {
            trace!(post_id, "Mirror paused, skipping post");
            return;
        }

        let (error, unreachable) =
            match tokio::time::timeout(self.write_timeout, self.insert(record)).await {
                Ok(Ok(true)) => {
                    trace!(post_id, "Mirrored post");
                    return;
                }
                Ok(Ok(false)) => {
                    trace!(post_id, "Post already mirrored");
                    return;
                }
                Ok(Err(e)) => {
                    let unreachable = is_unreachable(&e);
                    (e.to_string(), unreachable)
                }
                Err(_) => (
                    format!("write timed out after {}ms", self.write_timeout.as_millis()),
                    true,
                ),
            };

        if unreachable && self.outage.trip() {
            warn!(
                post_id,
                error = error.as_str(),
                backoff_secs = self.outage.backoff.as_secs(),
                "Document store unreachable, pausing mirror writes"
            );
        } else {
            warn!(post_id, error = error.as_str(), "Failed to mirror post");
        }
    }

    /// Insert the record keyed by its raw id. Returns false when it was
    /// already mirrored.
    pub async fn insert(&self, record: &PostRecord) -> Result<bool, sqlx::Error> {
        let payload = record
            .to_document()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            "INSERT INTO posts (id, payload) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await
    }
}

/// Errors that say the store itself is gone, rather than this one record
/// being rejected.
fn is_unreachable(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Closed for `backoff` after being tripped, open otherwise.
#[derive(Debug)]
struct OutageGate {
    backoff: Duration,
    closed_until: Mutex<Option<Instant>>,
}

impl OutageGate {
    fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            closed_until: Mutex::new(None),
        }
    }

    fn is_open(&self) -> bool {
        let mut closed_until = self.closed_until.lock().unwrap_or_else(|p| p.into_inner());
        match *closed_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *closed_until = None;
                true
            }
            None => true,
        }
    }

    /// Close the gate. Returns false when it was already closed.
    fn trip(&self) -> bool {
        let mut closed_until = self.closed_until.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if closed_until.is_some_and(|until| now < until) {
            return false;
        }
        *closed_until = Some(now + self.backoff);
        true
    }
}

#[cfg(test)]
mod tests {
    use sqlx::postgres::PgPoolOptions;
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::post;

    #[tokio::test(start_paused = true)]
    async fn gate_stays_closed_for_the_backoff() {
        let gate = OutageGate::new(Duration::from_secs(30));
        assert!(gate.is_open());

        assert!(gate.trip());
        assert!(!gate.trip());
        assert!(!gate.is_open());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!gate.is_open());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(gate.is_open());
        assert!(gate.trip());
    }

    #[test]
    fn rejected_records_do_not_count_as_an_outage() {
        assert!(is_unreachable(&sqlx::Error::PoolTimedOut));
        assert!(!is_unreachable(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn hung_store_costs_one_timeout_then_writes_are_skipped() {
        // Accepts connections but never answers the startup handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(&format!("postgres://u:p@{addr}/db"))
            .unwrap();
        let mirror = PostgresMirror::new(pool)
            .with_write_timeout(Duration::from_millis(100))
            .with_outage_backoff(Duration::from_secs(60));

        let started = std::time::Instant::now();
        mirror.store(&post("1", "en", &["a"])).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!mirror.outage.is_open());

        let started = std::time::Instant::now();
        mirror.store(&post("2", "en", &["a"])).await;
        assert!(started.elapsed() < Duration::from_millis(50));
        drop(listener);
    }
}
