use async_trait::async_trait;
use futures::StreamExt;
use sqlx::PgPool;
use tracing::info;

use pulsegraph_common::{PostEvent, PostRecord};

use super::{EventStream, SourceError, StreamSource};

/// Replays records previously mirrored into Postgres, oldest first.
///
/// Mirrored records were stored one per row after expansion, so each replayed
/// event carries a single post and no inclusions. The source is finite: once
/// the table is drained the run ends.
pub struct ReplaySource {
    pool: PgPool,
}

impl ReplaySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StreamSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn start(&self) -> Result<EventStream, SourceError> {
        let pool = self.pool.clone();
        let stream = async_stream::stream! {
            let mut rows = sqlx::query_scalar::<_, serde_json::Value>(
                "SELECT payload FROM posts ORDER BY mirrored_at, id",
            )
            .fetch(&pool);

            let mut replayed: u64 = 0;
            while let Some(row) = rows.next().await {
                match row {
                    Ok(payload) => {
                        replayed += 1;
                        yield serde_json::from_value::<PostRecord>(payload)
                            .map(PostEvent::single)
                            .map_err(|e| SourceError::Decode(e.to_string()));
                    }
                    Err(e) => {
                        yield Err(SourceError::Database(e));
                        return;
                    }
                }
            }
            info!(replayed, "Replay source drained");
        };
        Ok(Box::pin(stream))
    }

    fn is_finite(&self) -> bool {
        true
    }
}
