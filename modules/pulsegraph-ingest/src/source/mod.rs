//! Raw post sources.
//!
//! A source hands the coordinator a stream of [`PostEvent`]s per session.
//! When a session stream ends or errors the coordinator decides whether to
//! start another one.

pub mod replay;
pub mod sample;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use pulsegraph_common::PostEvent;

pub use replay::ReplaySource;
pub use sample::SampleStream;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<PostEvent, SourceError>> + Send>>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited by stream endpoint")]
    RateLimited { retry_after: Option<Duration> },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no data from stream endpoint for {0:?}")]
    Idle(Duration),

    #[error("could not decode record: {0}")]
    Decode(String),
}

impl SourceError {
    /// Errors confined to one record; the session itself is still healthy.
    pub fn is_record_level(&self) -> bool {
        matches!(self, SourceError::Decode(_))
    }
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    fn name(&self) -> &str;

    /// Open a new session.
    async fn start(&self) -> Result<EventStream, SourceError>;

    /// Release anything held by the current session.
    async fn stop(&self) {}

    /// A finite source is drained once; its end is not a disconnect.
    fn is_finite(&self) -> bool {
        false
    }
}
