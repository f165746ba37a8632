pub mod cache;
pub mod client;
pub mod error;
pub mod migrate;
pub mod projector;
pub mod reader;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use cache::KnownDomains;
pub use client::GraphClient;
pub use error::StoreError;
pub use neo4rs::query;
pub use projector::{retry_on_conflict, GraphProjector, ProjectOutcome, RetryPolicy};
pub use reader::{HashtagCount, HashtagReader, TopicCount};
pub use store::{GraphStore, GraphWriter};
