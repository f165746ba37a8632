pub mod coordinator;
pub mod expansion;
pub mod filter;
pub mod mirror;
pub mod resolver;
pub mod shutdown;
pub mod source;
pub mod stats;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use coordinator::{Coordinator, IngestOptions, RecordProcessor};
pub use expansion::expand_event;
pub use filter::{IgnorePredicate, IgnoreReason, PostFilter, StoredOriginalPredicate};
pub use mirror::{MirrorSink, PostgresMirror};
pub use resolver::resolve;
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use source::{EventStream, ReplaySource, SampleStream, SourceError, StreamSource};
pub use stats::{IngestStats, StatsReporter, StatsSnapshot, TickReport};
