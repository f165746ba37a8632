pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, StreamProvider};
pub use error::PulseError;
pub use types::*;
