use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::{PulseError, ReferenceKinds};

const DEFAULT_STREAM_URL: &str = "https://api.twitter.com/2/tweets/sample/stream";
const DEFAULT_LANGUAGES: &str = "de,en,ja";

/// Where the raw post stream comes from. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProvider {
    /// The external sampled stream over HTTP.
    Live,
    /// Records previously mirrored into the document store.
    Replay,
}

impl FromStr for StreamProvider {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" | "api" => Ok(StreamProvider::Live),
            "replay" | "mirror" => Ok(StreamProvider::Replay),
            other => Err(PulseError::Config(format!(
                "STREAM_PROVIDER must be 'live' or 'replay', got '{other}'"
            ))),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    // Postgres document store
    pub database_url: String,
    pub mirror_write_timeout: Duration,
    pub mirror_outage_backoff: Duration,

    // Stream
    pub stream_provider: StreamProvider,
    pub stream_url: String,
    pub stream_bearer_token: Option<String>,
    pub rate_limit_window: Duration,
    pub connects_per_window: u32,

    // Admission
    pub allowed_languages: BTreeSet<String>,
    pub ignored_reference_kinds: ReferenceKinds,
    pub skip_stored_reposts: bool,

    // Projection
    pub conflict_max_retries: u32,
    pub conflict_backoff: Duration,

    // Coordinator
    pub stats_tick: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    /// Missing credentials are reported as `PulseError::Config`.
    pub fn from_env() -> Result<Self, PulseError> {
        let stream_provider: StreamProvider = optional_env("STREAM_PROVIDER")
            .unwrap_or_else(|| "live".to_string())
            .parse()?;

        let stream_bearer_token = optional_env("STREAM_BEARER_TOKEN");
        if stream_provider == StreamProvider::Live && stream_bearer_token.is_none() {
            return Err(PulseError::Config(
                "STREAM_BEARER_TOKEN environment variable is required for the live stream".into(),
            ));
        }

        Ok(Self {
            neo4j_uri: required_env("NEO4J_URI")?,
            neo4j_user: required_env("NEO4J_USER")?,
            neo4j_password: required_env("NEO4J_PASSWORD")?,
            database_url: required_env("DATABASE_URL")?,
            mirror_write_timeout: Duration::from_millis(parsed_env("MIRROR_WRITE_TIMEOUT_MS", 2000)?),
            mirror_outage_backoff: Duration::from_secs(parsed_env("MIRROR_OUTAGE_BACKOFF_SECS", 30)?),
            stream_provider,
            stream_url: optional_env("STREAM_URL")
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            stream_bearer_token,
            rate_limit_window: Duration::from_secs(parsed_env("STREAM_RATE_WINDOW_SECS", 900)?),
            connects_per_window: parsed_env("STREAM_CONNECTS_PER_WINDOW", 50)?,
            allowed_languages: parse_languages(
                &optional_env("ALLOWED_LANGUAGES").unwrap_or_else(|| DEFAULT_LANGUAGES.to_string()),
            ),
            ignored_reference_kinds: ReferenceKinds::parse_list(
                &optional_env("IGNORED_REFERENCE_KINDS").unwrap_or_default(),
            )?,
            skip_stored_reposts: parsed_env("SKIP_STORED_REPOSTS", true)?,
            conflict_max_retries: parsed_env("CONFLICT_MAX_RETRIES", 3)?,
            conflict_backoff: Duration::from_millis(parsed_env("CONFLICT_BACKOFF_MS", 5)?),
            stats_tick: Duration::from_secs(parsed_env::<u64>("STATS_TICK_SECS", 30)?.max(1)),
            workers: parsed_env::<usize>("INGEST_WORKERS", 16)?.max(1),
            queue_capacity: parsed_env::<usize>("INGEST_QUEUE_CAPACITY", 1024)?.max(1),
        })
    }

    /// Load a minimal config for read-only graph queries. Stream, mirror and
    /// admission settings keep their defaults.
    pub fn query_from_env() -> Result<Self, PulseError> {
        Ok(Self::with_defaults(
            required_env("NEO4J_URI")?,
            required_env("NEO4J_USER")?,
            required_env("NEO4J_PASSWORD")?,
            String::new(),
        ))
    }

    /// Load the store connections only, for applying migrations.
    pub fn migrate_from_env() -> Result<Self, PulseError> {
        Ok(Self::with_defaults(
            required_env("NEO4J_URI")?,
            required_env("NEO4J_USER")?,
            required_env("NEO4J_PASSWORD")?,
            required_env("DATABASE_URL")?,
        ))
    }

    fn with_defaults(
        neo4j_uri: String,
        neo4j_user: String,
        neo4j_password: String,
        database_url: String,
    ) -> Self {
        Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            database_url,
            mirror_write_timeout: Duration::from_secs(2),
            mirror_outage_backoff: Duration::from_secs(30),
            stream_provider: StreamProvider::Live,
            stream_url: DEFAULT_STREAM_URL.to_string(),
            stream_bearer_token: None,
            rate_limit_window: Duration::from_secs(900),
            connects_per_window: 50,
            allowed_languages: parse_languages(DEFAULT_LANGUAGES),
            ignored_reference_kinds: ReferenceKinds::NONE,
            skip_stored_reposts: true,
            conflict_max_retries: 3,
            conflict_backoff: Duration::from_millis(5),
            stats_tick: Duration::from_secs(30),
            workers: 16,
            queue_capacity: 1024,
        }
    }

    /// Delay before reconnecting after the stream drops: one connection slot
    /// of the external rate-limit window.
    pub fn restart_cooldown(&self) -> Duration {
        self.rate_limit_window / self.connects_per_window.max(1)
    }

    /// Log the effective configuration with secrets left out.
    pub fn log_redacted(&self) {
        let languages: Vec<&str> = self.allowed_languages.iter().map(String::as_str).collect();
        info!(
            neo4j_uri = self.neo4j_uri.as_str(),
            neo4j_user = self.neo4j_user.as_str(),
            stream_provider = ?self.stream_provider,
            stream_url = self.stream_url.as_str(),
            bearer_token_set = self.stream_bearer_token.is_some(),
            mirror_write_timeout_ms = self.mirror_write_timeout.as_millis() as u64,
            allowed_languages = %languages.join(","),
            ignored_reference_kinds = %self.ignored_reference_kinds,
            skip_stored_reposts = self.skip_stored_reposts,
            conflict_max_retries = self.conflict_max_retries,
            conflict_backoff_ms = self.conflict_backoff.as_millis() as u64,
            stats_tick_secs = self.stats_tick.as_secs(),
            workers = self.workers,
            queue_capacity = self.queue_capacity,
            restart_cooldown_secs = self.restart_cooldown().as_secs(),
            "Configuration loaded"
        );
    }
}

/// Comma-separated language codes, lower-cased. Empty entries are dropped.
pub fn parse_languages(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(|l| l.trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}

fn required_env(key: &str) -> Result<String, PulseError> {
    optional_env(key)
        .ok_or_else(|| PulseError::Config(format!("{key} environment variable is required")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T, PulseError> {
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PulseError::Config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing() {
        assert_eq!("live".parse::<StreamProvider>().unwrap(), StreamProvider::Live);
        assert_eq!(" Replay ".parse::<StreamProvider>().unwrap(), StreamProvider::Replay);
        assert!("TwitterApi2".parse::<StreamProvider>().is_err());
    }

    #[test]
    fn languages_are_normalized() {
        let langs = parse_languages("de, EN,,ja ");
        assert_eq!(
            langs.into_iter().collect::<Vec<_>>(),
            vec!["de".to_string(), "en".to_string(), "ja".to_string()]
        );
        assert!(parse_languages("").is_empty());
    }

    #[test]
    fn cooldown_is_one_connection_slot() {
        let mut config = Config::with_defaults(String::new(), String::new(), String::new(), String::new());
        assert_eq!(config.restart_cooldown(), Duration::from_secs(18));

        config.connects_per_window = 0;
        assert_eq!(config.restart_cooldown(), Duration::from_secs(900));
    }

    #[test]
    fn minimal_config_uses_documented_defaults() {
        let config = Config::with_defaults("bolt://x".into(), "neo4j".into(), "pw".into(), String::new());
        assert_eq!(config.stream_provider, StreamProvider::Live);
        assert!(config.allowed_languages.contains("ja"));
        assert_eq!(config.conflict_max_retries, 3);
        assert_eq!(config.conflict_backoff, Duration::from_millis(5));
        assert_eq!(config.stats_tick, Duration::from_secs(30));
        assert!(config.skip_stored_reposts);
        assert_eq!(config.mirror_write_timeout, Duration::from_secs(2));
        assert_eq!(config.mirror_outage_backoff, Duration::from_secs(30));
    }
}
