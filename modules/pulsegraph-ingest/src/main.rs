use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pulsegraph_common::{Config, StreamProvider};
use pulsegraph_graph::{
    GraphClient, GraphProjector, GraphStore, GraphWriter, HashtagReader, KnownDomains, RetryPolicy,
};
use pulsegraph_ingest::source::{ReplaySource, SampleStream};
use pulsegraph_ingest::{
    mirror, shutdown, Coordinator, IngestOptions, IngestStats, MirrorSink, PostFilter,
    PostgresMirror, RecordProcessor, StatsReporter, StreamSource,
};

#[derive(Parser)]
#[command(name = "pulsegraph-ingest", about = "Project a sampled post stream into a hashtag graph")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest until interrupted (default).
    Run,
    /// Apply graph constraints and document-store migrations, then exit.
    Migrate,
    /// Print the most used hashtags.
    Top {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        last_days: Option<u32>,
    },
    /// Print hashtags used together with NAME.
    Similar {
        name: String,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        last_days: Option<u32>,
    },
    /// Print the entities most mentioned alongside NAME.
    Topics {
        name: String,
        #[arg(long)]
        lang: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Migrate => migrate().await,
        Command::Top {
            limit,
            lang,
            last_days,
        } => {
            let reader = HashtagReader::new(connect_graph(&Config::query_from_env()?).await?);
            for h in reader.top_hashtags(limit, lang.as_deref(), last_days).await? {
                println!("{:>8}  #{}", h.posts, h.name);
            }
            Ok(())
        }
        Command::Similar {
            name,
            lang,
            last_days,
        } => {
            let reader = HashtagReader::new(connect_graph(&Config::query_from_env()?).await?);
            for h in reader.similar_hashtags(&name, lang.as_deref(), last_days).await? {
                println!("{:>8}  #{}", h.posts, h.name);
            }
            Ok(())
        }
        Command::Topics { name, lang } => {
            let reader = HashtagReader::new(connect_graph(&Config::query_from_env()?).await?);
            for t in reader.hashtag_topics(&name, lang.as_deref()).await? {
                println!("{:>8}  {}", t.posts, t.entity);
            }
            Ok(())
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "warn,pulsegraph=info";

fn init_tracing() -> Result<()> {
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok())?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// `RUST_LOG` when set, the crate default otherwise.
fn env_filter(rust_log: Option<String>) -> Result<EnvFilter> {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(directives) => {
            EnvFilter::try_new(&directives).with_context(|| format!("Invalid RUST_LOG '{directives}'"))
        }
        None => Ok(EnvFilter::new(DEFAULT_LOG_FILTER)),
    }
}

async fn connect_graph(config: &Config) -> Result<GraphClient> {
    // Workers plus the stored-original lookups they issue.
    GraphClient::connect_with_pool(
        &config.neo4j_uri,
        &config.neo4j_user,
        &config.neo4j_password,
        config.workers * 2,
    )
    .await
    .context("Failed to connect to Neo4j")
}

async fn connect_documents(config: &Config) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    mirror::migrate(&pool)
        .await
        .context("Failed to migrate document store")?;
    Ok(pool)
}

async fn migrate() -> Result<()> {
    let config = Config::migrate_from_env()?;
    let client = connect_graph(&config).await?;
    pulsegraph_graph::migrate::migrate(&client)
        .await
        .context("Failed to migrate graph schema")?;
    connect_documents(&config).await?;
    info!("Migrations complete");
    Ok(())
}

async fn run() -> Result<()> {
    info!("pulsegraph ingest starting...");

    let config = Config::from_env()?;
    config.log_redacted();

    let client = connect_graph(&config).await?;
    pulsegraph_graph::migrate::migrate(&client)
        .await
        .context("Failed to migrate graph schema")?;
    let pool = connect_documents(&config).await?;

    // Never write back records that were just read from the mirror.
    let (source, mirror): (Arc<dyn StreamSource>, MirrorSink) = match config.stream_provider {
        StreamProvider::Live => {
            let token = config
                .stream_bearer_token
                .clone()
                .ok_or_else(|| anyhow!("STREAM_BEARER_TOKEN is required for the live stream"))?;
            (
                Arc::new(SampleStream::new(config.stream_url.clone(), token)) as Arc<dyn StreamSource>,
                MirrorSink::Postgres(
                    PostgresMirror::new(pool.clone())
                        .with_write_timeout(config.mirror_write_timeout)
                        .with_outage_backoff(config.mirror_outage_backoff),
                ),
            )
        }
        StreamProvider::Replay => (
            Arc::new(ReplaySource::new(pool.clone())) as Arc<dyn StreamSource>,
            MirrorSink::Disabled,
        ),
    };

    let store: Arc<dyn GraphStore> = Arc::new(GraphWriter::new(client.clone()));
    let filter = PostFilter::from_config(&config, store.clone());
    let projector = GraphProjector::new(
        store,
        Arc::new(KnownDomains::new()),
        RetryPolicy {
            max_retries: config.conflict_max_retries,
            backoff: config.conflict_backoff,
        },
    );
    let stats = Arc::new(IngestStats::new());
    let processor = RecordProcessor::new(filter, projector, mirror, stats.clone());
    let coordinator = Coordinator::new(source, processor, IngestOptions::from_config(&config));

    let (trigger, shutdown) = shutdown::channel();
    let reporter = tokio::spawn(StatsReporter::new(stats, config.stats_tick).run(shutdown.clone()));

    let on_signal = trigger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, draining in-flight posts");
            on_signal.trigger();
        }
    });

    coordinator.run(shutdown).await;

    // A finite source ends on its own; stop the reporter too.
    trigger.trigger();
    reporter.await.context("Stats reporter panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    #[test]
    fn rust_log_replaces_the_default_filter() {
        let filter = env_filter(Some("pulsegraph=debug".into())).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn default_filter_applies_when_rust_log_is_unset() {
        for unset in [None, Some(String::new()), Some("  ".into())] {
            let filter = env_filter(unset).unwrap();
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
        }
    }

    #[test]
    fn invalid_rust_log_is_reported() {
        assert!(env_filter(Some("pulsegraph=loud".into())).is_err());
    }
}
