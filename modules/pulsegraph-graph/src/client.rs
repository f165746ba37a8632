use neo4rs::{query, ConfigBuilder, Graph};
use tracing::debug;

const DEFAULT_POOL_SIZE: usize = 32;

/// Shared Neo4j connection pool. Cheap to clone.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        Self::connect_with_pool(uri, user, password, DEFAULT_POOL_SIZE).await
    }

    /// Connect with room for `max_connections` concurrent transactions.
    /// Every projection write runs in its own short transaction, so the pool
    /// should cover the ingest workers plus filter lookups.
    pub async fn connect_with_pool(
        uri: &str,
        user: &str,
        password: &str,
        max_connections: usize,
    ) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(max_connections.max(1))
            .build()?;
        let client = Self {
            graph: Graph::connect(config).await?,
        };
        client.ping().await?;
        debug!(uri, max_connections, "Connected to Neo4j");
        Ok(client)
    }

    /// Round-trip a trivial query so bad credentials fail at startup rather
    /// than on the first post.
    pub async fn ping(&self) -> Result<(), neo4rs::Error> {
        let mut rows = self.graph.execute(query("RETURN 1 AS ok")).await?;
        while rows.next().await?.is_some() {}
        Ok(())
    }

    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}
