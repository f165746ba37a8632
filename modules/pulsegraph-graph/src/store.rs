// Write-side graph operations.
//
// GraphStore is the seam between the projector and the backend: GraphWriter
// talks to Neo4j, testing::MemoryGraphStore keeps everything in memory.
// Each write runs in its own transaction so a transient conflict can be
// retried per operation.

use async_trait::async_trait;
use neo4rs::{query, Query};
use tracing::warn;

use pulsegraph_common::{ContextAnnotation, DomainNode, EntityNode, PostNode};

use crate::{GraphClient, StoreError};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Whether a Post with this canonical id exists.
    async fn post_exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Create the Post node. Fails with `Duplicate` if the id is taken.
    async fn create_post(&self, post: &PostNode) -> Result<(), StoreError>;

    /// Merge-or-create a Domain. Attributes are only set on creation.
    async fn merge_domain(&self, domain: &DomainNode) -> Result<(), StoreError>;

    /// Merge-or-create an Entity keyed by taxonomy id. Name is only set on creation.
    async fn merge_entity(&self, entity: &EntityNode) -> Result<(), StoreError>;

    /// Create Entity-[:MENTIONED_IN]->Post and merge Entity-[:HAS_DOMAIN]->Domain.
    async fn relate_annotation(
        &self,
        post_id: &str,
        annotation: &ContextAnnotation,
    ) -> Result<(), StoreError>;

    /// Merge-or-create the Hashtag, bump its counter by one and create
    /// Hashtag-[:USED_IN]->Post.
    async fn merge_hashtag(&self, post_id: &str, name: &str) -> Result<(), StoreError>;
}

/// Write-side wrapper for the Neo4j graph.
#[derive(Clone)]
pub struct GraphWriter {
    client: GraphClient,
}

impl GraphWriter {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Run one statement inside its own transaction.
    async fn run_in_txn(&self, q: Query) -> Result<(), StoreError> {
        let mut txn = self.client.graph.start_txn().await?;
        if let Err(e) = txn.run(q).await {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "Rollback failed after write error");
            }
            return Err(e.into());
        }
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for GraphWriter {
    async fn post_exists(&self, id: &str) -> Result<bool, StoreError> {
        let q = query("MATCH (p:Post {id: $id}) RETURN count(p) AS n").param("id", id);
        let mut stream = self.client.graph.execute(q).await?;
        let count = match stream.next().await? {
            Some(row) => row.get::<i64>("n").unwrap_or(0),
            None => 0,
        };
        Ok(count > 0)
    }

    async fn create_post(&self, post: &PostNode) -> Result<(), StoreError> {
        let q = query(
            "CREATE (:Post {
                id: $id,
                text: $text,
                lang: $lang,
                date: date($date),
                sensitive: $sensitive,
                derived: $derived,
                author_id: CASE WHEN $author_id = '' THEN null ELSE $author_id END
            })",
        )
        .param("id", post.id.as_str())
        .param("text", post.text.as_str())
        .param("lang", post.lang.as_str())
        .param("date", post.date.format("%Y-%m-%d").to_string())
        .param("sensitive", post.sensitive)
        .param("derived", post.derived)
        .param("author_id", post.author_id.clone().unwrap_or_default());

        self.run_in_txn(q).await
    }

    async fn merge_domain(&self, domain: &DomainNode) -> Result<(), StoreError> {
        let q = query(
            "MERGE (d:Domain {id: $id})
             ON CREATE SET d.name = $name, d.description = $description",
        )
        .param("id", domain.id.as_str())
        .param("name", domain.name.as_str())
        .param("description", domain.description.as_str());

        self.run_in_txn(q).await
    }

    async fn merge_entity(&self, entity: &EntityNode) -> Result<(), StoreError> {
        let q = query(
            "MERGE (e:Entity {id: $id})
             ON CREATE SET e.name = $name",
        )
        .param("id", entity.id.as_str())
        .param("name", entity.name.as_str());

        self.run_in_txn(q).await
    }

    async fn relate_annotation(
        &self,
        post_id: &str,
        annotation: &ContextAnnotation,
    ) -> Result<(), StoreError> {
        let q = query(
            "MATCH (p:Post {id: $post_id})
             MATCH (d:Domain {id: $domain_id})
             MATCH (e:Entity {id: $entity_id})
             CREATE (e)-[:MENTIONED_IN]->(p)
             MERGE (e)-[:HAS_DOMAIN]->(d)",
        )
        .param("post_id", post_id)
        .param("domain_id", annotation.domain.id.as_str())
        .param("entity_id", annotation.entity.id.as_str());

        self.run_in_txn(q).await
    }

    async fn merge_hashtag(&self, post_id: &str, name: &str) -> Result<(), StoreError> {
        let q = query(
            "MATCH (p:Post {id: $post_id})
             MERGE (h:Hashtag {name: $name})
             ON CREATE SET h.count = 1
             ON MATCH SET h.count = h.count + 1
             CREATE (h)-[:USED_IN]->(p)",
        )
        .param("post_id", post_id)
        .param("name", name);

        self.run_in_txn(q).await
    }
}
