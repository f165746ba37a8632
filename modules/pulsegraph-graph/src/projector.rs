// Projects one canonical post into the graph:
//
//   exists? -> Post -> Domains + Entities -> annotation edges -> Hashtags
//
// The existence check and Post create are separate writes. Two workers racing
// on the same canonical id both pass the check; the uniqueness constraint
// rejects the second CREATE and that insert reports "not new".

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{try_join, try_join_all};
use tracing::{debug, error, trace};

use pulsegraph_common::CanonicalPost;

use crate::{GraphStore, KnownDomains, StoreError};

/// Bound on retries after a transient store conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(5),
        }
    }
}

/// Result of offering one post to the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectOutcome {
    Inserted,
    /// The canonical id was already in the graph; nothing written.
    Duplicate,
    /// An error survived the retry budget. Already logged.
    Failed,
}

/// Run `op`, retrying transient conflicts up to `policy.max_retries` times
/// with a fixed backoff. Any other error is returned immediately.
pub async fn retry_on_conflict<F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && retries < policy.max_retries => {
                retries += 1;
                debug!(what, retries, error = %e, "Transient conflict, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct GraphProjector {
    store: Arc<dyn GraphStore>,
    known_domains: Arc<KnownDomains>,
    retry: RetryPolicy,
}

impl GraphProjector {
    pub fn new(
        store: Arc<dyn GraphStore>,
        known_domains: Arc<KnownDomains>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            known_domains,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Insert the post and everything it references.
    ///
    /// Returns `Ok(false)` without writing when the canonical id is already
    /// stored.
    pub async fn insert(&self, post: &CanonicalPost) -> Result<bool, StoreError> {
        if self.store.post_exists(&post.id).await? {
            debug!(post_id = post.id.as_str(), "Post already stored, skipping");
            return Ok(false);
        }

        match self.store.create_post(&post.to_node()).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                debug!(post_id = post.id.as_str(), "Lost create race for post, skipping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.upsert_topics(post).await?;
        self.relate_topics(post).await?;
        self.upsert_hashtags(post).await?;

        Ok(true)
    }

    /// [`insert`](Self::insert) with errors logged and folded into the outcome.
    pub async fn project(&self, post: &CanonicalPost) -> ProjectOutcome {
        match self.insert(post).await {
            Ok(true) => ProjectOutcome::Inserted,
            Ok(false) => ProjectOutcome::Duplicate,
            Err(e) => {
                error!(post_id = post.id.as_str(), error = %e, "Could not add post");
                ProjectOutcome::Failed
            }
        }
    }

    /// Merge every distinct domain and entity the annotations mention.
    /// Domains already merged by this process are skipped.
    async fn upsert_topics(&self, post: &CanonicalPost) -> Result<(), StoreError> {
        let domains: Vec<_> = post
            .domains()
            .into_iter()
            .filter(|d| !self.known_domains.contains(&d.id))
            .collect();
        let entities = post.entities();

        let domain_writes = domains.iter().map(|domain| async move {
            retry_on_conflict(self.retry, "merge_domain", || {
                self.store.merge_domain(domain)
            })
            .await?;
            self.known_domains.remember(&domain.id);
            Ok::<_, StoreError>(())
        });
        let entity_writes = entities.iter().map(|entity| {
            retry_on_conflict(self.retry, "merge_entity", move || {
                self.store.merge_entity(entity)
            })
        });

        try_join(try_join_all(domain_writes), try_join_all(entity_writes)).await?;
        Ok(())
    }

    /// One MENTIONED_IN edge per annotation, even when an entity repeats.
    async fn relate_topics(&self, post: &CanonicalPost) -> Result<(), StoreError> {
        for annotation in &post.record.context_annotations {
            retry_on_conflict(self.retry, "relate_annotation", || {
                self.store.relate_annotation(&post.id, annotation)
            })
            .await?;
        }
        Ok(())
    }

    /// Each distinct hashtag counts once per post.
    async fn upsert_hashtags(&self, post: &CanonicalPost) -> Result<(), StoreError> {
        let hashtags = post.record.distinct_hashtags();
        trace!(post_id = post.id.as_str(), hashtags = ?hashtags, "Adding hashtags");
        for name in hashtags {
            retry_on_conflict(self.retry, "merge_hashtag", || {
                self.store.merge_hashtag(&post.id, name)
            })
            .await?;
        }
        Ok(())
    }
}
