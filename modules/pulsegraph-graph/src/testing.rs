// In-memory GraphStore for tests.
//
// Follows the Cypher semantics of GraphWriter: MERGE ... ON CREATE only sets
// attributes once, relationship writes are no-ops when a MATCH finds nothing,
// and Post ids behave like a uniqueness constraint. Conflicts can be scripted
// per operation to exercise retry paths.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use pulsegraph_common::{ContextAnnotation, DomainNode, EntityNode, PostNode};

use crate::{GraphStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    PostExists,
    CreatePost,
    MergeDomain,
    MergeEntity,
    RelateAnnotation,
    MergeHashtag,
}

#[derive(Default)]
struct MemoryGraph {
    posts: HashMap<String, PostNode>,
    hashtags: HashMap<String, i64>,
    domains: HashMap<String, DomainNode>,
    entities: HashMap<String, EntityNode>,
    /// (hashtag, post)
    used_in: Vec<(String, String)>,
    /// (entity, post)
    mentioned_in: Vec<(String, String)>,
    /// (entity, domain)
    has_domain: HashSet<(String, String)>,
}

#[derive(Default)]
struct Script {
    conflicts: HashMap<StoreOp, u32>,
    unavailable: HashSet<StoreOp>,
    calls: HashMap<StoreOp, u32>,
    hide_existing_posts: bool,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    graph: Mutex<MemoryGraph>,
    script: Mutex<Script>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls of `op` fail with a transient conflict.
    pub fn inject_conflicts(&self, op: StoreOp, n: u32) {
        *self.script().conflicts.entry(op).or_default() += n;
    }

    /// Every call of `op` fails as if the store were down.
    pub fn make_unavailable(&self, op: StoreOp) {
        self.script().unavailable.insert(op);
    }

    /// `post_exists` always answers false, so duplicates reach `create_post`
    /// the way two racing writers would.
    pub fn hide_existing_posts(&self) {
        self.script().hide_existing_posts = true;
    }

    /// How many times `op` was invoked, failed attempts included.
    pub fn calls(&self, op: StoreOp) -> u32 {
        self.script().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn post(&self, id: &str) -> Option<PostNode> {
        self.graph().posts.get(id).cloned()
    }

    pub fn post_count(&self) -> usize {
        self.graph().posts.len()
    }

    pub fn post_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graph().posts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn hashtag_count(&self, name: &str) -> Option<i64> {
        self.graph().hashtags.get(name).copied()
    }

    pub fn domain(&self, id: &str) -> Option<DomainNode> {
        self.graph().domains.get(id).cloned()
    }

    pub fn entity(&self, id: &str) -> Option<EntityNode> {
        self.graph().entities.get(id).cloned()
    }

    pub fn used_in_edges(&self, hashtag: &str, post_id: &str) -> usize {
        self.graph()
            .used_in
            .iter()
            .filter(|(h, p)| h == hashtag && p == post_id)
            .count()
    }

    pub fn mentioned_in_edges(&self, entity_id: &str, post_id: &str) -> usize {
        self.graph()
            .mentioned_in
            .iter()
            .filter(|(e, p)| e == entity_id && p == post_id)
            .count()
    }

    pub fn has_domain_edge(&self, entity_id: &str, domain_id: &str) -> bool {
        self.graph()
            .has_domain
            .contains(&(entity_id.to_string(), domain_id.to_string()))
    }

    fn graph(&self) -> std::sync::MutexGuard<'_, MemoryGraph> {
        self.graph.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Count the call and apply any scripted failure.
    fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut script = self.script();
        *script.calls.entry(op).or_default() += 1;
        if script.unavailable.contains(&op) {
            return Err(StoreError::Unavailable(format!("{op:?}: store is down")));
        }
        if let Some(remaining) = script.conflicts.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Conflict(format!("{op:?}: deadlock detected")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn post_exists(&self, id: &str) -> Result<bool, StoreError> {
        self.enter(StoreOp::PostExists)?;
        if self.script().hide_existing_posts {
            return Ok(false);
        }
        Ok(self.graph().posts.contains_key(id))
    }

    async fn create_post(&self, post: &PostNode) -> Result<(), StoreError> {
        self.enter(StoreOp::CreatePost)?;
        let mut graph = self.graph();
        if graph.posts.contains_key(&post.id) {
            return Err(StoreError::Duplicate(format!(
                "Node already exists with label `Post` and property `id` = '{}'",
                post.id
            )));
        }
        graph.posts.insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn merge_domain(&self, domain: &DomainNode) -> Result<(), StoreError> {
        self.enter(StoreOp::MergeDomain)?;
        self.graph()
            .domains
            .entry(domain.id.clone())
            .or_insert_with(|| domain.clone());
        Ok(())
    }

    async fn merge_entity(&self, entity: &EntityNode) -> Result<(), StoreError> {
        self.enter(StoreOp::MergeEntity)?;
        self.graph()
            .entities
            .entry(entity.id.clone())
            .or_insert_with(|| entity.clone());
        Ok(())
    }

    async fn relate_annotation(
        &self,
        post_id: &str,
        annotation: &ContextAnnotation,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::RelateAnnotation)?;
        let mut graph = self.graph();
        let entity_id = annotation.entity.id.clone();
        let domain_id = annotation.domain.id.clone();
        if !graph.posts.contains_key(post_id)
            || !graph.domains.contains_key(&domain_id)
            || !graph.entities.contains_key(&entity_id)
        {
            return Ok(());
        }
        graph
            .mentioned_in
            .push((entity_id.clone(), post_id.to_string()));
        graph.has_domain.insert((entity_id, domain_id));
        Ok(())
    }

    async fn merge_hashtag(&self, post_id: &str, name: &str) -> Result<(), StoreError> {
        self.enter(StoreOp::MergeHashtag)?;
        let mut graph = self.graph();
        if !graph.posts.contains_key(post_id) {
            return Ok(());
        }
        *graph.hashtags.entry(name.to_string()).or_insert(0) += 1;
        graph.used_in.push((name.to_string(), post_id.to_string()));
        Ok(())
    }
}
