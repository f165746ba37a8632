// Admission filter: decides whether a canonical post is worth projecting.
//
// Checks run cheapest first: language allow-list, excluded reference kinds,
// empty content, then the ordered predicate list. Predicates may hit the
// store, so they come last and the first one that says "ignore" wins.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use pulsegraph_common::{CanonicalPost, Config, ReferenceKinds};
use pulsegraph_graph::GraphStore;

/// Asynchronous ignore rule, typically one that queries the store.
#[async_trait]
pub trait IgnorePredicate: Send + Sync {
    fn name(&self) -> &str;

    async fn should_ignore(&self, post: &CanonicalPost) -> Result<bool>;
}

type SyncPredicate = Box<dyn Fn(&CanonicalPost) -> bool + Send + Sync>;

enum Predicate {
    Sync { name: String, check: SyncPredicate },
    Async(Arc<dyn IgnorePredicate>),
}

/// Why a post was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    Language(String),
    ReferenceKind(ReferenceKinds),
    NoContent,
    Predicate(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Language(lang) => write!(f, "language '{lang}' not allowed"),
            IgnoreReason::ReferenceKind(kinds) => write!(f, "excluded reference kind ({kinds})"),
            IgnoreReason::NoContent => f.write_str("no hashtags or topic annotations"),
            IgnoreReason::Predicate(name) => write!(f, "predicate '{name}'"),
        }
    }
}

pub struct PostFilter {
    allowed_languages: HashSet<String>,
    ignored_kinds: ReferenceKinds,
    require_content: bool,
    predicates: Vec<Predicate>,
}

impl Default for PostFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PostFilter {
    /// A filter that only drops posts with neither hashtags nor annotations.
    pub fn new() -> Self {
        Self {
            allowed_languages: HashSet::new(),
            ignored_kinds: ReferenceKinds::NONE,
            require_content: true,
            predicates: Vec::new(),
        }
    }

    /// Build the production filter from configuration.
    pub fn from_config(config: &Config, store: Arc<dyn GraphStore>) -> Self {
        let mut filter = Self::new()
            .allow_languages(config.allowed_languages.iter().cloned())
            .ignore_kinds(config.ignored_reference_kinds);
        if config.skip_stored_reposts {
            filter = filter.ignore_if_async(Arc::new(StoredOriginalPredicate::new(store)));
        }
        filter
    }

    /// Add languages to the allow-list. An empty allow-list admits every language.
    pub fn allow_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_languages
            .extend(languages.into_iter().map(|l| l.into().to_ascii_lowercase()));
        self
    }

    pub fn ignore_kinds(mut self, kinds: ReferenceKinds) -> Self {
        self.ignored_kinds |= kinds;
        self
    }

    /// Admit posts even when they carry nothing to project.
    pub fn keep_empty(mut self) -> Self {
        self.require_content = false;
        self
    }

    pub fn ignore_if<F>(mut self, name: &str, check: F) -> Self
    where
        F: Fn(&CanonicalPost) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Predicate::Sync {
            name: name.to_string(),
            check: Box::new(check),
        });
        self
    }

    pub fn ignore_if_async(mut self, predicate: Arc<dyn IgnorePredicate>) -> Self {
        self.predicates.push(Predicate::Async(predicate));
        self
    }

    pub async fn should_ignore(&self, post: &CanonicalPost) -> bool {
        self.verdict(post).await.is_some()
    }

    /// The first reason to ignore `post`, or `None` to admit it.
    ///
    /// A predicate that errors does not ignore the post; the error is logged
    /// and evaluation continues with the next rule.
    pub async fn verdict(&self, post: &CanonicalPost) -> Option<IgnoreReason> {
        let record = &post.record;

        if !self.allowed_languages.is_empty()
            && !self
                .allowed_languages
                .contains(&record.lang.to_ascii_lowercase())
        {
            return Some(IgnoreReason::Language(record.lang.clone()));
        }

        let excluded = self.ignored_kinds.intersects(record.reference_kinds());
        if excluded {
            return Some(IgnoreReason::ReferenceKind(self.ignored_kinds));
        }

        if self.require_content && !record.has_hashtags() && !record.has_annotations() {
            return Some(IgnoreReason::NoContent);
        }

        for predicate in &self.predicates {
            match predicate {
                Predicate::Sync { name, check } => {
                    if check(post) {
                        return Some(IgnoreReason::Predicate(name.clone()));
                    }
                }
                Predicate::Async(p) => match p.should_ignore(post).await {
                    Ok(true) => return Some(IgnoreReason::Predicate(p.name().to_string())),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(post_id = post.id.as_str(), predicate = p.name(), error = %e, "Filter predicate failed");
                    }
                },
            }
        }

        None
    }
}

/// Ignores a collapsed repost whose original is already in the graph, so
/// re-shares of a stored post never produce a second round of writes.
pub struct StoredOriginalPredicate {
    store: Arc<dyn GraphStore>,
}

impl StoredOriginalPredicate {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IgnorePredicate for StoredOriginalPredicate {
    fn name(&self) -> &str {
        "stored-original"
    }

    async fn should_ignore(&self, post: &CanonicalPost) -> Result<bool> {
        if !post.derived {
            return Ok(false);
        }
        Ok(self.store.post_exists(&post.id).await?)
    }
}
