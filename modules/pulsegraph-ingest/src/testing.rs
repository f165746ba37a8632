// Test doubles for the ingest pipeline: a scripted stream source and record
// builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream;

use pulsegraph_common::{
    AnnotationDomain, AnnotationEntity, ContextAnnotation, HashtagMention, PostEntities,
    PostEvent, PostRecord, Reference, ReferenceKind,
};

use crate::source::{EventStream, SourceError, StreamSource};

enum Session {
    Items(Vec<Result<PostEvent, SourceError>>),
    RefuseStart(SourceError),
}

/// A source that plays back queued sessions, one per `start`.
///
/// Once the script runs out a finite source reports an empty session, an
/// infinite one hands out a stream that never yields, like a quiet live
/// connection.
#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<VecDeque<Session>>,
    starts: AtomicU32,
    stops: AtomicU32,
    finite: bool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finite() -> Self {
        Self {
            finite: true,
            ..Self::default()
        }
    }

    /// Queue a session that yields `items` and then closes.
    pub fn session(self, items: Vec<Result<PostEvent, SourceError>>) -> Self {
        self.queue().push_back(Session::Items(items));
        self
    }

    /// Queue a session of plain events.
    pub fn events(self, events: Vec<PostEvent>) -> Self {
        self.session(events.into_iter().map(Ok).collect())
    }

    /// Queue a connection attempt that fails.
    pub fn refuse(self, error: SourceError) -> Self {
        self.queue().push_back(Session::RefuseStart(error));
        self
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self) -> Result<EventStream, SourceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let next = self.queue().pop_front();
        match next {
            Some(Session::Items(items)) => Ok(Box::pin(stream::iter(items))),
            Some(Session::RefuseStart(e)) => Err(e),
            None if self.finite => Ok(Box::pin(stream::empty::<Result<PostEvent, SourceError>>())),
            None => Ok(Box::pin(stream::pending::<Result<PostEvent, SourceError>>())),
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_finite(&self) -> bool {
        self.finite
    }
}

/// An English-style post with the given hashtags, authored by `author-{id}`.
pub fn post(id: &str, lang: &str, hashtags: &[&str]) -> PostRecord {
    PostRecord {
        id: id.to_string(),
        text: format!("post {id}"),
        lang: lang.to_string(),
        created_at: Utc.with_ymd_and_hms(2022, 5, 4, 10, 0, 0).unwrap(),
        author_id: Some(format!("author-{id}")),
        possibly_sensitive: false,
        references: Vec::new(),
        entities: PostEntities {
            hashtags: hashtags
                .iter()
                .map(|t| HashtagMention { tag: t.to_string() })
                .collect(),
        },
        context_annotations: Vec::new(),
        raw: None,
    }
}

pub fn with_reference(mut record: PostRecord, kind: ReferenceKind, target: &str) -> PostRecord {
    record.references.push(Reference {
        kind,
        id: target.to_string(),
    });
    record
}

pub fn with_annotation(mut record: PostRecord, domain_id: &str, entity_id: &str) -> PostRecord {
    record.context_annotations.push(ContextAnnotation {
        domain: AnnotationDomain {
            id: domain_id.to_string(),
            name: format!("domain {domain_id}"),
            description: format!("description of {domain_id}"),
        },
        entity: AnnotationEntity {
            id: entity_id.to_string(),
            name: format!("entity {entity_id}"),
        },
    });
    record
}

/// A repost of `target` that carries the original inline.
pub fn repost_event(id: &str, original: PostRecord) -> PostEvent {
    let wrapper = with_reference(post(id, &original.lang, &[]), ReferenceKind::Repost, &original.id);
    PostEvent {
        post: wrapper,
        included: vec![original],
    }
}
