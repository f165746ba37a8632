use std::collections::HashSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::PulseError;

// ---------------------------------------------------------------------------
// References between posts
// ---------------------------------------------------------------------------

/// How one post points at another. Wire names follow the sampled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    #[serde(rename = "retweeted")]
    Repost,
    #[serde(rename = "replied_to")]
    Reply,
    #[serde(rename = "quoted")]
    Quote,
    /// A reference type this pipeline does not know about. Belongs to no mask.
    #[serde(other)]
    Unknown,
}

impl ReferenceKind {
    fn bit(self) -> u8 {
        match self {
            ReferenceKind::Repost => 1 << 1,
            ReferenceKind::Reply => 1 << 2,
            ReferenceKind::Quote => 1 << 3,
            ReferenceKind::Unknown => 0,
        }
    }
}

impl FromStr for ReferenceKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "repost" | "retweet" | "retweeted" => Ok(ReferenceKind::Repost),
            "reply" | "replied_to" => Ok(ReferenceKind::Reply),
            "quote" | "quoted" => Ok(ReferenceKind::Quote),
            other => Err(PulseError::Config(format!("unknown reference kind '{other}'"))),
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReferenceKind::Repost => "repost",
            ReferenceKind::Reply => "reply",
            ReferenceKind::Quote => "quote",
            ReferenceKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Bit mask over [`ReferenceKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReferenceKinds(u8);

impl ReferenceKinds {
    pub const NONE: Self = Self(0);
    pub const REPOST: Self = Self(1 << 1);
    pub const REPLY: Self = Self(1 << 2);
    pub const QUOTE: Self = Self(1 << 3);

    pub fn of(kind: ReferenceKind) -> Self {
        Self(kind.bit())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: ReferenceKind) -> bool {
        let bit = kind.bit();
        bit != 0 && self.0 & bit == bit
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a comma-separated list such as `repost,quote`. Empty input is `NONE`.
    pub fn parse_list(s: &str) -> Result<Self, PulseError> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ReferenceKind::from_str)
            .collect()
    }
}

impl BitOr for ReferenceKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReferenceKinds {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<ReferenceKind> for ReferenceKinds {
    fn from(kind: ReferenceKind) -> Self {
        Self::of(kind)
    }
}

impl FromIterator<ReferenceKind> for ReferenceKinds {
    fn from_iter<I: IntoIterator<Item = ReferenceKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::NONE, |acc, kind| acc | Self::of(kind))
    }
}

impl fmt::Display for ReferenceKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = [
            ReferenceKind::Repost,
            ReferenceKind::Reply,
            ReferenceKind::Quote,
        ]
        .into_iter()
        .filter(|k| self.contains(*k))
        .map(|k| k.to_string())
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// A reference annotation on a raw post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub id: String,
}

// ---------------------------------------------------------------------------
// Raw records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagMention {
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<HashtagMention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationDomain {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationEntity {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A (domain, entity) pair describing what a post is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAnnotation {
    pub domain: AnnotationDomain,
    pub entity: AnnotationEntity,
}

impl ContextAnnotation {
    pub fn domain_node(&self) -> DomainNode {
        DomainNode {
            id: self.domain.id.clone(),
            name: self.domain.name.clone(),
            description: self.domain.description.clone(),
        }
    }

    pub fn entity_node(&self) -> EntityNode {
        EntityNode {
            id: self.entity.id.clone(),
            name: self.entity.name.clone(),
        }
    }
}

/// A post as delivered by the stream, decoded into the fields the pipeline
/// reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lang: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default)]
    pub possibly_sensitive: bool,
    #[serde(
        default,
        rename = "referenced_tweets",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub entities: PostEntities,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_annotations: Vec<ContextAnnotation>,
    /// The wire JSON this record was decoded from, undeclared fields
    /// included. This is what gets mirrored when present.
    #[serde(skip)]
    pub raw: Option<serde_json::Value>,
}

impl PostRecord {
    /// Reject records missing the fields the pipeline keys on.
    pub fn validate(&self) -> Result<(), PulseError> {
        if self.id.trim().is_empty() {
            return Err(PulseError::MalformedRecord("post without id".into()));
        }
        if let Some(r) = self.references.iter().find(|r| r.id.trim().is_empty()) {
            return Err(PulseError::MalformedRecord(format!(
                "post {} has a {} reference without target id",
                self.id, r.kind
            )));
        }
        if let Some(a) = self
            .context_annotations
            .iter()
            .find(|a| a.domain.id.is_empty() || a.entity.id.is_empty())
        {
            return Err(PulseError::MalformedRecord(format!(
                "post {} has an annotation without ids (domain '{}', entity '{}')",
                self.id, a.domain.id, a.entity.id
            )));
        }
        Ok(())
    }

    pub fn reference_kinds(&self) -> ReferenceKinds {
        self.references.iter().map(|r| r.kind).collect()
    }

    /// Target id of the first repost reference, if any.
    pub fn repost_target(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|r| r.kind == ReferenceKind::Repost)
            .map(|r| r.id.as_str())
    }

    pub fn is_repost(&self) -> bool {
        self.repost_target().is_some()
    }

    /// Hashtag texts in first-seen order, each at most once.
    pub fn distinct_hashtags(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entities
            .hashtags
            .iter()
            .map(|h| h.tag.as_str())
            .filter(|tag| !tag.is_empty() && seen.insert(*tag))
            .collect()
    }

    pub fn has_hashtags(&self) -> bool {
        self.entities.hashtags.iter().any(|h| !h.tag.is_empty())
    }

    pub fn has_annotations(&self) -> bool {
        !self.context_annotations.is_empty()
    }

    pub fn created_on(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    /// Decode a wire record and keep the JSON it came from.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut record: PostRecord = serde_json::from_value(raw.clone())?;
        record.raw = Some(raw);
        Ok(record)
    }

    /// The document to mirror: the wire JSON when known, otherwise the
    /// decoded fields re-encoded.
    pub fn to_document(&self) -> Result<serde_json::Value, serde_json::Error> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => serde_json::to_value(self),
        }
    }
}

/// One arrival on the stream: the primary post plus any referenced posts the
/// source expanded inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEvent {
    pub post: PostRecord,
    #[serde(default)]
    pub included: Vec<PostRecord>,
}

impl PostEvent {
    pub fn single(post: PostRecord) -> Self {
        Self {
            post,
            included: Vec::new(),
        }
    }

    pub fn included(&self, id: &str) -> Option<&PostRecord> {
        self.included.iter().find(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Canonical identity
// ---------------------------------------------------------------------------

/// A record after repost collapsing: `id` is the identity it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPost {
    pub id: String,
    /// Cleared when the identity was taken over from a repost.
    pub author_id: Option<String>,
    pub derived: bool,
    pub record: PostRecord,
}

impl CanonicalPost {
    /// The node this post projects to. A derived post carries the repost's
    /// own creation date, the original's is never fetched.
    pub fn to_node(&self) -> PostNode {
        PostNode {
            id: self.id.clone(),
            text: self.record.text.clone(),
            lang: self.record.lang.clone(),
            date: self.record.created_on(),
            sensitive: self.record.possibly_sensitive,
            author_id: self.author_id.clone(),
            derived: self.derived,
        }
    }

    /// Distinct domains referenced by the annotations, first sighting wins.
    pub fn domains(&self) -> Vec<DomainNode> {
        let mut seen = HashSet::new();
        self.record
            .context_annotations
            .iter()
            .filter(|a| seen.insert(a.domain.id.as_str()))
            .map(ContextAnnotation::domain_node)
            .collect()
    }

    /// Distinct entities referenced by the annotations, keyed by taxonomy id.
    pub fn entities(&self) -> Vec<EntityNode> {
        let mut seen = HashSet::new();
        self.record
            .context_annotations
            .iter()
            .filter(|a| seen.insert(a.entity.id.as_str()))
            .map(ContextAnnotation::entity_node)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Graph node values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostNode {
    pub id: String,
    pub text: String,
    pub lang: String,
    pub date: NaiveDate,
    pub sensitive: bool,
    pub author_id: Option<String>,
    pub derived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagNode {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainNode {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: String,
    pub name: String,
}
