//! Data models
//!
//! Rust structs for the records the outbox reads: activity records, the
//! content objects they point at, and remote followers. Persistence lives
//! outside this crate; these are read-only snapshots handed in per publish.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Activity kinds
// =============================================================================

/// Medium of a check-in (`read-check-in`, `watch-check-in`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInMedium {
    Read,
    Watch,
    Listen,
    Game,
    Play,
    Visit,
}

impl CheckInMedium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Watch => "watch",
            Self::Listen => "listen",
            Self::Game => "game",
            Self::Play => "play",
            Self::Visit => "visit",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "watch" => Some(Self::Watch),
            "listen" => Some(Self::Listen),
            "game" => Some(Self::Game),
            "play" => Some(Self::Play),
            "visit" => Some(Self::Visit),
            _ => None,
        }
    }
}

/// Local action that produced an activity record
///
/// Parsed from the platform's activity-type strings. Anything not listed
/// here is a configuration error, never a best-guess rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActivityKind {
    Say,
    Post,
    Pin,
    Repost,
    CheckIn(CheckInMedium),
    Follow,
}

impl ActivityKind {
    /// Whether records of this kind are ever sent to followers.
    ///
    /// Follows are recorded in the local feed only.
    pub fn is_federated(&self) -> bool {
        !matches!(self, Self::Follow)
    }
}

impl FromStr for ActivityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "say" => Ok(Self::Say),
            "post" => Ok(Self::Post),
            "pin" => Ok(Self::Pin),
            "repost" => Ok(Self::Repost),
            "follow" => Ok(Self::Follow),
            other => other
                .strip_suffix("-check-in")
                .and_then(CheckInMedium::from_prefix)
                .map(Self::CheckIn)
                .ok_or_else(|| {
                    AppError::Configuration(format!("Unknown activity type: {}", other))
                }),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Say => f.write_str("say"),
            Self::Post => f.write_str("post"),
            Self::Pin => f.write_str("pin"),
            Self::Repost => f.write_str("repost"),
            Self::Follow => f.write_str("follow"),
            Self::CheckIn(medium) => write!(f, "{}-check-in", medium.as_str()),
        }
    }
}

impl TryFrom<String> for ActivityKind {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActivityKind> for String {
    fn from(kind: ActivityKind) -> Self {
        kind.to_string()
    }
}

/// ActivityStreams verb wrapped around a content object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApActivityType {
    Create,
    Update,
    Delete,
}

impl ApActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }

    /// Verb to federate after a local save, if any.
    ///
    /// New records are created; existing records are updated only when the
    /// content was modified after it was first published.
    pub fn for_save(
        is_new: bool,
        published: DateTime<Utc>,
        updated: DateTime<Utc>,
    ) -> Option<Self> {
        if is_new {
            Some(Self::Create)
        } else if updated > published {
            Some(Self::Update)
        } else {
            None
        }
    }
}

impl fmt::Display for ApActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApActivityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Update" => Ok(Self::Update),
            "Delete" => Ok(Self::Delete),
            other => Err(AppError::Configuration(format!(
                "Unsupported outbox activity type: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Content objects
// =============================================================================

/// Fields every content variant shares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMeta {
    pub id: String,
    /// Username of the owning local user
    pub owner: String,
    /// Canonical absolute URL of the object
    pub permalink: String,
    /// Explicit tags; hashtags in the body are used when empty
    #[serde(default)]
    pub tags: Vec<String>,
    pub published: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Content an activity record points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentObject {
    Say {
        #[serde(flatten)]
        meta: ContentMeta,
        body: String,
    },
    Repost {
        #[serde(flatten)]
        meta: ContentMeta,
        body: String,
    },
    Post {
        #[serde(flatten)]
        meta: ContentMeta,
        title: Option<String>,
        #[serde(default)]
        body: String,
    },
    Pin {
        #[serde(flatten)]
        meta: ContentMeta,
        title: Option<String>,
        /// The pinned external URL
        url: Option<String>,
        #[serde(default)]
        body: String,
    },
    CheckIn {
        #[serde(flatten)]
        meta: ContentMeta,
        medium: CheckInMedium,
        /// Name of the book, film, album, game or place
        subject: Option<String>,
        body: String,
    },
}

/// Read-only surface the renderer consumes
pub trait Renderable {
    fn title(&self) -> Option<&str>;
    fn body(&self) -> &str;
    fn permalink(&self) -> &str;
    fn tags(&self) -> Vec<String>;
    fn published(&self) -> DateTime<Utc>;
    fn updated(&self) -> DateTime<Utc>;
    fn owner(&self) -> &str;
}

impl ContentObject {
    pub fn meta(&self) -> &ContentMeta {
        match self {
            Self::Say { meta, .. }
            | Self::Repost { meta, .. }
            | Self::Post { meta, .. }
            | Self::Pin { meta, .. }
            | Self::CheckIn { meta, .. } => meta,
        }
    }

    /// Variant name, the `content_kind` half of the record's reference
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Say { .. } => "say",
            Self::Repost { .. } => "repost",
            Self::Post { .. } => "post",
            Self::Pin { .. } => "pin",
            Self::CheckIn { .. } => "check_in",
        }
    }
}

impl Renderable for ContentObject {
    fn title(&self) -> Option<&str> {
        match self {
            Self::Post { title, .. } | Self::Pin { title, .. } => title.as_deref(),
            Self::CheckIn { subject, .. } => subject.as_deref(),
            Self::Say { .. } | Self::Repost { .. } => None,
        }
    }

    fn body(&self) -> &str {
        match self {
            Self::Say { body, .. }
            | Self::Repost { body, .. }
            | Self::Post { body, .. }
            | Self::Pin { body, .. }
            | Self::CheckIn { body, .. } => body,
        }
    }

    fn permalink(&self) -> &str {
        &self.meta().permalink
    }

    fn tags(&self) -> Vec<String> {
        let meta = self.meta();
        if meta.tags.is_empty() {
            extract_hashtags(self.body())
        } else {
            meta.tags.clone()
        }
    }

    fn published(&self) -> DateTime<Utc> {
        self.meta().published
    }

    fn updated(&self) -> DateTime<Utc> {
        self.meta().updated
    }

    fn owner(&self) -> &str {
        &self.meta().owner
    }
}

/// Collect `#hashtag` names from text, first occurrence order, case-insensitively unique.
///
/// A `#` only starts a tag at the beginning of the text or after whitespace
/// or opening punctuation, so URL fragments are skipped.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let mut previous: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        let starts_tag = c == '#'
            && previous.is_none_or(|p| p.is_whitespace() || matches!(p, '(' | '[' | ',' | ';'));
        previous = Some(c);
        if !starts_tag {
            continue;
        }

        let start = index + c.len_utf8();
        let mut end = start;
        while let Some(&(next_index, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' || next == '-' {
                end = next_index + next.len_utf8();
                previous = Some(next);
                chars.next();
            } else {
                break;
            }
        }

        let tag = text[start..end].trim_end_matches('-');
        if tag.is_empty() || tag.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            tags.push(tag.to_string());
        }
    }

    tags
}

// =============================================================================
// Activity records
// =============================================================================

/// Lifecycle of an activity record in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Created,
    Published,
    Updated,
    Deleted,
    /// Sharing was off; never federated
    Unpublished,
}

impl PublishState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Unpublished)
    }

    /// State after `activity` has been dispatched from `self`.
    ///
    /// # Errors
    /// `Configuration` when the transition is not allowed, e.g. an Update
    /// before the Create, or anything after a terminal state.
    pub fn advance(self, activity: ApActivityType) -> Result<Self, AppError> {
        use ApActivityType::*;

        match (self, activity) {
            (Self::Created, Create) => Ok(Self::Published),
            (Self::Published | Self::Updated, Update) => Ok(Self::Updated),
            (Self::Created | Self::Published | Self::Updated, Delete) => Ok(Self::Deleted),
            (state, activity) => Err(AppError::Configuration(format!(
                "Cannot federate {} from state {:?}",
                activity, state
            ))),
        }
    }
}

/// A trackable local action with sharing information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    /// Username of the acting local user
    pub actor: String,
    pub activity_type: ActivityKind,
    pub timestamp: DateTime<Utc>,
    pub content: ContentObject,
    /// Share to feed / federate
    #[serde(default = "default_shared")]
    pub shared: bool,
    #[serde(default = "default_state")]
    pub state: PublishState,
}

fn default_shared() -> bool {
    true
}

fn default_state() -> PublishState {
    PublishState::Created
}

impl ActivityRecord {
    /// Create a fresh record for a shareable action.
    pub fn new(actor: impl Into<String>, activity_type: ActivityKind, content: ContentObject) -> Self {
        Self {
            id: EntityId::new().0,
            actor: actor.into(),
            activity_type,
            timestamp: Utc::now(),
            content,
            shared: true,
            state: PublishState::Created,
        }
    }

    /// `(content_kind, content_id)` reference to the content object
    pub fn content_ref(&self) -> (&'static str, &str) {
        (self.content.kind_name(), &self.content.meta().id)
    }

    /// Whether this record enters the outbox at all
    pub fn is_federated(&self) -> bool {
        self.shared && self.activity_type.is_federated()
    }

    /// Parse a record from JSON.
    ///
    /// # Errors
    /// - `Configuration` for an unknown `activity_type`
    /// - `Serialization` for any other malformed input
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if let Some(kind) = value.get("activity_type").and_then(serde_json::Value::as_str) {
            kind.parse::<ActivityKind>()?;
        }
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Followers
// =============================================================================

/// A remote actor following a local user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follower {
    /// Follower actor URI (also the per-recipient `cc` value)
    pub actor_uri: String,
    /// Personal inbox; `<actor_uri>/inbox` when absent
    #[serde(default)]
    pub inbox_uri: Option<String>,
    /// Server-wide shared inbox
    #[serde(default)]
    pub shared_inbox_uri: Option<String>,
    /// Opaque headers the remote server asked for
    #[serde(default)]
    pub preferred_headers: BTreeMap<String, String>,
}

impl Follower {
    pub fn new(actor_uri: impl Into<String>) -> Self {
        Self {
            actor_uri: actor_uri.into(),
            inbox_uri: None,
            shared_inbox_uri: None,
            preferred_headers: BTreeMap::new(),
        }
    }

    pub fn with_inbox(mut self, inbox_uri: impl Into<String>) -> Self {
        self.inbox_uri = Some(inbox_uri.into());
        self
    }

    pub fn with_shared_inbox(mut self, shared_inbox_uri: impl Into<String>) -> Self {
        self.shared_inbox_uri = Some(shared_inbox_uri.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.preferred_headers.insert(name.into(), value.into());
        self
    }

    /// Personal inbox URL for this follower
    pub fn personal_inbox(&self) -> String {
        match self.inbox_uri.as_deref().filter(|uri| !uri.is_empty()) {
            Some(inbox) => inbox.to_string(),
            None => format!("{}/inbox", self.actor_uri.trim_end_matches('/')),
        }
    }

    /// Shared inbox URL, ignoring blank values
    pub fn shared_inbox(&self) -> Option<&str> {
        self.shared_inbox_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
    }
}
