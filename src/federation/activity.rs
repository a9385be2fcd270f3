//! Outbox message building
//!
//! Wraps a rendered activity record in an ActivityStreams Create, Update or
//! Delete envelope. Output is a plain `serde_json::Value`; byte stability
//! comes from `canonical_json`, so identical inputs always serialize to
//! identical bytes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::render::{RenderedContent, render};
use crate::data::{ActivityRecord, ApActivityType, Renderable};
use crate::error::AppError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Local actor URI, e.g. `https://shelf.example/u/alice`
pub fn local_actor_uri(root_url: &str, actor_path_prefix: &str, username: &str) -> String {
    format!(
        "{}{}/{}",
        root_url.trim_end_matches('/'),
        actor_path_prefix.trim_end_matches('/'),
        username
    )
}

/// Public key URL of a local actor
pub fn local_key_id(actor_uri: &str) -> String {
    format!("{}#main-key", actor_uri.trim_end_matches('/'))
}

/// Followers collection of a local actor
pub fn local_followers_uri(actor_uri: &str) -> String {
    format!("{}/followers", actor_uri.trim_end_matches('/'))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds outbox envelopes for one deployment
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    root_url: String,
    instance_name: String,
}

impl MessageBuilder {
    /// # Arguments
    /// * `root_url` - Deployment root, e.g. `https://shelf.example`
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into().trim_end_matches('/').to_string(),
            instance_name: "Shelfpost".to_string(),
        }
    }

    pub fn with_instance_name(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = instance_name.into();
        self
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    /// Render and wrap `record` in an `ap_type` envelope.
    ///
    /// # Arguments
    /// * `record` - Activity record with its content object
    /// * `ap_type` - Create, Update or Delete
    /// * `actor_uri` - Public identity URL of the acting user
    /// * `now` - Deletion time for tombstones
    ///
    /// # Errors
    /// Rendering errors (`Configuration`, `Serialization`) pass through.
    pub fn build(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        actor_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<Value, AppError> {
        let rendered = render(record.activity_type, &record.content)?;
        Ok(self.envelope(record, ap_type, actor_uri, &rendered, now))
    }

    fn envelope(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        actor_uri: &str,
        rendered: &RenderedContent,
        now: DateTime<Utc>,
    ) -> Value {
        let content = &record.content;
        let published = timestamp(record.timestamp);
        let permalink = rendered.permalink.as_str();

        let mut object = json!({
            "id": permalink,
            "type": "Note",
            "url": permalink,
            "atomUri": permalink,
            "attributedTo": actor_uri,
            "actor": actor_uri,
            "attachment": [],
            "content": rendered.html,
            "contentMap": { "en": rendered.html },
            "source": { "content": rendered.markdown, "mediaType": "text/markdown" },
            "context": {
                "https://www.w3.org/ns/activitystreams#partOf": {
                    "https://www.w3.org/ns/activitystreams#name": self.instance_name
                }
            },
            "conversation": self.conversation_id(record),
            "inReplyTo": null,
            "published": published,
            "sensitive": false,
            "summary": "",
            "tag": rendered.tags,
            "to": [PUBLIC_AUDIENCE],
        });

        match ap_type {
            ApActivityType::Create => {}
            ApActivityType::Update => {
                object["updated"] = json!(timestamp(content.updated()));
            }
            ApActivityType::Delete => {
                if let Some(fields) = object.as_object_mut() {
                    for key in ["content", "contentMap", "source", "attachment", "summary"] {
                        fields.remove(key);
                    }
                }
                object["type"] = json!("Tombstone");
                object["formerType"] = json!("Note");
                object["updated"] = json!(timestamp(content.updated()));
                object["deleted"] = json!(timestamp(now));
            }
        }

        json!({
            "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
            "id": self.activity_id(record, ap_type),
            "type": ap_type.as_str(),
            "actor": actor_uri,
            "to": [PUBLIC_AUDIENCE],
            "object": object,
            "published": published,
        })
    }

    /// Activity id, distinct per verb (and per edit for updates)
    fn activity_id(&self, record: &ActivityRecord, ap_type: ApActivityType) -> String {
        let permalink = record.content.permalink().trim_end_matches('/');
        match ap_type {
            ApActivityType::Create => format!("{}#create", permalink),
            ApActivityType::Update => format!(
                "{}#update-{}",
                permalink,
                record.content.updated().timestamp()
            ),
            ApActivityType::Delete => format!("{}#delete", permalink),
        }
    }

    /// `tag:<domain>,<date>:objectId=<record id>:objectType=Conversation`
    fn conversation_id(&self, record: &ActivityRecord) -> String {
        let domain = url::Url::parse(&self.root_url)
            .ok()
            .and_then(|url| {
                url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                })
            })
            .unwrap_or_else(|| self.root_url.clone());

        format!(
            "tag:{},{}:objectId={}:objectType=Conversation",
            domain,
            record.timestamp.format("%Y-%m-%d"),
            record.id
        )
    }
}

/// Address an envelope to one delivery target.
///
/// Sets the top-level and object `cc` to the recipients' personal URIs.
pub fn address_to(envelope: &Value, cc: &[String]) -> Value {
    let mut addressed = envelope.clone();
    addressed["cc"] = json!(cc);
    if addressed.get("object").is_some_and(Value::is_object) {
        addressed["object"]["cc"] = json!(cc);
    }
    addressed
}
