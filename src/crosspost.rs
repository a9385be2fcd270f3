//! Crossposting to linked third-party accounts
//!
//! Runs after a local save has committed. Crosspost failures come back as
//! values and are logged by `crosspost_all`; they never reach the save path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::data::{ContentObject, Renderable};
use crate::metrics::CROSSPOSTS_TOTAL;

/// Mastodon's default status length
pub const MASTODON_MAX_CHARS: usize = 500;

const ELLIPSIS: char = '…';

/// Text and link to share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrosspostRequest {
    pub text: String,
    /// Link back to the local content
    pub permalink: String,
}

impl CrosspostRequest {
    pub fn new(text: impl Into<String>, permalink: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            permalink: permalink.into(),
        }
    }

    /// Request for a saved content object.
    ///
    /// Check-ins are announced as `I checked in to "<subject>" on <instance>`
    /// followed by the note, when there is one.
    pub fn from_content(content: &ContentObject, instance_name: &str) -> Self {
        let text = match content {
            ContentObject::CheckIn {
                subject: Some(subject),
                body,
                ..
            } => {
                let headline = format!("I checked in to \"{}\" on {}", subject, instance_name);
                if body.trim().is_empty() {
                    headline
                } else {
                    format!("{}\n\n{}", headline, body.trim())
                }
            }
            ContentObject::Post { title, body, .. } => {
                title.clone().unwrap_or_else(|| body.trim().to_string())
            }
            other => other.body().trim().to_string(),
        };
        Self::new(text, content.permalink())
    }
}

#[derive(Debug, Error)]
pub enum CrosspostError {
    #[error("Invalid account handle: {0}")]
    InvalidAccount(String),

    #[error("Request to {service} failed: {message}")]
    Http { service: String, message: String },

    #[error("{service} rejected status: HTTP {status}")]
    Rejected { service: String, status: u16 },
}

/// Where a crosspost ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrosspostReceipt {
    pub service: String,
    pub remote_id: Option<String>,
    pub url: Option<String>,
}

/// A linked external account
#[async_trait]
pub trait Crossposter: Send + Sync {
    /// Service name used in logs and metrics
    fn service(&self) -> &str;

    /// Longest status the service accepts, in characters
    fn max_chars(&self) -> usize;

    async fn post(&self, request: &CrosspostRequest) -> Result<CrosspostReceipt, CrosspostError>;
}

/// `text`, truncated with an ellipsis when needed, then a blank line and
/// the permalink, fitting in `max_chars`.
pub fn compose_status(text: &str, permalink: &str, max_chars: usize) -> String {
    let budget = max_chars.saturating_sub(permalink.chars().count() + 4);
    let text = text.trim_end();

    if text.chars().count() > budget {
        let mut truncated: String = text.chars().take(budget).collect();
        truncated.push(ELLIPSIS);
        format!("{}\n\n{}", truncated, permalink)
    } else {
        format!("{}\n\n{}", text, permalink)
    }
}

/// Posts statuses through the Mastodon client API
pub struct MastodonCrossposter {
    http_client: Arc<reqwest::Client>,
    instance_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MastodonStatus {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

impl MastodonCrossposter {
    /// # Arguments
    /// * `handle` - Account handle, `user@instance` or `@user@instance`
    /// * `access_token` - OAuth bearer token for the account
    pub fn new(
        http_client: Arc<reqwest::Client>,
        handle: &str,
        access_token: impl Into<String>,
    ) -> Result<Self, CrosspostError> {
        let instance = handle
            .trim_start_matches('@')
            .split_once('@')
            .map(|(_, instance)| instance.trim())
            .filter(|instance| !instance.is_empty() && !instance.contains('/'))
            .ok_or_else(|| CrosspostError::InvalidAccount(handle.to_string()))?;

        Ok(Self::with_instance_url(
            http_client,
            format!("https://{}", instance),
            access_token,
        ))
    }

    pub fn with_instance_url(
        http_client: Arc<reqwest::Client>,
        instance_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    fn http_error(&self, error: reqwest::Error) -> CrosspostError {
        CrosspostError::Http {
            service: self.service().to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl Crossposter for MastodonCrossposter {
    fn service(&self) -> &str {
        "mastodon"
    }

    fn max_chars(&self) -> usize {
        MASTODON_MAX_CHARS
    }

    async fn post(&self, request: &CrosspostRequest) -> Result<CrosspostReceipt, CrosspostError> {
        let status = compose_status(&request.text, &request.permalink, self.max_chars());
        let endpoint = format!("{}/api/v1/statuses", self.instance_url);

        let response = self
            .http_client
            .post(&endpoint)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        if !response.status().is_success() {
            return Err(CrosspostError::Rejected {
                service: self.service().to_string(),
                status: response.status().as_u16(),
            });
        }

        let created: MastodonStatus = response.json().await.map_err(|e| self.http_error(e))?;
        Ok(CrosspostReceipt {
            service: self.service().to_string(),
            remote_id: Some(created.id),
            url: created.url,
        })
    }
}

/// Run every linked crossposter, logging failures.
///
/// Always returns normally; the per-service outcomes are handed back for
/// callers that want to show them.
pub async fn crosspost_all(
    crossposters: &[Arc<dyn Crossposter>],
    request: &CrosspostRequest,
) -> Vec<Result<CrosspostReceipt, CrosspostError>> {
    let attempts = crossposters.iter().map(|crossposter| async move {
        let outcome = crossposter.post(request).await;
        match &outcome {
            Ok(receipt) => {
                CROSSPOSTS_TOTAL
                    .with_label_values(&[crossposter.service(), "success"])
                    .inc();
                tracing::info!(
                    service = crossposter.service(),
                    remote_id = ?receipt.remote_id,
                    "Crossposted"
                );
            }
            Err(error) => {
                CROSSPOSTS_TOTAL
                    .with_label_values(&[crossposter.service(), "failure"])
                    .inc();
                tracing::warn!(
                    service = crossposter.service(),
                    permalink = %request.permalink,
                    error = %error,
                    "Crosspost failed"
                );
            }
        }
        outcome
    });

    futures::future::join_all(attempts).await
}
