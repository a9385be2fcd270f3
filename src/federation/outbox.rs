//! Publish pipeline
//!
//! ```text
//! ActivityRecord ─▶ render ─▶ build ─▶ resolve key ─▶ resolve targets
//!                                                          │
//!                           dispatch ◀─ sign per cc ◀──────┘
//! ```
//!
//! Everything up to dispatch is all-or-nothing: if rendering, building or
//! signing fails, no request leaves the process. After that, failures are
//! per recipient and only show up in the `PublishReport`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::activity::{MessageBuilder, address_to, local_actor_uri, local_key_id};
use super::delivery::{
    DeliveryResult, Dispatcher, OutboundDelivery, SequenceGate, SequenceTicket, Transport,
};
use super::keys::KeyProvider;
use super::recipients::resolve_targets;
use super::signature::{DEFAULT_SIGNED_HEADERS, Signer};
use crate::config::AppConfig;
use crate::data::{ActivityRecord, ApActivityType, Follower, PublishState, Renderable};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_PUBLISHED, PUBLISH_ABORTS};

/// `preferred_headers` key naming the headers to cover with an HTTP
/// Signature for that inbox. Never sent itself.
pub const SIGNED_HEADERS_KEY: &str = "signed-headers";

/// Outcome of one publish
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub record_id: String,
    /// `None` when the record never entered federation
    pub activity_type: Option<ApActivityType>,
    /// Record state after this publish
    pub state: PublishState,
    /// One entry per delivery target, in target order
    pub results: Vec<DeliveryResult>,
}

impl PublishReport {
    fn unpublished(record: &ActivityRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            activity_type: None,
            state: PublishState::Unpublished,
            results: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Federation outbox for one deployment
pub struct Outbox {
    builder: MessageBuilder,
    actor_path_prefix: String,
    http_signatures: bool,
    keys: Arc<dyn KeyProvider>,
    dispatcher: Dispatcher,
    gate: SequenceGate,
}

impl Outbox {
    pub fn new(
        config: &AppConfig,
        keys: Arc<dyn KeyProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            builder: MessageBuilder::new(config.root_url())
                .with_instance_name(config.federation.instance_name.clone()),
            actor_path_prefix: config.federation.actor_path_prefix.clone(),
            http_signatures: config.delivery.http_signatures,
            keys,
            dispatcher: Dispatcher::new(
                transport,
                config.delivery.max_concurrent,
                config.delivery.timeout(),
            ),
            gate: SequenceGate::new(),
        }
    }

    /// Public identity URL of a local user
    pub fn actor_uri(&self, username: &str) -> String {
        local_actor_uri(self.builder.root_url(), &self.actor_path_prefix, username)
    }

    /// Render the envelope for `record` without signing or sending it.
    pub fn preview(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        now: DateTime<Utc>,
    ) -> Result<Value, AppError> {
        self.builder
            .build(record, ap_type, &self.actor_uri(&record.actor), now)
    }

    /// Publish `record` as `ap_type` to `followers` and wait for every delivery.
    ///
    /// # Errors
    /// Render, build, key and signing failures abort the publish before any
    /// request is sent. Per-recipient failures are reported, not returned.
    pub async fn publish(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        followers: &[Follower],
    ) -> Result<PublishReport, AppError> {
        self.publish_at(record, ap_type, followers, Utc::now()).await
    }

    /// Same as `publish`, with a fixed clock for tombstones and signatures.
    pub async fn publish_at(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        followers: &[Follower],
        now: DateTime<Utc>,
    ) -> Result<PublishReport, AppError> {
        let Some(ticket) = self.admit(record) else {
            return Ok(PublishReport::unpublished(record));
        };
        self.run(ticket, record, ap_type, followers, now).await
    }

    /// Publish whatever a local save calls for: Create for new records,
    /// Update when the content changed since it was published, nothing
    /// otherwise.
    pub async fn publish_save(
        &self,
        record: &ActivityRecord,
        is_new: bool,
        followers: &[Follower],
    ) -> Result<Option<PublishReport>, AppError> {
        let content = &record.content;
        match ApActivityType::for_save(is_new, content.published(), content.updated()) {
            Some(ap_type) => self.publish(record, ap_type, followers).await.map(Some),
            None => {
                tracing::debug!(record = %record.id, "Save did not change content; nothing to federate");
                Ok(None)
            }
        }
    }

    /// Publish on a background task.
    ///
    /// The record's place in its per-object queue is taken before this
    /// returns, so successive calls for one object still go out in call
    /// order. Errors are logged; the handle yields the report if any.
    pub fn spawn_publish(
        self: &Arc<Self>,
        record: ActivityRecord,
        ap_type: ApActivityType,
        followers: Vec<Follower>,
    ) -> JoinHandle<Option<PublishReport>> {
        let ticket = self.admit(&record);
        let outbox = Arc::clone(self);

        tokio::spawn(async move {
            let Some(ticket) = ticket else {
                return Some(PublishReport::unpublished(&record));
            };
            match outbox
                .run(ticket, &record, ap_type, &followers, Utc::now())
                .await
            {
                Ok(report) => Some(report),
                Err(error) => {
                    tracing::error!(
                        record = %record.id,
                        error = %error,
                        "Background publish failed"
                    );
                    None
                }
            }
        })
    }

    /// Queue ticket for a federated record, `None` for records that never federate.
    fn admit(&self, record: &ActivityRecord) -> Option<SequenceTicket> {
        if !record.is_federated() {
            tracing::debug!(
                record = %record.id,
                activity_type = %record.activity_type,
                shared = record.shared,
                "Record is not federated"
            );
            return None;
        }
        let (kind, id) = record.content_ref();
        Some(self.gate.enqueue(&record.actor, &format!("{}/{}", kind, id)))
    }

    async fn run(
        &self,
        ticket: SequenceTicket,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        followers: &[Follower],
        now: DateTime<Utc>,
    ) -> Result<PublishReport, AppError> {
        let _guard = ticket.wait().await;

        let prepared = self.prepare(record, ap_type, followers, now).await;
        let (state, deliveries) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                PUBLISH_ABORTS.with_label_values(&[error.kind()]).inc();
                tracing::error!(
                    actor = %record.actor,
                    record = %record.id,
                    activity_type = %ap_type,
                    error = %error,
                    "Publish aborted before dispatch"
                );
                return Err(error);
            }
        };

        ACTIVITIES_PUBLISHED
            .with_label_values(&[ap_type.as_str()])
            .inc();
        let results = self.dispatcher.dispatch(deliveries).await;

        let report = PublishReport {
            record_id: record.id.clone(),
            activity_type: Some(ap_type),
            state,
            results,
        };
        tracing::info!(
            actor = %record.actor,
            record = %record.id,
            activity_type = %ap_type,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Published activity"
        );
        Ok(report)
    }

    /// Build, sign and address every request. Nothing is sent from here.
    async fn prepare(
        &self,
        record: &ActivityRecord,
        ap_type: ApActivityType,
        followers: &[Follower],
        now: DateTime<Utc>,
    ) -> Result<(PublishState, Vec<OutboundDelivery>), AppError> {
        let state = record.state.advance(ap_type)?;
        let actor_uri = self.actor_uri(&record.actor);
        tracing::info!(
            actor = %record.actor,
            record = %record.id,
            activity_type = %ap_type,
            followers = followers.len(),
            "Publishing activity"
        );

        let envelope = self.builder.build(record, ap_type, &actor_uri, now)?;
        let key = self.keys.resolve_signing_key(&record.actor).await?;
        let signer = Signer::new(local_key_id(&actor_uri), key);

        let targets = resolve_targets(&record.actor, followers);
        let mut signed_by_cc: HashMap<Vec<String>, Arc<Vec<u8>>> = HashMap::new();
        let mut deliveries = Vec::with_capacity(targets.len());

        for target in targets {
            let body = match signed_by_cc.get(&target.cc) {
                Some(body) => body.clone(),
                None => {
                    let addressed = address_to(&envelope, &target.cc);
                    let signed = signer.sign(&addressed, now)?;
                    let body = Arc::new(signed.body);
                    signed_by_cc.insert(target.cc.clone(), body.clone());
                    body
                }
            };

            let headers = self.request_headers(&signer, &target.inbox, target.headers, &body)?;
            deliveries.push(OutboundDelivery {
                inbox: target.inbox,
                headers,
                body,
            });
        }

        Ok((state, deliveries))
    }

    /// Recipient headers plus the HTTP Signature set, when enabled
    fn request_headers(
        &self,
        signer: &Signer,
        inbox: &str,
        mut headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<BTreeMap<String, String>, AppError> {
        let signed_headers = headers.remove(SIGNED_HEADERS_KEY);
        if !self.http_signatures {
            return Ok(headers);
        }

        let list = signed_headers.as_deref().unwrap_or(DEFAULT_SIGNED_HEADERS);
        let signature = signer.sign_request(inbox, body, list)?;
        headers.retain(|name, _| {
            !["date", "digest", "signature"]
                .iter()
                .any(|signed| name.eq_ignore_ascii_case(signed))
        });
        headers.insert("date".to_string(), signature.date);
        headers.insert("digest".to_string(), signature.digest);
        headers.insert("signature".to_string(), signature.signature);
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FederationConfig, ServerConfig};
    use crate::data::{ActivityKind, ContentMeta, ContentObject};
    use crate::federation::keys::{InMemoryKeyProvider, MockKeyProvider, generate_test_pem};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        posts: Mutex<Vec<(String, BTreeMap<String, String>, Vec<u8>)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn post(
            &self,
            inbox: &str,
            headers: &BTreeMap<String, String>,
            body: &[u8],
        ) -> Result<u16, AppError> {
            self.posts
                .lock()
                .unwrap()
                .push((inbox.to_string(), headers.clone(), body.to_vec()));
            Ok(202)
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                domain: "shelf.example".to_string(),
                protocol: "https".to_string(),
            },
            federation: FederationConfig::default(),
            delivery: Default::default(),
            keys: Default::default(),
            logging: Default::default(),
        }
    }

    fn record(shared: bool) -> ActivityRecord {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ActivityRecord {
            id: "42".to_string(),
            actor: "alice".to_string(),
            activity_type: ActivityKind::Say,
            timestamp: at,
            content: ContentObject::Say {
                meta: ContentMeta {
                    id: "7".to_string(),
                    owner: "alice".to_string(),
                    permalink: "https://shelf.example/u/alice/say/7".to_string(),
                    tags: Vec::new(),
                    published: at,
                    updated: at,
                },
                body: "hello".to_string(),
            },
            shared,
            state: PublishState::Created,
        }
    }

    fn followers() -> Vec<Follower> {
        vec![
            Follower::new("https://a.example/users/carol")
                .with_header(SIGNED_HEADERS_KEY, "(request-target) host date"),
            Follower::new("https://b.example/users/bob"),
        ]
    }

    #[tokio::test]
    async fn unshared_record_is_never_dispatched() {
        let transport = Arc::new(Recorder::default());
        let outbox = Outbox::new(
            &config(),
            Arc::new(InMemoryKeyProvider::new()),
            transport.clone(),
        );

        let report = outbox
            .publish(&record(false), ApActivityType::Create, &followers())
            .await
            .unwrap();

        assert_eq!(report.state, PublishState::Unpublished);
        assert!(report.activity_type.is_none());
        assert!(transport.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_key_aborts_without_requests() {
        let mut keys = MockKeyProvider::new();
        keys.expect_resolve_signing_key()
            .times(1)
            .returning(|actor| Err(AppError::Configuration(format!("No signing key for {}", actor))));
        let transport = Arc::new(Recorder::default());
        let outbox = Outbox::new(&config(), Arc::new(keys), transport.clone());

        let result = outbox
            .publish(&record(true), ApActivityType::Create, &followers())
            .await;

        assert!(matches!(result, Err(AppError::Configuration(_))));
        assert!(transport.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_transition_aborts_before_key_lookup() {
        let mut keys = MockKeyProvider::new();
        keys.expect_resolve_signing_key().never();
        let outbox = Outbox::new(&config(), Arc::new(keys), Arc::new(Recorder::default()));

        let result = outbox
            .publish(&record(true), ApActivityType::Update, &followers())
            .await;

        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn requests_carry_http_signatures_honouring_signed_headers() {
        let keys = InMemoryKeyProvider::new().with_key("alice", generate_test_pem());
        let transport = Arc::new(Recorder::default());
        let outbox = Outbox::new(&config(), Arc::new(keys), transport.clone());

        let report = outbox
            .publish(&record(true), ApActivityType::Create, &followers())
            .await
            .unwrap();
        assert_eq!(report.state, PublishState::Published);
        assert_eq!(report.succeeded(), 2);

        let posts = transport.posts.lock().unwrap();
        let carol = posts
            .iter()
            .find(|(inbox, _, _)| inbox == "https://a.example/users/carol/inbox")
            .unwrap();
        assert!(!carol.1.contains_key(SIGNED_HEADERS_KEY));
        assert!(carol.1["signature"].contains("headers=\"(request-target) host date\""));

        let bob = posts
            .iter()
            .find(|(inbox, _, _)| inbox == "https://b.example/users/bob/inbox")
            .unwrap();
        assert!(bob.1["signature"].contains("headers=\"(request-target) host date digest\""));
        assert!(bob.1["digest"].starts_with("SHA-256="));
        assert_ne!(carol.2, bob.2, "each cc is signed separately");
    }

    #[tokio::test]
    async fn signature_headers_replace_recipient_headers_in_any_case() {
        let keys = InMemoryKeyProvider::new().with_key("alice", generate_test_pem());
        let transport = Arc::new(Recorder::default());
        let outbox = Outbox::new(&config(), Arc::new(keys), transport.clone());
        let followers = vec![
            Follower::new("https://b.example/users/bob")
                .with_header("Date", "Mon, 01 Jan 2001 00:00:00 GMT")
                .with_header("SIGNATURE", "stale")
                .with_header("Digest", "SHA-256=stale")
                .with_header("x-instance", "kept"),
        ];

        outbox
            .publish(&record(true), ApActivityType::Create, &followers)
            .await
            .unwrap();

        let posts = transport.posts.lock().unwrap();
        let headers = &posts[0].1;
        let names: Vec<&str> = headers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["date", "digest", "signature", "x-instance"]);
        assert_ne!(headers["signature"], "stale");
        assert_ne!(headers["digest"], "SHA-256=stale");
    }

    #[tokio::test]
    async fn http_signatures_can_be_disabled() {
        let mut config = config();
        config.delivery.http_signatures = false;
        let keys = InMemoryKeyProvider::new().with_key("alice", generate_test_pem());
        let transport = Arc::new(Recorder::default());
        let outbox = Outbox::new(&config, Arc::new(keys), transport.clone());

        outbox
            .publish(&record(true), ApActivityType::Create, &followers())
            .await
            .unwrap();

        let posts = transport.posts.lock().unwrap();
        assert!(posts.iter().all(|(_, headers, _)| headers.is_empty()));
    }

    #[tokio::test]
    async fn unchanged_save_federates_nothing() {
        let outbox = Outbox::new(
            &config(),
            Arc::new(InMemoryKeyProvider::new()),
            Arc::new(Recorder::default()),
        );

        let report = outbox
            .publish_save(&record(true), false, &followers())
            .await
            .unwrap();
        assert!(report.is_none());
    }

    #[test]
    fn actor_uri_uses_configured_prefix() {
        let mut config = config();
        config.federation = FederationConfig {
            actor_path_prefix: "/users".to_string(),
            ..FederationConfig::default()
        };
        let outbox = Outbox::new(
            &config,
            Arc::new(InMemoryKeyProvider::new()),
            Arc::new(Recorder::default()),
        );
        assert_eq!(outbox.actor_uri("alice"), "https://shelf.example/users/alice");
    }
}
