//! Common test utilities for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use shelfpost::config::{
    AppConfig, DeliveryConfig, FederationConfig, KeysConfig, LoggingConfig, ServerConfig,
};
use shelfpost::data::{ActivityKind, ActivityRecord, ContentMeta, ContentObject, Follower};
use shelfpost::error::AppError;
use shelfpost::federation::{SigningKey, Transport};
use tempfile::TempDir;

pub const ROOT_URL: &str = "https://shelf.example";
pub const PERMALINK: &str = "https://shelf.example/u/alice/say/7";

/// One request seen by `RecordingTransport`
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub inbox: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedPost {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Fake transport recording every attempt
#[derive(Default)]
pub struct RecordingTransport {
    pub posts: Mutex<Vec<RecordedPost>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt to `inbox` errors
    pub fn failing(mut self, inbox: &str) -> Self {
        self.failing.insert(inbox.to_string());
        self
    }

    /// Every attempt sleeps first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }

    pub fn inboxes(&self) -> Vec<String> {
        self.posts().into_iter().map(|post| post.inbox).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(
        &self,
        inbox: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<u16, AppError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.posts.lock().unwrap().push(RecordedPost {
            inbox: inbox.to_string(),
            headers: headers.clone(),
            body: body.to_vec(),
        });

        if self.failing.contains(inbox) {
            return Err(AppError::Network(format!("connection refused by {}", inbox)));
        }
        Ok(202)
    }
}

/// Fresh 1024-bit PKCS#8 PEM key
pub fn generate_pem() -> String {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
}

pub fn public_pem(private_pem: &str) -> String {
    SigningKey::from_pem(private_pem)
        .unwrap()
        .public_key_pem()
        .unwrap()
}

/// Key directory holding `<username>.pem` for each given user
pub struct KeyDir {
    pub dir: TempDir,
    pub pems: BTreeMap<String, String>,
}

impl KeyDir {
    pub fn new(users: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let mut pems = BTreeMap::new();
        for user in users {
            let pem = generate_pem();
            std::fs::write(dir.path().join(format!("{}.pem", user)), &pem).unwrap();
            pems.insert(user.to_string(), pem);
        }
        Self { dir, pems }
    }
}

pub fn test_config(keys: &KeyDir) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            domain: "shelf.example".to_string(),
            protocol: "https".to_string(),
        },
        federation: FederationConfig::default(),
        delivery: DeliveryConfig {
            max_concurrent: 4,
            timeout_seconds: 5,
            ..DeliveryConfig::default()
        },
        keys: KeysConfig {
            directory: keys.dir.path().to_path_buf(),
        },
        logging: LoggingConfig::default(),
    }
}

pub fn published_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

/// alice's say with the given body
pub fn say_record(body: &str) -> ActivityRecord {
    let at = published_at();
    ActivityRecord {
        id: "42".to_string(),
        actor: "alice".to_string(),
        activity_type: ActivityKind::Say,
        timestamp: at,
        content: ContentObject::Say {
            meta: ContentMeta {
                id: "7".to_string(),
                owner: "alice".to_string(),
                permalink: PERMALINK.to_string(),
                tags: Vec::new(),
                published: at,
                updated: at,
            },
            body: body.to_string(),
        },
        shared: true,
        state: shelfpost::data::PublishState::Created,
    }
}

/// Two followers sharing host A's inbox and one on host B without a shared inbox
pub fn alice_followers() -> Vec<Follower> {
    vec![
        Follower::new("https://a.example/users/carol").with_shared_inbox("https://a.example/inbox"),
        Follower::new("https://a.example/users/dave").with_shared_inbox("https://a.example/inbox"),
        Follower::new("https://b.example/users/bob").with_inbox("https://b.example/users/bob/inbox"),
    ]
}
