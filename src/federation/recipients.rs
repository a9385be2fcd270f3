//! Delivery target resolution
//!
//! Maps an actor's followers to the inboxes an activity must be posted to.

use std::collections::{BTreeMap, HashMap};

use crate::data::Follower;

/// One inbox to deliver to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    /// Inbox endpoint
    pub inbox: String,
    /// Headers requested by the remote server
    pub headers: BTreeMap<String, String>,
    /// Personal follower URIs reached through this inbox
    pub cc: Vec<String>,
}

/// `scheme://host[:port]` of a URL, lowercased
fn server_key(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Resolve followers into deduplicated, order-stable delivery targets.
///
/// A shared inbox announced by any follower on a server replaces the
/// personal inboxes of every follower on that server. Followers without a
/// shared inbox keep their personal inbox. Targets appear in the order their
/// first follower appears; headers from the first follower win on conflicts.
pub fn resolve_targets(actor: &str, followers: &[Follower]) -> Vec<DeliveryTarget> {
    let mut shared_by_server: HashMap<String, String> = HashMap::new();
    for follower in followers {
        if let (Some(server), Some(shared)) =
            (server_key(&follower.actor_uri), follower.shared_inbox())
        {
            if server_key(shared).is_none() {
                tracing::warn!(
                    actor,
                    follower = %follower.actor_uri,
                    shared_inbox = %shared,
                    "Ignoring unusable shared inbox"
                );
                continue;
            }
            shared_by_server
                .entry(server)
                .or_insert_with(|| shared.to_string());
        }
    }

    let mut targets: Vec<DeliveryTarget> = Vec::new();
    let mut index_by_inbox: HashMap<String, usize> = HashMap::new();

    for follower in followers {
        let Some(server) = server_key(&follower.actor_uri) else {
            tracing::warn!(
                actor,
                follower = %follower.actor_uri,
                "Skipping follower with unusable actor URI"
            );
            continue;
        };

        let inbox = match shared_by_server.get(&server) {
            Some(shared) => shared.clone(),
            None => follower.personal_inbox(),
        };
        if server_key(&inbox).is_none() {
            tracing::warn!(
                actor,
                follower = %follower.actor_uri,
                inbox = %inbox,
                "Skipping follower with unusable inbox URI"
            );
            continue;
        }

        let index = *index_by_inbox.entry(inbox.clone()).or_insert_with(|| {
            targets.push(DeliveryTarget {
                inbox,
                headers: BTreeMap::new(),
                cc: Vec::new(),
            });
            targets.len() - 1
        });

        let target = &mut targets[index];
        if !target.cc.contains(&follower.actor_uri) {
            target.cc.push(follower.actor_uri.clone());
        }
        for (name, value) in &follower.preferred_headers {
            target
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    tracing::debug!(
        actor,
        followers = followers.len(),
        targets = targets.len(),
        "Resolved delivery targets"
    );

    targets
}
