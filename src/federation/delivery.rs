//! Activity delivery
//!
//! Posts signed envelopes to remote inboxes. Each target is attempted
//! independently under a bounded worker pool with its own timeout; a slow
//! or failing inbox never affects its siblings. Nothing is retried.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// A fully prepared POST to one inbox
#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    pub inbox: String,
    pub headers: BTreeMap<String, String>,
    /// Signed envelope bytes, shared between targets with the same audience
    pub body: Arc<Vec<u8>>,
}

/// Sends one request to a remote inbox
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` to `inbox` with `Content-Type: application/activity+json`.
    ///
    /// # Returns
    /// HTTP status code of a successful response
    ///
    /// # Errors
    /// `Network` on connection failure, `Rejected` on non-2xx answers
    async fn post(
        &self,
        inbox: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<u16, AppError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    http_client: Arc<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }

    /// Build a client with the given User-Agent and request timeout.
    pub fn with_user_agent(user_agent: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;
        Ok(Self::new(Arc::new(http_client)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        inbox: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<u16, AppError> {
        let mut request = self.http_client.post(inbox);

        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            match (
                http::HeaderName::from_bytes(name.as_bytes()),
                http::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => {
                    tracing::warn!(inbox, header = %name, "Dropping invalid preferred header");
                }
            }
        }

        let response = request
            .header(http::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AppError::Network(format!("Failed to deliver to {}: {}", inbox, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Rejected {
                inbox: inbox.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(status.as_u16())
    }
}

/// Result of a delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code if available
    pub status_code: Option<u16>,
}

/// Fans deliveries out over a bounded pool
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    max_concurrent: usize,
    timeout: Duration,
}

impl Dispatcher {
    /// # Arguments
    /// * `transport` - Request sender
    /// * `max_concurrent` - Maximum in-flight requests (at least 1)
    /// * `timeout` - Per-attempt timeout
    pub fn new(transport: Arc<dyn Transport>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            transport,
            max_concurrent: max_concurrent.max(1),
            timeout,
        }
    }

    /// Deliver one request, bounded by the per-attempt timeout.
    pub async fn deliver(&self, delivery: &OutboundDelivery) -> DeliveryResult {
        let started = Instant::now();
        let attempt = tokio::time::timeout(
            self.timeout,
            self.transport
                .post(&delivery.inbox, &delivery.headers, &delivery.body),
        )
        .await;

        let (result, label) = match attempt {
            Ok(Ok(status)) => (
                DeliveryResult {
                    inbox_uri: delivery.inbox.clone(),
                    success: true,
                    error: None,
                    status_code: Some(status),
                },
                "success",
            ),
            Ok(Err(error)) => (
                DeliveryResult {
                    inbox_uri: delivery.inbox.clone(),
                    success: false,
                    status_code: error.status_code(),
                    error: Some(error.to_string()),
                },
                "failure",
            ),
            Err(_) => (
                DeliveryResult {
                    inbox_uri: delivery.inbox.clone(),
                    success: false,
                    error: Some(
                        AppError::Network(format!(
                            "Delivery to {} timed out after {}s",
                            delivery.inbox,
                            self.timeout.as_secs_f64()
                        ))
                        .to_string(),
                    ),
                    status_code: None,
                },
                "timeout",
            ),
        };

        DELIVERIES_TOTAL.with_label_values(&[label]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        if result.success {
            tracing::info!(inbox = %delivery.inbox, status = ?result.status_code, "Delivered activity");
        } else {
            tracing::warn!(
                inbox = %delivery.inbox,
                error = result.error.as_deref().unwrap_or_default(),
                "Delivery failed (no retry policy configured)"
            );
        }

        result
    }

    /// Deliver every request concurrently, at most `max_concurrent` at a time.
    ///
    /// Results come back in input order, one per delivery.
    pub async fn dispatch(&self, deliveries: Vec<OutboundDelivery>) -> Vec<DeliveryResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let total = deliveries.len();

        let mut tasks = Vec::with_capacity(total);
        for delivery in deliveries {
            let semaphore = semaphore.clone();
            let dispatcher = self.clone();
            let inbox = delivery.inbox.clone();

            let task = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return DeliveryResult {
                        inbox_uri: delivery.inbox.clone(),
                        success: false,
                        error: Some("Delivery pool closed".to_string()),
                        status_code: None,
                    };
                };
                dispatcher.deliver(&delivery).await
            });
            tasks.push((inbox, task));
        }

        let mut results = Vec::with_capacity(total);
        for (inbox, task) in tasks {
            let result = task.await.unwrap_or_else(|join_error| DeliveryResult {
                inbox_uri: inbox,
                success: false,
                error: Some(format!("Delivery task failed: {}", join_error)),
                status_code: None,
            });
            results.push(result);
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        results
    }
}

/// Serializes publishes per (actor, object) pair
///
/// Each publish takes a ticket synchronously and then waits for the holder
/// of the previous ticket for the same pair. Tickets are served in the
/// order they were taken, so a Create queued before an Update for the same
/// object is always dispatched first, even when both run on spawned tasks.
#[derive(Default)]
pub struct SequenceGate {
    tails: StdMutex<HashMap<(String, String), oneshot::Receiver<()>>>,
}

/// Place in the queue for one (actor, object) pair
pub struct SequenceTicket {
    previous: Option<oneshot::Receiver<()>>,
    release: oneshot::Sender<()>,
}

/// Exclusive use of an (actor, object) pair; released on drop
pub struct SequenceGuard {
    _release: oneshot::Sender<()>,
}

impl SequenceTicket {
    /// Wait until every earlier ticket for the same pair has been released.
    pub async fn wait(self) -> SequenceGuard {
        if let Some(previous) = self.previous {
            // Closed means the previous holder dropped its guard.
            let _ = previous.await;
        }
        SequenceGuard {
            _release: self.release,
        }
    }
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next ticket for `(actor, object)` without waiting.
    pub fn enqueue(&self, actor: &str, object: &str) -> SequenceTicket {
        let (release, tail) = oneshot::channel();
        let mut tails = self.tails.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Released tails nobody queued behind can go.
        tails.retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
        let previous = tails.insert((actor.to_string(), object.to_string()), tail);
        SequenceTicket { previous, release }
    }

    /// Wait for exclusive use of `(actor, object)`.
    pub async fn acquire(&self, actor: &str, object: &str) -> SequenceGuard {
        self.enqueue(actor, object).wait().await
    }

    /// Number of pairs currently held or awaited
    pub fn active_len(&self) -> usize {
        let mut tails = self.tails.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tails.retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
        tails.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the peak number of concurrent posts
    struct CountingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        failing_inbox: Option<String>,
        stalled_inbox: Option<String>,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                failing_inbox: None,
                stalled_inbox: None,
            }
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn post(
            &self,
            inbox: &str,
            _headers: &BTreeMap<String, String>,
            _body: &[u8],
        ) -> Result<u16, AppError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if self.stalled_inbox.as_deref() == Some(inbox) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing_inbox.as_deref() == Some(inbox) {
                return Err(AppError::Rejected {
                    inbox: inbox.to_string(),
                    status: 500,
                });
            }
            Ok(202)
        }
    }

    fn deliveries(count: usize) -> Vec<OutboundDelivery> {
        let body = Arc::new(b"{}".to_vec());
        (0..count)
            .map(|i| OutboundDelivery {
                inbox: format!("https://host{}.example/inbox", i),
                headers: BTreeMap::new(),
                body: body.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn dispatch_never_exceeds_pool_size() {
        let transport = Arc::new(CountingTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), 3, Duration::from_secs(5));

        let results = dispatcher.dispatch(deliveries(12)).await;

        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.success));
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failing_inbox_does_not_affect_siblings() {
        let mut transport = CountingTransport::new();
        transport.failing_inbox = Some("https://host2.example/inbox".to_string());
        let dispatcher = Dispatcher::new(Arc::new(transport), 2, Duration::from_secs(5));

        let results = dispatcher.dispatch(deliveries(5)).await;

        assert_eq!(results.iter().filter(|r| r.success).count(), 4);
        let failed = &results[2];
        assert!(!failed.success);
        assert_eq!(failed.status_code, Some(500));
        assert_eq!(failed.inbox_uri, "https://host2.example/inbox");
    }

    #[tokio::test]
    async fn stalled_inbox_times_out_alone() {
        let mut transport = CountingTransport::new();
        transport.stalled_inbox = Some("https://host0.example/inbox".to_string());
        let dispatcher = Dispatcher::new(Arc::new(transport), 4, Duration::from_millis(200));

        let results = dispatcher.dispatch(deliveries(3)).await;

        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(results[1].success);
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn sequence_gate_serves_tickets_in_order() {
        let gate = Arc::new(SequenceGate::new());
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let create = gate.enqueue("alice", "say/7");
        let update = gate.enqueue("alice", "say/7");

        // The later ticket starts waiting first but still runs second.
        let waiter = {
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = update.wait().await;
                order.lock().await.push("update");
            })
        };

        // A different object is not blocked by the held one.
        let other = gate.acquire("alice", "say/8").await;
        drop(other);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let guard = create.wait().await;
        order.lock().await.push("create");
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(*order.lock().await, vec!["create", "update"]);
        assert_eq!(gate.active_len(), 0);
    }
}
