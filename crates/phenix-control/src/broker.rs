//! Role-filtered event broadcasting
//!
//! Every live connection registers a [`Subscription`] under the role it
//! authenticated with. A broadcast is delivered to a subscriber only if that
//! role is allowed the broadcast's [`RequestPolicy`] at the time of the
//! broadcast.
//!
//! Delivery is best-effort. Each subscriber has a bounded queue; when it is
//! full the message is dropped for that subscriber only, and a subscriber
//! whose receiving side is gone is removed.

use dashmap::DashMap;
use phenix_rbac::Role;
use phenix_types::{Publication, RequestPolicy, Resource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    user: String,
    role: Role,
    tx: mpsc::Sender<Arc<Publication>>,
}

struct BrokerInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Fans broadcasts out to authorized subscribers
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a broker whose subscribers each queue at most `buffer` messages
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a subscriber. Dropping the returned handle deregisters it.
    pub fn subscribe(&self, user: impl Into<String>, role: Role) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let user = user.into();

        debug!(subscriber = id, user = %user, role = %role.name(), "Subscriber registered");

        self.inner.subscribers.insert(id, Subscriber { user, role, tx });

        Subscription {
            id,
            rx,
            broker: Arc::clone(&self.inner),
        }
    }

    /// Deliver `resource` and `payload` to every subscriber whose role allows
    /// `policy`. Returns the number of subscribers the message was queued for.
    pub fn broadcast(
        &self,
        policy: &RequestPolicy,
        resource: Resource,
        payload: Option<serde_json::Value>,
    ) -> usize {
        // Snapshot so no map lock is held while sending
        let targets: Vec<(u64, Role, mpsc::Sender<Arc<Publication>>)> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.role.clone(), entry.tx.clone()))
            .collect();

        let names: Vec<&str> = policy.names.iter().map(String::as_str).collect();
        let publication = Arc::new(Publication::new(resource, payload));
        let mut delivered = 0;

        for (id, role, tx) in targets {
            if !role.allowed(&policy.resource, &policy.scope, &policy.verb, &names) {
                continue;
            }

            match tx.try_send(Arc::clone(&publication)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = id,
                        resource = %publication.resource.kind,
                        action = %publication.resource.action,
                        "Subscriber queue full, dropping broadcast"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.subscribers.remove(&id);
                    debug!(subscriber = id, "Removed closed subscriber");
                }
            }
        }

        debug!(
            resource = %publication.resource.kind,
            id = %publication.resource.id,
            action = %publication.resource.action,
            delivered,
            "Broadcast"
        );

        delivered
    }

    /// Get the number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Users with at least one live subscription, sorted and deduplicated
    pub fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.user.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered subscriber
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Publication>>,
    broker: Arc<BrokerInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next publication. Returns `None` once the subscriber has
    /// been removed from the broker.
    pub async fn recv(&mut self) -> Option<Arc<Publication>> {
        self.rx.recv().await
    }

    /// Take a queued publication without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Publication>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.broker.subscribers.remove(&self.id).is_some() {
            debug!(subscriber = self.id, "Subscriber deregistered");
        }
    }
}
