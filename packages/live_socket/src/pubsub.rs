//! Pub/Sub bridge: adapts an external message bus into self messages.
//!
//! The bridge owns one transport subscription per `(subject, self_topic)`
//! pair, shared by every socket that needs it and reference counted by them.
//! The last socket to detach tears the subscription down. A subscription
//! whose transport stream ends is resubscribed by the next socket that
//! attaches to it. Payloads are
//! decoded once per message on the subscription's own task; the socket's
//! inbound queue is the only point where that task meets a socket.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::LiveError;
use crate::hub::BroadcastHub;
use crate::message::{BroadcastMessage, SelfMessage, SocketId};
use crate::metrics::LiveMetrics;
use crate::socket::{Inbound, Mailbox};

/// An external at-least-once message bus.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Subscribe to `subject`. Dropping the stream unsubscribes.
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, Bytes>, LiveError>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), LiveError>;
}

/// In-process transport backed by one broadcast channel per subject.
pub struct MemoryPubSub {
    channels: tokio::sync::RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryPubSub {
    /// Create a new MemoryPubSub with default capacity (256 messages per subject).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: tokio::sync::RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Live subscriptions on `subject`
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        self.channels
            .read()
            .await
            .get(subject)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, Bytes>, LiveError> {
        let rx = {
            let mut channels = self.channels.write().await;
            channels
                .entry(subject.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        let subject = subject.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let subject = subject.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(subject = %subject, skipped = n, "Pub/sub subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), LiveError> {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(subject) {
            // No receivers is not an error
            let _ = tx.send(payload);
        }
        Ok(())
    }
}

/// Turns raw bus bytes into a self-message payload.
pub type Decoder = Arc<dyn Fn(&[u8]) -> anyhow::Result<Value> + Send + Sync>;

/// Decode JSON into `T`, then map it to the payload handlers see.
pub fn json_decoder<T, F>(map: F) -> Decoder
where
    T: DeserializeOwned,
    F: Fn(T) -> Value + Send + Sync + 'static,
{
    Arc::new(move |bytes: &[u8]| {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(map(value))
    })
}

/// Pass any well-formed JSON document through untouched.
pub fn raw_json_decoder() -> Decoder {
    Arc::new(|bytes: &[u8]| Ok(serde_json::from_slice(bytes)?))
}

/// Where a decoded bus message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Straight into the queue of every socket attached to the subscription
    Owner,
    /// Through the broadcast hub to every live socket
    Broadcast,
}

/// One external subject mapped onto a self-message topic.
#[derive(Clone)]
pub struct TopicBinding {
    pub subject: String,
    pub self_topic: String,
    pub route: Route,
    pub decoder: Decoder,
}

impl TopicBinding {
    pub fn new(subject: impl Into<String>, self_topic: impl Into<String>, decoder: Decoder) -> Self {
        Self {
            subject: subject.into(),
            self_topic: self_topic.into(),
            route: Route::Owner,
            decoder,
        }
    }

    pub fn broadcast(mut self) -> Self {
        self.route = Route::Broadcast;
        self
    }

    fn key(&self) -> (String, String) {
        (self.subject.clone(), self.self_topic.clone())
    }
}

impl fmt::Debug for TopicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBinding")
            .field("subject", &self.subject)
            .field("self_topic", &self.self_topic)
            .field("route", &self.route)
            .finish()
    }
}

type Attached = Arc<RwLock<HashMap<SocketId, Mailbox>>>;

struct Subscription {
    attached: Attached,
    /// Held open by `attach_broadcast` regardless of attached sockets
    pinned: bool,
    cancel: CancellationToken,
}

impl Subscription {
    fn refs(&self) -> usize {
        self.attached.read().unwrap_or_else(|e| e.into_inner()).len() + usize::from(self.pinned)
    }
}

/// Process-wide bridge between a [`PubSubTransport`] and live sockets.
pub struct PubSubBridge {
    transport: Arc<dyn PubSubTransport>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<LiveMetrics>,
    subscriptions: Mutex<HashMap<(String, String), Subscription>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PubSubBridge {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        hub: Arc<BroadcastHub>,
        metrics: Arc<LiveMetrics>,
    ) -> Self {
        Self {
            transport,
            hub,
            metrics,
            subscriptions: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a socket to every binding. Returns the subjects now subscribed.
    ///
    /// On failure nothing stays attached for this socket.
    pub async fn attach(
        &self,
        socket_id: &SocketId,
        mailbox: Mailbox,
        bindings: &[TopicBinding],
    ) -> Result<BTreeSet<String>, LiveError> {
        let mut subjects = BTreeSet::new();
        for binding in bindings {
            if let Err(e) = self.acquire(binding, Some((socket_id, &mailbox))).await {
                self.detach(socket_id).await;
                return Err(e);
            }
            subjects.insert(binding.subject.clone());
        }
        Ok(subjects)
    }

    /// Keep a subscription open for the life of the process, independent of
    /// any socket. Meant for [`Route::Broadcast`] bindings.
    pub async fn attach_broadcast(&self, binding: TopicBinding) -> Result<(), LiveError> {
        self.acquire(&binding, None).await
    }

    /// Release every subscription held by `socket_id`. Idempotent.
    ///
    /// Returns how many transport subscriptions were torn down as a result.
    pub async fn detach(&self, socket_id: &SocketId) -> usize {
        let mut subscriptions = self.subscriptions.lock().await;
        let mut released = Vec::new();
        for (key, sub) in subscriptions.iter() {
            let removed = sub
                .attached
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(socket_id)
                .is_some();
            if removed && sub.refs() == 0 {
                released.push(key.clone());
            }
        }
        for key in &released {
            if let Some(sub) = subscriptions.remove(key) {
                debug!(subject = %key.0, topic = %key.1, "Last socket detached, unsubscribing");
                sub.cancel.cancel();
            }
        }
        released.len()
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), LiveError> {
        self.transport.publish(subject, payload.into()).await
    }

    /// Transport subscriptions currently open. Ended streams do not count.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .filter(|sub| !sub.cancel.is_cancelled())
            .count()
    }

    /// Sockets attached to `subject` across all its topics
    pub async fn attached_count(&self, subject: &str) -> usize {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|((s, _), _)| s == subject)
            .map(|(_, sub)| sub.attached.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Cancel every subscription and wait for in-flight callbacks to drain.
    pub async fn shutdown(&self) {
        info!("Shutting down pub/sub bridge");
        self.cancel.cancel();
        self.subscriptions.lock().await.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn acquire(
        &self,
        binding: &TopicBinding,
        socket: Option<(&SocketId, &Mailbox)>,
    ) -> Result<(), LiveError> {
        if self.cancel.is_cancelled() {
            return Err(LiveError::PubSub("bridge is shut down".into()));
        }

        let key = binding.key();
        let mut subscriptions = self.subscriptions.lock().await;
        // A subscription whose stream ended keeps its attached sockets and is
        // resubscribed on the next acquire
        let (attached, pinned) = match subscriptions.get_mut(&key) {
            Some(sub) if !sub.cancel.is_cancelled() => {
                match socket {
                    Some((id, mailbox)) => {
                        sub.attached
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(id.clone(), mailbox.clone());
                    }
                    None => sub.pinned = true,
                }
                return Ok(());
            }
            Some(dead) => (dead.attached.clone(), dead.pinned),
            None => (Arc::new(RwLock::new(HashMap::new())), false),
        };

        let stream = self.transport.subscribe(&binding.subject).await?;
        info!(
            subject = %binding.subject,
            topic = %binding.self_topic,
            route = ?binding.route,
            resubscribed = subscriptions.contains_key(&key),
            "Subscribed to pub/sub subject"
        );

        if let Some((id, mailbox)) = socket {
            attached
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), mailbox.clone());
        }
        let cancel = self.cancel.child_token();

        self.tracker.spawn(pump(
            stream,
            binding.clone(),
            attached.clone(),
            self.hub.clone(),
            self.metrics.clone(),
            cancel.clone(),
        ));

        subscriptions.insert(
            key,
            Subscription {
                attached,
                pinned: pinned || socket.is_none(),
                cancel,
            },
        );
        Ok(())
    }
}

/// Drain one transport subscription until cancelled or the stream ends.
async fn pump(
    mut stream: BoxStream<'static, Bytes>,
    binding: TopicBinding,
    attached: Attached,
    hub: Arc<BroadcastHub>,
    metrics: Arc<LiveMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(payload) => payload,
                None => {
                    warn!(subject = %binding.subject, "Pub/sub stream ended");
                    // Marks the subscription dead for the next acquire
                    cancel.cancel();
                    break;
                }
            },
        };

        let value = match (binding.decoder)(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    subject = %binding.subject,
                    topic = %binding.self_topic,
                    error = %e,
                    "Dropping undecodable pub/sub message"
                );
                metrics.decode_failure();
                continue;
            }
        };

        match binding.route {
            Route::Owner => {
                let attached = attached.read().unwrap_or_else(|e| e.into_inner());
                for mailbox in attached.values() {
                    let msg = SelfMessage::new(binding.self_topic.clone(), value.clone());
                    mailbox.deliver(Inbound::SelfMessage(msg));
                }
            }
            Route::Broadcast => {
                hub.broadcast(BroadcastMessage::all(binding.self_topic.clone(), value));
            }
        }
    }
    debug!(subject = %binding.subject, topic = %binding.self_topic, "Pub/sub pump stopped");
}
