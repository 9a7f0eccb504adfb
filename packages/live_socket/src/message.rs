//! Messages flowing into a socket.
//!
//! Events come from the connected client, self messages from everything else
//! (broadcasts, timers, the pub/sub bridge). Both land in the same per-socket
//! FIFO queue so a socket observes them in arrival order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::LiveError;

/// Unique identifier for one live connection. Never reused.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SocketId(String);

impl SocketId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "sock-{short}")
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Event parameters as decoded by the transport.
///
/// Accessors are lenient: a missing or malformed value yields the type's
/// zero value, so handlers can treat form input without ceremony.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The value for `key`, or an empty string.
    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// The value for `key` parsed as a float, or 0.0.
    pub fn float(&self, key: &str) -> f32 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0.0)
    }

    /// The value for `key` parsed as an integer, or 0.
    pub fn int(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A named, parameterized action originating from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// A payload delivered to exactly one socket from a non-client source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl SelfMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload into the shape a handler expects.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, LiveError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| LiveError::PayloadDecode {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })
    }
}

/// Which sockets a broadcast reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every registered socket (subject to the hub's origin policy)
    All,
    /// Only these sockets; ids that are gone are skipped
    Sockets(BTreeSet<SocketId>),
    /// Sockets that joined the named group
    Group(String),
}

/// A message to fan out through the [`BroadcastHub`](crate::BroadcastHub).
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub scope: Scope,
    /// The socket that produced the broadcast, if any
    pub origin: Option<SocketId>,
}

impl BroadcastMessage {
    pub fn all(topic: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            scope: Scope::All,
            origin: None,
        }
    }

    pub fn scoped(
        scope: Scope,
        topic: impl Into<String>,
        payload: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            scope,
            origin: None,
        }
    }

    pub fn from_socket(mut self, origin: SocketId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub(crate) fn to_self_message(&self) -> SelfMessage {
        SelfMessage {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
        }
    }
}
