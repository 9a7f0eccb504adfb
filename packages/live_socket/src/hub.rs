use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

use crate::message::{BroadcastMessage, Scope, SocketId};
use crate::metrics::LiveMetrics;
use crate::socket::{Inbound, Mailbox};

/// Whether a broadcast to all (or to a group) also reaches the socket that sent it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginPolicy {
    #[default]
    Include,
    Exclude,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sockets the message was enqueued to
    pub delivered: usize,
    /// Targets that were no longer registered
    pub skipped: usize,
}

#[derive(Default)]
struct Registry {
    sockets: HashMap<SocketId, Mailbox>,
    groups: HashMap<String, BTreeSet<SocketId>>,
}

/// Process-wide registry of live sockets, used to fan broadcasts out.
///
/// Register, unregister and broadcast enumeration are serialized through one
/// lock. Delivery is a non-blocking enqueue done under that lock, so a socket
/// is either still registered and gets the message, or already unregistered
/// and never sees it.
pub struct BroadcastHub {
    registry: RwLock<Registry>,
    policy: OriginPolicy,
    metrics: Arc<LiveMetrics>,
}

impl BroadcastHub {
    pub fn new(policy: OriginPolicy, metrics: Arc<LiveMetrics>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> OriginPolicy {
        self.policy
    }

    /// Register a socket's mailbox. Replaces any previous registration for the id.
    pub fn register(&self, id: SocketId, mailbox: Mailbox) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        debug!(socket = %id, "Registering socket with hub");
        registry.sockets.insert(id, mailbox);
    }

    /// Remove a socket and its group memberships. Returns false if it was not registered.
    pub fn unregister(&self, id: &SocketId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.groups.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        let removed = registry.sockets.remove(id).is_some();
        if removed {
            debug!(socket = %id, "Unregistered socket from hub");
        }
        removed
    }

    /// Add a registered socket to a group. Returns false for unknown sockets.
    pub fn join(&self, id: &SocketId, group: impl Into<String>) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if !registry.sockets.contains_key(id) {
            return false;
        }
        registry
            .groups
            .entry(group.into())
            .or_default()
            .insert(id.clone())
    }

    pub fn leave(&self, id: &SocketId, group: &str) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let Some(members) = registry.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            registry.groups.remove(group);
        }
        removed
    }

    pub fn contains(&self, id: &SocketId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sockets
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sockets
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members of a group, in id order.
    pub fn members(&self, group: &str) -> Vec<SocketId> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan a message out as one self message per targeted socket.
    ///
    /// Targets that are gone are skipped, never an error.
    pub fn broadcast(&self, msg: BroadcastMessage) -> BroadcastReport {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let self_msg = msg.to_self_message();
        let mut report = BroadcastReport::default();

        let excluded = match self.policy {
            OriginPolicy::Exclude => msg.origin.as_ref(),
            OriginPolicy::Include => None,
        };

        let mut deliver = |id: &SocketId| match registry.sockets.get(id) {
            Some(mailbox) if mailbox.deliver(Inbound::SelfMessage(self_msg.clone())) => {
                report.delivered += 1;
            }
            _ => {
                trace!(socket = %id, topic = %self_msg.topic, "Skipping broadcast to departed socket");
                report.skipped += 1;
            }
        };

        match &msg.scope {
            Scope::All => {
                for id in registry.sockets.keys() {
                    if Some(id) != excluded {
                        deliver(id);
                    }
                }
            }
            Scope::Sockets(ids) => {
                for id in ids {
                    deliver(id);
                }
            }
            Scope::Group(group) => {
                if let Some(members) = registry.groups.get(group) {
                    for id in members {
                        if Some(id) != excluded {
                            deliver(id);
                        }
                    }
                }
            }
        }
        drop(registry);

        debug!(
            topic = %msg.topic,
            delivered = report.delivered,
            skipped = report.skipped,
            "Broadcast"
        );
        self.metrics.broadcast(report.delivered, report.skipped);
        report
    }
}
