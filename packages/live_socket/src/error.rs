/// Errors surfaced by a live socket.
///
/// Only `Mount` is fatal, and only to the connection attempt that produced it.
/// Every other variant is reported to the transport and logged while the socket
/// stays Active.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    /// The consumer mount function refused the connection
    #[error("mount failed: {0}")]
    Mount(String),
    /// A client event with no registered handler
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    /// A self message whose topic has no registered handler
    #[error("unknown self message: {0}")]
    UnknownSelfMessage(String),
    /// A payload that does not match the shape its handler expects
    #[error("failed to decode payload for '{topic}': {reason}")]
    PayloadDecode { topic: String, reason: String },
    /// An event handler returned an error
    #[error("event handler '{name}' failed: {reason}")]
    EventHandler { name: String, reason: String },
    /// A self-message handler returned an error
    #[error("self message handler '{topic}' failed: {reason}")]
    SelfMessageHandler { topic: String, reason: String },
    /// The render function failed
    #[error("render failed: {0}")]
    Render(String),
    /// The session store rejected a save
    #[error("session storage error: {0}")]
    Storage(String),
    /// The external pub/sub transport failed
    #[error("pub/sub error: {0}")]
    PubSub(String),
    /// The socket is closed
    #[error("socket closed")]
    Closed,
}

impl LiveError {
    /// Stable tag used on the wire and in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveError::Mount(_) => "mount",
            LiveError::UnknownEvent(_) => "unknown_event",
            LiveError::UnknownSelfMessage(_) => "unknown_self_message",
            LiveError::PayloadDecode { .. } => "payload_decode",
            LiveError::EventHandler { .. } => "event_handler",
            LiveError::SelfMessageHandler { .. } => "self_message_handler",
            LiveError::Render(_) => "render",
            LiveError::Storage(_) => "storage",
            LiveError::PubSub(_) => "pubsub",
            LiveError::Closed => "closed",
        }
    }

    /// Whether the socket that produced this error has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiveError::Mount(_) | LiveError::Closed)
    }
}

/// Errors from a [`SessionStore`](crate::SessionStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No state for this session (never saved, expired, or destroyed)
    #[error("session not found")]
    NotFound,
    /// The backing storage failed
    #[error("session storage failed: {0}")]
    Storage(String),
}

impl From<SessionError> for LiveError {
    fn from(err: SessionError) -> Self {
        LiveError::Storage(err.to_string())
    }
}
