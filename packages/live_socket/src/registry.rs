//! Event and self-message registries.
//!
//! Both registries map a name to a handler and run it through one uniform
//! dispatch call. Client events and self messages never share a namespace.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::LiveError;
use crate::message::{Event, Params, SelfMessage};
use crate::socket::SocketContext;

/// Handles a client event: takes the current assigns, returns the next ones.
pub trait EventHandler<A>: Send + Sync + 'static {
    fn call(&self, ctx: SocketContext, assigns: A, params: Params)
    -> BoxFuture<'static, anyhow::Result<A>>;
}

impl<A, F, Fut> EventHandler<A> for F
where
    A: Send + 'static,
    F: Fn(SocketContext, A, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
{
    fn call(
        &self,
        ctx: SocketContext,
        assigns: A,
        params: Params,
    ) -> BoxFuture<'static, anyhow::Result<A>> {
        Box::pin(self(ctx, assigns, params))
    }
}

/// Handles a self message addressed to one socket.
pub trait SelfHandler<A>: Send + Sync + 'static {
    fn call(
        &self,
        ctx: SocketContext,
        assigns: A,
        msg: SelfMessage,
    ) -> BoxFuture<'static, anyhow::Result<A>>;
}

impl<A, F, Fut> SelfHandler<A> for F
where
    A: Send + 'static,
    F: Fn(SocketContext, A, SelfMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
{
    fn call(
        &self,
        ctx: SocketContext,
        assigns: A,
        msg: SelfMessage,
    ) -> BoxFuture<'static, anyhow::Result<A>> {
        Box::pin(self(ctx, assigns, msg))
    }
}

/// Turn a handler's error into the diagnostic surfaced for its cycle.
///
/// A payload decode error raised inside the handler keeps its own kind.
fn handler_failure(err: anyhow::Error, wrap: impl FnOnce(String) -> LiveError) -> LiveError {
    match err.downcast::<LiveError>() {
        Ok(decode @ LiveError::PayloadDecode { .. }) => decode,
        Ok(other) => wrap(other.to_string()),
        Err(err) => wrap(format!("{err:#}")),
    }
}

/// Client event name -> handler
pub struct EventRegistry<A> {
    handlers: HashMap<String, Arc<dyn EventHandler<A>>>,
}

impl<A> Default for EventRegistry<A> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<A: Send + 'static> EventRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(SocketContext, A, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.register_handler(name, handler);
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: impl EventHandler<A>) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered event names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `event` against `assigns`.
    ///
    /// On any error the caller keeps its prior assigns.
    pub async fn dispatch(
        &self,
        ctx: &SocketContext,
        assigns: A,
        event: Event,
    ) -> Result<A, LiveError> {
        let Some(handler) = self.handlers.get(&event.name).cloned() else {
            return Err(LiveError::UnknownEvent(event.name));
        };
        debug!(socket = %ctx.id(), event = %event.name, "Dispatching event");
        let name = event.name;
        handler
            .call(ctx.clone(), assigns, event.params)
            .await
            .map_err(|e| handler_failure(e, |reason| LiveError::EventHandler { name, reason }))
    }
}

/// Self-message topic -> handler
pub struct SelfRegistry<A> {
    handlers: HashMap<String, Arc<dyn SelfHandler<A>>>,
}

impl<A> Default for SelfRegistry<A> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<A: Send + 'static> SelfRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that receives the raw message.
    pub fn register<F, Fut>(&mut self, topic: impl Into<String>, handler: F)
    where
        F: Fn(SocketContext, A, SelfMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.register_handler(topic, handler);
    }

    pub fn register_handler(&mut self, topic: impl Into<String>, handler: impl SelfHandler<A>) {
        self.handlers.insert(topic.into(), Arc::new(handler));
    }

    /// Register a handler whose payload is decoded into `T` first.
    ///
    /// A payload of the wrong shape never reaches `handler`; dispatch fails
    /// with [`LiveError::PayloadDecode`].
    pub fn register_typed<T, F, Fut>(&mut self, topic: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(SocketContext, A, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(topic, move |ctx: SocketContext, assigns: A, msg: SelfMessage| {
            let handler = handler.clone();
            async move {
                let payload: T = msg.decode()?;
                handler(ctx, assigns, payload).await
            }
        });
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    pub async fn dispatch(
        &self,
        ctx: &SocketContext,
        assigns: A,
        msg: SelfMessage,
    ) -> Result<A, LiveError> {
        let Some(handler) = self.handlers.get(&msg.topic).cloned() else {
            return Err(LiveError::UnknownSelfMessage(msg.topic));
        };
        debug!(socket = %ctx.id(), topic = %msg.topic, "Dispatching self message");
        let topic = msg.topic.clone();
        handler
            .call(ctx.clone(), assigns, msg)
            .await
            .map_err(|e| handler_failure(e, |reason| LiveError::SelfMessageHandler { topic, reason }))
    }
}
