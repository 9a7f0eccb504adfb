//! Consumer contract: what an application supplies to the engine.
//!
//! A [`LiveHandler`] bundles a mount function, the event and self-message
//! handlers, a renderer and the pub/sub subjects every socket subscribes to.

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;

use crate::error::LiveError;
use crate::message::{Params, SelfMessage};
use crate::pubsub::TopicBinding;
use crate::registry::{EventRegistry, SelfRegistry};
use crate::render::{Rendered, Renderer};
use crate::session::SessionId;
use crate::socket::SocketContext;

/// Application state held by a socket. Opaque to the engine apart from
/// being cloneable and serializable for the session store.
pub trait Assigns: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Assigns for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Everything mount gets to see.
#[derive(Debug)]
pub struct MountContext<A> {
    pub socket: SocketContext,
    /// Assigns persisted by an earlier connection of the same session
    pub prior: Option<A>,
    /// Connection parameters (query string)
    pub params: Params,
}

impl<A> MountContext<A> {
    pub fn session_id(&self) -> &SessionId {
        self.socket.session_id()
    }
}

/// Computes the initial assigns for a new socket.
pub trait MountFn<A>: Send + Sync + 'static {
    fn call(&self, ctx: MountContext<A>) -> BoxFuture<'static, anyhow::Result<A>>;
}

impl<A, F, Fut> MountFn<A> for F
where
    F: Fn(MountContext<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
{
    fn call(&self, ctx: MountContext<A>) -> BoxFuture<'static, anyhow::Result<A>> {
        Box::pin(self(ctx))
    }
}

/// The full consumer contract for one kind of live view.
pub struct LiveHandler<A> {
    mount: Box<dyn MountFn<A>>,
    events: EventRegistry<A>,
    self_messages: SelfRegistry<A>,
    renderer: Box<dyn Renderer<A>>,
    bindings: Vec<TopicBinding>,
}

impl<A: Assigns> LiveHandler<A> {
    /// Start from a mount function. Until `handle_render` is called the view
    /// is the JSON encoding of the assigns.
    pub fn new<F, Fut>(mount: F) -> Self
    where
        F: Fn(MountContext<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        Self {
            mount: Box::new(mount),
            events: EventRegistry::new(),
            self_messages: SelfRegistry::new(),
            renderer: Box::new(|assigns: &A| -> anyhow::Result<String> {
                Ok(serde_json::to_string(assigns)?)
            }),
            bindings: Vec::new(),
        }
    }

    pub fn handle_mount<F, Fut>(mut self, mount: F) -> Self
    where
        F: Fn(MountContext<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.mount = Box::new(mount);
        self
    }

    pub fn handle_event<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SocketContext, A, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.events.register(name, handler);
        self
    }

    pub fn handle_self<F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SocketContext, A, SelfMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.self_messages.register(topic, handler);
        self
    }

    pub fn handle_self_typed<T, F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(SocketContext, A, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        self.self_messages.register_typed(topic, handler);
        self
    }

    pub fn handle_render(mut self, renderer: impl Renderer<A>) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    /// Subscribe every mounted socket to an external subject.
    pub fn subscribe(mut self, binding: TopicBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn events(&self) -> &EventRegistry<A> {
        &self.events
    }

    pub fn self_messages(&self) -> &SelfRegistry<A> {
        &self.self_messages
    }

    pub fn bindings(&self) -> &[TopicBinding] {
        &self.bindings
    }

    pub(crate) async fn mount(&self, ctx: MountContext<A>) -> Result<A, LiveError> {
        self.mount
            .call(ctx)
            .await
            .map_err(|e| LiveError::Mount(format!("{e:#}")))
    }

    /// Render `assigns`. Failures surface as [`LiveError::Render`].
    pub fn render(&self, assigns: &A) -> Result<Rendered, LiveError> {
        self.renderer
            .render(assigns)
            .map_err(|e| LiveError::Render(format!("{e:#}")))
    }
}
