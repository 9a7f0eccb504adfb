//! Mount/Unmount controller.
//!
//! `LiveEngine::connect` walks a socket from Connecting to Mounted and hands
//! it to its own loop task. The loop is the only owner of the socket's
//! assigns: it drains the inbound queue one message at a time, and on exit
//! unregisters from the hub, detaches from the pub/sub bridge and persists
//! the final assigns.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{LiveError, SessionError};
use crate::handler::{Assigns, LiveHandler, MountContext};
use crate::hub::{BroadcastHub, BroadcastReport, OriginPolicy};
use crate::message::{BroadcastMessage, Params, SocketId};
use crate::metrics::LiveMetrics;
use crate::pubsub::{MemoryPubSub, PubSubBridge};
use crate::render::Rendered;
use crate::session::{MemorySessionStore, SessionId, SessionStore};
use crate::socket::{
    Inbound, Mailbox, Outbound, Socket, SocketContext, SocketHandle, SocketState,
};

/// Runtime knobs for the engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Save assigns to the session store after every successful cycle, not
    /// only at disconnect.
    pub checkpoint_sessions: bool,
}

/// A mounted socket as seen by the transport.
#[derive(Debug)]
pub struct Connection {
    pub handle: SocketHandle,
    /// Renders and diagnostics, in cycle order. The first entry is the
    /// mount render (or its error).
    pub outbox: mpsc::UnboundedReceiver<Outbound>,
    /// The mount render, also queued on `outbox`
    pub initial: Result<Rendered, LiveError>,
}

struct EngineInner<A> {
    handler: Arc<LiveHandler<A>>,
    store: Arc<dyn SessionStore>,
    hub: Arc<BroadcastHub>,
    bridge: Arc<PubSubBridge>,
    metrics: Arc<LiveMetrics>,
    config: EngineConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Runs every socket of one kind of live view.
pub struct LiveEngine<A> {
    inner: Arc<EngineInner<A>>,
}

impl<A> Clone for LiveEngine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Assigns> LiveEngine<A> {
    pub fn new(
        handler: LiveHandler<A>,
        store: Arc<dyn SessionStore>,
        hub: Arc<BroadcastHub>,
        bridge: Arc<PubSubBridge>,
        metrics: Arc<LiveMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                handler: Arc::new(handler),
                store,
                hub,
                bridge,
                metrics,
                config,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Engine with an in-memory session store and pub/sub transport.
    pub fn in_memory(handler: LiveHandler<A>) -> Self {
        let metrics = Arc::new(LiveMetrics::new());
        let hub = Arc::new(BroadcastHub::new(OriginPolicy::default(), metrics.clone()));
        let bridge = Arc::new(PubSubBridge::new(
            Arc::new(MemoryPubSub::new()),
            hub.clone(),
            metrics.clone(),
        ));
        Self::new(
            handler,
            Arc::new(MemorySessionStore::default()),
            hub,
            bridge,
            metrics,
            EngineConfig::default(),
        )
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }

    pub fn bridge(&self) -> &Arc<PubSubBridge> {
        &self.inner.bridge
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.inner.metrics
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub fn handler(&self) -> &LiveHandler<A> {
        &self.inner.handler
    }

    /// Sockets currently registered with the hub
    pub fn socket_count(&self) -> usize {
        self.inner.hub.len()
    }

    /// Fan a message out from outside any socket.
    pub fn broadcast(&self, msg: BroadcastMessage) -> BroadcastReport {
        self.inner.hub.broadcast(msg)
    }

    /// Accept a new connection.
    ///
    /// Resolves the session, mounts, registers with the hub, attaches pub/sub
    /// bindings and renders once. Only a mount failure refuses the connection.
    ///
    /// Cancel safe: the Connecting phase runs on its own task. If the caller
    /// stops waiting, the socket still finishes mounting, finds its outbox
    /// dropped and tears itself down.
    pub async fn connect(
        &self,
        session: Option<SessionId>,
        params: Params,
    ) -> Result<Connection, LiveError> {
        if self.inner.cancel.is_cancelled() {
            return Err(LiveError::Closed);
        }
        let engine = self.clone();
        self.inner
            .tracker
            .spawn(async move { engine.establish(session, params).await })
            .await
            .map_err(|e| LiveError::Mount(format!("connect task failed: {e}")))?
    }

    async fn establish(
        &self,
        session: Option<SessionId>,
        params: Params,
    ) -> Result<Connection, LiveError> {
        let inner = &self.inner;

        let (session_id, prior) = self.resolve_session(session).await;
        let socket_id = SocketId::generate();
        let (mailbox, inbound_rx) = Mailbox::channel(socket_id.clone());
        let cancel = inner.cancel.child_token();
        let ctx = SocketContext::new(
            socket_id.clone(),
            session_id.clone(),
            mailbox.clone(),
            inner.hub.clone(),
            cancel.clone(),
        );
        let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
        debug!(socket = %socket_id, session = %session_id, restored = prior.is_some(), "Mounting socket");

        let mount = MountContext {
            socket: ctx.clone(),
            prior,
            params,
        };
        // Registered before mount so mount can join groups; anything
        // broadcast meanwhile waits in the queue
        inner.hub.register(socket_id.clone(), mailbox.clone());
        let assigns = match inner.handler.mount(mount).await {
            Ok(assigns) => assigns,
            Err(e) => {
                warn!(socket = %socket_id, session = %session_id, error = %e, "Mount refused connection");
                inner.hub.unregister(&socket_id);
                inner.metrics.mount_failed();
                cancel.cancel();
                return Err(e);
            }
        };

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let mut socket = Socket::new(ctx, assigns, outbox_tx, state_tx);

        let attach_error = match inner
            .bridge
            .attach(&socket_id, mailbox.clone(), inner.handler.bindings())
            .await
        {
            Ok(subjects) => {
                socket.set_subscriptions(subjects);
                None
            }
            Err(e) => {
                warn!(socket = %socket_id, error = %e, "Pub/sub attach failed, continuing without subscriptions");
                Some(e)
            }
        };

        let initial = inner.handler.render(socket.assigns());
        match &initial {
            Ok(rendered) => {
                socket.push(Outbound::Render(rendered.clone()));
            }
            Err(e) => {
                warn!(socket = %socket_id, error = %e, "First render failed");
                inner.metrics.render_error();
                socket.push(Outbound::Error(e.clone()));
            }
        }
        if let Some(e) = attach_error {
            socket.push(Outbound::Error(e));
        }

        socket.set_state(SocketState::Mounted);
        inner.metrics.socket_mounted();
        info!(
            socket = %socket_id,
            session = %session_id,
            subscriptions = socket.subscriptions().len(),
            "Socket mounted"
        );

        let handle = SocketHandle::new(socket_id, session_id, mailbox, cancel, state_rx);
        let engine = self.clone();
        inner
            .tracker
            .spawn(async move { engine.run(socket, inbound_rx).await });

        Ok(Connection {
            handle,
            outbox: outbox_rx,
            initial,
        })
    }

    /// Mount, render once and disconnect. For transports that serve the
    /// first view over a plain request before upgrading.
    pub async fn render_once(
        &self,
        session: Option<SessionId>,
        params: Params,
    ) -> Result<(SessionId, Rendered), LiveError> {
        let conn = self.connect(session, params).await?;
        let session_id = conn.handle.session_id().clone();
        conn.handle.disconnect().await;
        conn.initial.map(|rendered| (session_id, rendered))
    }

    /// Disconnect every socket and wait for all of them to reach Closed.
    pub async fn shutdown(&self) {
        info!(sockets = self.socket_count(), "Shutting down live engine");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    async fn resolve_session(&self, requested: Option<SessionId>) -> (SessionId, Option<A>) {
        let store = &self.inner.store;
        let Some(id) = requested else {
            let id = match store.create().await {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "Session store could not create a session, using a local id");
                    SessionId::generate()
                }
            };
            return (id, None);
        };

        match store.load(&id).await {
            Ok(bytes) => match serde_json::from_slice::<A>(&bytes) {
                Ok(prior) => (id, Some(prior)),
                Err(e) => {
                    warn!(session = %id, error = %e, "Discarding undecodable session state");
                    (id, None)
                }
            },
            Err(SessionError::NotFound) => {
                debug!(session = %id, "No prior state for session");
                (id, None)
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Session load failed, starting fresh");
                self.inner.metrics.storage_error();
                (id, None)
            }
        }
    }

    async fn run(self, mut socket: Socket<A>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let cancel = socket.context().cancellation();
        let handler = self.inner.handler.clone();
        socket.set_state(SocketState::Active);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = socket.outbox_closed() => {
                    debug!(socket = %socket.id(), "Transport went away");
                    break;
                }
                next = inbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let is_event = matches!(next, Inbound::Event(_));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(socket = %socket.id(), "Abandoning in-flight handler");
                    break;
                }
                result = socket.process(&handler, next) => result,
            };

            match result {
                Ok(rendered) => {
                    if is_event {
                        self.inner.metrics.event_handled();
                    } else {
                        self.inner.metrics.self_message_handled();
                    }
                    if self.inner.config.checkpoint_sessions {
                        self.checkpoint(&socket).await;
                    }
                    socket.push(Outbound::Render(rendered));
                }
                Err(err) => {
                    self.record_failure(&socket, &err);
                    let adopted = matches!(err, LiveError::Render(_));
                    socket.push(Outbound::Error(err));
                    if adopted && self.inner.config.checkpoint_sessions {
                        self.checkpoint(&socket).await;
                    }
                }
            }
        }

        self.teardown(socket, inbound).await;
    }

    fn record_failure(&self, socket: &Socket<A>, err: &LiveError) {
        let metrics = &self.inner.metrics;
        match err {
            LiveError::UnknownEvent(_) | LiveError::UnknownSelfMessage(_) => {
                metrics.unknown_message()
            }
            LiveError::PayloadDecode { .. } => metrics.decode_failure(),
            LiveError::EventHandler { .. } | LiveError::SelfMessageHandler { .. } => {
                metrics.handler_error()
            }
            LiveError::Render(_) => metrics.render_error(),
            _ => {}
        }
        warn!(socket = %socket.id(), kind = err.kind(), error = %err, "Cycle failed");
    }

    async fn checkpoint(&self, socket: &Socket<A>) {
        if let Err(e) = self.persist(socket).await {
            socket.push(Outbound::Error(e));
        }
    }

    /// Save the socket's assigns under its session.
    async fn persist(&self, socket: &Socket<A>) -> Result<(), LiveError> {
        let result = match serde_json::to_vec(socket.assigns()) {
            Ok(bytes) => self
                .inner
                .store
                .save(socket.session_id(), bytes)
                .await
                .map_err(LiveError::from),
            Err(e) => Err(LiveError::Storage(format!("failed to encode assigns: {e}"))),
        };
        if let Err(e) = &result {
            error!(socket = %socket.id(), session = %socket.session_id(), error = %e, "Failed to persist session state");
            self.inner.metrics.storage_error();
        }
        result
    }

    async fn teardown(&self, mut socket: Socket<A>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        socket.set_state(SocketState::Disconnecting);
        socket.context().cancellation().cancel();

        self.inner.hub.unregister(socket.id());
        inbound.close();
        let dropped = std::iter::from_fn(|| inbound.try_recv().ok()).count();
        if dropped > 0 {
            debug!(socket = %socket.id(), dropped, "Discarded queued messages at disconnect");
        }

        self.inner.bridge.detach(socket.id()).await;
        socket.clear_subscriptions();

        // Failure already logged and counted; the socket is going away regardless
        let _ = self.persist(&socket).await;

        self.inner.metrics.socket_closed();
        socket.set_state(SocketState::Closed);
        info!(socket = %socket.id(), session = %socket.session_id(), "Socket closed");
    }
}
