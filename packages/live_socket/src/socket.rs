//! Socket: the live representative of one connected client.
//!
//! Every socket owns a single FIFO inbound queue. The transport, the broadcast
//! hub, the pub/sub bridge and timers all enqueue into it, and exactly one loop
//! drains it, so at most one handler runs per socket at any instant.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LiveError;
use crate::handler::{Assigns, LiveHandler};
use crate::hub::{BroadcastHub, BroadcastReport};
use crate::message::{BroadcastMessage, Event, Scope, SelfMessage, SocketId};
use crate::render::Rendered;
use crate::session::SessionId;

/// Lifecycle of a socket. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocketState {
    Connecting,
    Mounted,
    Active,
    Disconnecting,
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Connecting => "connecting",
            SocketState::Mounted => "mounted",
            SocketState::Active => "active",
            SocketState::Disconnecting => "disconnecting",
            SocketState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An entry in a socket's inbound queue
#[derive(Debug, Clone)]
pub enum Inbound {
    Event(Event),
    SelfMessage(SelfMessage),
}

/// An entry in a socket's outbox, drained by the transport
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Fresh view after a successful cycle
    Render(Rendered),
    /// Non-fatal diagnostic for the cycle that just ran
    Error(LiveError),
}

/// Enqueue side of a socket's inbound queue.
///
/// Enqueue never waits on the socket's loop; it fails only once the socket
/// is gone.
#[derive(Clone)]
pub struct Mailbox {
    socket_id: SocketId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Mailbox {
    pub fn channel(socket_id: SocketId) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { socket_id, tx }, rx)
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    /// Append to the queue. Returns false if the socket has shut down.
    pub fn deliver(&self, inbound: Inbound) -> bool {
        self.tx.send(inbound).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("socket_id", &self.socket_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Capabilities handed to mount and handler functions.
#[derive(Clone)]
pub struct SocketContext {
    id: SocketId,
    session_id: SessionId,
    mailbox: Mailbox,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
}

impl SocketContext {
    pub(crate) fn new(
        id: SocketId,
        session_id: SessionId,
        mailbox: Mailbox,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            session_id,
            mailbox,
            hub,
            cancel,
        }
    }

    pub fn id(&self) -> &SocketId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Queue a self message behind whatever is already pending.
    pub fn send_self(&self, topic: impl Into<String>, payload: impl Into<Value>) -> bool {
        self.mailbox
            .deliver(Inbound::SelfMessage(SelfMessage::new(topic, payload)))
    }

    /// Queue a self message after `delay`. Abandoned if the socket disconnects first.
    pub fn send_self_after(
        &self,
        delay: Duration,
        topic: impl Into<String>,
        payload: impl Into<Value>,
    ) {
        let msg = SelfMessage::new(topic, payload);
        let mailbox = self.mailbox.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(socket = %mailbox.socket_id(), topic = %msg.topic, "Delayed self message abandoned");
                }
                _ = tokio::time::sleep(delay) => {
                    mailbox.deliver(Inbound::SelfMessage(msg));
                }
            }
        });
    }

    /// Broadcast to every live socket.
    pub fn broadcast(&self, topic: impl Into<String>, payload: impl Into<Value>) -> BroadcastReport {
        self.hub
            .broadcast(BroadcastMessage::all(topic, payload).from_socket(self.id.clone()))
    }

    /// Broadcast to a subset of sockets.
    pub fn broadcast_to(
        &self,
        scope: Scope,
        topic: impl Into<String>,
        payload: impl Into<Value>,
    ) -> BroadcastReport {
        self.hub.broadcast(
            BroadcastMessage::scoped(scope, topic, payload).from_socket(self.id.clone()),
        )
    }

    /// Join a broadcast group. Membership ends at disconnect.
    pub fn join(&self, group: impl Into<String>) -> bool {
        self.hub.join(&self.id, group)
    }

    pub fn leave(&self, group: &str) -> bool {
        self.hub.leave(&self.id, group)
    }

    /// Cancelled when the socket starts disconnecting. Work the socket spawns
    /// on its own should stop when this fires.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketContext")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Transport-side handle to a live socket.
#[derive(Clone)]
pub struct SocketHandle {
    id: SocketId,
    session_id: SessionId,
    mailbox: Mailbox,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SocketState>,
}

impl SocketHandle {
    pub(crate) fn new(
        id: SocketId,
        session_id: SessionId,
        mailbox: Mailbox,
        cancel: CancellationToken,
        state_rx: watch::Receiver<SocketState>,
    ) -> Self {
        Self {
            id,
            session_id,
            mailbox,
            cancel,
            state_rx,
        }
    }

    pub fn id(&self) -> &SocketId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    /// Enqueue a client event.
    pub fn send_event(&self, event: Event) -> Result<(), LiveError> {
        if self.cancel.is_cancelled() || !self.mailbox.deliver(Inbound::Event(event)) {
            return Err(LiveError::Closed);
        }
        Ok(())
    }

    /// Tear the socket down and wait until it is Closed.
    ///
    /// Safe to call any number of times; later calls return once the socket
    /// is Closed.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.closed().await;
    }

    /// Wait until the socket reaches Closed without requesting it.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        // A dropped sender means the loop is gone, which is as closed as it gets
        let _ = rx.wait_for(|s| *s == SocketState::Closed).await;
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Loop-owned socket state. Only the socket's own loop touches `assigns`.
pub struct Socket<A> {
    ctx: SocketContext,
    assigns: A,
    outbox: mpsc::UnboundedSender<Outbound>,
    subscriptions: BTreeSet<String>,
    state_tx: watch::Sender<SocketState>,
}

impl<A: Assigns> Socket<A> {
    pub(crate) fn new(
        ctx: SocketContext,
        assigns: A,
        outbox: mpsc::UnboundedSender<Outbound>,
        state_tx: watch::Sender<SocketState>,
    ) -> Self {
        Self {
            ctx,
            assigns,
            outbox,
            subscriptions: BTreeSet::new(),
            state_tx,
        }
    }

    pub fn id(&self) -> &SocketId {
        self.ctx.id()
    }

    pub fn session_id(&self) -> &SessionId {
        self.ctx.session_id()
    }

    pub fn assigns(&self) -> &A {
        &self.assigns
    }

    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    pub(crate) fn context(&self) -> &SocketContext {
        &self.ctx
    }

    pub(crate) fn set_subscriptions(&mut self, subjects: BTreeSet<String>) {
        self.subscriptions = subjects;
    }

    pub(crate) fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state_tx.send_replace(state);
    }

    /// Push to the outbox. Returns false once the transport stopped listening.
    pub(crate) fn push(&self, out: Outbound) -> bool {
        self.outbox.send(out).is_ok()
    }

    pub(crate) async fn outbox_closed(&self) {
        self.outbox.closed().await
    }

    /// Run one cycle: dispatch `inbound`, adopt the handler's result, render.
    ///
    /// A dispatch error leaves `assigns` untouched. A render error happens after
    /// the new `assigns` were adopted, so they stay.
    pub(crate) async fn process(
        &mut self,
        handler: &LiveHandler<A>,
        inbound: Inbound,
    ) -> Result<Rendered, LiveError> {
        let next = match inbound {
            Inbound::Event(event) => {
                handler
                    .events()
                    .dispatch(&self.ctx, self.assigns.clone(), event)
                    .await?
            }
            Inbound::SelfMessage(msg) => {
                handler
                    .self_messages()
                    .dispatch(&self.ctx, self.assigns.clone(), msg)
                    .await?
            }
        };
        self.assigns = next;
        handler.render(&self.assigns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LiveMetrics;
    use crate::hub::OriginPolicy;

    fn context() -> (SocketContext, mpsc::UnboundedReceiver<Inbound>, Arc<BroadcastHub>) {
        let hub = Arc::new(BroadcastHub::new(
            OriginPolicy::Include,
            Arc::new(LiveMetrics::new()),
        ));
        let id = SocketId::generate();
        let (mailbox, rx) = Mailbox::channel(id.clone());
        let ctx = SocketContext::new(
            id,
            SessionId::generate(),
            mailbox,
            hub.clone(),
            CancellationToken::new(),
        );
        (ctx, rx, hub)
    }

    #[tokio::test]
    async fn send_self_enqueues_in_order() {
        let (ctx, mut rx, _hub) = context();
        assert!(ctx.send_self("a", 1));
        assert!(ctx.send_self("b", 2));

        match rx.recv().await.unwrap() {
            Inbound::SelfMessage(m) => assert_eq!(m.topic, "a"),
            other => panic!("Expected self message, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Inbound::SelfMessage(m) => assert_eq!(m.topic, "b"),
            other => panic!("Expected self message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_self_after_delivers_later() {
        let (ctx, mut rx, _hub) = context();
        ctx.send_self_after(Duration::from_millis(10), "tick", "now");
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Inbound::SelfMessage(m) if m.topic == "tick"));
    }

    #[tokio::test]
    async fn send_self_after_abandoned_on_cancel() {
        let (ctx, mut rx, _hub) = context();
        ctx.send_self_after(Duration::from_millis(50), "tick", "now");
        ctx.cancellation().cancel();
        let res = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(res.is_err(), "cancelled timer must not deliver");
    }

    #[tokio::test]
    async fn mailbox_reports_closed_after_receiver_drop() {
        let (mailbox, rx) = Mailbox::channel(SocketId::generate());
        assert!(!mailbox.is_closed());
        drop(rx);
        assert!(mailbox.is_closed());
        assert!(!mailbox.deliver(Inbound::Event(Event::new("x"))));
    }

    #[tokio::test]
    async fn handle_rejects_events_after_cancel() {
        let id = SocketId::generate();
        let (mailbox, _rx) = Mailbox::channel(id.clone());
        let cancel = CancellationToken::new();
        let (_state_tx, state_rx) = watch::channel(SocketState::Active);
        let handle = SocketHandle::new(id, SessionId::generate(), mailbox, cancel.clone(), state_rx);

        assert!(handle.send_event(Event::new("temp-up")).is_ok());
        cancel.cancel();
        assert_eq!(handle.send_event(Event::new("temp-up")), Err(LiveError::Closed));
    }

    #[test]
    fn states_are_ordered() {
        assert!(SocketState::Connecting < SocketState::Mounted);
        assert!(SocketState::Active < SocketState::Disconnecting);
        assert!(SocketState::Disconnecting < SocketState::Closed);
        assert_eq!(SocketState::Active.to_string(), "active");
    }
}
