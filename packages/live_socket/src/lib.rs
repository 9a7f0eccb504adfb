//! Live Socket - server-side live view engine
//!
//! Keeps application state ("assigns") per connected client, mutates it
//! through named events, re-renders after every change and fans state
//! changes out to other clients and from an external message bus.
//! It has no HTTP, HTML or message-bus dependencies; transports plug in
//! through [`LiveEngine::connect`] and [`PubSubTransport`].
//!
//! # Example
//!
//! ```no_run
//! use live_socket::{Event, LiveEngine, LiveHandler, MountContext, Outbound, Params};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Thermo {
//!     temperature: f32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handler = LiveHandler::new(|ctx: MountContext<Thermo>| async move {
//!         Ok(ctx.prior.unwrap_or(Thermo { temperature: 19.5 }))
//!     })
//!     .handle_event("temp-up", |_ctx, mut t: Thermo, _params| async move {
//!         t.temperature += 0.1;
//!         Ok(t)
//!     })
//!     .handle_render(|t: &Thermo| -> anyhow::Result<String> {
//!         Ok(format!("<p>{:.1}</p>", t.temperature))
//!     });
//!
//!     let engine = LiveEngine::in_memory(handler);
//!     let mut conn = engine.connect(None, Params::new()).await?;
//!     conn.handle.send_event(Event::new("temp-up"))?;
//!
//!     while let Some(out) = conn.outbox.recv().await {
//!         match out {
//!             Outbound::Render(html) => println!("{}", html),
//!             Outbound::Error(e) => eprintln!("{} ({})", e, e.kind()),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod engine;
mod error;
mod handler;
mod hub;
mod message;
mod metrics;
pub mod pubsub;
mod registry;
mod render;
mod schedule;
mod session;
mod socket;

pub use engine::{Connection, EngineConfig, LiveEngine};
pub use error::{LiveError, SessionError};
pub use handler::{Assigns, LiveHandler, MountContext, MountFn};
pub use hub::{BroadcastHub, BroadcastReport, OriginPolicy};
pub use message::{BroadcastMessage, Event, Params, Scope, SelfMessage, SocketId};
pub use metrics::{
    DispatchMetrics, FanoutMetrics, LiveMetrics, MetricsSnapshot, SocketMetrics,
};
pub use pubsub::{
    Decoder, MemoryPubSub, PubSubBridge, PubSubTransport, Route, TopicBinding, json_decoder,
    raw_json_decoder,
};
pub use registry::{EventHandler, EventRegistry, SelfHandler, SelfRegistry};
pub use render::{Rendered, Renderer};
pub use schedule::{ScheduledTask, spawn_interval};
pub use session::{MemorySessionStore, SessionId, SessionStore};
pub use socket::{Inbound, Mailbox, Outbound, SocketContext, SocketHandle, SocketState};
