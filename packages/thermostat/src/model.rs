//! The thermostat live view: state, events and self messages.

use anyhow::Context;
use chrono::{DateTime, Utc};
use live_socket::{Decoder, LiveHandler, MountContext, Params, SocketContext, TopicBinding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::views;

pub const DEFAULT_TEMPERATURE: f32 = 19.5;
pub const WARNING_THRESHOLD: f32 = 25.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermoModel {
    pub name: String,
    pub temperature: f32,
    pub status: String,
    /// Bumped on every status message, so repeats of the same text stay
    /// distinguishable to the client
    #[serde(default)]
    pub status_seq: u64,
    pub time: String,
}

impl ThermoModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperature: DEFAULT_TEMPERATURE,
            status: "-".to_string(),
            status_seq: 0,
            time: String::new(),
        }
    }

    pub fn too_hot(&self) -> bool {
        self.temperature > WARNING_THRESHOLD
    }
}

/// Bus payload published on the NATS subject
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NatsMessage {
    pub name: String,
    /// Unix time in milliseconds
    pub value: i64,
}

/// RFC 1123 timestamp, e.g. `Mon, 02 Jan 2006 15:04:05 UTC`.
pub fn rfc1123(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S %Z").to_string()
}

/// Decode a [`NatsMessage`] into the status line shown to every socket.
pub fn nats_status_decoder() -> Decoder {
    Arc::new(|bytes: &[u8]| {
        let msg: NatsMessage = serde_json::from_slice(bytes)?;
        let at = DateTime::from_timestamp_millis(msg.value)
            .with_context(|| format!("timestamp out of range: {}", msg.value))?;
        Ok(Value::String(format!("Nats message: {}", rfc1123(at))))
    })
}

/// The complete live view, subscribed to `nats_subject`.
pub fn live_handler(nats_subject: &str) -> LiveHandler<ThermoModel> {
    LiveHandler::new(mount)
        .handle_event("temp-up", temp_up)
        .handle_event("temp-down", temp_down)
        .handle_event("temp-change", temp_change)
        .handle_event("save", save)
        .handle_self_typed("status", |_ctx, mut model: ThermoModel, status: String| async move {
            model.status = status;
            model.status_seq += 1;
            Ok(model)
        })
        .handle_self_typed("time", |_ctx, mut model: ThermoModel, time: String| async move {
            model.time = time;
            Ok(model)
        })
        .handle_render(views::render)
        .subscribe(TopicBinding::new(nats_subject, "status", nats_status_decoder()))
}

async fn mount(ctx: MountContext<ThermoModel>) -> anyhow::Result<ThermoModel> {
    info!(session = %ctx.session_id(), restored = ctx.prior.is_some(), "Mounting thermostat");
    Ok(ctx
        .prior
        .unwrap_or_else(|| ThermoModel::new(ctx.params.string("name"))))
}

async fn temp_up(
    _ctx: SocketContext,
    mut model: ThermoModel,
    _params: Params,
) -> anyhow::Result<ThermoModel> {
    model.temperature += 0.1;
    Ok(model)
}

async fn temp_down(
    _ctx: SocketContext,
    mut model: ThermoModel,
    _params: Params,
) -> anyhow::Result<ThermoModel> {
    model.temperature -= 0.1;
    Ok(model)
}

/// Shift by `temperature` and tell everyone about it.
async fn temp_change(
    ctx: SocketContext,
    mut model: ThermoModel,
    params: Params,
) -> anyhow::Result<ThermoModel> {
    let t0 = model.temperature;
    model.temperature += params.float("temperature");
    ctx.broadcast(
        "status",
        format!(
            "{}: Temperature changed from {:.1} to {:.1}",
            model.name, t0, model.temperature
        ),
    );
    Ok(model)
}

/// Chat-like message to every socket.
async fn save(
    ctx: SocketContext,
    model: ThermoModel,
    params: Params,
) -> anyhow::Result<ThermoModel> {
    let message = params.string("message");
    ctx.broadcast("status", format!("{}: {}", model.name, message));
    Ok(model)
}
