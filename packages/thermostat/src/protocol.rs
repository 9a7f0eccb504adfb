//! WebSocket wire format between the browser and the live socket.

use live_socket::{Event, Outbound, Params};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Messages from the browser
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Event {
        name: String,
        #[serde(default, deserialize_with = "lenient_params")]
        params: Params,
    },
}

impl ClientMessage {
    pub fn into_event(self) -> Event {
        match self {
            ClientMessage::Event { name, params } => Event::with_params(name, params),
        }
    }
}

/// Form values arrive as strings, but scripts may send numbers or booleans.
fn lenient_params<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Params, D::Error> {
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            Value::Null => (k, String::new()),
            other => (k, other.to_string()),
        })
        .collect())
}

/// Messages to the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Render { html: String },
    Error { kind: String, message: String },
}

impl From<Outbound> for ServerMessage {
    fn from(out: Outbound) -> Self {
        match out {
            Outbound::Render(view) => ServerMessage::Render {
                html: view.as_str().to_string(),
            },
            Outbound::Error(err) => ServerMessage::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}
