use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use futures::{SinkExt, StreamExt};
use live_socket::{Connection, Params, SessionId};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::views;

fn session_from_cookie(jar: &CookieJar, cookie_name: &str) -> Option<SessionId> {
    jar.get(cookie_name)
        .and_then(|cookie| cookie.value().parse::<SessionId>().ok())
}

fn session_cookie(name: &str, session: &SessionId) -> Cookie<'static> {
    Cookie::build((name.to_string(), session.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

/// First view over plain HTTP: mount, render once, hand out the session cookie.
pub async fn thermostat_page(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let cookie_name = &state.session.cookie_name;
    let session = session_from_cookie(&jar, cookie_name);
    let params: Params = query.into_iter().collect();

    match state.engine.render_once(session, params).await {
        Ok((session, initial)) => {
            let jar = jar.add(session_cookie(cookie_name, &session));
            (jar, Html(views::page(initial.as_str()).into_string())).into_response()
        }
        Err(e) => {
            error!("Failed to render thermostat page: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn thermostat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> impl IntoResponse {
    let session = session_from_cookie(&jar, &state.session.cookie_name);
    let params: Params = query.into_iter().collect();
    ws.on_upgrade(move |socket| handle_live_socket(socket, state, session, params))
}

async fn handle_live_socket(
    mut socket: WebSocket,
    state: AppState,
    session: Option<SessionId>,
    params: Params,
) {
    let Connection {
        handle,
        mut outbox,
        ..
    } = match state.engine.connect(session, params).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Refusing live socket: {}", e);
            let msg = ServerMessage::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    info!(socket = %handle.id(), session = %handle.session_id(), "Live socket connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Renders and diagnostics out, in cycle order
    let output_task = async {
        while let Some(out) = outbox.recv().await {
            let json = match serde_json::to_string(&ServerMessage::from(out)) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Client events in
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        if handle.send_event(client_msg.into_event()).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(socket = %handle.id(), "Ignoring malformed client message: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = output_task => {}
        _ = input_task => {}
    }

    handle.disconnect().await;
    info!(socket = %handle.id(), "Live socket disconnected");
}
