use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use live_socket::{
    BroadcastMessage, Connection, EngineConfig, Event, LiveEngine, LiveError, LiveHandler,
    LiveMetrics, MemoryPubSub, MemorySessionStore, MountContext, OriginPolicy, Outbound, Params,
    PubSubBridge, BroadcastHub, Scope, SessionError, SessionId, SessionStore, SocketState,
    TopicBinding, json_decoder,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Room {
    temperature: f32,
    status: String,
    log: Vec<String>,
}

impl Default for Room {
    fn default() -> Self {
        Self {
            temperature: 19.5,
            status: "-".into(),
            log: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct BusMessage {
    text: String,
}

fn room_handler(gate: Arc<Notify>) -> LiveHandler<Room> {
    LiveHandler::new(|ctx: MountContext<Room>| async move {
        if let Some(group) = ctx.params.get("group") {
            ctx.socket.join(group);
        }
        Ok(ctx.prior.unwrap_or_default())
    })
    .handle_event("temp-up", |_ctx, mut room: Room, _params| async move {
        room.temperature += 0.1;
        Ok(room)
    })
    .handle_event("temp-change", |_ctx, mut room: Room, params: Params| async move {
        room.temperature += params.float("temperature");
        Ok(room)
    })
    .handle_event("shout", |ctx, room: Room, params: Params| async move {
        ctx.broadcast("status", params.string("message"));
        Ok(room)
    })
    .handle_event("whisper", |ctx, room: Room, params: Params| async move {
        ctx.broadcast_to(
            Scope::Group(params.string("group")),
            "status",
            params.string("message"),
        );
        Ok(room)
    })
    .handle_event("slow", move |_ctx, mut room: Room, _params| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            room.log.push("slow".into());
            Ok(room)
        }
    })
    .handle_event("fail", |_ctx, _room: Room, _params| async move {
        anyhow::bail!("sensor offline")
    })
    .handle_self_typed("status", |_ctx, mut room: Room, status: String| async move {
        room.log.push(format!("status:{status}"));
        room.status = status;
        Ok(room)
    })
}

fn engine() -> LiveEngine<Room> {
    LiveEngine::in_memory(room_handler(Arc::new(Notify::new())))
}

async fn next_out(conn: &mut Connection) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), conn.outbox.recv())
        .await
        .expect("timed out waiting for outbox")
        .expect("outbox closed")
}

async fn next_room(conn: &mut Connection) -> Room {
    match next_out(conn).await {
        Outbound::Render(view) => serde_json::from_str(view.as_str()).unwrap(),
        Outbound::Error(e) => panic!("Expected render, got error: {e}"),
    }
}

async fn next_error(conn: &mut Connection) -> LiveError {
    match next_out(conn).await {
        Outbound::Error(e) => e,
        Outbound::Render(view) => panic!("Expected error, got render: {view}"),
    }
}

async fn mounted(engine: &LiveEngine<Room>, params: Params) -> (Connection, Room) {
    let mut conn = engine.connect(None, params).await.unwrap();
    let room = next_room(&mut conn).await;
    (conn, room)
}

#[tokio::test]
async fn temp_up_twice_from_mount() {
    let engine = engine();
    let (mut conn, room) = mounted(&engine, Params::new()).await;
    assert_eq!(room.temperature, 19.5);

    conn.handle.send_event(Event::new("temp-up")).unwrap();
    conn.handle.send_event(Event::new("temp-up")).unwrap();
    next_room(&mut conn).await;
    let room = next_room(&mut conn).await;

    assert!((room.temperature - 19.7).abs() < 1e-4, "got {}", room.temperature);
}

#[tokio::test]
async fn unknown_event_leaves_assigns_and_socket_active() {
    let engine = engine();
    let (mut conn, before) = mounted(&engine, Params::new()).await;

    conn.handle.send_event(Event::new("frobulate")).unwrap();
    assert_eq!(next_error(&mut conn).await, LiveError::UnknownEvent("frobulate".into()));
    assert_eq!(conn.handle.state(), SocketState::Active);

    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "0")))
        .unwrap();
    assert_eq!(next_room(&mut conn).await, before);
    assert_eq!(engine.metrics().snapshot().dispatch.unknown_messages, 1);
}

#[tokio::test]
async fn handler_error_retains_prior_assigns() {
    let engine = engine();
    let (mut conn, before) = mounted(&engine, Params::new()).await;

    conn.handle.send_event(Event::new("fail")).unwrap();
    let err = next_error(&mut conn).await;
    assert_eq!(err.kind(), "event_handler");
    assert!(err.to_string().contains("sensor offline"));

    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "0")))
        .unwrap();
    assert_eq!(next_room(&mut conn).await, before);
}

#[tokio::test]
async fn render_error_keeps_updated_assigns() {
    let handler = room_handler(Arc::new(Notify::new())).handle_render(
        |room: &Room| -> anyhow::Result<String> {
            anyhow::ensure!(room.temperature < 30.0, "too hot to render");
            Ok(serde_json::to_string(room)?)
        },
    );
    let engine = LiveEngine::in_memory(handler);
    let (mut conn, _) = mounted(&engine, Params::new()).await;

    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "12")))
        .unwrap();
    assert_eq!(next_error(&mut conn).await.kind(), "render");

    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "-10")))
        .unwrap();
    let room = next_room(&mut conn).await;
    assert!((room.temperature - 21.5).abs() < 1e-4);
    assert_eq!(engine.metrics().snapshot().dispatch.render_errors, 1);
}

#[tokio::test]
async fn broadcast_reaches_every_socket_including_busy_one() {
    let gate = Arc::new(Notify::new());
    let engine = LiveEngine::in_memory(room_handler(gate.clone()));
    let (mut a, _) = mounted(&engine, Params::new()).await;
    let (mut b, _) = mounted(&engine, Params::new()).await;
    let (mut c, _) = mounted(&engine, Params::new()).await;

    // B is blocked inside a handler when the broadcast lands
    b.handle.send_event(Event::new("slow")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.handle
        .send_event(Event::with_params("shout", Params::new().with("message", "hello")))
        .unwrap();

    next_room(&mut a).await;
    assert_eq!(next_room(&mut a).await.status, "hello");
    assert_eq!(next_room(&mut c).await.status, "hello");

    gate.notify_one();
    let after_slow = next_room(&mut b).await;
    assert_eq!(after_slow.log, vec!["slow"]);
    let after_status = next_room(&mut b).await;
    assert_eq!(after_status.log, vec!["slow", "status:hello"]);
    assert_eq!(after_status.status, "hello");
}

#[tokio::test]
async fn queued_messages_are_handled_in_arrival_order() {
    let gate = Arc::new(Notify::new());
    let engine = LiveEngine::in_memory(room_handler(gate.clone()));
    let (mut b, _) = mounted(&engine, Params::new()).await;

    b.handle.send_event(Event::new("slow")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.broadcast(BroadcastMessage::all("status", "first"));
    b.handle.send_event(Event::new("temp-up")).unwrap();
    engine.broadcast(BroadcastMessage::all("status", "second"));
    gate.notify_one();

    next_room(&mut b).await;
    next_room(&mut b).await;
    next_room(&mut b).await;
    let room = next_room(&mut b).await;
    assert_eq!(room.log, vec!["slow", "status:first", "status:second"]);
    assert_eq!(room.status, "second");
    assert!((room.temperature - 19.6).abs() < 1e-4);
}

#[tokio::test]
async fn disconnected_socket_never_receives_broadcasts() {
    let engine = engine();
    let (a, _) = mounted(&engine, Params::new()).await;
    let (mut b, _) = mounted(&engine, Params::new()).await;

    a.handle.disconnect().await;
    let report = engine.broadcast(BroadcastMessage::all("status", "anyone?"));
    assert_eq!(report.delivered, 1);
    assert_eq!(next_room(&mut b).await.status, "anyone?");

    // Broadcasting at a socket that is gone is a skip, not an error
    let scope = Scope::Sockets([a.handle.id().clone()].into_iter().collect());
    let report = engine.broadcast(BroadcastMessage::scoped(scope, "status", "hello?"));
    assert_eq!(report.delivered, 0);
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn unknown_self_topic_is_dropped_with_diagnostic() {
    let engine = engine();
    let (mut conn, _) = mounted(&engine, Params::new()).await;

    engine.broadcast(BroadcastMessage::all("weather", "sunny"));
    assert_eq!(
        next_error(&mut conn).await,
        LiveError::UnknownSelfMessage("weather".into())
    );
    assert_eq!(conn.handle.state(), SocketState::Active);
}

#[tokio::test]
async fn mistyped_self_payload_is_decode_error() {
    let engine = engine();
    let (mut conn, _) = mounted(&engine, Params::new()).await;

    engine.broadcast(BroadcastMessage::all("status", serde_json::json!({"no": "string"})));
    assert_eq!(next_error(&mut conn).await.kind(), "payload_decode");

    engine.broadcast(BroadcastMessage::all("status", "ok"));
    assert_eq!(next_room(&mut conn).await.log, vec!["status:ok"]);
}

#[tokio::test]
async fn group_broadcast_reaches_members_only() {
    let engine = engine();
    let (mut kitchen, _) = mounted(&engine, Params::new().with("group", "kitchen")).await;
    let (mut hall, _) = mounted(&engine, Params::new()).await;

    hall.handle
        .send_event(Event::with_params(
            "whisper",
            Params::new().with("group", "kitchen").with("message", "dinner"),
        ))
        .unwrap();

    assert_eq!(next_room(&mut kitchen).await.status, "dinner");
    // The whisper's own render, nothing else
    assert_eq!(next_room(&mut hall).await.status, "-");
    assert!(hall.outbox.try_recv().is_err());
}

#[tokio::test]
async fn malformed_pubsub_payload_changes_nothing() {
    let metrics = Arc::new(LiveMetrics::new());
    let hub = Arc::new(BroadcastHub::new(OriginPolicy::Include, metrics.clone()));
    let bridge = Arc::new(PubSubBridge::new(
        Arc::new(MemoryPubSub::new()),
        hub.clone(),
        metrics.clone(),
    ));
    let handler = room_handler(Arc::new(Notify::new())).subscribe(TopicBinding::new(
        "go-live",
        "status",
        json_decoder(|m: BusMessage| Value::from(m.text)),
    ));
    let engine = LiveEngine::new(
        handler,
        Arc::new(MemorySessionStore::default()),
        hub,
        bridge.clone(),
        metrics.clone(),
        EngineConfig::default(),
    );
    let (mut conn, before) = mounted(&engine, Params::new()).await;

    bridge.publish("go-live", "{{{ definitely not json").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while metrics.snapshot().fanout.decode_failures == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(conn.outbox.try_recv().is_err());

    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "0")))
        .unwrap();
    assert_eq!(next_room(&mut conn).await, before);

    bridge.publish("go-live", r#"{"text":"from the bus"}"#).await.unwrap();
    assert_eq!(next_room(&mut conn).await.status, "from the bus");
}

#[tokio::test]
async fn pubsub_subscription_released_at_disconnect() {
    let metrics = Arc::new(LiveMetrics::new());
    let hub = Arc::new(BroadcastHub::new(OriginPolicy::Include, metrics.clone()));
    let transport = Arc::new(MemoryPubSub::new());
    let bridge = Arc::new(PubSubBridge::new(transport.clone(), hub.clone(), metrics.clone()));
    let handler = room_handler(Arc::new(Notify::new())).subscribe(TopicBinding::new(
        "go-live",
        "status",
        json_decoder(|m: BusMessage| Value::from(m.text)),
    ));
    let engine = LiveEngine::new(
        handler,
        Arc::new(MemorySessionStore::default()),
        hub,
        bridge.clone(),
        metrics,
        EngineConfig::default(),
    );

    let (a, _) = mounted(&engine, Params::new()).await;
    let (b, _) = mounted(&engine, Params::new()).await;
    assert_eq!(bridge.subscription_count().await, 1);
    assert_eq!(bridge.attached_count("go-live").await, 2);

    a.handle.disconnect().await;
    assert_eq!(bridge.subscription_count().await, 1);
    b.handle.disconnect().await;
    assert_eq!(bridge.subscription_count().await, 0);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let engine = engine();
    let (conn, _) = mounted(&engine, Params::new()).await;

    let h1 = conn.handle.clone();
    let h2 = conn.handle.clone();
    tokio::join!(h1.disconnect(), h2.disconnect());
    conn.handle.disconnect().await;

    assert_eq!(conn.handle.state(), SocketState::Closed);
    assert_eq!(
        conn.handle.send_event(Event::new("temp-up")),
        Err(LiveError::Closed)
    );
    assert_eq!(engine.metrics().snapshot().sockets.active, 0);
}

#[tokio::test]
async fn reconnect_resumes_session() {
    let engine = engine();
    let (mut conn, _) = mounted(&engine, Params::new()).await;
    conn.handle
        .send_event(Event::with_params("temp-change", Params::new().with("temperature", "3")))
        .unwrap();
    next_room(&mut conn).await;

    let session = conn.handle.session_id().clone();
    conn.handle.disconnect().await;

    let mut again = engine.connect(Some(session.clone()), Params::new()).await.unwrap();
    let room = next_room(&mut again).await;
    assert!((room.temperature - 22.5).abs() < 1e-4);
    assert_eq!(again.handle.session_id(), &session);
    assert_ne!(again.handle.id(), conn.handle.id());
}

#[tokio::test]
async fn expired_session_starts_fresh() {
    let engine = engine();
    let (mut conn, _) = mounted(&engine, Params::new()).await;
    conn.handle.send_event(Event::new("temp-up")).unwrap();
    next_room(&mut conn).await;
    let session = conn.handle.session_id().clone();
    conn.handle.disconnect().await;

    engine.store().expire(&session).await.unwrap();
    let mut again = engine.connect(Some(session.clone()), Params::new()).await.unwrap();
    assert_eq!(next_room(&mut again).await, Room::default());
    assert_eq!(again.handle.session_id(), &session);
}

#[tokio::test]
async fn checkpointing_saves_after_each_cycle() {
    let metrics = Arc::new(LiveMetrics::new());
    let hub = Arc::new(BroadcastHub::new(OriginPolicy::Include, metrics.clone()));
    let bridge = Arc::new(PubSubBridge::new(
        Arc::new(MemoryPubSub::new()),
        hub.clone(),
        metrics.clone(),
    ));
    let store = Arc::new(MemorySessionStore::default());
    let engine = LiveEngine::new(
        room_handler(Arc::new(Notify::new())),
        store.clone(),
        hub,
        bridge,
        metrics,
        EngineConfig {
            checkpoint_sessions: true,
        },
    );
    let (mut conn, _) = mounted(&engine, Params::new()).await;
    conn.handle.send_event(Event::new("temp-up")).unwrap();
    next_room(&mut conn).await;

    let saved: Room = serde_json::from_slice(
        &store.load(conn.handle.session_id()).await.unwrap(),
    )
    .unwrap();
    assert!((saved.temperature - 19.6).abs() < 1e-4);
    assert_eq!(conn.handle.state(), SocketState::Active);
}

fn engine_with(
    handler: LiveHandler<Room>,
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
) -> (LiveEngine<Room>, Arc<PubSubBridge>, Arc<LiveMetrics>) {
    let metrics = Arc::new(LiveMetrics::new());
    let hub = Arc::new(BroadcastHub::new(OriginPolicy::Include, metrics.clone()));
    let bridge = Arc::new(PubSubBridge::new(
        Arc::new(MemoryPubSub::new()),
        hub.clone(),
        metrics.clone(),
    ));
    let engine = LiveEngine::new(handler, store, hub, bridge.clone(), metrics.clone(), config);
    (engine, bridge, metrics)
}

async fn wait_for_sockets(engine: &LiveEngine<Room>, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.socket_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for hub registrations");
}

#[tokio::test]
async fn abandoned_connect_releases_everything() {
    let handler = LiveHandler::new(|ctx: MountContext<Room>| async move {
        ctx.socket.join("lobby");
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Room::default())
    })
    .subscribe(TopicBinding::new(
        "go-live",
        "status",
        json_decoder(|m: BusMessage| Value::from(m.text)),
    ));
    let (engine, bridge, metrics) = engine_with(
        handler,
        Arc::new(MemorySessionStore::default()),
        EngineConfig::default(),
    );

    // The transport gives up while the socket is still mounting
    let gave_up = tokio::time::timeout(
        Duration::from_millis(20),
        engine.connect(None, Params::new()),
    )
    .await;
    assert!(gave_up.is_err());
    assert_eq!(engine.socket_count(), 1);

    // Mounting finishes in the background, then the socket tears itself down
    wait_for_sockets(&engine, 0).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while bridge.subscription_count().await > 0 || metrics.snapshot().sockets.active > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(metrics.snapshot().sockets.mounts, 1);
    assert_eq!(engine.broadcast(BroadcastMessage::all("status", "hello")).delivered, 0);
}

/// Every read and write fails, as with a database that went away.
struct UnpluggedStore;

#[async_trait::async_trait]
impl SessionStore for UnpluggedStore {
    async fn load(&self, _id: &SessionId) -> Result<Vec<u8>, SessionError> {
        Err(SessionError::Storage("disk unplugged".into()))
    }

    async fn save(&self, _id: &SessionId, _state: Vec<u8>) -> Result<(), SessionError> {
        Err(SessionError::Storage("disk unplugged".into()))
    }

    async fn expire(&self, _id: &SessionId) -> Result<(), SessionError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        Ok(0)
    }
}

#[tokio::test]
async fn failing_store_load_mounts_fresh() {
    let (engine, _bridge, metrics) = engine_with(
        room_handler(Arc::new(Notify::new())),
        Arc::new(UnpluggedStore),
        EngineConfig::default(),
    );
    let session: SessionId = "kept-across-outage".parse().unwrap();

    let mut conn = engine.connect(Some(session.clone()), Params::new()).await.unwrap();
    assert_eq!(next_room(&mut conn).await, Room::default());
    assert_eq!(conn.handle.session_id(), &session);
    assert_eq!(metrics.snapshot().storage_errors, 1);

    conn.handle.send_event(Event::new("temp-up")).unwrap();
    assert!((next_room(&mut conn).await.temperature - 19.6).abs() < 1e-4);
}

#[tokio::test]
async fn failing_checkpoint_reports_storage_and_keeps_serving() {
    let (engine, _bridge, metrics) = engine_with(
        room_handler(Arc::new(Notify::new())),
        Arc::new(UnpluggedStore),
        EngineConfig {
            checkpoint_sessions: true,
        },
    );
    let (mut conn, _) = mounted(&engine, Params::new()).await;

    conn.handle.send_event(Event::new("temp-up")).unwrap();
    let err = next_error(&mut conn).await;
    assert_eq!(err.kind(), "storage");
    assert!(err.to_string().contains("disk unplugged"));
    let room = next_room(&mut conn).await;
    assert!((room.temperature - 19.6).abs() < 1e-4);
    assert_eq!(conn.handle.state(), SocketState::Active);

    let before = metrics.snapshot().storage_errors;
    assert!(before >= 1);

    // Assigns keep advancing in memory even though nothing persists
    conn.handle.send_event(Event::new("temp-up")).unwrap();
    assert_eq!(next_error(&mut conn).await.kind(), "storage");
    let room = next_room(&mut conn).await;
    assert!((room.temperature - 19.7).abs() < 1e-4);

    // The final save at disconnect fails too and is only counted
    let mid = metrics.snapshot().storage_errors;
    assert!(mid > before);
    conn.handle.disconnect().await;
    assert_eq!(conn.handle.state(), SocketState::Closed);
    assert_eq!(metrics.snapshot().storage_errors, mid + 1);
}

#[tokio::test]
async fn broadcast_during_failed_mount_counts_as_delivered() {
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let handler = LiveHandler::new(move |ctx: MountContext<Room>| {
        let gate = gate.clone();
        async move {
            ctx.socket.join("lobby");
            gate.notified().await;
            anyhow::bail!("thermostat offline")
        }
    });
    let (engine, _bridge, metrics) = engine_with(
        handler,
        Arc::new(MemorySessionStore::default()),
        EngineConfig::default(),
    );

    let pending = tokio::spawn({
        let engine = engine.clone();
        async move { engine.connect(None, Params::new()).await }
    });
    wait_for_sockets(&engine, 1).await;

    let report = engine.broadcast(BroadcastMessage::scoped(
        Scope::Group("lobby".into()),
        "status",
        "hello",
    ));
    assert_eq!(report.delivered, 1);

    release.notify_one();
    let refused = pending.await.unwrap();
    assert_eq!(refused.unwrap_err().kind(), "mount");

    // The enqueue stays counted although nobody handled it
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.fanout.deliveries, 1);
    assert_eq!(snapshot.sockets.mount_failures, 1);
    assert_eq!(snapshot.sockets.mounts, 0);
    assert_eq!(engine.socket_count(), 0);
}
