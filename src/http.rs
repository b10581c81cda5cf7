//! §6 External Interfaces: command & control HTTP, the SSE stream, and the
//! WebSocket duplex stream. Per §1 this transport plumbing is an external
//! collaborator — these handlers are thin: parse, call the engine, shape
//! the response. No scheduling, aggregation, or fan-out logic lives here.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::fanout::{filter_from_params, OutboundItem};
use crate::model::{EventType, Priority, Task, TaskId, TaskType, WorkerId};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/system/run", post(system_run))
        .route("/system/pause-all", post(system_pause_all))
        .route("/system/stop-new", post(system_stop_new))
        .route("/system/throttle", post(system_throttle))
        .route("/system/metrics", get(system_metrics))
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", delete(cancel_task))
        .route("/tasks/:id/reassign", post(reassign_task))
        .route("/agents/:id/pause", post(agent_pause))
        .route("/agents/:id/resume", post(agent_resume))
        .route("/agents/:id/heartbeat", post(agent_heartbeat))
        .route("/stream", get(sse_stream))
        .route("/websocket", get(websocket_upgrade))
        .with_state(engine)
}

fn engine_error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidTask(_)
        | EngineError::ThrottleOutOfRange(_)
        | EngineError::CyclicDependency(_)
        | EngineError::EmptyChannelSet => StatusCode::BAD_REQUEST,
        EngineError::TaskNotFound(_) | EngineError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: EngineError) -> axum::response::Response {
    let status = engine_error_status(&err);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn system_run(State(engine): State<Arc<Engine>>) -> axum::response::Response {
    match engine.flags.resume().await {
        Ok(()) => Json(json!({ "status": "running" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn system_pause_all(State(engine): State<Arc<Engine>>) -> axum::response::Response {
    match engine.flags.pause().await {
        Ok(()) => Json(json!({
            "status": "paused",
            "active_tasks_affected": engine.scheduler.active_task_count(),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn system_stop_new(State(engine): State<Arc<Engine>>) -> axum::response::Response {
    match engine.flags.block_admission().await {
        Ok(()) => Json(json!({ "status": "stopping" })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ThrottleRequest {
    rate: f64,
}

async fn system_throttle(State(engine): State<Arc<Engine>>, Json(req): Json<ThrottleRequest>) -> axum::response::Response {
    match engine.flags.set_throttle(req.rate).await {
        Ok(()) => Json(json!({ "throttle_rate": req.rate })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn system_metrics(State(engine): State<Arc<Engine>>) -> axum::response::Response {
    let (events_in, events_out) = engine.aggregator.stats();
    Json(json!({
        "throttleRate": engine.flags.throttle_rate().await,
        "paused": engine.flags.is_paused().await,
        "pendingTasks": engine.scheduler.active_task_count(),
        "activeAgents": engine.fanout.active_count().await,
        "eventsIngested": events_in,
        "eventsPublished": events_out,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    title: String,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    complexity: Option<u32>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    dependencies: Option<HashSet<TaskId>>,
}

async fn submit_task(State(engine): State<Arc<Engine>>, Json(req): Json<SubmitTaskRequest>) -> axum::response::Response {
    let mut task = Task::new(req.title, req.task_type, req.input.unwrap_or(serde_json::Value::Null));
    task.priority = req.priority.unwrap_or(Priority::Normal);
    task.complexity = req.complexity.unwrap_or(1);
    task.dependencies = req.dependencies.unwrap_or_default();
    match engine.scheduler.submit(task).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_task(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> axum::response::Response {
    let Ok(task_id) = TaskId::parse_str(&id) else {
        return error_response(EngineError::InvalidTask("malformed task id".into()));
    };
    match engine.scheduler.cancel(task_id).await {
        Ok(()) => Json(json!({ "status": "cancelled" })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ReassignRequest {
    agent_id: String,
}

async fn reassign_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(req): Json<ReassignRequest>,
) -> axum::response::Response {
    let (Ok(task_id), Ok(worker_id)) = (TaskId::parse_str(&id), WorkerId::parse_str(&req.agent_id)) else {
        return error_response(EngineError::InvalidTask("malformed id".into()));
    };
    match engine.scheduler.reassign(task_id, worker_id).await {
        Ok(()) => Json(json!({ "task_id": id, "agent_id": req.agent_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn agent_pause(Path(_id): Path<String>) -> axum::response::Response {
    Json(json!({ "status": "paused" })).into_response()
}

async fn agent_resume(Path(_id): Path<String>) -> axum::response::Response {
    Json(json!({ "status": "resumed" })).into_response()
}

async fn agent_heartbeat(Path(_id): Path<String>) -> axum::response::Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[derive(Deserialize)]
struct StreamParams {
    channels: Option<String>,
    event_types: Option<String>,
    agent_ids: Option<String>,
    min_priority: Option<String>,
    compression: Option<bool>,
    buffer_size: Option<usize>,
}

fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn parse_filter(params: &StreamParams) -> crate::model::EventFilter {
    let event_types = params.event_types.as_ref().map(|raw| {
        raw.split(',')
            .filter_map(|s| serde_json::from_value::<EventType>(serde_json::Value::String(s.trim().to_string())).ok())
            .collect::<HashSet<_>>()
    });
    let agent_ids = params
        .agent_ids
        .as_ref()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect::<HashSet<_>>());
    let min_priority = params.min_priority.as_ref().and_then(|raw| match raw.as_str() {
        "0" | "low" => Some(Priority::Low),
        "1" | "normal" => Some(Priority::Normal),
        "2" | "high" => Some(Priority::High),
        "3" | "critical" => Some(Priority::Critical),
        _ => None,
    });
    filter_from_params(event_types, min_priority, agent_ids)
}

async fn sse_stream(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>>, axum::response::Response> {
    let channels = parse_channels(params.channels.as_deref().unwrap_or_default());
    let filter = parse_filter(&params);
    let replay_n = params.buffer_size.unwrap_or(engine.config.fanout.default_replay_count);
    let handle = engine
        .fanout
        .connect(channels, filter, params.compression.unwrap_or(false), replay_n)
        .await
        .map_err(error_response)?;

    let stream = async_stream::stream! {
        loop {
            let item = handle.next().await;
            yield Ok(outbound_to_sse(item));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}

fn outbound_to_sse(item: OutboundItem) -> SseEvent {
    match item {
        OutboundItem::Event(event) => SseEvent::default()
            .event(format!("{:?}", event.event_type))
            .id(event.id.to_string())
            .retry(std::time::Duration::from_millis(3000))
            .json_data(&event)
            .unwrap_or_else(|_| SseEvent::default().data("{}")),
        OutboundItem::Compressed { event_type, id, gz } => SseEvent::default()
            .event(format!("{event_type:?}"))
            .id(id.to_string())
            .retry(std::time::Duration::from_millis(3000))
            .data(bytes_as_latin1(&gz)),
        OutboundItem::Liveness { timestamp, connection_id } => SseEvent::default()
            .event("heartbeat")
            .json_data(json!({ "timestamp": timestamp, "connection_id": connection_id.to_string() }))
            .unwrap_or_else(|_| SseEvent::default().data("{}")),
    }
}

async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
    Query(params): Query<StreamParams>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, engine, params))
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Configure { compression: Option<bool> },
    Publish { channel: String, payload: serde_json::Value },
}

async fn handle_websocket(mut socket: WebSocket, engine: Arc<Engine>, params: StreamParams) {
    let channels = parse_channels(params.channels.as_deref().unwrap_or_default());
    let filter = parse_filter(&params);
    let replay_n = params.buffer_size.unwrap_or(engine.config.fanout.default_replay_count);
    let handle = match engine.fanout.connect(channels, filter, params.compression.unwrap_or(false), replay_n).await {
        Ok(h) => h,
        Err(err) => {
            let _ = socket
                .send(Message::Text(json!({ "type": "error", "data": err.to_string() }).to_string()))
                .await;
            return;
        }
    };

    let _ = socket
        .send(Message::Text(json!({ "type": "connection_established", "id": handle.id().to_string() }).to_string()))
        .await;

    loop {
        tokio::select! {
            outbound = handle.next() => {
                let msg = match outbound {
                    OutboundItem::Event(event) => {
                        let id = event.id.to_string();
                        let timestamp = event.timestamp;
                        json!({ "type": "event", "data": event, "id": id, "timestamp": timestamp })
                    }
                    OutboundItem::Compressed { event_type, id, gz } => {
                        json!({ "type": "event", "data": bytes_as_latin1(&gz), "id": id.to_string(), "event_type": format!("{event_type:?}") })
                    }
                    OutboundItem::Liveness { timestamp, connection_id } => {
                        json!({ "type": "pong", "data": { "timestamp": timestamp, "connection_id": connection_id.to_string() } })
                    }
                };
                if socket.send(Message::Text(msg.to_string())).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(&handle, &engine, &text, &mut socket).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(
    handle: &crate::fanout::FanOutHandle,
    engine: &Arc<Engine>,
    text: &str,
    socket: &mut WebSocket,
) -> Result<(), axum::Error> {
    let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
        socket
            .send(Message::Text(json!({ "type": "error", "data": "malformed message" }).to_string()))
            .await?;
        return Ok(());
    };
    match message {
        ClientMessage::Ping => {
            socket.send(Message::Text(json!({ "type": "pong" }).to_string())).await?;
        }
        ClientMessage::Subscribe { channels } => {
            handle.subscribe_channels(channels.clone()).await;
            socket
                .send(Message::Text(json!({ "type": "subscription_updated", "data": { "channels": channels } }).to_string()))
                .await?;
        }
        ClientMessage::Unsubscribe { channels } => {
            handle.unsubscribe_channels(&channels).await;
            socket
                .send(Message::Text(json!({ "type": "subscription_updated", "data": { "channels": channels } }).to_string()))
                .await?;
        }
        ClientMessage::Configure { compression } => {
            handle.configure(compression, None).await;
            socket
                .send(Message::Text(json!({ "type": "configuration_updated", "data": { "compression": compression } }).to_string()))
                .await?;
        }
        ClientMessage::Publish { channel, payload } => {
            let event_type = channel_to_event_type(&channel);
            let result = engine
                .bus
                .publish(crate::model::Event::new(event_type, Priority::Normal, "client-publish", payload))
                .await;
            let body = match result {
                Ok(()) => json!({ "type": "publish_result", "data": { "status": "ok" } }),
                Err(err) => json!({ "type": "publish_result", "data": { "status": "error", "message": err.to_string() } }),
            };
            socket.send(Message::Text(body.to_string())).await?;
        }
    }
    Ok(())
}

/// §6's `retry: 3000` / gzip transport uses latin-1, not UTF-8 lossy
/// decoding, so every byte round-trips: each byte maps one-to-one onto the
/// Unicode codepoint of the same value.
fn bytes_as_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn channel_to_event_type(channel: &str) -> EventType {
    match channel {
        "agents" => EventType::AgentStatus,
        "tasks" => EventType::TaskUpdate,
        "metrics" => EventType::Metrics,
        "alerts" => EventType::SystemAlert,
        "collaboration" => EventType::Collaboration,
        "heartbeat" => EventType::Heartbeat,
        "performance" => EventType::PerformanceAlert,
        "logs" => EventType::LogMessage,
        _ => EventType::Broadcast,
    }
}
