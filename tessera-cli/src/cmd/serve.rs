//! `tessera serve` -- task requests over HTTP.
//!
//! Endpoints:
//!   POST /v1/tasks   one task message in, its outbound messages out as SSE
//!   GET  /v1/tasks   registered tasks and whether their model is loaded
//!   GET  /health

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use tessera_core::{
    DispatchSettings, OutboundMessage, Outbox, ResourceCache, TaskDispatcher, TaskKind,
    WorkerConfig,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

pub struct ServerState {
    cache: Arc<ResourceCache>,
    settings: DispatchSettings,
}

impl ServerState {
    pub fn new(cache: Arc<ResourceCache>, settings: DispatchSettings) -> Self {
        Self { cache, settings }
    }
}

#[derive(Serialize)]
struct TaskEntry {
    task: TaskKind,
    source: String,
    loaded: bool,
}

pub async fn execute(config: WorkerConfig, host: &str, port: u16) -> Result<()> {
    let cache = super::resource_cache(&config)?;
    let app = build_router(Arc::new(ServerState::new(
        cache,
        DispatchSettings::from(&config),
    )));

    let addr = format!("{host}:{port}");
    eprintln!();
    eprintln!("Tessera server listening on http://{addr}");
    eprintln!("  POST /v1/tasks");
    eprintln!("  GET  /v1/tasks");
    eprintln!("  GET  /health");
    eprintln!();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/v1/tasks", get(handle_list_tasks).post(handle_submit_task))
        .route("/health", get(handle_health))
        .with_state(state)
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_list_tasks(State(state): State<Arc<ServerState>>) -> Json<Vec<TaskEntry>> {
    let entries = TaskKind::ALL
        .into_iter()
        .filter_map(|task| {
            state.cache.source(task).map(|source| TaskEntry {
                task,
                source: source.to_string(),
                loaded: state.cache.is_loaded(task),
            })
        })
        .collect();
    Json(entries)
}

/// Run one task and stream every message it posts. The stream ends after
/// the terminal message, or empty if the task failed silently.
async fn handle_submit_task(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<Value>,
) -> Response {
    let known = message
        .get("task")
        .and_then(Value::as_str)
        .is_some_and(|name| name.parse::<TaskKind>().is_ok());
    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown task", "task": message.get("task") })),
        )
            .into_response();
    }

    let (outbox, outgoing) = Outbox::channel();
    let dispatcher = TaskDispatcher::new(Arc::clone(&state.cache), outbox, state.settings);
    tokio::spawn(async move { dispatcher.dispatch(message).await });

    let events = UnboundedReceiverStream::new(outgoing).map(|message| {
        Event::default()
            .event(event_name(&message))
            .json_data(&message)
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_name(message: &OutboundMessage) -> &'static str {
    match message {
        OutboundMessage::Download { .. } => "download",
        OutboundMessage::Update { .. } => "update",
        OutboundMessage::Result { .. } => "result",
        OutboundMessage::Error { .. } => "error",
    }
}
