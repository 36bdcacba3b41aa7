use crate::bridge::{ProcessBridge, ProcessStream, SpawnError};
use crate::config::ToolConfig;
use crate::protocol::{Envelope, ValidationIssue, chat_request_schema};
use crate::request::{self, ChatRequest, RequestError};
use crate::resolver::CommandResolver;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ServerConfig {
    pub listen: String,
    pub tool: ToolConfig,
}

struct ServerState {
    bridge: ProcessBridge,
    shutdown: CancellationToken,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let resolver = Arc::new(CommandResolver::new(config.tool.clone()));
    let bridge = ProcessBridge::new(resolver, config.tool.api_key_env);

    let listener = TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, "cli-bridge listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    serve(listener, bridge, shutdown).await?;

    Ok(())
}

/// Serves until `shutdown` is cancelled. Cancelling also ends every open
/// event stream, which drops its process.
pub async fn serve(
    listener: TcpListener,
    bridge: ProcessBridge,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(bridge, shutdown.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

pub fn router(bridge: ProcessBridge, shutdown: CancellationToken) -> Router {
    let state = Arc::new(ServerState { bridge, shutdown });

    Router::new()
        .route("/api/chat", get(chat_from_query).post(chat_from_body))
        .route("/api/chat/schema", get(chat_schema))
        .with_state(state)
}

/// Point at which a chat response commits to the event stream.
///
/// Until the stream is committed a failure can still change the status code
/// and be reported as an [`Envelope`]. Afterwards it can only be an in-band
/// `error` event.
#[derive(Debug, Clone, Copy)]
enum Commitment {
    /// Spawn first; a spawn failure is a 500 envelope.
    AfterSpawn,
    /// Commit first; a spawn failure is the stream's only event.
    BeforeSpawn,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, envelope): (StatusCode, Envelope) = match self {
            ApiError::Request(RequestError::Invalid(details)) => (
                StatusCode::BAD_REQUEST,
                Envelope::failure("Validation error").with_details(details),
            ),
            ApiError::Request(err @ RequestError::MissingPrompt) => {
                (StatusCode::BAD_REQUEST, Envelope::failure(err.to_string()))
            }
            ApiError::Spawn(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Envelope::failure(err.to_string()),
            ),
        };
        (status, Json(envelope)).into_response()
    }
}

async fn chat_from_body(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(value)) => request::from_body(value),
        Err(rejection) => Err(RequestError::Invalid(vec![ValidationIssue::new(
            "",
            rejection.body_text(),
        )])),
    };

    match request {
        Ok(request) => relay(&state, request, Commitment::AfterSpawn).await,
        Err(err) => {
            info!(error = %err, "rejected chat submission");
            ApiError::from(err).into_response()
        }
    }
}

async fn chat_from_query(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match request::from_query(&params) {
        Ok(request) => relay(&state, request, Commitment::BeforeSpawn).await,
        Err(err) => {
            info!(error = %err, "rejected chat query");
            ApiError::from(err).into_response()
        }
    }
}

async fn chat_schema() -> Json<Envelope<schemars::Schema>> {
    Json(Envelope::ok(chat_request_schema()))
}

async fn relay(state: &ServerState, request: ChatRequest, commitment: Commitment) -> Response {
    let bridge = &state.bridge;
    info!(
        sandbox = request.sandbox,
        yolo = request.yolo,
        model = ?request.model,
        ?commitment,
        "starting chat stream"
    );

    let events = match commitment {
        Commitment::AfterSpawn => match bridge.spawn(&request).await {
            Ok(events) => events,
            Err(err) => return ApiError::from(err).into_response(),
        },
        Commitment::BeforeSpawn => bridge.stream(&request).await,
    };
    info!(pid = ?events.pid(), "streaming tool output");

    event_stream(events, state.shutdown.clone()).into_response()
}

fn event_stream(events: ProcessStream, shutdown: CancellationToken) -> impl IntoResponse {
    let frames = events
        .take_until(shutdown.cancelled_owned())
        .map(|event| Event::default().json_data(event));

    (
        [(header::CONNECTION, "keep-alive")],
        Sse::new(frames).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        ),
    )
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("shutting down");
    shutdown.cancel();
}
