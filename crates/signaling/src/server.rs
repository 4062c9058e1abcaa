use crate::config::{SignalingServerConfig, StoreBackend};
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::repository::memory_repository::{InMemoryCallLog, InMemoryConversations, InMemoryDirectory};
use crate::repository::redis_repository::RedisRepository;
use crate::repository::{CallLogStore, ConversationStore, DirectoryStore};
use crate::router::EventRouter;
use crate::services::call_service::{CallError, CallService, CallServiceDeps};
use crate::services::room_provider::{HttpRoomProvider, LocalRoomProvider, RoomProvider};
use shared::events::{ClientEvent, ConnectionReady, ServerEvent};
use shared::models::{
    ActiveCallResponse, CallHistoryQuery, CallHistoryResponse, CallId, CallSession, InitiateCallResponse,
    RoomCreateRequest, RoomInfo, StartCallRequest, UserId,
};

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

const USER_HEADER: &str = "x-user-id";
// rooms handed out by the in-process provider never report an empty room
const LOCAL_ROOM_PARTICIPANTS: u32 = 2;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct AppState {
    config: Arc<SignalingServerConfig>,
    presence: Arc<PresenceRegistry>,
    service: Arc<CallService>,
    router: EventRouter,
}

impl AppState {
    pub fn new(config: SignalingServerConfig, presence: Arc<PresenceRegistry>, service: Arc<CallService>) -> Self {
        Self {
            config: Arc::new(config),
            router: EventRouter::new(service.clone(), presence.clone()),
            presence,
            service,
        }
    }
}

struct Stores {
    call_log: Arc<dyn CallLogStore>,
    directory: Arc<dyn DirectoryStore>,
    conversations: Arc<dyn ConversationStore>,
}

async fn open_stores(config: &SignalingServerConfig) -> anyhow::Result<Stores> {
    match config.store {
        StoreBackend::Memory => Ok(Stores {
            call_log: Arc::new(InMemoryCallLog::new()),
            directory: Arc::new(InMemoryDirectory::with_pairs(config.friend_pairs.clone())),
            conversations: Arc::new(InMemoryConversations::new()),
        }),
        StoreBackend::Redis => {
            if config.redis_require_tls && !config.redis_url.starts_with("rediss://") {
                anyhow::bail!(
                    "Redis TLS required but URL is not rediss:// (got: {}). Set SIGNALING_REDIS_REQUIRE_TLS=false only for local development.",
                    config.redis_url
                );
            }
            let repo = Arc::new(RedisRepository::connect(&config.redis_url, config.redis_key_prefix.clone()).await?);
            for (a, b) in &config.friend_pairs {
                repo.befriend(a, b).await?;
            }
            Ok(Stores {
                call_log: repo.clone(),
                directory: repo.clone(),
                conversations: repo,
            })
        }
    }
}

fn room_provider(config: &SignalingServerConfig) -> anyhow::Result<Arc<dyn RoomProvider>> {
    match &config.room_provider.base_url {
        Some(base_url) => Ok(Arc::new(HttpRoomProvider::new(base_url.clone(), &config.room_provider)?)),
        None => {
            warn!("No room provider configured, serving in-process rooms");
            Ok(Arc::new(LocalRoomProvider::new(
                config.public_base_url.clone(),
                LOCAL_ROOM_PARTICIPANTS,
            )))
        }
    }
}

pub async fn run_server(config: SignalingServerConfig) -> anyhow::Result<()> {
    let presence = Arc::new(PresenceRegistry::new());
    let stores = open_stores(&config).await?;
    let service = CallService::new(
        CallServiceDeps {
            presence: presence.clone(),
            rooms: room_provider(&config)?,
            call_log: stores.call_log,
            directory: stores.directory,
            conversations: stores.conversations,
        },
        config.calls.clone(),
    );
    let state = AppState::new(config, presence, service);

    let listen_addr = state.config.listen_addr;
    let listener = TcpListener::bind(listen_addr).await?;
    info!(address = %listen_addr, "Starting signaling server");
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.shutdown().await;
    info!("Signaling server stopped");
    Ok(())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_upgrade))
        .route("/rooms", post(create_room))
        .route("/calls", post(initiate_call))
        .route("/calls/history", get(call_history))
        .route("/calls/active", get(active_call))
        .route("/calls/:call_id", get(call_status))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// Root handler for "/"
async fn root() -> impl IntoResponse {
    (StatusCode::OK, "Server OK!")
}

#[derive(Serialize)]
struct SignalingServerInfo {
    public_base_url: String,
    online_users: usize,
    live_calls: usize,
    monitor_interval_secs: u64,
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    let body = SignalingServerInfo {
        public_base_url: state.config.public_base_url.clone(),
        online_users: state.presence.online_count().await,
        live_calls: state.service.live_calls().await,
        monitor_interval_secs: state.config.calls.monitor_interval.as_secs(),
    };
    (StatusCode::OK, Json(body))
}

fn acting_user(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    message: "Missing X-User-Id header".to_string(),
                }),
            )
        })
}

fn call_err(err: CallError) -> ApiError {
    let status = match &err {
        CallError::Validation(_) => StatusCode::BAD_REQUEST,
        CallError::AlreadyInCall | CallError::UserUnavailable | CallError::InvalidState(_) => StatusCode::CONFLICT,
        CallError::NotFriends | CallError::Unauthorized => StatusCode::FORBIDDEN,
        CallError::SessionNotFound => StatusCode::NOT_FOUND,
        CallError::RoomAllocationFailed(_) => StatusCode::BAD_GATEWAY,
        CallError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            message: err.to_string(),
        }),
    )
}

#[instrument(skip(state, headers, payload))]
async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RoomCreateRequest>,
) -> Result<(StatusCode, Json<RoomInfo>), ApiError> {
    acting_user(&headers)?;
    let room = state.service.create_room(payload.name).await.map_err(call_err)?;
    Ok((StatusCode::CREATED, Json(room)))
}

#[instrument(skip(state, headers, payload))]
async fn initiate_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartCallRequest>,
) -> Result<(StatusCode, Json<InitiateCallResponse>), ApiError> {
    let caller_id = acting_user(&headers)?;
    let call = state
        .service
        .initiate(&caller_id, &payload.receiver_id, payload.call_type)
        .await
        .map_err(call_err)?;
    let response = InitiateCallResponse {
        success: true,
        room_url: call.room_url.clone(),
        call,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

#[instrument(skip(state, headers))]
async fn call_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallHistoryQuery>,
) -> Result<(StatusCode, Json<CallHistoryResponse>), ApiError> {
    let user_id = acting_user(&headers)?;
    let history = state
        .service
        .history(&user_id, query.page, query.limit)
        .await
        .map_err(call_err)?;
    Ok((StatusCode::OK, Json(history)))
}

#[instrument(skip(state, headers))]
async fn active_call(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ActiveCallResponse>), ApiError> {
    let user_id = acting_user(&headers)?;
    let call = state.service.active_call(&user_id).await;
    Ok((StatusCode::OK, Json(ActiveCallResponse { call })))
}

#[instrument(skip(state, headers))]
async fn call_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<CallId>,
) -> Result<(StatusCode, Json<CallSession>), ApiError> {
    let user_id = acting_user(&headers)?;
    let call = state.service.call_status(call_id, &user_id).await.map_err(call_err)?;
    Ok((StatusCode::OK, Json(call)))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn = ConnectionHandle::new(tx);
    let connection_id = conn.id();

    // Forward queued events to the WebSocket client
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = event.name(), error = %err, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    conn.send(ServerEvent::ConnectionReady(ConnectionReady { connection_id }));
    debug!(connection_id = %connection_id, "WebSocket connected");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => state.router.dispatch(&conn, event).await,
            Err(err) => {
                conn.send(ServerEvent::error(format!("Malformed event: {err}")));
            }
        }
    }

    state.router.disconnect(connection_id).await;
    writer.abort();
    debug!(connection_id = %connection_id, "WebSocket closed");
}
