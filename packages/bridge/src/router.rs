use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use codex_bridge_error::{BridgeError, ErrorBody};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::chat;
use crate::config::Config;
use crate::history::{self, ThreadHistoryResponse, ThreadInfo, ThreadsResponse, DEFAULT_LIMIT};
use crate::identity::{self, IdentityVerifier};
use crate::manager::SessionManager;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub struct AppState {
    config: Arc<Config>,
    manager: SessionManager,
    identity: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let identity = identity::default_verifier(config.security_method);
        Self {
            manager: SessionManager::new(config.clone()),
            config,
            identity,
        }
    }

    /// Installs an external identity collaborator (e.g. a Keycloak
    /// introspection client) in place of the built-in one.
    pub fn with_identity_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.identity = verifier;
        self
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

#[derive(Debug)]
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// Absent means a new conversation.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub thread_id: String,
    pub message: String,
    #[schema(value_type = Vec<Object>)]
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub codex_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_version: Option<String>,
    pub api_key_configured: bool,
}

#[derive(Debug, Deserialize)]
pub struct ThreadsQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub thread_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub user_id: Option<String>,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_root, get_status, list_threads, get_history, post_chat),
    components(schemas(
        ChatMessage,
        ChatRequest,
        ChatResponse,
        StatusResponse,
        ThreadInfo,
        ThreadsResponse,
        ThreadHistoryResponse,
        ErrorBody,
    )),
    tags((name = "codex-bridge", description = "HTTP API for codex app-server"))
)]
struct ApiDoc;

pub fn build_router(state: Arc<AppState>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis() as u64
            );
        });

    Router::new()
        .route("/", get(get_root))
        .route("/status", get(get_status))
        .route("/threads", get(list_threads))
        .route("/history", get(get_history))
        .route("/chat", post(post_chat))
        .route("/openapi.json", get(get_openapi))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
}

#[utoipa::path(get, path = "/", responses((status = 200, description = "API info")))]
async fn get_root() -> Json<Value> {
    Json(json!({
        "name": "Codex API Bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /chat": "Send message (new or continue)",
            "GET /threads": "List conversations",
            "GET /history": "Get conversation history",
            "GET /status": "Health check",
        }
    }))
}

#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, body = StatusResponse))
)]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (available, version) = state.config.check_codex_availability().await;
    let key_configured = state.config.openai_api_key.is_some();

    let status = if available && key_configured {
        "ok"
    } else if available || key_configured {
        "degraded"
    } else {
        "unavailable"
    };

    Json(StatusResponse {
        status: status.to_string(),
        codex_available: available,
        codex_version: version,
        api_key_configured: key_configured,
    })
}

#[utoipa::path(
    get,
    path = "/threads",
    responses(
        (status = 200, body = ThreadsResponse),
        (status = 503, body = ErrorBody)
    )
)]
async fn list_threads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<ThreadsResponse>, ApiError> {
    let user_id =
        identity::resolve_user_id(&state.config, None, &headers, query.user_id.as_deref())?;
    state
        .identity
        .verify(identity::bearer_token(&headers).as_deref(), &user_id)
        .await?;

    let lease = state.manager.acquire(&user_id).await?;
    let response = history::list_threads(
        lease.session(),
        query.limit.unwrap_or(DEFAULT_LIMIT),
        query.cursor.as_deref(),
    )
    .await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/history",
    responses(
        (status = 200, body = ThreadHistoryResponse),
        (status = 404, body = ErrorBody)
    )
)]
async fn get_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ThreadHistoryResponse>, ApiError> {
    let user_id =
        identity::resolve_user_id(&state.config, None, &headers, query.user_id.as_deref())?;
    state
        .identity
        .verify(identity::bearer_token(&headers).as_deref(), &user_id)
        .await?;

    let lease = state.manager.acquire(&user_id).await?;
    let response = history::thread_history(lease.session(), &query.thread_id).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream or aggregated ChatResponse"),
        (status = 400, body = ErrorBody),
        (status = 404, body = ErrorBody),
        (status = 503, body = ErrorBody)
    )
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    // Only the last message's content is the prompt.
    let prompt = request
        .messages
        .last()
        .map(|message| message.content.clone())
        .unwrap_or_default();
    if prompt.trim().is_empty() {
        return Err(BridgeError::validation("Empty message").into());
    }

    let user_id = identity::resolve_user_id(
        &state.config,
        request.user_id.as_deref(),
        &headers,
        query.user_id.as_deref(),
    )?;
    state
        .identity
        .verify(identity::bearer_token(&headers).as_deref(), &user_id)
        .await?;

    tracing::info!(
        user_id,
        thread_id = request.thread_id.as_deref().unwrap_or("<new>"),
        stream = request.stream,
        "chat request"
    );

    let lease = state.manager.acquire(&user_id).await?;
    let handle = lease
        .session()
        .send_turn(
            request.thread_id.clone(),
            &prompt,
            request.model.as_deref(),
        )
        .await?;

    let turn_timeout = state.config.turn_timeout;
    if request.stream {
        let stream = chat::sse_turn_stream(lease, handle, turn_timeout);
        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
            .into_response())
    } else {
        let aggregated = chat::aggregate_turn(&lease, handle, turn_timeout).await?;
        Ok(Json(ChatResponse {
            thread_id: aggregated.thread_id,
            message: aggregated.message,
            events: aggregated.events,
        })
        .into_response())
    }
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
