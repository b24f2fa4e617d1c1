use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use session_relay_error::{ErrorType, ProblemDetails, RelayError};
use session_relay_sandbox_lifecycle::{CreateOptions, Session, SessionStatus};
use session_relay_stream_bridge::{ClientEvent, OutboundFrame, StreamFormat};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::coordinator::{CallbackReport, ChatStream, CoordinatorRegistry};
use crate::dispatch::ChatRequest;

pub const EXECUTION_ID_HEADER: &str = "x-execution-id";

pub struct AppState {
    auth: AuthConfig,
    coordinators: Arc<CoordinatorRegistry>,
}

impl AppState {
    pub fn new(auth: AuthConfig, coordinators: CoordinatorRegistry) -> Self {
        Self {
            auth,
            coordinators: Arc::new(coordinators),
        }
    }

    pub fn coordinators(&self) -> &Arc<CoordinatorRegistry> {
        &self.coordinators
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let mut client_router = Router::new()
        .route(
            "/sessions/:session_id",
            post(create_session).get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/init", post(init_session))
        .route("/sessions/:session_id/chat", post(start_chat))
        .with_state(shared.clone());
    if shared.auth.token.is_some() {
        client_router = client_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    // Authenticated by the execution token, never the operator token.
    let public_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/sessions/:session_id/callback", post(session_callback))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", client_router.merge(public_router));

    let http_logging = match std::env::var("SESSION_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("SESSION_RELAY_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let headers: Vec<(String, String)> = req
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            let display_value = if name == header::AUTHORIZATION {
                                "<redacted>".to_string()
                            } else {
                                value.to_str().unwrap_or("<binary>").to_string()
                            };
                            (name.as_str().to_string(), display_value)
                        })
                        .collect();
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        create_session,
        get_session,
        delete_session,
        init_session,
        start_chat,
        session_callback
    ),
    components(
        schemas(
            HealthResponse,
            ProvisionRequest,
            SessionInfo,
            DeleteSessionQuery,
            InitRequest,
            ChatRequest,
            StreamFormat,
            ClientEvent,
            CallbackReport,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session lifecycle and chat"),
        (name = "callbacks", description = "Agent output callbacks")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub sandbox_id: String,
    pub user_id: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_command: Option<String>,
    #[serde(default)]
    pub relay_env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// One of `creating`, `active`, `sleeping`, `terminated`, `pending-delete`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuity_id: Option<String>,
    pub last_active_at: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        let status = match session.status {
            SessionStatus::Creating => "creating",
            SessionStatus::Active => "active",
            SessionStatus::Sleeping => "sleeping",
            SessionStatus::Terminated => "terminated",
            SessionStatus::PendingDelete => "pending-delete",
        };
        Self {
            id: session.id,
            sandbox_id: session.sandbox_id,
            user_id: session.user_id,
            status: status.to_string(),
            continuity_id: session.continuity_id,
            last_active_at: session.last_active_at.to_rfc3339(),
            created_at: session.created_at.to_rfc3339(),
            last_error: session
                .metadata
                .last_error
                .or(session.metadata.last_wake_error),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct DeleteSessionQuery {
    /// Keep the record as `pending-delete` instead of `terminated`.
    #[serde(default)]
    pub pending: bool,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}",
    request_body = ProvisionRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 201, body = SessionInfo),
        (status = 400, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let options = CreateOptions {
        env: request.env,
        repository_url: request.repository_url,
        workspace_dir: request.workspace_dir,
        relay_command: request.relay_command,
        relay_env: request.relay_env,
    };
    let session = state
        .coordinators
        .get(&session_id)
        .await
        .provision(&request.sandbox_id, &request.user_id, options)
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.coordinators.session(&session_id).await?;
    Ok(Json(session.into()))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = String, Path, description = "Session id"),
        DeleteSessionQuery
    ),
    responses(
        (status = 200, body = SessionInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeleteSessionQuery>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state
        .coordinators
        .open(&session_id)
        .await?
        .delete(query.pending)
        .await?;
    Ok(Json(session.into()))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/init",
    request_body = InitRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Owning user recorded"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn init_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<InitRequest>,
) -> Result<StatusCode, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(RelayError::InvalidRequest {
            message: "userId must not be empty".to_string(),
        }
        .into());
    }
    state
        .coordinators
        .open(&session_id)
        .await?
        .init(&request.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/chat",
    request_body = ChatRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of client events, or NDJSON when format is raw"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn start_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let chat = state
        .coordinators
        .open(&session_id)
        .await?
        .start_chat(request)
        .await?;
    Ok(chat_response(chat))
}

fn chat_response(chat: ChatStream) -> Response {
    let ChatStream {
        execution_id,
        format,
        frames,
        ..
    } = chat;
    let frames = ReceiverStream::new(frames);
    let mut response = match format {
        StreamFormat::Events => Sse::new(frames.map(|frame| Ok::<_, Infallible>(to_sse_event(frame))))
            .into_response(),
        StreamFormat::Raw => {
            let body = Body::from_stream(
                frames.map(|frame| Ok::<_, Infallible>(Bytes::from(ndjson_line(frame)))),
            );
            let mut response = Response::new(body);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-ndjson"),
            );
            response
        }
    };
    if let Ok(value) = HeaderValue::from_str(&execution_id) {
        response.headers_mut().insert(EXECUTION_ID_HEADER, value);
    }
    response
}

fn to_sse_event(frame: OutboundFrame) -> Event {
    match frame {
        OutboundFrame::Event(event) => Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")),
        OutboundFrame::Line(line) => Event::default().data(line),
    }
}

fn ndjson_line(frame: OutboundFrame) -> String {
    let mut line = match frame {
        OutboundFrame::Line(line) => line,
        OutboundFrame::Event(event) => {
            serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())
        }
    };
    line.push('\n');
    line
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/callback",
    request_body(content = String, description = "NDJSON agent output", content_type = "application/x-ndjson"),
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = CallbackReport),
        (status = 401, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "callbacks"
)]
async fn session_callback(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<CallbackReport>, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let report = state
        .coordinators
        .handle_callback(&session_id, authorization, body.into_data_stream())
        .await?;
    Ok(Json(report))
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(RelayError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            for engine in engines {
                let Ok(decoded) = engine.decode(rest) else {
                    continue;
                };
                let Ok(decoded) = String::from_utf8(decoded) else {
                    continue;
                };
                if let Some((_, password)) = decoded.split_once(':') {
                    return Some(password.to_string());
                }
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).expect("header value"),
        );
        headers
    }

    #[test]
    fn operator_token_schemes() {
        assert_eq!(
            extract_token(&headers_with("Bearer secret")).as_deref(),
            Some("secret")
        );
        assert_eq!(
            extract_token(&headers_with("token secret")).as_deref(),
            Some("secret")
        );
        let basic = base64::engine::general_purpose::STANDARD.encode("relay:secret");
        assert_eq!(
            extract_token(&headers_with(&format!("Basic {basic}"))).as_deref(),
            Some("secret")
        );
        assert_eq!(extract_token(&headers_with("Digest abc")), None);
        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn raw_frames_are_newline_terminated() {
        assert_eq!(
            ndjson_line(OutboundFrame::Line(r#"{"type":"done"}"#.to_string())),
            "{\"type\":\"done\"}\n"
        );
        let line = ndjson_line(OutboundFrame::Event(ClientEvent::error("boom")));
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"errorText\":\"boom\""));
    }
}
