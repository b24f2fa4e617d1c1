use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use session_relay::bundles::StaticBundleSource;
use session_relay::config::CoordinatorConfig;
use session_relay::router::EXECUTION_ID_HEADER;
use session_relay::secrets::StaticSecretStore;
use session_relay::{build_router, AppState, AuthConfig, CoordinatorRegistry, RelayServices};
use session_relay_callback_token::CallbackTokenSigner;
use session_relay_sandbox_lifecycle::testing::MockSandbox;
use session_relay_sandbox_lifecycle::{
    ConfigBundle, InMemorySessionStore, LifecycleConfig, SandboxCallError, SandboxLifecycle,
    Session, SessionStatus, SessionStore,
};
use tower::ServiceExt;

const SECRET: &str = "relay-test-secret";

struct Harness {
    router: Router,
    registry: Arc<CoordinatorRegistry>,
    sandbox: MockSandbox,
    store: Arc<InMemorySessionStore>,
    signer: CallbackTokenSigner,
}

async fn harness_with(status: SessionStatus, auth: AuthConfig, bridge_timeout: Duration) -> Harness {
    let config = CoordinatorConfig {
        bridge_timeout,
        ..CoordinatorConfig::default()
    };
    harness_with_config(status, auth, config).await
}

async fn harness_with_config(
    status: SessionStatus,
    auth: AuthConfig,
    config: CoordinatorConfig,
) -> Harness {
    let sandbox = MockSandbox::new();
    let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(3600)));
    let mut session = Session::new("s-1", "sbx-1");
    session.status = status;
    store.put(&session).await.expect("seed session");

    let secrets = StaticSecretStore::new(
        HashMap::from([("API_KEY".to_string(), "project-key".to_string())]),
        HashMap::from([(
            "u-1".to_string(),
            HashMap::from([
                ("GITHUB_TOKEN".to_string(), "user-token".to_string()),
                ("PATH".to_string(), "/evil".to_string()),
            ]),
        )]),
    );
    let bundles = StaticBundleSource::new(ConfigBundle {
        project_rules: "Keep answers short.".to_string(),
        ..ConfigBundle::default()
    });
    let signer = CallbackTokenSigner::new(SECRET);
    let services = RelayServices {
        lifecycle: SandboxLifecycle::new(
            Arc::new(sandbox.clone()),
            store.clone(),
            LifecycleConfig::default(),
        ),
        secrets: Arc::new(secrets),
        bundles: Arc::new(bundles),
        signer: signer.clone(),
        config,
    };
    let state = AppState::new(auth, CoordinatorRegistry::new(services));
    let registry = state.coordinators().clone();
    let router = build_router(state);
    Harness {
        router,
        registry,
        sandbox,
        store,
        signer,
    }
}

async fn harness() -> Harness {
    harness_with(
        SessionStatus::Active,
        AuthConfig::disabled(),
        Duration::from_secs(300),
    )
    .await
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router response")
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn callback_request(session_id: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/sessions/{session_id}/callback"))
        .header(header::CONTENT_TYPE, "application/x-ndjson");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

async fn body_string(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

fn execution_id(response: &Response) -> String {
    response
        .headers()
        .get(EXECUTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .expect("execution id header")
        .to_string()
}

/// Waits for the background dispatch to start `count` agent processes.
async fn started_processes(
    sandbox: &MockSandbox,
    count: usize,
) -> Vec<(String, HashMap<String, String>)> {
    for _ in 0..400 {
        let processes = sandbox.started_processes();
        if processes.len() >= count {
            return processes;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("agent process {count} was never started");
}

async fn wait_for_active_sessions(registry: &CoordinatorRegistry, count: usize) {
    for _ in 0..400 {
        if registry.active_sessions().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry never reached {count} active sessions");
}

fn raw_lines(streamed: &str) -> Vec<Value> {
    streamed
        .lines()
        .map(|line| serde_json::from_str(line).expect("line json"))
        .collect()
}

fn prompt_payload(sandbox: &MockSandbox, env: &HashMap<String, String>) -> Value {
    let contents = sandbox
        .file(&env["RELAY_PROMPT_FILE"])
        .expect("prompt file written");
    serde_json::from_str(&contents).expect("prompt json")
}

const AGENT_OUTPUT: &str = concat!(
    "{\"type\":\"session-init\",\"continuityId\":\"c-1\"}\n",
    "{\"type\":\"text-delta\",\"text\":\"Hi\"}\n",
    "{\"type\":\"done\"}\n",
);

#[tokio::test]
async fn chat_callback_round_trip_carries_continuity() {
    let h = harness().await;

    let response = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/init", json!({"userId": "u-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw", "model": "fast"}),
        ),
    )
    .await;
    assert_eq!(chat.status(), StatusCode::OK);
    assert_eq!(
        chat.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );
    let first_execution = execution_id(&chat);

    let processes = started_processes(&h.sandbox, 1).await;
    let (command, env) = &processes[0];
    assert_eq!(command, &CoordinatorConfig::default().agent_command);
    assert_eq!(env["RELAY_EXECUTION_ID"], first_execution);
    assert_eq!(env["RELAY_SESSION_ID"], "s-1");
    assert_eq!(env["API_KEY"], "project-key");
    assert_eq!(env["GITHUB_TOKEN"], "user-token");
    assert_ne!(env["PATH"], "/evil");

    let payload = prompt_payload(&h.sandbox, env);
    assert_eq!(payload["prompt"], "hello");
    assert_eq!(payload["executionId"], first_execution.as_str());
    assert_eq!(payload["model"], "fast");
    assert!(payload["continuityId"].is_null());
    assert_eq!(
        payload["callbackUrl"],
        "http://127.0.0.1:2468/v1/sessions/s-1/callback"
    );

    let token = env["RELAY_CALLBACK_TOKEN"].clone();
    let mut idle = h.store.get("s-1").await.expect("store").expect("session");
    let idle_since = idle.last_active_at - chrono::Duration::hours(1);
    idle.last_active_at = idle_since;
    h.store.put(&idle).await.expect("store");

    let callback = send(
        &h.router,
        callback_request("s-1", Some(&token), AGENT_OUTPUT),
    )
    .await;
    assert_eq!(callback.status(), StatusCode::OK);
    let report = body_json(callback).await;
    assert_eq!(report["executionId"], first_execution.as_str());
    assert_eq!(report["lines"], 3);
    assert_eq!(report["continuityId"], "c-1");

    let streamed = body_string(chat).await;
    assert_eq!(streamed, AGENT_OUTPUT);

    let stored = h.store.get("s-1").await.expect("store").expect("session");
    assert_eq!(stored.continuity_id.as_deref(), Some("c-1"));
    assert!(stored.last_active_at > idle_since);

    let _second = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/chat", json!({"prompt": "again"})),
    )
    .await;
    let processes = started_processes(&h.sandbox, 2).await;
    let payload = prompt_payload(&h.sandbox, &processes[1].1);
    assert_eq!(payload["prompt"], "again");
    assert_eq!(payload["continuityId"], "c-1");
}

#[tokio::test]
async fn events_format_streams_translated_client_events() {
    let h = harness().await;
    let chat = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/chat", json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(chat.status(), StatusCode::OK);
    assert!(chat.headers()[header::CONTENT_TYPE]
        .to_str()
        .expect("content type")
        .starts_with("text/event-stream"));

    let processes = started_processes(&h.sandbox, 1).await;
    let token = processes[0].1["RELAY_CALLBACK_TOKEN"].clone();
    let callback = send(
        &h.router,
        callback_request("s-1", Some(&token), AGENT_OUTPUT),
    )
    .await;
    assert_eq!(callback.status(), StatusCode::OK);

    let events: Vec<Value> = body_string(chat)
        .await
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).expect("event json"))
        .collect();
    let kinds: Vec<&str> = events
        .iter()
        .map(|event| event["type"].as_str().expect("type"))
        .collect();
    assert_eq!(kinds, vec!["text-start", "text-delta", "text-end", "finish"]);
    assert_eq!(events[1]["delta"], "Hi");
}

#[tokio::test(start_paused = true)]
async fn unanswered_chat_gets_one_error_event_then_closes() {
    let h = harness().await;
    let chat = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/chat", json!({"prompt": "hello"})),
    )
    .await;
    let processes = started_processes(&h.sandbox, 1).await;
    let token = processes[0].1["RELAY_CALLBACK_TOKEN"].clone();

    let streamed = body_string(chat).await;
    assert_eq!(streamed.matches("data: ").count(), 1);
    assert!(streamed.contains("\"type\":\"error\""));
    assert!(streamed.contains("did not respond in time"));

    // The bridge is gone, so a late callback has nowhere to go.
    let late = send(
        &h.router,
        callback_request("s-1", Some(&token), AGENT_OUTPUT),
    )
    .await;
    assert_eq!(late.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dispatch_failure_closes_stream_with_one_error() {
    let h = harness().await;
    h.sandbox
        .fail_process_start(SandboxCallError::Remote("no such binary".to_string()));

    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw"}),
        ),
    )
    .await;
    assert_eq!(chat.status(), StatusCode::OK);

    let streamed = body_string(chat).await;
    let lines: Vec<Value> = streamed
        .lines()
        .map(|line| serde_json::from_str(line).expect("line json"))
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["type"], "error");
    assert!(lines[0]["message"]
        .as_str()
        .expect("message")
        .contains("no such binary"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_sleeping_sandbox_fails_the_chat_and_stays_asleep() {
    let h = harness_with(
        SessionStatus::Sleeping,
        AuthConfig::disabled(),
        Duration::from_secs(300),
    )
    .await;
    h.sandbox.set_healthy(false);

    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw"}),
        ),
    )
    .await;
    let streamed = body_string(chat).await;
    assert_eq!(streamed.lines().count(), 1);
    assert!(streamed.contains("unavailable"));

    assert!(h.sandbox.started_processes().is_empty());
    let stored = h.store.get("s-1").await.expect("store").expect("session");
    assert_eq!(stored.status, SessionStatus::Sleeping);
    assert!(stored.metadata.last_wake_error.is_some());
}

#[tokio::test]
async fn callbacks_require_a_token_for_the_addressed_session() {
    let h = harness().await;
    let chat = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/chat", json!({"prompt": "hello"})),
    )
    .await;
    let execution = execution_id(&chat);
    started_processes(&h.sandbox, 1).await;

    let missing = send(&h.router, callback_request("s-1", None, AGENT_OUTPUT)).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let problem = body_json(missing).await;
    assert_eq!(problem["type"], "urn:session-relay:error:token_invalid");

    let forged = CallbackTokenSigner::new("other-secret")
        .sign(&execution, "s-1")
        .expect("sign");
    let response = send(&h.router, callback_request("s-1", Some(&forged), AGENT_OUTPUT)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let other_session = h.signer.sign(&execution, "s-2").expect("sign");
    let response = send(
        &h.router,
        callback_request("s-1", Some(&other_session), AGENT_OUTPUT),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unknown = h.signer.sign("no-such-execution", "s-1").expect("sign");
    let response = send(&h.router, callback_request("s-1", Some(&unknown), AGENT_OUTPUT)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let problem = body_json(response).await;
    assert_eq!(problem["type"], "urn:session-relay:error:no_active_stream");

    let valid = h.signer.sign(&execution, "s-1").expect("sign");
    let response = send(&h.router, callback_request("s-1", Some(&valid), AGENT_OUTPUT)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let replay = send(&h.router, callback_request("s-1", Some(&valid), AGENT_OUTPUT)).await;
    assert_eq!(replay.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn operator_token_guards_client_routes_only() {
    let h = harness_with(
        SessionStatus::Active,
        AuthConfig::with_token("operator".to_string()),
        Duration::from_secs(300),
    )
    .await;

    let health = send(
        &h.router,
        Request::builder()
            .uri("/v1/health")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await, json!({"status": "ok"}));

    let denied = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/init", json!({"userId": "u-1"})),
    )
    .await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let mut allowed = json_request(Method::POST, "/v1/sessions/s-1/init", json!({"userId": "u-1"}));
    allowed.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer operator".parse().expect("header"),
    );
    assert_eq!(send(&h.router, allowed).await.status(), StatusCode::NO_CONTENT);

    // Callbacks authenticate with the execution token instead.
    let token = h.signer.sign("no-such-execution", "s-1").expect("sign");
    let response = send(&h.router, callback_request("s-1", Some(&token), AGENT_OUTPUT)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let h = harness().await;
    let response = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/missing/init", json!({"userId": "u-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let problem = body_json(response).await;
    assert_eq!(problem["type"], "urn:session-relay:error:session_not_found");

    let response = send(
        &h.router,
        Request::builder()
            .uri("/v1/sessions/missing")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sessions_can_be_provisioned_and_deleted() {
    let h = harness().await;
    let response = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-new",
            json!({"sandboxId": "sbx-new", "userId": "u-1", "env": {"REGION": "eu"}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let info = body_json(response).await;
    assert_eq!(info["status"], "active");
    assert_eq!(info["sandboxId"], "sbx-new");
    assert_eq!(info["userId"], "u-1");
    assert_eq!(
        h.sandbox.file("/home/user/.agent/AGENTS.md").as_deref().map(|rules| rules.contains("Keep answers short.")),
        Some(true)
    );

    let duplicate = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-new",
            json!({"sandboxId": "sbx-new", "userId": "u-1"}),
        ),
    )
    .await;
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

    let deleted = send(
        &h.router,
        Request::builder()
            .method(Method::DELETE)
            .uri("/v1/sessions/s-new?pending=true")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(deleted.status(), StatusCode::OK);
    assert_eq!(body_json(deleted).await["status"], "pending-delete");
}

#[tokio::test]
async fn openapi_document_lists_the_routes() {
    let h = harness().await;
    let response = send(
        &h.router,
        Request::builder()
            .uri("/v1/openapi.json")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let document = body_json(response).await;
    let paths = document["paths"].as_object().expect("paths");
    for path in [
        "/v1/health",
        "/v1/sessions/{session_id}/init",
        "/v1/sessions/{session_id}/chat",
        "/v1/sessions/{session_id}/callback",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
}

#[tokio::test]
async fn next_chat_sees_continuity_as_soon_as_the_stream_closes() {
    let h = harness().await;
    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw"}),
        ),
    )
    .await;
    let processes = started_processes(&h.sandbox, 1).await;
    let token = processes[0].1["RELAY_CALLBACK_TOKEN"].clone();

    let router = h.router.clone();
    let callback = tokio::spawn(async move {
        router
            .oneshot(callback_request("s-1", Some(&token), AGENT_OUTPUT))
            .await
    });

    // Only the client stream is awaited before the follow-up chat.
    assert_eq!(body_string(chat).await, AGENT_OUTPUT);
    let _second = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/chat", json!({"prompt": "again"})),
    )
    .await;
    let processes = started_processes(&h.sandbox, 2).await;
    let payload = prompt_payload(&h.sandbox, &processes[1].1);
    assert_eq!(payload["continuityId"], "c-1");

    let callback = callback
        .await
        .expect("callback task")
        .expect("callback response");
    assert_eq!(callback.status(), StatusCode::OK);
}

#[tokio::test]
async fn interrupted_callback_closes_the_stream_with_one_error() {
    let h = harness().await;
    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw"}),
        ),
    )
    .await;
    let processes = started_processes(&h.sandbox, 1).await;
    let token = processes[0].1["RELAY_CALLBACK_TOKEN"].clone();
    let authorization = format!("Bearer {token}");

    let stalled = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(
        b"{\"type\":\"text-delta\",\"text\":\"Hi\"}\n",
    ))])
    .chain(stream::pending());
    let interrupted = tokio::time::timeout(
        Duration::from_millis(100),
        h.registry
            .handle_callback("s-1", Some(&authorization), stalled),
    )
    .await;
    assert!(interrupted.is_err());

    let streamed = tokio::time::timeout(Duration::from_secs(2), body_string(chat))
        .await
        .expect("client stream should close");
    let lines = raw_lines(&streamed);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "text-delta");
    assert_eq!(lines[1]["type"], "error");
    assert!(lines[1]["message"]
        .as_str()
        .expect("message")
        .contains("callback dropped"));

    // The bridge was settled and removed, so the token is spent.
    let retry = send(&h.router, callback_request("s-1", Some(&token), AGENT_OUTPUT)).await;
    assert_eq!(retry.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn idle_coordinators_leave_the_registry() {
    let h = harness_with_config(
        SessionStatus::Active,
        AuthConfig::disabled(),
        CoordinatorConfig {
            idle_timeout: Duration::from_secs(60),
            ..CoordinatorConfig::default()
        },
    )
    .await;

    for _ in 0..3 {
        let response = send(
            &h.router,
            Request::builder()
                .uri("/v1/sessions/missing")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(
            &h.router,
            json_request(Method::POST, "/v1/sessions/missing/chat", json!({"prompt": "hi"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    let token = h.signer.sign("no-such-execution", "missing").expect("sign");
    let response = send(&h.router, callback_request("missing", Some(&token), AGENT_OUTPUT)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.registry.active_sessions().await, 0);

    let response = send(
        &h.router,
        json_request(Method::POST, "/v1/sessions/s-1/init", json!({"userId": "u-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.registry.active_sessions().await, 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_for_active_sessions(&h.registry, 0).await;

    // A retired session gets a fresh coordinator on its next chat.
    let chat = send(
        &h.router,
        json_request(
            Method::POST,
            "/v1/sessions/s-1/chat",
            json!({"prompt": "hello", "format": "raw"}),
        ),
    )
    .await;
    assert_eq!(chat.status(), StatusCode::OK);
    let processes = started_processes(&h.sandbox, 1).await;
    let token = processes[0].1["RELAY_CALLBACK_TOKEN"].clone();
    let callback = send(&h.router, callback_request("s-1", Some(&token), AGENT_OUTPUT)).await;
    assert_eq!(callback.status(), StatusCode::OK);
    assert_eq!(body_string(chat).await, AGENT_OUTPUT);
}
