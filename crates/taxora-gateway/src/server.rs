//! Gateway HTTP server: axum routes over the provider router and session store

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use taxora_core::{DispatchOptions, ProviderRouter, UserRole};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::protocol::{
    ApiError, ChatRequest, ChatResponse, SelectProviderRequest, StartRequest, StartResponse,
};
use crate::session::SessionStore;

/// Default cap on a single chat message
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

/// Shared state for all handlers
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<ProviderRouter>,
    pub sessions: Arc<SessionStore>,
    pub auth_token: String,
    pub max_message_chars: usize,
    /// Deadline for a whole chat turn, fallback included
    pub chat_timeout: Option<Duration>,
    pub start_time: Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, router: Arc<ProviderRouter>, auth_token: String) -> Self {
        let state = GatewayState {
            router,
            sessions: Arc::new(SessionStore::new()),
            auth_token,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            chat_timeout: None,
            start_time: Instant::now(),
        };
        Self { state, bind }
    }

    pub fn with_max_message_chars(mut self, max: usize) -> Self {
        self.state.max_message_chars = max;
        self
    }

    pub fn with_chat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.state.chat_timeout = timeout;
        self
    }

    /// Non-system messages sent upstream per chat turn
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.state.sessions = Arc::new(SessionStore::new().with_history_window(window));
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.state.sessions
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/status", get(status_handler))
            .route("/ai/providers", get(providers_handler))
            .route("/ai/provider", post(select_provider_handler))
            .route("/start", post(start_handler))
            .route("/chat", post(chat_handler))
            .route(
                "/session/{id}",
                get(session_handler).delete(end_session_handler),
            )
            .route("/sessions", get(sessions_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Start the server and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn check_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    if auth::authorize(&state.auth_token, headers) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

// ── HTTP Handlers ──

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taxora",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let status = state.router.list_status().await;
    Json(serde_json::json!({
        "system": "operational",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "active_sessions": state.sessions.count().await,
        "active_backend": status.active_id,
        "available_backends": status.available_count,
    }))
}

async fn providers_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let status = state.router.list_status().await;
    Json(serde_json::json!({ "success": true, "data": status }))
}

async fn select_provider_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<SelectProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let provider = req
        .provider
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Provider not specified", "missing_provider"))?;

    let selection = state.router.select(provider.trim()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Switched to {}", selection.current),
        "previous": selection.previous,
        "current": selection.current,
    })))
}

async fn start_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request(
            "Name is required and cannot be empty",
            "missing_name",
        ));
    }

    let role = UserRole::parse(&req.role);
    if role.to_string() != req.role.trim().to_lowercase() {
        warn!("Unknown role '{}', defaulting to {}", req.role, role);
    }

    let info = state.sessions.create(name, role).await;
    Ok(Json(StartResponse {
        session_id: info.session_id,
        message: format!("Welcome {}! I'm Taxora, your finance assistant.", name),
        persona: role.to_string(),
    }))
}

async fn chat_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    check_auth(&state, &headers)?;
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request(
            "Message cannot be empty",
            "empty_message",
        ));
    }
    if message.chars().count() > state.max_message_chars {
        return Err(ApiError::bad_request(
            format!(
                "Message too long. Please keep messages under {} characters.",
                state.max_message_chars
            ),
            "message_too_long",
        ));
    }

    let conversation = state
        .sessions
        .push_user(&req.session_id, message)
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    let options = DispatchOptions {
        requested_id: req.provider.filter(|p| !p.trim().is_empty()),
        allow_fallback: req.allow_fallback.unwrap_or(true),
        timeout: state.chat_timeout,
    };

    // Cancel the dispatch if this request is dropped (client went away)
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let router = Arc::clone(&state.router);
    let task = tokio::spawn(async move {
        router
            .dispatch_with_cancel(&conversation, options, &cancel)
            .await
    });

    let response = match task.await {
        Ok(result) => {
            debug!(
                "Chat turn on {} answered by {} (fallback: {})",
                req.session_id, result.backend_used, result.fallback_used
            );
            if result.success {
                state.sessions.push_assistant(&req.session_id, &result.text).await;
            } else {
                state.sessions.retract_user(&req.session_id, message).await;
            }
            ChatResponse::from_dispatch(&req.session_id, result)
        }
        Err(e) => {
            error!("Dispatch task failed for session {}: {}", req.session_id, e);
            state.sessions.retract_user(&req.session_id, message).await;
            ChatResponse::apology(&req.session_id)
        }
    };

    Ok(Json(response))
}

async fn session_handler(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(info))
}

async fn end_session_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    if !state.sessions.remove(&id).await {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(Json(serde_json::json!({
        "message": "Session ended successfully",
        "session_id": id,
    })))
}

async fn sessions_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    // Only a prefix of each id is exposed
    let ids: Vec<String> = state
        .sessions
        .ids()
        .await
        .into_iter()
        .map(|id| format!("{}...", id.chars().take(8).collect::<String>()))
        .collect();
    Json(serde_json::json!({
        "active_sessions": ids.len(),
        "session_ids": ids,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use taxora_core::{
        Availability, Backend, BackendDescriptor, BackendFailure, ChatMessage, ChatRole,
        RouterConfig,
    };
    use tower::ServiceExt;

    struct Canned(Result<String, BackendFailure>);

    #[async_trait]
    impl Backend for Canned {
        fn provider_name(&self) -> &str {
            "canned"
        }
        fn model(&self) -> &str {
            "canned-model"
        }
        fn probe(&self) -> (Availability, Option<String>) {
            (Availability::Available, None)
        }
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, BackendFailure> {
            assert_eq!(messages[0].role, ChatRole::System);
            self.0.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl Backend for Panicking {
        fn provider_name(&self) -> &str {
            "panicking"
        }
        fn model(&self) -> &str {
            "none"
        }
        fn probe(&self) -> (Availability, Option<String>) {
            (Availability::Available, None)
        }
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, BackendFailure> {
            panic!("adapter bug");
        }
    }

    /// Fails its first call, then answers, recording every conversation it receives
    #[derive(Default)]
    struct Recording {
        calls: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl Backend for Recording {
        fn provider_name(&self) -> &str {
            "recording"
        }
        fn model(&self) -> &str {
            "recording-model"
        }
        fn probe(&self) -> (Availability, Option<String>) {
            (Availability::Available, None)
        }
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, BackendFailure> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(messages.to_vec());
            if calls.len() == 1 {
                Err(BackendFailure::transient("upstream 503"))
            } else {
                Ok(format!("Answer {} about saving.", calls.len()))
            }
        }
    }

    async fn recording_server(window: usize) -> (GatewayServer, Arc<Recording>) {
        let router = ProviderRouter::new(RouterConfig {
            default_backend: "recording".to_string(),
            fallback_backend: None,
            ..RouterConfig::default()
        });
        let recorder = Arc::new(Recording::default());
        router
            .register(
                BackendDescriptor::new("recording", "Recording")
                    .with_availability((Availability::Available, None)),
                recorder.clone(),
            )
            .await;
        let server = GatewayServer::new("127.0.0.1:0".parse().unwrap(), Arc::new(router), String::new())
            .with_history_window(window);
        (server, recorder)
    }

    async fn server(token: &str) -> GatewayServer {
        let router = ProviderRouter::new(RouterConfig {
            default_backend: "gemini".to_string(),
            fallback_backend: Some("local".to_string()),
            ..RouterConfig::default()
        });
        let available = (Availability::Available, None);
        router
            .register(
                BackendDescriptor::new("gemini", "Google Gemini").with_availability(available.clone()),
                Arc::new(Canned(Err(BackendFailure::rate_limited("429", None)))),
            )
            .await;
        router
            .register(
                BackendDescriptor::new("local", "Local Granite")
                    .without_credential()
                    .with_availability(available.clone()),
                Arc::new(Canned(Ok("Save 20% of income monthly.".to_string()))),
            )
            .await;
        router
            .register(
                BackendDescriptor::new("broken", "Broken").with_availability(available),
                Arc::new(Panicking),
            )
            .await;
        router
            .register(
                BackendDescriptor::new("claude", "Anthropic Claude"),
                Arc::new(Canned(Ok("unused".to_string()))),
            )
            .await;

        GatewayServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(router),
            token.to_string(),
        )
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_with_token(app, method, uri, body, None).await
    }

    async fn call_with_token(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn start_session(server: &GatewayServer) -> String {
        let (status, body) = call(
            server.router(),
            "POST",
            "/start",
            Some(serde_json::json!({"name": "Priya", "role": "student"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(server("").await.router(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_providers_listing() {
        let (status, body) = call(server("").await.router(), "GET", "/ai/providers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["active_id"], "gemini");
        assert_eq!(body["data"]["available_count"], 3);
        assert_eq!(body["data"]["backends"][1]["id"], "claude");
        assert_eq!(body["data"]["backends"][1]["availability"], "not_configured");
    }

    #[tokio::test]
    async fn test_select_provider() {
        let server = server("").await;
        let (status, body) = call(
            server.router(),
            "POST",
            "/ai/provider",
            Some(serde_json::json!({"provider": "local"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["previous"], "gemini");
        assert_eq!(body["current"], "local");

        let (status, body) = call(
            server.router(),
            "POST",
            "/ai/provider",
            Some(serde_json::json!({"provider": "claude"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "backend_unavailable");

        let (status, body) =
            call(server.router(), "POST", "/ai/provider", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "missing_provider");
    }

    #[tokio::test]
    async fn test_start_requires_name() {
        let (status, body) = call(
            server("").await.router(),
            "POST",
            "/start",
            Some(serde_json::json!({"name": "  ", "role": "student"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "missing_name");
    }

    #[tokio::test]
    async fn test_start_unknown_role_defaults_to_general() {
        let (_, body) = call(
            server("").await.router(),
            "POST",
            "/start",
            Some(serde_json::json!({"name": "Arun", "role": "astronaut"})),
        )
        .await;
        assert_eq!(body["persona"], "general");
    }

    #[tokio::test]
    async fn test_chat_falls_back_with_disclosure() {
        let server = server("").await;
        let session_id = start_session(&server).await;

        let (status, body) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({"session_id": session_id, "message": "How much should I save?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(
            body["reply"],
            "[switched from gemini to local due to rate limiting] Save 20% of income monthly."
        );
        assert_eq!(body["backend_used"], "local");
        assert_eq!(body["fallback_reason"], "rate_limited");

        let info = server.sessions().get(&session_id).await.unwrap();
        assert_eq!(info.message_count, 2);
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_recorded() {
        let server = server("").await;
        let session_id = start_session(&server).await;

        let (status, body) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({
                "session_id": session_id,
                "message": "Budget tips?",
                "allow_fallback": false
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["failure"], "rate_limited");
        assert!(body["reply"].as_str().unwrap().contains("Google Gemini"));

        let info = server.sessions().get(&session_id).await.unwrap();
        assert_eq!(info.message_count, 0);
    }

    #[tokio::test]
    async fn test_conversation_after_failed_turn_alternates() {
        let (server, recorder) = recording_server(10).await;
        let session_id = start_session(&server).await;

        for (message, expect_success) in [("first", false), ("second", true), ("third", true)] {
            let (status, body) = call(
                server.router(),
                "POST",
                "/chat",
                Some(serde_json::json!({"session_id": session_id, "message": message})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], expect_success);
        }

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let roles = |i: usize| -> Vec<ChatRole> { calls[i].iter().map(|m| m.role).collect() };
        assert_eq!(roles(1), vec![ChatRole::System, ChatRole::User]);
        assert_eq!(calls[1][1].content, "second");
        assert_eq!(
            roles(2),
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(calls[2][3].content, "third");
    }

    #[tokio::test]
    async fn test_conversation_sent_upstream_is_windowed() {
        let (server, recorder) = recording_server(4).await;
        let session_id = start_session(&server).await;

        for i in 0..8 {
            call(
                server.router(),
                "POST",
                "/chat",
                Some(serde_json::json!({"session_id": session_id, "message": format!("q{}", i)})),
            )
            .await;
        }

        let calls = recorder.calls.lock().unwrap();
        let last = calls.last().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last[0].role, ChatRole::System);
        assert_eq!(last[1].role, ChatRole::User);
        assert_eq!(last[3].content, "q7");
    }

    #[tokio::test]
    async fn test_chat_validation() {
        let server = server("").await;
        let session_id = start_session(&server).await;

        let (status, body) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({"session_id": session_id, "message": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "empty_message");

        let (status, body) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({"session_id": session_id, "message": "a".repeat(2001)})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "message_too_long");

        let (status, _) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({"session_id": "missing", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_panic_degrades_to_apology() {
        let server = server("").await;
        let session_id = start_session(&server).await;

        let (status, body) = call(
            server.router(),
            "POST",
            "/chat",
            Some(serde_json::json!({"session_id": session_id, "message": "hi", "provider": "broken"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["reply"], crate::protocol::APOLOGY);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let server = server("").await;
        let session_id = start_session(&server).await;

        let (status, body) = call(
            server.router(),
            "GET",
            &format!("/session/{}", session_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Priya");
        assert_eq!(body["role"], "student");

        let (_, body) = call(server.router(), "GET", "/sessions", None).await;
        assert_eq!(body["active_sessions"], 1);

        let uri = format!("/session/{}", session_id);
        let (status, _) = call(server.router(), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(server.router(), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mutating_endpoints_require_token() {
        let server = server("s3cret").await;
        let body = serde_json::json!({"name": "Priya", "role": "student"});

        let (status, json) = call(server.router(), "POST", "/start", Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "unauthorized");

        let (status, _) =
            call_with_token(server.router(), "POST", "/start", Some(body), Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);

        // Reads stay open
        let (status, _) = call(server.router(), "GET", "/ai/providers", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_active_backend() {
        let server = server("").await;
        start_session(&server).await;
        let (_, body) = call(server.router(), "GET", "/api/status", None).await;
        assert_eq!(body["active_backend"], "gemini");
        assert_eq!(body["active_sessions"], 1);
        assert_eq!(body["available_backends"], 3);
    }
}
