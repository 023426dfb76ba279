//! HTTP/WebSocket Handlers

use axum::{
    Json,
    extract::{State, WebSocketUpgrade, ws::{Message as WsMessage, WebSocket}},
    http::StatusCode,
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use agent_core::{AgentError, AgentResult, ErrorKind, Message, Model, RunInput};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub model: Option<String>,
    pub provider_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub image_path: Option<String>,
}

impl ChatRequest {
    fn into_input(self) -> RunInput {
        let input = RunInput::new(self.message);
        match self.image_path {
            Some(path) => input.with_image(path),
            None => input,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub transcript: Vec<Message>,
    pub steps: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Messages accumulated before a run failed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<Message>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(error: &AgentError) -> ApiError {
    let status = match error {
        AgentError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => match error.kind() {
            ErrorKind::Provider | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Exhausted => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };

    (
        status,
        Json(ErrorResponse {
            error: error.user_message(),
            code: error.kind().code().into(),
            transcript: Vec::new(),
        }),
    )
}

/// Error response for a failed run, carrying its partial transcript
fn run_error(error: &AgentError, transcript: Vec<Message>) -> ApiError {
    let (status, Json(mut body)) = api_error(error);
    body.transcript = transcript;
    (status, Json(body))
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            code: "BAD_REQUEST".into(),
            transcript: Vec::new(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.agent.provider();
    let provider_connected = provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: provider.name().to_string(),
        model: provider.model().map(|m| m.id.clone()),
        provider_connected,
    })
}

/// Models offered by the configured provider
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<Model>>, ApiError> {
    state.agent.provider().list_models().await.map(Json).map_err(|e| {
        tracing::warn!("Listing models failed: {}", e);
        api_error(&e)
    })
}

/// Main chat endpoint (blocking run)
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let result = state.agent.run(payload.into_input()).await;
    let message = result.final_text().unwrap_or_default().to_string();
    let AgentResult {
        messages,
        error,
        steps,
    } = result;

    match error {
        None => Ok(Json(ChatResponse {
            message,
            transcript: messages,
            steps,
        })),
        Some(e) => {
            tracing::warn!(steps, "Run failed: {}", e);
            Err(run_error(&e, messages))
        }
    }
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: ChatRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let frame = json!({"type": "error", "error": e.to_string(), "code": "BAD_REQUEST"});
                if sender.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let span = tracing::info_span!("ws_run", run_id = %uuid::Uuid::new_v4());
        let open = stream_run(&mut sender, &state, request).instrument(span).await;
        if !open {
            break;
        }
    }
}

/// Stream one run over the socket. Returns `false` once the client is gone.
async fn stream_run<S>(sender: &mut S, state: &AppState, request: ChatRequest) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let cancel = CancellationToken::new();
    let mut stream = state.agent.run_stream_with_cancel(request.into_input(), cancel.clone());

    while let Some(delta) = stream.next_delta().await {
        let frame = json!({"type": "chunk", "content": delta});
        if sender.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
            tracing::debug!("Client went away mid-run, cancelling");
            cancel.cancel();
            return false;
        }
    }

    let frame = terminal_frame(&stream.finish().await);
    sender.send(WsMessage::Text(frame.to_string().into())).await.is_ok()
}

fn terminal_frame(result: &AgentResult) -> serde_json::Value {
    match &result.error {
        None => json!({
            "type": "done",
            "message": result.final_text().unwrap_or_default(),
            "messages": result.messages,
        }),
        Some(e) => json!({
            "type": "error",
            "error": e.user_message(),
            "code": e.kind().code(),
            "messages": result.messages,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use agent_core::Agent;
    use agent_core::builtin::calculator_tool;
    use agent_core::mock::{ScriptedProvider, ScriptedTurn};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(turns: Vec<ScriptedTurn>) -> axum::Router {
        let agent = Agent::builder()
            .provider(Arc::new(ScriptedProvider::new(turns)))
            .tool(calculator_tool())
            .unwrap()
            .build()
            .unwrap();
        crate::router(AppState::new(agent))
    }

    async fn post_chat(app: axum::Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_chat_runs_tools() {
        let app = app(vec![
            ScriptedTurn::tool_call("c1", "calculator", json!({"operation": "add", "a": 5, "b": 3})),
            ScriptedTurn::text("8"),
        ]);

        let (status, body) = post_chat(app, json!({"message": "What is 5 + 3?"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "8");
        assert_eq!(body["steps"], 2);
        assert_eq!(body["transcript"].as_array().unwrap().len(), 4);
        assert_eq!(body["transcript"][2]["role"], "tool");
    }

    #[tokio::test]
    async fn test_chat_maps_provider_errors() {
        let app = app(vec![ScriptedTurn::Fail("upstream exploded".into())]);

        let (status, body) = post_chat(app, json!({"message": "hi"})).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "PROVIDER");
        assert_eq!(body["transcript"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_chat_returns_partial_transcript() {
        let app = app(vec![
            ScriptedTurn::tool_call("c1", "calculator", json!({"operation": "add", "a": 5, "b": 3})),
            ScriptedTurn::Fail("upstream exploded".into()),
        ]);

        let (status, body) = post_chat(app, json!({"message": "What is 5 + 3?"})).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let transcript = body["transcript"].as_array().unwrap();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[0]["role"], "user");
        assert_eq!(transcript[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(transcript[2]["role"], "tool");
        assert_eq!(transcript[2]["content"], "8");
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let (status, body) = post_chat(app(vec![]), json!({"message": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body.get("transcript").is_none());
    }

    #[tokio::test]
    async fn test_health_reports_provider() {
        let response = app(vec![])
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["provider"], "scripted");
        assert_eq!(body["model"], "scripted");
        assert_eq!(body["provider_connected"], true);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(api_error(&AgentError::Timeout(Duration::from_secs(30))).0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(api_error(&AgentError::Exhausted { steps: 10 }).0, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api_error(&AgentError::RateLimited("slow".into())).0, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api_error(&AgentError::Config("x".into())).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_terminal_frames() {
        let done = AgentResult {
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            error: None,
            steps: 1,
        };
        let frame = terminal_frame(&done);
        assert_eq!(frame["type"], "done");
        assert_eq!(frame["message"], "hello");

        let failed = AgentResult {
            messages: vec![Message::user("hi")],
            error: Some(AgentError::Timeout(Duration::from_secs(30))),
            steps: 1,
        };
        let frame = terminal_frame(&failed);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "TIMEOUT");
        assert_eq!(frame["messages"].as_array().unwrap().len(), 1);
        assert_eq!(frame["messages"][0]["content"], "hi");
    }
}
