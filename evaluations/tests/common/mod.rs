#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
#![allow(dead_code)]
//! In-process mock of the tracing backend and the agent chat endpoint.
//! Every request is recorded so tests can assert on what was sent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dataset_evaluations::ExecutionContext;
use langfuse_client::LangfuseClient;
use serde_json::{Value, json};
use url::Url;

pub const DATASET_ID: &str = "ds-weather";
pub const DATASET_NAME: &str = "weather-dataset";
pub const CHAT_API_KEY: &str = "sk-agent-test";

#[derive(Clone, Debug)]
pub struct ChatReply {
    pub status: u16,
    pub body: String,
    pub trace_id_header: Option<String>,
}

impl ChatReply {
    pub fn text(text: &str) -> Self {
        Self {
            status: 200,
            body: sse_body(&[text]),
            trace_id_header: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id_header = Some(trace_id.to_string());
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedChat {
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Default)]
pub struct MockData {
    /// Dataset bodies by name; unknown names return 404.
    pub datasets: HashMap<String, Value>,
    /// Run-item pages by page number (1-based). Missing pages return `{"data": []}`.
    pub run_item_pages: HashMap<u32, Value>,
    /// Page number that returns a 500.
    pub failing_page: Option<u32>,
    /// Trace bodies by id; unknown ids return 404.
    pub traces: HashMap<String, Value>,
    pub score_config_status: Option<u16>,
    pub score_status: Option<u16>,
    pub link_status: Option<u16>,
    /// Trace ids whose ingestion events are rejected with a 400 entry.
    pub rejected_trace_ids: Vec<String>,
    /// Chat replies keyed by the user message. Unknown messages get an echo reply.
    pub chat_replies: HashMap<String, ChatReply>,

    pub run_item_queries: Vec<Value>,
    pub trace_requests: Vec<String>,
    pub score_configs: Vec<Value>,
    pub scores: Vec<Value>,
    pub links: Vec<Value>,
    pub ingested: Vec<Value>,
    pub chats: Vec<RecordedChat>,
}

#[derive(Clone, Default)]
pub struct MockState {
    inner: Arc<Mutex<MockData>>,
}

impl MockState {
    pub fn data(&self) -> MutexGuard<'_, MockData> {
        self.inner.lock().unwrap()
    }
}

pub fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::from("data: {\"type\":\"text-start\",\"id\":\"0\"}\n\n");
    for delta in deltas {
        let event = json!({"type": "text-delta", "id": "0", "delta": delta});
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: {\"type\":\"text-end\",\"id\":\"0\"}\n\ndata: [DONE]\n\n");
    body
}

fn status(code: Option<u16>) -> StatusCode {
    StatusCode::from_u16(code.unwrap_or(200)).unwrap()
}

async fn get_dataset(State(state): State<MockState>, Path(name): Path<String>) -> Response {
    match state.data().datasets.get(&name) {
        Some(dataset) => Json(dataset.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "Dataset not found").into_response(),
    }
}

async fn list_run_items(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut data = state.data();
    data.run_item_queries.push(json!(query));
    let page: u32 = query
        .get("page")
        .and_then(|page| page.parse().ok())
        .unwrap_or(1);
    if data.failing_page == Some(page) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "run item storage unavailable").into_response();
    }
    let body = data
        .run_item_pages
        .get(&page)
        .cloned()
        .unwrap_or_else(|| json!({"data": []}));
    Json(body).into_response()
}

async fn create_run_item(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let mut data = state.data();
    let code = status(data.link_status);
    data.links.push(body.clone());
    if !code.is_success() {
        return (code, "link rejected").into_response();
    }
    let id = format!("ri-{}", data.links.len());
    Json(json!({
        "id": id,
        "datasetItemId": body["datasetItemId"],
        "traceId": body["traceId"],
        "datasetRunName": body["runName"],
    }))
    .into_response()
}

async fn get_trace(State(state): State<MockState>, Path(id): Path<String>) -> Response {
    let mut data = state.data();
    data.trace_requests.push(id.clone());
    match data.traces.get(&id) {
        Some(trace) => Json(trace.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "Trace not found").into_response(),
    }
}

async fn create_score_config(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let mut data = state.data();
    data.score_configs.push(body);
    let code = status(data.score_config_status);
    (code, Json(json!({"id": "config-1"}))).into_response()
}

async fn create_score(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let mut data = state.data();
    let code = status(data.score_status);
    data.scores.push(body);
    if !code.is_success() {
        return (code, "score rejected").into_response();
    }
    let id = format!("score-{}", data.scores.len());
    Json(json!({"id": id})).into_response()
}

async fn ingestion(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let batch = body["batch"].as_array().cloned().unwrap_or_default();
    let mut data = state.data();
    let (rejected, accepted): (Vec<Value>, Vec<Value>) = batch.into_iter().partition(|event| {
        data.rejected_trace_ids
            .iter()
            .any(|trace_id| event["body"]["id"] == trace_id.as_str())
    });
    let successes: Vec<Value> = accepted
        .iter()
        .map(|event| json!({"id": event["id"], "status": 201}))
        .collect();
    let errors: Vec<Value> = rejected
        .iter()
        .map(|event| json!({"id": event["id"], "status": 400, "message": "invalid trace"}))
        .collect();
    data.ingested.extend(accepted);
    (
        StatusCode::MULTI_STATUS,
        Json(json!({"successes": successes, "errors": errors})),
    )
        .into_response()
}

async fn chat(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let message = body["messages"][0]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let mut data = state.data();
    data.chats.push(RecordedChat {
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap().to_string()))
            .collect(),
        body,
    });
    let reply = data
        .chat_replies
        .get(&message)
        .cloned()
        .unwrap_or_else(|| ChatReply::text(&format!("Echo: {message}")));
    let mut response = (status(Some(reply.status)), reply.body).into_response();
    response.headers_mut().insert(
        "content-type",
        "text/event-stream".parse().unwrap(),
    );
    if let Some(trace_id) = reply.trace_id_header {
        response
            .headers_mut()
            .insert("trace-id", trace_id.parse().unwrap());
    }
    response
}

pub async fn start_mock(state: MockState) -> SocketAddr {
    let app = Router::new()
        .route("/api/public/datasets/{name}", get(get_dataset))
        .route(
            "/api/public/dataset-run-items",
            get(list_run_items).post(create_run_item),
        )
        .route("/api/public/traces/{id}", get(get_trace))
        .route("/api/public/score-configs", post(create_score_config))
        .route("/api/public/scores", post(create_score))
        .route("/api/public/ingestion", post(ingestion))
        .route("/api/chat", post(chat))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn base_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}")).unwrap()
}

pub fn langfuse_client(addr: SocketAddr) -> Arc<LangfuseClient> {
    Arc::new(
        LangfuseClient::builder()
            .base_url(base_url(addr))
            .public_key("pk-lf-test")
            .secret_key("sk-lf-test")
            .build()
            .unwrap(),
    )
}

pub fn execution_context() -> ExecutionContext {
    ExecutionContext {
        tenant_id: "tenant-1".to_string(),
        project_id: "project-1".to_string(),
        agent_id: "weather-agent".to_string(),
    }
}

pub fn tool_call_trace(id: &str, tool_name: &str) -> Value {
    json!({
        "id": id,
        "observations": [
            {"id": format!("{id}-gen"), "name": "ai.streamText", "type": "GENERATION", "metadata": {}},
            {
                "id": format!("{id}-tool"),
                "name": "tool-call",
                "type": "SPAN",
                "metadata": {"attributes": {"ai.toolCall.name": tool_name}}
            }
        ]
    })
}

pub fn dataset(items: Value) -> Value {
    json!({"id": DATASET_ID, "name": DATASET_NAME, "items": items})
}
