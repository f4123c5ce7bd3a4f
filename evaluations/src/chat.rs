//! Client for the agent chat endpoint.
//!
//! Every call runs inside its own root tracing span. The span's OpenTelemetry
//! context is injected into the outbound request as W3C `traceparent` headers, so
//! the agent's own spans join the same trace. How the backend trace record is
//! produced depends on [`TraceMode`].

use chrono::Utc;
use http::{HeaderMap, HeaderValue};
use langfuse_client::{LangfuseClient, LangfuseError, TraceBody};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry_http::HeaderInjector;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{Instrument, Span, debug, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use url::Url;
use uuid::Uuid;

use crate::config::ExecutionContext;
use crate::stream::decode_event_stream_with_stats;

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const PROJECT_ID_HEADER: &str = "x-project-id";
pub const AGENT_ID_HEADER: &str = "x-agent-id";
/// Response header carrying the agent's trace id in [`TraceMode::Pull`].
pub const TRACE_ID_HEADER: &str = "trace-id";

const EMPTY_OUTPUT: &str = "No response generated";
const TRACE_SOURCE: &str = "dataset-runner";
const TRACE_TAG: &str = "dataset-evaluation";

/// Where the id of the trace recording a chat call comes from.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Use the local span's trace id. The trace is created before the call and
    /// updated with the output once the response has been read.
    #[default]
    Push,
    /// Use the id the agent returns in the `trace-id` response header. The trace
    /// is created once, after the response has been read.
    Pull,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Chat API returned HTTP {status} for dataset item {dataset_item_id}: {body}")]
    Http {
        status: u16,
        dataset_item_id: String,
        trace_id: Option<String>,
        body: String,
    },
    #[error("Chat API request failed for dataset item {dataset_item_id}: {source}")]
    Request {
        dataset_item_id: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Chat API response for dataset item {dataset_item_id} has no `trace-id` header")]
    MissingTraceId { dataset_item_id: String },
    #[error(
        "No OpenTelemetry trace context for dataset item {dataset_item_id}; is the OpenTelemetry layer installed?"
    )]
    MissingTraceContext { dataset_item_id: String },
    #[error("Failed to record trace {trace_id} for dataset item {dataset_item_id}: {source}")]
    Ingestion {
        dataset_item_id: String,
        trace_id: String,
        #[source]
        source: LangfuseError,
    },
    #[error("Invalid chat API base URL `{0}`")]
    InvalidBaseUrl(String),
    #[error("Invalid value for header `{0}`")]
    InvalidHeader(&'static str),
}

impl ChatError {
    pub fn dataset_item_id(&self) -> Option<&str> {
        match self {
            ChatError::Http {
                dataset_item_id, ..
            }
            | ChatError::Request {
                dataset_item_id, ..
            }
            | ChatError::MissingTraceId { dataset_item_id }
            | ChatError::MissingTraceContext { dataset_item_id }
            | ChatError::Ingestion {
                dataset_item_id, ..
            } => Some(dataset_item_id),
            ChatError::InvalidBaseUrl(_) | ChatError::InvalidHeader(_) => None,
        }
    }

    /// The trace id that was produced before the failure, if any.
    pub fn trace_id(&self) -> Option<&str> {
        match self {
            ChatError::Http { trace_id, .. } => trace_id.as_deref(),
            ChatError::Ingestion { trace_id, .. } => Some(trace_id),
            _ => None,
        }
    }
}

/// One dataset item to send to the agent.
#[derive(Clone, Copy, Debug)]
pub struct ChatRequest<'a> {
    pub dataset_name: &'a str,
    pub dataset_item_id: &'a str,
    pub message: &'a str,
}

/// Result of a successful chat call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatInvocation {
    pub trace_id: String,
    /// Decoded assistant text, possibly empty.
    pub output: String,
    pub status: u16,
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

pub struct ChatClient {
    http_client: reqwest::Client,
    chat_url: Url,
    api_key: SecretString,
    context: ExecutionContext,
    propagator: TraceContextPropagator,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("chat_url", &self.chat_url)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Requests go to `{base_url}/api/chat`.
    pub fn new(
        http_client: reqwest::Client,
        base_url: &Url,
        api_key: SecretString,
        context: ExecutionContext,
    ) -> Result<Self, ChatError> {
        let mut chat_url = base_url.clone();
        chat_url
            .path_segments_mut()
            .map_err(|()| ChatError::InvalidBaseUrl(base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "chat"]);
        Ok(Self {
            http_client,
            chat_url,
            api_key,
            context,
            propagator: TraceContextPropagator::new(),
        })
    }

    pub fn chat_url(&self) -> &Url {
        &self.chat_url
    }

    /// Sends `request.message` to the agent and records the call as a trace.
    ///
    /// The call's span is closed before this returns, on every path.
    pub async fn invoke(
        &self,
        langfuse: &LangfuseClient,
        request: ChatRequest<'_>,
        mode: TraceMode,
    ) -> Result<ChatInvocation, ChatError> {
        let span = info_span!(
            parent: None,
            "chat_api_call",
            otel.name = "chat-api-call",
            dataset_item_id = %request.dataset_item_id,
            trace_mode = ?mode,
        );
        let result = match mode {
            TraceMode::Push => {
                self.invoke_push(langfuse, request, &span)
                    .instrument(span.clone())
                    .await
            }
            TraceMode::Pull => {
                self.invoke_pull(langfuse, request, &span)
                    .instrument(span.clone())
                    .await
            }
        };
        drop(span);
        result
    }

    async fn invoke_push(
        &self,
        langfuse: &LangfuseClient,
        request: ChatRequest<'_>,
        span: &Span,
    ) -> Result<ChatInvocation, ChatError> {
        let dataset_item_id = request.dataset_item_id;
        let Some(trace_id) = otel_trace_id(span) else {
            return Err(ChatError::MissingTraceContext {
                dataset_item_id: dataset_item_id.to_string(),
            });
        };
        let metadata = self.trace_metadata(&request);
        let mut events = Vec::with_capacity(2);
        events.push(langfuse.trace(TraceBody {
            id: trace_id.clone(),
            name: Some(trace_name(dataset_item_id)),
            input: Some(json!(request.message)),
            metadata: Some(Value::Object(metadata.clone())),
            tags: Some(vec![TRACE_TAG.to_string()]),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }));

        let (status, _, body) = self.send(&request, span).await?;
        let output = decode_output(&body);

        let mut metadata = metadata;
        metadata.insert("httpStatus".to_string(), json!(status.as_u16()));
        metadata.insert("ok".to_string(), json!(status.is_success()));
        events.push(langfuse.trace(TraceBody {
            id: trace_id.clone(),
            output: Some(json!(output_or_placeholder(&output))),
            metadata: Some(Value::Object(metadata)),
            ..Default::default()
        }));
        flush_trace(langfuse, &events, dataset_item_id, &trace_id).await?;

        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                dataset_item_id: dataset_item_id.to_string(),
                trace_id: Some(trace_id),
                body,
            });
        }
        Ok(ChatInvocation {
            trace_id,
            output,
            status: status.as_u16(),
        })
    }

    async fn invoke_pull(
        &self,
        langfuse: &LangfuseClient,
        request: ChatRequest<'_>,
        span: &Span,
    ) -> Result<ChatInvocation, ChatError> {
        let dataset_item_id = request.dataset_item_id;
        let (status, trace_id, body) = self.send(&request, span).await?;
        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                dataset_item_id: dataset_item_id.to_string(),
                trace_id,
                body,
            });
        }
        let Some(trace_id) = trace_id else {
            return Err(ChatError::MissingTraceId {
                dataset_item_id: dataset_item_id.to_string(),
            });
        };
        let output = decode_output(&body);

        let mut metadata = self.trace_metadata(&request);
        metadata.insert("traceId".to_string(), json!(trace_id));
        let event = langfuse.trace(TraceBody {
            id: trace_id.clone(),
            name: Some(trace_name(dataset_item_id)),
            input: Some(json!(request.message)),
            output: Some(json!(output_or_placeholder(&output))),
            metadata: Some(Value::Object(metadata)),
            tags: Some(vec![TRACE_TAG.to_string()]),
            timestamp: Some(Utc::now()),
        });
        flush_trace(langfuse, &[event], dataset_item_id, &trace_id).await?;

        Ok(ChatInvocation {
            trace_id,
            output,
            status: status.as_u16(),
        })
    }

    /// Posts the chat request and reads the whole body. Returns the status, the
    /// `trace-id` response header (if present) and the body text.
    async fn send(
        &self,
        request: &ChatRequest<'_>,
        span: &Span,
    ) -> Result<(StatusCode, Option<String>, String), ChatError> {
        let headers = self.request_headers(span)?;
        let payload = ChatPayload {
            messages: [ChatMessage {
                role: "user",
                content: request.message,
            }],
        };
        let request_error = |source| ChatError::Request {
            dataset_item_id: request.dataset_item_id.to_string(),
            source,
        };
        let response = self
            .http_client
            .post(self.chat_url.clone())
            .bearer_auth(self.api_key.expose_secret())
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        let trace_id = response
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let body = response.text().await.map_err(request_error)?;
        if status.is_success() {
            debug!(status = status.as_u16(), bytes = body.len(), "Received chat response");
        } else {
            warn!(
                status = status.as_u16(),
                dataset_item_id = request.dataset_item_id,
                body = %body,
                "Chat API request failed"
            );
        }
        Ok((status, trace_id, body))
    }

    fn request_headers(&self, span: &Span) -> Result<HeaderMap, ChatError> {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (TENANT_ID_HEADER, &self.context.tenant_id),
            (PROJECT_ID_HEADER, &self.context.project_id),
            (AGENT_ID_HEADER, &self.context.agent_id),
        ] {
            let value =
                HeaderValue::from_str(value).map_err(|_| ChatError::InvalidHeader(name))?;
            headers.insert(name, value);
        }
        self.propagator
            .inject_context(&span.context(), &mut HeaderInjector(&mut headers));
        Ok(headers)
    }

    fn trace_metadata(&self, request: &ChatRequest<'_>) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("datasetName".to_string(), json!(request.dataset_name));
        metadata.insert("datasetItemId".to_string(), json!(request.dataset_item_id));
        metadata.insert("tenantId".to_string(), json!(self.context.tenant_id));
        metadata.insert("projectId".to_string(), json!(self.context.project_id));
        metadata.insert("agentId".to_string(), json!(self.context.agent_id));
        metadata.insert("source".to_string(), json!(TRACE_SOURCE));
        metadata
    }
}

/// The span's OpenTelemetry trace id as 32 lowercase hex digits, if it has one.
fn otel_trace_id(span: &Span) -> Option<String> {
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

fn trace_name(dataset_item_id: &str) -> String {
    format!("Dataset Item Execution: {dataset_item_id}")
}

fn decode_output(body: &str) -> String {
    let decoded = decode_event_stream_with_stats(body);
    info!(
        chars = decoded.text.len(),
        events = decoded.events,
        skipped_lines = decoded.skipped_lines,
        "Decoded chat response"
    );
    decoded.text
}

fn output_or_placeholder(output: &str) -> &str {
    if output.is_empty() { EMPTY_OUTPUT } else { output }
}

/// Sends only the events this call queued, so a rejected write from another
/// in-flight item is never reported against this one.
async fn flush_trace(
    langfuse: &LangfuseClient,
    events: &[Uuid],
    dataset_item_id: &str,
    trace_id: &str,
) -> Result<(), ChatError> {
    langfuse
        .flush_events(events)
        .await
        .map(|_| ())
        .map_err(|source| ChatError::Ingestion {
            dataset_item_id: dataset_item_id.to_string(),
            trace_id: trace_id.to_string(),
            source,
        })
}
