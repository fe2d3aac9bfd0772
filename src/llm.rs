//! LLM collaborator boundary.
//!
//! The pipeline talks to the model only through the [`Collaborator`] trait:
//! one structured-output request in, one continuation token plus output text
//! out. [`OpenAiResponses`] is the production implementation against the
//! OpenAI Responses API. Credentials travel with every call in a
//! [`ClientConfig`] value; the client itself holds no key.

use std::{fmt, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{PipelineError, Result},
    poll::{JobStatus, PollPolicy, poll_until_terminal},
    retry::{RetryDisposition, RetryPolicy},
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque conversation handle returned by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(value: impl Into<String>) -> Self {
        ContinuationToken(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-call connection settings.
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// JSON schema the model output must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    /// Name of the single array property that holds the per-row items.
    pub array_key: String,
    pub schema: Value,
}

impl ResponseSchema {
    /// An object with one array property whose items declare `fields` as
    /// required strings, in the given order.
    pub fn string_rows(name: &str, array_key: &str, fields: &[&str]) -> Self {
        let properties = fields
            .iter()
            .map(|field| (field.to_string(), json!({ "type": "string" })))
            .collect::<serde_json::Map<_, _>>();
        let schema = json!({
            "type": "object",
            "properties": {
                array_key: {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": fields,
                        "additionalProperties": false,
                    }
                }
            },
            "required": [array_key],
            "additionalProperties": false,
        });
        ResponseSchema {
            name: name.to_string(),
            array_key: array_key.to_string(),
            schema,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub instructions: String,
    /// Free-text preamble sent ahead of the JSON payload.
    pub prompt: String,
    pub payload: Value,
    pub schema: ResponseSchema,
    pub temperature: Option<f32>,
    pub continuation: Option<ContinuationToken>,
}

impl LlmRequest {
    pub fn user_message(&self) -> String {
        let data = serde_json::to_string_pretty(&self.payload).unwrap_or_default();
        if self.prompt.trim().is_empty() {
            data
        } else {
            format!("{}\n\n{data}", self.prompt.trim_end())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub token: ContinuationToken,
    pub output_text: String,
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn respond(&self, config: &ClientConfig, request: &LlmRequest) -> Result<LlmResponse>;
}

/// Reasoning model families reject the `temperature` parameter.
pub fn supports_temperature(model: &str) -> bool {
    let model = model.trim().to_ascii_lowercase();
    !["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```").expect("valid fence regex")
    })
}

/// Parses model output, tolerating fenced code blocks and chatter around the JSON.
pub fn extract_json(output: &str) -> Result<Value> {
    let mut text = output.trim();
    if let Some(captures) = fence_pattern().captures(text)
        && let Some(inner) = captures.get(1)
    {
        text = inner.as_str().trim();
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    let candidate = match (text.find(['{', '[']), text.rfind(['}', ']'])) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(PipelineError::Transport(format!(
                "model output contains no JSON: {}",
                preview(text)
            )));
        }
    };
    serde_json::from_str(candidate).map_err(|err| {
        PipelineError::Transport(format!(
            "model output is not valid JSON ({err}): {}",
            preview(text)
        ))
    })
}

/// Pulls the item array out of a parsed response. Accepts the schema's wrapper
/// object, a bare array, or an object with exactly one array-valued property.
pub fn response_items(value: Value, array_key: &str) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove(array_key) {
                return Some(items);
            }
            let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            });
            match (arrays.next(), arrays.next()) {
                (Some(items), None) => Some(items),
                _ => None,
            }
        }
        _ => None,
    }
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let head = text.chars().take(LIMIT).collect::<String>();
        format!("{head}…")
    }
}

/// Client for `POST {base_url}/responses`.
#[derive(Debug, Clone)]
pub struct OpenAiResponses {
    http: reqwest::Client,
    retry: RetryPolicy,
    poll: PollPolicy,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl ResponseBody {
    fn status(&self) -> JobStatus {
        self.status
            .as_deref()
            .map(JobStatus::parse)
            .unwrap_or(JobStatus::Completed)
    }

    fn output_text(&self) -> String {
        self.output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter(|part| part.kind == "output_text")
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

#[derive(Debug)]
enum AttemptError {
    Retryable(PipelineError),
    Fatal(PipelineError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Retryable(err) | AttemptError::Fatal(err) => err.fmt(f),
        }
    }
}

impl From<PipelineError> for AttemptError {
    fn from(err: PipelineError) -> Self {
        AttemptError::Fatal(err)
    }
}

impl AttemptError {
    fn into_inner(self) -> PipelineError {
        match self {
            AttemptError::Retryable(err) | AttemptError::Fatal(err) => err,
        }
    }
}

fn classify_attempt(err: &AttemptError) -> RetryDisposition {
    match err {
        AttemptError::Retryable(_) => RetryDisposition::Retry,
        AttemptError::Fatal(_) => RetryDisposition::Stop,
    }
}

fn classify_reqwest(err: reqwest::Error) -> AttemptError {
    if err.is_connect() || err.is_timeout() {
        AttemptError::Retryable(err.into())
    } else {
        AttemptError::Fatal(err.into())
    }
}

fn classify_status(status: StatusCode, message: String) -> AttemptError {
    let err = PipelineError::Transport(format!("API error ({status}): {message}"));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AttemptError::Retryable(err)
    } else {
        AttemptError::Fatal(err)
    }
}

impl OpenAiResponses {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(OpenAiResponses {
            http,
            retry,
            poll: PollPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn request_body(request: &LlmRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "instructions": request.instructions,
            "input": [{ "role": "user", "content": request.user_message() }],
            "store": true,
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": request.schema.name,
                    "schema": request.schema.schema,
                    "strict": true,
                }
            },
        });
        if let Some(temperature) = request.temperature
            && supports_temperature(&request.model)
        {
            body["temperature"] = json!(temperature);
        }
        if let Some(token) = &request.continuation {
            body["previous_response_id"] = json!(token.as_str());
        }
        body
    }

    /// One HTTP exchange. `config.timeout` bounds the whole exchange: connect,
    /// headers and body.
    async fn send_json(
        &self,
        config: &ClientConfig,
        builder: reqwest::RequestBuilder,
    ) -> std::result::Result<ResponseBody, AttemptError> {
        tokio::time::timeout(config.timeout, Self::exchange(config, builder))
            .await
            .unwrap_or_else(|_| {
                Err(AttemptError::Retryable(PipelineError::Transport(format!(
                    "request timed out after {:?}",
                    config.timeout
                ))))
            })
    }

    async fn exchange(
        config: &ClientConfig,
        builder: reqwest::RequestBuilder,
    ) -> std::result::Result<ResponseBody, AttemptError> {
        let response = builder
            .bearer_auth(&config.api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(config.timeout)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
            return Err(classify_status(status, message));
        }
        response
            .json::<ResponseBody>()
            .await
            .map_err(classify_reqwest)
    }

    async fn create(&self, config: &ClientConfig, request: &LlmRequest) -> Result<ResponseBody> {
        let url = format!("{}/responses", config.base_url.trim_end_matches('/'));
        let body = Self::request_body(request);
        debug!(
            "POST {url} model={} continuation={:?} payload_bytes={}",
            request.model,
            request.continuation.as_ref().map(ContinuationToken::as_str),
            body.to_string().len()
        );
        self.retry
            .run(
                &self.cancel,
                || self.send_json(config, self.http.post(&url).json(&body)),
                classify_attempt,
            )
            .await
            .map_err(AttemptError::into_inner)
    }

    async fn retrieve(&self, config: &ClientConfig, id: &str) -> Result<ResponseBody> {
        let url = format!("{}/responses/{id}", config.base_url.trim_end_matches('/'));
        self.retry
            .run(
                &self.cancel,
                || self.send_json(config, self.http.get(&url)),
                classify_attempt,
            )
            .await
            .map_err(AttemptError::into_inner)
    }
}

#[async_trait]
impl Collaborator for OpenAiResponses {
    async fn respond(&self, config: &ClientConfig, request: &LlmRequest) -> Result<LlmResponse> {
        let mut body = self.create(config, request).await?;
        if !body.status().is_terminal() {
            let id = body.id.clone();
            body = poll_until_terminal(&id, &self.poll, &self.cancel, || async {
                let polled = self.retrieve(config, &id).await?;
                Ok::<_, PipelineError>((polled.status(), polled))
            })
            .await?;
        }
        match body.status() {
            JobStatus::Completed => {}
            status => {
                if let Some(error) = &body.error {
                    debug!("Response {} error: {}", body.id, error.message);
                }
                return Err(PipelineError::JobFailed {
                    id: body.id,
                    status: status.as_str().to_string(),
                });
            }
        }
        Ok(LlmResponse {
            output_text: body.output_text(),
            token: ContinuationToken::new(body.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            instructions: "Translate.".into(),
            prompt: "Rows 1 to 1".into(),
            payload: json!([{ "Japanese": "はい" }]),
            schema: ResponseSchema::string_rows("translation", "rows", &["Japanese", "English"]),
            temperature: Some(0.5),
            continuation: Some(ContinuationToken::new("resp_prev")),
        }
    }

    #[test]
    fn extracts_json_from_fenced_block() {
        let value = extract_json("Sure!\n```json\n{\"rows\": [{\"English\": \"Hi\"}]}\n```\n")
            .expect("json");
        assert_eq!(value["rows"][0]["English"], "Hi");
    }

    #[test]
    fn extracts_json_surrounded_by_text() {
        let value = extract_json("Here you go: {\"rows\": []} hope it helps").expect("json");
        assert_eq!(value, json!({ "rows": [] }));
    }

    #[test]
    fn rejects_output_without_json() {
        assert!(extract_json("I cannot help with that.").is_err());
    }

    #[test]
    fn response_items_accepts_wrapper_or_bare_array() {
        let wrapped = json!({ "rows": [{ "a": "1" }] });
        assert_eq!(response_items(wrapped, "rows").map(|v| v.len()), Some(1));
        let bare = json!([{ "a": "1" }, { "a": "2" }]);
        assert_eq!(response_items(bare, "rows").map(|v| v.len()), Some(2));
        let renamed = json!({ "results": [{ "a": "1" }] });
        assert_eq!(response_items(renamed, "rows").map(|v| v.len()), Some(1));
        assert_eq!(response_items(json!({ "x": 1 }), "rows"), None);
    }

    #[test]
    fn string_rows_schema_keeps_field_order() {
        let schema = ResponseSchema::string_rows("t", "rows", &["Japanese", "English", "Refined"]);
        let required = schema.schema["properties"]["rows"]["items"]["required"]
            .as_array()
            .expect("required");
        assert_eq!(required.last().and_then(Value::as_str), Some("Refined"));
    }

    #[test]
    fn request_body_chains_and_sets_temperature() {
        let body = OpenAiResponses::request_body(&request("gpt-4o"));
        assert_eq!(body["previous_response_id"], "resp_prev");
        assert_eq!(body["temperature"], json!(0.5f32));
        assert_eq!(body["text"]["format"]["strict"], true);
    }

    #[test]
    fn request_body_omits_temperature_for_reasoning_models() {
        let body = OpenAiResponses::request_body(&request("o3-mini"));
        assert!(body.get("temperature").is_none());
        assert!(!supports_temperature("gpt-5-mini"));
        assert!(supports_temperature("gpt-4o-mini"));
    }

    #[test]
    fn output_text_concatenates_text_parts() {
        let body: ResponseBody = serde_json::from_value(json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                { "type": "reasoning", "content": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "{\"rows\":" },
                    { "type": "output_text", "text": "[]}" }
                ]}
            ]
        }))
        .expect("body");
        assert_eq!(body.output_text(), "{\"rows\":[]}");
        assert_eq!(body.status(), JobStatus::Completed);
    }

    /// Accepts one connection, answers `200` with a body it never finishes.
    fn stalled_body_server() -> String {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"id\":",
            );
            let _ = stream.flush();
            std::thread::sleep(Duration::from_secs(10));
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stalled_response_body_is_a_timeout() {
        let client = OpenAiResponses::new(RetryPolicy::no_retry()).expect("client");
        let config = ClientConfig {
            base_url: stalled_body_server(),
            timeout: Duration::from_millis(300),
            ..ClientConfig::new("sk-test")
        };
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.respond(&config, &request("gpt-4o")),
        )
        .await
        .expect("call is bounded by the client timeout");

        assert!(matches!(&result, Err(PipelineError::Transport(msg)) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn client_config_debug_redacts_key() {
        let config = ClientConfig::new("sk-secret");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
