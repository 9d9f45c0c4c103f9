use std::time::{Duration, Instant};
use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

use ember_types::{CompletionRequest, ModelType};

use crate::{truncate_for_error, Backend, BackendHealth, RawCompletion, RouterError};

pub const FALLBACK_MODEL_NAME: &str = "llama.cpp";

/// HTTP client for one llama.cpp-compatible inference server.
pub struct LlamaCppBackend {
    model_type: ModelType,
    base_url: String,
    client: Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl LlamaCppBackend {
    pub fn new(
        model_type: ModelType,
        base_url: &str,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            model_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            request_timeout,
            probe_timeout,
        })
    }

    fn classify(&self, err: reqwest::Error, timeout: Duration) -> RouterError {
        if err.is_timeout() {
            RouterError::Timeout {
                backend: self.model_type,
                secs: timeout.as_secs(),
            }
        } else if err.is_connect() || err.is_request() {
            RouterError::Unreachable {
                backend: self.model_type,
                message: err.to_string(),
            }
        } else {
            RouterError::Decode {
                backend: self.model_type,
                message: err.to_string(),
            }
        }
    }

    async fn resolve_model_name(&self) -> String {
        let url = format!("{}/v1/models", self.base_url);
        let Ok(resp) = self
            .client
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        else {
            return FALLBACK_MODEL_NAME.to_string();
        };
        if !resp.status().is_success() {
            return FALLBACK_MODEL_NAME.to_string();
        }
        let Ok(value) = resp.json::<Value>().await else {
            return FALLBACK_MODEL_NAME.to_string();
        };
        value
            .get("data")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_MODEL_NAME)
            .to_string()
    }
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn model_type(&self) -> ModelType {
        self.model_type
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self) -> Result<BackendHealth, RouterError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.classify(e, self.probe_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RouterError::Unreachable {
                backend: self.model_type,
                message: format!("health check returned status {status}"),
            });
        }
        let stats = resp.json::<Value>().await.unwrap_or_else(|_| json!({}));
        let model_name = self.resolve_model_name().await;
        Ok(BackendHealth { model_name, stats })
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<RawCompletion, RouterError> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/completion", self.base_url))
            .timeout(self.request_timeout)
            .json(&completion_body(req, false))
            .send()
            .await
            .map_err(|e| self.classify(e, self.request_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RouterError::Backend {
                backend: self.model_type,
                status: status.as_u16(),
                body: truncate_for_error(&text, 500),
            });
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| self.classify(e, self.request_timeout))?;
        let mut raw = parse_completion_body(&value);
        raw.duration_ms = started.elapsed().as_millis() as u64;
        Ok(raw)
    }

    async fn stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, RouterError>> + Send>>, RouterError> {
        let resp = self
            .client
            .post(format!("{}/completion", self.base_url))
            .timeout(self.request_timeout)
            .json(&completion_body(req, true))
            .send()
            .await
            .map_err(|e| self.classify(e, self.request_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RouterError::Backend {
                backend: self.model_type,
                status: status.as_u16(),
                body: truncate_for_error(&text, 500),
            });
        }

        let model_type = self.model_type;
        let timeout = self.request_timeout;
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut lines = LineBuffer::default();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    if e.is_timeout() {
                        RouterError::Timeout { backend: model_type, secs: timeout.as_secs() }
                    } else {
                        RouterError::Decode { backend: model_type, message: e.to_string() }
                    }
                })?;
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(event) = parse_stream_line(&line) else {
                        continue;
                    };
                    if !event.content.is_empty() {
                        yield event.content;
                    }
                    if event.stop {
                        break 'outer;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn completion_body(req: &CompletionRequest, stream: bool) -> Value {
    let mut body = json!({
        "prompt": req.prompt,
        "n_predict": req.max_tokens,
        "temperature": req.temperature,
        "top_p": req.top_p,
        "top_k": req.top_k,
        "repeat_penalty": req.repeat_penalty,
        "stop": req.stop,
        "stream": stream,
    });
    if req.has_images() {
        body["image_data"] = json!(req.images);
    }
    body
}

fn parse_completion_body(value: &Value) -> RawCompletion {
    let content = value
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let evaluated = value
        .get("tokens_evaluated")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let predicted = value
        .get("tokens_predicted")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let finish_reason = value
        .get("stop_type")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    RawCompletion {
        content,
        tokens_used: evaluated.saturating_add(predicted),
        finish_reason,
        duration_ms: 0,
    }
}

/// Accumulates raw stream bytes and hands out whole lines. Chunks may end
/// inside a multibyte character; a line is only decoded once its newline
/// has arrived.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }
}

#[derive(Debug, PartialEq)]
struct StreamLine {
    content: String,
    stop: bool,
}

fn parse_stream_line(line: &str) -> Option<StreamLine> {
    let payload = line.trim().strip_prefix("data: ")?;
    let value = serde_json::from_str::<Value>(payload).ok()?;
    Some(StreamLine {
        content: value
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        stop: value.get("stop").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}
