pub mod llama_cpp;

pub use llama_cpp::{LlamaCppBackend, FALLBACK_MODEL_NAME};

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use ember_observability::{emit_event, ObservabilityEvent, ProcessKind};
use ember_types::{CompletionRequest, CompletionResponse, ModelType};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, RouterError>> + Send>>;

const JSON_ONLY_INSTRUCTION: &str =
    "Respond with valid JSON only. No markdown, no explanation, just the JSON object.";

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no model backend is reachable: {0}")]
    Connectivity(String),
    #[error("{backend} backend unreachable: {message}")]
    Unreachable { backend: ModelType, message: String },
    #[error("{backend} backend timed out after {secs}s")]
    Timeout { backend: ModelType, secs: u64 },
    #[error("{backend} backend returned status {status}: {body}")]
    Backend {
        backend: ModelType,
        status: u16,
        body: String,
    },
    #[error("{backend} backend sent an unreadable response: {message}")]
    Decode { backend: ModelType, message: String },
    #[error("model did not return valid JSON ({reason}): {raw}")]
    InvalidJsonResponse { raw: String, reason: String },
}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Connectivity(_)
            | RouterError::Unreachable { .. }
            | RouterError::Timeout { .. } => "connectivity",
            RouterError::Backend { .. } | RouterError::Decode { .. } => "backend_error",
            RouterError::InvalidJsonResponse { .. } => "invalid_json_response",
        }
    }

    /// Errors that mean the backend itself is gone, as opposed to a bad answer.
    pub fn marks_backend_down(&self) -> bool {
        matches!(
            self,
            RouterError::Unreachable { .. } | RouterError::Timeout { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub model_name: String,
    pub stats: Value,
}

#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: String,
    pub tokens_used: u64,
    pub finish_reason: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn model_type(&self) -> ModelType;
    fn base_url(&self) -> &str;
    async fn probe(&self) -> Result<BackendHealth, RouterError>;
    async fn complete(&self, req: &CompletionRequest) -> Result<RawCompletion, RouterError>;
    async fn stream(&self, req: &CompletionRequest) -> Result<TokenStream, RouterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub text_url: String,
    pub vision_url: String,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            text_url: "http://127.0.0.1:8080".to_string(),
            vision_url: "http://127.0.0.1:8081".to_string(),
            request_timeout_secs: 120,
            probe_timeout_secs: 5,
            health_interval_secs: 30,
            max_tokens: 2048,
            temperature: 0.1,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub url: String,
    pub connected: bool,
    pub model_name: Option<String>,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: Value,
}

struct BackendSlot {
    backend: Arc<dyn Backend>,
    status: RwLock<BackendStatus>,
}

impl BackendSlot {
    fn new(backend: Arc<dyn Backend>) -> Self {
        let status = BackendStatus {
            url: backend.base_url().to_string(),
            stats: json!({}),
            ..BackendStatus::default()
        };
        Self {
            backend,
            status: RwLock::new(status),
        }
    }
}

/// Routes completions across the text and vision backends.
///
/// Connectivity is cached between calls and refreshed by [`ModelRouter::probe_all`],
/// the health monitor, or a failed call. A request is sent to its own backend
/// when that one is up, otherwise to the other backend when that does not drop
/// an image payload.
#[derive(Clone)]
pub struct ModelRouter {
    text: Arc<BackendSlot>,
    vision: Arc<BackendSlot>,
    defaults: Arc<BackendsConfig>,
}

impl ModelRouter {
    pub fn new(text: Arc<dyn Backend>, vision: Arc<dyn Backend>) -> Self {
        Self::with_defaults(text, vision, BackendsConfig::default())
    }

    pub fn with_defaults(
        text: Arc<dyn Backend>,
        vision: Arc<dyn Backend>,
        defaults: BackendsConfig,
    ) -> Self {
        Self {
            text: Arc::new(BackendSlot::new(text)),
            vision: Arc::new(BackendSlot::new(vision)),
            defaults: Arc::new(defaults),
        }
    }

    pub fn from_config(config: &BackendsConfig) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let probe_timeout = Duration::from_secs(config.probe_timeout_secs);
        let text = LlamaCppBackend::new(
            ModelType::Text,
            &config.text_url,
            request_timeout,
            probe_timeout,
        )?;
        let vision = LlamaCppBackend::new(
            ModelType::Vision,
            &config.vision_url,
            request_timeout,
            probe_timeout,
        )?;
        Ok(Self::with_defaults(
            Arc::new(text),
            Arc::new(vision),
            config.clone(),
        ))
    }

    fn slot(&self, model_type: ModelType) -> &BackendSlot {
        match model_type {
            ModelType::Text => &self.text,
            ModelType::Vision => &self.vision,
        }
    }

    /// A request pre-filled with the configured sampling defaults.
    pub fn request(&self, prompt: impl Into<String>) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.into(),
            max_tokens: self.defaults.max_tokens,
            temperature: self.defaults.temperature,
            top_p: self.defaults.top_p,
            top_k: self.defaults.top_k,
            repeat_penalty: self.defaults.repeat_penalty,
            ..CompletionRequest::default()
        }
    }

    pub async fn probe(&self, model_type: ModelType) -> bool {
        let slot = self.slot(model_type);
        let result = slot.backend.probe().await;
        let mut status = slot.status.write().await;
        let was_connected = status.connected;
        status.last_probe = Some(Utc::now());
        match result {
            Ok(health) => {
                status.connected = true;
                status.model_name = Some(health.model_name);
                status.stats = health.stats;
                status.last_error = None;
                if !was_connected {
                    emit_event(
                        Level::INFO,
                        ProcessKind::Daemon,
                        ObservabilityEvent {
                            event: "backend.connected",
                            component: "model_router",
                            backend: Some(model_type.as_str()),
                            model: status.model_name.as_deref(),
                            status: Some("up"),
                            ..Default::default()
                        },
                    );
                }
                true
            }
            Err(err) => {
                status.connected = false;
                status.last_error = Some(err.to_string());
                if was_connected {
                    emit_event(
                        Level::WARN,
                        ProcessKind::Daemon,
                        ObservabilityEvent {
                            event: "backend.disconnected",
                            component: "model_router",
                            backend: Some(model_type.as_str()),
                            status: Some("down"),
                            error_code: Some(err.kind()),
                            detail: Some(&err.to_string()),
                            ..Default::default()
                        },
                    );
                }
                false
            }
        }
    }

    /// Probes both backends concurrently. Returns true when at least one is up.
    pub async fn probe_all(&self) -> bool {
        let (text, vision) =
            futures::join!(self.probe(ModelType::Text), self.probe(ModelType::Vision));
        text || vision
    }

    pub async fn is_connected(&self) -> bool {
        self.text.status.read().await.connected || self.vision.status.read().await.connected
    }

    pub async fn is_backend_connected(&self, model_type: ModelType) -> bool {
        self.slot(model_type).status.read().await.connected
    }

    /// Model name of the backend a plain text request would use right now.
    pub async fn active_model_name(&self) -> String {
        for model_type in [ModelType::Text, ModelType::Vision] {
            let status = self.slot(model_type).status.read().await;
            if status.connected {
                return status.model_name.clone().unwrap_or_default();
            }
        }
        String::new()
    }

    pub async fn backend_stats(&self) -> Value {
        let text = self.text.status.read().await.clone();
        let vision = self.vision.status.read().await.clone();
        json!({ "text": text, "vision": vision })
    }

    async fn mark_unavailable(&self, model_type: ModelType, err: &RouterError) {
        {
            let mut status = self.slot(model_type).status.write().await;
            status.connected = false;
            status.last_error = Some(err.to_string());
        }
        emit_event(
            Level::WARN,
            ProcessKind::Daemon,
            ObservabilityEvent {
                event: "backend.marked_unavailable",
                component: "model_router",
                backend: Some(model_type.as_str()),
                status: Some("down"),
                error_code: Some(err.kind()),
                detail: Some(&err.to_string()),
                ..Default::default()
            },
        );
    }

    /// Backends allowed to serve `req`, in preference order, that are
    /// currently believed to be up.
    async fn candidates(&self, req: &CompletionRequest) -> Vec<ModelType> {
        let requested = req.requested_model_type();
        let mut out = Vec::with_capacity(2);
        if self.is_backend_connected(requested).await {
            out.push(requested);
        }
        let alternate = requested.other();
        let substitution_allowed = match alternate {
            ModelType::Vision => true,
            ModelType::Text => !req.has_images(),
        };
        if substitution_allowed && self.is_backend_connected(alternate).await {
            out.push(alternate);
        }
        out
    }

    async fn candidates_or_reconnect(
        &self,
        req: &CompletionRequest,
    ) -> Result<Vec<ModelType>, RouterError> {
        let candidates = self.candidates(req).await;
        if !candidates.is_empty() {
            return Ok(candidates);
        }
        tracing::info!(
            "no usable backend for {} request, re-probing both",
            req.requested_model_type()
        );
        self.probe_all().await;
        let candidates = self.candidates(req).await;
        if candidates.is_empty() {
            return Err(self.no_backend_error(req).await);
        }
        Ok(candidates)
    }

    async fn no_backend_error(&self, req: &CompletionRequest) -> RouterError {
        let requested = req.requested_model_type();
        let reason = self
            .slot(requested)
            .status
            .read()
            .await
            .last_error
            .clone()
            .unwrap_or_else(|| "not connected".to_string());
        if req.has_images() {
            RouterError::Connectivity(format!(
                "vision backend required for image input is unavailable ({reason})"
            ))
        } else {
            RouterError::Connectivity(format!(
                "text and vision backends are unavailable ({reason})"
            ))
        }
    }

    pub async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, RouterError> {
        let candidates = self.candidates_or_reconnect(&req).await?;
        let mut last_err = None;
        for model_type in candidates {
            let slot = self.slot(model_type);
            match slot.backend.complete(&req).await {
                Ok(raw) => {
                    let model = slot
                        .status
                        .read()
                        .await
                        .model_name
                        .clone()
                        .unwrap_or_else(|| FALLBACK_MODEL_NAME.to_string());
                    if model_type != req.requested_model_type() {
                        tracing::info!(
                            "{} request served by {} backend ({})",
                            req.requested_model_type(),
                            model_type,
                            model
                        );
                    }
                    return Ok(CompletionResponse {
                        content: raw.content,
                        model,
                        backend: model_type,
                        tokens_used: raw.tokens_used,
                        finish_reason: raw.finish_reason,
                        duration_ms: raw.duration_ms,
                    });
                }
                Err(err) if err.marks_backend_down() => {
                    self.mark_unavailable(model_type, &err).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(match last_err {
            Some(err) => RouterError::Connectivity(err.to_string()),
            None => self.no_backend_error(&req).await,
        })
    }

    pub async fn stream_complete(&self, req: CompletionRequest) -> Result<TokenStream, RouterError> {
        let candidates = self.candidates_or_reconnect(&req).await?;
        let mut last_err = None;
        for model_type in candidates {
            match self.slot(model_type).backend.stream(&req).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.marks_backend_down() => {
                    self.mark_unavailable(model_type, &err).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(match last_err {
            Some(err) => RouterError::Connectivity(err.to_string()),
            None => self.no_backend_error(&req).await,
        })
    }

    /// ChatML-framed completion over a message list.
    pub async fn complete_chat(
        &self,
        messages: &[ChatMessage],
        model_type: ModelType,
    ) -> Result<CompletionResponse, RouterError> {
        let mut req = self.request(chatml_prompt(messages)).with_model_type(model_type);
        req.stop.push("<|im_end|>".to_string());
        self.complete(req).await
    }

    /// Completion whose content must parse as JSON.
    pub async fn complete_json(&self, mut req: CompletionRequest) -> Result<Value, RouterError> {
        req.prompt = format!("{}\n\n{}", req.prompt, JSON_ONLY_INSTRUCTION);
        let response = self.complete(req).await?;
        parse_json_response(&response.content)
    }

    /// Re-probes both backends every `interval` until `cancel` fires.
    pub fn spawn_health_monitor(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                router.probe_all().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

pub fn chatml_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// Parses model output as JSON after removing a surrounding Markdown fence.
pub fn parse_json_response(content: &str) -> Result<Value, RouterError> {
    let cleaned = strip_code_fence(content);
    serde_json::from_str::<Value>(cleaned).map_err(|err| {
        tracing::warn!(
            "model output is not valid JSON: {}",
            truncate_for_error(content, 200)
        );
        RouterError::InvalidJsonResponse {
            raw: truncate_for_error(content, 200),
            reason: err.to_string(),
        }
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line, e.g. ```json
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ember_types::ImageData;

    #[derive(Clone, Copy)]
    enum Reply {
        Ok,
        Timeout,
        Status(u16),
    }

    struct FakeBackend {
        model_type: ModelType,
        name: &'static str,
        healthy: AtomicBool,
        reply: Mutex<Reply>,
        probes: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(model_type: ModelType, name: &'static str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                model_type,
                name,
                healthy: AtomicBool::new(healthy),
                reply: Mutex::new(Reply::Ok),
                probes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_reply(&self, reply: Reply) {
            *self.reply.lock().expect("reply lock") = reply;
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn model_type(&self) -> ModelType {
            self.model_type
        }

        fn base_url(&self) -> &str {
            "http://fake"
        }

        async fn probe(&self) -> Result<BackendHealth, RouterError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(BackendHealth {
                    model_name: self.name.to_string(),
                    stats: json!({"status": "ok"}),
                })
            } else {
                Err(RouterError::Unreachable {
                    backend: self.model_type,
                    message: "connection refused".to_string(),
                })
            }
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<RawCompletion, RouterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = *self.reply.lock().expect("reply lock");
            match reply {
                Reply::Ok => Ok(RawCompletion {
                    content: format!("{} says: {}", self.name, req.prompt),
                    tokens_used: 5,
                    finish_reason: "eos".to_string(),
                    duration_ms: 1,
                }),
                Reply::Timeout => Err(RouterError::Timeout {
                    backend: self.model_type,
                    secs: 120,
                }),
                Reply::Status(status) => Err(RouterError::Backend {
                    backend: self.model_type,
                    status,
                    body: "boom".to_string(),
                }),
            }
        }

        async fn stream(&self, req: &CompletionRequest) -> Result<TokenStream, RouterError> {
            let raw = self.complete(req).await?;
            Ok(Box::pin(futures::stream::iter(vec![Ok(raw.content)])))
        }
    }

    fn router(text: &Arc<FakeBackend>, vision: &Arc<FakeBackend>) -> ModelRouter {
        ModelRouter::new(text.clone(), vision.clone())
    }

    #[tokio::test]
    async fn text_request_fails_over_to_vision_when_text_probe_fails() {
        let text = FakeBackend::new(ModelType::Text, "qwen-text", false);
        let vision = FakeBackend::new(ModelType::Vision, "qwen-vl", true);
        let router = router(&text, &vision);

        let resp = router
            .complete(CompletionRequest::new("hello"))
            .await
            .expect("completion");
        assert_eq!(resp.backend, ModelType::Vision);
        assert_eq!(resp.model, "qwen-vl");
        assert_eq!(text.calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.active_model_name().await, "qwen-vl");
    }

    #[tokio::test]
    async fn both_backends_down_returns_connectivity_error_without_posting() {
        let text = FakeBackend::new(ModelType::Text, "t", false);
        let vision = FakeBackend::new(ModelType::Vision, "v", false);
        let router = router(&text, &vision);

        let err = router
            .complete(CompletionRequest::new("hello"))
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), "connectivity");
        assert_eq!(text.calls.load(Ordering::SeqCst), 0);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
        assert_eq!(text.probes.load(Ordering::SeqCst), 1);
        assert_eq!(vision.probes.load(Ordering::SeqCst), 1);
        assert!(!router.is_connected().await);
    }

    #[tokio::test]
    async fn image_request_never_falls_back_to_text() {
        let text = FakeBackend::new(ModelType::Text, "t", true);
        let vision = FakeBackend::new(ModelType::Vision, "v", false);
        let router = router(&text, &vision);
        router.probe_all().await;

        let req = CompletionRequest::new("what is this").with_images(vec![ImageData {
            id: 1,
            data: "aGk=".to_string(),
        }]);
        let err = router.complete(req).await.expect_err("should fail");
        assert_eq!(err.kind(), "connectivity");
        assert_eq!(text.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vision_request_without_images_may_use_text() {
        let text = FakeBackend::new(ModelType::Text, "t", true);
        let vision = FakeBackend::new(ModelType::Vision, "v", false);
        let router = router(&text, &vision);
        router.probe_all().await;

        let resp = router
            .complete(CompletionRequest::new("hi").with_model_type(ModelType::Vision))
            .await
            .expect("completion");
        assert_eq!(resp.backend, ModelType::Text);
    }

    #[tokio::test]
    async fn timeout_marks_only_that_backend_down_and_fails_over() {
        let text = FakeBackend::new(ModelType::Text, "t", true);
        let vision = FakeBackend::new(ModelType::Vision, "v", true);
        let router = router(&text, &vision);
        router.probe_all().await;
        text.set_reply(Reply::Timeout);

        let first = router
            .complete(CompletionRequest::new("one"))
            .await
            .expect("failover");
        assert_eq!(first.backend, ModelType::Vision);
        assert!(!router.is_backend_connected(ModelType::Text).await);
        assert!(router.is_backend_connected(ModelType::Vision).await);

        let second = router
            .complete(CompletionRequest::new("two"))
            .await
            .expect("cached failover");
        assert_eq!(second.backend, ModelType::Vision);
        assert_eq!(text.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_fails_over_like_complete() {
        use futures::StreamExt;

        let text = FakeBackend::new(ModelType::Text, "t", true);
        let vision = FakeBackend::new(ModelType::Vision, "v", true);
        let router = router(&text, &vision);
        router.probe_all().await;
        text.set_reply(Reply::Timeout);

        let chunks: Vec<String> = router
            .stream_complete(CompletionRequest::new("tokens"))
            .await
            .expect("stream")
            .filter_map(|chunk| async move { chunk.ok() })
            .collect()
            .await;
        assert_eq!(chunks, vec!["v says: tokens".to_string()]);
        assert!(!router.is_backend_connected(ModelType::Text).await);
    }

    #[tokio::test]
    async fn http_error_status_is_a_backend_error_not_a_disconnect() {
        let text = FakeBackend::new(ModelType::Text, "t", true);
        let vision = FakeBackend::new(ModelType::Vision, "v", true);
        let router = router(&text, &vision);
        router.probe_all().await;
        text.set_reply(Reply::Status(500));

        let err = router
            .complete(CompletionRequest::new("x"))
            .await
            .expect_err("should fail");
        assert_eq!(err.kind(), "backend_error");
        assert!(router.is_backend_connected(ModelType::Text).await);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovered_backend_is_used_again_after_reprobe() {
        let text = FakeBackend::new(ModelType::Text, "t", false);
        let vision = FakeBackend::new(ModelType::Vision, "v", false);
        let router = router(&text, &vision);
        assert!(!router.probe_all().await);

        text.healthy.store(true, Ordering::SeqCst);
        let resp = router
            .complete(CompletionRequest::new("x"))
            .await
            .expect("completion after reconnect");
        assert_eq!(resp.backend, ModelType::Text);
    }

    #[test]
    fn json_response_fences_are_stripped() {
        let value = parse_json_response("```json\n{\"steps\": []}\n```").expect("json");
        assert_eq!(value, json!({"steps": []}));
        let value = parse_json_response("  {\"a\": 1}  ").expect("json");
        assert_eq!(value["a"], json!(1));
    }

    #[test]
    fn invalid_json_keeps_truncated_raw_text() {
        let raw = format!("Sure! Here you go: {}", "x".repeat(400));
        let err = parse_json_response(&raw).expect_err("invalid");
        assert_eq!(err.kind(), "invalid_json_response");
        let RouterError::InvalidJsonResponse { raw: kept, .. } = err else {
            panic!("wrong variant");
        };
        assert!(kept.len() <= 203);
        assert!(kept.starts_with("Sure! Here you go"));
    }

    #[test]
    fn chatml_prompt_ends_with_open_assistant_turn() {
        let prompt = chatml_prompt(&[
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi"),
        ]);
        assert!(prompt.starts_with("<|im_start|>system\nbe brief<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }
}
