pub mod filesystem;

pub use filesystem::{builtin_capabilities, expand_home};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use ember_types::{ToolCategory, ToolManifest, ToolResult};

/// A named unit of executable functionality. Handlers receive arguments that
/// already passed manifest validation, with declared defaults filled in.
#[async_trait]
pub trait Capability: Send + Sync {
    fn manifest(&self) -> ToolManifest;
    async fn execute(&self, args: Value) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("tool `{tool}` timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },
    #[error("tool `{tool}` failed: {message}")]
    Execution { tool: String, message: String },
}

impl CapabilityError {
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::UnknownTool(_) => "unknown_tool",
            CapabilityError::DuplicateTool(_) => "duplicate_tool",
            CapabilityError::InvalidArguments { .. } => "invalid_arguments",
            CapabilityError::Timeout { .. } => "timeout",
            CapabilityError::Execution { .. } => "tool_execution",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    pub call_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub last_called: Option<DateTime<Utc>>,
}

impl ToolStats {
    fn record(&mut self, success: bool, duration_ms: u64) {
        self.call_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.total_duration_ms += duration_ms;
        self.average_duration_ms = self.total_duration_ms as f64 / self.call_count as f64;
        self.last_called = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub manifest: ToolManifest,
    pub stats: ToolStats,
}

#[derive(Clone)]
struct RegisteredTool {
    manifest: Arc<ToolManifest>,
    handler: Arc<dyn Capability>,
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    tools: Arc<RwLock<HashMap<String, RegisteredTool>>>,
    stats: Arc<Mutex<HashMap<String, ToolStats>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_builtins() -> Result<Self, CapabilityError> {
        let registry = Self::new();
        for capability in builtin_capabilities() {
            registry.register(capability).await?;
        }
        Ok(registry)
    }

    /// Registers a capability under its manifest name. The manifest is
    /// captured once here and never re-read from the handler.
    pub async fn register(&self, handler: Arc<dyn Capability>) -> Result<(), CapabilityError> {
        let manifest = handler.manifest();
        let name = manifest.name.clone();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            return Err(CapabilityError::DuplicateTool(name));
        }
        tools.insert(
            name.clone(),
            RegisteredTool {
                manifest: Arc::new(manifest),
                handler,
            },
        );
        drop(tools);
        self.stats.lock().await.insert(name.clone(), ToolStats::default());
        tracing::debug!("registered tool {}", name);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name).is_some();
        if removed {
            self.stats.lock().await.remove(name);
        }
        removed
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    pub async fn manifest(&self, name: &str) -> Option<ToolManifest> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|t| t.manifest.as_ref().clone())
    }

    pub async fn stats(&self, name: &str) -> Option<ToolStats> {
        self.stats.lock().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolInfo> {
        let manifests = {
            let tools = self.tools.read().await;
            tools
                .values()
                .map(|t| t.manifest.as_ref().clone())
                .collect::<Vec<_>>()
        };
        let stats = self.stats.lock().await;
        let mut out = manifests
            .into_iter()
            .map(|manifest| ToolInfo {
                stats: stats.get(&manifest.name).cloned().unwrap_or_default(),
                manifest,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        out
    }

    pub async fn by_category(&self, category: ToolCategory) -> Vec<ToolManifest> {
        let mut out = self
            .tools
            .read()
            .await
            .values()
            .filter(|t| t.manifest.category == category)
            .map(|t| t.manifest.as_ref().clone())
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn schemas(&self) -> Vec<Value> {
        self.list()
            .await
            .iter()
            .map(|info| info.manifest.to_schema())
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        let Some(tool) = self.tools.read().await.get(name).cloned() else {
            return Err(CapabilityError::UnknownTool(name.to_string()));
        };

        let started = Instant::now();
        let outcome = match validate_args(&tool.manifest, args) {
            Ok(args) => self.dispatch(&tool, args).await,
            Err(err) => Err(err),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(stats) = self.stats.lock().await.get_mut(name) {
            stats.record(outcome.is_ok(), duration_ms);
        }
        match &outcome {
            Ok(_) => tracing::debug!("tool {} finished in {}ms", name, duration_ms),
            Err(err) => tracing::warn!("tool {} failed after {}ms: {}", name, duration_ms, err),
        }
        outcome
    }

    async fn dispatch(
        &self,
        tool: &RegisteredTool,
        args: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let name = tool.manifest.name.clone();
        let secs = tool.manifest.timeout_secs;
        let call = tool.handler.execute(Value::Object(args));
        let result = if secs == 0 {
            call.await
        } else {
            tokio::time::timeout(Duration::from_secs(secs), call)
                .await
                .map_err(|_| CapabilityError::Timeout {
                    tool: name.clone(),
                    secs,
                })?
        };
        result.map_err(|err| CapabilityError::Execution {
            tool: name,
            message: format!("{err:#}"),
        })
    }
}

/// Checks `args` against the manifest and returns them with declared
/// defaults filled in for absent optional parameters.
pub fn validate_args(
    manifest: &ToolManifest,
    args: Value,
) -> Result<Map<String, Value>, CapabilityError> {
    let invalid = |reason: String| CapabilityError::InvalidArguments {
        tool: manifest.name.clone(),
        reason,
    };
    let mut args = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(invalid(format!("expected an object, got {other}"))),
    };

    for param in &manifest.parameters {
        let present = args.get(&param.name).filter(|v| !v.is_null());
        let Some(value) = present else {
            if param.required {
                return Err(invalid(format!("missing required parameter `{}`", param.name)));
            }
            if let Some(default) = &param.default {
                args.insert(param.name.clone(), default.clone());
            }
            continue;
        };
        if !param.param_type.matches(value) {
            return Err(invalid(format!(
                "parameter `{}` expects {:?}, got {}",
                param.name, param.param_type, value
            )));
        }
        if let Some(choices) = &param.choices {
            if !choices.contains(value) {
                return Err(invalid(format!(
                    "parameter `{}` must be one of {}, got {}",
                    param.name,
                    Value::Array(choices.clone()),
                    value
                )));
            }
        }
    }
    Ok(args)
}

/// The error a handler reported in-band with `"success": false`, if any.
pub fn reported_failure(payload: &Value) -> Option<String> {
    if payload.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    Some(
        payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("tool reported failure")
            .to_string(),
    )
}

/// Wraps a handler payload for a direct call. An in-band failure keeps its
/// payload but is reported as `tool_execution`, as in plan execution.
pub fn payload_result(tool: &str, payload: Value, duration_ms: u64) -> ToolResult {
    match reported_failure(&payload) {
        Some(error) => ToolResult {
            result: payload,
            ..ToolResult::failed(tool, "tool_execution", error, duration_ms)
        },
        None => ToolResult::ok(tool, payload, duration_ms),
    }
}
