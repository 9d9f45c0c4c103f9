use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ember_types::{ExecutionPlan, ToolResult};

/// Agent replies are cut to this many characters when replayed as context.
pub const RECENT_TURN_RESPONSE_CHARS: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTurn {
    pub user: String,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: String,
}

/// Everything the planner sees besides the message. Built once per request
/// and passed by reference afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub system: SystemContext,
    #[serde(default)]
    pub recent_turns: Vec<RecentTurn>,
    #[serde(default)]
    pub attached_files: Vec<AttachedFile>,
}

impl RequestContext {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One persisted request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(default)]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub agent_response: String,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub results: Vec<ToolResult>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub duration_ms: u64,
    pub success: bool,
}

impl ConversationRecord {
    pub fn to_turn(&self) -> RecentTurn {
        RecentTurn {
            user: self.user_message.clone(),
            agent: self
                .agent_response
                .chars()
                .take(RECENT_TURN_RESPONSE_CHARS)
                .collect(),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(
        &self,
        message: &str,
        context: &RequestContext,
    ) -> anyhow::Result<ExecutionPlan>;

    async fn synthesize_response(
        &self,
        message: &str,
        plan: &ExecutionPlan,
        results: &[ToolResult],
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Persists the record and returns its id.
    async fn store_conversation(&self, record: ConversationRecord) -> anyhow::Result<String>;

    /// Newest first.
    async fn recent_conversations(&self, limit: usize) -> anyhow::Result<Vec<ConversationRecord>>;
}

/// Source of ambient desktop state (active window, clipboard, cwd).
pub trait ContextSource: Send + Sync {
    fn system_context(&self) -> SystemContext;
}

/// Reports only the daemon's working directory.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext;

impl ContextSource for ProcessContext {
    fn system_context(&self) -> SystemContext {
        SystemContext {
            current_directory: std::env::current_dir()
                .ok()
                .map(|p| p.to_string_lossy().to_string()),
            ..SystemContext::default()
        }
    }
}

/// Describes each attached path that exists; missing paths are dropped.
pub async fn describe_attached_files(paths: &[PathBuf]) -> Vec<AttachedFile> {
    let mut files = Vec::new();
    for path in paths {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            tracing::debug!("attached file {:?} does not exist, skipping", path);
            continue;
        };
        files.push(AttachedFile {
            path: path.to_string_lossy().to_string(),
            name: file_name(path),
            size: meta.len(),
            file_type: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        });
    }
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
