use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::ExecutionPlan;
use crate::tool::ToolResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub backup_path: PathBuf,
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedBackup {
    pub path: PathBuf,
    pub error: String,
}

/// Pre-operation copy of the paths a destructive step is about to touch.
/// `complete` is false when at least one existing path could not be copied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub affected_paths: Vec<PathBuf>,
    pub backups: BTreeMap<PathBuf, BackupEntry>,
    #[serde(default)]
    pub failed_paths: Vec<FailedBackup>,
    #[serde(default = "default_complete")]
    pub complete: bool,
    #[serde(default)]
    pub metadata: Value,
}

fn default_complete() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub message: String,
    pub plan: ExecutionPlan,
    pub status: TaskStatus,
    #[serde(default)]
    pub completed_steps: Vec<usize>,
    #[serde(default)]
    pub results: Vec<ToolResult>,
    #[serde(default)]
    pub snapshots: Vec<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn new(id: impl Into<String>, message: impl Into<String>, plan: ExecutionPlan) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            message: message.into(),
            plan,
            status: TaskStatus::Pending,
            completed_steps: Vec::new(),
            results: Vec::new(),
            snapshots: Vec::new(),
            error: None,
            interrupted: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.id.clone()).collect()
    }
}
