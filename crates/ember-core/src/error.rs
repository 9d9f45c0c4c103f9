use std::path::{Path, PathBuf};

use serde::ser::SerializeStruct;
use serde::Serialize;

use ember_providers::RouterError;
use ember_tools::CapabilityError;

#[derive(Debug, thiserror::Error)]
#[error("rollback of task `{task_id}` failed at {path}: {reason}")]
pub struct RollbackError {
    pub task_id: String,
    pub snapshot_id: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("planner failed: {0}")]
    Planner(String),
    #[error("conversation store failed: {0}")]
    Memory(String),
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error(transparent)]
    Rollback(#[from] RollbackError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Stable error kind sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Capability(err) => err.kind(),
            EngineError::Router(err) => err.kind(),
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::ConfirmationRequired(_) => "confirmation_required",
            EngineError::TaskNotFound(_) => "task_not_found",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Planner(_) => "planner_failed",
            EngineError::Memory(_) => "memory_failed",
            EngineError::Snapshot(_) => "snapshot_failed",
            EngineError::Rollback(_) => "rollback_failed",
            EngineError::Io { .. } | EngineError::Json { .. } => "io",
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("EngineError", 2)?;
        state.serialize_field("errorType", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn json_error(path: &Path, source: serde_json::Error) -> EngineError {
    EngineError::Json {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn errors_serialize_with_kind_and_message() {
        let err = EngineError::PermissionDenied("write to /etc/passwd".to_string());
        assert_eq!(
            serde_json::to_value(&err).expect("json"),
            json!({"errorType": "permission_denied", "message": "permission denied: write to /etc/passwd"})
        );
    }

    #[test]
    fn nested_errors_keep_their_own_kind() {
        let err: EngineError = CapabilityError::InvalidArguments {
            tool: "filesystem.read".to_string(),
            reason: "missing required parameter `path`".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "invalid_arguments");
        let err: EngineError = RouterError::Connectivity("down".to_string()).into();
        assert_eq!(err.kind(), "connectivity");
    }
}
