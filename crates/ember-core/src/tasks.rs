use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use ember_types::{
    BackupEntry, BackupKind, ExecutionPlan, FailedBackup, StateSnapshot, TaskExecution,
    TaskStatus, ToolResult,
};

use crate::error::{io_error, json_error, EngineError, RollbackError};

struct ActiveTask {
    task: TaskExecution,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TaskTable {
    active: HashMap<String, ActiveTask>,
    history: HashMap<String, TaskExecution>,
    history_order: VecDeque<String>,
}

impl TaskTable {
    fn get(&self, id: &str) -> Option<&TaskExecution> {
        self.active
            .get(id)
            .map(|a| &a.task)
            .or_else(|| self.history.get(id))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TaskExecution> {
        if let Some(active) = self.active.get_mut(id) {
            return Some(&mut active.task);
        }
        self.history.get_mut(id)
    }

    fn retire(&mut self, id: &str, limit: usize) {
        let Some(active) = self.active.remove(id) else {
            return;
        };
        self.history.insert(id.to_string(), active.task);
        self.history_order.push_back(id.to_string());
        while self.history_order.len() > limit {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }
}

/// Owns every TaskExecution record: the active set, a bounded history, and
/// the on-disk snapshot area under `backup_dir`.
#[derive(Clone)]
pub struct TaskManager {
    backup_dir: PathBuf,
    history_limit: usize,
    table: Arc<RwLock<TaskTable>>,
}

impl TaskManager {
    pub fn new(backup_dir: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            history_limit: history_limit.max(1),
            table: Arc::new(RwLock::new(TaskTable::default())),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn create_task(
        &self,
        task_id: &str,
        message: &str,
        plan: ExecutionPlan,
    ) -> Result<TaskExecution, EngineError> {
        let mut table = self.table.write().await;
        if table.get(task_id).is_some() {
            return Err(EngineError::InvalidState(format!(
                "task `{task_id}` already exists"
            )));
        }
        let task = TaskExecution::new(task_id, message, plan);
        table.active.insert(
            task_id.to_string(),
            ActiveTask {
                task: task.clone(),
                cancel: CancellationToken::new(),
            },
        );
        tracing::debug!("task {} created", task_id);
        Ok(task)
    }

    pub async fn task(&self, task_id: &str) -> Option<TaskExecution> {
        self.table.read().await.get(task_id).cloned()
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.table.read().await.active.contains_key(task_id)
    }

    pub async fn active_tasks(&self) -> Vec<TaskExecution> {
        let mut tasks = self
            .table
            .read()
            .await
            .active
            .values()
            .map(|a| a.task.clone())
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub async fn active_count(&self) -> usize {
        self.table.read().await.active.len()
    }

    /// Finished tasks, newest first.
    pub async fn task_history(&self, limit: usize) -> Vec<TaskExecution> {
        let table = self.table.read().await;
        table
            .history_order
            .iter()
            .rev()
            .filter_map(|id| table.history.get(id).cloned())
            .take(limit)
            .collect()
    }

    pub async fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.table
            .read()
            .await
            .active
            .get(task_id)
            .map(|a| a.cancel.clone())
    }

    /// Moves an active task to `status`. Terminal statuses retire the record
    /// into history and release its cancellation token.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<TaskExecution, EngineError> {
        let mut table = self.table.write().await;
        let Some(active) = table.active.get_mut(task_id) else {
            return Err(match table.history.get(task_id) {
                Some(task) => EngineError::InvalidState(format!(
                    "task `{task_id}` already finished as {}",
                    task.status.as_str()
                )),
                None => EngineError::TaskNotFound(task_id.to_string()),
            });
        };
        let now = Utc::now();
        active.task.status = status;
        active.task.updated_at = now;
        if error.is_some() {
            active.task.error = error;
        }
        if status.is_terminal() {
            active.task.finished_at = Some(now);
        }
        let snapshot = active.task.clone();
        if status.is_terminal() {
            table.retire(task_id, self.history_limit);
            tracing::info!("task {} finished as {}", task_id, status.as_str());
        }
        Ok(snapshot)
    }

    pub async fn record_result(
        &self,
        task_id: &str,
        step_index: usize,
        result: ToolResult,
    ) -> Result<(), EngineError> {
        let mut table = self.table.write().await;
        let Some(active) = table.active.get_mut(task_id) else {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };
        active.task.completed_steps.push(step_index);
        active.task.results.push(result);
        active.task.updated_at = Utc::now();
        Ok(())
    }

    /// Sets the interrupt flag and fires the task's cancellation token.
    /// Only active tasks can be interrupted.
    pub async fn request_interrupt(&self, task_id: &str) -> bool {
        let mut table = self.table.write().await;
        let Some(active) = table.active.get_mut(task_id) else {
            return false;
        };
        active.task.interrupted = true;
        active.cancel.cancel();
        tracing::info!("interrupt requested for task {}", task_id);
        true
    }

    pub async fn is_interrupted(&self, task_id: &str) -> bool {
        self.table
            .read()
            .await
            .active
            .get(task_id)
            .map(|a| a.task.interrupted || a.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Copies every existing path in `paths` into `<backup_dir>/<task>_<n>/`
    /// and persists the snapshot metadata next to it. Paths that do not exist
    /// are skipped. A path that fails to copy is logged and listed in
    /// `failed_paths`; the snapshot is then marked incomplete.
    pub async fn create_snapshot(
        &self,
        task_id: &str,
        operation: &str,
        paths: &[PathBuf],
        metadata: Value,
    ) -> Result<StateSnapshot, EngineError> {
        let snapshot_id = {
            let table = self.table.read().await;
            let Some(active) = table.active.get(task_id) else {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            };
            format!("{}_{}", task_id, active.task.snapshots.len())
        };

        let backup_root = self.backup_dir.join(&snapshot_id);
        let affected = paths.to_vec();
        let (backups, failed_paths) = {
            let affected = affected.clone();
            tokio::task::spawn_blocking(move || backup_paths(&backup_root, &affected))
                .await
                .map_err(|e| EngineError::Snapshot(format!("backup worker failed: {e}")))?
        };

        let snapshot = StateSnapshot {
            id: snapshot_id.clone(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            affected_paths: affected,
            backups,
            complete: failed_paths.is_empty(),
            failed_paths,
            metadata,
        };
        self.persist_snapshot(&snapshot).await?;

        {
            let mut table = self.table.write().await;
            let Some(active) = table.active.get_mut(task_id) else {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            };
            active.task.snapshots.push(snapshot.clone());
            active.task.updated_at = Utc::now();
        }
        if snapshot.complete {
            tracing::info!("created snapshot {} for task {}", snapshot_id, task_id);
        } else {
            tracing::warn!(
                "snapshot {} for task {} is partial: {} path(s) not backed up",
                snapshot_id,
                task_id,
                snapshot.failed_paths.len()
            );
        }
        Ok(snapshot)
    }

    async fn persist_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| io_error(&self.backup_dir, e))?;
        let path = self.metadata_path(&snapshot.id);
        let raw = serde_json::to_string_pretty(snapshot).map_err(|e| json_error(&path, e))?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| io_error(&path, e))
    }

    fn metadata_path(&self, snapshot_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{snapshot_id}.json"))
    }

    /// Restores the task's snapshots from the newest down to `snapshot_id`
    /// (or only the newest when `None`), then drops every snapshot after the
    /// target and marks the task rolled back. Nothing is committed unless
    /// every path is restored.
    pub async fn rollback(
        &self,
        task_id: &str,
        snapshot_id: Option<&str>,
    ) -> Result<StateSnapshot, EngineError> {
        let (to_restore, target_idx) = {
            let table = self.table.read().await;
            let Some(task) = table.get(task_id) else {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            };
            if task.status == TaskStatus::Running {
                return Err(EngineError::InvalidState(format!(
                    "task `{task_id}` is still running"
                )));
            }
            if task.snapshots.is_empty() {
                return Err(EngineError::InvalidState(format!(
                    "task `{task_id}` has no snapshots"
                )));
            }
            let idx = match snapshot_id {
                Some(id) => task
                    .snapshots
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or_else(|| {
                        EngineError::InvalidState(format!("snapshot `{id}` not found"))
                    })?,
                None => task.snapshots.len() - 1,
            };
            (task.snapshots[idx..].to_vec(), idx)
        };
        let target = to_restore[0].clone();

        let owner = task_id.to_string();
        tokio::task::spawn_blocking(move || restore_snapshots(&owner, &to_restore))
            .await
            .map_err(|e| EngineError::Snapshot(format!("restore worker failed: {e}")))??;

        let mut table = self.table.write().await;
        if let Some(task) = table.get_mut(task_id) {
            let now = Utc::now();
            task.snapshots.truncate(target_idx + 1);
            task.status = TaskStatus::RolledBack;
            task.updated_at = now;
            task.finished_at = Some(now);
        }
        table.retire(task_id, self.history_limit);
        tracing::info!("task {} rolled back to snapshot {}", task_id, target.id);
        Ok(target)
    }

    pub async fn list_persisted_snapshots(&self) -> Result<Vec<StateSnapshot>, EngineError> {
        let dir = self.backup_dir.clone();
        let mut snapshots = tokio::task::spawn_blocking(move || read_snapshot_dir(&dir))
            .await
            .map_err(|e| EngineError::Snapshot(format!("snapshot scan failed: {e}")))??;
        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    pub async fn read_persisted_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<StateSnapshot, EngineError> {
        let path = self.metadata_path(snapshot_id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    /// Restores a snapshot straight from its persisted metadata, for tasks
    /// that are no longer in memory (e.g. after a daemon restart).
    pub async fn restore_persisted_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<StateSnapshot, EngineError> {
        let snapshot = self.read_persisted_snapshot(snapshot_id).await?;
        let owned = snapshot.clone();
        tokio::task::spawn_blocking(move || restore_snapshots(&owned.task_id, &[owned.clone()]))
            .await
            .map_err(|e| EngineError::Snapshot(format!("restore worker failed: {e}")))??;
        tracing::info!("restored persisted snapshot {}", snapshot_id);
        Ok(snapshot)
    }

    /// Deletes backup directories and metadata files older than `max_age_days`.
    /// Returns how many snapshot directories were removed.
    pub async fn cleanup_old_backups(&self, max_age_days: u64) -> Result<usize, EngineError> {
        let dir = self.backup_dir.clone();
        let max_age = Duration::from_secs(max_age_days.saturating_mul(24 * 60 * 60));
        let removed = tokio::task::spawn_blocking(move || prune_backups(&dir, max_age))
            .await
            .map_err(|e| EngineError::Snapshot(format!("cleanup worker failed: {e}")))??;
        if removed > 0 {
            tracing::info!("removed {} expired snapshot backups", removed);
        }
        Ok(removed)
    }
}

fn backup_paths(
    root: &Path,
    paths: &[PathBuf],
) -> (BTreeMap<PathBuf, BackupEntry>, Vec<FailedBackup>) {
    let mut backups = BTreeMap::new();
    let mut failed = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        let Ok(meta) = fs::metadata(path) else {
            continue;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        // index prefix keeps same-named paths from colliding
        let backup_path = root.join(format!("{idx}_{name}"));
        match backup_one(path, &backup_path, &meta) {
            Ok(entry) => {
                backups.insert(path.clone(), entry);
            }
            Err(err) => {
                tracing::error!("failed to back up {}: {}", path.display(), err);
                failed.push(FailedBackup {
                    path: path.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    (backups, failed)
}

fn backup_one(path: &Path, backup_path: &Path, meta: &fs::Metadata) -> io::Result<BackupEntry> {
    let mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
    if meta.is_dir() {
        let size = copy_tree(path, backup_path)?;
        return Ok(BackupEntry {
            kind: BackupKind::Directory,
            backup_path: backup_path.to_path_buf(),
            size,
            mod_time,
        });
    }
    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(path, backup_path)?;
    Ok(BackupEntry {
        kind: BackupKind::File,
        backup_path: backup_path.to_path_buf(),
        size: meta.len(),
        mod_time,
    })
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            total += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

fn restore_entry(original: &Path, entry: &BackupEntry) -> io::Result<()> {
    match fs::symlink_metadata(original) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(original)?,
        Ok(_) => fs::remove_file(original)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    match entry.kind {
        BackupKind::File => {
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry.backup_path, original)?;
        }
        BackupKind::Directory => {
            copy_tree(&entry.backup_path, original)?;
        }
    }
    Ok(())
}

/// Restores `snapshots` newest first. Every backup is checked before any
/// path is touched.
fn restore_snapshots(task_id: &str, snapshots: &[StateSnapshot]) -> Result<(), RollbackError> {
    for snapshot in snapshots {
        for (original, entry) in &snapshot.backups {
            if !entry.backup_path.exists() {
                return Err(RollbackError {
                    task_id: task_id.to_string(),
                    snapshot_id: snapshot.id.clone(),
                    path: original.clone(),
                    reason: format!("backup {} is missing", entry.backup_path.display()),
                });
            }
        }
    }
    for snapshot in snapshots.iter().rev() {
        for (original, entry) in &snapshot.backups {
            restore_entry(original, entry).map_err(|err| RollbackError {
                task_id: task_id.to_string(),
                snapshot_id: snapshot.id.clone(),
                path: original.clone(),
                reason: err.to_string(),
            })?;
            tracing::info!("restored {}", original.display());
        }
    }
    Ok(())
}

fn read_snapshot_dir(dir: &Path) -> Result<Vec<StateSnapshot>, EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<StateSnapshot>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(snapshot) => out.push(snapshot),
            Err(err) => tracing::warn!("skipping unreadable snapshot {}: {}", path.display(), err),
        }
    }
    Ok(out)
}

fn prune_backups(dir: &Path, max_age: Duration) -> Result<usize, EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(io_error(dir, err)),
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }
        if meta.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| io_error(&path, e))?;
            removed += 1;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::PlanStep;
    use serde_json::json;

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new(vec![PlanStep::new(
            "filesystem.delete",
            json!({"path": "/tmp/x"}),
        )])
    }

    fn manager(root: &Path, history: usize) -> TaskManager {
        TaskManager::new(root.join("backups"), history)
    }

    #[tokio::test]
    async fn rollback_restores_file_and_directory_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes.txt");
        let tree = dir.path().join("project");
        fs::write(&file, "original").expect("write");
        fs::create_dir_all(tree.join("src")).expect("mkdir");
        fs::write(tree.join("src/main.rs"), "fn main() {}").expect("write");

        let tasks = manager(dir.path(), 10);
        tasks.create_task("t1", "tidy up", plan()).await.expect("task");
        let snapshot = tasks
            .create_snapshot("t1", "filesystem.delete", &[file.clone(), tree.clone()], json!({}))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.id, "t1_0");
        assert!(snapshot.complete);
        assert_eq!(snapshot.backups.len(), 2);

        fs::write(&file, "clobbered").expect("write");
        fs::remove_dir_all(&tree).expect("rm");
        fs::create_dir_all(tree.join("junk")).expect("mkdir");

        tasks
            .update_status("t1", TaskStatus::Completed, None)
            .await
            .expect("complete");
        tasks.rollback("t1", None).await.expect("rollback");

        assert_eq!(fs::read_to_string(&file).expect("read"), "original");
        assert_eq!(
            fs::read_to_string(tree.join("src/main.rs")).expect("read"),
            "fn main() {}"
        );
        assert!(!tree.join("junk").exists());
        let task = tasks.task("t1").await.expect("task");
        assert_eq!(task.status, TaskStatus::RolledBack);
    }

    #[tokio::test]
    async fn missing_paths_are_skipped_and_metadata_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = manager(dir.path(), 10);
        tasks.create_task("t2", "write", plan()).await.expect("task");
        let snapshot = tasks
            .create_snapshot(
                "t2",
                "filesystem.write",
                &[dir.path().join("not-yet.txt")],
                json!({"step": 0}),
            )
            .await
            .expect("snapshot");
        assert!(snapshot.backups.is_empty());
        assert!(snapshot.complete);

        let on_disk = tasks.read_persisted_snapshot("t2_0").await.expect("metadata");
        assert_eq!(on_disk, snapshot);
        assert!(tasks.backup_dir().join("t2_0.json").exists());
        let listed = tasks.list_persisted_snapshots().await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn rollback_to_earlier_snapshot_unwinds_later_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.txt");
        fs::write(&file, "v1").expect("write");

        let tasks = manager(dir.path(), 10);
        tasks.create_task("t3", "edit twice", plan()).await.expect("task");
        tasks
            .create_snapshot("t3", "filesystem.write", &[file.clone()], json!({}))
            .await
            .expect("first");
        fs::write(&file, "v2").expect("write");
        tasks
            .create_snapshot("t3", "filesystem.write", &[file.clone()], json!({}))
            .await
            .expect("second");
        fs::write(&file, "v3").expect("write");
        tasks
            .update_status("t3", TaskStatus::Completed, None)
            .await
            .expect("complete");

        let target = tasks.rollback("t3", Some("t3_0")).await.expect("rollback");
        assert_eq!(target.id, "t3_0");
        assert_eq!(fs::read_to_string(&file).expect("read"), "v1");
        let task = tasks.task("t3").await.expect("task");
        assert_eq!(task.snapshot_ids(), vec!["t3_0".to_string()]);
    }

    #[tokio::test]
    async fn missing_backup_aborts_rollback_without_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.txt");
        fs::write(&file, "v1").expect("write");

        let tasks = manager(dir.path(), 10);
        tasks.create_task("t4", "edit", plan()).await.expect("task");
        let snapshot = tasks
            .create_snapshot("t4", "filesystem.write", &[file.clone()], json!({}))
            .await
            .expect("snapshot");
        fs::write(&file, "v2").expect("write");
        fs::remove_dir_all(tasks.backup_dir().join(&snapshot.id)).expect("rm backup");
        tasks
            .update_status("t4", TaskStatus::Completed, None)
            .await
            .expect("complete");

        let err = tasks.rollback("t4", None).await.expect_err("must fail");
        assert_eq!(err.kind(), "rollback_failed");
        assert_eq!(fs::read_to_string(&file).expect("read"), "v2");
        let task = tasks.task("t4").await.expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn terminal_tasks_move_to_bounded_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = manager(dir.path(), 2);
        for id in ["a", "b", "c"] {
            tasks.create_task(id, "m", plan()).await.expect("task");
            tasks
                .update_status(id, TaskStatus::Running, None)
                .await
                .expect("running");
            tasks
                .update_status(id, TaskStatus::Completed, None)
                .await
                .expect("done");
        }
        assert_eq!(tasks.active_count().await, 0);
        assert!(tasks.task("a").await.is_none());
        let history = tasks.task_history(10).await;
        let ids = history.iter().map(|t| t.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b"]);

        let err = tasks
            .update_status("c", TaskStatus::Cancelled, None)
            .await
            .expect_err("already finished");
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn interrupt_fires_the_cancellation_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = manager(dir.path(), 10);
        tasks.create_task("t5", "m", plan()).await.expect("task");
        let token = tasks.cancellation_token("t5").await.expect("token");
        assert!(!tasks.is_interrupted("t5").await);
        assert!(tasks.request_interrupt("t5").await);
        assert!(token.is_cancelled());
        assert!(tasks.is_interrupted("t5").await);
        assert!(!tasks.request_interrupt("unknown").await);
    }

    #[tokio::test]
    async fn persisted_snapshot_restores_without_in_memory_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("report.txt");
        fs::write(&file, "draft").expect("write");
        {
            let tasks = manager(dir.path(), 10);
            tasks.create_task("t6", "m", plan()).await.expect("task");
            tasks
                .create_snapshot("t6", "filesystem.delete", &[file.clone()], json!({}))
                .await
                .expect("snapshot");
        }
        fs::remove_file(&file).expect("rm");

        let restarted = manager(dir.path(), 10);
        restarted
            .restore_persisted_snapshot("t6_0")
            .await
            .expect("restore");
        assert_eq!(fs::read_to_string(&file).expect("read"), "draft");
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backups = dir.path().join("backups");
        let old = backups.join("old_0");
        let fresh = backups.join("fresh_0");
        fs::create_dir_all(&old).expect("mkdir");
        fs::create_dir_all(&fresh).expect("mkdir");
        let ten_days_ago = SystemTime::now() - Duration::from_secs(10 * 24 * 60 * 60);
        fs::File::open(&old)
            .expect("open dir")
            .set_modified(ten_days_ago)
            .expect("set mtime");

        let tasks = TaskManager::new(&backups, 10);
        let removed = tasks.cleanup_old_backups(7).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
