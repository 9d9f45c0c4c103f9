use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk layout of the daemon state root.
#[derive(Debug, Clone)]
pub struct EmberPaths {
    pub root: PathBuf,
    pub backups_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub conversations_path: PathBuf,
}

impl EmberPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            backups_dir: root.join("backups"),
            logs_dir: root.join("logs"),
            conversations_path: root.join("conversations.json"),
        }
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.root, &self.backups_dir, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(())
    }
}

/// `EMBER_STATE_DIR` wins, otherwise `<data_dir>/ember`.
pub fn resolve_ember_paths() -> anyhow::Result<EmberPaths> {
    if let Ok(dir) = std::env::var("EMBER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return Ok(EmberPaths::under(Path::new(dir.trim())));
        }
    }
    let base = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to resolve data dir"))?;
    Ok(EmberPaths::under(&base.join("ember")))
}
