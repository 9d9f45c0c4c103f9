use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use ember_types::{ParamType, RiskLevel, ToolCategory, ToolManifest, ToolParameter};

use crate::Capability;

pub fn builtin_capabilities() -> Vec<Arc<dyn Capability>> {
    vec![
        Arc::new(ReadFile),
        Arc::new(WriteFile),
        Arc::new(DeletePath),
        Arc::new(MovePath),
        Arc::new(ListDirectory),
    ]
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn path_arg(args: &Value, key: &str) -> anyhow::Result<PathBuf> {
    let raw = args[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .with_context(|| format!("`{key}` must be a non-empty path"))?;
    Ok(expand_home(raw.trim()))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

struct ReadFile;
#[async_trait]
impl Capability for ReadFile {
    fn manifest(&self) -> ToolManifest {
        ToolManifest::new(
            "filesystem.read",
            "Read a text file",
            ToolCategory::Filesystem,
        )
        .icon("file-text")
        .param(ToolParameter::required("path", ParamType::String, "File to read"))
        .param(ToolParameter::optional(
            "max_bytes",
            ParamType::Integer,
            "Truncate content after this many bytes",
            json!(1_048_576),
        ))
        .permission("filesystem:read")
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let path = path_arg(&args, "path")?;
        let max_bytes = args["max_bytes"].as_u64().unwrap_or(1_048_576) as usize;
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", display(&path)))?;
        let size = bytes.len();
        let truncated = size > max_bytes;
        let content = String::from_utf8_lossy(&bytes[..size.min(max_bytes)]).to_string();
        Ok(json!({
            "success": true,
            "path": display(&path),
            "content": content,
            "size": size,
            "truncated": truncated,
        }))
    }
}

struct WriteFile;
#[async_trait]
impl Capability for WriteFile {
    fn manifest(&self) -> ToolManifest {
        ToolManifest::new(
            "filesystem.write",
            "Write text to a file, replacing or appending",
            ToolCategory::Filesystem,
        )
        .icon("file-pen")
        .param(ToolParameter::required("path", ParamType::String, "File to write"))
        .param(ToolParameter::required("content", ParamType::String, "Text to write"))
        .param(ToolParameter::optional(
            "append",
            ParamType::Boolean,
            "Append instead of replacing",
            json!(false),
        ))
        .permission("filesystem:write")
        .risk(RiskLevel::Medium)
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let path = path_arg(&args, "path")?;
        let content = args["content"].as_str().unwrap_or_default();
        let append = args["append"].as_bool().unwrap_or(false);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", display(parent)))?;
        }
        if append {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("opening {}", display(&path)))?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        } else {
            fs::write(&path, content)
                .await
                .with_context(|| format!("writing {}", display(&path)))?;
        }
        Ok(json!({
            "success": true,
            "path": display(&path),
            "bytes_written": content.len(),
            "appended": append,
        }))
    }
}

struct DeletePath;
#[async_trait]
impl Capability for DeletePath {
    fn manifest(&self) -> ToolManifest {
        ToolManifest::new(
            "filesystem.delete",
            "Delete a file or directory",
            ToolCategory::Filesystem,
        )
        .icon("trash")
        .param(ToolParameter::required("path", ParamType::String, "Path to delete"))
        .param(ToolParameter::optional(
            "recursive",
            ParamType::Boolean,
            "Required to delete a non-empty directory",
            json!(false),
        ))
        .permission("filesystem:write")
        .risk(RiskLevel::High)
        .confirm("Delete {path}?")
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let path = path_arg(&args, "path")?;
        let recursive = args["recursive"].as_bool().unwrap_or(false);
        let meta = fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("{} does not exist", display(&path)))?;
        let kind = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_dir(&path).await.with_context(|| {
                    format!("{} is a directory; pass recursive=true", display(&path))
                })?;
            }
            "directory"
        } else {
            fs::remove_file(&path).await?;
            "file"
        };
        Ok(json!({"success": true, "path": display(&path), "type": kind}))
    }
}

struct MovePath;
#[async_trait]
impl Capability for MovePath {
    fn manifest(&self) -> ToolManifest {
        ToolManifest::new(
            "filesystem.move",
            "Move or rename a file or directory",
            ToolCategory::Filesystem,
        )
        .icon("move")
        .param(ToolParameter::required("source", ParamType::String, "Path to move"))
        .param(ToolParameter::required(
            "destination",
            ParamType::String,
            "New path, or an existing directory to move into",
        ))
        .permission("filesystem:write")
        .risk(RiskLevel::Medium)
        .confirm("Move {source} to {destination}?")
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let source = path_arg(&args, "source")?;
        let mut destination = path_arg(&args, "destination")?;
        if fs::metadata(&source).await.is_err() {
            anyhow::bail!("{} does not exist", display(&source));
        }
        if fs::metadata(&destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            if let Some(name) = source.file_name() {
                destination = destination.join(name);
            }
        }
        if fs::metadata(&destination).await.is_ok() {
            anyhow::bail!("{} already exists", display(&destination));
        }
        fs::rename(&source, &destination).await.with_context(|| {
            format!("moving {} to {}", display(&source), display(&destination))
        })?;
        Ok(json!({
            "success": true,
            "source": display(&source),
            "destination": display(&destination),
        }))
    }
}

struct ListDirectory;
#[async_trait]
impl Capability for ListDirectory {
    fn manifest(&self) -> ToolManifest {
        ToolManifest::new(
            "filesystem.list",
            "List directory entries",
            ToolCategory::Filesystem,
        )
        .icon("folder")
        .param(ToolParameter::required("path", ParamType::String, "Directory to list"))
        .param(ToolParameter::optional(
            "pattern",
            ParamType::String,
            "Glob applied to entry names",
            json!("*"),
        ))
        .param(ToolParameter::optional(
            "include_hidden",
            ParamType::Boolean,
            "Include dotfiles",
            json!(false),
        ))
        .permission("filesystem:read")
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let path = path_arg(&args, "path")?;
        let pattern = glob::Pattern::new(args["pattern"].as_str().unwrap_or("*"))
            .context("invalid pattern")?;
        let include_hidden = args["include_hidden"].as_bool().unwrap_or(false);

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&path)
            .await
            .with_context(|| format!("listing {}", display(&path)))?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !include_hidden && name.starts_with('.') {
                continue;
            }
            if !pattern.matches(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            entries.push(json!({
                "name": name,
                "path": display(&entry.path()),
                "type": if meta.is_dir() { "directory" } else { "file" },
                "size": meta.len(),
            }));
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["name"].as_str().unwrap_or_default())
        });
        Ok(json!({
            "success": true,
            "path": display(&path),
            "count": entries.len(),
            "entries": entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CapabilityRegistry;

    #[tokio::test]
    async fn write_then_read_round_trips_through_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes/a.txt");
        let registry = CapabilityRegistry::with_builtins().await.expect("builtins");
        registry
            .execute(
                "filesystem.write",
                json!({"path": file.to_str().expect("utf8"), "content": "hello"}),
            )
            .await
            .expect("write");
        registry
            .execute(
                "filesystem.write",
                json!({"path": file.to_str().expect("utf8"), "content": " world", "append": true}),
            )
            .await
            .expect("append");
        let out = registry
            .execute("filesystem.read", json!({"path": file.to_str().expect("utf8")}))
            .await
            .expect("read");
        assert_eq!(out["content"], json!("hello world"));
        assert_eq!(out["truncated"], json!(false));
    }

    #[tokio::test]
    async fn deleting_a_directory_requires_recursive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("d");
        std::fs::create_dir_all(target.join("inner")).expect("mkdir");
        let tool = DeletePath;
        let err = tool
            .execute(json!({"path": target.to_str().expect("utf8"), "recursive": false}))
            .await
            .expect_err("non-recursive");
        assert!(err.to_string().contains("recursive=true"));
        tool.execute(json!({"path": target.to_str().expect("utf8"), "recursive": true}))
            .await
            .expect("recursive delete");
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn move_into_existing_directory_keeps_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a.txt");
        let dest_dir = dir.path().join("archive");
        std::fs::write(&src, "x").expect("write");
        std::fs::create_dir(&dest_dir).expect("mkdir");
        let out = MovePath
            .execute(json!({
                "source": src.to_str().expect("utf8"),
                "destination": dest_dir.to_str().expect("utf8"),
            }))
            .await
            .expect("move");
        assert!(dest_dir.join("a.txt").exists());
        assert!(!src.exists());
        assert!(out["destination"].as_str().expect("dest").ends_with("a.txt"));
    }

    #[tokio::test]
    async fn list_filters_by_pattern_and_hides_dotfiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.txt", "a.txt", "c.md", ".hidden.txt"] {
            std::fs::write(dir.path().join(name), "x").expect("write");
        }
        let out = ListDirectory
            .execute(json!({
                "path": dir.path().to_str().expect("utf8"),
                "pattern": "*.txt",
                "include_hidden": false,
            }))
            .await
            .expect("list");
        let names = out["entries"]
            .as_array()
            .expect("entries")
            .iter()
            .map(|e| e["name"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home");
        assert_eq!(expand_home("~/Documents/x"), home.join("Documents/x"));
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
