use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use serde::Serialize;
use serde_json::Value;

use ember_tools::expand_home;
use ember_types::ToolManifest;

use crate::config::PermissionsConfig;

/// Argument keys that name the filesystem target of a call, in lookup order.
const TARGET_PATH_KEYS: [&str; 3] = ["path", "source", "file"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allow)
    }
}

/// Expands `~`, makes the path absolute against the working directory and
/// folds `.`/`..` components without touching the filesystem.
pub fn resolve_path(raw: &str) -> PathBuf {
    let expanded = expand_home(raw.trim());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };
    normalize_lexically(&absolute)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_matches_any(path: &Path, patterns: &[String]) -> bool {
    let text = path.to_string_lossy();
    patterns.iter().any(|raw| {
        let expanded = expand_home(raw).to_string_lossy().to_string();
        if Pattern::new(&expanded).is_ok_and(|p| p.matches(&text)) {
            return true;
        }
        // `dir/*` also covers `dir` itself and anything below it
        expanded
            .strip_suffix("/*")
            .is_some_and(|dir| !dir.is_empty() && path.starts_with(dir))
    })
}

fn host_of(raw: &str) -> &str {
    let without_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    authority.split(':').next().unwrap_or(authority)
}

#[derive(Clone)]
pub struct PermissionEvaluator {
    config: Arc<PermissionsConfig>,
}

impl PermissionEvaluator {
    pub fn new(config: PermissionsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PermissionsConfig {
        &self.config
    }

    /// Evaluates every permission tag the manifest declares. The first tag
    /// that fails denies the call.
    pub fn check(&self, manifest: &ToolManifest, args: &Value) -> PermissionDecision {
        for tag in &manifest.permissions {
            if let Err(reason) = self.check_tag(tag, args) {
                tracing::warn!("permission denied for {} ({}): {}", manifest.name, tag, reason);
                return PermissionDecision::Deny { reason };
            }
        }
        PermissionDecision::Allow
    }

    fn check_tag(&self, tag: &str, args: &Value) -> Result<(), String> {
        let Some((category, action)) = tag.split_once(':') else {
            return Ok(());
        };
        match category {
            "filesystem" => self.check_filesystem(action, args),
            "network" => self.check_network(args),
            // system actions are gated by the confirmation policy instead
            _ => Ok(()),
        }
    }

    fn check_filesystem(&self, action: &str, args: &Value) -> Result<(), String> {
        let Some(raw) = TARGET_PATH_KEYS
            .iter()
            .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
            .filter(|s| !s.trim().is_empty())
        else {
            return Ok(());
        };
        let path = resolve_path(raw);
        let perms = &self.config;
        match action {
            "read" => {
                if path_matches_any(&path, &perms.filesystem_read_blocked) {
                    return Err(format!("reading {} is blocked", path.display()));
                }
                if !path_matches_any(&path, &perms.filesystem_read_allowed) {
                    return Err(format!("{} is outside the readable paths", path.display()));
                }
            }
            "write" | "delete" => {
                let mut targets = vec![path];
                if let Some(dest) = args.get("destination").and_then(|v| v.as_str()) {
                    targets.push(resolve_path(dest));
                }
                for target in targets {
                    if path_matches_any(&target, &perms.filesystem_write_blocked) {
                        return Err(format!("writing {} is blocked", target.display()));
                    }
                    if !path_matches_any(&target, &perms.filesystem_write_allowed) {
                        return Err(format!(
                            "{} is outside the writable paths",
                            target.display()
                        ));
                    }
                }
                if let Some(content) = args.get("content").and_then(|v| v.as_str()) {
                    let limit = perms.max_file_size_mb.saturating_mul(1024 * 1024);
                    if content.len() as u64 > limit {
                        return Err(format!(
                            "content is {} bytes, limit is {} MB",
                            content.len(),
                            perms.max_file_size_mb
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_network(&self, args: &Value) -> Result<(), String> {
        if !self.config.network_enabled {
            return Err("network access is disabled".to_string());
        }
        let target = args
            .get("host")
            .or_else(|| args.get("url"))
            .and_then(|v| v.as_str());
        let (Some(target), false) = (target, self.config.allowed_hosts.is_empty()) else {
            return Ok(());
        };
        let host = host_of(target);
        let allowed = self
            .config
            .allowed_hosts
            .iter()
            .any(|p| Pattern::new(p).is_ok_and(|p| p.matches(host)));
        if allowed {
            Ok(())
        } else {
            Err(format!("host {host} is not in the allowed host list"))
        }
    }

    pub fn is_destructive(&self, tool_name: &str) -> bool {
        self.config.destructive_tools.iter().any(|t| t == tool_name)
    }

    /// True when the manifest asks for it, or when the tool is on the
    /// configured destructive list, whatever the manifest says.
    pub fn requires_confirmation(&self, manifest: &ToolManifest, _args: &Value) -> bool {
        if manifest.requires_confirmation {
            return true;
        }
        self.config.require_confirmation_destructive && self.is_destructive(&manifest.name)
    }

    pub fn confirmation_message(&self, manifest: &ToolManifest, args: &Value) -> String {
        let Some(template) = &manifest.confirmation_message else {
            return format!("Execute {}?", manifest.name);
        };
        let mut message = template.clone();
        if let Some(map) = args.as_object() {
            for (key, value) in map {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                message = message.replace(&format!("{{{key}}}"), &rendered);
            }
        }
        message
    }
}
