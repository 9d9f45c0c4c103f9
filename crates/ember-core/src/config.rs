use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use ember_providers::BackendsConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub filesystem_read_allowed: Vec<String>,
    pub filesystem_read_blocked: Vec<String>,
    pub filesystem_write_allowed: Vec<String>,
    pub filesystem_write_blocked: Vec<String>,
    pub max_file_size_mb: u64,
    pub require_confirmation_destructive: bool,
    pub destructive_tools: Vec<String>,
    pub network_enabled: bool,
    pub allowed_hosts: Vec<String>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            filesystem_read_allowed: vec!["~/*".to_string(), "/tmp/*".to_string()],
            filesystem_read_blocked: vec!["~/.ssh/*".to_string(), "~/.gnupg/*".to_string()],
            filesystem_write_allowed: vec![
                "~/Documents/*".to_string(),
                "~/Downloads/*".to_string(),
                "/tmp/*".to_string(),
            ],
            filesystem_write_blocked: vec!["~/.ssh/*".to_string(), "~/.gnupg/*".to_string()],
            max_file_size_mb: 100,
            require_confirmation_destructive: true,
            destructive_tools: vec![
                "filesystem.delete".to_string(),
                "filesystem.move".to_string(),
                "system.shutdown".to_string(),
                "system.restart".to_string(),
            ],
            network_enabled: false,
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_tasks: usize,
    pub task_history_limit: usize,
    pub recent_turns: usize,
    pub backup_retention_days: u64,
    pub log_retention_days: u64,
    pub snapshot_patterns: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_DAEMON_HOST.to_string(),
            port: crate::DEFAULT_DAEMON_PORT,
            max_concurrent_tasks: 5,
            task_history_limit: 100,
            recent_turns: 5,
            backup_retention_days: 7,
            log_retention_days: 14,
            snapshot_patterns: vec![
                "delete".to_string(),
                "move".to_string(),
                "write".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmberConfig {
    pub backends: BackendsConfig,
    pub permissions: PermissionsConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, optional project file,
/// environment and CLI overrides, merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: Option<PathBuf>,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: Option<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        let global = read_json_file(&global_path).await?;
        let project = match &project_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> EmberConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, using defaults: {}", err);
                EmberConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    /// Merges `patch` into the project layer and writes it back to disk.
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        let Some(path) = self.project_path.clone() else {
            anyhow::bail!("no project config file configured");
        };
        let project = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
            layers.project.clone()
        };
        write_json_file(&path, &project).await?;
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring malformed config {}: {}", path.display(), err);
        empty_object()
    }))
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("EMBER_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("ember").join("config.json");
    }
    PathBuf::from(".ember/config.json")
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(url) = std::env::var("EMBER_TEXT_URL") {
        if !url.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backends": { "text_url": url.trim() } }));
        }
    }
    if let Ok(url) = std::env::var("EMBER_VISION_URL") {
        if !url.trim().is_empty() {
            deep_merge(&mut root, &json!({ "backends": { "vision_url": url.trim() } }));
        }
    }
    if let Some(secs) = std::env::var("EMBER_TIMEOUT")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(
            &mut root,
            &json!({ "backends": { "request_timeout_secs": secs } }),
        );
    }
    if let Some(temperature) = std::env::var("EMBER_TEMPERATURE")
        .ok()
        .and_then(|v| v.trim().parse::<f32>().ok())
    {
        deep_merge(
            &mut root,
            &json!({ "backends": { "temperature": temperature } }),
        );
    }
    if let Some(max) = std::env::var("EMBER_MAX_CONCURRENT_TASKS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(
            &mut root,
            &json!({ "daemon": { "max_concurrent_tasks": max } }),
        );
    }
    if let Some(enabled) = std::env::var("EMBER_NETWORK_ENABLED")
        .ok()
        .and_then(|v| parse_bool_like(&v))
    {
        deep_merge(
            &mut root,
            &json!({ "permissions": { "network_enabled": enabled } }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
