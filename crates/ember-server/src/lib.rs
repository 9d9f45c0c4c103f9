use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

use ember_core::{
    ConfigStore, EmberConfig, EmberPaths, EventBus, JsonConversationStore, ModelPlanner,
    OrchestratorSettings, PermissionEvaluator, TaskManager, WorkflowOrchestrator,
    DEFAULT_MAX_HISTORY,
};
use ember_providers::ModelRouter;
use ember_tools::CapabilityRegistry;

mod http;

pub use http::{app_router, serve};

/// Shared handles for every route. Clones are cheap and share state.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub settings: Arc<EmberConfig>,
    pub orchestrator: WorkflowOrchestrator,
    pub router: ModelRouter,
    pub event_bus: EventBus,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn registry(&self) -> &CapabilityRegistry {
        self.orchestrator.registry()
    }

    pub fn tasks(&self) -> &TaskManager {
        self.orchestrator.tasks()
    }
}

/// Wires router, registry, planner, memory and task manager from the
/// effective configuration.
pub async fn build_state(config: ConfigStore, paths: &EmberPaths) -> anyhow::Result<AppState> {
    let settings = config.get().await;
    paths.ensure_dirs()?;

    let router = ModelRouter::from_config(&settings.backends).context("model router")?;
    let registry = CapabilityRegistry::with_builtins()
        .await
        .context("capability registry")?;
    let memory = JsonConversationStore::open(&paths.conversations_path, DEFAULT_MAX_HISTORY)
        .await
        .context("conversation store")?;
    let planner = ModelPlanner::new(router.clone(), registry.clone());
    let tasks = TaskManager::new(&paths.backups_dir, settings.daemon.task_history_limit);
    let event_bus = EventBus::new();

    let orchestrator = WorkflowOrchestrator::new(
        Arc::new(planner),
        Arc::new(memory),
        registry,
        PermissionEvaluator::new(settings.permissions.clone()),
        tasks,
        event_bus.clone(),
        OrchestratorSettings::from_config(&settings.daemon),
    )
    .with_router(router.clone());

    Ok(AppState {
        config,
        settings: Arc::new(settings),
        orchestrator,
        router,
        event_bus,
        started_at_ms: now_ms(),
    })
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
