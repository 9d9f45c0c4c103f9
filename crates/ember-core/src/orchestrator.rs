use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tracing::Level;
use uuid::Uuid;

use ember_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use ember_providers::ModelRouter;
use ember_tools::CapabilityRegistry;
use ember_types::{ExecutionPlan, StateSnapshot, TaskExecution, TaskStatus, ToolResult};

use crate::collaborators::{
    describe_attached_files, ContextSource, ConversationMemory, ConversationRecord, Planner,
    ProcessContext, RequestContext,
};
use crate::config::DaemonConfig;
use crate::error::EngineError;
use crate::event_bus::{kinds, EventBus};
use crate::permissions::{resolve_path, PermissionDecision, PermissionEvaluator};
use crate::references::resolve_args;
use crate::tasks::TaskManager;

/// Argument keys whose values name paths a destructive step may change.
const AFFECTED_PATH_KEYS: [&str; 5] = ["path", "source", "destination", "file", "directory"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Created,
    ContextGathered,
    Planned,
    AwaitingConfirmation,
    Executing,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStage {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::Created => "created",
            WorkflowStage::ContextGathered => "context_gathered",
            WorkflowStage::Planned => "planned",
            WorkflowStage::AwaitingConfirmation => "awaiting_confirmation",
            WorkflowStage::Executing => "executing",
            WorkflowStage::Synthesizing => "synthesizing",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Failed => "failed",
            WorkflowStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStage::Completed | WorkflowStage::Failed | WorkflowStage::Cancelled
        )
    }

    pub fn can_transition_to(self, next: WorkflowStage) -> bool {
        use WorkflowStage::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed => true,
            Cancelled => self != Synthesizing,
            ContextGathered => self == Created,
            Planned => self == ContextGathered,
            AwaitingConfirmation => self == Planned,
            Executing => matches!(self, Planned | AwaitingConfirmation),
            Synthesizing => matches!(self, Planned | Executing),
            Completed => self == Synthesizing,
            Created => false,
        }
    }
}

/// What a client gets back for one request, at whatever stage it stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    pub task_id: String,
    pub status: WorkflowStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub plan: ExecutionPlan,
    #[serde(default)]
    pub results: Vec<ToolResult>,
    #[serde(default)]
    pub snapshot_ids: Vec<String>,
    #[serde(default)]
    pub completed_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl RequestOutcome {
    fn new(task_id: &str, status: WorkflowStage, plan: ExecutionPlan) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            response: None,
            plan,
            results: Vec::new(),
            snapshot_ids: Vec::new(),
            completed_steps: 0,
            error: None,
            error_type: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandAccepted {
    pub task_id: String,
    pub status: WorkflowStage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub llm_connected: bool,
    pub model_name: String,
    pub active_tasks: usize,
    pub pending_confirmations: usize,
    pub tools_loaded: usize,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: String,
    pub stage: WorkflowStage,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RequestOutcome>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_tasks: usize,
    pub recent_turns: usize,
    pub snapshot_patterns: Vec<String>,
    pub workflow_history_limit: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            recent_turns: config.recent_turns,
            snapshot_patterns: config.snapshot_patterns.clone(),
            workflow_history_limit: config.task_history_limit,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

#[derive(Debug, Clone)]
struct WorkflowRecord {
    stage: WorkflowStage,
    message: String,
    context: RequestContext,
    cancel_requested: bool,
    started: Instant,
    updated_at: DateTime<Utc>,
    outcome: Option<RequestOutcome>,
}

impl WorkflowRecord {
    fn advance(&mut self, task_id: &str, next: WorkflowStage) -> Result<(), EngineError> {
        if !self.stage.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "task `{task_id}` cannot move from {} to {}",
                self.stage.as_str(),
                next.as_str()
            )));
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
struct WorkflowTable {
    records: HashMap<String, WorkflowRecord>,
    finished: VecDeque<String>,
}

struct StepRun {
    results: Vec<ToolResult>,
    cancelled_at: Option<usize>,
}

/// Drives one request at a time from context gathering to a persisted
/// transcript. Clones share all state.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    planner: Arc<dyn Planner>,
    memory: Arc<dyn ConversationMemory>,
    context_source: Arc<dyn ContextSource>,
    router: Option<ModelRouter>,
    registry: CapabilityRegistry,
    permissions: PermissionEvaluator,
    tasks: TaskManager,
    event_bus: EventBus,
    settings: Arc<OrchestratorSettings>,
    execution_slots: Arc<Semaphore>,
    workflows: Arc<RwLock<WorkflowTable>>,
    started_at: DateTime<Utc>,
}

impl WorkflowOrchestrator {
    pub fn new(
        planner: Arc<dyn Planner>,
        memory: Arc<dyn ConversationMemory>,
        registry: CapabilityRegistry,
        permissions: PermissionEvaluator,
        tasks: TaskManager,
        event_bus: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        let slots = settings.max_concurrent_tasks.max(1);
        Self {
            planner,
            memory,
            context_source: Arc::new(ProcessContext),
            router: None,
            registry,
            permissions,
            tasks,
            event_bus,
            settings: Arc::new(settings),
            execution_slots: Arc::new(Semaphore::new(slots)),
            workflows: Arc::new(RwLock::new(WorkflowTable::default())),
            started_at: Utc::now(),
        }
    }

    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = source;
        self
    }

    /// The router is only consulted for status reporting.
    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn permissions(&self) -> &PermissionEvaluator {
        &self.permissions
    }

    /// Accepts a request and runs it in the background. Progress and the
    /// final outcome arrive on the event bus.
    pub async fn process_command(
        &self,
        message: &str,
        attached_files: Vec<PathBuf>,
    ) -> CommandAccepted {
        let task_id = Uuid::new_v4().to_string();
        self.register_workflow(&task_id, message).await;
        let this = self.clone();
        let id = task_id.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.run_request(&id, &message, &attached_files).await {
                tracing::debug!("background request {} ended with error: {}", id, err);
            }
        });
        CommandAccepted {
            task_id,
            status: WorkflowStage::Created,
        }
    }

    /// Runs a request in the caller's task. Returns once the request is
    /// finished or parked awaiting confirmation.
    pub async fn process_request(
        &self,
        message: &str,
        attached_files: &[PathBuf],
    ) -> Result<RequestOutcome, EngineError> {
        let task_id = Uuid::new_v4().to_string();
        self.register_workflow(&task_id, message).await;
        self.run_request(&task_id, message, attached_files).await
    }

    async fn register_workflow(&self, task_id: &str, message: &str) {
        let mut table = self.workflows.write().await;
        table.records.insert(
            task_id.to_string(),
            WorkflowRecord {
                stage: WorkflowStage::Created,
                message: message.to_string(),
                context: RequestContext::default(),
                cancel_requested: false,
                started: Instant::now(),
                updated_at: Utc::now(),
                outcome: None,
            },
        );
    }

    async fn run_request(
        &self,
        task_id: &str,
        message: &str,
        attached_files: &[PathBuf],
    ) -> Result<RequestOutcome, EngineError> {
        tracing::info!("processing request {}: {}", task_id, redact_text(message));
        emit_event(
            Level::INFO,
            ProcessKind::Daemon,
            ObservabilityEvent {
                event: "request.start",
                component: "orchestrator",
                task_id: Some(task_id),
                detail: Some(&redact_text(message)),
                ..Default::default()
            },
        );

        self.emit_progress(task_id, WorkflowStage::Created, "Gathering context...");
        let context = self.gather_context(attached_files).await;
        {
            let mut table = self.workflows.write().await;
            if let Some(record) = table.records.get_mut(task_id) {
                record.context = context.clone();
            }
        }
        if let Some(outcome) = self.advance_or_cancel(task_id, WorkflowStage::ContextGathered, None).await? {
            return Ok(outcome);
        }

        self.emit_progress(task_id, WorkflowStage::ContextGathered, "Planning actions...");
        let plan = match self.planner.create_plan(message, &context).await {
            Ok(plan) => plan,
            Err(err) => return Err(self.fail(task_id, None, planner_error(err), Vec::new()).await),
        };
        if let Some(outcome) = self.advance_or_cancel(task_id, WorkflowStage::Planned, Some(&plan)).await? {
            return Ok(outcome);
        }
        self.dispatch_plan(task_id, message, &context, plan).await
    }

    /// Takes a `Planned` request to its answer, to a parked confirmation, or
    /// through execution. A cancel that lands while planned still wins.
    async fn dispatch_plan(
        &self,
        task_id: &str,
        message: &str,
        context: &RequestContext,
        mut plan: ExecutionPlan,
    ) -> Result<RequestOutcome, EngineError> {
        if plan.is_empty() {
            if !self
                .transition_unless_cancelled(task_id, WorkflowStage::Synthesizing)
                .await?
            {
                return Ok(self.finish_cancelled(task_id, plan, Vec::new()).await);
            }
            return self
                .synthesize_and_finish(task_id, message, context, plan, Vec::new(), false)
                .await;
        }

        self.apply_confirmation_policy(&mut plan).await;
        if let Err(err) = self.tasks.create_task(task_id, message, plan.clone()).await {
            return Err(self.fail(task_id, None, err, Vec::new()).await);
        }

        if plan.requires_confirmation {
            if !self
                .transition_unless_cancelled(task_id, WorkflowStage::AwaitingConfirmation)
                .await?
            {
                self.tasks
                    .update_status(task_id, TaskStatus::Cancelled, None)
                    .await?;
                return Ok(self.finish_cancelled(task_id, plan, Vec::new()).await);
            }
            let confirm_message = if plan.confirmation_message.is_empty() {
                "Proceed with this action?".to_string()
            } else {
                plan.confirmation_message.clone()
            };
            self.emit_progress(
                task_id,
                WorkflowStage::AwaitingConfirmation,
                "Awaiting user confirmation...",
            );
            self.event_bus.emit(
                kinds::TASK_CONFIRMATION_REQUIRED,
                json!({
                    "taskId": task_id,
                    "message": confirm_message,
                    "plan": plan,
                    "riskLevel": plan.risk_level,
                }),
            );
            let outcome = RequestOutcome::new(task_id, WorkflowStage::AwaitingConfirmation, plan);
            self.store_outcome(task_id, &outcome).await;
            return Ok(outcome);
        }

        self.transition(task_id, WorkflowStage::Executing).await?;
        self.execute_and_finish(task_id, message, context, plan).await
    }

    async fn gather_context(&self, attached_files: &[PathBuf]) -> RequestContext {
        let recent_turns = match self
            .memory
            .recent_conversations(self.settings.recent_turns)
            .await
        {
            Ok(records) => records.iter().map(ConversationRecord::to_turn).collect(),
            Err(err) => {
                tracing::warn!("recent conversations unavailable: {:#}", err);
                Vec::new()
            }
        };
        RequestContext {
            system: self.context_source.system_context(),
            recent_turns,
            attached_files: describe_attached_files(attached_files).await,
        }
    }

    /// Any step that needs confirmation under the central policy makes the
    /// whole plan need it. The first such step's message is used when the
    /// planner did not supply one.
    async fn apply_confirmation_policy(&self, plan: &mut ExecutionPlan) {
        for step in &plan.steps {
            let Some(manifest) = self.registry.manifest(&step.tool).await else {
                continue;
            };
            plan.risk_level = plan.risk_level.max(manifest.risk_level);
            let args = Value::Object(step.args.clone());
            if self.permissions.requires_confirmation(&manifest, &args) {
                plan.requires_confirmation = true;
                if plan.confirmation_message.is_empty() {
                    plan.confirmation_message =
                        self.permissions.confirmation_message(&manifest, &args);
                }
            }
        }
    }

    /// Resolves a pending confirmation and, when approved, runs the plan in
    /// the background.
    pub async fn confirm_action(
        &self,
        task_id: &str,
        confirmed: bool,
    ) -> Result<WorkflowStage, EngineError> {
        let Some((message, context, plan)) = self.claim_confirmation(task_id, confirmed).await?
        else {
            return Ok(WorkflowStage::Cancelled);
        };
        let this = self.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = this.execute_and_finish(&id, &message, &context, plan).await {
                tracing::debug!("confirmed task {} ended with error: {}", id, err);
            }
        });
        Ok(WorkflowStage::Executing)
    }

    /// Like `confirm_action`, but waits for the plan to finish.
    pub async fn confirm_and_execute(
        &self,
        task_id: &str,
        confirmed: bool,
    ) -> Result<RequestOutcome, EngineError> {
        match self.claim_confirmation(task_id, confirmed).await? {
            Some((message, context, plan)) => {
                self.execute_and_finish(task_id, &message, &context, plan)
                    .await
            }
            None => self
                .outcome(task_id)
                .await
                .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string())),
        }
    }

    async fn claim_confirmation(
        &self,
        task_id: &str,
        confirmed: bool,
    ) -> Result<Option<(String, RequestContext, ExecutionPlan)>, EngineError> {
        let (message, context) = {
            let mut table = self.workflows.write().await;
            let Some(record) = table.records.get_mut(task_id) else {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            };
            if record.stage != WorkflowStage::AwaitingConfirmation {
                return Err(EngineError::InvalidState(format!(
                    "task `{task_id}` is {} and not awaiting confirmation",
                    record.stage.as_str()
                )));
            }
            let next = if confirmed {
                WorkflowStage::Executing
            } else {
                WorkflowStage::Cancelled
            };
            record.stage = next;
            record.updated_at = Utc::now();
            (record.message.clone(), record.context.clone())
        };

        if !confirmed {
            tracing::info!("task {} rejected at confirmation", task_id);
            let task = self
                .tasks
                .update_status(task_id, TaskStatus::Cancelled, None)
                .await?;
            self.finish_cancelled(task_id, task.plan, Vec::new()).await;
            return Ok(None);
        }

        let Some(task) = self.tasks.task(task_id).await else {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };
        tracing::info!("task {} confirmed", task_id);
        Ok(Some((message, context, task.plan)))
    }

    async fn execute_and_finish(
        &self,
        task_id: &str,
        message: &str,
        context: &RequestContext,
        plan: ExecutionPlan,
    ) -> Result<RequestOutcome, EngineError> {
        let _permit = match self.execution_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = EngineError::InvalidState("execution slots closed".to_string());
                return Err(self.fail(task_id, Some(&plan), err, Vec::new()).await);
            }
        };
        if let Err(err) = self
            .tasks
            .update_status(task_id, TaskStatus::Running, None)
            .await
        {
            return Err(self.fail(task_id, Some(&plan), err, Vec::new()).await);
        }
        self.emit_progress(task_id, WorkflowStage::Executing, "Executing...");

        let run = match self.execute_steps(task_id, &plan).await {
            Ok(run) => run,
            Err(err) => return Err(self.fail(task_id, Some(&plan), err, Vec::new()).await),
        };

        if let Some(step) = run.cancelled_at {
            tracing::info!("task {} interrupted before step {}", task_id, step);
            self.tasks
                .update_status(task_id, TaskStatus::Cancelled, None)
                .await?;
            self.set_stage(task_id, WorkflowStage::Cancelled).await;
            return Ok(self.finish_cancelled(task_id, plan, run.results).await);
        }

        self.transition(task_id, WorkflowStage::Synthesizing).await?;
        self.synthesize_and_finish(task_id, message, context, plan, run.results, true)
            .await
    }

    async fn execute_steps(
        &self,
        task_id: &str,
        plan: &ExecutionPlan,
    ) -> Result<StepRun, EngineError> {
        let cancel = self
            .tasks
            .cancellation_token(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let total = plan.steps.len();
        let mut results = Vec::with_capacity(total);
        let mut completed: HashMap<usize, Value> = HashMap::new();

        for (idx, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled()
                || self.tasks.is_interrupted(task_id).await
                || self.cancel_requested(task_id).await
            {
                return Ok(StepRun {
                    results,
                    cancelled_at: Some(idx),
                });
            }

            self.event_bus.emit(
                kinds::TASK_STEP,
                json!({
                    "taskId": task_id,
                    "tool": step.tool,
                    "step": idx + 1,
                    "total": total,
                    "progress": idx as f64 / total as f64,
                    "message": format!("Executing {}...", step.tool),
                }),
            );

            let args = Value::Object(resolve_args(&step.args, &completed));
            let started = Instant::now();
            let result = self.run_step(task_id, idx, &step.tool, &step.description, args).await;
            let mut result = result.unwrap_or_else(|(kind, error, payload)| {
                let mut failed =
                    ToolResult::failed(&step.tool, kind, error, started.elapsed().as_millis() as u64);
                failed.result = payload;
                failed
            });
            result.duration_ms = started.elapsed().as_millis() as u64;

            if result.success {
                completed.insert(idx, result.result.clone());
            } else {
                tracing::warn!(
                    "step {} ({}) of task {} failed: {}",
                    idx,
                    step.tool,
                    task_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            emit_event(
                if result.success { Level::INFO } else { Level::WARN },
                ProcessKind::Daemon,
                ObservabilityEvent {
                    event: "step.finish",
                    component: "orchestrator",
                    task_id: Some(task_id),
                    tool: Some(&step.tool),
                    status: Some(if result.success { "ok" } else { "failed" }),
                    error_code: result.error_type.as_deref(),
                    ..Default::default()
                },
            );
            self.tasks.record_result(task_id, idx, result.clone()).await?;
            results.push(result);
        }

        Ok(StepRun {
            results,
            cancelled_at: None,
        })
    }

    /// Permission check, optional pre-step snapshot, then dispatch. Failures
    /// come back as `(kind, message, payload)`.
    async fn run_step(
        &self,
        task_id: &str,
        idx: usize,
        tool: &str,
        description: &str,
        args: Value,
    ) -> Result<ToolResult, (&'static str, String, Value)> {
        let Some(manifest) = self.registry.manifest(tool).await else {
            return Err(("unknown_tool", format!("unknown tool `{tool}`"), Value::Null));
        };
        if let PermissionDecision::Deny { reason } = self.permissions.check(&manifest, &args) {
            return Err(("permission_denied", reason, Value::Null));
        }

        if self.is_snapshot_step(tool) {
            let paths = affected_paths(&args);
            if !paths.is_empty() {
                let metadata = json!({"stepIndex": idx, "stepDescription": description});
                self.tasks
                    .create_snapshot(task_id, tool, &paths, metadata)
                    .await
                    .map_err(|err| (err.kind(), err.to_string(), Value::Null))?;
            }
        }

        match self.registry.execute(tool, args).await {
            Ok(payload) => match ember_tools::reported_failure(&payload) {
                Some(error) => Err(("tool_execution", error, payload)),
                None => Ok(ToolResult::ok(tool, payload, 0)),
            },
            Err(err) => Err((err.kind(), err.to_string(), Value::Null)),
        }
    }

    fn is_snapshot_step(&self, tool: &str) -> bool {
        self.settings
            .snapshot_patterns
            .iter()
            .any(|pattern| tool.contains(pattern.as_str()))
    }

    async fn synthesize_and_finish(
        &self,
        task_id: &str,
        message: &str,
        context: &RequestContext,
        plan: ExecutionPlan,
        results: Vec<ToolResult>,
        has_task: bool,
    ) -> Result<RequestOutcome, EngineError> {
        self.emit_progress(task_id, WorkflowStage::Synthesizing, "Generating response...");

        let response = match self
            .planner
            .synthesize_response(message, &plan, &results)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = planner_error(err);
                return Err(self.fail(task_id, Some(&plan), err, results).await);
            }
        };

        let started = self
            .workflows
            .read()
            .await
            .records
            .get(task_id)
            .map(|r| r.started);
        let record = ConversationRecord {
            id: String::new(),
            timestamp: Utc::now(),
            user_message: message.to_string(),
            agent_response: response.clone(),
            plan: Some(plan.clone()),
            results: results.clone(),
            context: context.to_value(),
            duration_ms: started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or_default(),
            success: results.iter().all(|r| r.success),
        };
        if let Err(err) = self.memory.store_conversation(record).await {
            let err = EngineError::Memory(format!("{err:#}"));
            return Err(self.fail(task_id, Some(&plan), err, results).await);
        }

        let snapshot_ids = if has_task {
            self.tasks
                .update_status(task_id, TaskStatus::Completed, None)
                .await?
                .snapshot_ids()
        } else {
            Vec::new()
        };
        self.transition(task_id, WorkflowStage::Completed).await?;

        let mut outcome = RequestOutcome::new(task_id, WorkflowStage::Completed, plan);
        outcome.response = Some(response);
        outcome.completed_steps = results.len();
        outcome.results = results;
        outcome.snapshot_ids = snapshot_ids;
        self.store_outcome(task_id, &outcome).await;

        emit_event(
            Level::INFO,
            ProcessKind::Daemon,
            ObservabilityEvent {
                event: "request.completed",
                component: "orchestrator",
                task_id: Some(task_id),
                status: Some("completed"),
                ..Default::default()
            },
        );
        self.event_bus.emit(
            kinds::TASK_COMPLETED,
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );
        Ok(outcome)
    }

    async fn finish_cancelled(
        &self,
        task_id: &str,
        plan: ExecutionPlan,
        results: Vec<ToolResult>,
    ) -> RequestOutcome {
        let mut outcome = RequestOutcome::new(task_id, WorkflowStage::Cancelled, plan);
        outcome.completed_steps = results.len();
        outcome.results = results;
        self.store_outcome(task_id, &outcome).await;
        self.emit_progress(task_id, WorkflowStage::Cancelled, "Task cancelled");
        outcome
    }

    /// Marks the request failed everywhere it is tracked and reports it.
    async fn fail(
        &self,
        task_id: &str,
        plan: Option<&ExecutionPlan>,
        err: EngineError,
        results: Vec<ToolResult>,
    ) -> EngineError {
        tracing::error!("request {} failed: {}", task_id, err);
        if self.tasks.is_active(task_id).await {
            if let Err(update_err) = self
                .tasks
                .update_status(task_id, TaskStatus::Failed, Some(err.to_string()))
                .await
            {
                tracing::warn!("could not mark task {} failed: {}", task_id, update_err);
            }
        }
        self.set_stage(task_id, WorkflowStage::Failed).await;

        let mut outcome = RequestOutcome::new(
            task_id,
            WorkflowStage::Failed,
            plan.cloned().unwrap_or_default(),
        );
        outcome.completed_steps = results.len();
        outcome.results = results;
        outcome.error = Some(err.to_string());
        outcome.error_type = Some(err.kind().to_string());
        self.store_outcome(task_id, &outcome).await;

        emit_event(
            Level::ERROR,
            ProcessKind::Daemon,
            ObservabilityEvent {
                event: "request.failed",
                component: "orchestrator",
                task_id: Some(task_id),
                status: Some("failed"),
                error_code: Some(err.kind()),
                ..Default::default()
            },
        );
        self.event_bus.emit(
            kinds::TASK_FAILED,
            json!({
                "taskId": task_id,
                "error": err.to_string(),
                "errorType": err.kind(),
            }),
        );
        err
    }

    /// Cancels a request. A request awaiting confirmation or not yet planned
    /// is cancelled at once; an executing one stops before its next step.
    pub async fn cancel_task(&self, task_id: &str) -> Result<WorkflowStage, EngineError> {
        let stage = {
            let mut table = self.workflows.write().await;
            let Some(record) = table.records.get_mut(task_id) else {
                return Err(EngineError::TaskNotFound(task_id.to_string()));
            };
            if record.stage.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "task `{task_id}` already {}",
                    record.stage.as_str()
                )));
            }
            record.cancel_requested = true;
            if record.stage == WorkflowStage::AwaitingConfirmation {
                record.stage = WorkflowStage::Cancelled;
                record.updated_at = Utc::now();
            }
            record.stage
        };

        match stage {
            WorkflowStage::Cancelled => {
                let task = self
                    .tasks
                    .update_status(task_id, TaskStatus::Cancelled, None)
                    .await?;
                self.finish_cancelled(task_id, task.plan, Vec::new()).await;
            }
            _ => {
                self.tasks.request_interrupt(task_id).await;
                self.emit_progress(task_id, stage, "Cancellation requested");
            }
        }
        Ok(stage)
    }

    pub async fn rollback_task(
        &self,
        task_id: &str,
        snapshot_id: Option<&str>,
    ) -> Result<StateSnapshot, EngineError> {
        self.emit_progress_raw(task_id, "rolling_back", "Rolling back...");
        match self.tasks.rollback(task_id, snapshot_id).await {
            Ok(snapshot) => {
                self.emit_progress_raw(task_id, "rolled_back", "Rollback completed");
                Ok(snapshot)
            }
            Err(err) => {
                tracing::error!("rollback of task {} failed: {}", task_id, err);
                self.emit_progress_raw(task_id, "rollback_failed", "Rollback failed");
                Err(err)
            }
        }
    }

    pub async fn workflow_stage(&self, task_id: &str) -> Option<WorkflowStage> {
        self.workflows
            .read()
            .await
            .records
            .get(task_id)
            .map(|r| r.stage)
    }

    pub async fn outcome(&self, task_id: &str) -> Option<RequestOutcome> {
        self.workflows
            .read()
            .await
            .records
            .get(task_id)
            .and_then(|r| r.outcome.clone())
    }

    pub async fn task(&self, task_id: &str) -> Option<TaskView> {
        let (stage, updated_at, outcome) = {
            let table = self.workflows.read().await;
            let record = table.records.get(task_id)?;
            (record.stage, record.updated_at, record.outcome.clone())
        };
        Some(TaskView {
            task_id: task_id.to_string(),
            stage,
            updated_at,
            task: self.tasks.task(task_id).await,
            outcome,
        })
    }

    pub async fn get_status(&self) -> DaemonStatus {
        let (llm_connected, model_name) = match &self.router {
            Some(router) => (router.is_connected().await, router.active_model_name().await),
            None => (false, String::new()),
        };
        let pending_confirmations = self
            .workflows
            .read()
            .await
            .records
            .values()
            .filter(|r| r.stage == WorkflowStage::AwaitingConfirmation)
            .count();
        DaemonStatus {
            running: true,
            llm_connected,
            model_name,
            active_tasks: self.tasks.active_count().await,
            pending_confirmations,
            tools_loaded: self.registry.len().await,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Moves to `next` unless a cancel arrived first, in which case the
    /// request ends here as cancelled.
    async fn advance_or_cancel(
        &self,
        task_id: &str,
        next: WorkflowStage,
        plan: Option<&ExecutionPlan>,
    ) -> Result<Option<RequestOutcome>, EngineError> {
        if self.transition_unless_cancelled(task_id, next).await? {
            return Ok(None);
        }
        let outcome = self
            .finish_cancelled(task_id, plan.cloned().unwrap_or_default(), Vec::new())
            .await;
        Ok(Some(outcome))
    }

    async fn cancel_requested(&self, task_id: &str) -> bool {
        self.workflows
            .read()
            .await
            .records
            .get(task_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    async fn transition(&self, task_id: &str, next: WorkflowStage) -> Result<(), EngineError> {
        let mut table = self.workflows.write().await;
        let Some(record) = table.records.get_mut(task_id) else {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };
        record.advance(task_id, next)
    }

    /// Like `transition`, but a pending cancel wins: the stage becomes
    /// `Cancelled` under the same lock and `false` is returned.
    async fn transition_unless_cancelled(
        &self,
        task_id: &str,
        next: WorkflowStage,
    ) -> Result<bool, EngineError> {
        let mut table = self.workflows.write().await;
        let Some(record) = table.records.get_mut(task_id) else {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };
        if record.cancel_requested {
            record.stage = WorkflowStage::Cancelled;
            record.updated_at = Utc::now();
            return Ok(false);
        }
        record.advance(task_id, next)?;
        Ok(true)
    }

    /// Unconditional move, used for the terminal failure/cancel paths.
    async fn set_stage(&self, task_id: &str, stage: WorkflowStage) {
        let mut table = self.workflows.write().await;
        if let Some(record) = table.records.get_mut(task_id) {
            record.stage = stage;
            record.updated_at = Utc::now();
        }
    }

    /// Stores the outcome and, for finished requests, evicts the oldest
    /// finished workflows past the history limit.
    async fn store_outcome(&self, task_id: &str, outcome: &RequestOutcome) {
        let mut table = self.workflows.write().await;
        let Some(record) = table.records.get_mut(task_id) else {
            return;
        };
        record.outcome = Some(outcome.clone());
        if !outcome.status.is_terminal() {
            return;
        }
        table.finished.push_back(task_id.to_string());
        let limit = self.settings.workflow_history_limit.max(1);
        while table.finished.len() > limit {
            if let Some(oldest) = table.finished.pop_front() {
                table.records.remove(&oldest);
            }
        }
    }

    fn emit_progress(&self, task_id: &str, stage: WorkflowStage, message: &str) {
        self.emit_progress_raw(task_id, stage.as_str(), message);
    }

    fn emit_progress_raw(&self, task_id: &str, stage: &str, message: &str) {
        self.event_bus.emit(
            kinds::TASK_PROGRESS,
            json!({"taskId": task_id, "stage": stage, "message": message}),
        );
    }
}

/// Router failures keep their own kind so a dead backend reads as
/// `connectivity` rather than a planner fault.
fn planner_error(err: anyhow::Error) -> EngineError {
    match err.downcast::<ember_providers::RouterError>() {
        Ok(router_err) => EngineError::Router(router_err),
        Err(other) => EngineError::Planner(format!("{other:#}")),
    }
}

/// Existing paths named by the step's path-like arguments, absolutized.
fn affected_paths(args: &Value) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for key in AFFECTED_PATH_KEYS {
        match args.get(key) {
            Some(Value::String(raw)) => paths.push(resolve_path(raw)),
            Some(Value::Array(items)) => paths.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(resolve_path),
            ),
            _ => {}
        }
    }
    paths.retain(|p| p.exists());
    paths.dedup();
    paths
}
