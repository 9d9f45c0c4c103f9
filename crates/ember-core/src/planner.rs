use async_trait::async_trait;
use serde_json::{json, Value};

use ember_providers::{ChatMessage, ModelRouter};
use ember_tools::CapabilityRegistry;
use ember_types::{ExecutionPlan, ModelType, ToolResult};

use crate::collaborators::{Planner, RequestContext};

const PLANNER_SYSTEM_PROMPT: &str = "You are Ember, an assistant that operates the user's local \
machine through tools. Decide which tools, if any, answer the request. Reply with a JSON object \
{\"steps\": [{\"tool\": name, \"args\": {...}, \"description\": text}], \
\"requires_confirmation\": bool, \"confirmation_message\": text, \
\"risk_level\": \"low\"|\"medium\"|\"high\"|\"critical\", \"reasoning\": text}. \
Use an empty steps list when no tool is needed. A later step may use an earlier step's output \
with the string \"$result[i]\" or \"$result[i].field\".";

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are Ember, a concise local assistant. Answer the user \
using the tool results provided. Mention failures plainly.";

/// Tool results are cut to this many characters inside the synthesis prompt.
const RESULT_PROMPT_CHARS: usize = 2000;

/// Planner backed by the model router: tool schemas and request context go
/// into a JSON-mode prompt, the reply is read as an ExecutionPlan.
#[derive(Clone)]
pub struct ModelPlanner {
    router: ModelRouter,
    registry: CapabilityRegistry,
}

impl ModelPlanner {
    pub fn new(router: ModelRouter, registry: CapabilityRegistry) -> Self {
        Self { router, registry }
    }

    async fn planning_prompt(&self, message: &str, context: &RequestContext) -> String {
        let tools = Value::Array(self.registry.schemas().await);
        format!(
            "{PLANNER_SYSTEM_PROMPT}\n\nAvailable tools:\n{}\n\nContext:\n{}\n\nRequest:\n{}",
            tools,
            context.to_value(),
            message
        )
    }

    /// Raises the plan's risk to the highest risk among its tools.
    async fn apply_tool_risk(&self, plan: &mut ExecutionPlan) {
        for step in &plan.steps {
            if let Some(manifest) = self.registry.manifest(&step.tool).await {
                plan.risk_level = plan.risk_level.max(manifest.risk_level);
            }
        }
    }
}

#[async_trait]
impl Planner for ModelPlanner {
    async fn create_plan(
        &self,
        message: &str,
        context: &RequestContext,
    ) -> anyhow::Result<ExecutionPlan> {
        let prompt = self.planning_prompt(message, context).await;
        let raw = self.router.complete_json(self.router.request(prompt)).await?;
        let mut plan = plan_from_value(raw)?;
        self.apply_tool_risk(&mut plan).await;
        tracing::debug!(
            "planned {} step(s): {:?}",
            plan.steps.len(),
            plan.tool_names()
        );
        Ok(plan)
    }

    async fn synthesize_response(
        &self,
        message: &str,
        plan: &ExecutionPlan,
        results: &[ToolResult],
    ) -> anyhow::Result<String> {
        let mut user = message.to_string();
        if !results.is_empty() {
            let rendered: Vec<Value> = results.iter().map(result_for_prompt).collect();
            user.push_str(&format!(
                "\n\nTool results:\n{}",
                Value::Array(rendered)
            ));
        } else if !plan.reasoning.is_empty() {
            user.push_str(&format!("\n\nPlanner notes: {}", plan.reasoning));
        }
        let messages = [
            ChatMessage::new("system", SYNTHESIS_SYSTEM_PROMPT),
            ChatMessage::new("user", user),
        ];
        let response = self.router.complete_chat(&messages, ModelType::Text).await?;
        Ok(response.content.trim().to_string())
    }
}

/// Accepts either a plan object or a bare list of steps.
fn plan_from_value(raw: Value) -> anyhow::Result<ExecutionPlan> {
    let raw = match raw {
        Value::Array(steps) => json!({ "steps": steps }),
        other => other,
    };
    serde_json::from_value(raw).map_err(|err| anyhow::anyhow!("planner output is not a plan: {err}"))
}

fn result_for_prompt(result: &ToolResult) -> Value {
    let mut body = result.result.to_string();
    if body.chars().count() > RESULT_PROMPT_CHARS {
        body = body.chars().take(RESULT_PROMPT_CHARS).collect::<String>() + "...";
    }
    json!({
        "tool": result.tool,
        "success": result.success,
        "result": body,
        "error": result.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use ember_providers::{Backend, BackendHealth, RawCompletion, RouterError, TokenStream};
    use ember_types::{CompletionRequest, RiskLevel};

    struct ScriptedBackend {
        model_type: ModelType,
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn model_type(&self) -> ModelType {
            self.model_type
        }

        fn base_url(&self) -> &str {
            "http://scripted"
        }

        async fn probe(&self) -> Result<BackendHealth, RouterError> {
            Ok(BackendHealth {
                model_name: "scripted".to_string(),
                stats: json!({}),
            })
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<RawCompletion, RouterError> {
            self.prompts.lock().expect("prompts").push(req.prompt.clone());
            Ok(RawCompletion {
                content: self.reply.clone(),
                tokens_used: 1,
                finish_reason: "stop".to_string(),
                duration_ms: 1,
            })
        }

        async fn stream(&self, _req: &CompletionRequest) -> Result<TokenStream, RouterError> {
            Err(RouterError::Connectivity("no streaming".to_string()))
        }
    }

    async fn planner_replying(reply: &str) -> (ModelPlanner, Arc<ScriptedBackend>) {
        let text = Arc::new(ScriptedBackend {
            model_type: ModelType::Text,
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let vision = Arc::new(ScriptedBackend {
            model_type: ModelType::Vision,
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let router = ModelRouter::new(text.clone(), vision);
        let registry = CapabilityRegistry::with_builtins().await.expect("registry");
        (ModelPlanner::new(router, registry), text)
    }

    #[tokio::test]
    async fn fenced_plan_is_parsed_and_risk_raised_to_tool_level() {
        let reply = "```json\n{\"steps\":[{\"tool\":\"filesystem.delete\",\"args\":{\"path\":\"/tmp/x\"}}],\"risk_level\":\"low\"}\n```";
        let (planner, text) = planner_replying(reply).await;
        let plan = planner
            .create_plan("delete /tmp/x", &RequestContext::default())
            .await
            .expect("plan");
        assert_eq!(plan.tool_names(), vec!["filesystem.delete"]);
        assert_eq!(plan.risk_level, RiskLevel::High);
        let prompts = text.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("filesystem.delete"));
        assert!(prompts[0].contains("delete /tmp/x"));
    }

    #[tokio::test]
    async fn non_json_reply_is_a_planning_error() {
        let (planner, _) = planner_replying("I think you should just do it").await;
        let err = planner
            .create_plan("hi", &RequestContext::default())
            .await
            .expect_err("invalid");
        let router_err = err.downcast_ref::<RouterError>().expect("router error");
        assert_eq!(router_err.kind(), "invalid_json_response");
    }

    #[test]
    fn bare_step_list_is_accepted() {
        let plan = plan_from_value(json!([{"tool": "filesystem.list", "args": {"path": "/tmp"}}]))
            .expect("plan");
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn synthesis_includes_tool_results() {
        let (planner, text) = planner_replying("  Done.  ").await;
        let results = vec![ToolResult::ok("filesystem.read", json!({"content": "hello"}), 3)];
        let answer = planner
            .synthesize_response("read it", &ExecutionPlan::default(), &results)
            .await
            .expect("answer");
        assert_eq!(answer, "Done.");
        let prompts = text.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("hello"));
        assert!(prompts[0].contains("<|im_start|>system"));
    }
}
