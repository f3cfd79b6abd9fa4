//! LLM-backed planner: asks an OpenAI-compatible model for a JSON step list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::agent_engine::state::{Plan, Step, StepKind, Task};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::registry::ProviderRegistry;
use crate::llm::types::ChatMessage;
use crate::planner::{PlanContext, TaskPlanner};

const PLANNING_ROLE: &str = "planning";
const FAILURE_CONTEXT_LINES: usize = 12;
const MAX_STEP_RETRIES: u32 = 10;

const SYSTEM_PROMPT: &str = r#"You control a Linux desktop by emitting a short plan of UI steps.
Reply with a single JSON object and nothing else:
{"steps":[{"kind":"...","target":"...","payload":"...","max_retries":3}]}

Step kinds:
- "open_app": launch an application. "target" is the application name.
- "click": click a visible element. "target" is its visible label, optionally with a type word ("Save button", "address bar").
- "type": type "payload" as text. Set "target" to the field to click first, or omit it to type into the focused field.
- "key_press": press a key or chord, e.g. "enter", "ctrl+l", "ctrl+alt+t". Put it in "payload".
- "wait": pause; "payload" is a number of seconds.
- "custom": anything else, described in "target".

Keep plans short. Prefer keyboard shortcuts when they are reliable. "max_retries" is optional."#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    kind: String,
    #[serde(default, alias = "target_description")]
    target: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    max_retries: Option<u32>,
}

pub struct LlmPlanner {
    registry: Arc<ProviderRegistry>,
}

impl LlmPlanner {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TaskPlanner for LlmPlanner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn plan(&self, task: &Task, context: Option<PlanContext<'_>>) -> DeskPilotResult<Plan> {
        let (provider, call) = self
            .registry
            .call_config_for_role(PLANNING_ROLE)
            .map_err(|e| DeskPilotError::Planning(e.to_string()))?;

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_user_prompt(task, context)),
        ];
        let response = provider
            .chat(messages, &call)
            .await
            .map_err(|e| DeskPilotError::Planning(format!("{}: {e}", provider.name())))?;

        let plan = parse_plan(&response.content)?;
        tracing::info!(
            provider = provider.name(),
            steps = plan.len(),
            replan = context.is_some(),
            "LLM plan received"
        );
        Ok(plan)
    }
}

fn build_user_prompt(task: &Task, context: Option<PlanContext<'_>>) -> String {
    let mut prompt = format!("Task: {task}\n");
    if let Some(ctx) = context {
        let failures = ctx.log.failure_summary(FAILURE_CONTEXT_LINES);
        if !failures.is_empty() {
            prompt.push_str("\nRecent failed attempts:\n");
            prompt.push_str(&failures);
            prompt.push('\n');
        }
        let done: Vec<String> = ctx
            .log
            .successes()
            .map(|e| format!("- {} {}", e.kind, e.target.as_deref().unwrap_or("")))
            .collect();
        if !done.is_empty() {
            prompt.push_str("\nAlready completed:\n");
            prompt.push_str(&done.join("\n"));
            prompt.push('\n');
        }
        if let Some(screen) = ctx.screen.filter(|s| !s.is_empty()) {
            prompt.push_str("\nElements on the current screen:\n");
            prompt.push_str(screen);
            prompt.push('\n');
        }
        prompt.push_str("\nReturn only the steps still needed, avoiding what already failed.\n");
    }
    prompt
}

/// Validates model output into a plan. Malformed output is a planning error.
pub fn parse_plan(content: &str) -> DeskPilotResult<Plan> {
    let json = extract_json(content)
        .ok_or_else(|| DeskPilotError::Planning("planner response contains no JSON".into()))?;

    let raw: Vec<RawStep> = if json.trim_start().starts_with('[') {
        serde_json::from_str(json)
    } else {
        serde_json::from_str::<RawPlan>(json).map(|p| p.steps)
    }
    .map_err(|e| DeskPilotError::Planning(format!("malformed plan: {e}")))?;

    let steps = raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| convert_step(r).map_err(|msg| DeskPilotError::Planning(format!("step {i}: {msg}"))))
        .collect::<DeskPilotResult<Vec<Step>>>()?;
    Plan::new(steps)
}

/// Strips Markdown fences and surrounding prose.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find(['{', '['])?;
    let close = if content[start..].starts_with('{') { '}' } else { ']' };
    let end = content.rfind(close)?;
    (end > start).then(|| &content[start..=end])
}

fn convert_step(raw: RawStep) -> Result<Step, String> {
    let kind = StepKind::parse(&raw.kind);
    let target = raw
        .target
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let payload_text = raw.payload.as_ref().and_then(value_text);

    let mut step = match kind {
        StepKind::Click => Step::click(target.ok_or("click without target")?),
        StepKind::Type => Step::type_text(payload_text.ok_or("type without payload")?, target),
        StepKind::KeyPress => Step::key_press(payload_text.or(target).ok_or("key_press without keys")?),
        StepKind::Wait => {
            let secs = raw
                .payload
                .as_ref()
                .and_then(value_seconds)
                .ok_or("wait without a duration")?;
            Step::wait(Duration::try_from_secs_f64(secs).map_err(|_| "wait duration out of range")?)
        }
        StepKind::OpenApp => Step::open_app(target.or(payload_text).ok_or("open_app without application")?),
        StepKind::Custom => {
            let description = match (target, payload_text) {
                (Some(t), _) if raw.kind.trim().is_empty() || raw.kind.trim().eq_ignore_ascii_case("custom") => t,
                (Some(t), _) => format!("{} {t}", raw.kind.trim()),
                (None, Some(p)) => p,
                (None, None) => return Err(format!("custom step {:?} without description", raw.kind)),
            };
            Step::custom(description)
        }
    };
    if let Some(n) = raw.max_retries {
        step.max_retries = Some(n.clamp(1, MAX_STEP_RETRIES));
    }
    Ok(step)
}

fn value_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_seconds(v: &serde_json::Value) -> Option<f64> {
    let secs = match v {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().trim_end_matches('s').trim().parse().ok()?,
        _ => return None,
    };
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::history::{RunLog, RunLogEntry};
    use crate::agent_engine::state::{Outcome, Payload};

    #[test]
    fn test_parses_fenced_plan() {
        let content = "Here you go:\n```json\n{\"steps\":[\
            {\"kind\":\"open_app\",\"target\":\"terminal\"},\
            {\"kind\":\"wait\",\"payload\":1.5},\
            {\"kind\":\"type\",\"payload\":\"ls\"},\
            {\"kind\":\"key_press\",\"payload\":\"enter\",\"max_retries\":99}]}\n```";
        let plan = parse_plan(content).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.steps()[0], Step::open_app("terminal"));
        assert_eq!(plan.steps()[1].payload, Some(Payload::DurationMs(1500)));
        assert_eq!(plan.steps()[2], Step::type_text("ls", None));
        assert_eq!(plan.steps()[3].max_retries, Some(MAX_STEP_RETRIES));
    }

    #[test]
    fn test_unknown_kind_coerced_to_custom() {
        let plan = parse_plan(r#"[{"kind":"drag","target":"the file to the trash"}]"#).unwrap();
        assert_eq!(plan.steps()[0].kind, StepKind::Custom);
        assert_eq!(
            plan.steps()[0].target_description.as_deref(),
            Some("drag the file to the trash")
        );
    }

    #[test]
    fn test_malformed_output_is_planning_error() {
        assert!(matches!(parse_plan("I cannot help"), Err(DeskPilotError::Planning(_))));
        assert!(matches!(parse_plan(r#"{"steps":[]}"#), Err(DeskPilotError::Planning(_))));
        assert!(matches!(
            parse_plan(r#"{"steps":[{"kind":"click"}]}"#),
            Err(DeskPilotError::Planning(_))
        ));
    }

    #[test]
    fn test_out_of_range_wait_is_planning_error() {
        let result = parse_plan(r#"{"steps":[{"kind":"wait","payload":1e30}]}"#);
        assert!(matches!(result, Err(DeskPilotError::Planning(ref msg)) if msg.contains("out of range")));
    }

    #[test]
    fn test_replan_prompt_carries_failures_and_screen() {
        let mut log = RunLog::new("p");
        log.push(RunLogEntry::new(0, 0, 1, &Step::click("Run"), Outcome::failed("no matching element")));
        let ctx = PlanContext {
            log: &log,
            screen: Some("Button \"Cancel\" at (10, 10)"),
        };
        let prompt = build_user_prompt(&Task::new("click run").unwrap(), Some(ctx));
        assert!(prompt.contains("Recent failed attempts"));
        assert!(prompt.contains("no matching element"));
        assert!(prompt.contains("Cancel"));
    }
}
