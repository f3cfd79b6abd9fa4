use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::agent_engine::state::{Plan, Step, Task};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::planner::{PlanContext, TaskPlanner};

const DEFAULT_WAIT: Duration = Duration::from_secs(1);
/// Longer waits in task text are clamped to this.
const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

/// Compiled clause grammar, tried in declaration order.
struct Grammar {
    splitter: Regex,
    terminal: Regex,
    search: Regex,
    type_into: Regex,
    type_text: Regex,
    press: Regex,
    wait: Regex,
    scroll: Regex,
    click: Regex,
    open_app: Regex,
}

impl Grammar {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            splitter: Regex::new(r"(?i)\s*(?:,?\s*\band then\b|,?\s*\bthen\b|;)\s*")?,
            terminal: Regex::new(
                r"(?i)^(?:please\s+)?(?:run|open|launch|start)\s+(?:(?:a|an|the|new)\s+)*terminal(?:\s+window)?$",
            )?,
            search: Regex::new(r"(?i)^search\s+(?:for\s+)?(.+)$")?,
            type_into: Regex::new(r"(?i)^(?:type|enter|write)\s+(.+?)\s+(?:into|in)\s+(?:the\s+)?(.+)$")?,
            type_text: Regex::new(r"(?i)^(?:type|enter|write)\s+(.+)$")?,
            press: Regex::new(r"(?i)^(?:press|hit)\s+(?:the\s+)?(?:keys?\s+)?(.+?)(?:\s+keys?)?$")?,
            wait: Regex::new(
                r"(?i)^(?:wait|pause|sleep)(?:\s+for)?(?:\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?)?$",
            )?,
            scroll: Regex::new(r"(?i)^scroll\s+(up|down)$")?,
            click: Regex::new(r"(?i)^(?:click|tap|select)\s+(?:on\s+)?(?:the\s+)?(.+)$")?,
            open_app: Regex::new(
                r"(?i)^(?:open|launch|start|run)\s+(?:the\s+)?(?:app(?:lication)?\s+)?(.+?)(?:\s+app(?:lication)?)?$",
            )?,
        })
    }

    fn clauses<'t>(&self, task: &'t str) -> Vec<&'t str> {
        self.splitter
            .split(task)
            .map(|c| c.trim().trim_end_matches(['.', '!', '?']).trim())
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn steps_for(&self, clause: &str) -> Vec<Step> {
        if self.terminal.is_match(clause) {
            return vec![Step::open_app("terminal")];
        }
        if let Some(c) = self.search.captures(clause) {
            let query = unquote(&c[1]);
            return vec![
                Step::click("search"),
                Step::type_text(query, None),
                Step::key_press("enter"),
            ];
        }
        if let Some(c) = self.type_into.captures(clause) {
            return vec![Step::type_text(unquote(&c[1]), Some(c[2].trim().to_string()))];
        }
        if let Some(c) = self.type_text.captures(clause) {
            return vec![Step::type_text(unquote(&c[1]), None)];
        }
        if let Some(c) = self.press.captures(clause) {
            let keys: String = c[1].split_whitespace().collect();
            return vec![Step::key_press(keys)];
        }
        if let Some(c) = self.wait.captures(clause) {
            let duration = match (c.get(1), c.get(2)) {
                (Some(n), unit) => {
                    let n: f64 = n.as_str().parse().unwrap_or(1.0);
                    let secs = match unit.map(|u| u.as_str().to_ascii_lowercase()) {
                        Some(u) if u.starts_with("ms") || u.starts_with("milli") => n / 1000.0,
                        Some(u) if u.starts_with('m') => n * 60.0,
                        _ => n,
                    };
                    Duration::try_from_secs_f64(secs.max(0.0))
                        .map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
                }
                (None, _) => DEFAULT_WAIT,
            };
            return vec![Step::wait(duration)];
        }
        if let Some(c) = self.scroll.captures(clause) {
            let key = if c[1].eq_ignore_ascii_case("up") {
                "pageup"
            } else {
                "pagedown"
            };
            return vec![Step::key_press(key)];
        }
        if let Some(c) = self.click.captures(clause) {
            return vec![Step::click(unquote(&c[1]))];
        }
        if let Some(c) = self.open_app.captures(clause) {
            return vec![Step::open_app(unquote(&c[1]))];
        }
        vec![Step::custom(clause)]
    }
}

fn unquote(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .to_string()
}

/// Deterministic planner over a small fixed vocabulary. Needs no network.
pub struct FallbackPlanner {
    grammar: Grammar,
}

impl FallbackPlanner {
    pub fn new() -> DeskPilotResult<Self> {
        let grammar = Grammar::compile()
            .map_err(|e| DeskPilotError::Planning(format!("fallback grammar: {e}")))?;
        Ok(Self { grammar })
    }

    pub fn plan_text(&self, task: &str) -> DeskPilotResult<Plan> {
        let steps: Vec<Step> = self
            .grammar
            .clauses(task)
            .into_iter()
            .flat_map(|clause| self.grammar.steps_for(clause))
            .collect();
        Plan::new(steps)
    }
}

/// Drops the leading steps that already succeeded, unless that leaves nothing.
fn remaining_tail(plan: Plan, ctx: &PlanContext<'_>) -> DeskPilotResult<Plan> {
    let successes: Vec<_> = ctx.log.successes().collect();
    let done = plan
        .steps()
        .iter()
        .zip(successes.iter())
        .take_while(|(step, entry)| entry.succeeded(step))
        .count();
    if done == 0 || done == plan.len() {
        return Ok(plan);
    }
    tracing::debug!(skipped = done, "fallback replan skips completed steps");
    Plan::new(plan.steps()[done..].to_vec())
}

#[async_trait]
impl TaskPlanner for FallbackPlanner {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn plan(&self, task: &Task, context: Option<PlanContext<'_>>) -> DeskPilotResult<Plan> {
        let plan = self.plan_text(task.as_str())?;
        match context {
            Some(ctx) => remaining_tail(plan, &ctx),
            None => Ok(plan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::history::{RunLog, RunLogEntry};
    use crate::agent_engine::state::{Outcome, Payload, StepKind};

    fn planner() -> FallbackPlanner {
        FallbackPlanner::new().unwrap()
    }

    #[test]
    fn test_run_terminal() {
        let plan = planner().plan_text("run terminal").unwrap();
        assert_eq!(plan.steps(), &[Step::open_app("terminal")]);

        let plan = planner().plan_text("Please open a new terminal window.").unwrap();
        assert_eq!(plan.steps(), &[Step::open_app("terminal")]);
    }

    #[test]
    fn test_multi_clause_task() {
        let plan = planner()
            .plan_text("open firefox, then click the address bar; type \"example.com\" then press Enter")
            .unwrap();
        let kinds: Vec<StepKind> = plan.steps().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::OpenApp, StepKind::Click, StepKind::Type, StepKind::KeyPress]
        );
        assert_eq!(plan.steps()[0].target_description.as_deref(), Some("firefox"));
        assert_eq!(plan.steps()[1].target_description.as_deref(), Some("address bar"));
        assert_eq!(plan.steps()[2].payload, Some(Payload::Text("example.com".into())));
        assert_eq!(plan.steps()[3].payload, Some(Payload::Keys("Enter".into())));
    }

    #[test]
    fn test_type_into_field() {
        let plan = planner().plan_text("type hello world into the search field").unwrap();
        assert_eq!(
            plan.steps(),
            &[Step::type_text("hello world", Some("search field".into()))]
        );
    }

    #[test]
    fn test_wait_scroll_and_keys() {
        let plan = planner()
            .plan_text("wait 2 seconds then scroll down then press ctrl + alt + t")
            .unwrap();
        assert_eq!(
            plan.steps(),
            &[
                Step::wait(Duration::from_secs(2)),
                Step::key_press("pagedown"),
                Step::key_press("ctrl+alt+t"),
            ]
        );
    }

    #[test]
    fn test_huge_wait_is_clamped() {
        let plan = planner().plan_text("wait 100000000000000000000 seconds").unwrap();
        assert_eq!(plan.steps(), &[Step::wait(MAX_WAIT)]);

        let plan = planner().plan_text("wait 90 minutes").unwrap();
        assert_eq!(plan.steps(), &[Step::wait(MAX_WAIT)]);
    }

    #[test]
    fn test_search_expands_to_three_steps() {
        let plan = planner().plan_text("search for rust tutorials").unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.steps()[1].payload, Some(Payload::Text("rust tutorials".into())));
    }

    #[test]
    fn test_unknown_task_is_single_custom_step() {
        let plan = planner().plan_text("make the spreadsheet prettier").unwrap();
        assert_eq!(plan.steps(), &[Step::custom("make the spreadsheet prettier")]);
    }

    #[tokio::test]
    async fn test_replan_skips_completed_prefix() {
        let planner = planner();
        let task = Task::new("open firefox then click Downloads").unwrap();
        let mut log = RunLog::new("t");
        log.push(RunLogEntry::new(0, 0, 1, &Step::open_app("firefox"), Outcome::Success));
        log.push(RunLogEntry::new(1, 0, 1, &Step::click("Downloads"), Outcome::failed("no matching element")));

        let ctx = PlanContext { log: &log, screen: None };
        let plan = planner.plan(&task, Some(ctx)).await.unwrap();
        assert_eq!(plan.steps(), &[Step::click("Downloads")]);
    }
}
