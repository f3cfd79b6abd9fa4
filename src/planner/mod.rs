pub mod fallback;
pub mod llm;

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent_engine::history::RunLog;
use crate::agent_engine::state::{Plan, Task};
use crate::config::{AppConfig, PlannerStrategy};
use crate::errors::DeskPilotResult;
use crate::llm::registry::ProviderRegistry;
use crate::perception::types::DetectedElement;
use crate::planner::fallback::FallbackPlanner;
use crate::planner::llm::LlmPlanner;

/// What a replan gets to see of the run so far.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub log: &'a RunLog,
    /// Summary of the elements on the most recent screen, if any was observed.
    pub screen: Option<&'a str>,
}

/// Turns a task into a plan. Called once per run and again on every replan.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    fn name(&self) -> &str;

    async fn plan(&self, task: &Task, context: Option<PlanContext<'_>>) -> DeskPilotResult<Plan>;
}

/// Tries the primary planner and falls back on any planning error.
pub struct ResilientPlanner {
    primary: Arc<dyn TaskPlanner>,
    fallback: Arc<dyn TaskPlanner>,
}

impl ResilientPlanner {
    pub fn new(primary: Arc<dyn TaskPlanner>, fallback: Arc<dyn TaskPlanner>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl TaskPlanner for ResilientPlanner {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn plan(&self, task: &Task, context: Option<PlanContext<'_>>) -> DeskPilotResult<Plan> {
        match self.primary.plan(task, context).await {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracing::warn!(
                    planner = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "planning failed; using fallback planner"
                );
                self.fallback.plan(task, context).await
            }
        }
    }
}

/// Planner for the configured strategy. The LLM strategy degrades to the
/// fallback planner alone when no provider is usable.
pub fn build_planner(cfg: &AppConfig) -> DeskPilotResult<Arc<dyn TaskPlanner>> {
    let fallback: Arc<dyn TaskPlanner> = Arc::new(FallbackPlanner::new()?);
    match cfg.planner.strategy {
        PlannerStrategy::Fallback => {
            tracing::info!("using fallback planner");
            Ok(fallback)
        }
        PlannerStrategy::Llm => {
            let registry = ProviderRegistry::from_config(cfg);
            if registry.is_empty() {
                tracing::warn!("no usable LLM provider configured; using fallback planner");
                return Ok(fallback);
            }
            let llm: Arc<dyn TaskPlanner> = Arc::new(LlmPlanner::new(Arc::new(registry)));
            Ok(Arc::new(ResilientPlanner::new(llm, fallback)))
        }
    }
}

/// One line per element, at most `limit` lines, for planner prompts.
pub fn summarize_elements(elements: &[DetectedElement], limit: usize) -> String {
    let mut lines: Vec<String> = elements
        .iter()
        .filter(|e| !e.text.trim().is_empty())
        .take(limit)
        .map(|e| {
            let c = e.center();
            format!(
                "{:?} {:?} at ({}, {})",
                e.element_type,
                e.text.trim(),
                c.x,
                c.y
            )
        })
        .collect();
    let total = elements.iter().filter(|e| !e.text.trim().is_empty()).count();
    if total > lines.len() {
        lines.push(format!("... and {} more", total - lines.len()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::Step;
    use crate::errors::DeskPilotError;
    use crate::perception::types::{BoundingBox, ElementType};

    struct Broken;

    #[async_trait]
    impl TaskPlanner for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn plan(&self, _task: &Task, _context: Option<PlanContext<'_>>) -> DeskPilotResult<Plan> {
            Err(DeskPilotError::Planning("malformed response".into()))
        }
    }

    #[tokio::test]
    async fn test_resilient_planner_falls_back() {
        let planner = ResilientPlanner::new(Arc::new(Broken), Arc::new(FallbackPlanner::new().unwrap()));
        let plan = planner.plan(&Task::new("run terminal").unwrap(), None).await.unwrap();
        assert_eq!(plan.steps(), &[Step::open_app("terminal")]);
    }

    #[test]
    fn test_llm_strategy_without_provider_uses_fallback() {
        let cfg = AppConfig::default();
        let planner = build_planner(&cfg).unwrap();
        assert_eq!(planner.name(), "fallback");
    }

    #[test]
    fn test_summary_skips_textless_and_truncates() {
        let elem = |text: &str| DetectedElement {
            bbox: BoundingBox::new(0, 0, 10, 10),
            element_type: ElementType::Button,
            text: text.into(),
            confidence: 0.9,
        };
        let elements = vec![elem("OK"), elem(""), elem("Cancel"), elem("Help")];
        let summary = summarize_elements(&elements, 2);
        assert_eq!(
            summary,
            "Button \"OK\" at (5, 5)\nButton \"Cancel\" at (5, 5)\n... and 1 more"
        );
    }
}
