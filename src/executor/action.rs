use std::sync::Arc;
use std::time::Duration;

use crate::agent_engine::state::{Outcome, Payload, Step, StepKind};
use crate::config::ExecutorConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::executor::input::InputDriver;
use crate::executor::keys::KeyCombo;
use crate::executor::launcher::AppLauncher;
use crate::executor::matcher::{normalize, MatchResult, Matcher, TargetQuery};
use crate::perception::types::DetectedElement;

const NO_MATCH: &str = "no matching element";
/// Words shorter than this are not tried on their own for custom steps.
const MIN_KEYWORD_LEN: usize = 4;

/// Outcome of resolving a target, before any input is sent.
enum Resolved<'a> {
    Element(&'a DetectedElement),
    Stop(Outcome),
}

/// Resolves one step against the current elements and performs it.
pub struct ActionExecutor {
    input: Arc<dyn InputDriver>,
    launcher: Arc<dyn AppLauncher>,
    matcher: Matcher,
    settle_delay: Duration,
}

impl ActionExecutor {
    pub fn new(
        input: Arc<dyn InputDriver>,
        launcher: Arc<dyn AppLauncher>,
        cfg: &ExecutorConfig,
    ) -> Self {
        Self {
            input,
            launcher,
            matcher: Matcher::from_config(cfg),
            settle_delay: Duration::from_millis(cfg.settle_delay_ms),
        }
    }

    /// Never returns an error: input failures become `Outcome::Failed`.
    pub async fn execute(&self, step: &Step, elements: &[DetectedElement]) -> Outcome {
        let result = match step.kind {
            StepKind::Wait => self.wait(step).await,
            StepKind::OpenApp => self.open_app(step).await,
            StepKind::Click => self.click(step, elements).await,
            StepKind::Type => self.type_text(step, elements).await,
            StepKind::KeyPress => self.key_press(step, elements).await,
            StepKind::Custom => self.custom(step, elements).await,
        };

        match result {
            Ok(Outcome::Success) => {
                if step.kind != StepKind::Wait && !self.settle_delay.is_zero() {
                    self.input.sleep(self.settle_delay).await;
                }
                Outcome::Success
            }
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(step = %step, error = %e, "step action failed");
                Outcome::failed(e.to_string())
            }
        }
    }

    // ── Environment actions (no matching) ──────────────────────────────────

    async fn wait(&self, step: &Step) -> DeskPilotResult<Outcome> {
        let Some(Payload::DurationMs(ms)) = &step.payload else {
            return Ok(Outcome::failed("wait step without a duration"));
        };
        tracing::info!(ms = *ms, "waiting");
        self.input.sleep(Duration::from_millis(*ms)).await;
        Ok(Outcome::Success)
    }

    async fn open_app(&self, step: &Step) -> DeskPilotResult<Outcome> {
        let app = match (&step.target_description, &step.payload) {
            (Some(name), _) => name.as_str(),
            (None, Some(Payload::Text(name))) => name.as_str(),
            _ => return Ok(Outcome::failed("open_app step without an application name")),
        };
        self.launcher.launch(app).await?;
        Ok(Outcome::Success)
    }

    // ── Element actions ────────────────────────────────────────────────────

    async fn click(&self, step: &Step, elements: &[DetectedElement]) -> DeskPilotResult<Outcome> {
        let Some(query) = TargetQuery::from_step(step) else {
            return Ok(Outcome::failed("click step without a target"));
        };
        match self.resolve(&query, elements) {
            Resolved::Element(element) => {
                self.click_element(element).await?;
                Ok(Outcome::Success)
            }
            Resolved::Stop(outcome) => Ok(outcome),
        }
    }

    async fn type_text(&self, step: &Step, elements: &[DetectedElement]) -> DeskPilotResult<Outcome> {
        let text = match &step.payload {
            Some(Payload::Text(text)) | Some(Payload::Keys(text)) => text,
            _ => return Ok(Outcome::failed("type step without text")),
        };
        if let Some(stop) = self.focus_target(step, elements).await? {
            return Ok(stop);
        }
        self.input.type_text(text).await?;
        Ok(Outcome::Success)
    }

    async fn key_press(&self, step: &Step, elements: &[DetectedElement]) -> DeskPilotResult<Outcome> {
        let combo: KeyCombo = match &step.payload {
            Some(Payload::Keys(keys)) | Some(Payload::Text(keys)) => keys.parse()?,
            _ => return Ok(Outcome::failed("key_press step without keys")),
        };
        if let Some(stop) = self.focus_target(step, elements).await? {
            return Ok(stop);
        }
        self.input.send_keys(&combo).await?;
        Ok(Outcome::Success)
    }

    /// Best-effort: the whole description first, then its significant words
    /// when the whole finds nothing. A tie on the whole stops as ambiguous.
    async fn custom(&self, step: &Step, elements: &[DetectedElement]) -> DeskPilotResult<Outcome> {
        let description = match (&step.target_description, &step.payload) {
            (Some(d), _) => d.clone(),
            (None, Some(Payload::Text(d))) => d.clone(),
            _ => return Ok(Outcome::failed("custom step without a description")),
        };

        let mut query = TargetQuery::parse(&description);
        if let Some(hint) = &step.hint {
            query.near = hint.near;
            query.element_type = hint.element_type.or(query.element_type);
        }
        match self.matcher.resolve(&query, elements) {
            MatchResult::Unique(element) => {
                self.click_element(element).await?;
                return Ok(Outcome::Success);
            }
            MatchResult::Ambiguous(candidates) => return Ok(Outcome::Ambiguous { candidates }),
            MatchResult::NoMatch => {}
        }

        for word in normalize(&description)
            .split(' ')
            .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        {
            let keyword = TargetQuery {
                text: word.to_string(),
                element_type: None,
                near: None,
            };
            if let MatchResult::Unique(element) = self.matcher.resolve(&keyword, elements) {
                tracing::info!(keyword = word, text = %element.text, "custom step matched keyword");
                self.click_element(element).await?;
                return Ok(Outcome::Success);
            }
        }

        Ok(Outcome::failed(NO_MATCH))
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    fn resolve<'a>(&self, query: &TargetQuery, elements: &'a [DetectedElement]) -> Resolved<'a> {
        match self.matcher.resolve(query, elements) {
            MatchResult::Unique(element) => Resolved::Element(element),
            MatchResult::NoMatch => Resolved::Stop(Outcome::failed(NO_MATCH)),
            MatchResult::Ambiguous(candidates) => Resolved::Stop(Outcome::Ambiguous { candidates }),
        }
    }

    /// Clicks the step's target if it names one. `Some` carries a stopping outcome.
    async fn focus_target(
        &self,
        step: &Step,
        elements: &[DetectedElement],
    ) -> DeskPilotResult<Option<Outcome>> {
        if step.target_description.is_none() {
            return Ok(None);
        }
        let Some(query) = TargetQuery::from_step(step) else {
            return Ok(Some(Outcome::failed("unusable target description")));
        };
        match self.resolve(&query, elements) {
            Resolved::Element(element) => {
                self.click_element(element).await?;
                Ok(None)
            }
            Resolved::Stop(outcome) => Ok(Some(outcome)),
        }
    }

    async fn click_element(&self, element: &DetectedElement) -> DeskPilotResult<()> {
        let at = element.center();
        tracing::info!(text = %element.text, x = at.x, y = at.y, "clicking element");
        self.input
            .move_click(at)
            .await
            .map_err(|e| DeskPilotError::Input(format!("click at ({}, {}): {e}", at.x, at.y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::{BoundingBox, ElementType, Point};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        actions: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InputDriver for Recorder {
        async fn move_click(&self, at: Point) -> DeskPilotResult<()> {
            if self.fail {
                return Err(DeskPilotError::Input("no display".into()));
            }
            self.actions.lock().unwrap().push(format!("click {},{}", at.x, at.y));
            Ok(())
        }

        async fn type_text(&self, text: &str) -> DeskPilotResult<()> {
            self.actions.lock().unwrap().push(format!("type {text}"));
            Ok(())
        }

        async fn send_keys(&self, combo: &KeyCombo) -> DeskPilotResult<()> {
            self.actions.lock().unwrap().push(format!("keys {combo}"));
            Ok(())
        }

        async fn sleep(&self, duration: Duration) {
            self.actions
                .lock()
                .unwrap()
                .push(format!("sleep {}", duration.as_millis()));
        }
    }

    #[async_trait]
    impl AppLauncher for Recorder {
        async fn launch(&self, app: &str) -> DeskPilotResult<()> {
            self.actions.lock().unwrap().push(format!("launch {app}"));
            Ok(())
        }
    }

    fn executor(recorder: Arc<Recorder>) -> ActionExecutor {
        let cfg = ExecutorConfig {
            settle_delay_ms: 0,
            ..ExecutorConfig::default()
        };
        ActionExecutor::new(recorder.clone(), recorder, &cfg)
    }

    fn elem(x: i32, text: &str, element_type: ElementType) -> DetectedElement {
        DetectedElement {
            bbox: BoundingBox::new(x, 0, 40, 20),
            element_type,
            text: text.into(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_open_app_bypasses_matching() {
        let rec = Arc::new(Recorder::default());
        let outcome = executor(rec.clone()).execute(&Step::open_app("terminal"), &[]).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rec.actions(), vec!["launch terminal"]);
    }

    #[tokio::test]
    async fn test_click_hits_element_centre() {
        let rec = Arc::new(Recorder::default());
        let elements = vec![elem(100, "Run", ElementType::Button)];
        let outcome = executor(rec.clone()).execute(&Step::click("Run button"), &elements).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rec.actions(), vec!["click 120,10"]);
    }

    #[tokio::test]
    async fn test_ambiguous_never_clicks() {
        let rec = Arc::new(Recorder::default());
        let elements = vec![
            elem(0, "OK", ElementType::Button),
            elem(300, "OK", ElementType::Button),
        ];
        let outcome = executor(rec.clone()).execute(&Step::click("OK"), &elements).await;
        assert!(matches!(outcome, Outcome::Ambiguous { ref candidates } if candidates.len() == 2));
        assert!(rec.actions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_element_set_is_no_match() {
        let rec = Arc::new(Recorder::default());
        let outcome = executor(rec.clone()).execute(&Step::click("Run"), &[]).await;
        assert_eq!(outcome, Outcome::failed(NO_MATCH));
    }

    #[tokio::test]
    async fn test_type_into_target_clicks_first() {
        let rec = Arc::new(Recorder::default());
        let elements = vec![elem(0, "Search", ElementType::Input)];
        let step = Step::type_text("hello", Some("search field".into()));
        let outcome = executor(rec.clone()).execute(&step, &elements).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rec.actions(), vec!["click 20,10", "type hello"]);
    }

    #[tokio::test]
    async fn test_key_press_and_bad_combo() {
        let rec = Arc::new(Recorder::default());
        let exec = executor(rec.clone());
        assert_eq!(exec.execute(&Step::key_press("ctrl+alt+t"), &[]).await, Outcome::Success);
        assert!(matches!(
            exec.execute(&Step::key_press("warp+speed"), &[]).await,
            Outcome::Failed { .. }
        ));
        assert_eq!(rec.actions(), vec!["keys ctrl+alt+t"]);
    }

    #[tokio::test]
    async fn test_input_error_becomes_failed() {
        let rec = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let elements = vec![elem(0, "Run", ElementType::Button)];
        let outcome = executor(rec).execute(&Step::click("Run"), &elements).await;
        assert!(matches!(outcome, Outcome::Failed { ref reason } if reason.contains("no display")));
    }

    #[tokio::test]
    async fn test_custom_step_falls_back_to_keyword() {
        let rec = Arc::new(Recorder::default());
        let elements = vec![
            elem(0, "Downloads", ElementType::Button),
            elem(200, "Settings", ElementType::Button),
        ];
        let outcome = executor(rec.clone())
            .execute(&Step::custom("show me my settings please"), &elements)
            .await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rec.actions(), vec!["click 220,10"]);
    }

    #[tokio::test]
    async fn test_custom_step_tie_stops_before_keywords() {
        let rec = Arc::new(Recorder::default());
        let elements = vec![
            elem(0, "Open Settings", ElementType::Button),
            elem(300, "Open Settings", ElementType::Button),
            elem(600, "Settings", ElementType::Button),
        ];
        let outcome = executor(rec.clone())
            .execute(&Step::custom("open settings"), &elements)
            .await;
        match outcome {
            Outcome::Ambiguous { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.iter().all(|c| c.text == "Open Settings"));
            }
            other => panic!("expected ambiguous outcome, got {other:?}"),
        }
        assert!(rec.actions().is_empty());
    }

    #[tokio::test]
    async fn test_wait_uses_payload_duration() {
        let rec = Arc::new(Recorder::default());
        let outcome = executor(rec.clone())
            .execute(&Step::wait(Duration::from_millis(1500)), &[])
            .await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(rec.actions(), vec!["sleep 1500"]);
    }
}
