use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_engine::history::RunLogEntry;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::types::{DetectedElement, ElementType, Point};

/// A free-form instruction. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task(String);

impl Task {
    pub fn new(text: impl Into<String>) -> DeskPilotResult<Self> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(DeskPilotError::Agent("task text is empty".into()));
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Click,
    Type,
    KeyPress,
    Wait,
    OpenApp,
    Custom,
}

impl StepKind {
    /// Unknown kinds become `Custom`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "click" | "tap" | "select" => StepKind::Click,
            "type" | "type_text" | "input" | "enter_text" => StepKind::Type,
            "key_press" | "keypress" | "key" | "hotkey" | "press" => StepKind::KeyPress,
            "wait" | "sleep" | "pause" => StepKind::Wait,
            "open_app" | "launch" | "open" | "run" | "start" => StepKind::OpenApp,
            _ => StepKind::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Click => "click",
            StepKind::Type => "type",
            StepKind::KeyPress => "key_press",
            StepKind::Wait => "wait",
            StepKind::OpenApp => "open_app",
            StepKind::Custom => "custom",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured narrowing of a target description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementType>,
    /// Screen point the target is expected near.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near: Option<Point>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Keys(String),
    DurationMs(u64),
}

/// One abstract intended UI action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<TargetHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Falls back to `planner.step_max_retries` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Step {
    fn bare(kind: StepKind) -> Self {
        Self {
            kind,
            target_description: None,
            hint: None,
            payload: None,
            max_retries: None,
        }
    }

    pub fn click(target: impl Into<String>) -> Self {
        Self {
            target_description: Some(target.into()),
            ..Self::bare(StepKind::Click)
        }
    }

    pub fn type_text(text: impl Into<String>, target: Option<String>) -> Self {
        Self {
            target_description: target,
            payload: Some(Payload::Text(text.into())),
            ..Self::bare(StepKind::Type)
        }
    }

    pub fn key_press(keys: impl Into<String>) -> Self {
        Self {
            payload: Some(Payload::Keys(keys.into())),
            ..Self::bare(StepKind::KeyPress)
        }
    }

    pub fn wait(duration: Duration) -> Self {
        Self {
            payload: Some(Payload::DurationMs(duration.as_millis() as u64)),
            ..Self::bare(StepKind::Wait)
        }
    }

    pub fn open_app(name: impl Into<String>) -> Self {
        Self {
            target_description: Some(name.into()),
            ..Self::bare(StepKind::OpenApp)
        }
    }

    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            target_description: Some(text.into()),
            ..Self::bare(StepKind::Custom)
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Whether executing this step needs a fresh observation of the screen.
    pub fn needs_observation(&self) -> bool {
        match self.kind {
            StepKind::Wait | StepKind::OpenApp => false,
            StepKind::Type | StepKind::KeyPress => self.target_description.is_some(),
            StepKind::Click | StepKind::Custom => true,
        }
    }

    /// Same kind and same target up to case and whitespace.
    pub fn is_equivalent(&self, other: &Step) -> bool {
        self.kind == other.kind
            && normalized_target(self.target_description.as_deref())
                == normalized_target(other.target_description.as_deref())
    }

    /// Copy of this step narrowed onto one candidate element.
    pub fn narrowed_to(&self, candidate: &DetectedElement) -> Step {
        let mut step = self.clone();
        if !candidate.text.trim().is_empty() {
            step.target_description = Some(candidate.text.trim().to_string());
        }
        step.hint = Some(TargetHint {
            element_type: Some(candidate.element_type),
            near: Some(candidate.center()),
        });
        step
    }
}

fn normalized_target(target: Option<&str>) -> Option<String> {
    target.map(|t| t.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(target) = &self.target_description {
            write!(f, " {target:?}")?;
        }
        match &self.payload {
            Some(Payload::Text(text)) => write!(f, " text={text:?}"),
            Some(Payload::Keys(keys)) => write!(f, " keys={keys}"),
            Some(Payload::DurationMs(ms)) => write!(f, " {ms}ms"),
            None => Ok(()),
        }
    }
}

/// Ordered, non-empty sequence of steps. Never mutated after planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> DeskPilotResult<Self> {
        if steps.is_empty() {
            return Err(DeskPilotError::Planning("empty plan".into()));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed { reason: String },
    /// Candidates ordered best first.
    Ambiguous { candidates: Vec<DetectedElement> },
    Timeout { what: String },
    /// Recorded for the step under the cursor when a run is cancelled.
    Cancelled,
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failed { reason } => write!(f, "failed ({reason})"),
            Outcome::Ambiguous { candidates } => {
                let labels: Vec<String> =
                    candidates.iter().map(|c| format!("{:?}", c.text)).collect();
                write!(f, "ambiguous ({})", labels.join(", "))
            }
            Outcome::Timeout { what } => write!(f, "timeout ({what})"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 130,
        }
    }
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    pub log: Vec<RunLogEntry>,
    pub replans: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::BoundingBox;

    #[test]
    fn test_empty_task_and_plan_rejected() {
        assert!(Task::new("   ").is_err());
        assert!(matches!(Plan::new(vec![]), Err(DeskPilotError::Planning(_))));
    }

    #[test]
    fn test_step_kind_parse_coerces_unknown() {
        assert_eq!(StepKind::parse("Key-Press"), StepKind::KeyPress);
        assert_eq!(StepKind::parse("launch"), StepKind::OpenApp);
        assert_eq!(StepKind::parse("drag"), StepKind::Custom);
    }

    #[test]
    fn test_observation_needs() {
        assert!(!Step::open_app("terminal").needs_observation());
        assert!(!Step::wait(Duration::from_secs(1)).needs_observation());
        assert!(!Step::type_text("hi", None).needs_observation());
        assert!(Step::type_text("hi", Some("search".into())).needs_observation());
        assert!(Step::click("OK").needs_observation());
    }

    #[test]
    fn test_equivalence_ignores_case_and_spacing() {
        assert!(Step::click("Run  Button").is_equivalent(&Step::click("run button")));
        assert!(!Step::click("Run").is_equivalent(&Step::custom("Run")));
    }

    #[test]
    fn test_narrowing_uses_candidate_attributes() {
        let candidate = DetectedElement {
            bbox: BoundingBox::new(100, 100, 40, 20),
            element_type: ElementType::Button,
            text: " Save ".into(),
            confidence: 0.8,
        };
        let narrowed = Step::click("save").narrowed_to(&candidate);
        assert_eq!(narrowed.target_description.as_deref(), Some("Save"));
        let hint = narrowed.hint.unwrap();
        assert_eq!(hint.element_type, Some(ElementType::Button));
        assert_eq!(hint.near, Some(Point { x: 120, y: 110 }));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(Outcome::failed("no matching element")).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "no matching element");
    }
}
