use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent_engine::state::{Outcome, Step};
use crate::config::AppConfig;

/// Cooperative stop signal shared between a run and whoever drives it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub step_max_retries: u32,
    pub max_total_attempts: u32,
    pub max_consecutive_capture_failures: u32,
    pub max_stalled_replans: u32,
}

impl LoopLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            step_max_retries: cfg.planner.step_max_retries,
            max_total_attempts: cfg.control.max_total_attempts,
            max_consecutive_capture_failures: cfg.control.max_consecutive_capture_failures,
            max_stalled_replans: cfg.control.max_stalled_replans,
        }
    }
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What the loop does after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Advance,
    Retry,
    /// Retry once with the step narrowed onto the top ambiguous candidate.
    Narrow,
    Replan,
    Abort(String),
}

/// Retry, replan and abort policy. Holds counters only; never sees the screen.
pub struct LoopController {
    limits: LoopLimits,
    total_attempts: u32,
    failures: u32,
    narrowed: bool,
    consecutive_capture_failures: u32,
    stalled_replans: u32,
    last_replan_trigger: Option<Step>,
}

impl LoopController {
    pub fn new(limits: LoopLimits) -> Self {
        Self {
            limits,
            total_attempts: 0,
            failures: 0,
            narrowed: false,
            consecutive_capture_failures: 0,
            stalled_replans: 0,
            last_replan_trigger: None,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Failed attempts counted against the current step.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Checked before each attempt; `Err` carries the abort reason.
    pub fn admit_attempt(&mut self) -> Result<(), String> {
        if self.total_attempts >= self.limits.max_total_attempts {
            return Err(format!(
                "attempt ceiling of {} reached",
                self.limits.max_total_attempts
            ));
        }
        self.total_attempts += 1;
        Ok(())
    }

    pub fn decide(&mut self, step: &Step, outcome: &Outcome, capture_failed: bool) -> Decision {
        if capture_failed {
            self.consecutive_capture_failures += 1;
            if self.consecutive_capture_failures >= self.limits.max_consecutive_capture_failures {
                return Decision::Abort(format!(
                    "screen capture failed {} times in a row",
                    self.consecutive_capture_failures
                ));
            }
        } else {
            self.consecutive_capture_failures = 0;
        }

        match outcome {
            Outcome::Success => {
                self.failures = 0;
                self.narrowed = false;
                self.stalled_replans = 0;
                self.last_replan_trigger = None;
                Decision::Advance
            }
            Outcome::Ambiguous { candidates } if !self.narrowed && !candidates.is_empty() => {
                self.narrowed = true;
                Decision::Narrow
            }
            Outcome::Cancelled => Decision::Abort("cancelled".into()),
            Outcome::Failed { .. } | Outcome::Timeout { .. } | Outcome::Ambiguous { .. } => {
                self.failures += 1;
                let limit = step.max_retries.unwrap_or(self.limits.step_max_retries).max(1);
                if self.failures < limit {
                    return Decision::Retry;
                }
                self.replan_or_abort(step)
            }
        }
    }

    fn replan_or_abort(&mut self, step: &Step) -> Decision {
        if let Some(previous) = &self.last_replan_trigger {
            if previous.is_equivalent(step) {
                return Decision::Abort(format!("replanned step {step} failed again"));
            }
        }
        if self.stalled_replans >= self.limits.max_stalled_replans {
            return Decision::Abort(format!(
                "{} replans without progress",
                self.stalled_replans
            ));
        }
        self.stalled_replans += 1;
        self.last_replan_trigger = Some(step.clone());
        self.failures = 0;
        self.narrowed = false;
        Decision::Replan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::{BoundingBox, DetectedElement, ElementType};

    fn limits() -> LoopLimits {
        LoopLimits {
            step_max_retries: 3,
            max_total_attempts: 50,
            max_consecutive_capture_failures: 3,
            max_stalled_replans: 2,
        }
    }

    fn no_match() -> Outcome {
        Outcome::failed("no matching element")
    }

    fn ambiguous() -> Outcome {
        let elem = DetectedElement {
            bbox: BoundingBox::new(0, 0, 10, 10),
            element_type: ElementType::Button,
            text: "OK".into(),
            confidence: 0.9,
        };
        Outcome::Ambiguous {
            candidates: vec![elem.clone(), elem],
        }
    }

    #[test]
    fn test_retries_up_to_limit_then_replans() {
        let mut ctl = LoopController::new(limits());
        let step = Step::click("Run");
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Retry);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Retry);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
    }

    #[test]
    fn test_step_override_of_retry_limit() {
        let mut ctl = LoopController::new(limits());
        let step = Step::click("Run").with_max_retries(1);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
    }

    #[test]
    fn test_ambiguity_narrows_once_then_counts() {
        let mut ctl = LoopController::new(limits());
        let step = Step::click("OK");
        assert_eq!(ctl.decide(&step, &ambiguous(), false), Decision::Narrow);
        assert_eq!(ctl.failures(), 0);
        assert_eq!(ctl.decide(&step, &ambiguous(), false), Decision::Retry);
        assert_eq!(ctl.failures(), 1);
    }

    #[test]
    fn test_equivalent_step_failing_after_replan_aborts() {
        let mut ctl = LoopController::new(limits());
        let step = Step::click("Run").with_max_retries(1);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
        assert!(matches!(ctl.decide(&step, &no_match(), false), Decision::Abort(_)));
    }

    #[test]
    fn test_stalled_replans_abort() {
        let mut ctl = LoopController::new(limits());
        for target in ["a", "b"] {
            let step = Step::click(target).with_max_retries(1);
            assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
        }
        let step = Step::click("c").with_max_retries(1);
        assert!(matches!(ctl.decide(&step, &no_match(), false), Decision::Abort(_)));
    }

    #[test]
    fn test_success_resets_progress() {
        let mut ctl = LoopController::new(limits());
        let step = Step::click("Run").with_max_retries(1);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
        assert_eq!(ctl.decide(&Step::click("Other"), &Outcome::Success, false), Decision::Advance);
        assert_eq!(ctl.decide(&step, &no_match(), false), Decision::Replan);
    }

    #[test]
    fn test_consecutive_capture_failures_abort() {
        let mut ctl = LoopController::new(LoopLimits {
            step_max_retries: 10,
            ..limits()
        });
        let step = Step::click("Run");
        let timeout = Outcome::Timeout {
            what: "capture".into(),
        };
        assert_eq!(ctl.decide(&step, &timeout, true), Decision::Retry);
        assert_eq!(ctl.decide(&step, &timeout, true), Decision::Retry);
        assert!(matches!(ctl.decide(&step, &timeout, true), Decision::Abort(_)));
    }

    #[test]
    fn test_attempt_ceiling() {
        let mut ctl = LoopController::new(LoopLimits {
            max_total_attempts: 2,
            ..limits()
        });
        assert!(ctl.admit_attempt().is_ok());
        assert!(ctl.admit_attempt().is_ok());
        assert!(ctl.admit_attempt().is_err());
        assert_eq!(ctl.total_attempts(), 2);
    }

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
