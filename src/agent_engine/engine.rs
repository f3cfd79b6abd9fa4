use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::agent_engine::history::{RunLog, RunLogEntry};
use crate::agent_engine::loop_control::{CancelFlag, Decision, LoopController, LoopLimits};
use crate::agent_engine::state::{Outcome, Plan, RunReport, RunStatus, Step, Task};
use crate::config::AppConfig;
use crate::errors::DeskPilotResult;
use crate::executor::action::ActionExecutor;
use crate::executor::input::EnigoDriver;
use crate::executor::launcher::CommandLauncher;
use crate::perception::detector::ElementDetector;
use crate::perception::screenshot::ScreenObserver;
use crate::perception::types::ScreenState;
use crate::perception::vision::LocalVision;
use crate::planner::{build_planner, summarize_elements, PlanContext, TaskPlanner};

/// Elements listed in the screen summary handed to replans.
const SCREEN_SUMMARY_LIMIT: usize = 40;

/// Where the loop is between iterations.
#[derive(Debug)]
enum Phase {
    Attempting,
    Replanning,
    Finished {
        status: RunStatus,
        reason: Option<String>,
    },
}

impl Phase {
    fn failed(reason: impl Into<String>) -> Self {
        Phase::Finished {
            status: RunStatus::Failed,
            reason: Some(reason.into()),
        }
    }
}

/// Mutable state of one run. Owned by `ControlLoop::run`, so a loop can
/// serve several runs without sharing anything between them.
struct RunState {
    log: RunLog,
    controller: LoopController,
    plan: Plan,
    revision: u32,
    /// Global index of the current plan's first step.
    base: usize,
    cursor: usize,
    /// Attempts made on the step under the cursor.
    attempt: u32,
    /// Step rewritten to a single candidate after an ambiguous match.
    narrowed: Option<Step>,
    replans: u32,
    last_screen: Option<String>,
}

impl RunState {
    fn index(&self) -> usize {
        self.base + self.cursor
    }

    fn advance(&mut self) {
        self.cursor += 1;
        self.attempt = 0;
        self.narrowed = None;
    }

    fn adopt(&mut self, plan: Plan) {
        self.base += self.cursor;
        self.cursor = 0;
        self.plan = plan;
        self.revision += 1;
        self.attempt = 0;
        self.narrowed = None;
    }
}

/// Plan, perceive, act, verify. One `run` per task.
pub struct ControlLoop {
    planner: Arc<dyn TaskPlanner>,
    observer: ScreenObserver,
    detector: ElementDetector,
    executor: ActionExecutor,
    limits: LoopLimits,
    run_log_dir: Option<PathBuf>,
}

impl ControlLoop {
    pub fn new(
        planner: Arc<dyn TaskPlanner>,
        observer: ScreenObserver,
        detector: ElementDetector,
        executor: ActionExecutor,
        limits: LoopLimits,
    ) -> Self {
        Self {
            planner,
            observer,
            detector,
            executor,
            limits,
            run_log_dir: None,
        }
    }

    /// Persist each run's log as JSON lines under `dir`.
    pub fn with_run_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.run_log_dir = dir;
        self
    }

    /// Wires the desktop-backed components described by `cfg`.
    pub fn from_config(cfg: &AppConfig) -> DeskPilotResult<Self> {
        let planner = build_planner(cfg)?;
        let artifact_dir = cfg.diagnostics.artifact_dir.clone();

        let observer =
            ScreenObserver::from_config(&cfg.capture).with_artifact_dir(artifact_dir.clone());
        let vision = Arc::new(LocalVision::from_config(&cfg.detection));
        let detector = ElementDetector::new(vision, &cfg.detection).with_artifact_dir(artifact_dir);
        let executor = ActionExecutor::new(
            Arc::new(EnigoDriver),
            Arc::new(CommandLauncher::from_config(&cfg.executor)),
            &cfg.executor,
        );

        let run_log_dir = cfg
            .diagnostics
            .persist_run_log
            .then(|| cfg.diagnostics.resolved_run_log_dir());

        Ok(Self::new(
            planner,
            observer,
            detector,
            executor,
            LoopLimits::from_config(cfg),
        )
        .with_run_log_dir(run_log_dir))
    }

    /// Drives `task` to a terminal status. Never panics on component
    /// failures; they end up in the report's log or abort reason.
    pub async fn run(&self, task: Task, cancel: &CancelFlag) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let mut log = RunLog::new(run_id.clone());
        if let Some(dir) = &self.run_log_dir {
            log = log.persisted_in(dir);
        }
        tracing::info!(run_id = %run_id, task = %task, planner = self.planner.name(), "run started");

        // ── Initial plan ─────────────────────────────────────────────────
        if cancel.is_cancelled() {
            tracing::info!(run_id = %run_id, "cancelled before planning");
            return report(run_id, &task, RunStatus::Cancelled, log, 0, None);
        }

        let plan = match self.planner.plan(&task, None).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "initial planning failed");
                let reason = format!("planning failed: {e}");
                return report(run_id, &task, RunStatus::Failed, log, 0, Some(reason));
            }
        };
        log_plan(&plan, 0);

        let mut run = RunState {
            log,
            controller: LoopController::new(self.limits),
            plan,
            revision: 0,
            base: 0,
            cursor: 0,
            attempt: 0,
            narrowed: None,
            replans: 0,
            last_screen: None,
        };

        // ── Main loop ────────────────────────────────────────────────────
        let mut phase = Phase::Attempting;
        let (status, reason) = loop {
            phase = match phase {
                Phase::Attempting => self.attempt_step(cancel, &mut run).await,
                Phase::Replanning => self.replan(&task, cancel, &mut run).await,
                Phase::Finished { status, reason } => break (status, reason),
            };
        };

        tracing::info!(
            run_id = %run_id,
            status = ?status,
            attempts = run.controller.total_attempts(),
            replans = run.replans,
            reason = reason.as_deref().unwrap_or(""),
            "run finished"
        );
        report(run_id, &task, status, run.log, run.replans, reason)
    }

    // ── Attempting: observe, act, verify, decide ─────────────────────────

    async fn attempt_step(&self, cancel: &CancelFlag, run: &mut RunState) -> Phase {
        let Some(plan_step) = run.plan.get(run.cursor).cloned() else {
            return Phase::Finished {
                status: RunStatus::Success,
                reason: None,
            };
        };
        let index = run.index();

        if cancel.is_cancelled() {
            tracing::info!(step = index, "run cancelled");
            run.log.push(RunLogEntry::new(
                index,
                run.revision,
                run.attempt + 1,
                &plan_step,
                Outcome::Cancelled,
            ));
            return Phase::Finished {
                status: RunStatus::Cancelled,
                reason: None,
            };
        }

        if let Err(reason) = run.controller.admit_attempt() {
            return Phase::failed(reason);
        }
        run.attempt += 1;

        let step = run.narrowed.clone().unwrap_or_else(|| plan_step.clone());
        tracing::debug!(step = index, attempt = run.attempt, action = %step, "attempting step");

        let (outcome, capture_failed) = self.perform(&step, run).await;
        tracing::info!(
            step = index,
            revision = run.revision,
            attempt = run.attempt,
            kind = %plan_step.kind,
            outcome = %outcome,
            "step attempt finished"
        );
        run.log.push(RunLogEntry::new(
            index,
            run.revision,
            run.attempt,
            &plan_step,
            outcome.clone(),
        ));

        match run.controller.decide(&plan_step, &outcome, capture_failed) {
            Decision::Advance => {
                run.advance();
                Phase::Attempting
            }
            Decision::Retry => Phase::Attempting,
            Decision::Narrow => {
                if let Outcome::Ambiguous { candidates } = &outcome {
                    if let Some(best) = candidates.first() {
                        let narrowed = plan_step.narrowed_to(best);
                        tracing::info!(step = index, narrowed = %narrowed, "narrowing ambiguous target");
                        run.narrowed = Some(narrowed);
                    }
                }
                Phase::Attempting
            }
            Decision::Replan => Phase::Replanning,
            Decision::Abort(reason) => {
                tracing::warn!(step = index, reason = %reason, "aborting run");
                Phase::failed(reason)
            }
        }
    }

    /// One attempt. The flag reports whether the screen could not be captured.
    async fn perform(&self, step: &Step, run: &mut RunState) -> (Outcome, bool) {
        // Only a screen observed by this attempt may reach a replan.
        run.last_screen = None;
        if !step.needs_observation() {
            return (self.executor.execute(step, &[]).await, false);
        }

        let frame = match self.observer.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "screen capture failed");
                let outcome = if e.is_timeout() {
                    Outcome::Timeout {
                        what: "screen capture".into(),
                    }
                } else {
                    Outcome::failed(e.to_string())
                };
                return (outcome, true);
            }
        };

        let elements = match self.detector.detect(&frame).await {
            Ok(elements) => elements,
            Err(e) if e.is_timeout() => {
                tracing::warn!(error = %e, "element detection timed out");
                let outcome = Outcome::Timeout {
                    what: "element detection".into(),
                };
                return (outcome, false);
            }
            Err(e) => {
                tracing::warn!(error = %e, "element detection failed");
                return (Outcome::failed(e.to_string()), false);
            }
        };

        let screen = ScreenState { frame, elements };
        tracing::debug!(
            observed_at = %screen.observed_at(),
            source = %screen.frame.source,
            elements = screen.elements.len(),
            "screen observed"
        );
        run.last_screen = Some(summarize_elements(&screen.elements, SCREEN_SUMMARY_LIMIT));

        (self.executor.execute(step, &screen.elements).await, false)
    }

    // ── Replanning ───────────────────────────────────────────────────────

    async fn replan(&self, task: &Task, cancel: &CancelFlag, run: &mut RunState) -> Phase {
        if cancel.is_cancelled() {
            // Recorded against the cursor step on the next attempt.
            return Phase::Attempting;
        }
        run.replans += 1;
        tracing::info!(step = run.index(), replans = run.replans, "replanning");

        let context = PlanContext {
            log: &run.log,
            screen: run.last_screen.as_deref(),
        };
        match self.planner.plan(task, Some(context)).await {
            Ok(plan) => {
                run.adopt(plan);
                log_plan(&run.plan, run.revision);
                Phase::Attempting
            }
            Err(e) => {
                tracing::error!(error = %e, "replanning failed");
                Phase::failed(format!("replanning failed: {e}"))
            }
        }
    }
}

fn log_plan(plan: &Plan, revision: u32) {
    tracing::info!(revision, steps = plan.len(), "plan ready");
    for (i, step) in plan.steps().iter().enumerate() {
        tracing::debug!(revision, index = i, step = %step, "planned step");
    }
}

fn report(
    run_id: String,
    task: &Task,
    status: RunStatus,
    log: RunLog,
    replans: u32,
    abort_reason: Option<String>,
) -> RunReport {
    RunReport {
        run_id,
        task: task.to_string(),
        status,
        log: log.into_entries(),
        replans,
        abort_reason,
    }
}
