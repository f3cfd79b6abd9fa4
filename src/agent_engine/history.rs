use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{Outcome, Step, StepKind};
use crate::errors::DeskPilotResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Position in the run, stable across replans.
    pub step_index: usize,
    pub plan_revision: u32,
    /// 1-based attempt number for this step index within its plan revision.
    pub attempt: u32,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl RunLogEntry {
    pub fn new(step_index: usize, plan_revision: u32, attempt: u32, step: &Step, outcome: Outcome) -> Self {
        Self {
            step_index,
            plan_revision,
            attempt,
            kind: step.kind,
            target: step.target_description.clone(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// Whether this entry records `step` succeeding.
    pub fn succeeded(&self, step: &Step) -> bool {
        self.outcome.is_success()
            && step.kind == self.kind
            && normalize(step.target_description.as_deref()) == normalize(self.target.as_deref())
    }
}

fn normalize(s: Option<&str>) -> String {
    s.unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Append-only record of every attempt in one run, mirrored to a JSONL file.
#[derive(Debug)]
pub struct RunLog {
    pub run_id: String,
    entries: Vec<RunLogEntry>,
    file_path: Option<PathBuf>,
}

impl RunLog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            entries: Vec::new(),
            file_path: None,
        }
    }

    /// Mirrors entries to `<dir>/run_<run_id>.jsonl`.
    pub fn persisted_in(mut self, dir: &Path) -> Self {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "run log directory unavailable; log kept in memory only");
            return self;
        }
        self.file_path = Some(dir.join(format!("run_{}.jsonl", self.run_id)));
        self
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn push(&mut self, entry: RunLogEntry) {
        self.entries.push(entry);
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "could not persist run log entry");
        }
    }

    /// Append the latest entry to the JSONL file.
    fn flush(&self) -> DeskPilotResult<()> {
        let (Some(path), Some(last)) = (&self.file_path, self.entries.last()) else {
            return Ok(());
        };
        let line = serde_json::to_string(last)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        tracing::trace!(path = %path.display(), "run log entry flushed");
        Ok(())
    }

    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<RunLogEntry> {
        self.entries
    }

    /// Successful entries in order.
    pub fn successes(&self) -> impl Iterator<Item = &RunLogEntry> {
        self.entries.iter().filter(|e| e.outcome.is_success())
    }

    /// The most recent non-successful attempts, oldest first, one per line.
    pub fn failure_summary(&self, limit: usize) -> String {
        let failures: Vec<&RunLogEntry> = self
            .entries
            .iter()
            .filter(|e| !e.outcome.is_success())
            .collect();
        let skip = failures.len().saturating_sub(limit);
        failures
            .into_iter()
            .skip(skip)
            .map(|e| {
                format!(
                    "step {} {} {} attempt {}: {}",
                    e.step_index,
                    e.kind,
                    e.target.as_deref().map(|t| format!("{t:?}")).unwrap_or_default(),
                    e.attempt,
                    e.outcome
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_appended_to_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::new("abc").persisted_in(dir.path());
        let step = Step::click("OK");
        log.push(RunLogEntry::new(0, 0, 1, &step, Outcome::failed("no matching element")));
        log.push(RunLogEntry::new(0, 0, 2, &step, Outcome::Success));

        let text = std::fs::read_to_string(dir.path().join("run_abc.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: RunLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.attempt, 1);
        assert_eq!(first.outcome, Outcome::failed("no matching element"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_failure_summary_keeps_latest() {
        let mut log = RunLog::new("x");
        let step = Step::click("Run");
        for attempt in 1..=4 {
            log.push(RunLogEntry::new(1, 0, attempt, &step, Outcome::failed("no matching element")));
        }
        log.push(RunLogEntry::new(1, 0, 5, &step, Outcome::Success));

        let summary = log.failure_summary(2);
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.starts_with("step 1 click \"Run\" attempt 3"));
    }

    #[test]
    fn test_succeeded_matches_kind_and_target() {
        let entry = RunLogEntry::new(0, 0, 1, &Step::open_app("Terminal"), Outcome::Success);
        assert!(entry.succeeded(&Step::open_app("terminal")));
        assert!(!entry.succeeded(&Step::click("terminal")));
    }
}
