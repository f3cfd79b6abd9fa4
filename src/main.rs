use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use deskpilot::agent_engine::history::RunLogEntry;
use deskpilot::config::{self, AppConfig, PlannerStrategy};
use deskpilot::{CancelFlag, ControlLoop, DeskPilotResult, RunReport, RunStatus, Task};

/// DeskPilot - drive the desktop from a plain-language task
#[derive(Parser, Debug)]
#[command(name = "deskpilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Task to perform, e.g. "run terminal"
    #[arg(required_unless_present = "write_config", num_args = 1..)]
    task: Vec<String>,

    /// Config file path (defaults to config.toml next to the binary, then the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured planner
    #[arg(short, long, value_enum)]
    planner: Option<PlannerArg>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Write the effective configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlannerArg {
    Llm,
    Fallback,
}

impl From<PlannerArg> for PlannerStrategy {
    fn from(arg: PlannerArg) -> Self {
        match arg {
            PlannerArg::Llm => PlannerStrategy::Llm,
            PlannerArg::Fallback => PlannerStrategy::Fallback,
        }
    }
}

fn load(cli: &Cli) -> DeskPilotResult<AppConfig> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    if let Some(planner) = cli.planner {
        cfg.planner.strategy = planner.into();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    deskpilot::init_tracing();

    let cli = Cli::parse();
    if let Some(path) = &cli.write_config {
        let written = load(&cli).and_then(|cfg| config::save_config(&cfg, path));
        if let Err(e) = written {
            eprintln!("error: {e}");
            std::process::exit(RunStatus::Failed.exit_code());
        }
        println!("configuration written to {}", path.display());
        return;
    }

    let status = match run(&cli).await {
        Ok(report) => {
            print_report(&report, cli.json);
            report.status
        }
        Err(e) => {
            tracing::error!(error = %e, "deskpilot could not start");
            eprintln!("error: {e}");
            RunStatus::Failed
        }
    };
    std::process::exit(status.exit_code());
}

async fn run(cli: &Cli) -> DeskPilotResult<RunReport> {
    let task = Task::new(cli.task.join(" "))?;
    let cfg = load(cli)?;
    let control = ControlLoop::from_config(&cfg)?;

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current action");
            on_signal.cancel();
        }
    });

    Ok(control.run(task, &cancel).await)
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("error: cannot serialize report: {e}"),
        }
        return;
    }

    println!("run {} [{:?}] {}", report.run_id, report.status, report.task);
    for entry in &report.log {
        println!("  {}", describe(entry));
    }
    if report.replans > 0 {
        println!("replans: {}", report.replans);
    }
    if let Some(reason) = &report.abort_reason {
        println!("aborted: {reason}");
    }
}

fn describe(entry: &RunLogEntry) -> String {
    let target = entry
        .target
        .as_deref()
        .map(|t| format!(" {t:?}"))
        .unwrap_or_default();
    format!(
        "#{} r{} try {} {}{}: {}",
        entry.step_index, entry.plan_revision, entry.attempt, entry.kind, target, entry.outcome
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_needs_no_task() {
        let cli = Cli::try_parse_from(["deskpilot", "--write-config", "out.toml"]).unwrap();
        assert!(cli.task.is_empty());
        assert_eq!(cli.write_config, Some(PathBuf::from("out.toml")));
    }

    #[test]
    fn test_task_required_otherwise() {
        assert!(Cli::try_parse_from(["deskpilot"]).is_err());
        let cli = Cli::try_parse_from(["deskpilot", "run", "terminal", "--planner", "fallback"]).unwrap();
        assert_eq!(cli.task, vec!["run", "terminal"]);
        assert!(matches!(cli.planner, Some(PlannerArg::Fallback)));
    }

    #[test]
    fn test_written_config_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskpilot.toml");
        let cli = Cli::try_parse_from([
            "deskpilot",
            "--planner",
            "fallback",
            "--write-config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let cfg = load(&cli).unwrap();
        config::save_config(&cfg, &path).unwrap();

        let reloaded = config::load_config_from(&path).unwrap();
        assert_eq!(reloaded.planner.strategy, PlannerStrategy::Fallback);
    }
}
