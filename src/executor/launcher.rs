use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ExecutorConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};

/// A process still alive after this long counts as launched.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(750);

#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn launch(&self, app: &str) -> DeskPilotResult<()>;
}

/// Spawns applications as detached child processes.
pub struct CommandLauncher {
    aliases: HashMap<String, Vec<String>>,
    timeout: Duration,
}

impl CommandLauncher {
    pub fn new(aliases: HashMap<String, Vec<String>>, timeout: Duration) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { aliases, timeout }
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        Self::new(
            cfg.app_aliases.clone(),
            Duration::from_millis(cfg.launch_timeout_ms),
        )
    }

    /// Command lines to try, in order. Alias entries may carry arguments.
    pub fn candidates(&self, app: &str) -> Vec<Vec<String>> {
        let name = app.trim();
        let key = name.to_lowercase();
        let lines: Vec<String> = match self.aliases.get(&key) {
            Some(list) => list.clone(),
            None if name == key => vec![name.to_string()],
            None => vec![name.to_string(), key],
        };
        lines
            .iter()
            .map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|argv| !argv.is_empty())
            .collect()
    }

    async fn try_spawn(argv: &[String]) -> DeskPilotResult<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DeskPilotError::Launch("empty command".into()))?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DeskPilotError::Launch(format!("{program}: {e}")))?;

        match tokio::time::timeout(EARLY_EXIT_WINDOW, child.wait()).await {
            Err(_) => Ok(()),
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(DeskPilotError::Launch(format!("{program} exited with {status}"))),
            Ok(Err(e)) => Err(DeskPilotError::Launch(format!("{program}: {e}"))),
        }
    }
}

#[async_trait]
impl AppLauncher for CommandLauncher {
    async fn launch(&self, app: &str) -> DeskPilotResult<()> {
        let candidates = self.candidates(app);
        if candidates.is_empty() {
            return Err(DeskPilotError::Launch(format!("nothing to launch for {app:?}")));
        }

        let attempt = async {
            let mut errors = Vec::new();
            for argv in &candidates {
                match Self::try_spawn(argv).await {
                    Ok(()) => {
                        tracing::info!(app, command = %argv.join(" "), "application launched");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(app, error = %e, "launch candidate failed");
                        errors.push(e.to_string());
                    }
                }
            }
            Err(DeskPilotError::Launch(errors.join("; ")))
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| DeskPilotError::Launch(format!("launching {app:?} timed out")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher() -> CommandLauncher {
        let mut aliases = HashMap::new();
        aliases.insert(
            "Terminal".to_string(),
            vec!["definitely-not-a-terminal".to_string(), "true --flag".to_string()],
        );
        CommandLauncher::new(aliases, Duration::from_secs(5))
    }

    #[test]
    fn test_alias_lookup_is_case_insensitive() {
        let c = launcher().candidates("terminal");
        assert_eq!(c.len(), 2);
        assert_eq!(c[1], vec!["true".to_string(), "--flag".to_string()]);
    }

    #[test]
    fn test_unknown_app_tries_given_and_lowercase_names() {
        let c = launcher().candidates("Firefox");
        assert_eq!(c, vec![vec!["Firefox".to_string()], vec!["firefox".to_string()]]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_through_to_working_candidate() {
        launcher().launch("terminal").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_nonzero_exit_is_failure() {
        let l = CommandLauncher::new(HashMap::new(), Duration::from_secs(5));
        let err = l.launch("false").await.unwrap_err();
        assert!(matches!(err, DeskPilotError::Launch(_)));
    }
}
