use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStrategy {
    /// LLM-backed planner, with the deterministic planner behind it.
    #[default]
    Llm,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub strategy: PlannerStrategy,
    /// Attempts per step when the step itself does not set `max_retries`.
    #[serde(default = "default_step_max_retries")]
    pub step_max_retries: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            strategy: PlannerStrategy::default(),
            step_max_retries: default_step_max_retries(),
        }
    }
}

fn default_step_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            active_provider: String::new(),
            providers: HashMap::new(),
            roles: RolesConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    /// Full chat-completions endpoint URL.
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Overridden by DESKPILOT_<ID>_API_KEY; OPENAI_API_KEY is the last resort.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f64 {
    0.1
}

/// Maps agent roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Decomposes a task into steps.
    pub planning: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_timeout_ms")]
    pub timeout_ms: u64,
    /// Try `grim` before the generic capture library on Wayland sessions.
    #[serde(default = "default_true")]
    pub prefer_wayland: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_capture_timeout_ms(),
            prefer_wayland: true,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_capture_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Elements below this confidence are dropped, not flagged.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Overlap over the smaller box above which the weaker duplicate is dropped.
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f32,
    #[serde(default = "default_detection_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional YOLOv8 ONNX model used to segment the frame before OCR.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_model_confidence")]
    pub model_confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
    #[serde(default = "default_tesseract_bin")]
    pub tesseract_bin: String,
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            overlap_threshold: default_overlap_threshold(),
            timeout_ms: default_detection_timeout_ms(),
            model_path: None,
            model_confidence: default_model_confidence(),
            iou_threshold: default_iou_threshold(),
            class_names: default_class_names(),
            tesseract_bin: default_tesseract_bin(),
            ocr_language: default_ocr_language(),
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_confidence_threshold() -> f32 {
    0.4
}

fn default_overlap_threshold() -> f32 {
    0.7
}

fn default_detection_timeout_ms() -> u64 {
    10_000
}

fn default_model_confidence() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_class_names() -> Vec<String> {
    [
        "button", "input", "link", "icon", "checkbox", "menu", "menuitem", "text", "image",
        "container",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_tesseract_bin() -> String {
    "tesseract".into()
}

fn default_ocr_language() -> String {
    "eng".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Minimum similarity a candidate needs to count as a match.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Candidates scoring within this margin of the best are ambiguous.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f32,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    /// Application name → executables tried in order.
    #[serde(default = "default_app_aliases")]
    pub app_aliases: HashMap<String, Vec<String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            ambiguity_margin: default_ambiguity_margin(),
            settle_delay_ms: default_settle_delay_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            app_aliases: default_app_aliases(),
        }
    }
}

fn default_min_similarity() -> f32 {
    0.6
}

fn default_ambiguity_margin() -> f32 {
    0.05
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_launch_timeout_ms() -> u64 {
    5000
}

fn default_app_aliases() -> HashMap<String, Vec<String>> {
    let mut aliases = HashMap::new();
    aliases.insert(
        "terminal".to_string(),
        ["x-terminal-emulator", "gnome-terminal", "konsole", "xfce4-terminal", "xterm"]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    aliases.insert(
        "browser".to_string(),
        vec!["xdg-open".to_string(), "firefox".to_string()],
    );
    aliases
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Hard ceiling on step attempts across the whole run.
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
    #[serde(default = "default_max_consecutive_capture_failures")]
    pub max_consecutive_capture_failures: u32,
    /// Replans allowed in a row without any step succeeding.
    #[serde(default = "default_max_stalled_replans")]
    pub max_stalled_replans: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: default_max_total_attempts(),
            max_consecutive_capture_failures: default_max_consecutive_capture_failures(),
            max_stalled_replans: default_max_stalled_replans(),
        }
    }
}

fn default_max_total_attempts() -> u32 {
    50
}

fn default_max_consecutive_capture_failures() -> u32 {
    3
}

fn default_max_stalled_replans() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// When set, the last captured frame and its annotated copy are written here.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default)]
    pub run_log_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub persist_run_log: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            run_log_dir: None,
            persist_run_log: true,
        }
    }
}

impl DiagnosticsConfig {
    /// `run_log_dir`, or `<data dir>/deskpilot/runs`, or the working directory.
    pub fn resolved_run_log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.run_log_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("deskpilot").join("runs"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> DeskPilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DeskPilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config_from(path: &Path) -> DeskPilotResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(
        path = %path.display(),
        strategy = ?config.planner.strategy,
        provider = %config.llm.active_provider,
        "config loaded"
    );
    Ok(config)
}

/// Loads `config.toml` from the usual locations, or built-in defaults if none exists.
pub fn load_config() -> DeskPilotResult<AppConfig> {
    match resolve_config_path() {
        Ok(path) => load_config_from(&path),
        Err(DeskPilotError::Config(msg)) => {
            tracing::warn!(reason = %msg, "using built-in configuration defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(e),
    }
}

pub fn save_config(config: &AppConfig, path: &Path) -> DeskPilotResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.planner.strategy, PlannerStrategy::Llm);
        assert_eq!(cfg.planner.step_max_retries, 3);
        assert_eq!(cfg.capture.timeout_ms, 3000);
        assert_eq!(cfg.control.max_stalled_replans, 2);
        assert!(cfg.executor.app_aliases.contains_key("terminal"));
        assert!(cfg.diagnostics.persist_run_log);
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [planner]
            strategy = "fallback"

            [executor]
            min_similarity = 0.75

            [llm]
            active_provider = "openai"

            [llm.providers.openai]
            display_name = "OpenAI"
            api_base = "https://api.openai.com/v1/chat/completions"
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.planner.strategy, PlannerStrategy::Fallback);
        assert_eq!(cfg.planner.step_max_retries, 3);
        assert!((cfg.executor.min_similarity - 0.75).abs() < f32::EPSILON);
        assert!((cfg.executor.ambiguity_margin - 0.05).abs() < f32::EPSILON);
        let entry = &cfg.llm.providers["openai"];
        assert!((entry.temperature - 0.1).abs() < f64::EPSILON);
        assert!(entry.api_key.is_none());
    }

    #[test]
    fn test_save_then_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.control.max_total_attempts = 7;
        cfg.diagnostics.artifact_dir = Some(dir.path().join("artifacts"));
        save_config(&cfg, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.control.max_total_attempts, 7);
        assert_eq!(loaded.diagnostics.artifact_dir, cfg.diagnostics.artifact_dir);
    }

    #[test]
    fn test_explicit_run_log_dir_wins() {
        let diag = DiagnosticsConfig {
            run_log_dir: Some(PathBuf::from("/tmp/runs")),
            ..DiagnosticsConfig::default()
        };
        assert_eq!(diag.resolved_run_log_dir(), PathBuf::from("/tmp/runs"));
    }
}
