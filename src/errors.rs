use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeskPilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Detection timed out after {0:?}")]
    DetectionTimeout(Duration),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Input injection error: {0}")]
    Input(String),

    #[error("Application launch error: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Agent error: {0}")]
    Agent(String),
}

impl DeskPilotError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DeskPilotError::CaptureTimeout(_) | DeskPilotError::DetectionTimeout(_)
        )
    }
}

pub type DeskPilotResult<T> = Result<T, DeskPilotError>;
