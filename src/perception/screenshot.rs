use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::CaptureConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::traits::ScreenshotProvider;
use crate::perception::types::{CapturedFrame, Point};

pub const LAST_FRAME_FILE: &str = "last_frame.png";

/// Wayland capture through the `grim` utility (PNG on stdout).
pub struct GrimProvider {
    binary: String,
}

impl GrimProvider {
    pub fn new() -> Self {
        Self {
            binary: "grim".into(),
        }
    }
}

impl Default for GrimProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScreenshotProvider for GrimProvider {
    fn name(&self) -> &str {
        "grim"
    }

    fn is_available(&self) -> bool {
        std::env::var_os("WAYLAND_DISPLAY").is_some()
    }

    async fn capture(&self) -> DeskPilotResult<CapturedFrame> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeskPilotError::Capture(format!("spawn {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeskPilotError::Capture(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        let image = image::load_from_memory(&output.stdout)?.to_rgba8();
        Ok(CapturedFrame {
            image: Arc::new(image),
            captured_at: chrono::Utc::now(),
            origin: Point { x: 0, y: 0 },
            source: self.name().to_string(),
        })
    }
}

/// Generic capture of the primary monitor through `xcap`.
#[derive(Default)]
pub struct XcapProvider;

#[async_trait]
impl ScreenshotProvider for XcapProvider {
    fn name(&self) -> &str {
        "xcap"
    }

    async fn capture(&self) -> DeskPilotResult<CapturedFrame> {
        let (image, origin) = tokio::task::spawn_blocking(capture_primary_monitor)
            .await
            .map_err(|e| DeskPilotError::Capture(format!("join: {e}")))??;

        Ok(CapturedFrame {
            image: Arc::new(image),
            captured_at: chrono::Utc::now(),
            origin,
            source: self.name().to_string(),
        })
    }
}

fn capture_primary_monitor() -> DeskPilotResult<(image::RgbaImage, Point)> {
    let monitors =
        xcap::Monitor::all().map_err(|e| DeskPilotError::Capture(format!("list monitors: {e}")))?;
    let monitor = monitors
        .iter()
        .find(|m| m.is_primary())
        .or_else(|| monitors.first())
        .ok_or_else(|| DeskPilotError::Capture("no monitor found".into()))?;

    let shot = monitor
        .capture_image()
        .map_err(|e| DeskPilotError::Capture(format!("capture: {e}")))?;
    let (w, h) = (shot.width(), shot.height());
    let image = image::RgbaImage::from_raw(w, h, shot.into_raw())
        .ok_or_else(|| DeskPilotError::Capture("frame buffer size mismatch".into()))?;

    tracing::debug!(
        width = w,
        height = h,
        x = monitor.x(),
        y = monitor.y(),
        "primary monitor captured"
    );
    Ok((
        image,
        Point {
            x: monitor.x(),
            y: monitor.y(),
        },
    ))
}

/// Captures the screen through the first provider that succeeds within the timeout.
pub struct ScreenObserver {
    providers: Vec<Arc<dyn ScreenshotProvider>>,
    timeout: Duration,
    artifact_dir: Option<PathBuf>,
}

impl ScreenObserver {
    pub fn new(providers: Vec<Arc<dyn ScreenshotProvider>>, timeout: Duration) -> Self {
        Self {
            providers,
            timeout,
            artifact_dir: None,
        }
    }

    /// Session-appropriate tool first, then the generic library.
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        let mut providers: Vec<Arc<dyn ScreenshotProvider>> = Vec::new();
        if cfg.prefer_wayland {
            providers.push(Arc::new(GrimProvider::new()));
        }
        providers.push(Arc::new(XcapProvider));
        Self::new(providers, cfg.timeout())
    }

    pub fn with_artifact_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifact_dir = dir;
        self
    }

    pub async fn capture(&self) -> DeskPilotResult<CapturedFrame> {
        let deadline = Instant::now() + self.timeout;
        let mut failures: Vec<String> = Vec::new();
        let mut timed_out = false;

        for provider in self.providers.iter().filter(|p| p.is_available()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }

            match tokio::time::timeout(remaining, provider.capture()).await {
                Ok(Ok(frame)) => {
                    tracing::debug!(
                        provider = provider.name(),
                        width = frame.width(),
                        height = frame.height(),
                        "frame captured"
                    );
                    self.write_artifact(&frame).await;
                    return Ok(frame);
                }
                Ok(Err(e)) => {
                    tracing::warn!(provider = provider.name(), error = %e, "screenshot provider failed");
                    failures.push(format!("{}: {e}", provider.name()));
                }
                Err(_) => {
                    tracing::warn!(provider = provider.name(), "screenshot provider timed out");
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            return Err(DeskPilotError::CaptureTimeout(self.timeout));
        }
        if failures.is_empty() {
            return Err(DeskPilotError::Capture(
                "no screenshot provider available in this session".into(),
            ));
        }
        Err(DeskPilotError::Capture(failures.join("; ")))
    }

    async fn write_artifact(&self, frame: &CapturedFrame) {
        let Some(dir) = self.artifact_dir.clone() else {
            return;
        };
        let image = frame.image.clone();
        let result = tokio::task::spawn_blocking(move || -> DeskPilotResult<()> {
            std::fs::create_dir_all(&dir)?;
            image.save(dir.join(LAST_FRAME_FILE))?;
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "could not write last frame artifact"),
            Err(e) => tracing::debug!(error = %e, "artifact writer panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        name: &'static str,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(name: &'static str, fail: bool, delay: Duration) -> Self {
            Self {
                name,
                fail,
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ScreenshotProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn capture(&self) -> DeskPilotResult<CapturedFrame> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DeskPilotError::Capture("boom".into()));
            }
            Ok(CapturedFrame {
                image: Arc::new(image::RgbaImage::new(4, 4)),
                captured_at: chrono::Utc::now(),
                origin: Point { x: 0, y: 0 },
                source: self.name.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_second_provider() {
        let primary = Arc::new(FixedProvider::new("primary", true, Duration::ZERO));
        let generic = Arc::new(FixedProvider::new("generic", false, Duration::ZERO));
        let observer = ScreenObserver::new(
            vec![primary.clone(), generic.clone()],
            Duration::from_secs(1),
        );

        let frame = observer.capture().await.unwrap();
        assert_eq!(frame.source, "generic");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_capture_error() {
        let observer = ScreenObserver::new(
            vec![Arc::new(FixedProvider::new("a", true, Duration::ZERO))],
            Duration::from_secs(1),
        );
        let err = observer.capture().await.unwrap_err();
        assert!(matches!(err, DeskPilotError::Capture(msg) if msg.contains("a: ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let slow = Arc::new(FixedProvider::new("slow", false, Duration::from_secs(30)));
        let observer = ScreenObserver::new(vec![slow], Duration::from_millis(200));
        let err = observer.capture().await.unwrap_err();
        assert!(matches!(err, DeskPilotError::CaptureTimeout(_)));
    }

    #[tokio::test]
    async fn test_last_frame_artifact_written() {
        let dir = tempfile::tempdir().unwrap();
        let observer = ScreenObserver::new(
            vec![Arc::new(FixedProvider::new("ok", false, Duration::ZERO))],
            Duration::from_secs(1),
        )
        .with_artifact_dir(Some(dir.path().to_path_buf()));

        observer.capture().await.unwrap();
        assert!(dir.path().join(LAST_FRAME_FILE).exists());
    }
}
