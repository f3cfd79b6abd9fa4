use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectionConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::annotator::{annotate, ANNOTATED_FRAME_FILE};
use crate::perception::traits::VisionProvider;
use crate::perception::types::{CapturedFrame, DetectedElement, ElementSet, RawElement};

/// Turns a frame into an `ElementSet` in screen coordinates.
pub struct ElementDetector {
    vision: Arc<dyn VisionProvider>,
    confidence_threshold: f32,
    overlap_threshold: f32,
    timeout: Duration,
    artifact_dir: Option<PathBuf>,
}

impl ElementDetector {
    pub fn new(vision: Arc<dyn VisionProvider>, cfg: &DetectionConfig) -> Self {
        Self {
            vision,
            confidence_threshold: cfg.confidence_threshold,
            overlap_threshold: cfg.overlap_threshold,
            timeout: cfg.timeout(),
            artifact_dir: None,
        }
    }

    pub fn with_artifact_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifact_dir = dir;
        self
    }

    /// An empty result is valid and means nothing was found.
    pub async fn detect(&self, frame: &CapturedFrame) -> DeskPilotResult<ElementSet> {
        let raw = tokio::time::timeout(
            self.timeout,
            self.vision.segment_and_read(frame.image.clone()),
        )
        .await
        .map_err(|_| DeskPilotError::DetectionTimeout(self.timeout))??;

        let total = raw.len();
        let confident: Vec<RawElement> = raw
            .into_iter()
            .filter(|r| r.confidence >= self.confidence_threshold)
            .collect();
        let kept = remove_overlaps(confident, self.overlap_threshold);

        let elements: ElementSet = kept
            .into_iter()
            .map(|r| DetectedElement {
                bbox: r.bbox.offset(frame.origin.x, frame.origin.y),
                element_type: r.type_guess,
                text: r.text,
                confidence: r.confidence.clamp(0.0, 1.0),
            })
            .collect();

        tracing::debug!(
            provider = self.vision.name(),
            raw = total,
            kept = elements.len(),
            "detection pass"
        );
        self.write_artifact(frame, &elements).await;
        Ok(elements)
    }

    async fn write_artifact(&self, frame: &CapturedFrame, elements: &[DetectedElement]) {
        let Some(dir) = self.artifact_dir.clone() else {
            return;
        };
        let image = frame.image.clone();
        let origin = frame.origin;
        let elements = elements.to_vec();
        let result = tokio::task::spawn_blocking(move || -> DeskPilotResult<()> {
            std::fs::create_dir_all(&dir)?;
            annotate(&image, &elements, origin).save(dir.join(ANNOTATED_FRAME_FILE))?;
            Ok(())
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::debug!(error = %e, "could not write annotated frame");
        }
    }
}

/// Drops the lower-confidence member of every pair overlapping above `threshold`.
pub fn remove_overlaps(mut elements: Vec<RawElement>, threshold: f32) -> Vec<RawElement> {
    elements.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.bbox.area().cmp(&a.bbox.area()))
    });
    let mut kept: Vec<RawElement> = Vec::with_capacity(elements.len());
    for elem in elements {
        if kept
            .iter()
            .all(|k| k.bbox.overlap_ratio(&elem.bbox) <= threshold)
        {
            kept.push(elem);
        }
    }
    kept
}
