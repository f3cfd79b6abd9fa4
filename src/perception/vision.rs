use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DetectionConfig;
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::ocr::TesseractOcr;
use crate::perception::segmenter::{Region, YoloSegmenter};
use crate::perception::traits::VisionProvider;
use crate::perception::types::{BoundingBox, RawElement};

/// Local vision stack: optional YOLO segmentation, then tesseract per region.
/// Without a model, tesseract segments the frame into text lines by itself.
pub struct LocalVision {
    segmenter: Option<Arc<YoloSegmenter>>,
    ocr: TesseractOcr,
}

impl LocalVision {
    pub fn new(segmenter: Option<YoloSegmenter>, ocr: TesseractOcr) -> Self {
        Self {
            segmenter: segmenter.map(Arc::new),
            ocr,
        }
    }

    pub fn from_config(cfg: &DetectionConfig) -> Self {
        let segmenter = cfg.model_path.as_deref().and_then(|path| {
            YoloSegmenter::try_load(
                path,
                cfg.model_confidence,
                cfg.iou_threshold,
                cfg.class_names.clone(),
            )
        });
        Self::new(
            segmenter,
            TesseractOcr::new(cfg.tesseract_bin.clone(), cfg.ocr_language.clone()),
        )
    }
}

#[async_trait]
impl VisionProvider for LocalVision {
    fn name(&self) -> &str {
        if self.segmenter.is_some() {
            "yolo+tesseract"
        } else {
            "tesseract"
        }
    }

    async fn segment_and_read(
        &self,
        image: Arc<image::RgbaImage>,
    ) -> DeskPilotResult<Vec<RawElement>> {
        let Some(segmenter) = self.segmenter.clone() else {
            return self.ocr.read_lines(&image).await;
        };

        let frame = image.clone();
        let regions = tokio::task::spawn_blocking(move || segmenter.segment(&frame))
            .await
            .map_err(|e| DeskPilotError::Detection(format!("join: {e}")))??;

        let ocr = &self.ocr;
        let frame = image.as_ref();
        Ok(read_regions(regions, |bbox| async move { ocr.read_region(frame, &bbox).await }).await)
    }
}

/// Pairs each region with the text `read` finds in it. A region whose read
/// fails is kept with empty text.
async fn read_regions<F, Fut>(regions: Vec<Region>, mut read: F) -> Vec<RawElement>
where
    F: FnMut(BoundingBox) -> Fut,
    Fut: Future<Output = DeskPilotResult<String>>,
{
    let mut elements = Vec::with_capacity(regions.len());
    for region in regions {
        let text = match read(region.bbox).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(error = %e, bbox = ?region.bbox, "region OCR failed");
                String::new()
            }
        };
        elements.push(RawElement {
            bbox: region.bbox,
            type_guess: region.element_type,
            text,
            confidence: region.confidence,
        });
    }
    elements
}
