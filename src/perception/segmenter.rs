//! UI region segmentation with a YOLOv8 ONNX model.
//!
//! The model is optional: when the file is missing the detector runs OCR on
//! the whole frame instead.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::types::{BoundingBox, ElementType};

const INPUT_SIZE: u32 = 640;
const LETTERBOX_GREY: u8 = 114;

/// One segmented region in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub bbox: BoundingBox,
    pub element_type: ElementType,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

#[derive(Debug, Clone)]
struct Proposal {
    // [x1, y1, x2, y2] in frame pixels
    corners: [f32; 4],
    score: f32,
    class_id: usize,
}

pub struct YoloSegmenter {
    // `Session::run` needs exclusive access.
    session: Mutex<Session>,
    score_threshold: f32,
    iou_threshold: f32,
    class_names: Vec<String>,
}

impl YoloSegmenter {
    /// Returns `None` when the model file is absent or cannot be loaded.
    pub fn try_load(
        model_path: &Path,
        score_threshold: f32,
        iou_threshold: f32,
        class_names: Vec<String>,
    ) -> Option<Self> {
        if !model_path.exists() {
            tracing::warn!(path = %model_path.display(), "segmentation model not found; OCR-only detection");
            return None;
        }
        match Self::build(model_path, score_threshold, iou_threshold, class_names) {
            Ok(segmenter) => {
                tracing::info!(
                    path = %model_path.display(),
                    classes = segmenter.class_names.len(),
                    "segmentation model loaded"
                );
                Some(segmenter)
            }
            Err(e) => {
                tracing::error!(error = %e, path = %model_path.display(), "failed to load segmentation model");
                None
            }
        }
    }

    fn build(
        model_path: &Path,
        score_threshold: f32,
        iou_threshold: f32,
        class_names: Vec<String>,
    ) -> DeskPilotResult<Self> {
        let session = Session::builder()
            .map_err(|e| DeskPilotError::Detection(format!("ort session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DeskPilotError::Detection(format!("ort opt-level: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| DeskPilotError::Detection(format!("ort load model: {e}")))?;
        Ok(Self {
            session: Mutex::new(session),
            score_threshold,
            iou_threshold,
            class_names,
        })
    }

    /// CPU-bound; call from `spawn_blocking`.
    pub fn segment(&self, image: &image::RgbaImage) -> DeskPilotResult<Vec<Region>> {
        let (input, letterbox) = letterbox_tensor(image);
        let input = Tensor::from_array(input)
            .map_err(|e| DeskPilotError::Detection(format!("ort tensor: {e}")))?;

        let output = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| DeskPilotError::Detection("segmentation session poisoned".into()))?;
            let outputs = session
                .run(ort::inputs![input])
                .map_err(|e| DeskPilotError::Detection(format!("ort run: {e}")))?;
            outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| DeskPilotError::Detection(format!("ort output: {e}")))?
                .to_owned()
        };

        let proposals = self.decode(&output.view(), letterbox, image.width(), image.height())?;
        let regions: Vec<Region> = suppress(proposals, self.iou_threshold)
            .into_iter()
            .map(|p| Region {
                bbox: corners_to_bbox(&p.corners),
                element_type: self.class_type(p.class_id),
                confidence: p.score,
            })
            .collect();
        tracing::debug!(regions = regions.len(), "segmentation pass");
        Ok(regions)
    }

    /// YOLOv8 layout: [1, 4 + classes, proposals], boxes as centre/size in input space.
    fn decode(
        &self,
        output: &ndarray::ArrayViewD<f32>,
        lb: Letterbox,
        frame_w: u32,
        frame_h: u32,
    ) -> DeskPilotResult<Vec<Proposal>> {
        let shape = output.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(DeskPilotError::Detection(format!(
                "unexpected model output shape {shape:?}"
            )));
        }
        let classes = shape[1] - 4;
        let (fw, fh) = (frame_w as f32, frame_h as f32);

        let mut proposals = Vec::new();
        for i in 0..shape[2] {
            let (class_id, score) = (0..classes)
                .map(|c| (c, output[[0, 4 + c, i]]))
                .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.score_threshold {
                continue;
            }
            let (cx, cy) = (output[[0, 0, i]], output[[0, 1, i]]);
            let (half_w, half_h) = (output[[0, 2, i]] / 2.0, output[[0, 3, i]] / 2.0);
            let unmap_x = |v: f32| ((v - lb.pad_x) / lb.scale).clamp(0.0, fw);
            let unmap_y = |v: f32| ((v - lb.pad_y) / lb.scale).clamp(0.0, fh);
            proposals.push(Proposal {
                corners: [
                    unmap_x(cx - half_w),
                    unmap_y(cy - half_h),
                    unmap_x(cx + half_w),
                    unmap_y(cy + half_h),
                ],
                score,
                class_id,
            });
        }
        Ok(proposals)
    }

    fn class_type(&self, class_id: usize) -> ElementType {
        self.class_names
            .get(class_id)
            .and_then(|name| ElementType::from_label(name))
            .unwrap_or(ElementType::Unknown)
    }
}

/// Resize keeping aspect ratio, pad to a square grey canvas, normalise into NCHW.
fn letterbox_tensor(image: &image::RgbaImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let scale = (INPUT_SIZE as f32 / w).min(INPUT_SIZE as f32 / h);
    let nw = ((w * scale).round() as u32).max(1);
    let nh = ((h * scale).round() as u32).max(1);
    let pad_x = (INPUT_SIZE - nw.min(INPUT_SIZE)) as f32 / 2.0;
    let pad_y = (INPUT_SIZE - nh.min(INPUT_SIZE)) as f32 / 2.0;

    let resized = image::imageops::resize(image, nw, nh, image::imageops::FilterType::Triangle);
    let mut canvas = image::RgbaImage::from_pixel(
        INPUT_SIZE,
        INPUT_SIZE,
        image::Rgba([LETTERBOX_GREY, LETTERBOX_GREY, LETTERBOX_GREY, 255]),
    );
    image::imageops::overlay(&mut canvas, &resized, pad_x.round() as i64, pad_y.round() as i64);

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
        }
    }
    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Greedy per-class non-maximum suppression.
fn suppress(mut proposals: Vec<Proposal>, iou_threshold: f32) -> Vec<Proposal> {
    proposals.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Proposal> = Vec::new();
    for p in proposals {
        let dominated = kept
            .iter()
            .any(|k| k.class_id == p.class_id && iou(&k.corners, &p.corners) > iou_threshold);
        if !dominated {
            kept.push(p);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn corners_to_bbox(c: &[f32; 4]) -> BoundingBox {
    BoundingBox::new(
        c[0].round() as i32,
        c[1].round() as i32,
        (c[2] - c[0]).max(0.0).round() as u32,
        (c[3] - c[1]).max(0.0).round() as u32,
    )
}
