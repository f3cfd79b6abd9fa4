//! Text extraction through the `tesseract` command-line tool.
//!
//! Two modes: a full-frame sparse-text pass whose TSV output is grouped into
//! line-level elements, and a per-region pass used after segmentation.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::types::{BoundingBox, ElementType, RawElement};

/// Page segmentation mode for whole screens: sparse text in no particular order.
const PSM_SPARSE: &str = "11";
/// Page segmentation mode for a cropped region: one uniform block.
const PSM_BLOCK: &str = "6";

#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: String,
    language: String,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }

    /// Reads every text line on the frame as its own element.
    pub async fn read_lines(&self, image: &image::RgbaImage) -> DeskPilotResult<Vec<RawElement>> {
        let png = encode_png(image)?;
        let tsv = self.run(png, PSM_SPARSE, true).await?;
        let lines = parse_tsv(&tsv);
        tracing::debug!(lines = lines.len(), "tesseract full-frame pass");
        Ok(lines)
    }

    /// Reads the text inside `bbox` (frame pixel coordinates).
    pub async fn read_region(
        &self,
        image: &image::RgbaImage,
        bbox: &BoundingBox,
    ) -> DeskPilotResult<String> {
        let x = bbox.x.max(0) as u32;
        let y = bbox.y.max(0) as u32;
        let w = bbox.width.min(image.width().saturating_sub(x));
        let h = bbox.height.min(image.height().saturating_sub(y));
        if w == 0 || h == 0 {
            return Ok(String::new());
        }
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let png = encode_png(&crop)?;
        let text = self.run(png, PSM_BLOCK, false).await?;
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    async fn run(&self, png: Vec<u8>, psm: &str, tsv: bool) -> DeskPilotResult<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(["stdin", "stdout", "-l", &self.language, "--psm", psm]);
        if tsv {
            cmd.arg("tsv");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeskPilotError::Detection(format!("spawn {}: {e}", self.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeskPilotError::Detection(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn encode_png(image: &image::RgbaImage) -> DeskPilotResult<Vec<u8>> {
    let mut out = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(out)
}

struct LineAcc {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    words: Vec<String>,
    conf_sum: f32,
}

/// Groups word rows of tesseract TSV output into line elements.
pub fn parse_tsv(tsv: &str) -> Vec<RawElement> {
    let mut order: Vec<(u32, u32, u32)> = Vec::new();
    let mut lines: HashMap<(u32, u32, u32), LineAcc> = HashMap::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<i64>().unwrap_or(0);
        let key = (num(2) as u32, num(3) as u32, num(4) as u32);
        let (left, top, width, height) = (num(6) as i32, num(7) as i32, num(8) as i32, num(9) as i32);

        let acc = lines.entry(key).or_insert_with(|| {
            order.push(key);
            LineAcc {
                left,
                top,
                right: left + width,
                bottom: top + height,
                words: Vec::new(),
                conf_sum: 0.0,
            }
        });
        acc.left = acc.left.min(left);
        acc.top = acc.top.min(top);
        acc.right = acc.right.max(left + width);
        acc.bottom = acc.bottom.max(top + height);
        acc.words.push(text.to_string());
        acc.conf_sum += conf;
    }

    order
        .into_iter()
        .filter_map(|key| lines.remove(&key))
        .map(|acc| {
            let text = acc.words.join(" ");
            RawElement {
                bbox: BoundingBox::new(
                    acc.left,
                    acc.top,
                    (acc.right - acc.left).max(0) as u32,
                    (acc.bottom - acc.top).max(0) as u32,
                ),
                type_guess: guess_type(&text),
                confidence: (acc.conf_sum / acc.words.len() as f32 / 100.0).clamp(0.0, 1.0),
                text,
            }
        })
        .collect()
}

/// Rough element type for a line of text found without a segmentation model.
pub fn guess_type(text: &str) -> ElementType {
    let lower = text.to_lowercase();
    if lower.starts_with("http") || lower.contains("www.") || lower.ends_with(".com") {
        return ElementType::Link;
    }
    if text.ends_with(':') {
        return ElementType::Text;
    }
    let words = text.split_whitespace().count();
    if words <= 3 && text.chars().count() <= 24 {
        return ElementType::Button;
    }
    ElementType::Text
}
