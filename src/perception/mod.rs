pub mod annotator;
pub mod detector;
pub mod ocr;
pub mod screenshot;
pub mod segmenter;
pub mod traits;
pub mod types;
pub mod vision;
