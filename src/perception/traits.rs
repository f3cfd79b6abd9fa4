use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::DeskPilotResult;
use crate::perception::types::{CapturedFrame, RawElement};

/// A source of screenshots. The observer tries providers in preference order.
#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider can work in the current session at all.
    fn is_available(&self) -> bool {
        true
    }

    async fn capture(&self) -> DeskPilotResult<CapturedFrame>;
}

/// Segments a frame into candidate UI regions and reads their text.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Boxes are in frame pixel coordinates.
    async fn segment_and_read(
        &self,
        image: Arc<image::RgbaImage>,
    ) -> DeskPilotResult<Vec<RawElement>>;
}
