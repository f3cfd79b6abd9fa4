use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Button,
    Input,
    Link,
    Text,
    Image,
    Checkbox,
    Menu,
    MenuItem,
    Icon,
    Container,
    Unknown,
}

impl ElementType {
    /// Maps a detector class name or a word in a target description to a type.
    pub fn from_label(label: &str) -> Option<Self> {
        let t = match label.to_ascii_lowercase().as_str() {
            "button" | "btn" => ElementType::Button,
            "input" | "field" | "textbox" | "box" | "bar" => ElementType::Input,
            "link" | "hyperlink" => ElementType::Link,
            "text" | "label" => ElementType::Text,
            "image" | "picture" => ElementType::Image,
            "checkbox" | "radio" => ElementType::Checkbox,
            "menu" => ElementType::Menu,
            "menuitem" | "item" | "option" => ElementType::MenuItem,
            "icon" => ElementType::Icon,
            "container" | "window" | "panel" | "tab" | "toolbar" => ElementType::Container,
            _ => return None,
        };
        Some(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dy = (self.y - other.y) as f32;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + (self.width / 2) as i32,
            y: self.y + (self.height / 2) as i32,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let x1 = self.x.max(other.x) as i64;
        let y1 = self.y.max(other.y) as i64;
        let x2 = (self.x as i64 + self.width as i64).min(other.x as i64 + other.width as i64);
        let y2 = (self.y as i64 + self.height as i64).min(other.y as i64 + other.height as i64);
        ((x2 - x1).max(0) * (y2 - y1).max(0)) as u64
    }

    /// Intersection divided by the smaller of the two areas.
    pub fn overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let smaller = self.area().min(other.area());
        if smaller == 0 {
            return 0.0;
        }
        self.intersection_area(other) as f32 / smaller as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    pub bbox: BoundingBox,
    pub element_type: ElementType,
    /// OCR text, possibly empty.
    pub text: String,
    /// In [0, 1].
    pub confidence: f32,
}

impl DetectedElement {
    pub fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// Candidate elements of one observation. Order carries no meaning.
pub type ElementSet = Vec<DetectedElement>;

/// One normalized screenshot.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: Arc<image::RgbaImage>,
    pub captured_at: DateTime<Utc>,
    /// Screen position of the frame's top-left pixel.
    pub origin: Point,
    /// Name of the provider that produced the frame.
    pub source: String,
}

impl CapturedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A frame plus the elements detected in it. Built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct ScreenState {
    pub frame: CapturedFrame,
    pub elements: ElementSet,
}

impl ScreenState {
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.frame.captured_at
    }
}

/// Raw provider output before thresholding and coordinate translation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawElement {
    pub bbox: BoundingBox,
    pub type_guess: ElementType,
    pub text: String,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_and_offset() {
        let b = BoundingBox::new(10, 20, 100, 40);
        assert_eq!(b.center(), Point { x: 60, y: 40 });
        assert_eq!(b.offset(5, -5).center(), Point { x: 65, y: 35 });
    }

    #[test]
    fn test_overlap_ratio_uses_smaller_box() {
        let big = BoundingBox::new(0, 0, 100, 100);
        let inner = BoundingBox::new(10, 10, 20, 20);
        assert!((big.overlap_ratio(&inner) - 1.0).abs() < 1e-6);

        let apart = BoundingBox::new(200, 200, 10, 10);
        assert_eq!(big.overlap_ratio(&apart), 0.0);

        let half = BoundingBox::new(50, 0, 100, 100);
        assert!((big.overlap_ratio(&half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_type_from_label() {
        assert_eq!(ElementType::from_label("Button"), Some(ElementType::Button));
        assert_eq!(ElementType::from_label("field"), Some(ElementType::Input));
        assert_eq!(ElementType::from_label("terminal"), None);
    }
}
