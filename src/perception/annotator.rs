//! Draws detected element boxes onto a copy of the frame for diagnostics.

use crate::perception::types::{DetectedElement, ElementType, Point};

pub const ANNOTATED_FRAME_FILE: &str = "last_frame_annotated.png";

fn element_colour(et: ElementType) -> [u8; 4] {
    match et {
        ElementType::Button => [255, 68, 68, 220],
        ElementType::Input => [68, 255, 68, 220],
        ElementType::Link => [68, 68, 255, 220],
        ElementType::Icon => [255, 170, 0, 220],
        ElementType::Checkbox => [255, 68, 255, 220],
        ElementType::Menu | ElementType::MenuItem => [0, 220, 255, 220],
        ElementType::Text => [170, 170, 170, 200],
        ElementType::Image => [255, 200, 100, 220],
        ElementType::Container => [120, 120, 80, 180],
        ElementType::Unknown => [255, 255, 255, 200],
    }
}

/// `elements` are in screen coordinates; `origin` is the frame's screen offset.
pub fn annotate(
    frame: &image::RgbaImage,
    elements: &[DetectedElement],
    origin: Point,
) -> image::RgbaImage {
    let mut canvas = frame.clone();
    let thickness = if canvas.width() > 1600 { 3 } else { 2 };
    for elem in elements {
        let b = elem.bbox.offset(-origin.x, -origin.y);
        draw_rect(
            &mut canvas,
            b.x,
            b.y,
            b.x + b.width as i32,
            b.y + b.height as i32,
            element_colour(elem.element_type),
            thickness,
        );
    }
    canvas
}

fn draw_rect(
    canvas: &mut image::RgbaImage,
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    col: [u8; 4],
    thickness: i32,
) {
    for t in 0..thickness {
        for x in x1..=x2 {
            blend(canvas, x, y1 + t, col);
            blend(canvas, x, y2 - t, col);
        }
        for y in y1..=y2 {
            blend(canvas, x1 + t, y, col);
            blend(canvas, x2 - t, y, col);
        }
    }
}

fn blend(canvas: &mut image::RgbaImage, x: i32, y: i32, col: [u8; 4]) {
    if x < 0 || y < 0 || x >= canvas.width() as i32 || y >= canvas.height() as i32 {
        return;
    }
    let p = canvas.get_pixel_mut(x as u32, y as u32);
    let a = col[3] as f32 / 255.0;
    for c in 0..3 {
        p[c] = (p[c] as f32 * (1.0 - a) + col[c] as f32 * a).round() as u8;
    }
    p[3] = 255;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::BoundingBox;

    #[test]
    fn test_box_edges_drawn_in_frame_space() {
        let frame = image::RgbaImage::new(50, 50);
        let elem = DetectedElement {
            bbox: BoundingBox::new(110, 110, 20, 20),
            element_type: ElementType::Button,
            text: "OK".into(),
            confidence: 0.9,
        };
        let out = annotate(&frame, &[elem], Point { x: 100, y: 100 });

        assert_eq!(out.get_pixel(10, 10)[3], 255);
        assert!(out.get_pixel(10, 10)[0] > 200);
        // interior untouched
        assert_eq!(out.get_pixel(20, 20)[3], 0);
    }

    #[test]
    fn test_out_of_frame_boxes_are_clipped() {
        let frame = image::RgbaImage::new(10, 10);
        let elem = DetectedElement {
            bbox: BoundingBox::new(-20, -20, 100, 100),
            element_type: ElementType::Unknown,
            text: String::new(),
            confidence: 0.5,
        };
        let out = annotate(&frame, &[elem], Point { x: 0, y: 0 });
        assert_eq!(out.dimensions(), (10, 10));
    }
}
