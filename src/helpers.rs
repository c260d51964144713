use std::io::Cursor;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::postprocess::Detection;

const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BOX_THICKNESS: i32 = 2;

/// Draws each detection box onto a copy of `image`.
pub fn draw_boxes(image: &DynamicImage, detections: &[&Detection]) -> RgbaImage {
    let mut img = image.to_rgba8();
    for det in detections {
        let [x1, y1, x2, y2] = det.bbox;
        let (left, top) = (x1.round() as i32, y1.round() as i32);
        let width = (x2 - x1).round().max(1.0) as i32;
        let height = (y2 - y1).round().max(1.0) as i32;

        // Nested rectangles give the stroke its thickness.
        for inset in 0..BOX_THICKNESS {
            let (w, h) = (width - 2 * inset, height - 2 * inset);
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(left + inset, top + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut img, rect, BOX_COLOR);
        }
    }
    img
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode visualization")?;
    Ok(bytes)
}

/// PNG with the detection drawn, base64-encoded for JSON responses.
pub fn render_visualization(image: &DynamicImage, detection: &Detection) -> Result<String> {
    let png = encode_png(&draw_boxes(image, &[detection]))?;
    Ok(STANDARD.encode(png))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f32; 4]) -> Detection {
        Detection { class_index: 0, confidence: 0.9, bbox }
    }

    #[test]
    fn box_outline_is_drawn_in_red() {
        let image = DynamicImage::new_rgb8(20, 20);
        let det = detection([2.0, 2.0, 12.0, 12.0]);
        let drawn = draw_boxes(&image, &[&det]);

        assert_eq!(*drawn.get_pixel(2, 2), BOX_COLOR);
        assert_eq!(*drawn.get_pixel(3, 7), BOX_COLOR);
        assert_eq!(*drawn.get_pixel(7, 7), Rgba([0, 0, 0, 255]));
        assert_eq!(*drawn.get_pixel(15, 15), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn visualization_is_base64_png() {
        let image = DynamicImage::new_rgb8(8, 8);
        let encoded = render_visualization(&image, &detection([0.0, 0.0, 4.0, 4.0])).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();

        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }
}
