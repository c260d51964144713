use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use image::{DynamicImage, RgbImage};
use fast_image_resize::images::Image;
use fast_image_resize::{PixelType, ResizeAlg, ResizeOptions, Resizer};
use tracing::debug;

/// Grey used by YOLO letterboxing for the padded border.
pub const PAD_VALUE: u8 = 114;

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub pad_value: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
            channels: 3,
            pad_value: PAD_VALUE,
        }
    }
}

impl PreprocessConfig {
    /// Square input of `imgsz` pixels.
    pub fn square(imgsz: usize) -> Self {
        Self {
            height: imgsz,
            width: imgsz,
            ..Self::default()
        }
    }
}

/// How an original image was placed into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    /// Maps a center-format box in model-input pixels back onto the original
    /// image, returning `[x1, y1, x2, y2]` clamped to the image bounds.
    pub fn to_original(&self, cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
        let (max_x, max_y) = (self.orig_width as f32, self.orig_height as f32);
        let unpad_x = |x: f32| ((x - self.x_offset as f32) / self.scale).clamp(0.0, max_x);
        let unpad_y = |y: f32| ((y - self.y_offset as f32) / self.scale).clamp(0.0, max_y);
        [
            unpad_x(cx - w / 2.0),
            unpad_y(cy - h / 2.0),
            unpad_x(cx + w / 2.0),
            unpad_y(cy + h / 2.0),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Aspect-preserving resize into the model input, centred on a grey canvas.
    pub fn letterbox(&self, x: &DynamicImage) -> Result<(RgbImage, Letterbox)> {
        let (orig_width, orig_height) = (x.width(), x.height());
        anyhow::ensure!(orig_width > 0 && orig_height > 0, "image has no pixels");
        anyhow::ensure!(
            self.config.width > 0 && self.config.height > 0,
            "model input size must be non-zero"
        );

        let scale = (self.config.width as f32 / orig_width as f32).min(self.config.height as f32 / orig_height as f32);
        let new_width = ((orig_width as f32 * scale) as u32).clamp(1, self.config.width as u32);
        let new_height = ((orig_height as f32 * scale) as u32).clamp(1, self.config.height as u32);

        // Whatever the source layout (grey, RGBA, 16-bit), the model sees RGB8.
        let src = DynamicImage::ImageRgb8(x.to_rgb8());
        let mut dst_image = Image::new(new_width, new_height, PixelType::U8x3);
        let mut resizer = Resizer::new();
        let resize_options = ResizeOptions::new()
            .resize_alg(ResizeAlg::Convolution(fast_image_resize::FilterType::Bilinear));
        resizer
            .resize(&src, &mut dst_image, &resize_options)
            .context("failed to resize image")?;
        let resized = RgbImage::from_raw(new_width, new_height, dst_image.buffer().to_vec())
            .context("resized buffer has unexpected length")?;

        let pad = self.config.pad_value;
        let mut padded = RgbImage::from_pixel(
            self.config.width as u32,
            self.config.height as u32,
            image::Rgb([pad, pad, pad]),
        );
        let x_offset = (self.config.width as u32 - new_width) / 2;
        let y_offset = (self.config.height as u32 - new_height) / 2;
        image::imageops::overlay(&mut padded, &resized, x_offset as i64, y_offset as i64);

        Ok((
            padded,
            Letterbox { scale, x_offset, y_offset, orig_width, orig_height },
        ))
    }

    /// Letterboxes every image and packs them into one `[N, 3, H, W]` tensor
    /// scaled to `[0, 1]`.
    pub fn preprocess(&self, xs: &[DynamicImage]) -> Result<(ndarray::Array<f32, ndarray::IxDyn>, Vec<Letterbox>)> {
        anyhow::ensure!(!xs.is_empty(), "no images to preprocess");
        let t = Instant::now();
        let ys_vec = xs
            .par_iter()
            .map(|x| -> Result<_> {
                let (padded, letterbox) = self.letterbox(x)?;
                let mut img_arr = ndarray::Array::from_elem(
                    (self.config.channels, self.config.height, self.config.width),
                    0 as f32,
                );
                for (i, rgb) in padded.pixels().enumerate() {
                    let y = i / self.config.width;
                    let x = i % self.config.width;
                    img_arr[[0, y, x]] = rgb[0] as f32 / 255.0;
                    img_arr[[1, y, x]] = rgb[1] as f32 / 255.0;
                    img_arr[[2, y, x]] = rgb[2] as f32 / 255.0;
                }
                Ok((img_arr, letterbox))
            })
            .collect::<Result<Vec<_>>>()?;

        let (img_arrs, letterboxes): (Vec<_>, Vec<_>) = ys_vec.into_iter().unzip();
        let views: Vec<_> = img_arrs.iter().map(|arr| arr.view()).collect();
        let ys = ndarray::stack(ndarray::Axis(0), &views)?.into_dyn();
        debug!(images = xs.len(), elapsed = ?t.elapsed(), "preprocessed");

        Ok((ys, letterboxes))
    }
}
