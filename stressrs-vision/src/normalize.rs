use image::{imageops, GrayImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::locator::BoundingBox;

/// Memory layout the classifier graph expects for its single input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 1]`, what Keras exports produce.
    Nhwc,
    /// `[1, 1, H, W]`
    Nchw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Side of the square classifier input.
    pub size: u32,
    /// Histogram-equalize the crop before resizing.
    pub equalize: bool,
    /// Multiplier applied to 0..255 pixel values when building the tensor.
    pub pixel_scale: f32,
    pub layout: TensorLayout,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            size: 48,
            equalize: false,
            pixel_scale: 1.0,
            layout: TensorLayout::Nhwc,
        }
    }
}

/// Fixed-size single-channel face crop ready for classification.
#[derive(Debug, Clone)]
pub struct NormalizedFace {
    pub image: GrayImage,
    pub pixel_scale: f32,
    pub layout: TensorLayout,
}

impl NormalizedFace {
    pub fn to_tensor(&self) -> Array4<f32> {
        let (w, h) = self.image.dimensions();
        let shape = match self.layout {
            TensorLayout::Nhwc => (1, h as usize, w as usize, 1),
            TensorLayout::Nchw => (1, 1, h as usize, w as usize),
        };
        // With a single channel both layouts share the same row-major order.
        let data: Vec<f32> = self
            .image
            .as_raw()
            .iter()
            .map(|&p| p as f32 * self.pixel_scale)
            .collect();
        Array4::from_shape_vec(shape, data).unwrap_or_else(|_| Array4::zeros(shape))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Crop `region` out of `frame` and resize it to the classifier input.
    ///
    /// The region is clamped to the frame; `None` if nothing is left.
    pub fn normalize(&self, frame: &GrayImage, region: &BoundingBox) -> Option<NormalizedFace> {
        let region = region.clamp_to(frame.width(), frame.height())?;
        let crop = imageops::crop_imm(frame, region.x, region.y, region.width, region.height)
            .to_image();
        let crop = if self.config.equalize {
            equalize_histogram(&crop)
        } else {
            crop
        };
        let size = self.config.size.max(1);
        let image = imageops::resize(&crop, size, size, imageops::FilterType::Triangle);
        Some(NormalizedFace {
            image,
            pixel_scale: self.config.pixel_scale,
            layout: self.config.layout,
        })
    }
}

/// Spread the intensity histogram over the full 0..255 range.
pub fn equalize_histogram(img: &GrayImage) -> GrayImage {
    let mut hist = [0usize; 256];
    for p in img.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total = img.width() as usize * img.height() as usize;
    let first = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == 0 || first == total {
        return img.clone();
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0usize;
    for (value, count) in hist.iter().enumerate() {
        cdf += count;
        let scaled = (cdf.saturating_sub(first)) as f32 / (total - first) as f32 * 255.0;
        lut[value] = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = img.clone();
    for p in out.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn bbox(x: i64, y: i64, width: i64, height: i64) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
            score: 1.0,
        }
    }

    #[test]
    fn test_normalize_fixed_shape() {
        let frame = GrayImage::from_pixel(200, 100, Luma([90]));
        let normalizer = Normalizer::default();
        let face = normalizer.normalize(&frame, &bbox(10, 10, 80, 60)).unwrap();
        assert_eq!(face.image.dimensions(), (48, 48));
        assert!(face.image.pixels().all(|p| p[0] == 90));

        let tensor = face.to_tensor();
        assert_eq!(tensor.shape(), &[1, 48, 48, 1]);
        assert_eq!(tensor[[0, 0, 0, 0]], 90.0);
    }

    #[test]
    fn test_region_clamped_to_frame() {
        let frame = GrayImage::from_pixel(64, 64, Luma([10]));
        let normalizer = Normalizer::default();
        assert!(normalizer.normalize(&frame, &bbox(-20, 40, 50, 100)).is_some());
        assert!(normalizer.normalize(&frame, &bbox(70, 70, 10, 10)).is_none());
    }

    #[test]
    fn test_nchw_and_scale() {
        let frame = GrayImage::from_pixel(48, 48, Luma([255]));
        let normalizer = Normalizer::new(NormalizerConfig {
            layout: TensorLayout::Nchw,
            pixel_scale: 1.0 / 255.0,
            ..NormalizerConfig::default()
        });
        let tensor = normalizer
            .normalize(&frame, &bbox(0, 0, 48, 48))
            .unwrap()
            .to_tensor();
        assert_eq!(tensor.shape(), &[1, 1, 48, 48]);
        assert!((tensor[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, Luma([100]));
        img.put_pixel(1, 0, Luma([110]));
        let eq = equalize_histogram(&img);
        assert_eq!(eq.get_pixel(0, 0)[0], 0);
        assert_eq!(eq.get_pixel(1, 0)[0], 255);

        let flat = GrayImage::from_pixel(3, 3, Luma([42]));
        assert_eq!(equalize_histogram(&flat), flat);
    }
}
