//! Image Preprocessing
//!
//! Prepares raw page captures for OCR. The optimizer never fails: a stage that
//! cannot do anything useful hands its input on unchanged.

use crate::settings::{BinarizationMethod, PreprocessingSettings};
use image::{DynamicImage, GrayImage, Luma};
use log::debug;

/// Image in, OCR-ready image out.
pub trait Preprocessor {
    fn optimize(&self, image: &DynamicImage) -> DynamicImage;
}

/// Noise reduction, contrast, margin trimming and binarization, each optional.
pub struct ImageOptimizer {
    settings: PreprocessingSettings,
}

impl ImageOptimizer {
    pub fn new(settings: PreprocessingSettings) -> Self {
        ImageOptimizer { settings }
    }
}

impl Preprocessor for ImageOptimizer {
    fn optimize(&self, image: &DynamicImage) -> DynamicImage {
        if image.width() == 0 || image.height() == 0 {
            return image.clone();
        }
        let s = &self.settings;
        let mut result = image.clone();

        if s.noise_reduction.enabled && s.noise_reduction.sigma > 0.0 {
            result = result.blur(s.noise_reduction.sigma);
        }
        if s.contrast.enabled {
            result = result.adjust_contrast(s.contrast.amount);
        }
        if s.margin_trim.enabled {
            result = trim_margins(&result, s.margin_trim.threshold, s.margin_trim.padding);
        }
        if s.binarization.enabled {
            let gray = result.to_luma8();
            let threshold = match s.binarization.method {
                BinarizationMethod::Otsu => otsu_threshold(&gray),
                BinarizationMethod::Simple => s.binarization.threshold,
            };
            debug!("Binarizing with threshold {}", threshold);
            result = DynamicImage::ImageLuma8(binarize(&gray, threshold));
        }

        debug!(
            "Optimized image: {}x{} -> {}x{}",
            image.width(),
            image.height(),
            result.width(),
            result.height()
        );
        result
    }
}

/// Crops the surrounding UI chrome away from the bright page area.
///
/// A row or column belongs to the page when at least half of its pixels are
/// at or above `threshold`. Trims that would remove less than 5% on both axes
/// are skipped.
pub fn trim_margins(image: &DynamicImage, threshold: u8, padding: u32) -> DynamicImage {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();

    let bright_rows: Vec<bool> = (0..height)
        .map(|y| mostly_bright((0..width).map(|x| gray.get_pixel(x, y)[0]), width, threshold))
        .collect();
    let bright_cols: Vec<bool> = (0..width)
        .map(|x| mostly_bright((0..height).map(|y| gray.get_pixel(x, y)[0]), height, threshold))
        .collect();

    let (Some((top, bottom)), Some((left, right))) = (span(&bright_rows), span(&bright_cols))
    else {
        debug!("No page area found, skipping trimming");
        return image.clone();
    };

    let x0 = left.saturating_sub(padding);
    let y0 = top.saturating_sub(padding);
    let x1 = (right + 1 + padding).min(width);
    let y1 = (bottom + 1 + padding).min(height);
    let (new_w, new_h) = (x1 - x0, y1 - y0);

    if new_w as f64 > width as f64 * 0.95 && new_h as f64 > height as f64 * 0.95 {
        debug!("Trimming area too small, skipping");
        return image.clone();
    }

    debug!(
        "Margins trimmed: x={}, y={}, w={}, h={} (from {}x{})",
        x0, y0, new_w, new_h, width, height
    );
    image.crop_imm(x0, y0, new_w, new_h)
}

fn mostly_bright(values: impl Iterator<Item = u8>, len: u32, threshold: u8) -> bool {
    let bright = values.filter(|v| *v >= threshold).count() as u32;
    bright * 2 >= len
}

fn span(flags: &[bool]) -> Option<(u32, u32)> {
    let first = flags.iter().position(|f| *f)?;
    let last = flags.iter().rposition(|f| *f)?;
    Some((first as u32, last as u32))
}

/// Otsu's method: the threshold maximizing between-class variance.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 127;
    }

    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum();

    let mut background_weight = 0u64;
    let mut background_sum = 0.0;
    let mut best = (0u8, 0.0f64);

    for (level, count) in histogram.iter().enumerate() {
        background_weight += count;
        if background_weight == 0 {
            continue;
        }
        let foreground_weight = total - background_weight;
        if foreground_weight == 0 {
            break;
        }
        background_sum += level as f64 * *count as f64;

        let mean_b = background_sum / background_weight as f64;
        let mean_f = (weighted_total - background_sum) / foreground_weight as f64;
        let variance =
            background_weight as f64 * foreground_weight as f64 * (mean_b - mean_f).powi(2);
        if variance > best.1 {
            best = (level as u8, variance);
        }
    }
    best.0
}

/// Pixels above `threshold` become white, the rest black.
pub fn binarize(gray: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        *pixel = if pixel[0] > threshold { Luma([255]) } else { Luma([0]) };
    }
    out
}
