//! Checkbox and signature detection by pixel density.
//!
//! Pure functions over a grayscale page: a normalized region is mapped to a
//! pixel rectangle, the fraction of "ink" pixels is measured, and the density
//! is classified against a `DensityBands` configuration.
//!
//! Two thresholding modes:
//! - **Fixed**: a pixel is ink when its intensity is below `dark_pixel`.
//! - **Adaptive**: the region is contrast-stretched and split with Otsu's
//!   method; degenerate regions fall back to the fixed mode.

use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

use crate::pipeline_config::DensityBands;
use crate::template::{PixelRect, Region};

/// Confidence assigned inside the uncertain band.
const UNCERTAIN_CONFIDENCE: f32 = 0.5;

/// Confidence of a "no signature" verdict.
const SIGNATURE_ABSENT_CONFIDENCE: f32 = 0.85;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Page image is empty")]
    EmptyImage,

    #[error("Invalid detection region: {0:?}")]
    InvalidRegion(Region),
}

/// How the ink threshold was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    Fixed,
    Adaptive,
}

/// Classification of one region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkDetection {
    /// Checked box, or signature present.
    pub marked: bool,
    pub confidence: f32,
    pub density: f32,
    pub requires_review: bool,
    /// Intensity cutoff used to count ink pixels.
    pub threshold: u8,
    pub mode: ThresholdMode,
}

// ═══════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════

/// Classify a density into (marked, confidence, requires_review).
///
/// Confidence grows from `base_confidence` as the density moves away from
/// the band edge, capped at `max_confidence`. Inside the uncertain band the
/// verdict is a best guess against the band midpoint.
pub fn classify_density(density: f32, bands: &DensityBands) -> (bool, f32, bool) {
    if density >= bands.high {
        let confidence = (bands.base_confidence + (density - bands.high)).min(bands.max_confidence);
        (true, confidence, false)
    } else if density <= bands.low {
        let confidence = (bands.base_confidence + (bands.low - density)).min(bands.max_confidence);
        (false, confidence, false)
    } else {
        (density > bands.midpoint(), UNCERTAIN_CONFIDENCE, true)
    }
}

/// Fraction of pixels in `rect` strictly darker than `dark`.
pub fn ink_density(image: &GrayImage, rect: PixelRect, dark: u8) -> f32 {
    let total = rect.width as u64 * rect.height as u64;
    if total == 0 {
        return 0.0;
    }
    let mut ink = 0u64;
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            if image.get_pixel(x, y).0[0] < dark {
                ink += 1;
            }
        }
    }
    ink as f32 / total as f32
}

fn pixel_rect(image: &GrayImage, region: &Region) -> Result<PixelRect, DetectionError> {
    if !region.is_valid() {
        return Err(DetectionError::InvalidRegion(*region));
    }
    region
        .to_pixel_rect(image.width(), image.height())
        .ok_or(DetectionError::EmptyImage)
}

/// Fixed-threshold checkbox detection.
pub fn detect_mark(
    image: &GrayImage,
    region: &Region,
    bands: &DensityBands,
) -> Result<MarkDetection, DetectionError> {
    let rect = pixel_rect(image, region)?;
    let density = ink_density(image, rect, bands.dark_pixel);
    let (marked, confidence, requires_review) = classify_density(density, bands);
    Ok(MarkDetection {
        marked,
        confidence,
        density,
        requires_review,
        threshold: bands.dark_pixel,
        mode: ThresholdMode::Fixed,
    })
}

/// Adaptive-threshold checkbox detection with fixed-threshold fallback.
pub fn detect_mark_adaptive(
    image: &GrayImage,
    region: &Region,
    bands: &DensityBands,
) -> Result<MarkDetection, DetectionError> {
    let rect = pixel_rect(image, region)?;
    let mut pixels = region_pixels(image, rect);

    let Some(threshold) = stretch_contrast(&mut pixels).and_then(|_| otsu_threshold(&pixels))
    else {
        tracing::debug!(?region, "Degenerate region histogram, using fixed threshold");
        return detect_mark(image, region, bands);
    };

    // Otsu's lower class is [0, threshold].
    let ink = pixels.iter().filter(|&&p| p <= threshold).count();
    let density = ink as f32 / pixels.len() as f32;
    let (marked, confidence, requires_review) = classify_density(density, bands);
    Ok(MarkDetection {
        marked,
        confidence,
        density,
        requires_review,
        threshold,
        mode: ThresholdMode::Adaptive,
    })
}

/// Signature presence: sparse-ink bands, midpoint cutoff.
///
/// Present ⇒ confidence grows with density up to the cap; absent ⇒ fixed
/// confidence. Densities inside the band are flagged for review.
pub fn detect_signature(
    image: &GrayImage,
    region: &Region,
    bands: &DensityBands,
) -> Result<MarkDetection, DetectionError> {
    let rect = pixel_rect(image, region)?;
    let density = ink_density(image, rect, bands.dark_pixel);
    let present = density > bands.midpoint();
    let confidence = if present {
        (bands.base_confidence + density).min(bands.max_confidence)
    } else {
        SIGNATURE_ABSENT_CONFIDENCE
    };
    Ok(MarkDetection {
        marked: present,
        confidence,
        density,
        requires_review: density > bands.low && density < bands.high,
        threshold: bands.dark_pixel,
        mode: ThresholdMode::Fixed,
    })
}

// ═══════════════════════════════════════════════════════════
// Histogram helpers
// ═══════════════════════════════════════════════════════════

fn region_pixels(image: &GrayImage, rect: PixelRect) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((rect.width * rect.height) as usize);
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            pixels.push(image.get_pixel(x, y).0[0]);
        }
    }
    pixels
}

/// Linearly stretch intensities to the full 0-255 range.
/// Returns `None` (leaving pixels untouched) for flat or empty regions.
fn stretch_contrast(pixels: &mut [u8]) -> Option<()> {
    let min = *pixels.iter().min()?;
    let max = *pixels.iter().max()?;
    if min == max {
        return None;
    }
    let range = (max - min) as f32;
    for p in pixels.iter_mut() {
        *p = (((*p - min) as f32 / range) * 255.0).round() as u8;
    }
    Some(())
}

/// Otsu's method over a 256-bin histogram.
///
/// Returns the intensity maximising between-class variance, or `None`
/// when the histogram is empty or single-valued.
pub fn otsu_threshold(pixels: &[u8]) -> Option<u8> {
    if pixels.is_empty() {
        return None;
    }
    let mut histogram = [0u64; 256];
    for &p in pixels {
        histogram[p as usize] += 1;
    }
    let total = pixels.len() as f64;
    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0f64;
    let mut weight_background = 0.0f64;
    let mut best: Option<(u8, f64)> = None;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += t as f64 * count as f64;

        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum - sum_background) / weight_foreground;
        let variance =
            weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);

        if best.map_or(true, |(_, v)| variance > v) {
            best = Some((t as u8, variance));
        }
    }

    best.filter(|(_, v)| *v > 0.0).map(|(t, _)| t)
}
