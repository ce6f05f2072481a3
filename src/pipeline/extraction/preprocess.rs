//! Page image preparation before analysis.
//!
//! Stateless and safe to run for both pages in parallel:
//! validate bytes → decode → EXIF orientation → grayscale → quality checks →
//! optional contrast stretch → PNG for the vision service.
//!
//! The grayscale page is kept for the mark detector so checkbox geometry
//! matches exactly what the vision service was shown.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Smallest possible valid PNG.
const MIN_IMAGE_BYTES: usize = 67;

/// Laplacian variance below this = blurry.
const BLUR_THRESHOLD: f32 = 100.0;

/// RMS contrast below this = faded or near-uniform scan.
const CONTRAST_THRESHOLD: f32 = 25.0;

/// Share of near-white pixels above which the page counts as blank.
const BLANK_RATIO: f32 = 0.95;

/// Share of near-black pixels above which the page counts as too dark.
const DARK_RATIO: f32 = 0.80;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    BlankPage,
    TooDark,
    Blurry { sharpness: f32 },
    LowContrast { contrast: f32 },
}

/// A decoded, oriented page ready for analysis and mark detection.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    pub luma: GrayImage,
    /// PNG bytes sent to the vision service.
    pub analysis_png: Vec<u8>,
    pub warnings: Vec<QualityWarning>,
    pub orientation: u32,
    pub contrast_enhanced: bool,
}

impl PreparedPage {
    pub fn width(&self) -> u32 {
        self.luma.width()
    }

    pub fn height(&self) -> u32 {
        self.luma.height()
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

/// Prepare one page. `enhance_low_contrast` stretches faded scans.
pub fn prepare_page(bytes: &[u8], enhance_low_contrast: bool) -> Result<PreparedPage, ExtractionError> {
    validate_image_bytes(bytes)?;

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::ImageProcessing(format!("Image decoding failed: {e}")))?;
    let orientation = read_exif_orientation(bytes);
    let oriented = apply_orientation(decoded, orientation);

    let rgb = oriented.to_rgb8();
    let mut luma = rgb_to_gray(&rgb);
    let warnings = assess_quality(&luma);

    let low_contrast = warnings
        .iter()
        .any(|w| matches!(w, QualityWarning::LowContrast { .. }));
    let contrast_enhanced = enhance_low_contrast && low_contrast && stretch_contrast(&mut luma);

    let analysis_png = if contrast_enhanced {
        encode_png(&DynamicImage::ImageLuma8(luma.clone()))?
    } else {
        encode_png(&DynamicImage::ImageRgb8(rgb))?
    };

    debug!(
        width = luma.width(),
        height = luma.height(),
        orientation,
        warnings = warnings.len(),
        contrast_enhanced,
        "Page prepared"
    );

    Ok(PreparedPage {
        luma,
        analysis_png,
        warnings,
        orientation,
        contrast_enhanced,
    })
}

/// Quality warnings for a grayscale page. Never blocks extraction.
pub fn assess_quality(img: &GrayImage) -> Vec<QualityWarning> {
    let mut warnings = Vec::new();
    let pixel_count = (img.width() as usize) * (img.height() as usize);
    if pixel_count == 0 {
        return warnings;
    }

    let white = img.pixels().filter(|p| p.0[0] > 240).count();
    if white as f32 / pixel_count as f32 > BLANK_RATIO {
        warnings.push(QualityWarning::BlankPage);
        return warnings;
    }

    let dark = img.pixels().filter(|p| p.0[0] < 15).count();
    if dark as f32 / pixel_count as f32 > DARK_RATIO {
        warnings.push(QualityWarning::TooDark);
    }

    let sharpness = compute_laplacian_variance(img);
    if sharpness < BLUR_THRESHOLD {
        warnings.push(QualityWarning::Blurry { sharpness });
    }

    let contrast = compute_contrast_score(img);
    if contrast < CONTRAST_THRESHOLD {
        warnings.push(QualityWarning::LowContrast { contrast });
    }

    warnings
}

// ── EXIF orientation ──────────────────────────────────────

/// Read EXIF tag 0x0112 (Orientation). Returns 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let Ok(reader) = exif::Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };
    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply an EXIF orientation transform.
/// 2/4 = mirrored, 3 = 180°, 5/7 = transposed, 6 = 90° CW, 8 = 270° CW.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ── Pixel metrics ─────────────────────────────────────────

/// ITU-R BT.601 luminance.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(rgb.width(), rgb.height());
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
        gray.put_pixel(x, y, Luma([luma.round().min(255.0) as u8]));
    }
    gray
}

/// Variance of the 3x3 Laplacian `[0,1,0; 1,-4,1; 0,1,0]`. Higher = sharper.
pub fn compute_laplacian_variance(img: &GrayImage) -> f32 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| img.get_pixel(x, y).0[0] as f64;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }
    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0) as f32
}

/// RMS contrast: standard deviation of intensities (0-127.5).
pub fn compute_contrast_score(img: &GrayImage) -> f32 {
    let count = (img.width() as usize) * (img.height() as usize);
    if count == 0 {
        return 0.0;
    }
    let (sum, sum_sq) = img.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0).sqrt() as f32
}

/// Stretch intensities to 0-255 in place. Returns false for flat images.
pub fn stretch_contrast(img: &mut GrayImage) -> bool {
    let (min, max) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if min >= max {
        return false;
    }
    let range = (max - min) as f32;
    for p in img.pixels_mut() {
        p.0[0] = (((p.0[0] - min) as f32 / range) * 255.0).round() as u8;
    }
    true
}

// ── Bytes ─────────────────────────────────────────────────

/// Reject clearly invalid input before decoding.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::ImageProcessing(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractionError::ImageProcessing(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb};

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    /// White page with black horizontal lines every 10 px.
    fn ruled_page(w: u32, h: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
        for y in (5..h).step_by(10) {
            for x in 0..w {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        img
    }

    #[test]
    fn tiny_and_huge_inputs_rejected() {
        assert!(validate_image_bytes(&[0u8; 10]).is_err());
        assert!(validate_image_bytes(&vec![0u8; MAX_IMAGE_BYTES + 1]).is_err());
        assert!(validate_image_bytes(&[0u8; 100]).is_ok());
    }

    #[test]
    fn garbage_bytes_fail_decoding() {
        let err = prepare_page(&[7u8; 200], true).unwrap_err();
        assert!(err.to_string().contains("decoding"), "got {err}");
    }

    #[test]
    fn prepared_page_keeps_dimensions() {
        let page = prepare_page(&png_bytes(ruled_page(120, 80)), true).unwrap();
        assert_eq!(page.width(), 120);
        assert_eq!(page.height(), 80);
        assert_eq!(page.orientation, 1);
        assert!(!page.contrast_enhanced);
        // Re-encoded PNG decodes to the same size.
        let decoded = image::load_from_memory(&page.analysis_png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
    }

    #[test]
    fn blank_page_warned() {
        let warnings = assess_quality(&GrayImage::from_pixel(50, 50, Luma([255])));
        assert_eq!(warnings, vec![QualityWarning::BlankPage]);
    }

    #[test]
    fn faded_scan_is_stretched() {
        // Gray lines on light-gray paper: low contrast.
        let mut img = RgbImage::from_pixel(60, 60, Rgb([200, 200, 200]));
        for x in 0..60 {
            img.put_pixel(x, 30, Rgb([170, 170, 170]));
        }
        let page = prepare_page(&png_bytes(img), true).unwrap();
        assert!(page.contrast_enhanced);
        assert_eq!(page.luma.get_pixel(0, 30).0[0], 0);
        assert_eq!(page.luma.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn enhancement_can_be_disabled() {
        let mut img = RgbImage::from_pixel(60, 60, Rgb([200, 200, 200]));
        img.put_pixel(3, 3, Rgb([180, 180, 180]));
        let page = prepare_page(&png_bytes(img), false).unwrap();
        assert!(!page.contrast_enhanced);
        assert_eq!(page.luma.get_pixel(0, 0).0[0], 200);
    }

    #[test]
    fn orientation_six_rotates_clockwise() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 20));
        let rotated = apply_orientation(img, 6);
        assert_eq!((rotated.width(), rotated.height()), (20, 40));
    }

    #[test]
    fn gray_conversion_weights() {
        let rgb = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(rgb_to_gray(&rgb).get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn contrast_and_sharpness_metrics() {
        let flat = GrayImage::from_pixel(20, 20, Luma([128]));
        assert!(compute_contrast_score(&flat).abs() < f32::EPSILON);
        assert!(compute_laplacian_variance(&flat).abs() < f32::EPSILON);

        let ruled = rgb_to_gray(&ruled_page(40, 40));
        assert!(compute_contrast_score(&ruled) > CONTRAST_THRESHOLD);
        assert!(compute_laplacian_variance(&ruled) > BLUR_THRESHOLD);
    }
}
