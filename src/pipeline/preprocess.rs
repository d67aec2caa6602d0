//! Image verification and preprocessing helpers.
//!
//! The primary model path only needs a verified RGB image capped to a
//! bounded size. The OCR fallback path runs a heavier chain — grayscale,
//! Otsu binarization, morphological dilation, contrast enhancement — to
//! make low-quality card photos legible to text recognition.

use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, RgbImage};
use tracing::debug;

use super::ExtractionError;

/// Longest-side cap applied before model invocation to bound latency.
pub const MAX_MODEL_DIMENSION: u32 = 1024;

/// Contrast enhancement factor for the OCR fallback chain.
const OCR_CONTRAST_FACTOR: f32 = 2.0;

/// Open an image file and re-encode it to RGB.
///
/// This is the verification step every extractor runs first: a file that
/// does not decode, or decodes to something unrepresentable as RGB, fails
/// here rather than deep inside a model call.
pub fn verify_rgb(path: &Path) -> Result<RgbImage, ExtractionError> {
    if !path.exists() {
        return Err(ExtractionError::ImageProcessing(format!(
            "Image not found: {}",
            path.display()
        )));
    }
    let img = image::open(path).map_err(|e| {
        ExtractionError::ImageProcessing(format!("Failed to read image {}: {e}", path.display()))
    })?;
    Ok(img.to_rgb8())
}

/// Downscale so the longest side does not exceed `max_dim`. Images already
/// within the cap are returned unchanged; small images are never upscaled.
pub fn cap_longest_side(img: RgbImage, max_dim: u32) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let longest = w.max(h);
    if longest <= max_dim {
        return img;
    }
    let scale = max_dim as f32 / longest as f32;
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);
    debug!(from = format!("{w}x{h}"), to = format!("{new_w}x{new_h}"), "Downscaling for model input");
    image::imageops::resize(&img, new_w, new_h, FilterType::Lanczos3)
}

/// Full OCR-fallback preprocessing chain: grayscale → Otsu binarization →
/// 3×3 dilation (one iteration) → contrast enhancement (factor 2).
///
/// Used only by the text-recognition fallback, never by the model path —
/// binarization destroys detail vision models rely on.
pub fn ocr_preprocess(img: &RgbImage) -> GrayImage {
    let gray = to_grayscale(img);
    let threshold = otsu_threshold(&gray);
    let binary = binarize(&gray, threshold);
    let dilated = dilate_3x3(&binary);
    enhance_contrast(&dilated, OCR_CONTRAST_FACTOR)
}

/// ITU-R BT.601 luminance conversion.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let (w, h) = (rgb.width(), rgb.height());
    let mut gray = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let p = rgb.get_pixel(x, y);
            let luma =
                (0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32) as u8;
            gray.put_pixel(x, y, Luma([luma]));
        }
    }
    gray
}

/// Otsu's method: the threshold maximizing between-class variance of the
/// grayscale histogram. Returns 128 for degenerate (empty/uniform) images.
pub fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in img.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 128;
    }

    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(v, &c)| v as f64 * c as f64)
        .sum();

    let mut sum_bg = 0.0f64;
    let mut weight_bg = 0u64;
    let mut best_threshold = 128u8;
    let mut best_variance = 0.0f64;

    for t in 0..256usize {
        weight_bg += histogram[t];
        if weight_bg == 0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0 {
            break;
        }
        sum_bg += t as f64 * histogram[t] as f64;

        let mean_bg = sum_bg / weight_bg as f64;
        let mean_fg = (sum_all - sum_bg) / weight_fg as f64;
        let variance =
            weight_bg as f64 * weight_fg as f64 * (mean_bg - mean_fg) * (mean_bg - mean_fg);
        if variance > best_variance {
            best_variance = variance;
            best_threshold = t as u8;
        }
    }
    best_threshold
}

/// Binarize against a threshold: above → white, at or below → black.
pub fn binarize(img: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = if p.0[0] > threshold { 255 } else { 0 };
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Morphological dilation with a 3×3 rectangular structuring element,
/// one iteration: each pixel becomes the maximum of its neighborhood.
pub fn dilate_3x3(img: &GrayImage) -> GrayImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let mut out = GrayImage::new(img.width(), img.height());
    for y in 0..h {
        for x in 0..w {
            let mut max = 0u8;
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx >= 0 && ny >= 0 && nx < w && ny < h {
                        max = max.max(img.get_pixel(nx as u32, ny as u32).0[0]);
                    }
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([max]));
        }
    }
    out
}

/// Contrast enhancement around the image mean: `out = mean + factor * (v - mean)`,
/// clamped to the valid range. Factor 1.0 is the identity.
pub fn enhance_contrast(img: &GrayImage, factor: f32) -> GrayImage {
    let total: u64 = img.pixels().map(|p| p.0[0] as u64).sum();
    let count = (img.width() as u64 * img.height() as u64).max(1);
    let mean = total as f32 / count as f32;

    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = mean + factor * (p.0[0] as f32 - mean);
        out.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
    }
    out
}

/// Encode an RGB image as PNG bytes for the vision backend payload.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, ExtractionError> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// Encode a grayscale image as PNG bytes for the OCR engine.
pub fn encode_gray_png(img: &GrayImage) -> Result<Vec<u8>, ExtractionError> {
    let dynamic = DynamicImage::ImageLuma8(img.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn flat_rgb(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([v, v, v]))
    }

    #[test]
    fn verify_rejects_missing_file() {
        let err = verify_rgb(Path::new("/nonexistent/card.jpg")).unwrap_err();
        assert!(matches!(err, ExtractionError::ImageProcessing(_)));
    }

    #[test]
    fn verify_rejects_garbage_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.jpg");
        std::fs::write(&path, [0xDE, 0xAD, 0xBE, 0xEF].repeat(64)).unwrap();
        assert!(verify_rgb(&path).is_err());
    }

    #[test]
    fn verify_reencodes_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 20, Luma([90])));
        gray.save(&path).unwrap();
        let rgb = verify_rgb(&path).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [90, 90, 90]);
    }

    #[test]
    fn cap_shrinks_oversized_landscape() {
        let capped = cap_longest_side(flat_rgb(2048, 1000, 128), MAX_MODEL_DIMENSION);
        assert_eq!(capped.width(), 1024);
        assert_eq!(capped.height(), 500);
    }

    #[test]
    fn cap_leaves_small_image_alone() {
        let capped = cap_longest_side(flat_rgb(640, 480, 128), MAX_MODEL_DIMENSION);
        assert_eq!((capped.width(), capped.height()), (640, 480));
    }

    #[test]
    fn otsu_separates_bimodal_image() {
        let mut img = GrayImage::new(10, 10);
        for (x, _, p) in img.enumerate_pixels_mut() {
            p.0[0] = if x < 5 { 30 } else { 220 };
        }
        let t = otsu_threshold(&img);
        assert!((30..220).contains(&t), "threshold {t} should split the modes");
    }

    #[test]
    fn binarize_is_two_valued() {
        let img = GrayImage::from_fn(4, 4, |x, _| Luma([(x * 60) as u8]));
        let bin = binarize(&img, 100);
        assert!(bin.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn dilation_grows_a_single_white_pixel() {
        let mut img = GrayImage::new(5, 5);
        img.put_pixel(2, 2, Luma([255]));
        let dilated = dilate_3x3(&img);
        let white = dilated.pixels().filter(|p| p.0[0] == 255).count();
        assert_eq!(white, 9, "3x3 neighborhood around the seed");
    }

    #[test]
    fn contrast_identity_at_factor_one() {
        let img = GrayImage::from_fn(8, 8, |x, y| Luma([(x * 8 + y) as u8 * 3]));
        let out = enhance_contrast(&img, 1.0);
        assert_eq!(img.as_raw(), out.as_raw());
    }

    #[test]
    fn contrast_pushes_values_apart() {
        let img = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 100 } else { 150 }]));
        let out = enhance_contrast(&img, 2.0);
        let lo = out.get_pixel(0, 0).0[0];
        let hi = out.get_pixel(1, 0).0[0];
        assert!(hi as i32 - lo as i32 > 50);
    }

    #[test]
    fn ocr_chain_produces_binary_dominated_output() {
        let mut rgb = RgbImage::from_pixel(20, 20, Rgb([240, 240, 240]));
        for x in 5..15 {
            rgb.put_pixel(x, 10, Rgb([20, 20, 20]));
        }
        let out = ocr_preprocess(&rgb);
        assert_eq!(out.dimensions(), (20, 20));
        // After binarize + contrast the extremes dominate.
        let extreme = out.pixels().filter(|p| p.0[0] < 30 || p.0[0] > 225).count();
        assert!(extreme > 350);
    }

    #[test]
    fn png_round_trip() {
        let bytes = encode_png(&flat_rgb(12, 9, 77)).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (12, 9));
        assert_eq!(decoded.get_pixel(3, 3).0, [77, 77, 77]);
    }
}
