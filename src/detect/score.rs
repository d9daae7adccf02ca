//! Two-stage frame comparison: cheap color-distribution correlation first,
//! windowed structural similarity only for frames that survive early exit.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::models::Frame;

/// Comparison working size. Both stages run on this downscaled copy, so cost
/// is independent of the source resolution.
const COMPARE_DIM: u32 = 256;

/// Hue bins (hue range [0, 180)) by saturation bins (range [0, 256)).
const HUE_BINS: usize = 50;
const SAT_BINS: usize = 60;

/// SSIM window edge in pixels.
const SSIM_WINDOW: u32 = 8;

// SSIM stabilizers for 8-bit luminance: (K1*L)^2 and (K2*L)^2 with L = 255.
const SSIM_C1: f64 = 6.5025;
const SSIM_C2: f64 = 58.5225;

/// A frame preprocessed for comparison: blurred grayscale for the structural
/// stage, hue/saturation histogram for the global stage. Cached per kept
/// keyframe so the reference side is never recomputed.
#[derive(Debug, Clone)]
pub struct FramePrep {
    pub gray: GrayImage,
    pub hist: Vec<f32>,
    /// Source resolution at capture time, to detect mid-stream resizes.
    pub source_width: u32,
    pub source_height: u32,
}

/// Resize, blur, and histogram a frame for comparison.
pub fn preprocess(frame: &Frame, blur_sigma: f32) -> FramePrep {
    let rgb: RgbImage =
        RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).unwrap_or_else(|| {
            // A short buffer scores as a black frame; the hot path must not panic.
            RgbImage::new(frame.width.max(1), frame.height.max(1))
        });
    let small = imageops::resize(&rgb, COMPARE_DIM, COMPARE_DIM, FilterType::Triangle);

    let gray = imageops::grayscale(&small);
    let gray = imageops::blur(&gray, blur_sigma);

    let hist = hs_histogram(&small);

    FramePrep {
        gray,
        hist,
        source_width: frame.width,
        source_height: frame.height,
    }
}

/// Hue/saturation histogram in an illumination-tolerant space. The value
/// channel is deliberately excluded so lighting shifts read as "no change".
fn hs_histogram(rgb: &RgbImage) -> Vec<f32> {
    let mut hist = vec![0.0f32; HUE_BINS * SAT_BINS];
    for pixel in rgb.pixels() {
        let (h, s) = rgb_to_hue_sat(pixel.0[0], pixel.0[1], pixel.0[2]);
        let h_bin = ((h as usize * HUE_BINS) / 181).min(HUE_BINS - 1);
        let s_bin = ((s as usize * SAT_BINS) / 256).min(SAT_BINS - 1);
        hist[h_bin * SAT_BINS + s_bin] += 1.0;
    }
    hist
}

/// RGB to hue [0, 180) and saturation [0, 255], 8-bit convention.
fn rgb_to_hue_sat(r: u8, g: u8, b: u8) -> (u16, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if delta == 0.0 {
        return (0, 0);
    }

    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue } / 2.0;

    let sat = if max == 0.0 { 0.0 } else { delta / max * 255.0 };

    (hue as u16, sat as u8)
}

/// Pearson correlation between two histograms, in [-1, 1].
pub fn histogram_correlation(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    let mean_a: f64 = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b: f64 = b.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        // Flat histograms: identical distributions correlate perfectly.
        return if var_a == var_b { 1.0 } else { 0.0 };
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Mean windowed SSIM over two equally-sized grayscale images, in [0, 1]
/// for natural imagery (negative values are clamped by the caller).
pub fn mean_ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let (width, height) = a.dimensions();
    let mut total = 0.0;
    let mut windows = 0u32;

    let mut wy = 0;
    while wy + SSIM_WINDOW <= height {
        let mut wx = 0;
        while wx + SSIM_WINDOW <= width {
            total += window_ssim(a, b, wx, wy);
            windows += 1;
            wx += SSIM_WINDOW;
        }
        wy += SSIM_WINDOW;
    }

    if windows == 0 {
        return 1.0;
    }
    total / windows as f64
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32) -> f64 {
    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for dy in 0..SSIM_WINDOW {
        for dx in 0..SSIM_WINDOW {
            sum_a += a.get_pixel(x0 + dx, y0 + dy).0[0] as f64;
            sum_b += b.get_pixel(x0 + dx, y0 + dy).0[0] as f64;
        }
    }
    let mean_a = sum_a / n;
    let mean_b = sum_b / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for dy in 0..SSIM_WINDOW {
        for dx in 0..SSIM_WINDOW {
            let da = a.get_pixel(x0 + dx, y0 + dy).0[0] as f64 - mean_a;
            let db = b.get_pixel(x0 + dx, y0 + dy).0[0] as f64 - mean_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    ((2.0 * mean_a * mean_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mean_a * mean_a + mean_b * mean_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
}

/// Change score in [0, 1] between a preprocessed frame and the reference
/// keyframe. Higher = more change.
///
/// When the histogram correlation exceeds `early_exit_similarity` the
/// structural stage is skipped and the score is scaled down to half, since
/// only one signal contributed. On static scenes this skips the expensive
/// stage for the large majority of frames.
pub fn change_score(
    current: &FramePrep,
    reference: &FramePrep,
    early_exit_similarity: f64,
    alpha: f64,
) -> f64 {
    let corr = histogram_correlation(&current.hist, &reference.hist);
    let global_sim = corr.max(0.0);

    if corr >= early_exit_similarity {
        return ((1.0 - global_sim) * 0.5).clamp(0.0, 1.0);
    }

    let local_sim = mean_ssim(&current.gray, &reference.gray).clamp(0.0, 1.0);
    (1.0 - (alpha * global_sim + (1.0 - alpha) * local_sim)).clamp(0.0, 1.0)
}
