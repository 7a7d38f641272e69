use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contrast::{adaptive_threshold, otsu_level};
use imageproc::definitions::Image;
use imageproc::filter::gaussian_blur_f32;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BinarizeError {
    #[error("Window of {window}px does not fit a {width}x{height} image")]
    WindowTooLarge { window: u32, width: u32, height: u32 },
    #[error("Image is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BinarizationMethod {
    AdaptiveMean,
    AdaptiveGaussian,
    Otsu,
    Sauvola,
}

impl BinarizationMethod {
    pub const ALL: [BinarizationMethod; 4] = [
        BinarizationMethod::AdaptiveMean,
        BinarizationMethod::AdaptiveGaussian,
        BinarizationMethod::Otsu,
        BinarizationMethod::Sauvola,
    ];
}

impl std::fmt::Display for BinarizationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinarizationMethod::AdaptiveMean => write!(f, "adaptive_mean"),
            BinarizationMethod::AdaptiveGaussian => write!(f, "adaptive_gaussian"),
            BinarizationMethod::Otsu => write!(f, "otsu"),
            BinarizationMethod::Sauvola => write!(f, "sauvola"),
        }
    }
}

impl std::str::FromStr for BinarizationMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adaptive_mean" | "mean" => Ok(BinarizationMethod::AdaptiveMean),
            "adaptive_gaussian" | "gaussian" => Ok(BinarizationMethod::AdaptiveGaussian),
            "otsu" => Ok(BinarizationMethod::Otsu),
            "sauvola" => Ok(BinarizationMethod::Sauvola),
            other => Err(format!("Unknown binarization method: '{other}'")),
        }
    }
}

/// A black/white rendering of a page and the rule that produced it.
#[derive(Debug, Clone)]
pub struct Binarized {
    pub image: GrayImage,
    pub method: BinarizationMethod,
}

/// Local window for the adaptive methods (2 * radius + 1 pixels wide).
const BLOCK_RADIUS: u32 = 12;
/// Offset subtracted from the local mean for the adaptive methods.
const ADAPTIVE_C: i32 = 10;
const SAUVOLA_K: f64 = 0.34;
const SAUVOLA_R: f64 = 128.0;

/// Render `gray` with every method. A method that fails is logged and left
/// out; Otsu never fails on a non-empty image, so the result is empty only
/// for an empty input.
pub fn binarize(gray: &GrayImage) -> Vec<Binarized> {
    BinarizationMethod::ALL
        .into_iter()
        .filter_map(|method| match binarize_with(gray, method) {
            Ok(image) => Some(Binarized { image, method }),
            Err(e) => {
                warn!("Binarization method {method} unavailable: {e}");
                None
            }
        })
        .collect()
}

pub fn binarize_with(
    gray: &GrayImage,
    method: BinarizationMethod,
) -> Result<GrayImage, BinarizeError> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Err(BinarizeError::Empty);
    }
    match method {
        BinarizationMethod::Otsu => Ok(otsu(gray)),
        BinarizationMethod::AdaptiveMean => {
            check_window(w, h)?;
            Ok(adaptive_threshold(gray, BLOCK_RADIUS, ADAPTIVE_C))
        }
        BinarizationMethod::AdaptiveGaussian => {
            check_window(w, h)?;
            let local = gaussian_blur_f32(gray, BLOCK_RADIUS as f32 / 2.0);
            Ok(threshold_by(gray, |x, y| {
                f64::from(local.get_pixel(x, y)[0]) - f64::from(ADAPTIVE_C)
            }))
        }
        BinarizationMethod::Sauvola => {
            check_window(w, h)?;
            let stats = WindowStats::new(gray);
            Ok(threshold_by(gray, |x, y| {
                let (mean, std) = stats.window(x, y, BLOCK_RADIUS);
                mean * (1.0 + SAUVOLA_K * (std / SAUVOLA_R - 1.0))
            }))
        }
    }
}

/// Global Otsu threshold; the always-available fallback.
pub fn otsu(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray) as f64;
    threshold_by(gray, |_, _| level)
}

fn check_window(w: u32, h: u32) -> Result<(), BinarizeError> {
    let window = 2 * BLOCK_RADIUS + 1;
    if w < window || h < window {
        return Err(BinarizeError::WindowTooLarge { window, width: w, height: h });
    }
    Ok(())
}

/// Pixels above their threshold become white (paper), the rest black (ink).
fn threshold_by<F>(gray: &GrayImage, threshold: F) -> GrayImage
where
    F: Fn(u32, u32) -> f64,
{
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] as f64 > threshold(x, y) {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Summed-area tables of intensity and squared intensity.
struct WindowStats {
    width: u32,
    height: u32,
    sum: Image<Luma<u64>>,
    sum_sq: Image<Luma<u64>>,
}

impl WindowStats {
    fn new(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            sum: integral_image::<_, u64>(gray),
            sum_sq: integral_squared_image::<_, u64>(gray),
        }
    }

    /// Mean and standard deviation of the window centred on (x, y), clipped to the image.
    fn window(&self, x: u32, y: u32, radius: u32) -> (f64, f64) {
        let left = x.saturating_sub(radius);
        let top = y.saturating_sub(radius);
        let right = (x + radius).min(self.width - 1);
        let bottom = (y + radius).min(self.height - 1);
        let area = f64::from(right - left + 1) * f64::from(bottom - top + 1);
        let sum = sum_image_pixels(&self.sum, left, top, right, bottom)[0] as f64;
        let sum_sq = sum_image_pixels(&self.sum_sq, left, top, right, bottom)[0] as f64;
        let mean = sum / area;
        let var = (sum_sq / area - mean * mean).max(0.0);
        (mean, var.sqrt())
    }
}
