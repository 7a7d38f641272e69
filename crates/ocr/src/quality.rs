use image::{DynamicImage, GrayImage};
use imageproc::filter::laplacian_filter;
use serde::{Deserialize, Serialize};

use crate::config::QualityThresholds;

/// Measured properties of a raw input image and whether it is fit for recognition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    /// Variance of the Laplacian response; higher is sharper.
    pub blur_score: f64,
    /// Mean luminance, 0–255.
    pub brightness: f64,
    /// Standard deviation of luminance.
    pub contrast: f64,
    pub width: u32,
    pub height: u32,
    pub is_acceptable: bool,
    pub recommendations: Vec<String>,
}

impl QualityReport {
    /// Report for input that could not be decoded at all.
    pub fn undecodable() -> Self {
        Self {
            blur_score: 0.0,
            brightness: 0.0,
            contrast: 0.0,
            width: 0,
            height: 0,
            is_acceptable: false,
            recommendations: vec![
                "image could not be decoded: upload a JPEG or PNG photo".to_string()
            ],
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_blurry(&self, thresholds: &QualityThresholds) -> bool {
        self.blur_score <= thresholds.min_blur
    }

    pub fn is_low_contrast(&self, thresholds: &QualityThresholds) -> bool {
        self.contrast <= thresholds.min_contrast
    }

    pub fn brightness_out_of_band(&self, thresholds: &QualityThresholds) -> bool {
        self.brightness <= thresholds.min_brightness || self.brightness >= thresholds.max_brightness
    }
}

pub fn assess(image: &DynamicImage, thresholds: &QualityThresholds) -> QualityReport {
    assess_gray(&image.to_luma8(), thresholds)
}

/// Decode and assess; never fails, undecodable input yields a (0, 0) report.
pub fn assess_bytes(data: &[u8], thresholds: &QualityThresholds) -> QualityReport {
    match image::load_from_memory(data) {
        Ok(img) => assess(&img, thresholds),
        Err(_) => QualityReport::undecodable(),
    }
}

pub fn assess_gray(gray: &GrayImage, thresholds: &QualityThresholds) -> QualityReport {
    let (width, height) = gray.dimensions();
    let blur_score = laplacian_variance(gray);
    let (brightness, contrast) = intensity_stats(gray);

    let mut recommendations = Vec::new();
    if blur_score <= thresholds.min_blur {
        recommendations.push(
            "image is blurry: hold the camera steady and keep the text in focus".to_string(),
        );
    }
    if brightness <= thresholds.min_brightness {
        recommendations.push("image too dark: increase lighting or brightness".to_string());
    } else if brightness >= thresholds.max_brightness {
        recommendations.push("image too bright: reduce glare or exposure".to_string());
    }
    if contrast <= thresholds.min_contrast {
        recommendations
            .push("low contrast: photograph on a plain, contrasting background".to_string());
    }
    if width.min(height) < thresholds.min_side {
        recommendations.push(format!(
            "resolution too low ({width}x{height}): move closer or use a higher camera resolution"
        ));
    }

    QualityReport {
        blur_score,
        brightness,
        contrast,
        width,
        height,
        is_acceptable: recommendations.is_empty(),
        recommendations,
    }
}

/// Variance of the 4-neighbour Laplacian response.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }
    let response = laplacian_filter(gray);
    let n = f64::from(gray.width()) * f64::from(gray.height());
    let (sum, sum_sq) = response.pixels().fold((0f64, 0f64), |(sum, sum_sq), p| {
        let v = f64::from(p[0]);
        (sum + v, sum_sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Mean and standard deviation of pixel intensity.
pub fn intensity_stats(gray: &GrayImage) -> (f64, f64) {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return (0.0, 0.0);
    }
    let mut histogram = [0u64; 256];
    for &p in raw {
        histogram[p as usize] += 1;
    }
    let n = raw.len() as f64;
    let mean = histogram
        .iter()
        .enumerate()
        .map(|(v, &c)| v as f64 * c as f64)
        .sum::<f64>()
        / n;
    let var = histogram
        .iter()
        .enumerate()
        .map(|(v, &c)| (v as f64 - mean).powi(2) * c as f64)
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}
