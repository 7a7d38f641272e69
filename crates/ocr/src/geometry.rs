//! Geometric analysis of page images: skew, coarse orientation, text regions.
//!
//! All functions take a grayscale page with dark text on a light background
//! and return new images; inputs are never modified.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::region_labelling::{connected_components, Connectivity};

const INK: u8 = 255;
/// Skew estimation runs on a copy no larger than this on its long side.
const ANALYSIS_MAX_SIDE: u32 = 2000;
/// Angles below this are not worth resampling the page for.
const MIN_CORRECTION_DEG: f32 = 0.3;

/// Foreground mask: ink pixels (at or below the Otsu level) become 255.
pub fn ink_mask(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (src, dst) in gray.pixels().zip(mask.pixels_mut()) {
        if src[0] <= level {
            dst[0] = INK;
        }
    }
    mask
}

/// Fraction of the page covered by ink.
pub fn ink_ratio(mask: &GrayImage) -> f32 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    mask.as_raw().iter().filter(|&&p| p == INK).count() as f32 / total as f32
}

/// Run-length smoothing along rows: background runs shorter than `gap`
/// that sit between two ink pixels are filled.
pub fn smear_horizontal(mask: &GrayImage, gap: u32) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = mask.clone();
    for y in 0..h {
        let mut last_ink: Option<u32> = None;
        for x in 0..w {
            if mask.get_pixel(x, y)[0] == INK {
                if let Some(prev) = last_ink {
                    if x - prev > 1 && x - prev <= gap {
                        for fx in prev + 1..x {
                            out.put_pixel(fx, y, Luma([INK]));
                        }
                    }
                }
                last_ink = Some(x);
            }
        }
    }
    out
}

/// Column-wise counterpart of [`smear_horizontal`].
pub fn smear_vertical(mask: &GrayImage, gap: u32) -> GrayImage {
    let rotated = imageops::rotate90(mask);
    imageops::rotate270(&smear_horizontal(&rotated, gap))
}

#[derive(Debug, Clone, Copy, Default)]
struct Blob {
    count: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Blob {
    fn add(&mut self, x: u32, y: u32) {
        if self.count == 0.0 {
            self.min_x = x;
            self.max_x = x;
            self.min_y = y;
            self.max_y = y;
        }
        let (fx, fy) = (x as f64, y as f64);
        self.count += 1.0;
        self.sx += fx;
        self.sy += fy;
        self.sxx += fx * fx;
        self.syy += fy * fy;
        self.sxy += fx * fy;
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }

    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    /// Principal-axis angle in degrees (y down, positive = descending to the right)
    /// and the ratio of the major to the minor second moment.
    fn orientation(&self) -> (f32, f64) {
        let n = self.count;
        let mx = self.sx / n;
        let my = self.sy / n;
        let mu20 = self.sxx / n - mx * mx;
        let mu02 = self.syy / n - my * my;
        let mu11 = self.sxy / n - mx * my;
        let theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
        let half_sum = (mu20 + mu02) / 2.0;
        let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
        let major = half_sum + spread;
        let minor = (half_sum - spread).max(1e-6);
        (theta.to_degrees() as f32, major / minor)
    }
}

fn blobs(mask: &GrayImage) -> Vec<Blob> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut stats: Vec<Blob> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if stats.len() <= label {
            stats.resize(label + 1, Blob::default());
        }
        stats[label].add(x, y);
    }
    stats.into_iter().filter(|b| b.count > 0.0).collect()
}

fn analysis_copy(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let long = w.max(h);
    if long <= ANALYSIS_MAX_SIDE {
        return gray.clone();
    }
    let scale = ANALYSIS_MAX_SIDE as f32 / long as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(gray, nw, nh, FilterType::Triangle)
}

/// Dominant text-line angle in degrees, from the principal axes of smeared
/// line blobs. Falls back to clustering Hough line angles.
pub fn estimate_skew(gray: &GrayImage, max_angle: f32) -> Option<f32> {
    let work = analysis_copy(gray);
    let mask = ink_mask(&work);
    if ink_ratio(&mask) < 0.002 {
        return None;
    }
    skew_from_components(&mask, max_angle).or_else(|| skew_from_hough(&work, max_angle))
}

fn skew_from_components(mask: &GrayImage, max_angle: f32) -> Option<f32> {
    let gap = (mask.width() / 60).clamp(8, 40);
    let lines = smear_horizontal(mask, gap);
    let min_width = (mask.width() / 12).max(30);

    let mut samples: Vec<(f32, f64)> = blobs(&lines)
        .into_iter()
        .filter(|b| b.width() >= min_width && b.count >= 50.0)
        .filter_map(|b| {
            let (angle, elongation) = b.orientation();
            (elongation > 16.0 && angle.abs() <= max_angle).then_some((angle, b.count))
        })
        .collect();
    if samples.len() < 3 {
        return None;
    }

    samples.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = samples.iter().map(|s| s.1).sum();
    let mut acc = 0.0;
    samples
        .iter()
        .find(|s| {
            acc += s.1;
            acc >= total / 2.0
        })
        .map(|s| s.0)
}

fn skew_from_hough(gray: &GrayImage, max_angle: f32) -> Option<f32> {
    let edges = imageproc::edges::canny(gray, 50.0, 120.0);
    let options = LineDetectionOptions {
        vote_threshold: (gray.width() / 4).max(20),
        suppression_radius: 8,
    };
    let mut histogram = std::collections::BTreeMap::<i32, usize>::new();
    for line in detect_lines(&edges, options) {
        // A horizontal line has a vertical normal (90 degrees).
        let skew = line.angle_in_degrees as i32 - 90;
        if (skew.abs() as f32) <= max_angle {
            *histogram.entry(skew).or_default() += 1;
        }
    }
    histogram
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.abs().cmp(&a.0.abs())))
        .map(|(angle, _)| angle as f32)
}

/// Rotate away the detected skew. Returns the image and the angle removed.
pub fn deskew(gray: &GrayImage, max_angle: f32) -> (GrayImage, Option<f32>) {
    match estimate_skew(gray, max_angle) {
        Some(angle) if angle.abs() >= MIN_CORRECTION_DEG => {
            let rotated = rotate_about_center(
                gray,
                -angle.to_radians(),
                Interpolation::Bilinear,
                Luma([255u8]),
            );
            (rotated, Some(angle))
        }
        _ => (gray.clone(), None),
    }
}

/// Squared coefficient of variation of the row and column ink profiles.
pub(crate) fn projection_energy(mask: &GrayImage) -> (f64, f64) {
    let (w, h) = mask.dimensions();
    let mut rows = vec![0f64; h as usize];
    let mut cols = vec![0f64; w as usize];
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == INK {
            rows[y as usize] += 1.0;
            cols[x as usize] += 1.0;
        }
    }
    fn cv2(profile: &[f64]) -> f64 {
        if profile.is_empty() {
            return 0.0;
        }
        let n = profile.len() as f64;
        let mean = profile.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        let var = profile.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        var / (mean * mean)
    }
    (cv2(&rows), cv2(&cols))
}

/// Clockwise rotation that brings a quarter-turned page upright: `0` when
/// text lines already run horizontally, `270` when they run vertically.
/// Profile energy cannot tell 90 from 270 (or 0 from 180); the caller covers
/// that ambiguity by also trying the opposite orientation.
pub fn detect_quarter_turn(gray: &GrayImage) -> u32 {
    let work = analysis_copy(gray);
    let mask = ink_mask(&work);
    if ink_ratio(&mask) < 0.002 {
        return 0;
    }
    let (rows, cols) = projection_energy(&mask);
    if cols > rows * 1.5 {
        270
    } else {
        0
    }
}

/// Rotate clockwise by a multiple of 90 degrees.
pub fn rotate_quarter(gray: &GrayImage, angle: u32) -> GrayImage {
    match angle % 360 {
        90 => imageops::rotate90(gray),
        180 => imageops::rotate180(gray),
        270 => imageops::rotate270(gray),
        _ => gray.clone(),
    }
}

/// Axis-aligned block of text, in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn crop(&self, gray: &GrayImage) -> GrayImage {
        imageops::crop_imm(gray, self.x, self.y, self.width, self.height).to_image()
    }
}

/// Text blocks found by smearing ink into line bars, then smearing the bars
/// into blocks, and taking connected components. At most `max_regions` of the largest blocks are
/// returned, in reading order (top to bottom, then left to right).
pub fn text_regions(gray: &GrayImage, max_regions: usize) -> Vec<Region> {
    let (w, h) = gray.dimensions();
    let mask = ink_mask(gray);
    let hgap = (w / 40).clamp(10, 60);
    let vgap = (h / 80).clamp(6, 30);
    let blocks = smear_vertical(&smear_horizontal(&mask, hgap), vgap);

    const PAD: u32 = 8;
    let mut regions: Vec<Region> = blobs(&blocks)
        .into_iter()
        .filter(|b| b.height() >= 8 && b.width() >= 8 && b.count >= 64.0)
        .map(|b| {
            let x = b.min_x.saturating_sub(PAD);
            let y = b.min_y.saturating_sub(PAD);
            Region {
                x,
                y,
                width: (b.max_x + PAD + 1).min(w) - x,
                height: (b.max_y + PAD + 1).min(h) - y,
            }
        })
        .collect();

    regions.sort_by(|a, b| b.area().cmp(&a.area()));
    regions.truncate(max_regions);
    regions.sort_by_key(|r| (r.y, r.x));
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::tests::synthetic_page;
    use image::ImageBuffer;

    fn stripes(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            if x > 50 && x < width - 50 && y > 50 && y < height - 50 && (y / 12) % 3 == 0 {
                Luma([20u8])
            } else {
                Luma([230u8])
            }
        })
    }

    #[test]
    fn ink_mask_marks_dark_pixels() {
        let mask = ink_mask(&stripes(400, 400));
        assert_eq!(mask.get_pixel(200, 60)[0], INK);
        assert_eq!(mask.get_pixel(10, 10)[0], 0);
        let ratio = ink_ratio(&mask);
        assert!(ratio > 0.1 && ratio < 0.4, "ratio {ratio}");
    }

    #[test]
    fn smear_fills_short_gaps_only() {
        let mut mask = GrayImage::new(30, 1);
        for x in [2u32, 5, 25] {
            mask.put_pixel(x, 0, Luma([INK]));
        }
        let out = smear_horizontal(&mask, 4);
        assert!((2..=5).all(|x| out.get_pixel(x, 0)[0] == INK));
        assert_eq!(out.get_pixel(10, 0)[0], 0);
        assert_eq!(out.get_pixel(25, 0)[0], INK);
    }

    #[test]
    fn upright_page_has_no_skew() {
        let skew = estimate_skew(&stripes(900, 900), 15.0).unwrap_or(0.0);
        assert!(skew.abs() < 0.5, "skew {skew}");
    }

    #[test]
    fn skew_is_measured_and_removed() {
        let page = stripes(900, 900);
        let tilted =
            rotate_about_center(&page, 5f32.to_radians(), Interpolation::Bilinear, Luma([230u8]));
        let measured = estimate_skew(&tilted, 15.0).expect("skew detected");
        assert!((measured - 5.0).abs() < 1.0, "measured {measured}");

        let (straight, removed) = deskew(&tilted, 15.0);
        assert!(removed.is_some());
        let residual = estimate_skew(&straight, 15.0).unwrap_or(0.0);
        assert!(residual.abs() < 1.0, "residual {residual}");
    }

    #[test]
    fn quarter_turn_detected_on_rotated_page() {
        let page = synthetic_page(900, 1200);
        assert_eq!(detect_quarter_turn(&page), 0);
        let rotated = imageops::rotate90(&page);
        let fix = detect_quarter_turn(&rotated);
        assert_eq!(fix, 270);
        assert_eq!(rotate_quarter(&rotated, fix), page);
    }

    #[test]
    fn blank_page_needs_no_rotation() {
        let blank: GrayImage = ImageBuffer::from_fn(300, 300, |_, _| Luma([240u8]));
        assert_eq!(detect_quarter_turn(&blank), 0);
        assert!(estimate_skew(&blank, 15.0).is_none());
    }

    #[test]
    fn regions_found_in_reading_order() {
        let page: GrayImage = ImageBuffer::from_fn(800, 800, |x, y| {
            let top_block = (100..300).contains(&x) && (80..140).contains(&y) && (y / 6) % 2 == 0;
            let bottom_block =
                (400..700).contains(&x) && (500..560).contains(&y) && (y / 6) % 2 == 0;
            if top_block || bottom_block {
                Luma([10u8])
            } else {
                Luma([240u8])
            }
        });
        let regions = text_regions(&page, 10);
        assert_eq!(regions.len(), 2, "{regions:?}");
        assert!(regions[0].y < regions[1].y);
        assert!(regions[0].x <= 100 && regions[0].x + regions[0].width >= 300);
        let crop = regions[1].crop(&page);
        assert_eq!(crop.dimensions(), (regions[1].width, regions[1].height));
    }
}
