use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::filter::{gaussian_blur_f32, median_filter};
use tracing::debug;

use crate::config::{DocumentProfile, QualityThresholds};
use crate::geometry;
use crate::quality::{intensity_stats, QualityReport};

/// Largest skew the deskew step will try to undo, in degrees.
const MAX_SKEW_DEG: f32 = 15.0;
/// Upscaling never grows the long side beyond this.
const MAX_UPSCALED_SIDE: u32 = 6000;

/// How the coarse orientation step decides on a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Use the engine's answer when present, else the projection heuristic.
    Detect { engine_hint: Option<u32> },
    /// Apply exactly this clockwise rotation.
    Fixed(u32),
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub orientation: Orientation,
    /// Skip deskew regardless of profile (tiles of a large page).
    pub skip_deskew: bool,
    /// Apply every tonal correction whether or not the report asks for it.
    pub force_enhance: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            orientation: Orientation::Detect { engine_hint: None },
            skip_deskew: false,
            force_enhance: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub image: GrayImage,
    /// Steps applied, in order, for metadata.
    pub steps: Vec<String>,
    /// Clockwise rotation applied by the orientation step.
    pub rotation: u32,
    pub skew: Option<f32>,
}

/// Upscale, deskew, orient, equalize, denoise/sharpen, and fix brightness,
/// strictly in that order. Each step may be skipped by the profile, the
/// options, or because the quality report does not call for it.
pub fn normalize(
    gray: &GrayImage,
    profile: &DocumentProfile,
    report: &QualityReport,
    thresholds: &QualityThresholds,
    options: NormalizeOptions,
) -> Normalized {
    let mut steps = Vec::new();
    let mut img = gray.clone();

    // 1. Upscale small inputs.
    let short = img.width().min(img.height());
    if short > 0 && short < profile.min_short_side {
        let scale = (profile.min_short_side as f32 / short as f32)
            .min(MAX_UPSCALED_SIDE as f32 / img.width().max(img.height()) as f32);
        if scale > 1.0 {
            let nw = (img.width() as f32 * scale).round() as u32;
            let nh = (img.height() as f32 * scale).round() as u32;
            img = imageops::resize(&img, nw, nh, FilterType::CatmullRom);
            steps.push(format!("upscale x{scale:.2}"));
        }
    }

    // 2. Small-angle deskew.
    let mut skew = None;
    if profile.deskew && !options.skip_deskew {
        let (straight, angle) = geometry::deskew(&img, MAX_SKEW_DEG);
        if let Some(angle) = angle {
            img = straight;
            skew = Some(angle);
            steps.push(format!("deskew {angle:.1}deg"));
        }
    }

    // 3. Coarse orientation.
    let rotation = match options.orientation {
        Orientation::Detect { engine_hint: Some(angle) } => angle % 360,
        Orientation::Detect { engine_hint: None } => geometry::detect_quarter_turn(&img),
        Orientation::Fixed(angle) => angle % 360,
        Orientation::Skip => 0,
    };
    if rotation != 0 {
        img = geometry::rotate_quarter(&img, rotation);
        steps.push(format!("rotate {rotation}deg"));
    }

    // 4. Local contrast.
    if options.force_enhance || report.is_low_contrast(thresholds) {
        img = clahe(&img, profile.contrast_clip_limit, 8);
        steps.push(format!("clahe clip={:.1}", profile.contrast_clip_limit));
    }

    // 5. Denoise acceptable-but-noisy input; sharpen blurry input.
    if report.is_blurry(thresholds) {
        img = unsharp_mask(&img, 1.5, 1.2);
        steps.push("sharpen".to_string());
    } else if profile.denoise && profile.denoise_strength > 0 {
        img = median_filter(&img, profile.denoise_strength, profile.denoise_strength);
        steps.push(format!("denoise r={}", profile.denoise_strength));
    }

    // 6. Brightness.
    let drifted = options.force_enhance && {
        let (mean, _) = intensity_stats(&img);
        mean < thresholds.min_brightness + 30.0 || mean > thresholds.max_brightness - 30.0
    };
    if report.brightness_out_of_band(thresholds) || drifted {
        img = rebalance_brightness(&img);
        steps.push("brightness".to_string());
    }

    debug!("Normalized {}x{} with steps {:?}", img.width(), img.height(), steps);
    Normalized { image: img, steps, rotation, skew }
}

/// Contrast-limited adaptive histogram equalization over a `grid`×`grid`
/// tiling, with bilinear blending between neighbouring tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tiles_x = grid.min((w / 16).max(1));
    let tiles_y = grid.min((h / 16).max(1));
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let pixels = ((x1.saturating_sub(x0)) * (y1.saturating_sub(y0))).max(1);
            luts[(ty * tiles_x + tx) as usize] = clipped_equalization(&hist, pixels, clip_limit);
        }
    }

    let axis = |pos: u32, tile: u32, tiles: u32| -> (usize, usize, f32) {
        let g = (pos as f32 + 0.5) / tile as f32 - 0.5;
        let i0 = g.floor().clamp(0.0, (tiles - 1) as f32) as u32;
        let i1 = (i0 + 1).min(tiles - 1);
        let f = (g - i0 as f32).clamp(0.0, 1.0);
        (i0 as usize, i1 as usize, f)
    };

    ImageBuffer::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0] as usize;
        let (x0, x1, fx) = axis(x, tile_w, tiles_x);
        let (y0, y1, fy) = axis(y, tile_h, tiles_y);
        let at = |ix: usize, iy: usize| luts[iy * tiles_x as usize + ix][v] as f32;
        let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
        let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
        Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
    })
}

fn clipped_equalization(hist: &[u32; 256], pixels: u32, clip_limit: f32) -> [u8; 256] {
    let limit = ((clip_limit.max(1.0) * pixels as f32 / 256.0).ceil() as u32).max(1);
    let mut clipped = *hist;
    let mut excess = 0u32;
    for bin in clipped.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in clipped.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for (i, &count) in clipped.iter().enumerate() {
        cdf += count as u64;
        lut[i] = ((cdf * 255) / pixels as u64).min(255) as u8;
    }
    lut
}

/// `out = orig + amount * (orig - blur(orig))`.
pub fn unsharp_mask(gray: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, sigma);
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let o = gray.get_pixel(x, y)[0] as f32;
        let b = blurred.get_pixel(x, y)[0] as f32;
        Luma([(o + amount * (o - b)).round().clamp(0.0, 255.0) as u8])
    })
}

/// Linear gain and bias moving the mean to mid-gray and stretching a flat
/// histogram to a usable spread.
pub fn rebalance_brightness(gray: &GrayImage) -> GrayImage {
    let (mean, std) = intensity_stats(gray);
    let gain = if std > 1.0 { (50.0 / std).clamp(1.0, 3.0) } else { 1.0 };
    let bias = 128.0 - gain * mean;
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = (gain * p[0] as f64 + bias).round().clamp(0.0, 255.0) as u8;
    }
    out
}
