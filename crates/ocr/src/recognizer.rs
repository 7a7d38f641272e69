use std::io::Cursor;
use std::sync::OnceLock;
use std::time::Duration;

use image::{DynamicImage, GrayImage, ImageFormat};
use regex::Regex;
use thiserror::Error;

use crate::types::RecognitionConfig;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("Tesseract not available, build with the `tesseract` feature")]
    NotAvailable,
    #[error("OCR engine panicked: {0}")]
    Panicked(String),
    #[error("OCR engine timed out after {0:?}")]
    Timeout(Duration),
    #[error("OCR worker killed by signal {signal}")]
    Crashed { signal: i32 },
    #[error("OCR worker failed: {0}")]
    Worker(String),
    #[error("Recognition cancelled")]
    Cancelled,
}

/// Raw engine output for one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Recognition {
    pub text: String,
    /// Page-level confidence reported by the engine, 0–100.
    pub mean_confidence: Option<f32>,
    /// Per-word confidences, when the engine exposes them.
    pub word_confidences: Vec<f32>,
}

impl Recognition {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.mean_confidence = Some(confidence);
        self
    }

    /// Average of the word confidences, else the engine's page figure, else
    /// a heuristic estimate from the text itself.
    pub fn confidence(&self) -> f32 {
        let raw = if !self.word_confidences.is_empty() {
            self.word_confidences.iter().sum::<f32>() / self.word_confidences.len() as f32
        } else if let Some(c) = self.mean_confidence {
            c
        } else {
            estimate_confidence(&self.text)
        };
        raw.clamp(0.0, 100.0)
    }
}

/// Abstraction over an OCR backend.
/// Implementations receive a grayscale page and the engine settings to use.
pub trait OcrBackend: Send + Sync {
    fn recognize(
        &self,
        image: &GrayImage,
        config: &RecognitionConfig,
    ) -> Result<Recognition, OcrError>;

    /// Clockwise rotation (0/90/180/270) needed to make the page upright,
    /// if the engine can tell.
    fn detect_orientation(&self, _image: &GrayImage) -> Option<u32> {
        None
    }
}

/// Confidence guess for engines that report none: favour longer text made
/// mostly of letters and digits, and punish symbol soup.
pub fn estimate_confidence(text: &str) -> f32 {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.is_empty() {
        return 0.0;
    }
    let n = chars.len() as f32;
    let alnum = chars.iter().filter(|c| c.is_alphanumeric()).count() as f32 / n;
    let symbols = 1.0 - alnum;
    let length = (n / 40.0).min(1.0);

    let mut score = 100.0 * alnum * (0.6 + 0.4 * length);
    if symbols > 0.3 {
        score -= (symbols - 0.3) * 100.0;
    }
    score.clamp(0.0, 100.0)
}

/// Word confidences (`x_wconf`) from an hOCR document, in reading order.
pub fn hocr_word_confidences(hocr: &str) -> Vec<f32> {
    static WORD: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = r#"class=['"]ocrx_word['"][^>]*?x_wconf\s+(\d+(?:\.\d+)?)"#;
    let Some(word) = WORD.get_or_init(|| Regex::new(pattern).ok()) else {
        return Vec::new();
    };
    word.captures_iter(hocr)
        .filter_map(|c| c[1].parse::<f32>().ok())
        .map(|c| c.clamp(0.0, 100.0))
        .collect()
}

/// Margin by which a rotated reading must beat the upright one.
const ORIENTATION_MARGIN: i32 = 10;

/// Pick the rotation whose reading the engine trusts most. `scores` holds
/// `(angle, mean confidence)` pairs; the upright reading (angle 0) wins
/// unless another angle beats it by [`ORIENTATION_MARGIN`].
pub fn pick_orientation(scores: &[(u32, i32)]) -> Option<u32> {
    let upright = scores.iter().find(|(a, _)| *a == 0).map(|(_, c)| *c)?;
    let (angle, best) = scores.iter().copied().max_by_key(|&(a, c)| (c, a == 0))?;
    if angle != 0 && best >= upright + ORIENTATION_MARGIN {
        Some(angle)
    } else {
        Some(0)
    }
}

/// PNG-encode a grayscale page for engines and workers that take encoded bytes.
pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, OcrError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(image.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
    Ok(buf)
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string. Useful for exercising the pipeline without
/// requiring Tesseract to be installed.
pub struct MockRecognizer {
    pub text: String,
    pub confidence: Option<f32>,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), confidence: None }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(
        &self,
        _image: &GrayImage,
        _config: &RecognitionConfig,
    ) -> Result<Recognition, OcrError> {
        Ok(Recognition {
            text: self.text.clone(),
            mean_confidence: self.confidence,
            word_confidences: Vec::new(),
        })
    }
}

/// Stand-in when the crate was built without an engine.
pub struct UnavailableRecognizer;

impl OcrBackend for UnavailableRecognizer {
    fn recognize(
        &self,
        _image: &GrayImage,
        _config: &RecognitionConfig,
    ) -> Result<Recognition, OcrError> {
        Err(OcrError::NotAvailable)
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{encode_png, hocr_word_confidences, pick_orientation};
    use super::{OcrBackend, OcrError, Recognition};
    use crate::types::{PageSegMode, RecognitionConfig};
    use image::imageops::{rotate180, rotate270, rotate90};
    use image::GrayImage;
    use leptess::{LepTess, Variable};
    use tracing::{debug, warn};

    pub struct TesseractRecognizer {
        data_path: Option<String>,
        /// Language used for orientation readings.
        language: String,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>, language: impl Into<String>) -> Self {
            Self { data_path, language: language.into() }
        }

        /// A fresh engine per call: leptess handles are not Sync.
        fn engine(&self, config: &RecognitionConfig) -> Result<LepTess, OcrError> {
            let mut lt = LepTess::new(self.data_path.as_deref(), &config.language)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            // The engine mode is fixed once traineddata is loaded; an engine
            // that refuses the override keeps its default.
            if let Err(e) =
                lt.set_variable(Variable::TesseditOcrEngineMode, &config.oem.code().to_string())
            {
                warn!("Engine mode {} not applied: {e}", config.oem.code());
            }
            lt.set_variable(Variable::TesseditPagesegMode, &config.psm.code().to_string())
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            if let Some(wl) = &config.whitelist {
                lt.set_variable(Variable::TesseditCharWhitelist, wl)
                    .map_err(|e| OcrError::Engine(e.to_string()))?;
            }
            Ok(lt)
        }

        fn read(
            &self,
            image: &GrayImage,
            config: &RecognitionConfig,
        ) -> Result<(LepTess, String), OcrError> {
            let png = encode_png(image)?;
            let mut lt = self.engine(config)?;
            lt.set_image_from_mem(&png).map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            let text = lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))?;
            Ok((lt, text))
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn recognize(
            &self,
            image: &GrayImage,
            config: &RecognitionConfig,
        ) -> Result<Recognition, OcrError> {
            let (mut lt, text) = self.read(image, config)?;
            let mean = lt.mean_text_conf();
            let word_confidences = match lt.get_hocr_text(0) {
                Ok(hocr) => hocr_word_confidences(&hocr),
                Err(e) => {
                    debug!("No hOCR output for word confidences: {e}");
                    Vec::new()
                }
            };
            Ok(Recognition {
                text,
                mean_confidence: Some(mean.clamp(0, 100) as f32),
                word_confidences,
            })
        }

        fn detect_orientation(&self, image: &GrayImage) -> Option<u32> {
            let config = RecognitionConfig::new(PageSegMode::Auto, self.language.as_str());
            let candidates = [
                (0, image.clone()),
                (90, rotate90(image)),
                (180, rotate180(image)),
                (270, rotate270(image)),
            ];
            let mut scores = Vec::with_capacity(candidates.len());
            for (angle, rotated) in candidates {
                match self.read(&rotated, &config) {
                    Ok((lt, _)) => scores.push((angle, lt.mean_text_conf())),
                    Err(e) => debug!(angle, "Orientation reading failed: {e}"),
                }
            }
            pick_orientation(&scores)
        }
    }
}
