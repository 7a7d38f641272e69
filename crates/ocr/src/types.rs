use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::ExecutionPath;
use crate::binarize::BinarizationMethod;
use crate::quality::QualityReport;

/// The caller's hint about what kind of document the image shows.
/// Each variant maps to a bundled [`crate::config::DocumentProfile`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Receipt,
    Invoice,
    Document,
    Form,
    Screenshot,
    Photo,
    #[default]
    General,
}

impl DocumentType {
    pub const ALL: [DocumentType; 7] = [
        DocumentType::Receipt,
        DocumentType::Invoice,
        DocumentType::Document,
        DocumentType::Form,
        DocumentType::Screenshot,
        DocumentType::Photo,
        DocumentType::General,
    ];

    /// Receipts and invoices get the extra date/amount normalization pass.
    pub fn is_financial(self) -> bool {
        matches!(self, DocumentType::Receipt | DocumentType::Invoice)
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentType::Receipt => "receipt",
            DocumentType::Invoice => "invoice",
            DocumentType::Document => "document",
            DocumentType::Form => "form",
            DocumentType::Screenshot => "screenshot",
            DocumentType::Photo => "photo",
            DocumentType::General => "general",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DocumentType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "receipt" => Ok(DocumentType::Receipt),
            "invoice" => Ok(DocumentType::Invoice),
            "document" => Ok(DocumentType::Document),
            "form" => Ok(DocumentType::Form),
            "screenshot" => Ok(DocumentType::Screenshot),
            "photo" => Ok(DocumentType::Photo),
            "general" | "" => Ok(DocumentType::General),
            other => Err(format!("Unknown document type: '{other}'")),
        }
    }
}

/// Engine page-segmentation mode, carrying the engine's numeric code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageSegMode {
    Auto,
    SingleColumn,
    SingleBlockVertical,
    SingleBlock,
    SingleLine,
    SingleWord,
    SparseText,
    SparseTextOsd,
    RawLine,
}

impl PageSegMode {
    pub fn code(self) -> u8 {
        match self {
            PageSegMode::Auto => 3,
            PageSegMode::SingleColumn => 4,
            PageSegMode::SingleBlockVertical => 5,
            PageSegMode::SingleBlock => 6,
            PageSegMode::SingleLine => 7,
            PageSegMode::SingleWord => 8,
            PageSegMode::SparseText => 11,
            PageSegMode::SparseTextOsd => 12,
            PageSegMode::RawLine => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            3 => PageSegMode::Auto,
            4 => PageSegMode::SingleColumn,
            5 => PageSegMode::SingleBlockVertical,
            6 => PageSegMode::SingleBlock,
            7 => PageSegMode::SingleLine,
            8 => PageSegMode::SingleWord,
            11 => PageSegMode::SparseText,
            12 => PageSegMode::SparseTextOsd,
            13 => PageSegMode::RawLine,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            PageSegMode::Auto => "auto",
            PageSegMode::SingleColumn => "single_column",
            PageSegMode::SingleBlockVertical => "single_block_vertical",
            PageSegMode::SingleBlock => "single_block",
            PageSegMode::SingleLine => "single_line",
            PageSegMode::SingleWord => "single_word",
            PageSegMode::SparseText => "sparse_text",
            PageSegMode::SparseTextOsd => "sparse_text_osd",
            PageSegMode::RawLine => "raw_line",
        }
    }
}

impl std::fmt::Display for PageSegMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for PageSegMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if let Ok(code) = s.parse::<u8>() {
            return PageSegMode::from_code(code)
                .ok_or_else(|| format!("Unsupported page segmentation mode: {code}"));
        }
        [
            PageSegMode::Auto,
            PageSegMode::SingleColumn,
            PageSegMode::SingleBlockVertical,
            PageSegMode::SingleBlock,
            PageSegMode::SingleLine,
            PageSegMode::SingleWord,
            PageSegMode::SparseText,
            PageSegMode::SparseTextOsd,
            PageSegMode::RawLine,
        ]
        .into_iter()
        .find(|m| m.name() == s)
        .ok_or_else(|| format!("Unknown page segmentation mode: '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    LegacyOnly,
    LstmOnly,
    Combined,
    #[default]
    Default,
}

impl EngineMode {
    pub fn code(self) -> u8 {
        match self {
            EngineMode::LegacyOnly => 0,
            EngineMode::LstmOnly => 1,
            EngineMode::Combined => 2,
            EngineMode::Default => 3,
        }
    }
}

/// Everything the external engine needs to know besides the pixels.
/// Serialized into the cache key, so field order and naming are part of the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecognitionConfig {
    pub psm: PageSegMode,
    #[serde(default)]
    pub oem: EngineMode,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<String>,
}

impl RecognitionConfig {
    pub fn new(psm: PageSegMode, language: impl Into<String>) -> Self {
        Self { psm, oem: EngineMode::Default, language: language.into(), whitelist: None }
    }

    pub fn with_psm(&self, psm: PageSegMode) -> Self {
        Self { psm, ..self.clone() }
    }
}

/// One way of turning the image into text. Interpreted by the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    Standard,
    QualityCorrected,
    OrientationCorrected { angle: u32 },
    Binarization { method: BinarizationMethod },
    PsmVariant { mode: PageSegMode },
    RegionBased,
    Incremental { tile_size: u32 },
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Standard => write!(f, "standard"),
            Strategy::QualityCorrected => write!(f, "quality_corrected"),
            Strategy::OrientationCorrected { angle } => write!(f, "orientation:{angle}"),
            Strategy::Binarization { method } => write!(f, "binarization:{method}"),
            Strategy::PsmVariant { mode } => write!(f, "psm:{mode}"),
            Strategy::RegionBased => write!(f, "region"),
            Strategy::Incremental { tile_size } => write!(f, "incremental:{tile_size}"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (head, arg) = match s.split_once(':') {
            Some((h, a)) => (h, Some(a)),
            None => (s.as_str(), None),
        };
        match (head, arg) {
            ("standard", None) => Ok(Strategy::Standard),
            ("quality_corrected", None) => Ok(Strategy::QualityCorrected),
            ("orientation", Some(a)) => match a.parse::<u32>() {
                Ok(angle @ (0 | 90 | 180 | 270)) => Ok(Strategy::OrientationCorrected { angle }),
                _ => Err(format!("Orientation must be one of 0, 90, 180, 270: '{a}'")),
            },
            ("binarization", Some(a)) => Ok(Strategy::Binarization { method: a.parse()? }),
            ("psm", Some(a)) => Ok(Strategy::PsmVariant { mode: a.parse()? }),
            ("region", None) => Ok(Strategy::RegionBased),
            ("incremental", None) => Ok(Strategy::Incremental { tile_size: 1000 }),
            ("incremental", Some(a)) => match a.parse::<u32>() {
                Ok(tile_size) if tile_size >= 100 => Ok(Strategy::Incremental { tile_size }),
                _ => Err(format!("Invalid tile size: '{a}'")),
            },
            _ => Err(format!("Unknown strategy: '{s}'")),
        }
    }
}

/// One unit of work for the pipeline.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub data: Vec<u8>,
    pub document_type: DocumentType,
    pub strategy: Option<Strategy>,
    /// Cancelling this token abandons the request and kills any spawned worker.
    pub cancel: CancellationToken,
}

impl ExtractionRequest {
    pub fn new(data: impl Into<Vec<u8>>, document_type: DocumentType) -> Self {
        Self {
            data: data.into(),
            document_type,
            strategy: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Stages of the orchestrator, reported in metadata in the order visited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CacheCheck,
    QualityCheck,
    FastPath,
    CorrectionPath,
    Recognize,
    Vote,
    PostProcess,
    CacheWrite,
    Done,
    Failed,
}

/// Record of a single strategy execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    /// The engine answered (possibly with empty text).
    pub success: bool,
    /// The engine answered with non-blank text.
    pub usable: bool,
    pub confidence: f32,
    /// Voting score; `None` when the attempt was not a voting candidate.
    pub score: Option<f32>,
    pub text_chars: usize,
    pub elapsed_ms: u64,
    pub preprocessing: Vec<String>,
    pub execution: Option<ExecutionPath>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionMetadata {
    pub attempts: Vec<StrategyAttempt>,
    pub quality_assessment: QualityReport,
    pub cache_hit: bool,
    pub escalated: bool,
    pub elapsed_ms: u64,
    pub stages: Vec<Stage>,
}

/// The pipeline's answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub text: String,
    /// 0–100.
    pub confidence: f32,
    pub strategy: Strategy,
    pub metadata: ExtractionMetadata,
}

impl ExtractionResult {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn document_type_roundtrip() {
        for t in DocumentType::ALL {
            assert_eq!(DocumentType::from_str(&t.to_string()).unwrap(), t);
        }
        assert!(DocumentType::from_str("spreadsheet").is_err());
    }

    #[test]
    fn only_receipts_and_invoices_are_financial() {
        let financial: Vec<_> =
            DocumentType::ALL.into_iter().filter(|t| t.is_financial()).collect();
        assert_eq!(financial, vec![DocumentType::Receipt, DocumentType::Invoice]);
    }

    #[test]
    fn psm_parses_names_and_codes() {
        assert_eq!(PageSegMode::from_str("6").unwrap(), PageSegMode::SingleBlock);
        assert_eq!(PageSegMode::from_str("sparse_text").unwrap(), PageSegMode::SparseText);
        assert!(PageSegMode::from_str("2").is_err());
    }

    #[test]
    fn strategy_override_grammar() {
        assert_eq!(Strategy::from_str("standard").unwrap(), Strategy::Standard);
        assert_eq!(
            Strategy::from_str("orientation:90").unwrap(),
            Strategy::OrientationCorrected { angle: 90 }
        );
        assert_eq!(
            Strategy::from_str("binarization:sauvola").unwrap(),
            Strategy::Binarization { method: BinarizationMethod::Sauvola }
        );
        assert_eq!(
            Strategy::from_str("psm:11").unwrap(),
            Strategy::PsmVariant { mode: PageSegMode::SparseText }
        );
        assert_eq!(
            Strategy::from_str("incremental").unwrap(),
            Strategy::Incremental { tile_size: 1000 }
        );
        assert!(Strategy::from_str("orientation:45").is_err());
        assert!(Strategy::from_str("magic").is_err());
    }

    #[test]
    fn strategy_display_parses_back() {
        let all = [
            Strategy::Standard,
            Strategy::QualityCorrected,
            Strategy::OrientationCorrected { angle: 270 },
            Strategy::Binarization { method: BinarizationMethod::AdaptiveGaussian },
            Strategy::PsmVariant { mode: PageSegMode::SingleColumn },
            Strategy::RegionBased,
            Strategy::Incremental { tile_size: 800 },
        ];
        for s in all {
            assert_eq!(Strategy::from_str(&s.to_string()).unwrap(), s);
        }
    }
}
