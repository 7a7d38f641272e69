pub mod adapter;
pub mod binarize;
pub mod cache;
pub mod config;
pub mod geometry;
pub mod hash;
pub mod isolation;
pub mod normalize;
pub mod pipeline;
pub mod postprocess;
pub mod quality;
pub mod recognizer;
pub mod scoring;
pub mod tiles;
pub mod types;

pub use adapter::{ExecutionPath, HealthSnapshot, HealthTracker, RecognitionAdapter};
pub use binarize::BinarizationMethod;
pub use cache::{CacheError, FsResultCache, ResultStore};
pub use config::{ConfigError, DocumentProfile, PipelineConfig, WorkerCommand};
pub use hash::{sha256_bytes, to_hex, CacheKey};
pub use isolation::IsolatedRecognizer;
pub use pipeline::{ExtractionError, ExtractionPipeline, PipelineContext};
pub use quality::QualityReport;
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, Recognition, UnavailableRecognizer};
pub use types::{
    DocumentType, ExtractionMetadata, ExtractionRequest, ExtractionResult, PageSegMode,
    RecognitionConfig, Stage, Strategy, StrategyAttempt,
};
