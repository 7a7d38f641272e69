use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{RecognitionAdapter, RecognitionOutput};
use crate::binarize::{binarize, binarize_with, otsu, BinarizationMethod, Binarized};
use crate::cache::{FsResultCache, ResultStore};
use crate::config::{ConfigError, DocumentProfile, PipelineConfig};
use crate::geometry;
use crate::hash::CacheKey;
use crate::normalize::{normalize, NormalizeOptions, Orientation};
use crate::postprocess;
use crate::quality::{self, QualityReport};
use crate::recognizer::OcrBackend;
use crate::scoring::{self, Candidate};
use crate::tiles::{self, TileText};
use crate::types::{
    DocumentType, ExtractionMetadata, ExtractionRequest, ExtractionResult, PageSegMode,
    RecognitionConfig, Stage, Strategy, StrategyAttempt,
};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Input is empty")]
    EmptyInput,
    #[error("Image could not be decoded: {0}")]
    Undecodable(String),
    #[error("No strategy produced usable text ({} attempted)", .attempts.len())]
    AllStrategiesFailed {
        attempts: Vec<StrategyAttempt>,
        quality: QualityReport,
        /// Stages visited, ending in [`Stage::Failed`].
        stages: Vec<Stage>,
    },
    #[error("Extraction cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractionError {
    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::EmptyInput | ExtractionError::Undecodable(_) => "input_error",
            ExtractionError::AllStrategiesFailed { .. } => "extraction_failed",
            ExtractionError::Cancelled => "cancelled",
            ExtractionError::Internal(_) => "internal",
        }
    }

    /// Actionable message for the person who supplied the image.
    pub fn user_message(&self) -> String {
        match self {
            ExtractionError::EmptyInput => "The uploaded file is empty.".to_string(),
            ExtractionError::Undecodable(_) => {
                "This file is not a readable image. Upload a JPEG or PNG photo.".to_string()
            }
            ExtractionError::AllStrategiesFailed { quality, .. } => {
                let mut msg = String::from(
                    "Could not read this image. Try better lighting or a sharper photo.",
                );
                if !quality.recommendations.is_empty() {
                    msg.push_str(" Suggestions: ");
                    msg.push_str(&quality.recommendations.join("; "));
                    msg.push('.');
                }
                msg
            }
            ExtractionError::Cancelled => "The request was cancelled.".to_string(),
            ExtractionError::Internal(_) => {
                "Something went wrong while reading this image.".to_string()
            }
        }
    }

    pub fn recommendations(&self) -> &[String] {
        match self {
            ExtractionError::AllStrategiesFailed { quality, .. } => &quality.recommendations,
            _ => &[],
        }
    }

    /// Orchestrator stages reached before giving up; empty for early rejections.
    pub fn stages(&self) -> &[Stage] {
        match self {
            ExtractionError::AllStrategiesFailed { stages, .. } => stages,
            _ => &[],
        }
    }
}

/// Process-lifetime state shared by every request: configuration, the
/// recognition adapter with its health counter, and the result cache.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub adapter: RecognitionAdapter,
    pub cache: Arc<dyn ResultStore>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, backend: Arc<dyn OcrBackend>) -> Result<Self, ConfigError> {
        Self::builder(config).backend(backend).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineContextBuilder {
        PipelineContextBuilder { config, backend: None, adapter: None, cache: None }
    }
}

pub struct PipelineContextBuilder {
    config: PipelineConfig,
    backend: Option<Arc<dyn OcrBackend>>,
    adapter: Option<RecognitionAdapter>,
    cache: Option<Arc<dyn ResultStore>>,
}

impl PipelineContextBuilder {
    pub fn backend(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a pre-built adapter instead of wrapping `backend`.
    pub fn adapter(mut self, adapter: RecognitionAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<PipelineContext, ConfigError> {
        self.config.validate()?;
        let adapter = match (self.adapter, self.backend) {
            (Some(adapter), _) => adapter,
            (None, Some(backend)) => RecognitionAdapter::new(backend, &self.config),
            (None, None) => {
                let message = "a recognition backend or adapter is required";
                return Err(ConfigError::Invalid(message.into()));
            }
        };
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(FsResultCache::new(
                self.config.cache_dir.clone(),
                self.config.cache_io_timeout(),
                self.config.cache_retention(),
            ))
        });
        Ok(PipelineContext { config: self.config, adapter, cache })
    }
}

/// Everything that goes into a cache key besides the image bytes.
#[derive(Serialize)]
struct CacheScope<'a> {
    document_type: DocumentType,
    profile: &'a DocumentProfile,
    recognition: &'a RecognitionConfig,
    strategy: Option<Strategy>,
}

/// Per-request inputs shared by every strategy.
struct Job {
    doc: DocumentType,
    profile: DocumentProfile,
    recognition: RecognitionConfig,
    report: QualityReport,
    source: Arc<GrayImage>,
    orientation_hint: Option<u32>,
    cancel: CancellationToken,
}

/// The standard preparation of the page: normalized grayscale plus its Otsu
/// rendering. Binarization and page-segmentation variants start from here.
struct Prepared {
    page: Arc<GrayImage>,
    otsu: Arc<GrayImage>,
    steps: Vec<String>,
    rotation: u32,
}

/// Bank outputs and sparsity for the voting round, all from `Prepared::page`.
struct VoteInputs {
    bank: Vec<Binarized>,
    sparse: bool,
}

struct Outcome {
    attempt: StrategyAttempt,
    text: String,
}

impl Outcome {
    fn from_output(
        strategy: Strategy,
        output: RecognitionOutput,
        steps: Vec<String>,
        started: Instant,
    ) -> Self {
        let usable = output.success && is_usable(&output.text);
        Outcome {
            attempt: StrategyAttempt {
                strategy,
                success: output.success,
                usable,
                confidence: if output.success { output.confidence } else { 0.0 },
                score: None,
                text_chars: output.text.chars().count(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                preprocessing: steps,
                execution: Some(output.path),
                error: output.error.map(|e| e.to_string()),
            },
            text: output.text,
        }
    }

    fn failed(
        strategy: Strategy,
        error: impl std::fmt::Display,
        steps: Vec<String>,
        started: Instant,
    ) -> Self {
        Outcome {
            attempt: StrategyAttempt {
                strategy,
                success: false,
                usable: false,
                confidence: 0.0,
                score: None,
                text_chars: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
                preprocessing: steps,
                execution: None,
                error: Some(error.to_string()),
            },
            text: String::new(),
        }
    }
}

/// Text counts as usable once it carries at least one letter or digit.
fn is_usable(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

async fn cpu<T, F>(f: F) -> Result<T, ExtractionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExtractionError::Internal(format!("image task failed: {e}")))
}

/// The single entry point: decides which strategies run for a request,
/// runs them, and picks the answer.
#[derive(Clone)]
pub struct ExtractionPipeline {
    ctx: Arc<PipelineContext>,
}

impl ExtractionPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub async fn extract(
        &self,
        req: ExtractionRequest,
    ) -> Result<ExtractionResult, ExtractionError> {
        let started = Instant::now();
        let config = &self.ctx.config;
        if req.data.is_empty() {
            return Err(ExtractionError::EmptyInput);
        }
        info!(
            document_type = %req.document_type,
            bytes = req.data.len(),
            strategy = ?req.strategy,
            "Extraction started"
        );

        // Cache check.
        let mut stages = vec![Stage::CacheCheck];
        let profile = config.profiles.resolve(req.document_type);
        let recognition = profile.recognition_config(&config.language);
        let scope = CacheScope {
            document_type: req.document_type,
            profile: &profile,
            recognition: &recognition,
            strategy: req.strategy,
        };
        let key = CacheKey::derive(&req.data, &scope)
            .map_err(|e| ExtractionError::Internal(e.to_string()))?;
        if let Some(mut hit) = self.ctx.cache.lookup(&key).await {
            hit.metadata.cache_hit = true;
            hit.metadata.elapsed_ms = started.elapsed().as_millis() as u64;
            hit.metadata.stages = vec![Stage::CacheCheck, Stage::Done];
            info!(
                %key,
                strategy = %hit.strategy,
                confidence = hit.confidence,
                "Extraction served from cache"
            );
            return Ok(hit);
        }

        // Decode and assess.
        let data = req.data;
        let thresholds = config.quality.clone();
        let (source, report) = cpu(move || {
            image::load_from_memory(&data).map(|img| {
                let gray = img.to_luma8();
                let report = quality::assess_gray(&gray, &thresholds);
                (gray, report)
            })
        })
        .await?
        .map_err(|e| ExtractionError::Undecodable(e.to_string()))?;
        stages.push(Stage::QualityCheck);
        stages.push(if report.is_acceptable { Stage::FastPath } else { Stage::CorrectionPath });
        debug!(?report, "Quality assessed");

        let oversized = source.width().max(source.height()) > config.large_image_threshold;
        let mut job = Job {
            doc: req.document_type,
            profile,
            recognition,
            report,
            source: Arc::new(source),
            orientation_hint: None,
            cancel: req.cancel,
        };

        stages.push(Stage::Recognize);
        let mut escalated = false;
        let outcomes = match req.strategy {
            Some(Strategy::Incremental { tile_size }) => {
                vec![self.recognize_tiles(&job, tile_size).await]
            }
            None if oversized => vec![self.recognize_tiles(&job, config.tile_size).await],
            Some(strategy) => {
                job.orientation_hint = self.orientation_hint(&job).await;
                let prepared = self.prepare(&job).await?;
                vec![self.run_strategy(&job, strategy, &prepared, None).await]
            }
            None => {
                job.orientation_hint = self.orientation_hint(&job).await;
                let prepared = self.prepare(&job).await?;
                let standard = self.run_strategy(&job, Strategy::Standard, &prepared, None).await;
                let weak = !standard.attempt.usable
                    || standard.attempt.confidence < config.escalation_threshold;
                if (weak || !job.report.is_acceptable) && !job.cancel.is_cancelled() {
                    escalated = true;
                    stages.push(Stage::Vote);
                    info!(
                        confidence = standard.attempt.confidence,
                        acceptable = job.report.is_acceptable,
                        "Escalating to multi-strategy voting"
                    );
                    self.vote(&job, &prepared, standard).await?
                } else {
                    vec![standard]
                }
            }
        };
        if job.cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let mut attempts: Vec<StrategyAttempt> = Vec::with_capacity(outcomes.len());
        let mut texts: Vec<String> = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            attempts.push(outcome.attempt);
            texts.push(outcome.text);
        }

        let winner = self.pick_winner(&mut attempts, &texts, escalated);
        let Some(winner) = winner else {
            stages.push(Stage::Failed);
            warn!(attempts = attempts.len(), "No strategy produced usable text");
            return Err(ExtractionError::AllStrategiesFailed {
                attempts,
                quality: job.report,
                stages,
            });
        };

        stages.push(Stage::PostProcess);
        let text = postprocess::correct(&texts[winner], job.doc);
        let strategy = attempts[winner].strategy;
        let confidence = attempts[winner].confidence.clamp(0.0, 100.0);

        stages.push(Stage::CacheWrite);
        stages.push(Stage::Done);
        let result = ExtractionResult {
            text,
            confidence,
            strategy,
            metadata: ExtractionMetadata {
                attempts,
                quality_assessment: job.report,
                cache_hit: false,
                escalated,
                elapsed_ms: started.elapsed().as_millis() as u64,
                stages,
            },
        };
        self.ctx.cache.store(&key, &result).await;

        info!(
            %strategy,
            confidence,
            escalated,
            elapsed_ms = result.metadata.elapsed_ms,
            "Extraction finished"
        );
        Ok(result)
    }

    /// Index of the chosen attempt. Without voting that is the single usable
    /// attempt; with voting every usable attempt is scored.
    fn pick_winner(
        &self,
        attempts: &mut [StrategyAttempt],
        texts: &[String],
        escalated: bool,
    ) -> Option<usize> {
        let usable: Vec<usize> = (0..attempts.len()).filter(|&i| attempts[i].usable).collect();
        if !escalated {
            return usable.first().copied();
        }
        let candidates: Vec<Candidate<'_>> = usable
            .iter()
            .map(|&i| Candidate { text: &texts[i], confidence: attempts[i].confidence })
            .collect();
        let ballot = scoring::select(&candidates, &self.ctx.config.scoring)?;
        for (&i, &score) in usable.iter().zip(&ballot.scores) {
            attempts[i].score = Some(score);
        }
        Some(usable[ballot.winner])
    }

    async fn orientation_hint(&self, job: &Job) -> Option<u32> {
        self.ctx.adapter.detect_orientation(Arc::clone(&job.source), &job.cancel).await
    }

    async fn prepare(&self, job: &Job) -> Result<Prepared, ExtractionError> {
        let source = Arc::clone(&job.source);
        let profile = job.profile.clone();
        let report = job.report.clone();
        let thresholds = self.ctx.config.quality.clone();
        let options = NormalizeOptions {
            orientation: Orientation::Detect { engine_hint: job.orientation_hint },
            ..NormalizeOptions::default()
        };
        cpu(move || {
            let normalized = normalize(&source, &profile, &report, &thresholds, options);
            let binary = otsu(&normalized.image);
            Prepared {
                page: Arc::new(normalized.image),
                otsu: Arc::new(binary),
                steps: normalized.steps,
                rotation: normalized.rotation,
            }
        })
        .await
    }

    /// Run the voting set around an already finished standard attempt.
    /// Attempts come back in plan order whatever order they finish in.
    async fn vote(
        &self,
        job: &Job,
        prepared: &Prepared,
        standard: Outcome,
    ) -> Result<Vec<Outcome>, ExtractionError> {
        let page = Arc::clone(&prepared.page);
        let sparse_below = self.ctx.config.sparse_ink_ratio;
        let inputs = cpu(move || VoteInputs {
            bank: binarize(&page),
            sparse: geometry::ink_ratio(&geometry::ink_mask(&page)) < sparse_below,
        })
        .await?;

        let plan = self.voting_plan(job, prepared, &inputs);
        debug!(plan = ?plan.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "Voting plan");

        let limit = self.ctx.config.max_concurrent_strategies.max(1);
        let mut others: Vec<(usize, Outcome)> = stream::iter(plan.into_iter().enumerate())
            .map(|(i, strategy)| {
                let inputs = &inputs;
                async move { (i, self.run_strategy(job, strategy, prepared, Some(inputs)).await) }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        others.sort_by_key(|(i, _)| *i);

        let mut outcomes = Vec::with_capacity(others.len() + 1);
        outcomes.push(standard);
        outcomes.extend(others.into_iter().map(|(_, o)| o));
        Ok(outcomes)
    }

    fn voting_plan(&self, job: &Job, prepared: &Prepared, inputs: &VoteInputs) -> Vec<Strategy> {
        let mut plan = vec![
            Strategy::OrientationCorrected { angle: (prepared.rotation + 180) % 360 },
            Strategy::QualityCorrected,
        ];
        let preferred = [
            BinarizationMethod::Sauvola,
            BinarizationMethod::AdaptiveGaussian,
            BinarizationMethod::AdaptiveMean,
        ];
        plan.extend(
            preferred
                .into_iter()
                .filter(|m| inputs.bank.iter().any(|b| b.method == *m))
                .take(2)
                .map(|method| Strategy::Binarization { method }),
        );
        if job.profile.alternate_psm != job.recognition.psm {
            plan.push(Strategy::PsmVariant { mode: job.profile.alternate_psm });
        }
        if inputs.sparse {
            plan.push(Strategy::RegionBased);
        }
        plan
    }

    async fn run_strategy(
        &self,
        job: &Job,
        strategy: Strategy,
        prepared: &Prepared,
        inputs: Option<&VoteInputs>,
    ) -> Outcome {
        let started = Instant::now();
        let mut steps = prepared.steps.clone();
        match strategy {
            Strategy::Standard => {
                steps.push("binarize otsu".to_string());
                let page = Arc::clone(&prepared.otsu);
                self.recognize_one(job, strategy, page, &job.recognition, steps, started).await
            }
            Strategy::PsmVariant { mode } => {
                steps.push("binarize otsu".to_string());
                steps.push(format!("psm {mode}"));
                let config = job.recognition.with_psm(mode);
                let page = Arc::clone(&prepared.otsu);
                self.recognize_one(job, strategy, page, &config, steps, started).await
            }
            Strategy::Binarization { method } => {
                steps.push(format!("binarize {method}"));
                let banked = inputs
                    .and_then(|i| i.bank.iter().find(|b| b.method == method))
                    .map(|b| b.image.clone());
                let image = match banked {
                    Some(image) => Ok(image),
                    None => {
                        let page = Arc::clone(&prepared.page);
                        match cpu(move || binarize_with(&page, method)).await {
                            Ok(Ok(image)) => Ok(image),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(e) => Err(e.to_string()),
                        }
                    }
                };
                match image {
                    Ok(image) => {
                        let page = Arc::new(image);
                        self.recognize_one(job, strategy, page, &job.recognition, steps, started)
                            .await
                    }
                    Err(e) => {
                        warn!("Binarization {method} unavailable: {e}");
                        Outcome::failed(strategy, e, steps, started)
                    }
                }
            }
            Strategy::OrientationCorrected { angle } => {
                let options = NormalizeOptions {
                    orientation: Orientation::Fixed(angle),
                    ..NormalizeOptions::default()
                };
                self.renormalize_and_recognize(job, strategy, options, true, started).await
            }
            Strategy::QualityCorrected => {
                let options = NormalizeOptions {
                    orientation: Orientation::Fixed(prepared.rotation),
                    force_enhance: true,
                    ..NormalizeOptions::default()
                };
                self.renormalize_and_recognize(job, strategy, options, false, started).await
            }
            Strategy::RegionBased => self.recognize_regions(job, prepared, started).await,
            Strategy::Incremental { tile_size } => self.recognize_tiles(job, tile_size).await,
        }
    }

    async fn recognize_one(
        &self,
        job: &Job,
        strategy: Strategy,
        image: Arc<GrayImage>,
        config: &RecognitionConfig,
        steps: Vec<String>,
        started: Instant,
    ) -> Outcome {
        let output = self.ctx.adapter.recognize(image, config, &job.cancel).await;
        let outcome = Outcome::from_output(strategy, output, steps, started);
        debug!(
            %strategy,
            success = outcome.attempt.success,
            confidence = outcome.attempt.confidence,
            elapsed_ms = outcome.attempt.elapsed_ms,
            "Strategy attempt finished"
        );
        outcome
    }

    /// Normalize the raw source again with different options, then recognize,
    /// binarized with Otsu or handed over in grayscale.
    async fn renormalize_and_recognize(
        &self,
        job: &Job,
        strategy: Strategy,
        options: NormalizeOptions,
        binarized: bool,
        started: Instant,
    ) -> Outcome {
        let source = Arc::clone(&job.source);
        let profile = job.profile.clone();
        let report = job.report.clone();
        let thresholds = self.ctx.config.quality.clone();
        let prepared = cpu(move || {
            let normalized = normalize(&source, &profile, &report, &thresholds, options);
            let mut steps = normalized.steps;
            let image = if binarized {
                steps.push("binarize otsu".to_string());
                otsu(&normalized.image)
            } else {
                steps.push("grayscale".to_string());
                normalized.image
            };
            (image, steps)
        })
        .await;
        match prepared {
            Ok((image, steps)) => {
                self.recognize_one(job, strategy, Arc::new(image), &job.recognition, steps, started)
                    .await
            }
            Err(e) => Outcome::failed(strategy, e, Vec::new(), started),
        }
    }

    /// Recognize each detected text block separately and join the blocks in
    /// reading order.
    async fn recognize_regions(&self, job: &Job, prepared: &Prepared, started: Instant) -> Outcome {
        let strategy = Strategy::RegionBased;
        let page = Arc::clone(&prepared.page);
        let max_regions = self.ctx.config.max_regions;
        let crops = match cpu(move || {
            geometry::text_regions(&page, max_regions)
                .into_iter()
                .map(|r| otsu(&r.crop(&page)))
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(crops) => crops,
            Err(e) => return Outcome::failed(strategy, e, prepared.steps.clone(), started),
        };
        let mut steps = prepared.steps.clone();
        steps.push(format!("regions {}", crops.len()));
        if crops.is_empty() {
            return Outcome::failed(strategy, "no text regions found", steps, started);
        }

        let config = job.recognition.with_psm(PageSegMode::SingleBlock);
        let mut parts = Vec::new();
        let mut last = None;
        for crop in crops {
            let output = self.ctx.adapter.recognize(Arc::new(crop), &config, &job.cancel).await;
            if output.is_cancelled() {
                return Outcome::from_output(strategy, output, steps, started);
            }
            if output.success && is_usable(&output.text) {
                parts.push(TileText {
                    row: parts.len() as u32,
                    col: 0,
                    text: output.text.trim().to_string(),
                    confidence: output.confidence,
                });
            }
            if last.as_ref().map_or(true, |l: &RecognitionOutput| !l.success) {
                last = Some(output);
            }
        }
        combine(strategy, join_blocks(&parts), last, steps, started)
    }

    /// Split an oversized page into overlapping tiles and recognize them one
    /// at a time, so only one tile's working copies are alive at once.
    async fn recognize_tiles(&self, job: &Job, tile_size: u32) -> Outcome {
        let started = Instant::now();
        let strategy = Strategy::Incremental { tile_size };
        let overlap = self.ctx.config.tile_overlap.min(tile_size / 2);
        let grid = tiles::plan(job.source.width(), job.source.height(), tile_size, overlap);
        let steps = vec![format!("tiles {} ({tile_size}px, {overlap}px overlap)", grid.len())];
        info!(tiles = grid.len(), tile_size, "Recognizing oversized page in tiles");

        let mut parts = Vec::new();
        let mut last = None;
        for tile in grid {
            let source = Arc::clone(&job.source);
            let profile = job.profile.clone();
            let thresholds = self.ctx.config.quality.clone();
            let prepared = cpu(move || {
                let crop = tile.region.crop(&source);
                let report = quality::assess_gray(&crop, &thresholds);
                let options = NormalizeOptions {
                    orientation: Orientation::Skip,
                    skip_deskew: true,
                    force_enhance: false,
                };
                otsu(&normalize(&crop, &profile, &report, &thresholds, options).image)
            })
            .await;
            let image = match prepared {
                Ok(image) => image,
                Err(e) => {
                    warn!(row = tile.row, col = tile.col, "Tile preparation failed: {e}");
                    continue;
                }
            };
            let output =
                self.ctx.adapter.recognize(Arc::new(image), &job.recognition, &job.cancel).await;
            if output.is_cancelled() {
                return Outcome::from_output(strategy, output, steps, started);
            }
            if output.success {
                parts.push(TileText {
                    row: tile.row,
                    col: tile.col,
                    text: output.text.clone(),
                    confidence: output.confidence,
                });
            }
            if last.as_ref().map_or(true, |l: &RecognitionOutput| !l.success) {
                last = Some(output);
            }
        }
        combine(strategy, tiles::merge(&parts), last, steps, started)
    }
}

/// Fold several partial recognitions into one attempt. Succeeds when any part
/// did; `last` supplies the execution path and, on total failure, the error.
fn combine(
    strategy: Strategy,
    merged: (String, f32),
    last: Option<RecognitionOutput>,
    steps: Vec<String>,
    started: Instant,
) -> Outcome {
    let Some(mut output) = last else {
        return Outcome::failed(strategy, "nothing was recognized", steps, started);
    };
    if output.success {
        (output.text, output.confidence) = merged;
        output.token_confidences.clear();
    }
    Outcome::from_output(strategy, output, steps, started)
}

/// Blocks separated by a blank line, confidence weighted by block length.
fn join_blocks(parts: &[TileText]) -> (String, f32) {
    let text = parts.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n\n");
    let chars: usize = parts.iter().map(|p| p.text.len()).sum();
    if chars == 0 {
        return (text, 0.0);
    }
    let weighted: f32 = parts.iter().map(|p| p.confidence * p.text.len() as f32).sum();
    (text, weighted / chars as f32)
}
