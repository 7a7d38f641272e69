use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::{DocumentType, PageSegMode, RecognitionConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: '{value}'")]
    Env { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-document-type tuning. Resolved once per request and passed explicitly
/// through every stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentProfile {
    /// Upscale when the shorter side is below this many pixels.
    pub min_short_side: u32,
    /// Median filter radius; 0 disables denoising.
    pub denoise_strength: u32,
    /// CLAHE clip limit (multiples of the uniform bin height).
    pub contrast_clip_limit: f32,
    pub psm: PageSegMode,
    /// Layout mode tried by the `PsmVariant` voting candidate.
    pub alternate_psm: PageSegMode,
    pub deskew: bool,
    pub denoise: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<String>,
}

impl DocumentProfile {
    pub fn for_type(doc: DocumentType) -> Self {
        let base = DocumentProfile {
            min_short_side: 1000,
            denoise_strength: 1,
            contrast_clip_limit: 2.0,
            psm: PageSegMode::Auto,
            alternate_psm: PageSegMode::SingleBlock,
            deskew: true,
            denoise: true,
            whitelist: None,
        };
        match doc {
            DocumentType::Receipt => DocumentProfile {
                psm: PageSegMode::SingleColumn,
                alternate_psm: PageSegMode::SingleBlock,
                ..base
            },
            DocumentType::Invoice => base,
            DocumentType::Document => DocumentProfile {
                alternate_psm: PageSegMode::SingleColumn,
                ..base
            },
            DocumentType::Form => DocumentProfile {
                contrast_clip_limit: 2.5,
                psm: PageSegMode::SingleBlock,
                alternate_psm: PageSegMode::SparseText,
                ..base
            },
            // Digital screenshots are already clean and axis-aligned.
            DocumentType::Screenshot => DocumentProfile {
                min_short_side: 800,
                denoise_strength: 0,
                contrast_clip_limit: 1.5,
                psm: PageSegMode::SingleBlock,
                alternate_psm: PageSegMode::SparseText,
                deskew: false,
                denoise: false,
                ..base
            },
            DocumentType::Photo => DocumentProfile {
                min_short_side: 1200,
                denoise_strength: 2,
                contrast_clip_limit: 3.0,
                psm: PageSegMode::SparseText,
                alternate_psm: PageSegMode::Auto,
                ..base
            },
            DocumentType::General => base,
        }
    }

    pub fn recognition_config(&self, language: &str) -> RecognitionConfig {
        RecognitionConfig {
            whitelist: self.whitelist.clone(),
            ..RecognitionConfig::new(self.psm, language)
        }
    }
}

/// Closed table of profiles, one per [`DocumentType`]. Entries present in
/// configuration replace the bundled defaults for that type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ProfileTable {
    overrides: BTreeMap<DocumentType, DocumentProfile>,
}

impl ProfileTable {
    pub fn resolve(&self, doc: DocumentType) -> DocumentProfile {
        self.overrides
            .get(&doc)
            .cloned()
            .unwrap_or_else(|| DocumentProfile::for_type(doc))
    }

    pub fn set(&mut self, doc: DocumentType, profile: DocumentProfile) {
        self.overrides.insert(doc, profile);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityThresholds {
    /// Minimum Laplacian variance.
    pub min_blur: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_contrast: f64,
    pub min_side: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_blur: 100.0,
            min_brightness: 50.0,
            max_brightness: 200.0,
            min_contrast: 30.0,
            min_side: 300,
        }
    }
}

/// Voting weights. Empirically tuned; not assumed optimal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub confidence: f32,
    pub length: f32,
    pub agreement: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { confidence: 0.4, length: 0.2, agreement: 0.4 }
    }
}

/// Program used for the isolated recognition path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a whitespace-separated command line (`program arg1 arg2`).
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts))
    }

    /// The `tally-ocr-worker` binary installed next to `exe`. Test harnesses
    /// run from `target/<profile>/deps`, so the parent directory is tried too.
    pub fn bundled_beside(exe: &Path) -> Option<Self> {
        let name = format!("{BUNDLED_WORKER}{}", std::env::consts::EXE_SUFFIX);
        let dir = exe.parent()?;
        let mut candidates = vec![dir.join(&name)];
        if dir.file_name().is_some_and(|d| d == "deps") {
            if let Some(up) = dir.parent() {
                candidates.push(up.join(&name));
            }
        }
        candidates.into_iter().find(|p| p.is_file()).map(Self::new)
    }
}

/// Binary name of the isolated worker shipped with this crate.
pub const BUNDLED_WORKER: &str = "tally-ocr-worker";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub language: String,
    pub quality: QualityThresholds,
    pub scoring: ScoringWeights,
    /// Standard-pass confidence below this escalates to voting.
    pub escalation_threshold: f32,
    /// Images with either side above this go through tiling.
    pub large_image_threshold: u32,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub engine_timeout_secs: u64,
    pub max_concurrent_strategies: usize,
    /// Primary-path failures before the adapter reports itself unhealthy.
    pub failure_threshold: u32,
    /// Consecutive primary failures after which calls go straight to isolation.
    pub isolate_after_failures: u32,
    pub worker: Option<WorkerCommand>,
    pub cache_dir: PathBuf,
    pub cache_retention_days: u32,
    pub cache_io_timeout_ms: u64,
    /// Ink coverage below which a page counts as sparse and gets a region pass.
    pub sparse_ink_ratio: f32,
    pub max_regions: usize,
    pub profiles: ProfileTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            quality: QualityThresholds::default(),
            scoring: ScoringWeights::default(),
            escalation_threshold: 75.0,
            large_image_threshold: 4000,
            tile_size: 1000,
            tile_overlap: 50,
            engine_timeout_secs: 30,
            max_concurrent_strategies: 4,
            failure_threshold: 3,
            isolate_after_failures: 2,
            worker: None,
            cache_dir: std::env::temp_dir().join("tally-ocr-cache"),
            cache_retention_days: 7,
            cache_io_timeout_ms: 50,
            sparse_ink_ratio: 0.04,
            max_regions: 24,
            profiles: ProfileTable::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: PipelineConfig = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults (or `path`, when given) with `TALLY_OCR_*` environment overrides
    /// applied. With no worker configured, the bundled `tally-ocr-worker` next to
    /// the running executable is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let exe = std::env::current_exe().ok();
        Self::load_with(path, |key| std::env::var(key).ok(), exe.as_deref())
    }

    pub(crate) fn load_with<F>(
        path: Option<&Path>,
        lookup: F,
        exe: Option<&Path>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(lookup)?;
        if cfg.worker.is_none() {
            cfg.worker = exe.and_then(WorkerCommand::bundled_beside);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from a variable lookup. Takes a closure so tests need
    /// not mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { key: key.to_string(), value })
        }

        if let Some(v) = lookup("TALLY_OCR_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TALLY_OCR_CACHE_RETENTION_DAYS") {
            self.cache_retention_days = parse("TALLY_OCR_CACHE_RETENTION_DAYS", v)?;
        }
        if let Some(v) = lookup("TALLY_OCR_ESCALATION_THRESHOLD") {
            self.escalation_threshold = parse("TALLY_OCR_ESCALATION_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("TALLY_OCR_ENGINE_TIMEOUT_SECS") {
            self.engine_timeout_secs = parse("TALLY_OCR_ENGINE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TALLY_OCR_MAX_CONCURRENT_STRATEGIES") {
            self.max_concurrent_strategies = parse("TALLY_OCR_MAX_CONCURRENT_STRATEGIES", v)?;
        }
        if let Some(v) = lookup("TALLY_OCR_TILE_SIZE") {
            self.tile_size = parse("TALLY_OCR_TILE_SIZE", v)?;
        }
        if let Some(v) = lookup("TALLY_OCR_LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = lookup("TALLY_OCR_WORKER") {
            self.worker = Some(WorkerCommand::parse(&v).ok_or(ConfigError::Env {
                key: "TALLY_OCR_WORKER".to_string(),
                value: v.clone(),
            })?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quality;
        if q.min_brightness >= q.max_brightness {
            return Err(ConfigError::Invalid(format!(
                "brightness band is empty ({} >= {})",
                q.min_brightness, q.max_brightness
            )));
        }
        if self.tile_size == 0 || self.tile_overlap >= self.tile_size {
            return Err(ConfigError::Invalid(format!(
                "tile overlap {} must be smaller than tile size {}",
                self.tile_overlap, self.tile_size
            )));
        }
        if self.max_concurrent_strategies == 0 {
            return Err(ConfigError::Invalid("max_concurrent_strategies must be at least 1".into()));
        }
        let w = &self.scoring;
        if w.confidence < 0.0 || w.length < 0.0 || w.agreement < 0.0 {
            return Err(ConfigError::Invalid("scoring weights must be non-negative".into()));
        }
        if w.confidence + w.length + w.agreement <= 0.0 {
            return Err(ConfigError::Invalid("scoring weights must not all be zero".into()));
        }
        if !(0.0..=100.0).contains(&self.escalation_threshold) {
            return Err(ConfigError::Invalid(format!(
                "escalation threshold {} is outside 0..=100",
                self.escalation_threshold
            )));
        }
        if self.language.trim().is_empty() {
            return Err(ConfigError::Invalid("language must not be empty".into()));
        }
        Ok(())
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn cache_io_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_io_timeout_ms)
    }

    pub fn cache_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_carry_documented_constants() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.quality.min_blur, 100.0);
        assert_eq!(cfg.quality.min_brightness, 50.0);
        assert_eq!(cfg.quality.max_brightness, 200.0);
        assert_eq!(cfg.quality.min_contrast, 30.0);
        assert_eq!(cfg.escalation_threshold, 75.0);
        assert_eq!(cfg.cache_retention_days, 7);
        assert_eq!(cfg.engine_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.scoring, ScoringWeights { confidence: 0.4, length: 0.2, agreement: 0.4 });
        cfg.validate().unwrap();
    }

    #[test]
    fn screenshot_profile_skips_cleanup() {
        let p = DocumentProfile::for_type(DocumentType::Screenshot);
        assert!(!p.deskew);
        assert!(!p.denoise);
        assert!(DocumentProfile::for_type(DocumentType::Receipt).deskew);
    }

    #[test]
    fn toml_partial_override() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            escalation_threshold = 60.0
            tile_size = 800

            [quality]
            min_blur = 80.0

            [profiles.receipt]
            min_short_side = 1400
            denoise_strength = 2
            contrast_clip_limit = 3.0
            psm = "single_block"
            alternate_psm = "sparse_text"
            deskew = true
            denoise = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.escalation_threshold, 60.0);
        assert_eq!(cfg.tile_size, 800);
        assert_eq!(cfg.quality.min_blur, 80.0);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.quality.min_contrast, 30.0);
        let receipt = cfg.profiles.resolve(DocumentType::Receipt);
        assert_eq!(receipt.min_short_side, 1400);
        assert_eq!(receipt.psm, PageSegMode::SingleBlock);
        assert_eq!(
            cfg.profiles.resolve(DocumentType::Invoice),
            DocumentProfile::for_type(DocumentType::Invoice)
        );
    }

    #[test]
    fn invalid_tile_overlap_rejected() {
        let err = PipelineConfig::from_toml_str("tile_size = 100\ntile_overlap = 100").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("TALLY_OCR_ESCALATION_THRESHOLD", "80"),
            ("TALLY_OCR_CACHE_DIR", "/var/cache/tally"),
            ("TALLY_OCR_WORKER", "/usr/bin/tally-ocr-worker --quiet"),
        ]
        .into_iter()
        .collect();
        let mut cfg = PipelineConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.escalation_threshold, 80.0);
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/tally"));
        let worker = cfg.worker.unwrap();
        assert_eq!(worker.program, PathBuf::from("/usr/bin/tally-ocr-worker"));
        assert_eq!(worker.args, vec!["--quiet".to_string()]);
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn worker_file(dir: &Path) -> PathBuf {
        dir.join(format!("{BUNDLED_WORKER}{}", std::env::consts::EXE_SUFFIX))
    }

    #[test]
    fn load_picks_up_bundled_worker() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tally-server");
        touch(&exe);
        touch(&worker_file(dir.path()));

        let cfg = PipelineConfig::load_with(None, |_| None, Some(&exe)).unwrap();
        let worker = cfg.worker.unwrap();
        assert_eq!(worker.program, worker_file(dir.path()));
        assert!(worker.args.is_empty());
    }

    #[test]
    fn bundled_worker_found_from_deps_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("deps").join("tally_ocr-0123abcd");
        touch(&exe);
        touch(&worker_file(dir.path()));
        let worker = WorkerCommand::bundled_beside(&exe).unwrap();
        assert_eq!(worker.program, worker_file(dir.path()));
    }

    #[test]
    fn configured_worker_wins_over_bundled() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tally-server");
        touch(&exe);
        touch(&worker_file(dir.path()));
        let lookup = |k: &str| (k == "TALLY_OCR_WORKER").then(|| "/opt/worker --fast".to_string());

        let cfg = PipelineConfig::load_with(None, lookup, Some(&exe)).unwrap();
        assert_eq!(cfg.worker.unwrap().program, PathBuf::from("/opt/worker"));
    }

    #[test]
    fn missing_bundled_worker_leaves_isolation_off() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tally-server");
        touch(&exe);
        let cfg = PipelineConfig::load_with(None, |_| None, Some(&exe)).unwrap();
        assert!(cfg.worker.is_none());
        assert!(PipelineConfig::load_with(None, |_| None, None).unwrap().worker.is_none());
    }

    #[test]
    fn env_garbage_is_an_error() {
        let mut cfg = PipelineConfig::default();
        let err = cfg
            .apply_env(|k| (k == "TALLY_OCR_TILE_SIZE").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
