use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::isolation::IsolatedRecognizer;
use crate::recognizer::{OcrBackend, OcrError, Recognition};
use crate::types::RecognitionConfig;

/// Which side of the process boundary a recognition ran on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    InProcess,
    Isolated,
}

/// One way of invoking the engine.
#[async_trait]
pub trait RecognitionCall: Send + Sync {
    fn path(&self) -> ExecutionPath;

    async fn recognize(
        &self,
        image: Arc<GrayImage>,
        config: RecognitionConfig,
    ) -> Result<Recognition, OcrError>;

    async fn detect_orientation(&self, _image: Arc<GrayImage>) -> Option<u32> {
        None
    }
}

/// Runs the backend on the blocking pool. Panics are caught and reported as
/// [`OcrError::Panicked`]; a call that overruns the timeout is abandoned
/// (the blocking thread finishes on its own).
pub struct InProcessCall {
    backend: Arc<dyn OcrBackend>,
    timeout: Duration,
}

impl InProcessCall {
    pub fn new(backend: Arc<dyn OcrBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, OcrError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn OcrBackend) -> Result<T, OcrError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(|| f(backend.as_ref())))
        });
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(OcrError::Timeout(self.timeout)),
            Ok(Err(join)) => Err(OcrError::Engine(format!("recognition task failed: {join}"))),
            Ok(Ok(Err(payload))) => Err(OcrError::Panicked(panic_message(payload.as_ref()))),
            Ok(Ok(Ok(result))) => result,
        }
    }
}

#[async_trait]
impl RecognitionCall for InProcessCall {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::InProcess
    }

    async fn recognize(
        &self,
        image: Arc<GrayImage>,
        config: RecognitionConfig,
    ) -> Result<Recognition, OcrError> {
        self.run_blocking(move |backend| backend.recognize(&image, &config)).await
    }

    async fn detect_orientation(&self, image: Arc<GrayImage>) -> Option<u32> {
        match self.run_blocking(move |backend| Ok(backend.detect_orientation(&image))).await {
            Ok(angle) => angle,
            Err(e) => {
                warn!("Orientation detection failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl RecognitionCall for IsolatedRecognizer {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Isolated
    }

    async fn recognize(
        &self,
        image: Arc<GrayImage>,
        config: RecognitionConfig,
    ) -> Result<Recognition, OcrError> {
        IsolatedRecognizer::recognize(self, &image, &config).await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub threshold: u32,
}

/// Process-wide engine failure counter. Crossing the threshold latches the
/// unhealthy flag until [`HealthTracker::reset`]; it never blocks calls.
#[derive(Debug)]
pub struct HealthTracker {
    total: AtomicU64,
    consecutive: AtomicU32,
    threshold: u32,
    unhealthy: AtomicBool,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            total: AtomicU64::new(0),
            consecutive: AtomicU32::new(0),
            threshold: threshold.max(1),
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.threshold && !self.unhealthy.swap(true, Ordering::Relaxed) {
            warn!(consecutive, threshold = self.threshold, "OCR engine marked unhealthy");
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.consecutive.store(0, Ordering::Relaxed);
        self.unhealthy.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.is_healthy(),
            total_failures: self.total.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            threshold: self.threshold,
        }
    }
}

/// Result of one adapter call. `success` is about the engine answering;
/// an answer with empty text is still a success.
#[derive(Debug)]
pub struct RecognitionOutput {
    pub text: String,
    pub token_confidences: Vec<f32>,
    pub confidence: f32,
    pub success: bool,
    pub path: ExecutionPath,
    pub error: Option<OcrError>,
    pub elapsed: Duration,
}

impl RecognitionOutput {
    fn succeeded(rec: Recognition, path: ExecutionPath, elapsed: Duration) -> Self {
        let confidence = rec.confidence();
        Self {
            text: rec.text,
            token_confidences: rec.word_confidences,
            confidence,
            success: true,
            path,
            error: None,
            elapsed,
        }
    }

    fn failed(error: OcrError, path: ExecutionPath, elapsed: Duration) -> Self {
        Self {
            text: String::new(),
            token_confidences: Vec::new(),
            confidence: 0.0,
            success: false,
            path,
            error: Some(error),
            elapsed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(OcrError::Cancelled))
    }
}

/// Engine wrapper with the fast/safe dual path.
///
/// Calls go in-process first. A failure there is retried once in an isolated
/// worker (when one is configured). After `isolate_after` consecutive
/// in-process failures, calls skip straight to the worker until the health
/// tracker is reset.
pub struct RecognitionAdapter {
    primary: Arc<dyn RecognitionCall>,
    isolated: Option<Arc<dyn RecognitionCall>>,
    health: Arc<HealthTracker>,
    primary_streak: AtomicU32,
    isolate_after: u32,
}

impl RecognitionAdapter {
    pub fn new(backend: Arc<dyn OcrBackend>, config: &PipelineConfig) -> Self {
        let primary: Arc<dyn RecognitionCall> =
            Arc::new(InProcessCall::new(backend, config.engine_timeout()));
        let isolated = config.worker.clone().map(|command| {
            let worker = IsolatedRecognizer::new(command, config.engine_timeout());
            Arc::new(worker) as Arc<dyn RecognitionCall>
        });
        Self::from_calls(primary, isolated, config.failure_threshold, config.isolate_after_failures)
    }

    pub fn from_calls(
        primary: Arc<dyn RecognitionCall>,
        isolated: Option<Arc<dyn RecognitionCall>>,
        failure_threshold: u32,
        isolate_after: u32,
    ) -> Self {
        Self {
            primary,
            isolated,
            health: Arc::new(HealthTracker::new(failure_threshold)),
            primary_streak: AtomicU32::new(0),
            isolate_after,
        }
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Clears the health flag and sends calls back through the fast path.
    pub fn reset_health(&self) {
        self.health.reset();
        self.primary_streak.store(0, Ordering::Relaxed);
    }

    fn bypass_primary(&self) -> Option<&Arc<dyn RecognitionCall>> {
        let streak = self.primary_streak.load(Ordering::Relaxed);
        match &self.isolated {
            Some(isolated) if self.isolate_after > 0 && streak >= self.isolate_after => {
                Some(isolated)
            }
            _ => None,
        }
    }

    pub async fn recognize(
        &self,
        image: Arc<GrayImage>,
        config: &RecognitionConfig,
        cancel: &CancellationToken,
    ) -> RecognitionOutput {
        let started = Instant::now();

        if let Some(isolated) = self.bypass_primary() {
            debug!("Primary path bypassed, recognizing in isolated worker");
            let result = call(isolated.as_ref(), image, config, cancel).await;
            return self.finish(result, ExecutionPath::Isolated, started);
        }

        let first = call(self.primary.as_ref(), Arc::clone(&image), config, cancel).await;
        let primary_path = self.primary.path();
        match first {
            Ok(rec) => {
                self.primary_streak.store(0, Ordering::Relaxed);
                self.finish(Ok(rec), primary_path, started)
            }
            Err(OcrError::Cancelled) => {
                self.finish(Err(OcrError::Cancelled), primary_path, started)
            }
            Err(e) => {
                self.primary_streak.fetch_add(1, Ordering::Relaxed);
                match &self.isolated {
                    Some(isolated) => {
                        warn!("In-process recognition failed, retrying in isolated worker: {e}");
                        let retry = call(isolated.as_ref(), image, config, cancel).await;
                        self.finish(retry, isolated.path(), started)
                    }
                    None => {
                        warn!("In-process recognition failed: {e}");
                        self.finish(Err(e), primary_path, started)
                    }
                }
            }
        }
    }

    /// Counts the outcome of one call against the health tracker, exactly once.
    fn finish(
        &self,
        result: Result<Recognition, OcrError>,
        path: ExecutionPath,
        started: Instant,
    ) -> RecognitionOutput {
        let elapsed = started.elapsed();
        match result {
            Ok(rec) => {
                self.health.record_success();
                RecognitionOutput::succeeded(rec, path, elapsed)
            }
            Err(OcrError::Cancelled) => {
                RecognitionOutput::failed(OcrError::Cancelled, path, elapsed)
            }
            Err(e) => {
                self.health.record_failure();
                RecognitionOutput::failed(e, path, elapsed)
            }
        }
    }

    /// Engine orientation detection; `None` when unsupported, failed, or the
    /// fast path is currently bypassed.
    pub async fn detect_orientation(
        &self,
        image: Arc<GrayImage>,
        cancel: &CancellationToken,
    ) -> Option<u32> {
        if self.bypass_primary().is_some() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            angle = self.primary.detect_orientation(image) => {
                angle.filter(|a| matches!(a, 0 | 90 | 180 | 270))
            }
        }
    }
}

async fn call(
    target: &dyn RecognitionCall,
    image: Arc<GrayImage>,
    config: &RecognitionConfig,
    cancel: &CancellationToken,
) -> Result<Recognition, OcrError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OcrError::Cancelled),
        result = target.recognize(image, config.clone()) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::recognizer::MockRecognizer;
    use crate::types::PageSegMode;
    use std::sync::atomic::AtomicUsize;

    struct Panicking {
        calls: AtomicUsize,
    }

    impl OcrBackend for Panicking {
        fn recognize(&self, _: &GrayImage, _: &RecognitionConfig) -> Result<Recognition, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("simulated engine fault");
        }
    }

    struct Slow;

    impl OcrBackend for Slow {
        fn recognize(&self, _: &GrayImage, _: &RecognitionConfig) -> Result<Recognition, OcrError> {
            std::thread::sleep(Duration::from_millis(1500));
            Ok(Recognition::new("late"))
        }
    }

    struct Upside;

    impl OcrBackend for Upside {
        fn recognize(&self, _: &GrayImage, _: &RecognitionConfig) -> Result<Recognition, OcrError> {
            Ok(Recognition::new(""))
        }

        fn detect_orientation(&self, _: &GrayImage) -> Option<u32> {
            Some(180)
        }
    }

    /// Scripted stand-in for the isolated worker.
    struct FakeWorker {
        text: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecognitionCall for FakeWorker {
        fn path(&self) -> ExecutionPath {
            ExecutionPath::Isolated
        }

        async fn recognize(
            &self,
            _: Arc<GrayImage>,
            _: RecognitionConfig,
        ) -> Result<Recognition, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Recognition::new(self.text).with_confidence(66.0))
        }
    }

    /// Worker that always reports a crashed child.
    struct CrashingWorker;

    #[async_trait]
    impl RecognitionCall for CrashingWorker {
        fn path(&self) -> ExecutionPath {
            ExecutionPath::Isolated
        }

        async fn recognize(
            &self,
            _: Arc<GrayImage>,
            _: RecognitionConfig,
        ) -> Result<Recognition, OcrError> {
            Err(OcrError::Crashed { signal: 11 })
        }
    }

    fn page() -> Arc<GrayImage> {
        Arc::new(GrayImage::from_pixel(32, 32, image::Luma([230])))
    }

    fn cfg() -> RecognitionConfig {
        RecognitionConfig::new(PageSegMode::SingleBlock, "eng")
    }

    fn in_process(
        backend: impl OcrBackend + 'static,
        timeout: Duration,
    ) -> Arc<dyn RecognitionCall> {
        Arc::new(InProcessCall::new(Arc::new(backend), timeout))
    }

    #[tokio::test]
    async fn fast_path_success() {
        let adapter = RecognitionAdapter::new(
            Arc::new(MockRecognizer::new("TOTAL 9.99").with_confidence(82.0)),
            &PipelineConfig::default(),
        );
        let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(out.success);
        assert_eq!(out.text, "TOTAL 9.99");
        assert_eq!(out.confidence, 82.0);
        assert_eq!(out.path, ExecutionPath::InProcess);
        assert!(adapter.health().is_healthy());
    }

    #[tokio::test]
    async fn empty_text_is_not_a_failure() {
        let adapter =
            RecognitionAdapter::new(Arc::new(MockRecognizer::new("")), &PipelineConfig::default());
        let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(out.success);
        assert!(out.text.is_empty());
        assert_eq!(out.confidence, 0.0);
        assert_eq!(adapter.health().snapshot().total_failures, 0);
    }

    #[tokio::test]
    async fn panic_is_contained_and_counted() {
        let adapter = RecognitionAdapter::from_calls(
            in_process(Panicking { calls: AtomicUsize::new(0) }, Duration::from_secs(5)),
            None,
            3,
            2,
        );
        for i in 1..=5 {
            let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
            assert!(!out.success);
            assert!(
                matches!(out.error, Some(OcrError::Panicked(ref m)) if m.contains("simulated"))
            );
            assert_eq!(adapter.health().is_healthy(), i < 3, "after {i} calls");
        }
        let snap = adapter.health().snapshot();
        assert_eq!(snap.total_failures, 5);
        assert_eq!(snap.threshold, 3);

        adapter.reset_health();
        assert!(adapter.health().is_healthy());
        assert_eq!(adapter.health().snapshot().total_failures, 0);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_worker() {
        let worker = Arc::new(FakeWorker { text: "RESCUED", calls: AtomicUsize::new(0) });
        let adapter = RecognitionAdapter::from_calls(
            in_process(Panicking { calls: AtomicUsize::new(0) }, Duration::from_secs(5)),
            Some(worker.clone()),
            3,
            2,
        );
        let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(out.success);
        assert_eq!(out.text, "RESCUED");
        assert_eq!(out.path, ExecutionPath::Isolated);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        // A rescued call is one success, not a failure.
        assert_eq!(adapter.health().snapshot().total_failures, 0);
        assert_eq!(adapter.health().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn failed_rescue_counts_once_per_call() {
        let adapter = RecognitionAdapter::from_calls(
            in_process(Panicking { calls: AtomicUsize::new(0) }, Duration::from_secs(5)),
            Some(Arc::new(CrashingWorker)),
            3,
            0,
        );
        for i in 1..=3u32 {
            let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
            assert!(!out.success);
            assert_eq!(out.path, ExecutionPath::Isolated);
            assert!(matches!(out.error, Some(OcrError::Crashed { signal: 11 })));
            assert_eq!(adapter.health().consecutive_failures(), i);
            assert_eq!(adapter.health().is_healthy(), i < 3, "after {i} calls");
        }
        assert_eq!(adapter.health().snapshot().total_failures, 3);
    }

    #[tokio::test]
    async fn repeated_primary_failures_bypass_fast_path() {
        let backend = Arc::new(Panicking { calls: AtomicUsize::new(0) });
        let worker = Arc::new(FakeWorker { text: "SAFE", calls: AtomicUsize::new(0) });
        let adapter = RecognitionAdapter::from_calls(
            Arc::new(InProcessCall::new(backend.clone(), Duration::from_secs(5))),
            Some(worker.clone()),
            10,
            2,
        );
        for _ in 0..4 {
            let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
            assert!(out.success);
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 4);

        adapter.reset_health();
        adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let slow = in_process(Slow, Duration::from_millis(100));
        let adapter = RecognitionAdapter::from_calls(slow, None, 3, 2);
        let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(!out.success);
        assert!(matches!(out.error, Some(OcrError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_is_not_counted_as_failure() {
        let adapter =
            RecognitionAdapter::from_calls(in_process(Slow, Duration::from_secs(10)), None, 1, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = adapter.recognize(page(), &cfg(), &cancel).await;
        assert!(out.is_cancelled());
        assert!(adapter.health().is_healthy());
    }

    #[tokio::test]
    async fn cancelling_in_flight_worker_returns_promptly() {
        let worker = IsolatedRecognizer::new(
            WorkerCommand::new("/bin/sh").with_args(["-c", "exec sleep 30"]),
            Duration::from_secs(20),
        );
        let adapter = RecognitionAdapter::from_calls(
            in_process(MockRecognizer::new("unused"), Duration::from_secs(20)),
            Some(Arc::new(worker)),
            3,
            1,
        );
        // One primary failure routes every later call straight to the worker.
        adapter.primary_streak.store(1, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let out = adapter.recognize(page(), &cfg(), &cancel).await;
        assert!(out.is_cancelled());
        assert_eq!(out.path, ExecutionPath::Isolated);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert!(adapter.health().is_healthy());
        assert_eq!(adapter.health().snapshot().total_failures, 0);
    }

    #[tokio::test]
    async fn crashing_worker_process_is_recoverable() {
        let mut config = PipelineConfig::default();
        config.worker = Some(
            WorkerCommand::new("/bin/sh").with_args(["-c", "cat >/dev/null; kill -SEGV $$"]),
        );
        let backend = Arc::new(Panicking { calls: AtomicUsize::new(0) });
        let adapter = RecognitionAdapter::new(backend, &config);
        let out = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(!out.success);
        assert_eq!(out.path, ExecutionPath::Isolated);
        assert!(matches!(out.error, Some(OcrError::Crashed { .. })));

        // Still serving afterwards.
        let again = adapter.recognize(page(), &cfg(), &CancellationToken::new()).await;
        assert!(!again.success);
    }

    #[tokio::test]
    async fn orientation_comes_from_engine() {
        let adapter = RecognitionAdapter::new(Arc::new(Upside), &PipelineConfig::default());
        assert_eq!(adapter.detect_orientation(page(), &CancellationToken::new()).await, Some(180));
        let mock =
            RecognitionAdapter::new(Arc::new(MockRecognizer::new("x")), &PipelineConfig::default());
        assert_eq!(mock.detect_orientation(page(), &CancellationToken::new()).await, None);
    }
}
