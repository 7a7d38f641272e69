//! Out-of-process recognition.
//!
//! The parent serializes one [`WorkerRequest`] onto the child's stdin and
//! reads one [`WorkerResponse`] from its stdout. Nothing else is shared, so a
//! worker that segfaults takes only itself down.

use std::io::{Read, Write};
use std::process::{Output, Stdio};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::WorkerCommand;
use crate::recognizer::{encode_png, OcrBackend, OcrError, Recognition};
use crate::types::RecognitionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub image_png_base64: String,
    pub config: RecognitionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok {
        text: String,
        #[serde(default)]
        mean_confidence: Option<f32>,
        #[serde(default)]
        word_confidences: Vec<f32>,
    },
    Error {
        message: String,
    },
}

/// Runs each recognition in a freshly spawned worker process under a hard
/// wall-clock limit.
#[derive(Debug, Clone)]
pub struct IsolatedRecognizer {
    command: WorkerCommand,
    timeout: Duration,
}

impl IsolatedRecognizer {
    pub fn new(command: WorkerCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Dropping the returned future kills the worker.
    pub async fn recognize(
        &self,
        image: &GrayImage,
        config: &RecognitionConfig,
    ) -> Result<Recognition, OcrError> {
        let request = WorkerRequest {
            image_png_base64: BASE64.encode(encode_png(image)?),
            config: config.clone(),
        };
        let payload = serde_json::to_vec(&request).map_err(|e| OcrError::Worker(e.to_string()))?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OcrError::Worker(format!("failed to spawn {}: {e}", self.command.program.display()))
            })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Worker("worker stdin unavailable".to_string()))?;
        debug!(pid = child.id(), bytes = payload.len(), "Spawned OCR worker");

        let write = async move {
            let written = stdin.write_all(&payload).await;
            drop(stdin);
            written
        };
        let run = async move { tokio::join!(write, child.wait_with_output()) };

        let (written, output) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| OcrError::Timeout(self.timeout))?;
        let output = output.map_err(|e| OcrError::Worker(e.to_string()))?;
        let result = decode_output(&output);
        // A worker that dies before reading its input closes the pipe; the
        // exit status is the more useful error in that case.
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe && result.is_ok() {
                return Err(OcrError::Worker(format!("failed to send request: {e}")));
            }
        }
        result
    }
}

fn decode_output(output: &Output) -> Result<Recognition, OcrError> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = output.status.signal() {
            return Err(OcrError::Crashed { signal });
        }
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let start = stderr.char_indices().rev().nth(299).map(|(i, _)| i).unwrap_or(0);
        return Err(OcrError::Worker(format!(
            "worker exited with {}: {}",
            output.status,
            &stderr[start..]
        )));
    }
    let response: WorkerResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| OcrError::Worker(format!("unreadable worker response: {e}")))?;
    match response {
        WorkerResponse::Ok { text, mean_confidence, word_confidences } => Ok(Recognition {
            text,
            mean_confidence,
            word_confidences,
        }),
        WorkerResponse::Error { message } => Err(OcrError::Engine(message)),
    }
}

/// Child side of the protocol: read one request from `input`, recognize it
/// with `backend`, write one response to `output`.
pub fn serve<B, R, W>(backend: &B, mut input: R, mut output: W) -> std::io::Result<()>
where
    B: OcrBackend + ?Sized,
    R: Read,
    W: Write,
{
    let mut buf = Vec::new();
    input.read_to_end(&mut buf)?;
    let response = match handle(backend, &buf) {
        Ok(rec) => WorkerResponse::Ok {
            text: rec.text,
            mean_confidence: rec.mean_confidence,
            word_confidences: rec.word_confidences,
        },
        Err(e) => WorkerResponse::Error { message: e.to_string() },
    };
    serde_json::to_writer(&mut output, &response)?;
    output.flush()
}

fn handle<B: OcrBackend + ?Sized>(backend: &B, buf: &[u8]) -> Result<Recognition, OcrError> {
    let request: WorkerRequest = serde_json::from_slice(buf)
        .map_err(|e| OcrError::Worker(format!("malformed request: {e}")))?;
    let png = BASE64
        .decode(request.image_png_base64.as_bytes())
        .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
    let image = image::load_from_memory(&png)
        .map_err(|e| OcrError::ImageDecode(e.to_string()))?
        .to_luma8();
    backend.recognize(&image, &request.config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{MockRecognizer, UnavailableRecognizer};
    use crate::types::PageSegMode;
    use std::io::Cursor;

    fn page() -> GrayImage {
        GrayImage::from_pixel(16, 16, image::Luma([240]))
    }

    fn cfg() -> RecognitionConfig {
        RecognitionConfig::new(PageSegMode::SingleBlock, "eng")
    }

    fn shell(script: &str, timeout: Duration) -> IsolatedRecognizer {
        IsolatedRecognizer::new(WorkerCommand::new("/bin/sh").with_args(["-c", script]), timeout)
    }

    fn request_bytes() -> Vec<u8> {
        serde_json::to_vec(&WorkerRequest {
            image_png_base64: BASE64.encode(encode_png(&page()).unwrap()),
            config: cfg(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn well_behaved_worker_returns_text() {
        let worker = shell(
            r#"cat >/dev/null; echo '{"status":"ok","text":"TOTAL 5.50","mean_confidence":88.0}'"#,
            Duration::from_secs(10),
        );
        let rec = worker.recognize(&page(), &cfg()).await.unwrap();
        assert_eq!(rec.text, "TOTAL 5.50");
        assert_eq!(rec.mean_confidence, Some(88.0));
        assert!(rec.word_confidences.is_empty());
    }

    #[tokio::test]
    async fn crashing_worker_reports_signal() {
        let worker = shell("cat >/dev/null; kill -SEGV $$", Duration::from_secs(10));
        let err = worker.recognize(&page(), &cfg()).await.unwrap_err();
        assert!(matches!(err, OcrError::Crashed { signal: 11 }), "{err:?}");
    }

    #[tokio::test]
    async fn worker_dying_before_reading_is_still_reported() {
        let worker = shell("kill -SEGV $$", Duration::from_secs(10));
        let err = worker.recognize(&page(), &cfg()).await.unwrap_err();
        assert!(matches!(err, OcrError::Crashed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn hanging_worker_is_killed_on_timeout() {
        let worker = shell("exec sleep 30", Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = worker.recognize(&page(), &cfg()).await.unwrap_err();
        assert!(matches!(err, OcrError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_worker_error() {
        let worker = shell("cat >/dev/null; echo boom >&2; exit 3", Duration::from_secs(10));
        match worker.recognize(&page(), &cfg()).await {
            Err(OcrError::Worker(msg)) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("expected worker error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_stdout_is_a_worker_error() {
        let worker = shell("cat >/dev/null; echo not-json", Duration::from_secs(10));
        assert!(matches!(worker.recognize(&page(), &cfg()).await, Err(OcrError::Worker(_))));
    }

    #[tokio::test]
    async fn engine_error_response_maps_to_engine_error() {
        let worker = shell(
            r#"cat >/dev/null; echo '{"status":"error","message":"no tessdata"}'"#,
            Duration::from_secs(10),
        );
        match worker.recognize(&page(), &cfg()).await {
            Err(OcrError::Engine(msg)) => assert_eq!(msg, "no tessdata"),
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_worker_error() {
        let worker = IsolatedRecognizer::new(
            WorkerCommand::new("/nonexistent/tally-ocr-worker"),
            Duration::from_secs(1),
        );
        assert!(matches!(worker.recognize(&page(), &cfg()).await, Err(OcrError::Worker(_))));
    }

    #[test]
    fn serve_answers_with_backend_text() {
        let backend = MockRecognizer::new("ACME\n12.00").with_confidence(70.0);
        let mut out = Vec::new();
        serve(&backend, Cursor::new(request_bytes()), &mut out).unwrap();
        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            response,
            WorkerResponse::Ok {
                text: "ACME\n12.00".into(),
                mean_confidence: Some(70.0),
                word_confidences: vec![],
            }
        );
    }

    #[test]
    fn serve_reports_backend_errors() {
        let mut out = Vec::new();
        serve(&UnavailableRecognizer, Cursor::new(request_bytes()), &mut out).unwrap();
        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        assert!(matches!(response, WorkerResponse::Error { .. }));
    }

    #[test]
    fn serve_rejects_malformed_requests() {
        let mut out = Vec::new();
        serve(&MockRecognizer::new("x"), Cursor::new(b"{oops".to_vec()), &mut out).unwrap();
        match serde_json::from_slice::<WorkerResponse>(&out).unwrap() {
            WorkerResponse::Error { message } => assert!(message.contains("malformed")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
