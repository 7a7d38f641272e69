//! Child side of the isolated recognition path: one JSON request on stdin,
//! one JSON response on stdout. Logs go to stderr.

use tracing_subscriber::EnvFilter;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();

    #[cfg(feature = "tesseract")]
    let backend = tally_ocr::recognizer::tesseract_backend::TesseractRecognizer::new(
        std::env::var("TESSDATA_PREFIX").ok(),
        std::env::var("TALLY_OCR_LANGUAGE").unwrap_or_else(|_| "eng".to_string()),
    );
    #[cfg(not(feature = "tesseract"))]
    let backend = tally_ocr::UnavailableRecognizer;

    tally_ocr::isolation::serve(&backend, stdin, stdout)
}
