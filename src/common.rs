//! Common types, utilities, and error handling for the fusion pipeline.
//!
//! This module provides the foundational types used throughout the codebase,
//! including the error taxonomy, time formatting, clip-safe file names and
//! bounded thread joins.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// All possible errors from the fusion pipeline
///
/// Variants map onto the pipeline's failure classes: I/O and decode
/// failures, external tool failures, model transport failures, model
/// response parse failures and configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Failed to open video file: {path}")]
    VideoOpenFailed { path: String },

    #[error("Video file not found: {path}")]
    VideoNotFound { path: String },

    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Frame processing failed at frame {frame}: {reason}")]
    FrameProcessingFailed { frame: u32, reason: String },

    #[error("{tool} not found in PATH")]
    ToolNotFound { tool: String },

    #[error("{tool} failed: {message}")]
    CommandFailed { tool: String, message: String, stderr: Option<String> },

    #[error("{operation} timed out after {seconds:.1}s")]
    Timeout { operation: String, seconds: f64 },

    #[error("Model request failed: {message}")]
    ModelRequest { message: String, retryable: bool },

    #[error("Failed to parse model response: {reason}")]
    ResponseParse { reason: String, raw: String },

    #[error("Malformed action at index {index}: {reason}")]
    MalformedAction { index: usize, reason: String },

    #[error("{component} is not running")]
    NotRunning { component: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl FusionError {
    /// Create a configuration error with a descriptive message
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Create a frame processing error
    pub fn frame_error(frame: u32, reason: impl Into<String>) -> Self {
        Self::FrameProcessingFailed {
            frame,
            reason: reason.into()
        }
    }

    /// Create a response parse error that keeps the offending raw text
    pub fn parse_error(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::ResponseParse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Create an internal error (for unexpected conditions)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Throttling, server errors, transport failures, timeouts and
    /// not-yet-readable files are transient. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ModelRequest { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Timeout { .. } | Self::CommandFailed { .. } | Self::VideoOpenFailed { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Convenient Result type for pipeline operations
pub type Result<T> = std::result::Result<T, FusionError>;

/// Format seconds as `MM:SS`, or `HH:MM:SS` from one hour on
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Format seconds as `HH:MM:SS` unconditionally
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Build a file-name-safe fragment from free text
///
/// Keeps alphanumerics, spaces, `-` and `_`, trims, turns spaces into
/// underscores and truncates to `max_chars` characters.
pub fn safe_filename(text: &str, max_chars: usize) -> String {
    let filtered: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();

    filtered
        .trim()
        .replace(' ', "_")
        .chars()
        .take(max_chars)
        .collect()
}

/// Join a worker thread, giving up after `timeout`
///
/// # Returns
/// * `Ok(Some(value))` - The thread finished and returned a value
/// * `Ok(None)` - The thread finished by panicking
/// * `Err(handle)` - The thread is still running; the handle is handed back
#[instrument(skip(handle))]
pub fn join_with_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
) -> std::result::Result<Option<T>, JoinHandle<T>> {
    let started = Instant::now();

    while !handle.is_finished() {
        if started.elapsed() >= timeout {
            debug!("Join timed out after {:.1}s", timeout.as_secs_f64());
            return Err(handle);
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(handle.join().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00");
        assert_eq!(format_time(75.9), "01:15");
        assert_eq!(format_time(3599.0), "59:59");
        assert_eq!(format_time(3723.0), "01:02:03");
        assert_eq!(format_time(-4.0), "00:00");
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(5.5), "00:00:05");
        assert_eq!(format_clock(3723.0), "01:02:03");
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("Intro: Welcome & Overview!", 50), "Intro_Welcome__Overview");
        assert_eq!(safe_filename("  padded title  ", 50), "padded_title");
        assert_eq!(safe_filename("abcdefghij", 4), "abcd");
        assert_eq!(safe_filename("???", 30), "");
    }

    #[test]
    fn test_join_with_timeout_finished() {
        let handle = std::thread::spawn(|| 42);
        let value = join_with_timeout(handle, Duration::from_secs(2));
        assert!(matches!(value, Ok(Some(42))));
    }

    #[test]
    fn test_join_with_timeout_expired() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _ = rx.recv();
        });

        let outcome = join_with_timeout(handle, Duration::from_millis(50));
        let handle = match outcome {
            Err(handle) => handle,
            Ok(_) => panic!("thread should still be running"),
        };

        drop(tx);
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_error_types() {
        let error = FusionError::config_error("Invalid threshold");
        assert!(matches!(error, FusionError::InvalidConfig { .. }));

        let error = FusionError::frame_error(42, "Processing failed");
        assert!(matches!(error, FusionError::FrameProcessingFailed { frame: 42, .. }));

        let error = FusionError::parse_error("no fenced block", "hello");
        assert!(matches!(error, FusionError::ResponseParse { ref raw, .. } if raw == "hello"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FusionError::ModelRequest { message: "429".into(), retryable: true }.is_retryable());
        assert!(!FusionError::ModelRequest { message: "400".into(), retryable: false }.is_retryable());
        assert!(FusionError::Timeout { operation: "ffprobe".into(), seconds: 5.0 }.is_retryable());
        assert!(!FusionError::config_error("bad").is_retryable());
        assert!(!FusionError::parse_error("bad", "").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = FusionError::VideoNotFound {
            path: "test.mp4".to_string()
        };
        assert_eq!(error.to_string(), "Video file not found: test.mp4");

        let error = FusionError::MalformedAction { index: 2, reason: "missing field `id`".into() };
        assert_eq!(error.to_string(), "Malformed action at index 2: missing field `id`");
    }
}
