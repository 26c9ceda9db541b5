//! Seekable video reading using OpenCV's VideoCapture
//!
//! Filmstrip extraction needs random access by timestamp rather than a
//! linear frame walk, so this wrapper exposes millisecond seeking and a
//! `read_at` helper on top of the usual property accessors.

use opencv::{videoio, core::Mat, prelude::*};
use tracing::{instrument, debug, warn, info};
use std::path::Path;
use crate::common::{FusionError, Result};
use crate::retry::RetryPolicy;

/// Frame rate assumed when the container does not report one
pub const DEFAULT_FPS: f64 = 30.0;

/// Wrapper around OpenCV VideoCapture with timestamp seeking
pub struct VideoStream {
    cap: videoio::VideoCapture,
    fps: f64,
    frame_count: i64,
    width: i32,
    height: i32,
    path: String,
}

impl VideoStream {
    /// Open a video file for reading
    ///
    /// Chunk files that are still being finalized may report no frame
    /// count or frame rate; those are tolerated (fps falls back to
    /// [`DEFAULT_FPS`]) rather than rejected.
    ///
    /// # Errors
    /// * `VideoNotFound` - If the file doesn't exist
    /// * `VideoOpenFailed` - If OpenCV can't open the file
    #[instrument(skip(path))]
    pub fn open(path: &str) -> Result<Self> {
        debug!("Opening video stream: {}", path);

        if !Path::new(path).exists() {
            return Err(FusionError::VideoNotFound {
                path: path.to_string()
            });
        }

        let cap = videoio::VideoCapture::from_file(path, videoio::CAP_ANY)
            .map_err(|e| {
                warn!("Failed to create VideoCapture: {}", e);
                FusionError::VideoOpenFailed {
                    path: path.to_string()
                }
            })?;

        if !cap.is_opened().unwrap_or(false) {
            return Err(FusionError::VideoOpenFailed {
                path: path.to_string()
            });
        }

        let reported_fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        let fps = if reported_fps > 0.0 { reported_fps } else { DEFAULT_FPS };
        let frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0).max(0.0) as i64;
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;

        info!("Video opened - FPS: {:.2}, Frames: {}, Size: {}x{}",
              fps, frame_count, width, height);

        Ok(Self {
            cap,
            fps,
            frame_count,
            width,
            height,
            path: path.to_string(),
        })
    }

    /// Open a video, retrying transient open failures per `policy`
    ///
    /// A missing file is not retried.
    pub fn open_with_retry(path: &str, policy: &RetryPolicy) -> Result<Self> {
        policy.run_if(
            "open video",
            |_| Self::open(path),
            |e| matches!(e, FusionError::VideoOpenFailed { .. }),
        )
    }

    /// Read the next frame
    ///
    /// # Returns
    /// * `Result<Option<Mat>>` - The next frame if available, None at end of stream
    #[instrument(skip(self))]
    pub fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.cap.read(&mut frame)?;

        if success && !frame.empty() {
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }

    /// Seek to an offset in milliseconds from the start of the file
    pub fn seek_msec(&mut self, msec: f64) -> Result<()> {
        let accepted = self.cap.set(videoio::CAP_PROP_POS_MSEC, msec)?;
        if !accepted {
            debug!("Backend rejected seek to {:.0}ms in {}", msec, self.path);
        }
        Ok(())
    }

    /// Decode the frame at `seconds` from the start of the file
    pub fn read_at(&mut self, seconds: f64) -> Result<Option<Mat>> {
        self.seek_msec(seconds * 1000.0)?;
        self.read_frame()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Total number of frames reported by the container (0 when unknown)
    pub fn frame_count(&self) -> i64 {
        self.frame_count
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Duration derived from frame count and frame rate
    pub fn duration_seconds(&self) -> f64 {
        self.frame_count as f64 / self.fps
    }
}

// Implement Debug manually to avoid showing internal OpenCV state
impl std::fmt::Debug for VideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStream")
            .field("path", &self.path)
            .field("fps", &self.fps)
            .field("frame_count", &self.frame_count)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_video_stream_nonexistent_file() {
        let result = VideoStream::open("nonexistent_video.mp4");

        match result.unwrap_err() {
            FusionError::VideoNotFound { path } => {
                assert_eq!(path, "nonexistent_video.mp4");
            },
            other => panic!("Expected VideoNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_not_retried() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let started = std::time::Instant::now();
        let result = VideoStream::open_with_retry("missing_chunk.mp4", &policy);

        assert!(matches!(result, Err(FusionError::VideoNotFound { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_garbage_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_video.mp4");
        std::fs::write(&path, b"definitely not an mp4").unwrap();

        let result = VideoStream::open(path.to_str().unwrap());
        assert!(matches!(result, Err(FusionError::VideoOpenFailed { .. })));
    }
}
