//! Continuous recording of the live UDP stream
//!
//! The recording is the source for chapter and topic clips, so it is kept
//! as a single MXF file (MPEG-2 video, PCM audio) that stays seekable while
//! it grows.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use crate::common::Result;
use crate::ffmpeg::{FfmpegCommand, ManagedProcess};

/// Grace period before the recorder is killed
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Records `udp://127.0.0.1:<port>` to `<output>/recording/continuous_recording_<unix>.mxf`
#[derive(Debug)]
pub struct RecordingManager {
    udp_port: u16,
    recording_file: PathBuf,
    process: Option<ManagedProcess>,
    started_at: Option<Instant>,
}

impl RecordingManager {
    pub fn new(udp_port: u16, output_dir: impl AsRef<Path>) -> Self {
        let file_name = format!("continuous_recording_{}.mxf", chrono::Utc::now().timestamp());
        Self {
            udp_port,
            recording_file: output_dir.as_ref().join("recording").join(file_name),
            process: None,
            started_at: None,
        }
    }

    pub fn recording_file(&self) -> &Path {
        &self.recording_file
    }

    /// Recorder arguments (without the program name)
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let url = format!("udp://127.0.0.1:{}?overrun_nonfatal=1", self.udp_port);
        FfmpegCommand::new(url, self.recording_file.to_string_lossy())
            .video_codec("mpeg2video")
            .output_args(["-b:v", "5M"])
            .audio_codec("pcm_s16le")
            .output_args(["-ar", "48000", "-f", "mxf"])
            .build_args()
    }

    /// Start recording in the background
    ///
    /// Calling this while a recording is active does nothing.
    #[instrument(skip(self), fields(port = self.udp_port))]
    pub fn start(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        if let Some(parent) = self.recording_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let process = ManagedProcess::spawn("Recording", "ffmpeg", &self.ffmpeg_args())?;
        self.process = Some(process);
        self.started_at = Some(Instant::now());

        info!("Recording started on UDP port {} to {}", self.udp_port, self.recording_file.display());
        Ok(())
    }

    /// Stop the recorder, killing it if it does not finish within 5s
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            info!("Recording already stopped");
            return Ok(());
        };

        info!("Stopping continuous recording...");
        let outcome = process.stop(STOP_GRACE);
        self.started_at = None;

        match outcome {
            Ok(Some(_)) => info!("Recording stopped"),
            Ok(None) => warn!("Recording process killed"),
            Err(ref e) => warn!("Error stopping recording: {}", e),
        }
        outcome.map(|_| ())
    }

    /// Seconds since recording started, 0 when not recording
    pub fn duration(&self) -> f64 {
        self.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }

    pub fn is_active(&mut self) -> bool {
        self.process.as_mut().map(|p| p.is_running()).unwrap_or(false)
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        if self.process.is_some() {
            let _ = self.stop();
        }
    }
}
