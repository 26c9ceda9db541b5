//! Pipeline configuration
//!
//! Every section has defaults, so a config file only needs the fields it
//! changes. Load with [`PipelineConfig::from_file`] and check with
//! [`PipelineConfig::validate`] before wiring components.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use crate::common::{FusionError, Result};
use crate::filmstrip::FilmstripStyle;
use crate::metrics::Pricing;
use crate::retry::RetryPolicy;
use crate::shot_detector::DetectionMethod;

/// Environment variable holding the model API key
pub const API_KEY_ENV: &str = "MEDIAFUSION_API_KEY";

/// Stream segmentation and chunk readiness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub udp_port: u16,
    /// Seconds per chunk
    pub chunk_duration: u32,
    pub check_interval_secs: f64,
    /// Largest accepted difference between probed and expected duration
    pub readiness_tolerance_secs: f64,
    /// Files smaller than this are still being written
    pub min_chunk_bytes: u64,
    pub probe_timeout_secs: f64,
    pub heartbeat_secs: f64,
    pub stop_timeout_secs: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            udp_port: 1234,
            chunk_duration: 20,
            check_interval_secs: 0.5,
            readiness_tolerance_secs: 1.0,
            min_chunk_bytes: 50_000,
            probe_timeout_secs: 5.0,
            heartbeat_secs: 5.0,
            stop_timeout_secs: 5.0,
        }
    }
}

impl ChunkConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }
}

/// Per-chunk filmstrip sampling and shot detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilmstripConfig {
    pub style: FilmstripStyle,
    pub frames_per_chunk: usize,
    pub frame_interval_secs: f64,
    pub detection_method: DetectionMethod,
    pub shot_threshold: f64,
    pub detect_shot_changes: bool,
}

impl Default for FilmstripConfig {
    fn default() -> Self {
        Self {
            style: FilmstripStyle::fusion(),
            frames_per_chunk: 20,
            frame_interval_secs: 1.0,
            detection_method: DetectionMethod::Histogram,
            shot_threshold: 0.7,
            detect_shot_changes: true,
        }
    }
}

/// External model endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub summary_temperature: f64,
    pub request_timeout_secs: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_version: "2023-06-01".to_string(),
            max_tokens: 4096,
            temperature: 0.1,
            summary_temperature: 0.3,
            request_timeout_secs: 120.0,
        }
    }
}

/// Chapter analysis, context windowing and clip extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Finalized chapters kept in the conversation; `None` keeps everything
    pub keep_n_chapters: Option<usize>,
    pub drain_timeout_secs: f64,
    pub clip_wait_secs: f64,
    pub worker_join_secs: f64,
    pub extract_clips: bool,
    pub topic_clip_timeout_secs: f64,
    pub chapter_clip_timeout_secs: f64,
    pub audio_features: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            keep_n_chapters: None,
            drain_timeout_secs: 300.0,
            clip_wait_secs: 120.0,
            worker_join_secs: 5.0,
            extract_clips: true,
            topic_clip_timeout_secs: 60.0,
            chapter_clip_timeout_secs: 300.0,
            audio_features: false,
        }
    }
}

/// End-of-stream detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub timeout_secs: f64,
    pub poll_secs: f64,
    /// JSON-lines file of speech-to-text results, if transcription is running
    pub transcript_events: Option<PathBuf>,
    pub record: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60.0,
            poll_secs: 5.0,
            transcript_events: None,
            record: true,
        }
    }
}

/// Complete live pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub chunk: ChunkConfig,
    pub filmstrip: FilmstripConfig,
    pub model: ModelConfig,
    pub analyzer: AnalyzerConfig,
    pub stream: StreamConfig,
    pub retry: RetryPolicy,
    pub pricing: Pricing,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            chunk: ChunkConfig::default(),
            filmstrip: FilmstripConfig::default(),
            model: ModelConfig::default(),
            analyzer: AnalyzerConfig::default(),
            stream: StreamConfig::default(),
            retry: RetryPolicy::default(),
            pricing: Pricing::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; absent fields keep their defaults
    ///
    /// # Errors
    /// * `Io` - The file cannot be read
    /// * `Json` - The file is not valid JSON for this schema
    /// * `InvalidConfig` - A value fails [`PipelineConfig::validate`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<()> {
        let chunk = &self.chunk;
        if chunk.chunk_duration == 0 {
            return Err(FusionError::config_error("chunk_duration must be positive"));
        }
        if !(chunk.check_interval_secs > 0.0) {
            return Err(FusionError::config_error("check_interval_secs must be positive"));
        }
        if chunk.readiness_tolerance_secs < 0.0 {
            return Err(FusionError::config_error("readiness_tolerance_secs cannot be negative"));
        }
        if !(chunk.probe_timeout_secs > 0.0) {
            return Err(FusionError::config_error("probe_timeout_secs must be positive"));
        }

        self.filmstrip.style.validate()?;
        if self.filmstrip.frames_per_chunk == 0 {
            return Err(FusionError::config_error("frames_per_chunk must be positive"));
        }
        if !(self.filmstrip.frame_interval_secs > 0.0) {
            return Err(FusionError::config_error("frame_interval_secs must be positive"));
        }
        if !(self.filmstrip.shot_threshold >= 0.0) {
            return Err(FusionError::config_error("shot_threshold cannot be negative"));
        }
        if self.filmstrip.frames_per_chunk > self.filmstrip.style.capacity() {
            return Err(FusionError::config_error(format!(
                "frames_per_chunk {} exceeds grid capacity {}",
                self.filmstrip.frames_per_chunk,
                self.filmstrip.style.capacity()
            )));
        }

        if self.model.endpoint.is_empty() || self.model.model.is_empty() {
            return Err(FusionError::config_error("model endpoint and name are required"));
        }
        if self.model.max_tokens == 0 {
            return Err(FusionError::config_error("max_tokens must be positive"));
        }

        if !(self.stream.timeout_secs > 0.0) || !(self.stream.poll_secs > 0.0) {
            return Err(FusionError::config_error("stream timeout and poll interval must be positive"));
        }

        self.retry.validate()?;
        self.pricing.validate()?;
        Ok(())
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.output_dir.join("chunks")
    }

    pub fn filmstrips_dir(&self) -> PathBuf {
        self.output_dir.join("filmstrips")
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.output_dir.join("clips")
    }

    pub fn transcript_file(&self) -> PathBuf {
        self.output_dir.join("transcripts").join("live_transcript.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk.chunk_duration, 20);
        assert_eq!(config.filmstrip.frames_per_chunk, 20);
        assert_eq!(config.analyzer.keep_n_chapters, None);
        assert_eq!(config.transcript_file(), PathBuf::from("output/transcripts/live_transcript.json"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"output_dir": "/tmp/live", "chunk": {"udp_port": 5004}, "analyzer": {"keep_n_chapters": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.chunk.udp_port, 5004);
        assert_eq!(config.chunk.chunk_duration, 20);
        assert_eq!(config.analyzer.keep_n_chapters, Some(2));
        assert_eq!(config.analyzer.drain_timeout_secs, 300.0);
        assert_eq!(config.chunks_dir(), PathBuf::from("/tmp/live/chunks"));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut config = PipelineConfig::default();
        config.chunk.chunk_duration = 0;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig { .. })));

        let mut config = PipelineConfig::default();
        config.chunk.check_interval_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.filmstrip.frames_per_chunk = 21;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.filmstrip.style.rows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"stream": {"timeout_secs": 30}}"#).unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.stream.timeout_secs, 30.0);

        std::fs::write(&path, r#"{"chunk": {"chunk_duration": 0}}"#).unwrap();
        assert!(PipelineConfig::from_file(&path).is_err());
        assert!(PipelineConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
