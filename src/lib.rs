//! Live media chunking, filmstrip construction and incremental chapter fusion
//!
//! A live UDP stream is cut into fixed-length chunks. Each chunk becomes a
//! labelled filmstrip image plus a list of shot changes, is paired with the
//! transcript for its time range, and is sent to a multimodal model that
//! answers with incremental chapter and topic actions. The merged chapters
//! drive clip extraction from a continuous recording.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rust_mediafusion::{create_chunk_filmstrip, FilmstripConfig};
//! use std::path::Path;
//!
//! // One 4x5 filmstrip for a 20 second segment, with shot changes
//! let shots = create_chunk_filmstrip(
//!     "chunk_0000_20s.mp4",
//!     Path::new("filmstrip_0000_4x5.jpg"),
//!     0.0,
//!     &FilmstripConfig::default(),
//! )?;
//! println!("Shot changes at grid cells: {:?}", shots);
//! # Ok::<(), rust_mediafusion::FusionError>(())
//! ```
//!
//! A full live session is driven by [`LivePipeline`]:
//!
//! ```rust,no_run
//! use rust_mediafusion::{HttpModelClient, LivePipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_file("pipeline.json")?;
//! let client = HttpModelClient::from_config(&config.model)?;
//! let mut pipeline = LivePipeline::new(config, Box::new(client))?;
//! let summary = pipeline.run()?;
//! println!("{} chapters", summary.chapters.len());
//! # Ok::<(), rust_mediafusion::FusionError>(())
//! ```

mod adaptive_layout;
mod audio_features;
mod chapters;
mod chunk_processor;
mod clips;
mod common;
mod config;
mod conversation;
mod ffmpeg;
mod filmstrip;
mod fusion_analyzer;
mod metrics;
mod model;
mod pipeline;
mod recording;
mod retry;
mod shot_detector;
mod stream_monitor;
mod transcript;
mod video_stream;

// Re-export main types for public API
pub use adaptive_layout::{
    estimate_file_size_mb, AdaptiveConfig, AdaptiveFilmstripProcessor, AdaptiveResult, AdaptiveRun, GridLayout,
    GridOutput, ShotSegment,
};
pub use audio_features::{AudioAnalyzer, AudioFeatureSource, AudioFeatures};
pub use chapters::{
    parse_response, strip_code_fence, Action, AnalysisStatus, ApplyReport, Chapter, ChapterState, ContinuityIssue,
    ModelResponse, Topic,
};
pub use chunk_processor::{
    discover_chunks, duration_within_tolerance, parse_chunk_id, Chunk, ChunkMonitor, ChunkMonitorStatus,
    ChunkProcessor, ChunkSink, ChunkState, ReadyChunk,
};
pub use clips::{find_recording, plan_clips, ClipExtractor, ClipKind, ClipSettings, ClipSpec, ClipStats};
pub use common::{format_clock, format_time, safe_filename, FusionError, Result};
pub use config::{
    AnalyzerConfig, ChunkConfig, FilmstripConfig, ModelConfig, PipelineConfig, StreamConfig, API_KEY_ENV,
};
pub use conversation::{ContentBlock, Conversation, Exchange, Message, Role};
pub use ffmpeg::{probe_duration, require_tool, FfmpegCommand, ManagedProcess};
pub use filmstrip::{cell_label, slot_timestamps, FilmstripProcessor, FilmstripStyle, TimedFrame};
pub use fusion_analyzer::{
    describe_shot_changes, AnalysisHandle, AnalysisRecord, AnalyzerPhase, AnalyzerStatus, FusionAnalyzer,
};
pub use metrics::{cache_hit_ratio, ChunkMetric, CostBreakdown, Pricing, UsageReport, UsageTracker};
pub use model::{parse_reply, HttpModelClient, ModelClient, ModelReply, ModelRequest, TokenUsage};
pub use pipeline::{write_summary, LivePipeline, SessionSummary, RESULTS_FILE};
pub use recording::RecordingManager;
pub use retry::RetryPolicy;
pub use shot_detector::{DetectionMethod, DetectorConfig, ShotChangeDetector};
pub use stream_monitor::{StreamMonitor, StreamStatus, DEFAULT_STREAM_TIMEOUT};
pub use transcript::{
    ItemType, Sentence, SentenceAssembler, SentenceBuilder, SharedSentenceBuffer, TranscriptFeed, TranscriptItem,
    TranscriptResult, TranscriptSentence, TranscriptSlice, TranscriptSource, TranscriptWriter, NO_TRANSCRIPT,
};
pub use video_stream::VideoStream;

use std::path::Path;
use tracing::{info, instrument};

/// Build the filmstrip for one chunk file
///
/// Samples `config.frames_per_chunk` frames at `config.frame_interval_secs`
/// spacing, labels them from `start_time` and writes the grid as JPEG. The
/// detector used here is fresh, so there is no comparison with a previous
/// chunk.
///
/// # Arguments
/// * `video_path` - Segment file to sample
/// * `output_path` - Where the JPEG is written
/// * `start_time` - Stream time of the segment's first frame, used for labels
/// * `config` - Grid style, sampling and shot detection settings
///
/// # Returns
/// * `Result<Vec<usize>>` - Grid indices of frames that start a new shot
///
/// # Errors
/// * `VideoNotFound` - If the video file doesn't exist
/// * `VideoOpenFailed` - If OpenCV can't open the video
/// * `InvalidConfig` - If the grid style is invalid
#[instrument(skip(config))]
pub fn create_chunk_filmstrip(
    video_path: &str,
    output_path: &Path,
    start_time: f64,
    config: &FilmstripConfig,
) -> Result<Vec<usize>> {
    let detector = config
        .detect_shot_changes
        .then(|| ShotChangeDetector::new(config.detection_method, config.shot_threshold, false));
    let mut processor = FilmstripProcessor::new(config.style.clone(), detector)?;

    let shots = processor.create_filmstrip_from_video(
        video_path,
        output_path,
        start_time,
        config.frames_per_chunk,
        config.frame_interval_secs,
        config.detect_shot_changes,
    )?;

    info!("Filmstrip for {} has {} shot change(s)", video_path, shots.len());
    Ok(shots)
}

/// Initialize tracing for the pipeline
///
/// `RUST_LOG` takes precedence over `level` when set. Call once at startup.
///
/// # Arguments
/// * `level` - Tracing level filter (e.g., "debug", "info", "warn", "error")
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Media fusion pipeline initialized with tracing level: {}", level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("filmstrip_0000_4x5.jpg");
        let result = create_chunk_filmstrip("does_not_exist.mp4", &output, 0.0, &FilmstripConfig::default());

        assert!(matches!(result, Err(FusionError::VideoNotFound { .. })));
        assert!(!output.exists());
    }

    #[test]
    fn test_invalid_style_rejected() {
        let mut config = FilmstripConfig::default();
        config.style.rows = 0;
        let result = create_chunk_filmstrip("does_not_exist.mp4", Path::new("x.jpg"), 0.0, &config);
        assert!(matches!(result, Err(FusionError::InvalidConfig { .. })));
    }
}
