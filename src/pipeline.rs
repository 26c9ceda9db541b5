//! Live pipeline wiring
//!
//! One [`LivePipeline`] owns every long-running component of a live session:
//! the recorder, the segmenter, the chunk monitor, the transcript feed, the
//! analyzer and the clip extractor. [`LivePipeline::run`] starts them, waits
//! until the stream looks finished and shuts them down in dependency order.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use crate::audio_features::AudioAnalyzer;
use crate::chapters::Chapter;
use crate::chunk_processor::{ChunkMonitor, ChunkProcessor};
use crate::clips::{ClipExtractor, ClipSettings, ClipStats};
use crate::common::Result;
use crate::config::PipelineConfig;
use crate::filmstrip::FilmstripProcessor;
use crate::fusion_analyzer::{AnalysisRecord, FusionAnalyzer};
use crate::metrics::UsageReport;
use crate::model::ModelClient;
use crate::recording::RecordingManager;
use crate::shot_detector::ShotChangeDetector;
use crate::stream_monitor::StreamMonitor;
use crate::transcript::{SentenceAssembler, SharedSentenceBuffer, TranscriptFeed, TranscriptWriter};

/// Name of the results file written into the output directory
pub const RESULTS_FILE: &str = "analysis_results.json";

/// What a finished session produced
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub chapters: Vec<Chapter>,
    pub chunks_analyzed: usize,
    pub failed_chunks: Vec<u32>,
    pub sentences: usize,
    pub usage: UsageReport,
    pub clips: Option<ClipStats>,
    pub final_summary: Option<String>,
    pub results: Vec<AnalysisRecord>,
}

/// All components of a live session
pub struct LivePipeline {
    config: PipelineConfig,
    recording: Option<RecordingManager>,
    processor: ChunkProcessor,
    monitor: ChunkMonitor,
    analyzer: FusionAnalyzer,
    clips: Option<Arc<ClipExtractor>>,
    sentences: SharedSentenceBuffer,
    transcript_feed: Option<TranscriptFeed>,
    stop_requested: Arc<AtomicBool>,
    started: bool,
}

impl LivePipeline {
    /// Build every component from `config` without starting anything
    ///
    /// # Errors
    /// * `InvalidConfig` - The configuration is rejected
    /// * `Io` - The clip thread cannot be spawned
    pub fn new(config: PipelineConfig, client: Box<dyn ModelClient>) -> Result<Self> {
        config.validate()?;
        let output_dir = config.output_dir.clone();

        let clips = if config.analyzer.extract_clips {
            Some(Arc::new(ClipExtractor::start(ClipSettings {
                output_dir: output_dir.clone(),
                chapter_timeout: Duration::from_secs_f64(config.analyzer.chapter_clip_timeout_secs),
                topic_timeout: Duration::from_secs_f64(config.analyzer.topic_clip_timeout_secs),
            })?))
        } else {
            None
        };

        let sentences = SharedSentenceBuffer::new();
        let analyzer = FusionAnalyzer::new(&config, client, Arc::new(sentences.clone()), clips.clone())?;

        let detector = config.filmstrip.detect_shot_changes.then(|| {
            ShotChangeDetector::new(config.filmstrip.detection_method, config.filmstrip.shot_threshold, true)
        });
        let filmstrips = FilmstripProcessor::new(config.filmstrip.style.clone(), detector)?;

        let mut monitor = ChunkMonitor::new(
            &output_dir,
            config.chunk.clone(),
            config.filmstrip.clone(),
            filmstrips,
            Box::new(analyzer.handle()),
            config.retry.clone(),
        );
        if config.analyzer.audio_features {
            monitor = monitor.with_audio_features(Box::new(AudioAnalyzer::default()));
        }

        let recording = config
            .stream
            .record
            .then(|| RecordingManager::new(config.chunk.udp_port, &output_dir));
        let processor = ChunkProcessor::new(config.chunk.udp_port, config.chunk.chunk_duration, &output_dir);

        debug!("Live pipeline assembled for {}", output_dir.display());
        Ok(Self {
            config,
            recording,
            processor,
            monitor,
            analyzer,
            clips,
            sentences,
            transcript_feed: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// Flag that ends [`LivePipeline::run`] early when set
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn analyzer(&self) -> &FusionAnalyzer {
        &self.analyzer
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Start every component, consumers first
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            warn!("Live pipeline already started");
            return Ok(());
        }
        std::fs::create_dir_all(&self.config.output_dir)?;

        if let Some(path) = self.config.stream.transcript_events.clone() {
            let writer = TranscriptWriter::create(self.config.transcript_file())?;
            let assembler = SentenceAssembler::new(self.sentences.clone(), Some(writer));
            let idle = Duration::from_secs_f64(self.config.stream.timeout_secs);
            self.transcript_feed = Some(TranscriptFeed::start(path, assembler, idle));
        }

        self.analyzer.start_analysis()?;
        self.monitor.start()?;
        if let Some(recording) = self.recording.as_mut() {
            recording.start()?;
        }
        self.processor.start_processing()?;

        self.started = true;
        info!(
            "Live pipeline started: UDP port {}, {}s chunks, output in {}",
            self.config.chunk.udp_port,
            self.config.chunk.chunk_duration,
            self.config.output_dir.display()
        );
        Ok(())
    }

    /// Run until the stream ends or a stop is requested, then shut down
    ///
    /// # Errors
    /// * Any error from [`LivePipeline::start`]; shutdown itself only logs
    pub fn run(&mut self) -> Result<SessionSummary> {
        self.start()?;

        let mut stream = StreamMonitor::new(
            self.monitor.chunk_counter(),
            self.transcript_feed.as_ref().map(TranscriptFeed::running_flag),
            Duration::from_secs_f64(self.config.stream.timeout_secs),
        );
        let poll = Duration::from_secs_f64(self.config.stream.poll_secs);
        let started = Instant::now();

        loop {
            thread::sleep(poll);

            if self.stop_requested.load(Ordering::SeqCst) {
                info!("Stop requested");
                break;
            }
            if stream.update_activity() {
                let status = self.analyzer.status();
                info!(
                    "{} chunk(s) seen, {} analysed, {} pending, {} chapter(s) after {:.0}s",
                    stream.status().chunk_count,
                    status.chunks_analyzed,
                    status.pending,
                    status.chapters,
                    started.elapsed().as_secs_f64()
                );
            }
            if stream.stream_appears_ended() {
                break;
            }
            if !self.processor.is_running() {
                warn!("Segmenter is no longer running");
                break;
            }
        }

        Ok(self.shutdown())
    }

    /// Stop every component, producers first, and collect the results
    ///
    /// The recording is closed before the analyzer finalizes, so the last
    /// chapter's clips are cut from a complete file.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) -> SessionSummary {
        info!("Shutting down live pipeline");
        let stop_timeout = self.config.chunk.stop_timeout();

        self.processor.stop_processing(stop_timeout);
        self.monitor.stop();

        if let Some(feed) = self.transcript_feed.as_mut() {
            feed.stop(stop_timeout);
        }
        if let Some(recording) = self.recording.as_mut() {
            if let Err(e) = recording.stop() {
                warn!("Recording did not stop cleanly: {}", e);
            }
        }

        self.analyzer.stop_analysis();

        let final_summary = match self.analyzer.generate_final_summary() {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Final summary failed: {}", e);
                None
            }
        };

        let clips = self.clips.as_ref().map(|c| {
            c.shutdown(stop_timeout);
            c.stats()
        });

        let status = self.analyzer.status();
        let summary = SessionSummary {
            chapters: self.analyzer.chapters(),
            chunks_analyzed: status.chunks_analyzed,
            failed_chunks: status.failed_chunks,
            sentences: self.sentences.len(),
            usage: self.analyzer.usage_report(),
            clips,
            final_summary,
            results: self.analyzer.results().into_values().collect(),
        };

        let path = self.config.output_dir.join(RESULTS_FILE);
        match write_summary(&summary, &path) {
            Ok(()) => info!("Results written to {}", path.display()),
            Err(e) => error!("Failed to write {}: {}", path.display(), e),
        }

        self.started = false;
        summary
    }
}

/// Write a session summary as pretty JSON
pub fn write_summary(summary: &SessionSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, serde_json::to_string_pretty(summary)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl std::fmt::Debug for LivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePipeline")
            .field("output_dir", &self.config.output_dir)
            .field("started", &self.started)
            .field("analyzer", &self.analyzer)
            .finish()
    }
}
