//! Incremental chapter analysis over a stream of chunks
//!
//! [`FusionAnalyzer`] owns one worker thread that takes ready chunks in
//! arrival order, sends each one to the model together with the running
//! conversation, and merges the returned actions into the chapter state.
//! Exactly one model request is in flight at any time, so merges always
//! happen in chunk order.
//!
//! The chapter state and the conversation live on the worker thread. Other
//! threads see copies published after every merge through
//! [`FusionAnalyzer::chapters`], [`FusionAnalyzer::results`] and
//! [`FusionAnalyzer::status`].
//!
//! Lifecycle: `Idle -> Running -> Draining -> Finalizing -> Stopped`.
//! Draining always runs before finalization, even when the drain times out.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use crate::audio_features::AudioFeatures;
use crate::chapters::{parse_response, AnalysisStatus, Chapter, ChapterState};
use crate::chunk_processor::{ChunkSink, ReadyChunk};
use crate::clips::ClipExtractor;
use crate::common::{format_time, join_with_timeout, FusionError, Result};
use crate::config::{AnalyzerConfig, ModelConfig, PipelineConfig};
use crate::conversation::{ContentBlock, Conversation, Message};
use crate::metrics::{Pricing, UsageReport, UsageTracker};
use crate::model::{ModelClient, ModelRequest};
use crate::retry::RetryPolicy;
use crate::transcript::{TranscriptSentence, TranscriptSource};

/// How long the worker waits on an empty queue before re-checking the abort flag
const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Interval between progress lines while draining
const DRAIN_LOG_INTERVAL: Duration = Duration::from_secs(15);

const SYSTEM_PROMPT: &str = "\
You segment a live video into chapters and topics, one chunk at a time.

Each user turn describes one chunk and contains:
- the chunk identifier and its time range in seconds
- a JSON transcript with sentence_start_time_in_sec and sentence_end_time_in_sec
- optionally, acoustic features (tempo, spectral centroid, RMS energy, zero crossing rate)
- a filmstrip image: a grid of frames, each labelled [RowxColumn] | timestamp
- optionally, a SHOT CHANGES DETECTED list such as \"45.20s [grid 2x1, frame 5]\"

Decide whether the chunk continues the current topic, starts a new topic,
or starts a new chapter. A chapter is a major change of subject; a topic
is a shift within it.

Topic boundaries:
- Prefer transcript sentence times, then shot change times, then frame
  timestamps. Use chunk boundaries only when nothing better exists.
- Topics must be contiguous: a new topic starts where the previous one ends.
- Avoid topics shorter than 5 seconds. When unsure, extend the current topic.
- Mention visible on-screen text and, when acoustic features are given,
  the speaker's tone and delivery in topic summaries.

Reply with JSON only, containing the changes caused by this chunk:
{
  \"actions\": [
    {\"type\": \"new_chapter\", \"id\": \"h1\", \"chapter\": \"Introduction\"},
    {\"type\": \"new_topic\", \"id\": \"t1\", \"chapter_id\": \"h1\", \"topic_summary\": \"...\",
     \"start_time\": 3.456, \"end_time\": 20.0, \"chunks\": [0]},
    {\"type\": \"update_topic\", \"id\": \"t1\", \"end_time\": 38.2, \"chunks\": [0, 1]}
  ],
  \"analysis_status\": {\"total_chunks_processed\": 1, \"notes\": \"...\"}
}
Chapter ids are h1, h2, ... and topic ids t1, t2, ... in order of creation.
Never reuse an id. Return an empty actions list when nothing changes.";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize analysed videos. Identify the kind of content first, \
then write a summary structured for that kind of content.";

/// Analyzer lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerPhase {
    #[default]
    Idle,
    Running,
    Draining,
    Finalizing,
    Stopped,
}

/// Outcome of one analysed chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub chunk_id: u32,
    /// `"<start>s-<end>s"` with one decimal
    pub time_range: String,
    /// Chapter structure right after this chunk was merged
    pub chapters: Vec<Chapter>,
    pub transcript: String,
    pub transcript_sentences: Vec<TranscriptSentence>,
    pub analysis_status: Option<AnalysisStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerStatus {
    pub phase: AnalyzerPhase,
    pub pending: usize,
    pub chunks_analyzed: usize,
    pub failed_chunks: Vec<u32>,
    pub chapters: usize,
    pub topics: usize,
    /// Chapters handed to clip extraction so far
    pub finalized_chapters: usize,
    /// Exchanges currently kept in the conversation
    pub history_len: usize,
}

/// Everything other threads may read, updated by the worker after each chunk
#[derive(Debug, Default)]
struct Shared {
    phase: AnalyzerPhase,
    chapters: Vec<Chapter>,
    results: BTreeMap<u32, AnalysisRecord>,
    usage: UsageTracker,
    failed_chunks: Vec<u32>,
    finalized_chapters: usize,
    history_len: usize,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cloneable entry point for producers of ready chunks
#[derive(Clone)]
pub struct AnalysisHandle {
    sender: Sender<ReadyChunk>,
    pending: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl AnalysisHandle {
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl ChunkSink for AnalysisHandle {
    fn submit(&self, chunk: ReadyChunk) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(FusionError::NotRunning { component: "fusion analyzer".to_string() });
        }

        let chunk_id = chunk.chunk_id;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(chunk).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(FusionError::NotRunning { component: "analysis worker".to_string() });
        }
        debug!("Queued chunk {} for analysis ({} pending)", chunk_id, self.pending());
        Ok(())
    }
}

impl std::fmt::Debug for AnalysisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisHandle")
            .field("pending", &self.pending())
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

/// Shot change positions as absolute times with their grid cell
///
/// Frame `i` of `n` sits at the middle of its slot, so its offset into the
/// chunk is `(i + 0.5) / n` of the chunk duration.
pub fn describe_shot_changes(frames: &[usize], start_time: f64, end_time: f64, num_frames: usize, cols: u32) -> String {
    if frames.is_empty() || num_frames == 0 || cols == 0 {
        return String::new();
    }

    let cols = cols as usize;
    let duration = end_time - start_time;
    let times: Vec<String> = frames
        .iter()
        .map(|&idx| {
            let at = start_time + ((idx as f64 + 0.5) / num_frames as f64) * duration;
            format!("{:.2}s [grid {}x{}, frame {}]", at, idx / cols + 1, idx % cols + 1, idx)
        })
        .collect();

    format!(
        "\n\nSHOT CHANGES DETECTED:\n{} shot changes at: {}\n\n",
        frames.len(),
        times.join(", ")
    )
}

/// Layout facts used to describe the filmstrip image to the model
#[derive(Debug, Clone, Copy)]
struct GridInfo {
    rows: u32,
    cols: u32,
    frames: usize,
}

/// State owned by the analysis thread
struct AnalysisWorker {
    client: Box<dyn ModelClient>,
    transcript: Arc<dyn TranscriptSource>,
    clips: Option<Arc<ClipExtractor>>,
    model: ModelConfig,
    keep_n_chapters: Option<usize>,
    retry: RetryPolicy,
    grid: GridInfo,
    state: ChapterState,
    conversation: Conversation,
    finalized_sent: usize,
    shared: Arc<Mutex<Shared>>,
}

impl AnalysisWorker {
    fn run(mut self, receiver: Receiver<ReadyChunk>, pending: Arc<AtomicUsize>, abort: Arc<AtomicBool>) -> Self {
        info!("Analysis worker started");

        while !abort.load(Ordering::SeqCst) {
            let chunk = match receiver.recv_timeout(QUEUE_POLL) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let chunk_id = chunk.chunk_id;
            let started = Instant::now();
            match self.process_chunk(&chunk) {
                Ok(()) => info!(
                    "Chunk {} analysed in {:.2}s: {} chapters, {} topics",
                    chunk_id,
                    started.elapsed().as_secs_f64(),
                    self.state.chapter_count(),
                    self.state.topic_count()
                ),
                Err(e) => {
                    error!("Analysis of chunk {} failed, keeping previous state: {}", chunk_id, e);
                    lock_shared(&self.shared).failed_chunks.push(chunk_id);
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        }

        let dropped = receiver.try_iter().count();
        if dropped > 0 {
            warn!("Analysis worker stopped with {} chunk(s) still queued", dropped);
            pending.fetch_sub(dropped, Ordering::SeqCst);
        }
        info!("Analysis worker stopped");
        self
    }

    fn intro_text(&self, chunk: &ReadyChunk, transcript_json: &str) -> String {
        format!(
            "Chunk identifier: chunk_{:04}. Time range: {:.1}s - {:.1}s.\n\n\
             Here is the audio transcript for this chunk with precise timestamps:\n\n{}",
            chunk.chunk_id, chunk.start_time, chunk.end_time, transcript_json
        )
    }

    fn filmstrip_text(&self, chunk: &ReadyChunk) -> String {
        format!(
            "Above is the chunk filmstrip showing {} frames in a {}x{} grid with clear borders and labels, \
             uniformly sampled across the {:.0}-second chunk. Each frame shows its grid position [Row x Column] \
             and timestamp below it.{}",
            self.grid.frames,
            self.grid.rows,
            self.grid.cols,
            chunk.end_time - chunk.start_time,
            describe_shot_changes(
                &chunk.shot_change_frames,
                chunk.start_time,
                chunk.end_time,
                self.grid.frames,
                self.grid.cols
            )
        )
    }

    #[instrument(skip(self, chunk), fields(chunk_id = chunk.chunk_id))]
    fn process_chunk(&mut self, chunk: &ReadyChunk) -> Result<()> {
        let slice = self.transcript.slice(chunk.start_time, chunk.end_time);
        let transcript_json = if slice.sentences.is_empty() {
            slice.text.clone()
        } else {
            serde_json::to_string_pretty(&slice.sentences)?
        };
        debug!("Transcript for chunk {}: {} sentence(s)", chunk.chunk_id, slice.sentences.len());

        let intro = self.intro_text(chunk, &transcript_json);
        let audio_text = chunk.audio_features.as_ref().map(AudioFeatures::request_text).unwrap_or_default();

        let user = Message::user(vec![
            ContentBlock::cached_text(format!("{} \n\n{}", intro, audio_text)),
            ContentBlock::jpeg_file(&chunk.filmstrip_path)?,
            ContentBlock::text(self.filmstrip_text(chunk)),
        ]);

        let request = ModelRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: self.conversation.messages_with(user),
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
        };
        info!("Sending chunk {} with {} messages", chunk.chunk_id, request.messages.len());

        let label = format!("model call for chunk {}", chunk.chunk_id);
        let reply = self.retry.run(&label, |_| self.client.send(&request))?;
        lock_shared(&self.shared).usage.record(chunk.chunk_id, &reply.usage);

        let response = parse_response(&reply.text).map_err(|e| {
            error!("Unusable model response for chunk {}: {}", chunk.chunk_id, reply.text);
            e
        })?;

        let known_issues = self.state.continuity_issues();
        let report = self.state.apply(&response.actions);
        debug!(
            "Chunk {}: +{} chapters, +{} topics, {} updated, {} ignored",
            chunk.chunk_id,
            report.chapters_added.len(),
            report.topics_added.len(),
            report.topics_updated.len(),
            report.ignored.len()
        );
        for issue in self.state.continuity_issues() {
            if !known_issues.contains(&issue) {
                warn!("Continuity issue after chunk {}: {}", chunk.chunk_id, issue);
            }
        }

        // Images stay out of the history; the text carries the chunk reference
        self.conversation.push(
            Message::user(vec![ContentBlock::text(format!("{}\n\n", intro))]),
            Message::assistant_text(reply.text),
        );

        self.submit_finalized();
        self.apply_window(chunk.chunk_id);

        let record = AnalysisRecord {
            chunk_id: chunk.chunk_id,
            time_range: format!("{:.1}s-{:.1}s", chunk.start_time, chunk.end_time),
            chapters: self.state.chapters().to_vec(),
            transcript: slice.text,
            transcript_sentences: slice.sentences,
            analysis_status: response.analysis_status,
        };

        let mut shared = lock_shared(&self.shared);
        shared.chapters = record.chapters.clone();
        shared.results.insert(chunk.chunk_id, record);
        shared.finalized_chapters = self.finalized_sent;
        shared.history_len = self.conversation.len();
        Ok(())
    }

    /// Hand newly finalized chapters to clip extraction
    fn submit_finalized(&mut self) {
        let finalized = self.state.finalized_chapters();
        if finalized.len() <= self.finalized_sent {
            return;
        }

        info!("{} chapter(s) finalized", finalized.len() - self.finalized_sent);
        self.finalized_sent = finalized.len();
        if let Some(clips) = &self.clips {
            clips.submit(finalized.to_vec());
        }
    }

    /// Drop exchanges whose chunks belong to chapters outside the retention window
    fn apply_window(&mut self, current_chunk: u32) {
        let Some(keep) = self.keep_n_chapters else {
            return;
        };
        if self.state.chapter_count() <= keep + 1 {
            return;
        }

        let mut chunks = self.state.recent_chunk_ids(keep + 1);
        chunks.insert(current_chunk);
        let removed = self.conversation.retain_chunks(&chunks);
        if removed > 0 {
            info!(
                "Context window: removed {} exchange(s), {} kept for the last {} chapter(s)",
                removed,
                self.conversation.len(),
                keep + 1
            );
        }
    }
}

/// Sequential chunk analysis with a background worker
pub struct FusionAnalyzer {
    config: AnalyzerConfig,
    model: ModelConfig,
    pricing: Pricing,
    handle: AnalysisHandle,
    abort: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
    clips: Option<Arc<ClipExtractor>>,
    receiver: Option<Receiver<ReadyChunk>>,
    /// Present while the worker thread is not running
    worker: Option<AnalysisWorker>,
    thread: Option<JoinHandle<AnalysisWorker>>,
}

impl FusionAnalyzer {
    /// Create an idle analyzer
    ///
    /// # Arguments
    /// * `config` - Pipeline configuration; the analyzer, model, filmstrip, retry and pricing sections are used
    /// * `client` - Model backend
    /// * `transcript` - Source of transcript slices per chunk
    /// * `clips` - Clip extractor for finalized chapters, if clips are wanted
    ///
    /// # Errors
    /// * `InvalidConfig` - Retry policy or pricing is invalid
    pub fn new(
        config: &PipelineConfig,
        client: Box<dyn ModelClient>,
        transcript: Arc<dyn TranscriptSource>,
        clips: Option<Arc<ClipExtractor>>,
    ) -> Result<Self> {
        config.retry.validate()?;
        config.pricing.validate()?;

        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let style = &config.filmstrip.style;

        let worker = AnalysisWorker {
            client,
            transcript,
            clips: clips.clone(),
            model: config.model.clone(),
            keep_n_chapters: config.analyzer.keep_n_chapters,
            retry: config.retry.clone(),
            grid: GridInfo {
                rows: style.rows,
                cols: style.cols,
                frames: config.filmstrip.frames_per_chunk.min(style.capacity()),
            },
            state: ChapterState::new(),
            conversation: Conversation::new(),
            finalized_sent: 0,
            shared: shared.clone(),
        };

        match config.analyzer.keep_n_chapters {
            Some(n) => info!("Fusion analyzer created, keeping the last {} finalized chapter(s) in context", n),
            None => info!("Fusion analyzer created with unbounded context"),
        }

        Ok(Self {
            config: config.analyzer.clone(),
            model: config.model.clone(),
            pricing: config.pricing.clone(),
            handle: AnalysisHandle {
                sender,
                pending: Arc::new(AtomicUsize::new(0)),
                accepting: Arc::new(AtomicBool::new(false)),
            },
            abort: Arc::new(AtomicBool::new(false)),
            shared,
            clips,
            receiver: Some(receiver),
            worker: Some(worker),
            thread: None,
        })
    }

    /// Start the worker thread
    ///
    /// # Errors
    /// * `InternalError` - The analyzer was already started
    /// * `Io` - The thread cannot be spawned
    pub fn start_analysis(&mut self) -> Result<()> {
        let (Some(worker), Some(receiver)) = (self.worker.take(), self.receiver.take()) else {
            return Err(FusionError::internal_error("analysis was already started"));
        };

        let pending = self.handle.pending.clone();
        let abort = self.abort.clone();
        let thread = thread::Builder::new()
            .name("fusion-analyzer".to_string())
            .spawn(move || worker.run(receiver, pending, abort))?;

        self.thread = Some(thread);
        self.handle.accepting.store(true, Ordering::SeqCst);
        self.set_phase(AnalyzerPhase::Running);
        Ok(())
    }

    /// Handle for producers; it implements [`ChunkSink`]
    pub fn handle(&self) -> AnalysisHandle {
        self.handle.clone()
    }

    /// Queue one chunk for analysis without waiting for it
    ///
    /// # Errors
    /// * `NotRunning` - The analyzer is not accepting work
    pub fn queue_analysis(
        &self,
        chunk_id: u32,
        filmstrip_path: impl Into<PathBuf>,
        start_time: f64,
        end_time: f64,
        shot_change_frames: Vec<usize>,
        audio_features: Option<AudioFeatures>,
    ) -> Result<()> {
        self.handle.submit(ReadyChunk {
            chunk_id,
            filmstrip_path: filmstrip_path.into(),
            start_time,
            end_time,
            shot_change_frames,
            audio_features,
        })
    }

    /// Drain the queue, stop the worker, finalize every chapter and wait for clips
    ///
    /// Timeouts are logged and shutdown carries on.
    #[instrument(skip(self))]
    pub fn stop_analysis(&mut self) {
        if self.phase() == AnalyzerPhase::Stopped {
            return;
        }
        info!("Stopping fusion analyzer");

        self.set_phase(AnalyzerPhase::Draining);
        self.handle.accepting.store(false, Ordering::SeqCst);
        self.drain(Duration::from_secs_f64(self.config.drain_timeout_secs));

        self.abort.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            match join_with_timeout(thread, Duration::from_secs_f64(self.config.worker_join_secs)) {
                Ok(Some(worker)) => self.worker = Some(worker),
                Ok(None) => error!("Analysis worker panicked"),
                Err(_) => warn!("Analysis worker did not stop within {:.0}s", self.config.worker_join_secs),
            }
        }

        self.set_phase(AnalyzerPhase::Finalizing);
        let chapters = self.chapters();
        if let Some(clips) = &self.clips {
            if !chapters.is_empty() {
                info!("Finalizing all {} chapter(s)", chapters.len());
                lock_shared(&self.shared).finalized_chapters = chapters.len();
                clips.submit(chapters);
            }
            let wait = Duration::from_secs_f64(self.config.clip_wait_secs);
            if clips.wait_idle(wait) {
                info!("Clip creation finished: {:?}", clips.stats());
            }
        } else {
            lock_shared(&self.shared).finalized_chapters = chapters.len();
        }

        info!("{}", self.usage_report().render());
        self.set_phase(AnalyzerPhase::Stopped);
    }

    fn drain(&self, timeout: Duration) {
        let started = Instant::now();
        let mut last_log = Instant::now();

        while self.handle.pending() > 0 {
            if started.elapsed() >= timeout {
                warn!(
                    "Drain timed out after {:.0}s with {} chunk(s) pending",
                    timeout.as_secs_f64(),
                    self.handle.pending()
                );
                return;
            }
            if last_log.elapsed() >= DRAIN_LOG_INTERVAL {
                info!("Waiting for {} chunk(s) to finish analysis", self.handle.pending());
                last_log = Instant::now();
            }
            thread::sleep(Duration::from_millis(100));
        }
        debug!("Analysis queue drained in {:.1}s", started.elapsed().as_secs_f64());
    }

    /// One-shot summary of the final chapter structure
    ///
    /// Must be called while the worker is not running (before start or after stop).
    ///
    /// # Errors
    /// * `NotRunning` - The worker thread still owns the model client
    /// * `ModelRequest` - The model call failed after retries
    #[instrument(skip(self))]
    pub fn generate_final_summary(&mut self) -> Result<String> {
        let chapters = self.chapters();
        let Some(worker) = self.worker.as_ref() else {
            return Err(FusionError::NotRunning { component: "model client".to_string() });
        };

        if chapters.is_empty() {
            warn!("No chapters to summarize");
            return Ok("No chapters were produced.".to_string());
        }

        let total = chapters
            .last()
            .and_then(|c| c.topics.last())
            .map(|t| t.end_time)
            .unwrap_or(0.0);

        let prompt = format!(
            "Based on the complete video analysis below, first determine the content type and then \
             write a summary suited to it.\n\n\
             VIDEO ANALYSIS RESULTS:\nDuration: {} ({:.1} seconds)\nChapters: {}\n{}\n\n\
             Start with \"Content Type Identified: <type> (Confidence: High/Medium/Low)\". \
             For presentations cover the speakers, main topics and key takeaways; for films the plot, \
             characters and themes; for tutorials the learning objectives and steps. \
             Keep each section concise.",
            format_time(total),
            total,
            chapters.len(),
            serde_json::to_string_pretty(&chapters)?
        );

        let request = ModelRequest {
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(vec![ContentBlock::text(prompt)])],
            max_tokens: self.model.max_tokens,
            temperature: self.model.summary_temperature,
        };

        let started = Instant::now();
        let reply = worker.retry.run("final summary", |_| worker.client.send(&request))?;
        lock_shared(&self.shared).usage.add(&reply.usage);
        info!("Final summary generated in {:.2}s", started.elapsed().as_secs_f64());
        Ok(reply.text)
    }

    fn set_phase(&self, phase: AnalyzerPhase) {
        debug!("Analyzer phase: {:?}", phase);
        lock_shared(&self.shared).phase = phase;
    }

    pub fn phase(&self) -> AnalyzerPhase {
        lock_shared(&self.shared).phase
    }

    /// Chapters as of the last merged chunk
    pub fn chapters(&self) -> Vec<Chapter> {
        lock_shared(&self.shared).chapters.clone()
    }

    /// Per-chunk records keyed by chunk id
    pub fn results(&self) -> BTreeMap<u32, AnalysisRecord> {
        lock_shared(&self.shared).results.clone()
    }

    pub fn usage_report(&self) -> UsageReport {
        lock_shared(&self.shared).usage.report(&self.pricing)
    }

    pub fn status(&self) -> AnalyzerStatus {
        let shared = lock_shared(&self.shared);
        AnalyzerStatus {
            phase: shared.phase,
            pending: self.handle.pending(),
            chunks_analyzed: shared.results.len(),
            failed_chunks: shared.failed_chunks.clone(),
            chapters: shared.chapters.len(),
            topics: shared.chapters.iter().map(|c| c.topics.len()).sum(),
            finalized_chapters: shared.finalized_chapters,
            history_len: shared.history_len,
        }
    }
}

impl std::fmt::Debug for FusionAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionAnalyzer")
            .field("status", &self.status())
            .field("keep_n_chapters", &self.config.keep_n_chapters)
            .finish()
    }
}

impl Drop for FusionAnalyzer {
    fn drop(&mut self) {
        self.handle.accepting.store(false, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clips::ClipSettings;
    use crate::model::testing::ScriptedClient;
    use crate::model::TokenUsage;
    use crate::transcript::{Sentence, SharedSentenceBuffer};
    use std::path::Path;

    fn usage(input: u64) -> TokenUsage {
        TokenUsage { input_tokens: input, output_tokens: 50, ..TokenUsage::default() }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry = RetryPolicy::none();
        config.analyzer.drain_timeout_secs = 10.0;
        config.analyzer.clip_wait_secs = 5.0;
        config
    }

    fn filmstrip(dir: &Path, chunk_id: u32) -> PathBuf {
        let path = dir.join(format!("filmstrip_{:04}_4x5.jpg", chunk_id));
        std::fs::write(&path, b"\xff\xd8\xff\xd9").unwrap();
        path
    }

    fn wait_for(analyzer: &FusionAnalyzer, analysed: usize) {
        let started = Instant::now();
        while analyzer.status().chunks_analyzed + analyzer.status().failed_chunks.len() < analysed {
            assert!(started.elapsed() < Duration::from_secs(10), "worker did not finish");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn queue(analyzer: &FusionAnalyzer, dir: &Path, chunk_id: u32) {
        let start = chunk_id as f64 * 20.0;
        analyzer
            .queue_analysis(chunk_id, filmstrip(dir, chunk_id), start, start + 20.0, vec![], None)
            .unwrap();
    }

    #[test]
    fn test_describe_shot_changes() {
        assert_eq!(describe_shot_changes(&[], 0.0, 20.0, 20, 5), "");
        assert_eq!(
            describe_shot_changes(&[5, 12], 40.0, 60.0, 20, 5),
            "\n\nSHOT CHANGES DETECTED:\n2 shot changes at: 45.50s [grid 2x1, frame 5], 52.50s [grid 3x3, frame 12]\n\n"
        );
    }

    #[test]
    fn test_three_chunk_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new()
            .reply(
                r#"```json
{"actions": [
  {"type": "new_chapter", "id": "h1", "chapter": "Opening"},
  {"type": "new_topic", "id": "t1", "chapter_id": "h1", "topic_summary": "Welcome", "start_time": 0, "end_time": 20, "chunks": [0]}
]}
```"#,
                usage(1000),
            )
            .reply(r#"{"actions": [{"type": "update_topic", "id": "t1", "end_time": 40, "chunks": [1]}]}"#, usage(1200))
            .reply(
                r#"{"actions": [
  {"type": "new_chapter", "id": "h2", "chapter": "Demo"},
  {"type": "new_topic", "id": "t2", "chapter_id": "h2", "topic_summary": "Live demo", "start_time": 40, "end_time": 60, "chunks": [2]}
]}"#,
                usage(1400),
            );

        let clips = Arc::new(
            ClipExtractor::start(ClipSettings {
                output_dir: dir.path().to_path_buf(),
                chapter_timeout: Duration::from_secs(5),
                topic_timeout: Duration::from_secs(5),
            })
            .unwrap(),
        );

        let transcript = SharedSentenceBuffer::new();
        transcript.push(Sentence::new("Welcome everyone.", 1.2, 3.4));

        let mut analyzer =
            FusionAnalyzer::new(&test_config(), Box::new(client.clone()), Arc::new(transcript), Some(clips.clone())).unwrap();
        analyzer.start_analysis().unwrap();

        for id in 0..2 {
            queue(&analyzer, dir.path(), id);
        }
        wait_for(&analyzer, 2);
        assert_eq!(analyzer.status().finalized_chapters, 0);

        queue(&analyzer, dir.path(), 2);
        wait_for(&analyzer, 3);

        let chapters = analyzer.chapters();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].topics.len(), 1);
        assert_eq!(chapters[0].topics[0].id, "t1");
        assert_eq!((chapters[0].topics[0].start_time, chapters[0].topics[0].end_time), (0.0, 40.0));
        assert_eq!(chapters[0].topics[0].chunks, vec![0, 1]);
        assert_eq!(analyzer.status().finalized_chapters, 1);

        let results = analyzer.results();
        assert_eq!(results[&0].time_range, "0.0s-20.0s");
        assert_eq!(results[&0].transcript, "Welcome everyone.");
        assert_eq!(results[&0].transcript_sentences.len(), 1);
        assert_eq!(results[&0].chapters.len(), 1);

        let requests = client.recorded();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].messages.len(), 5);
        let first = &requests[0].messages[0];
        assert!(first.text().contains("Chunk identifier: chunk_0000. Time range: 0.0s - 20.0s."));
        assert!(first.text().contains("\"sentence_start_time_in_sec\": 1.2"));
        assert!(matches!(first.content[1], ContentBlock::Image { .. }));
        // history keeps text only
        assert_eq!(requests[2].messages[0].content.len(), 1);

        analyzer.stop_analysis();
        assert_eq!(analyzer.phase(), AnalyzerPhase::Stopped);
        assert_eq!(analyzer.status().finalized_chapters, 2);
        assert_eq!(analyzer.usage_report().totals.input_tokens, 3600);
        clips.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_parse_failure_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new()
            .reply(
                r#"{"actions": [{"type": "new_chapter", "id": "h1", "chapter": "A"},
                  {"type": "new_topic", "id": "t1", "chapter_id": "h1", "topic_summary": "a", "start_time": 0, "end_time": 20, "chunks": [0]}]}"#,
                usage(10),
            )
            .reply("I could not analyse this chunk.", usage(10))
            .reply(
                r#"{"actions": [{"type": "new_topic", "id": "t2", "chapter_id": "h1", "topic_summary": "b", "start_time": 20, "end_time": 60, "chunks": [2]},
                  {"type": "update_topic", "id": "t1", "start_time": "soon"}]}"#,
                usage(10),
            )
            .reply(r#"{"actions": [{"type": "update_topic", "id": "t1", "end_time": 60}]}"#, usage(10));

        let mut analyzer =
            FusionAnalyzer::new(&test_config(), Box::new(client), Arc::new(SharedSentenceBuffer::new()), None).unwrap();
        analyzer.start_analysis().unwrap();
        for id in 0..4 {
            queue(&analyzer, dir.path(), id);
        }
        analyzer.stop_analysis();

        let status = analyzer.status();
        assert_eq!(status.failed_chunks, vec![1, 2]);
        assert_eq!(status.chunks_analyzed, 2);
        assert_eq!(status.history_len, 2);
        assert_eq!(status.topics, 1);

        let chapters = analyzer.chapters();
        assert_eq!(chapters[0].topics[0].end_time, 60.0);
        // failed chunks still count toward usage
        assert_eq!(analyzer.usage_report().chunks_analyzed, 4);
    }

    #[test]
    fn test_context_window_keeps_recent_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let chapter_reply = |n: u32| {
            format!(
                r#"{{"actions": [{{"type": "new_chapter", "id": "h{n}", "chapter": "Part {n}"}},
                  {{"type": "new_topic", "id": "t{n}", "chapter_id": "h{n}", "topic_summary": "s", "start_time": {s}, "end_time": {e}, "chunks": [{c}]}}]}}"#,
                n = n + 1,
                s = n * 20,
                e = n * 20 + 20,
                c = n
            )
        };

        let mut client = ScriptedClient::new();
        for n in 0..3 {
            client = client.reply(&chapter_reply(n), usage(10));
        }
        client = client.reply(r#"{"actions": []}"#, usage(10));

        let mut config = test_config();
        config.analyzer.keep_n_chapters = Some(1);
        let mut analyzer =
            FusionAnalyzer::new(&config, Box::new(client.clone()), Arc::new(SharedSentenceBuffer::new()), None).unwrap();
        analyzer.start_analysis().unwrap();
        for id in 0..4 {
            queue(&analyzer, dir.path(), id);
        }
        analyzer.stop_analysis();

        let requests = client.recorded();
        assert_eq!(requests.len(), 4);
        // chunk 0 dropped once a third chapter exists
        let history = &requests[3].messages;
        assert_eq!(history.len(), 5);
        assert!(history[0].text().contains("chunk_0001"));
        assert!(history[2].text().contains("chunk_0002"));
        assert_eq!(analyzer.status().history_len, 3);
    }

    #[test]
    fn test_retryable_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new()
            .fail(FusionError::ModelRequest { message: "HTTP 429".to_string(), retryable: true })
            .reply(r#"{"actions": [{"type": "new_chapter", "chapter": "Only"}]}"#, usage(10));

        let mut config = test_config();
        config.retry = RetryPolicy::fixed(2, Duration::from_millis(1));
        let mut analyzer =
            FusionAnalyzer::new(&config, Box::new(client), Arc::new(SharedSentenceBuffer::new()), None).unwrap();
        analyzer.start_analysis().unwrap();
        queue(&analyzer, dir.path(), 0);
        analyzer.stop_analysis();

        assert_eq!(analyzer.status().chunks_analyzed, 1);
        assert_eq!(analyzer.chapters()[0].id, "h1");
    }

    #[test]
    fn test_lifecycle_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new()
            .reply(
                r#"{"actions": [{"type": "new_chapter", "id": "h1", "chapter": "Keynote"},
                  {"type": "new_topic", "id": "t1", "chapter_id": "h1", "topic_summary": "Launch", "start_time": 0, "end_time": 75.5, "chunks": [0]}]}"#,
                usage(10),
            )
            .reply("Content Type Identified: Keynote (Confidence: High)", usage(7));

        let mut analyzer =
            FusionAnalyzer::new(&test_config(), Box::new(client.clone()), Arc::new(SharedSentenceBuffer::new()), None).unwrap();
        assert_eq!(analyzer.phase(), AnalyzerPhase::Idle);
        assert!(analyzer.queue_analysis(0, dir.path().join("x.jpg"), 0.0, 20.0, vec![], None).is_err());

        analyzer.start_analysis().unwrap();
        assert!(analyzer.start_analysis().is_err());
        assert!(matches!(analyzer.generate_final_summary(), Err(FusionError::NotRunning { .. })));

        queue(&analyzer, dir.path(), 0);
        analyzer.stop_analysis();
        assert_eq!(analyzer.phase(), AnalyzerPhase::Stopped);
        assert!(matches!(
            analyzer.queue_analysis(1, dir.path().join("x.jpg"), 20.0, 40.0, vec![], None),
            Err(FusionError::NotRunning { .. })
        ));

        let summary = analyzer.generate_final_summary().unwrap();
        assert!(summary.starts_with("Content Type Identified"));

        let request = &client.recorded()[1];
        assert_eq!(request.temperature, 0.3);
        assert!(request.messages[0].text().contains("Duration: 01:15 (75.5 seconds)"));
        assert_eq!(analyzer.usage_report().totals.input_tokens, 17);
        assert_eq!(analyzer.usage_report().chunks_analyzed, 1);
    }

    #[test]
    fn test_missing_filmstrip_is_a_chunk_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new();
        let mut analyzer =
            FusionAnalyzer::new(&test_config(), Box::new(client.clone()), Arc::new(SharedSentenceBuffer::new()), None).unwrap();
        analyzer.start_analysis().unwrap();
        analyzer
            .queue_analysis(0, dir.path().join("missing.jpg"), 0.0, 20.0, vec![], None)
            .unwrap();
        analyzer.stop_analysis();

        assert_eq!(analyzer.status().failed_chunks, vec![0]);
        assert!(client.recorded().is_empty());
    }
}
