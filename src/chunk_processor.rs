//! Live stream segmentation and chunk discovery
//!
//! [`ChunkProcessor`] runs the ffmpeg segmenter that turns the UDP input into
//! `chunk_<NNNN>_<d>s.mp4` files. [`ChunkMonitor`] polls the chunk directory,
//! waits until each file is complete, renders its filmstrip and hands it to a
//! [`ChunkSink`] (normally the fusion analyzer).

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use crate::audio_features::{AudioFeatureSource, AudioFeatures};
use crate::common::{join_with_timeout, FusionError, Result};
use crate::config::{ChunkConfig, FilmstripConfig};
use crate::ffmpeg::{probe_duration, FfmpegCommand, ManagedProcess};
use crate::filmstrip::FilmstripProcessor;
use crate::retry::RetryPolicy;

/// Failed filmstrip attempts before a chunk is given up on
const MAX_CHUNK_FAILURES: u32 = 3;

/// Grace period for the segmenter to close its current file
const SEGMENTER_STOP_GRACE: Duration = Duration::from_secs(5);

fn chunk_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"chunk_(\d+)_").ok()).as_ref()
}

/// Sequence number from a chunk file name such as `chunk_0007_20s.mp4`
pub fn parse_chunk_id(file_name: &str) -> Option<u32> {
    chunk_id_pattern()?
        .captures(file_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn chunk_file_name(chunk_id: u32, chunk_duration: u32) -> String {
    format!("chunk_{:04}_{}s.mp4", chunk_id, chunk_duration)
}

pub fn filmstrip_file_name(chunk_id: u32, rows: u32, cols: u32) -> String {
    format!("filmstrip_{:04}_{}x{}.jpg", chunk_id, rows, cols)
}

/// Whether a probed duration means the segment file is complete
///
/// Segment flush timing is not exact, so a regular chunk is accepted within
/// `tolerance` seconds of the expected length. A final chunk at shutdown is
/// accepted with any duration of at least one second.
pub fn duration_within_tolerance(duration: f64, expected: f64, tolerance: f64, is_final: bool) -> bool {
    if is_final {
        duration >= 1.0
    } else {
        (duration - expected).abs() <= tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Ready,
    Processed,
}

/// One segment file on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: u32,
    pub path: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    pub state: ChunkState,
}

/// Segment files in `dir` for the given chunk duration, ordered by id
pub fn discover_chunks(dir: &Path, chunk_duration: u32, processed: &BTreeSet<u32>) -> Result<Vec<Chunk>> {
    let suffix = format!("_{}s.mp4", chunk_duration);
    let mut chunks = Vec::new();

    if !dir.exists() {
        return Ok(chunks);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("chunk_") || !name.ends_with(&suffix) {
            continue;
        }
        let Some(chunk_id) = parse_chunk_id(name) else {
            continue;
        };

        let start_time = f64::from(chunk_id) * f64::from(chunk_duration);
        chunks.push(Chunk {
            chunk_id,
            path,
            start_time,
            end_time: start_time + f64::from(chunk_duration),
            state: if processed.contains(&chunk_id) { ChunkState::Processed } else { ChunkState::Pending },
        });
    }

    chunks.sort_by_key(|c| c.chunk_id);
    Ok(chunks)
}

/// A chunk whose filmstrip is ready for analysis
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyChunk {
    pub chunk_id: u32,
    pub filmstrip_path: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    pub shot_change_frames: Vec<usize>,
    pub audio_features: Option<AudioFeatures>,
}

/// Receiver of ready chunks
pub trait ChunkSink: Send {
    fn submit(&self, chunk: ReadyChunk) -> Result<()>;
}

impl ChunkSink for std::sync::mpsc::Sender<ReadyChunk> {
    fn submit(&self, chunk: ReadyChunk) -> Result<()> {
        self.send(chunk)
            .map_err(|_| FusionError::NotRunning { component: "chunk receiver".to_string() })
    }
}

/// Stream window of a complete chunk
///
/// Every chunk covers its nominal `[start, start + chunk_duration]` slot so
/// consecutive windows meet exactly. Only the last chunk of the final sweep,
/// which the segmenter may have cut short, ends at its probed length.
pub fn chunk_end_time(chunk: &Chunk, probed_duration: f64, is_last_final: bool) -> f64 {
    if is_last_final {
        (chunk.start_time + probed_duration).min(chunk.end_time)
    } else {
        chunk.end_time
    }
}

/// Result of one hand-off attempt for a chunk
#[derive(Debug)]
enum Attempt {
    Handed,
    NotReady,
    Failed(FusionError),
}

#[derive(Debug, Default, PartialEq)]
struct ScanOutcome {
    handed_off: Vec<u32>,
    given_up: Vec<u32>,
}

/// Try pending chunks in id order, stopping at the first one that cannot go
///
/// A failing chunk blocks its successors until it succeeds or reaches
/// [`MAX_CHUNK_FAILURES`]; then it is given up and the pass moves on.
fn hand_off_in_order<F>(chunks: &[Chunk], failures: &mut HashMap<u32, u32>, mut attempt: F) -> ScanOutcome
where
    F: FnMut(&Chunk) -> Attempt,
{
    let mut outcome = ScanOutcome::default();

    for chunk in chunks {
        match attempt(chunk) {
            Attempt::Handed => {
                failures.remove(&chunk.chunk_id);
                outcome.handed_off.push(chunk.chunk_id);
            }
            Attempt::NotReady => break,
            Attempt::Failed(e) => {
                let count = failures.entry(chunk.chunk_id).or_insert(0);
                *count += 1;
                if *count < MAX_CHUNK_FAILURES {
                    warn!(
                        "Chunk {} failed (attempt {} of {}), holding later chunks: {}",
                        chunk.chunk_id, count, MAX_CHUNK_FAILURES, e
                    );
                    break;
                }
                error!("Giving up on chunk {} after {} attempts: {}", chunk.chunk_id, count, e);
                failures.remove(&chunk.chunk_id);
                outcome.given_up.push(chunk.chunk_id);
            }
        }
    }
    outcome
}

/// Runs the ffmpeg segmenter for the live UDP input
pub struct ChunkProcessor {
    udp_port: u16,
    chunk_duration: u32,
    chunks_dir: PathBuf,
    running: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChunkProcessor {
    pub fn new(udp_port: u16, chunk_duration: u32, output_dir: impl AsRef<Path>) -> Self {
        Self {
            udp_port,
            chunk_duration,
            chunks_dir: output_dir.as_ref().join("chunks"),
            running: Arc::new(AtomicBool::new(false)),
            supervisor: None,
        }
    }

    pub fn chunks_dir(&self) -> &Path {
        &self.chunks_dir
    }

    /// Segmenter arguments (without the program name)
    pub fn segmenter_args(&self) -> Vec<String> {
        let d = self.chunk_duration;
        let pattern = self.chunks_dir.join(format!("chunk_%04d_{}s.mp4", d));
        let movflags = "+faststart+frag_keyframe+empty_moov";

        FfmpegCommand::new(format!("udp://127.0.0.1:{}", self.udp_port), pattern.to_string_lossy())
            .overwrite(false)
            .log_level("error")
            .input_arg("-fflags")
            .input_arg("+flush_packets")
            .input_arg("-flush_packets")
            .input_arg("1")
            .input_arg("-max_delay")
            .input_arg("0")
            .video_codec("libx264")
            .preset("ultrafast")
            .output_args(["-tune", "zerolatency"])
            .audio_codec("aac")
            .output_args(["-ac", "2", "-ar", "48000"])
            .output_arg("-force_key_frames")
            .output_arg(format!("expr:gte(t,n_forced*{})", d))
            .output_args(["-f", "segment", "-segment_time"])
            .output_arg(d.to_string())
            .output_args([
                "-segment_format", "mp4",
                "-segment_start_number", "0",
                "-reset_timestamps", "1",
                "-avoid_negative_ts", "make_zero",
                "-movflags", movflags,
            ])
            .output_arg("-segment_format_options")
            .output_arg(format!("movflags={}", movflags))
            .build_args()
    }

    /// Launch the segmenter under a supervisor thread
    #[instrument(skip(self), fields(port = self.udp_port))]
    pub fn start_processing(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("Chunk processor already running");
            return Ok(());
        }
        std::fs::create_dir_all(&self.chunks_dir)?;

        let mut process = ManagedProcess::spawn("Segmenter", "ffmpeg", &self.segmenter_args())?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("chunk-segmenter".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match process.try_status() {
                        Ok(Some(status)) => {
                            warn!("Segmenter exited: {}", status);
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Cannot poll segmenter: {}", e),
                    }
                    thread::sleep(Duration::from_millis(500));
                }
                if let Err(e) = process.stop(SEGMENTER_STOP_GRACE) {
                    warn!("Error stopping segmenter: {}", e);
                }
            })?;

        self.supervisor = Some(handle);
        info!("Chunk processing started: {}s chunks into {}", self.chunk_duration, self.chunks_dir.display());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the segmenter and join its supervisor
    pub fn stop_processing(&mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.take() {
            match join_with_timeout(handle, timeout) {
                Ok(_) => info!("Chunk processing stopped"),
                Err(_) => warn!("Segmenter supervisor still running after {:.0}s", timeout.as_secs_f64()),
            }
        }
    }
}

impl std::fmt::Debug for ChunkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkProcessor")
            .field("udp_port", &self.udp_port)
            .field("chunk_duration", &self.chunk_duration)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ChunkProcessor {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.stop_processing(SEGMENTER_STOP_GRACE * 2);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMonitorStatus {
    pub is_running: bool,
    pub chunk_count: usize,
    pub processed_chunks: usize,
    /// Chunks given up after repeated failures
    pub failed_chunks: Vec<u32>,
    pub thread_alive: bool,
}

/// State owned by the monitor thread, handed back on stop for the final sweep
struct MonitorWorker {
    chunks_dir: PathBuf,
    filmstrips_dir: PathBuf,
    chunk: ChunkConfig,
    filmstrip: FilmstripConfig,
    processor: FilmstripProcessor,
    sink: Box<dyn ChunkSink>,
    audio: Option<Box<dyn AudioFeatureSource>>,
    probe_retry: RetryPolicy,
    processed: Arc<Mutex<BTreeSet<u32>>>,
    chunk_count: Arc<AtomicUsize>,
    failed: Arc<Mutex<BTreeSet<u32>>>,
    failures: HashMap<u32, u32>,
}

impl MonitorWorker {
    fn processed_ids(&self) -> BTreeSet<u32> {
        match self.processed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn mark_processed(&self, chunk_id: u32) {
        match self.processed.lock() {
            Ok(mut guard) => guard.insert(chunk_id),
            Err(poisoned) => poisoned.into_inner().insert(chunk_id),
        };
        self.chunk_count.fetch_max(chunk_id as usize + 1, Ordering::SeqCst);
    }

    fn give_up(&self, chunk_id: u32) {
        match self.failed.lock() {
            Ok(mut guard) => guard.insert(chunk_id),
            Err(poisoned) => poisoned.into_inner().insert(chunk_id),
        };
        self.mark_processed(chunk_id);
    }

    /// Check unprocessed chunks in id order; returns how many were handed off
    ///
    /// The pass stops at the first chunk that is not ready or fails, so the
    /// sink always receives ids in increasing order.
    fn scan(&mut self, is_final: bool) -> usize {
        let processed = self.processed_ids();
        let chunks = match discover_chunks(&self.chunks_dir, self.chunk.chunk_duration, &processed) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Cannot list chunk directory {}: {}", self.chunks_dir.display(), e);
                return 0;
            }
        };

        let newest = chunks.last().map(|c| c.chunk_id);
        let pending: Vec<Chunk> = chunks.into_iter().filter(|c| c.state == ChunkState::Pending).collect();

        let mut failures = std::mem::take(&mut self.failures);
        let outcome = hand_off_in_order(&pending, &mut failures, |chunk| {
            let has_successor = newest.is_some_and(|id| id > chunk.chunk_id);
            self.attempt(chunk, is_final, has_successor)
        });
        self.failures = failures;

        for &chunk_id in &outcome.given_up {
            self.give_up(chunk_id);
        }
        outcome.handed_off.len()
    }

    /// Probe one chunk and, when it is complete, render and submit it
    ///
    /// A chunk with a later segment on disk has been closed by the segmenter,
    /// so it gets the relaxed readiness check and anything short of ready
    /// counts as a failure instead of "not yet".
    fn attempt(&mut self, chunk: &Chunk, is_final: bool, has_successor: bool) -> Attempt {
        match self.ready_duration(&chunk.path, is_final || has_successor) {
            Ok(Some(duration)) => {
                let end_time = chunk_end_time(chunk, duration, is_final && !has_successor);
                match self.process_chunk(chunk, duration, end_time) {
                    Ok(()) => Attempt::Handed,
                    Err(e) => Attempt::Failed(e),
                }
            }
            Ok(None) if has_successor => Attempt::Failed(FusionError::internal_error(format!(
                "chunk {} is incomplete although later segments exist",
                chunk.chunk_id
            ))),
            Ok(None) => Attempt::NotReady,
            Err(e) if has_successor => Attempt::Failed(e),
            Err(e) => {
                debug!("Chunk {} not ready yet: {}", chunk.chunk_id, e);
                Attempt::NotReady
            }
        }
    }

    /// Probed duration when the file is complete, `None` while it is still growing
    fn ready_duration(&self, path: &Path, is_final: bool) -> Result<Option<f64>> {
        let size = std::fs::metadata(path)?.len();
        if size < self.chunk.min_chunk_bytes {
            trace!("{} too small ({} bytes)", path.display(), size);
            return Ok(None);
        }

        let timeout = self.chunk.probe_timeout();
        let duration = self.probe_retry.run("chunk probe", |_| probe_duration(path, timeout))?;
        let expected = f64::from(self.chunk.chunk_duration);

        if duration_within_tolerance(duration, expected, self.chunk.readiness_tolerance_secs, is_final) {
            Ok(Some(duration))
        } else {
            trace!("{} duration {:.2}s, expected {:.0}s", path.display(), duration, expected);
            Ok(None)
        }
    }

    #[instrument(skip(self, chunk), fields(chunk_id = chunk.chunk_id))]
    fn process_chunk(&mut self, chunk: &Chunk, duration: f64, end_time: f64) -> Result<()> {
        info!("Chunk {} ready ({:.2}s)", chunk.chunk_id, duration);

        let style = self.processor.style();
        let filmstrip_path = self
            .filmstrips_dir
            .join(filmstrip_file_name(chunk.chunk_id, style.rows, style.cols));

        let path = chunk.path.to_string_lossy();
        let frames = self.processor.extract_frames(
            &path,
            chunk.start_time,
            self.filmstrip.frames_per_chunk,
            self.filmstrip.frame_interval_secs,
        )?;
        let shot_change_frames =
            self.processor
                .create_filmstrip(&frames, &filmstrip_path, self.filmstrip.detect_shot_changes)?;

        let audio_features = self.audio.as_ref().and_then(|source| match source.analyze(&chunk.path) {
            Ok(features) => Some(features),
            Err(e) => {
                warn!("Audio analysis failed for chunk {}: {}", chunk.chunk_id, e);
                None
            }
        });

        self.sink.submit(ReadyChunk {
            chunk_id: chunk.chunk_id,
            filmstrip_path,
            start_time: chunk.start_time,
            end_time,
            shot_change_frames,
            audio_features,
        })?;

        self.mark_processed(chunk.chunk_id);
        Ok(())
    }
}

/// Polls the chunk directory and turns complete chunks into filmstrips
pub struct ChunkMonitor {
    running: Arc<AtomicBool>,
    processed: Arc<Mutex<BTreeSet<u32>>>,
    failed: Arc<Mutex<BTreeSet<u32>>>,
    chunk_count: Arc<AtomicUsize>,
    stop_timeout: Duration,
    worker: Option<MonitorWorker>,
    handle: Option<JoinHandle<MonitorWorker>>,
}

impl ChunkMonitor {
    /// # Arguments
    /// * `output_dir` - Root holding `chunks/` and `filmstrips/`
    /// * `processor` - Filmstrip renderer (its detector keeps state across chunks)
    /// * `sink` - Where ready chunks are sent
    pub fn new(
        output_dir: impl AsRef<Path>,
        chunk: ChunkConfig,
        filmstrip: FilmstripConfig,
        processor: FilmstripProcessor,
        sink: Box<dyn ChunkSink>,
        probe_retry: RetryPolicy,
    ) -> Self {
        let output_dir = output_dir.as_ref();
        let processed = Arc::new(Mutex::new(BTreeSet::new()));
        let failed = Arc::new(Mutex::new(BTreeSet::new()));
        let chunk_count = Arc::new(AtomicUsize::new(0));
        let stop_timeout = chunk.stop_timeout();

        let worker = MonitorWorker {
            chunks_dir: output_dir.join("chunks"),
            filmstrips_dir: output_dir.join("filmstrips"),
            chunk,
            filmstrip,
            processor,
            sink,
            audio: None,
            probe_retry,
            processed: processed.clone(),
            chunk_count: chunk_count.clone(),
            failed: failed.clone(),
            failures: HashMap::new(),
        };

        Self {
            running: Arc::new(AtomicBool::new(false)),
            processed,
            failed,
            chunk_count,
            stop_timeout,
            worker: Some(worker),
            handle: None,
        }
    }

    /// Attach an acoustic feature extractor run on every ready chunk
    pub fn with_audio_features(mut self, source: Box<dyn AudioFeatureSource>) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.audio = Some(source);
        }
        self
    }

    /// Counter of chunks seen so far (highest id + 1)
    pub fn chunk_counter(&self) -> Arc<AtomicUsize> {
        self.chunk_count.clone()
    }

    /// Start the polling thread
    pub fn start(&mut self) -> Result<()> {
        let Some(mut worker) = self.worker.take() else {
            warn!("Chunk monitor already started");
            return Ok(());
        };
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("chunk-monitor".to_string())
            .spawn(move || {
                let interval = worker.chunk.check_interval();
                let heartbeat = worker.chunk.heartbeat();
                let mut last_heartbeat = Instant::now();
                info!("Chunk monitor started on {}", worker.chunks_dir.display());

                while running.load(Ordering::SeqCst) {
                    worker.scan(false);

                    if last_heartbeat.elapsed() >= heartbeat {
                        debug!(
                            "Monitor heartbeat: {} chunks, {} processed",
                            worker.chunk_count.load(Ordering::SeqCst),
                            worker.processed_ids().len()
                        );
                        last_heartbeat = Instant::now();
                    }
                    thread::sleep(interval);
                }
                worker
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop polling, then sweep once more accepting short final chunks
    ///
    /// # Returns
    /// Number of chunks handed off by the final sweep
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> usize {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            match join_with_timeout(handle, self.stop_timeout) {
                Ok(Some(worker)) => self.worker = Some(worker),
                Ok(None) => error!("Chunk monitor thread panicked"),
                Err(_) => {
                    warn!("Chunk monitor thread did not stop within {:.0}s", self.stop_timeout.as_secs_f64());
                    return 0;
                }
            }
        }

        let swept = self.worker.as_mut().map(|w| w.scan(true)).unwrap_or(0);
        info!("Chunk monitor stopped ({} chunks in final sweep)", swept);
        swept
    }

    /// Run one polling pass on the calling thread
    ///
    /// Only available while the monitor thread is not running.
    pub fn poll_once(&mut self, is_final: bool) -> Result<usize> {
        match self.worker.as_mut() {
            Some(worker) => Ok(worker.scan(is_final)),
            None => Err(FusionError::internal_error("chunk monitor thread owns the worker")),
        }
    }

    pub fn status(&self) -> ChunkMonitorStatus {
        let processed_chunks = match self.processed.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        let failed_chunks = match self.failed.lock() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        };
        ChunkMonitorStatus {
            is_running: self.running.load(Ordering::SeqCst),
            chunk_count: self.chunk_count.load(Ordering::SeqCst),
            processed_chunks,
            failed_chunks,
            thread_alive: self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false),
        }
    }
}

impl std::fmt::Debug for ChunkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkMonitor")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_readiness_tolerance() {
        assert!(duration_within_tolerance(19.4, 20.0, 1.0, false));
        assert!(duration_within_tolerance(21.0, 20.0, 1.0, false));
        assert!(!duration_within_tolerance(18.5, 20.0, 1.0, false));
        assert!(!duration_within_tolerance(4.0, 20.0, 1.0, false));

        // Final chunk at shutdown
        assert!(duration_within_tolerance(4.0, 20.0, 1.0, true));
        assert!(!duration_within_tolerance(0.6, 20.0, 1.0, true));
    }

    #[test]
    fn test_chunk_names() {
        assert_eq!(chunk_file_name(7, 20), "chunk_0007_20s.mp4");
        assert_eq!(filmstrip_file_name(12, 4, 5), "filmstrip_0012_4x5.jpg");
        assert_eq!(parse_chunk_id("chunk_0007_20s.mp4"), Some(7));
        assert_eq!(parse_chunk_id("chunk_12345_20s.mp4"), Some(12345));
        assert_eq!(parse_chunk_id("filmstrip_0001_4x5.jpg"), None);
    }

    #[test]
    fn test_discover_chunks() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["chunk_0002_20s.mp4", "chunk_0000_20s.mp4", "chunk_0001_10s.mp4", "notes.txt", "chunk_0001_20s.mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let processed = BTreeSet::from([1]);
        let chunks = discover_chunks(dir.path(), 20, &processed).unwrap();
        let ids: Vec<u32> = chunks.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(chunks[1].state, ChunkState::Processed);
        assert_eq!(chunks[2].state, ChunkState::Pending);
        assert_eq!((chunks[2].start_time, chunks[2].end_time), (40.0, 60.0));

        assert!(discover_chunks(&dir.path().join("missing"), 20, &processed).unwrap().is_empty());
    }

    #[test]
    fn test_segmenter_args() {
        let processor = ChunkProcessor::new(1234, 20, "out");
        let args = processor.segmenter_args();
        let joined = args.join(" ");

        assert!(joined.starts_with("-v error -fflags +flush_packets -flush_packets 1 -max_delay 0 -i udp://127.0.0.1:1234"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -tune zerolatency -c:a aac -ac 2 -ar 48000"));
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*20)"));
        assert!(joined.contains("-f segment -segment_time 20 -segment_format mp4 -segment_start_number 0"));
        assert!(joined.contains("-segment_format_options movflags=+faststart+frag_keyframe+empty_moov"));
        assert!(!args.contains(&"-y".to_string()));
        assert_eq!(args.last().unwrap(), "out/chunks/chunk_%04d_20s.mp4");
    }

    #[test]
    fn test_sender_sink() {
        let (tx, rx) = mpsc::channel();
        let chunk = ReadyChunk {
            chunk_id: 3,
            filmstrip_path: PathBuf::from("f.jpg"),
            start_time: 60.0,
            end_time: 80.0,
            shot_change_frames: vec![4],
            audio_features: None,
        };
        tx.submit(chunk.clone()).unwrap();
        assert_eq!(rx.recv().unwrap(), chunk);

        drop(rx);
        assert!(matches!(tx.submit(chunk), Err(FusionError::NotRunning { .. })));
    }

    fn pending_chunks(ids: &[u32]) -> Vec<Chunk> {
        ids.iter()
            .map(|&id| Chunk {
                chunk_id: id,
                path: PathBuf::from(chunk_file_name(id, 20)),
                start_time: f64::from(id) * 20.0,
                end_time: f64::from(id + 1) * 20.0,
                state: ChunkState::Pending,
            })
            .collect()
    }

    #[test]
    fn test_failed_chunk_holds_successors() {
        let mut failures = HashMap::new();
        let mut flaky = BTreeSet::from([1]);
        let mut submitted = Vec::new();

        let mut attempt = |chunk: &Chunk| {
            if flaky.remove(&chunk.chunk_id) {
                return Attempt::Failed(FusionError::frame_error(0, "decode failed"));
            }
            submitted.push(chunk.chunk_id);
            Attempt::Handed
        };

        let first = hand_off_in_order(&pending_chunks(&[0, 1, 2]), &mut failures, &mut attempt);
        assert_eq!(first.handed_off, vec![0]);
        assert!(first.given_up.is_empty());
        assert_eq!(failures.get(&1), Some(&1));

        let second = hand_off_in_order(&pending_chunks(&[1, 2]), &mut failures, &mut attempt);
        assert_eq!(second.handed_off, vec![1, 2]);
        assert!(failures.is_empty());

        assert_eq!(submitted, vec![0, 1, 2]);
    }

    #[test]
    fn test_not_ready_chunk_stops_the_pass() {
        let mut failures = HashMap::new();
        let outcome = hand_off_in_order(&pending_chunks(&[3, 4]), &mut failures, |chunk| {
            if chunk.chunk_id == 3 {
                Attempt::NotReady
            } else {
                Attempt::Handed
            }
        });
        assert_eq!(outcome, ScanOutcome::default());
        assert!(failures.is_empty());
    }

    #[test]
    fn test_chunk_given_up_in_order() {
        let mut failures = HashMap::new();
        let mut attempt = |chunk: &Chunk| {
            if chunk.chunk_id == 1 {
                Attempt::Failed(FusionError::frame_error(0, "corrupt segment"))
            } else {
                Attempt::Handed
            }
        };

        for _ in 1..MAX_CHUNK_FAILURES {
            let outcome = hand_off_in_order(&pending_chunks(&[1, 2, 3]), &mut failures, &mut attempt);
            assert!(outcome.handed_off.is_empty());
            assert!(outcome.given_up.is_empty());
        }

        let outcome = hand_off_in_order(&pending_chunks(&[1, 2, 3]), &mut failures, &mut attempt);
        assert_eq!(outcome.given_up, vec![1]);
        assert_eq!(outcome.handed_off, vec![2, 3]);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_chunk_window_is_nominal() {
        let chunk = &pending_chunks(&[1])[0];

        // Within readiness tolerance, the window still meets the next chunk
        assert_eq!((chunk.start_time, chunk_end_time(chunk, 19.4, false)), (20.0, 40.0));
        assert_eq!(chunk_end_time(chunk, 20.6, false), 40.0);

        // Short last chunk at shutdown keeps its probed length
        assert_eq!(chunk_end_time(chunk, 7.5, true), 27.5);
        assert_eq!(chunk_end_time(chunk, 20.4, true), 40.0);
    }

    #[test]
    fn test_monitor_skips_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = dir.path().join("chunks");
        std::fs::create_dir_all(&chunks).unwrap();
        std::fs::write(chunks.join("chunk_0000_20s.mp4"), vec![0u8; 1000]).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut monitor = ChunkMonitor::new(
            dir.path(),
            ChunkConfig::default(),
            FilmstripConfig::default(),
            FilmstripProcessor::fusion(0.7).unwrap(),
            Box::new(tx),
            RetryPolicy::none(),
        );

        assert_eq!(monitor.poll_once(true).unwrap(), 0);
        assert!(rx.try_recv().is_err());

        let status = monitor.status();
        assert_eq!(status.processed_chunks, 0);
        assert!(status.failed_chunks.is_empty());
        assert!(!status.thread_alive);
        assert!(!status.is_running);
    }

    #[test]
    fn test_monitor_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut chunk = ChunkConfig::default();
        chunk.check_interval_secs = 0.05;

        let mut monitor = ChunkMonitor::new(
            dir.path(),
            chunk,
            FilmstripConfig::default(),
            FilmstripProcessor::fusion(0.7).unwrap(),
            Box::new(tx),
            RetryPolicy::none(),
        );
        monitor.start().unwrap();
        assert!(monitor.status().is_running);
        assert!(monitor.poll_once(false).is_err());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(monitor.stop(), 0);
        assert!(!monitor.status().is_running);
        assert_eq!(monitor.chunk_counter().load(Ordering::SeqCst), 0);
    }
}
