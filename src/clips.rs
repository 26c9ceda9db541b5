//! Background clip extraction for finalized chapters
//!
//! Clips are cut from the continuous recording with ffmpeg on a dedicated
//! thread, so transcoding never holds up chunk analysis. Jobs are chapter
//! snapshots; clips that already exist on disk are skipped, which makes
//! resubmitting a growing list of finalized chapters cheap.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};
use crate::chapters::Chapter;
use crate::common::{join_with_timeout, safe_filename, FusionError, Result};
use crate::ffmpeg::FfmpegCommand;

/// Container formats accepted as the recording source
const RECORDING_EXTENSIONS: [&str; 5] = ["mxf", "mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    Chapter,
    Topic,
}

/// One clip to cut
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipSpec {
    pub kind: ClipKind,
    pub path: PathBuf,
    pub start_time: f64,
    pub duration: f64,
}

/// Chapter and topic clips for `chapters`, numbered from 1 in list order
///
/// Ranges with a non-positive duration or a negative start are skipped.
pub fn plan_clips(chapters: &[Chapter], clips_dir: &Path) -> Vec<ClipSpec> {
    let mut specs = Vec::new();

    for (i, chapter) in chapters.iter().enumerate() {
        let chapter_no = i + 1;
        let (Some(start), Some(end)) = (chapter.start_time(), chapter.end_time()) else {
            continue;
        };

        if valid_range(start, end, &format!("chapter {}", chapter_no)) {
            specs.push(ClipSpec {
                kind: ClipKind::Chapter,
                path: clips_dir.join(format!("chapter_{:03}_{}.mp4", chapter_no, safe_filename(&chapter.chapter, 50))),
                start_time: start,
                duration: end - start,
            });
        }

        for (j, topic) in chapter.topics.iter().enumerate() {
            let label = format!("chapter {}, topic {}", chapter_no, j + 1);
            if !valid_range(topic.start_time, topic.end_time, &label) {
                continue;
            }
            specs.push(ClipSpec {
                kind: ClipKind::Topic,
                path: clips_dir.join(format!(
                    "chapter_{:03}_topic_{:02}_{}.mp4",
                    chapter_no,
                    j + 1,
                    safe_filename(&topic.topic_summary, 30)
                )),
                start_time: topic.start_time,
                duration: topic.duration(),
            });
        }
    }

    specs
}

fn valid_range(start: f64, end: f64, label: &str) -> bool {
    let duration = end - start;
    if duration <= 0.0 {
        warn!("Skipping {}: invalid duration ({:.2}s)", label, duration);
        false
    } else if start < 0.0 {
        warn!("Skipping {}: negative start time ({:.2}s)", label, start);
        false
    } else {
        true
    }
}

/// Newest recording in `<output>/recording`, falling back to `<output>`
pub fn find_recording(output_dir: &Path) -> Option<PathBuf> {
    for dir in [output_dir.join("recording"), output_dir.to_path_buf()] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        let newest = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| RECORDING_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .max_by_key(|p| {
                let modified = std::fs::metadata(p).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, p.clone())
            });

        if let Some(path) = newest {
            debug!("Found recording: {}", path.display());
            return Some(path);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClipStats {
    pub created: usize,
    pub skipped_existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ClipSettings {
    pub output_dir: PathBuf,
    pub chapter_timeout: Duration,
    pub topic_timeout: Duration,
}

impl ClipSettings {
    pub fn clips_dir(&self) -> PathBuf {
        self.output_dir.join("clips")
    }
}

/// Cut every planned clip that does not exist yet
fn extract_clips(settings: &ClipSettings, chapters: &[Chapter], stats: &Mutex<ClipStats>) -> Result<()> {
    let recording = find_recording(&settings.output_dir).ok_or_else(|| FusionError::VideoNotFound {
        path: settings.output_dir.join("recording").display().to_string(),
    })?;

    let clips_dir = settings.clips_dir();
    std::fs::create_dir_all(&clips_dir)?;

    for spec in plan_clips(chapters, &clips_dir) {
        if spec.path.exists() {
            bump(stats, |s| s.skipped_existing += 1);
            continue;
        }

        let timeout = match spec.kind {
            ClipKind::Chapter => settings.chapter_timeout,
            ClipKind::Topic => settings.topic_timeout,
        };
        debug!("Cutting {} ({:.1}s +{:.1}s)", spec.path.display(), spec.start_time, spec.duration);

        let outcome = FfmpegCommand::new(recording.to_string_lossy(), spec.path.to_string_lossy())
            .seek(spec.start_time)
            .duration(spec.duration)
            .video_codec("libx264")
            .preset("ultrafast")
            .crf(28)
            .audio_codec("aac")
            .output_args(["-avoid_negative_ts", "make_zero"])
            .run(Some(timeout));

        match outcome {
            Ok(()) => {
                let size = std::fs::metadata(&spec.path).map(|m| m.len()).unwrap_or(0);
                debug!("Created clip {} ({} bytes)", spec.path.display(), size);
                bump(stats, |s| s.created += 1);
            }
            Err(FusionError::Timeout { seconds, .. }) => {
                warn!("Timeout after {:.0}s creating {} - skipping", seconds, spec.path.display());
                discard_partial(&spec.path);
                bump(stats, |s| s.failed += 1);
            }
            Err(e) => {
                error!("Failed to create clip {}: {}", spec.path.display(), e);
                discard_partial(&spec.path);
                bump(stats, |s| s.failed += 1);
            }
        }
    }
    Ok(())
}

/// Remove what an unfinished ffmpeg run left behind, so the next pass retries the clip
fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial clip {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove partial clip {}: {}", path.display(), e),
    }
}

fn bump(stats: &Mutex<ClipStats>, f: impl FnOnce(&mut ClipStats)) {
    match stats.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// Owns the clip thread and its job queue
///
/// All methods take `&self`, so one extractor can be shared between the
/// analysis worker and the thread that shuts the analyzer down.
pub struct ClipExtractor {
    sender: Mutex<Option<Sender<Vec<Chapter>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    stats: Arc<Mutex<ClipStats>>,
}

impl ClipExtractor {
    pub fn start(settings: ClipSettings) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Vec<Chapter>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(Mutex::new(ClipStats::default()));
        let (thread_pending, thread_stats) = (pending.clone(), stats.clone());

        let handle = thread::Builder::new()
            .name("clip-extractor".to_string())
            .spawn(move || {
                for chapters in receiver {
                    info!("Creating clips for {} finalized chapter(s)", chapters.len());
                    if let Err(e) = extract_clips(&settings, &chapters, &thread_stats) {
                        warn!("Clip creation skipped: {}", e);
                    }
                    thread_pending.fetch_sub(1, Ordering::SeqCst);
                }
                debug!("Clip extractor finished");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            pending,
            stats,
        })
    }

    /// Queue clip creation for a snapshot of finalized chapters
    pub fn submit(&self, chapters: Vec<Chapter>) {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = guard.as_ref() else {
            warn!("Clip extractor is shut down, dropping clip job");
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(chapters).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("Clip thread is gone, dropping clip job");
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ClipStats {
        match self.stats.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Wait until queued jobs are done
    ///
    /// # Returns
    /// `false` if jobs were still running after `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.pending_jobs() > 0 {
            if started.elapsed() >= timeout {
                warn!("Clip creation still running after {:.0}s", timeout.as_secs_f64());
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
        true
    }

    /// Close the queue and join the thread
    pub fn shutdown(&self, timeout: Duration) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if join_with_timeout(handle, timeout).is_err() {
                warn!("Clip thread still running after {:.0}s", timeout.as_secs_f64());
            }
        }
    }
}

impl std::fmt::Debug for ClipExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipExtractor")
            .field("pending", &self.pending_jobs())
            .field("stats", &self.stats())
            .finish()
    }
}
