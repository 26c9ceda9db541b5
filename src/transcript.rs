//! Transcript assembly and time-range lookup
//!
//! Streaming speech-to-text services emit overlapping partial results whose
//! items become "stable" over time. [`SentenceAssembler`] turns those items
//! into complete, timestamped sentences and appends them to a
//! [`SharedSentenceBuffer`], which the analyzer reads through the
//! [`TranscriptSource`] trait.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};
use crate::common::{format_clock, Result};

/// Text used when no sentence overlaps the requested range
pub const NO_TRANSCRIPT: &str = "[No transcript available for this time range]";

/// A complete sentence with its position in the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub start_time: f64,
    pub end_time: f64,
    pub sentence: String,
    /// Sentence start as `HH:MM:SS`
    pub timestamp: String,
}

impl Sentence {
    pub fn new(sentence: impl Into<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            start_time,
            end_time,
            sentence: sentence.into(),
            timestamp: format_clock(start_time),
        }
    }
}

/// Sentence record in the shape sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSentence {
    pub sentence_start_time_in_sec: f64,
    pub sentence_end_time_in_sec: f64,
    pub sentence: String,
}

/// Transcript for one time range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSlice {
    pub text: String,
    pub sentences: Vec<TranscriptSentence>,
}

/// Read access to transcribed sentences
pub trait TranscriptSource: Send + Sync {
    /// Sentences overlapping `[start, end]` (inclusive on both ends)
    fn slice(&self, start: f64, end: f64) -> TranscriptSlice;
}

/// Thread-safe, append-only sentence list shared between the assembler and readers
#[derive(Debug, Clone, Default)]
pub struct SharedSentenceBuffer {
    inner: Arc<RwLock<Vec<Sentence>>>,
}

impl SharedSentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sentence: Sentence) {
        match self.inner.write() {
            Ok(mut guard) => guard.push(sentence),
            Err(poisoned) => poisoned.into_inner().push(sentence),
        }
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all sentences so far
    pub fn snapshot(&self) -> Vec<Sentence> {
        self.read(|s| s.to_vec())
    }

    fn read<T>(&self, f: impl FnOnce(&[Sentence]) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl TranscriptSource for SharedSentenceBuffer {
    fn slice(&self, start: f64, end: f64) -> TranscriptSlice {
        self.read(|sentences| {
            let sentences: Vec<TranscriptSentence> = sentences
                .iter()
                .filter(|s| s.start_time <= end && s.end_time >= start)
                .map(|s| TranscriptSentence {
                    sentence_start_time_in_sec: s.start_time,
                    sentence_end_time_in_sec: s.end_time,
                    sentence: s.sentence.clone(),
                })
                .collect();

            let text = if sentences.is_empty() {
                NO_TRANSCRIPT.to_string()
            } else {
                sentences.iter().map(|s| s.sentence.as_str()).collect::<Vec<_>>().join(" ")
            };

            TranscriptSlice { text, sentences }
        })
    }
}

/// Merges comma-terminated fragments into the following fragment
#[derive(Debug, Default)]
pub struct SentenceBuilder {
    pending: Option<PendingFragment>,
}

#[derive(Debug)]
struct PendingFragment {
    words: Vec<String>,
    start_time: f64,
    punctuation: String,
}

impl SentenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment; returns a sentence once a non-comma fragment completes it
    pub fn add_fragment(&mut self, words: Vec<String>, start_time: f64, end_time: f64, punctuation: &str) -> Option<Sentence> {
        if punctuation == "," {
            match self.pending.as_mut() {
                Some(pending) => {
                    pending.words.extend(words);
                    pending.punctuation = punctuation.to_string();
                }
                None => {
                    self.pending = Some(PendingFragment {
                        words,
                        start_time,
                        punctuation: punctuation.to_string(),
                    });
                }
            }
            return None;
        }

        match self.pending.take() {
            Some(pending) => {
                let text = format!(
                    "{}{} {}{}",
                    pending.words.join(" "),
                    pending.punctuation,
                    words.join(" "),
                    punctuation
                );
                Some(Sentence::new(text, pending.start_time, end_time))
            }
            None => Some(Sentence::new(format!("{}{}", words.join(" "), punctuation), start_time, end_time)),
        }
    }

    /// Force out whatever is pending; its end is one second after its start
    pub fn finalize_pending(&mut self) -> Option<Sentence> {
        self.pending.take().map(|pending| {
            Sentence::new(
                format!("{}{}", pending.words.join(" "), pending.punctuation),
                pending.start_time,
                pending.start_time + 1.0,
            )
        })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Pronunciation,
    Punctuation,
}

/// One word or punctuation mark from a speech-to-text result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub content: String,
    pub start_time: f64,
    pub end_time: f64,
    pub item_type: ItemType,
    #[serde(default)]
    pub stable: bool,
}

impl TranscriptItem {
    fn key(&self) -> String {
        format!("{}_{}_{}", self.start_time, self.end_time, self.content)
    }
}

/// One streaming result: a partial hypothesis or a final one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub is_partial: bool,
    pub items: Vec<TranscriptItem>,
}

/// Persists the sentence list as a pretty-printed JSON array
#[derive(Debug)]
pub struct TranscriptWriter {
    path: PathBuf,
    sentences: Vec<Sentence>,
}

impl TranscriptWriter {
    /// Create (or truncate) the transcript file with an empty array
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Self { path, sentences: Vec::new() };
        writer.flush()?;
        Ok(writer)
    }

    pub fn append(&mut self, sentence: &Sentence) -> Result<()> {
        self.sentences.push(sentence.clone());
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.sentences)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Builds sentences from stable streaming items
#[derive(Debug)]
pub struct SentenceAssembler {
    buffer: SharedSentenceBuffer,
    writer: Option<TranscriptWriter>,
    builder: SentenceBuilder,
    partial: HashMap<String, TranscriptItem>,
    processed_keys: HashSet<String>,
    last_stable_key: Option<String>,
}

impl SentenceAssembler {
    pub fn new(buffer: SharedSentenceBuffer, writer: Option<TranscriptWriter>) -> Self {
        Self {
            buffer,
            writer,
            builder: SentenceBuilder::new(),
            partial: HashMap::new(),
            processed_keys: HashSet::new(),
            last_stable_key: None,
        }
    }

    pub fn buffer(&self) -> &SharedSentenceBuffer {
        &self.buffer
    }

    /// Consume one streaming result
    #[instrument(skip(self, result), fields(partial = result.is_partial, items = result.items.len()))]
    pub fn handle_result(&mut self, result: &TranscriptResult) {
        if result.is_partial {
            // Items before the last stable one were already consumed
            let mut past_last = self.last_stable_key.is_none();
            for item in &result.items {
                let key = item.key();
                if !past_last {
                    if Some(&key) == self.last_stable_key.as_ref() {
                        past_last = true;
                    }
                    continue;
                }
                if item.stable && !self.partial.contains_key(&key) {
                    self.partial.insert(key.clone(), item.clone());
                    self.last_stable_key = Some(key);
                    if item.item_type == ItemType::Punctuation {
                        self.emit_fragment();
                    }
                }
            }
        } else {
            for item in &result.items {
                let key = item.key();
                if self.processed_keys.contains(&key) {
                    continue;
                }
                if !self.partial.contains_key(&key) {
                    self.partial.insert(key, item.clone());
                    if item.item_type == ItemType::Punctuation {
                        self.emit_fragment();
                    }
                }
            }

            self.processed_keys.clear();
            if self.partial.is_empty() {
                self.last_stable_key = None;
            }
        }
    }

    /// Flush any comma fragment left at the end of the stream
    pub fn finish(&mut self) {
        if let Some(sentence) = self.builder.finalize_pending() {
            self.publish(sentence);
        }
    }

    /// Turn buffered items up to the first punctuation mark into a fragment
    fn emit_fragment(&mut self) {
        let mut items: Vec<&TranscriptItem> = self.partial.values().collect();
        items.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let mut words = Vec::new();
        let mut start = None;
        let mut end = 0.0;
        let mut punctuation = String::new();
        let mut consumed = Vec::new();

        for item in items {
            consumed.push(item.key());
            match item.item_type {
                ItemType::Pronunciation => {
                    words.push(item.content.clone());
                    start.get_or_insert(item.start_time);
                    end = item.end_time;
                }
                ItemType::Punctuation => {
                    punctuation = item.content.trim().to_string();
                    break;
                }
            }
        }

        let Some(start) = start else {
            trace!("Punctuation without words, waiting for more items");
            return;
        };

        for key in consumed {
            self.partial.remove(&key);
            self.processed_keys.insert(key);
        }

        if let Some(sentence) = self.builder.add_fragment(words, start, end, &punctuation) {
            self.publish(sentence);
        }
    }

    fn publish(&mut self, sentence: Sentence) {
        debug!("Sentence: {} ({:.1}s-{:.1}s)", sentence.sentence, sentence.start_time, sentence.end_time);
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.append(&sentence) {
                warn!("Failed to write to transcript file: {}", e);
            }
        }
        self.buffer.push(sentence);
    }
}

/// Feeds an assembler from a JSON-lines stream of [`TranscriptResult`]s
///
/// The producing speech-to-text process appends one result per line to a
/// file; the feed tails it until stopped or until the file stays idle for
/// longer than `idle_timeout`.
pub struct TranscriptFeed {
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TranscriptFeed {
    pub fn start(path: PathBuf, mut assembler: SentenceAssembler, idle_timeout: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let (thread_running, thread_stop) = (running.clone(), stop.clone());

        let handle = thread::Builder::new()
            .name("transcript-feed".to_string())
            .spawn(move || {
                info!("Transcript feed started: {}", path.display());
                if let Err(e) = tail_results(&path, &mut assembler, &thread_stop, idle_timeout) {
                    warn!("Transcript feed error: {}", e);
                }
                assembler.finish();
                thread_running.store(false, Ordering::SeqCst);
                info!("Transcript feed stopped ({} sentences)", assembler.buffer().len());
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("Failed to start transcript feed thread: {}", e);
                running.store(false, Ordering::SeqCst);
                None
            }
        };

        Self { running, stop, handle }
    }

    /// Flag that is true while the feed is consuming results
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self, timeout: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if crate::common::join_with_timeout(handle, timeout).is_err() {
                warn!("Transcript feed thread still running");
            }
        }
    }
}

impl std::fmt::Debug for TranscriptFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptFeed")
            .field("running", &self.is_running())
            .finish()
    }
}

/// What one read from a growing file produced
#[derive(Debug, PartialEq)]
enum TailRead {
    Line(String),
    /// Bytes arrived but the line is not terminated yet
    Partial,
    Idle,
}

/// Complete lines from a file another process is still appending to
struct LineTail<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: BufRead> LineTail<R> {
    fn new(reader: R) -> Self {
        Self { reader, pending: Vec::new() }
    }

    fn read(&mut self) -> Result<TailRead> {
        // read_until appends, so an unterminated tail stays in `pending`
        if self.reader.read_until(b'\n', &mut self.pending)? == 0 {
            return Ok(TailRead::Idle);
        }
        if self.pending.last() != Some(&b'\n') {
            trace!("Waiting for the rest of a {} byte line", self.pending.len());
            return Ok(TailRead::Partial);
        }
        let line = std::mem::take(&mut self.pending);
        Ok(TailRead::Line(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Whatever is left once the producer is gone
    fn into_remainder(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        (!rest.trim().is_empty()).then_some(rest)
    }
}

fn handle_line(line: &str, assembler: &mut SentenceAssembler) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    match serde_json::from_str::<TranscriptResult>(trimmed) {
        Ok(result) => assembler.handle_result(&result),
        Err(e) => warn!("Skipping malformed transcript result: {}", e),
    }
}

fn tail_results(path: &Path, assembler: &mut SentenceAssembler, stop: &AtomicBool, idle_timeout: Duration) -> Result<()> {
    let poll = Duration::from_millis(200);

    // The producer may not have created the file yet
    let mut waited = Duration::ZERO;
    let file = loop {
        match std::fs::File::open(path) {
            Ok(file) => break file,
            Err(_) if waited < idle_timeout && !stop.load(Ordering::SeqCst) => {
                thread::sleep(poll);
                waited += poll;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut tail = LineTail::new(BufReader::new(file));
    let mut idle = Duration::ZERO;

    while !stop.load(Ordering::SeqCst) {
        match tail.read()? {
            TailRead::Line(line) => {
                idle = Duration::ZERO;
                handle_line(&line, assembler);
            }
            TailRead::Partial => {
                idle = Duration::ZERO;
                thread::sleep(poll);
            }
            TailRead::Idle => {
                if idle >= idle_timeout {
                    info!("No transcript results for {:.0}s", idle.as_secs_f64());
                    break;
                }
                thread::sleep(poll);
                idle += poll;
            }
        }
    }

    if let Some(rest) = tail.into_remainder() {
        handle_line(&rest, assembler);
    }
    Ok(())
}
