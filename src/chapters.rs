//! Chapter and topic structure built from incremental model actions
//!
//! The model answers each chunk with a list of actions that create chapters,
//! attach topics to them or patch existing topics. [`ChapterState`] applies
//! those actions in order. Nothing is ever removed: chapters and topics are
//! only appended or patched in place.
//!
//! Topic timestamps come from the model. Overlaps and gaps between adjacent
//! topics are reported by [`ChapterState::continuity_issues`] and left as they
//! are.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, warn};
use crate::common::{FusionError, Result};

/// Boundaries closer than this are treated as equal
const BOUNDARY_EPSILON: f64 = 1e-6;

/// One incremental change requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    NewChapter {
        #[serde(default)]
        id: Option<String>,
        chapter: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
    NewTopic {
        id: String,
        chapter_id: String,
        topic_summary: String,
        start_time: f64,
        end_time: f64,
        #[serde(default)]
        chunks: Vec<u32>,
    },
    UpdateTopic {
        id: String,
        #[serde(default)]
        topic_summary: Option<String>,
        #[serde(default)]
        start_time: Option<f64>,
        #[serde(default)]
        end_time: Option<f64>,
        #[serde(default)]
        chunks: Option<Vec<u32>>,
    },
}

impl Action {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Action::NewChapter { chapter, .. } if chapter.trim().is_empty() => Err("empty chapter title".to_string()),
            Action::NewTopic { id, start_time, end_time, .. } => {
                if id.is_empty() {
                    return Err("empty topic id".to_string());
                }
                if !start_time.is_finite() || !end_time.is_finite() {
                    return Err("non-finite topic time".to_string());
                }
                if end_time < start_time {
                    return Err(format!("end_time {} before start_time {}", end_time, start_time));
                }
                Ok(())
            }
            Action::UpdateTopic { start_time, end_time, .. } => {
                if start_time.map(|t| !t.is_finite()).unwrap_or(false) || end_time.map(|t| !t.is_finite()).unwrap_or(false) {
                    return Err("non-finite topic time".to_string());
                }
                if let (Some(start), Some(end)) = (start_time, end_time) {
                    if end < start {
                        return Err(format!("end_time {} before start_time {}", end, start));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Free-form progress report the model may attach to its actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    #[serde(default)]
    pub total_chunks_processed: Option<u32>,
    #[serde(default, alias = "processing_notes")]
    pub notes: Option<String>,
}

/// Parsed model reply for one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub actions: Vec<Action>,
    pub analysis_status: Option<AnalysisStatus>,
}

fn fence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").ok()).as_ref()
}

/// Body of the first fenced code block, or the whole text when there is none
pub fn strip_code_fence(text: &str) -> &str {
    fence_pattern()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_else(|| text.trim())
}

/// Parse a model reply into actions
///
/// A response with a missing `actions` list has no actions.
///
/// # Errors
/// * `ResponseParse` - The text is not a JSON object, even after fence stripping
/// * `MalformedAction` - An action has an unknown type, missing fields or invalid times
pub fn parse_response(text: &str) -> Result<ModelResponse> {
    let body = strip_code_fence(text);
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| FusionError::parse_error(e.to_string(), text))?;

    let object = value
        .as_object()
        .ok_or_else(|| FusionError::parse_error("expected a JSON object", text))?;

    let raw_actions = match object.get("actions") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items.clone(),
        Some(_) => return Err(FusionError::parse_error("'actions' is not a list", text)),
    };

    let mut actions = Vec::with_capacity(raw_actions.len());
    for (index, raw) in raw_actions.into_iter().enumerate() {
        let action: Action = serde_json::from_value(raw)
            .map_err(|e| FusionError::MalformedAction { index, reason: e.to_string() })?;
        action
            .validate()
            .map_err(|reason| FusionError::MalformedAction { index, reason })?;
        actions.push(action);
    }

    let analysis_status = match object.get("analysis_status") {
        Some(status) => serde_json::from_value(status.clone()).ok(),
        None => None,
    };

    Ok(ModelResponse { actions, analysis_status })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub topic_summary: String,
    pub start_time: f64,
    pub end_time: f64,
    pub chunks: Vec<u32>,
}

impl Topic {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub chapter: String,
    pub confidence: f64,
    pub topics: Vec<Topic>,
}

impl Chapter {
    /// Earliest topic start, if the chapter has topics
    pub fn start_time(&self) -> Option<f64> {
        self.topics.iter().map(|t| t.start_time).min_by(f64::total_cmp)
    }

    /// Latest topic end, if the chapter has topics
    pub fn end_time(&self) -> Option<f64> {
        self.topics.iter().map(|t| t.end_time).max_by(f64::total_cmp)
    }

    pub fn chunk_ids(&self) -> BTreeSet<u32> {
        self.topics.iter().flat_map(|t| t.chunks.iter().copied()).collect()
    }
}

/// Boundary problem between two time-adjacent topics
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuityIssue {
    Overlap { earlier: String, later: String, seconds: f64 },
    Gap { earlier: String, later: String, seconds: f64 },
}

impl fmt::Display for ContinuityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuityIssue::Overlap { earlier, later, seconds } => {
                write!(f, "topic {} overlaps topic {} by {:.2}s", earlier, later, seconds)
            }
            ContinuityIssue::Gap { earlier, later, seconds } => {
                write!(f, "{:.2}s gap between topic {} and topic {}", seconds, earlier, later)
            }
        }
    }
}

/// What happened when a batch of actions was applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub chapters_added: Vec<String>,
    pub topics_added: Vec<String>,
    pub topics_updated: Vec<String>,
    /// Actions that referenced unknown ids or reused an existing id
    pub ignored: Vec<String>,
}

/// Cumulative chapters with id lookups
#[derive(Debug, Clone, Default)]
pub struct ChapterState {
    chapters: Vec<Chapter>,
    chapter_index: HashMap<String, usize>,
    topic_index: HashMap<String, (usize, usize)>,
}

impl ChapterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topic_index.len()
    }

    pub fn chapter(&self, id: &str) -> Option<&Chapter> {
        self.chapter_index.get(id).map(|&i| &self.chapters[i])
    }

    pub fn topic(&self, id: &str) -> Option<&Topic> {
        self.topic_index.get(id).map(|&(c, t)| &self.chapters[c].topics[t])
    }

    /// Every chapter except the last one, once there are at least two
    pub fn finalized_chapters(&self) -> &[Chapter] {
        match self.chapters.len() {
            0 | 1 => &[],
            n => &self.chapters[..n - 1],
        }
    }

    /// The chapter that may still receive topics
    pub fn open_chapter(&self) -> Option<&Chapter> {
        self.chapters.last()
    }

    /// Chunk ids referenced by the last `n` chapters
    pub fn recent_chunk_ids(&self, n: usize) -> BTreeSet<u32> {
        let skip = self.chapters.len().saturating_sub(n);
        self.chapters[skip..].iter().flat_map(|c| c.chunk_ids()).collect()
    }

    /// Apply actions in order
    ///
    /// References to unknown chapters or topics and reused ids are skipped
    /// with a warning; they never remove or replace existing entries.
    pub fn apply(&mut self, actions: &[Action]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for action in actions {
            match action {
                Action::NewChapter { id, chapter, confidence } => {
                    let id = id.clone().unwrap_or_else(|| format!("h{}", self.chapters.len() + 1));
                    if self.chapter_index.contains_key(&id) {
                        warn!("Ignoring new_chapter with existing id {}", id);
                        report.ignored.push(id);
                        continue;
                    }
                    debug!("New chapter {}: {}", id, chapter);
                    self.chapter_index.insert(id.clone(), self.chapters.len());
                    self.chapters.push(Chapter {
                        id: id.clone(),
                        chapter: chapter.clone(),
                        confidence: confidence.unwrap_or(0.0),
                        topics: Vec::new(),
                    });
                    report.chapters_added.push(id);
                }
                Action::NewTopic { id, chapter_id, topic_summary, start_time, end_time, chunks } => {
                    let Some(&chapter_idx) = self.chapter_index.get(chapter_id) else {
                        warn!("Ignoring topic {} for unknown chapter {}", id, chapter_id);
                        report.ignored.push(id.clone());
                        continue;
                    };
                    if self.topic_index.contains_key(id) {
                        warn!("Ignoring new_topic with existing id {}", id);
                        report.ignored.push(id.clone());
                        continue;
                    }

                    let mut chunks = chunks.clone();
                    chunks.sort_unstable();
                    chunks.dedup();

                    let topics = &mut self.chapters[chapter_idx].topics;
                    debug!("New topic {} in {}: {:.1}s-{:.1}s", id, chapter_id, start_time, end_time);
                    self.topic_index.insert(id.clone(), (chapter_idx, topics.len()));
                    topics.push(Topic {
                        id: id.clone(),
                        topic_summary: topic_summary.clone(),
                        start_time: *start_time,
                        end_time: *end_time,
                        chunks,
                    });
                    report.topics_added.push(id.clone());
                }
                Action::UpdateTopic { id, topic_summary, start_time, end_time, chunks } => {
                    let Some(&(c, t)) = self.topic_index.get(id) else {
                        warn!("Ignoring update for unknown topic {}", id);
                        report.ignored.push(id.clone());
                        continue;
                    };
                    let topic = &mut self.chapters[c].topics[t];

                    let new_start = start_time.unwrap_or(topic.start_time);
                    let new_end = end_time.unwrap_or(topic.end_time);
                    if new_end < new_start {
                        warn!(
                            "Ignoring update for topic {} that would end at {:.1}s before its start at {:.1}s",
                            id, new_end, new_start
                        );
                        report.ignored.push(id.clone());
                        continue;
                    }

                    if let Some(summary) = topic_summary {
                        topic.topic_summary = summary.clone();
                    }
                    if let Some(start) = start_time {
                        topic.start_time = *start;
                    }
                    if let Some(end) = end_time {
                        topic.end_time = *end;
                    }
                    if let Some(extra) = chunks {
                        let merged: BTreeSet<u32> = topic.chunks.iter().chain(extra.iter()).copied().collect();
                        topic.chunks = merged.into_iter().collect();
                    }
                    debug!("Updated topic {}: {:.1}s-{:.1}s", id, topic.start_time, topic.end_time);
                    report.topics_updated.push(id.clone());
                }
            }
        }

        report
    }

    /// Overlaps and gaps between time-adjacent topics across all chapters
    pub fn continuity_issues(&self) -> Vec<ContinuityIssue> {
        let mut topics: Vec<&Topic> = self.chapters.iter().flat_map(|c| c.topics.iter()).collect();
        topics.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        topics
            .windows(2)
            .filter_map(|pair| {
                let (current, next) = (pair[0], pair[1]);
                let delta = next.start_time - current.end_time;
                if delta < -BOUNDARY_EPSILON {
                    Some(ContinuityIssue::Overlap {
                        earlier: current.id.clone(),
                        later: next.id.clone(),
                        seconds: -delta,
                    })
                } else if delta > BOUNDARY_EPSILON {
                    Some(ContinuityIssue::Gap {
                        earlier: current.id.clone(),
                        later: next.id.clone(),
                        seconds: delta,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

impl Serialize for ChapterState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.chapters.serialize(serializer)
    }
}
