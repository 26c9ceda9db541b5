//! Live-source end detection
//!
//! The stream is considered ended when either no new chunk has appeared
//! within the timeout window, or transcription was running and has since
//! stopped.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamStatus {
    pub stream_active: bool,
    pub time_since_activity: f64,
    pub chunk_count: usize,
    pub transcription_running: bool,
    pub transcription_was_running: bool,
}

/// Watches the chunk counter and transcription flag for signs of the end of the stream
#[derive(Debug)]
pub struct StreamMonitor {
    chunk_count: Arc<AtomicUsize>,
    transcription: Option<Arc<AtomicBool>>,
    timeout: Duration,
    last_activity: Instant,
    last_chunk_count: usize,
    transcription_was_running: bool,
}

impl StreamMonitor {
    /// # Arguments
    /// * `chunk_count` - Counter advanced by the chunk monitor
    /// * `transcription` - Flag that is true while transcription is consuming audio
    /// * `timeout` - Inactivity window after which the stream is considered ended
    pub fn new(chunk_count: Arc<AtomicUsize>, transcription: Option<Arc<AtomicBool>>, timeout: Duration) -> Self {
        Self {
            chunk_count,
            transcription,
            timeout,
            last_activity: Instant::now(),
            last_chunk_count: 0,
            transcription_was_running: false,
        }
    }

    /// Reset the inactivity timer if the chunk counter advanced
    ///
    /// # Returns
    /// `true` when new chunks were seen
    pub fn update_activity(&mut self) -> bool {
        self.update_activity_at(Instant::now())
    }

    fn update_activity_at(&mut self, now: Instant) -> bool {
        let count = self.chunk_count.load(Ordering::SeqCst);
        if count > self.last_chunk_count {
            debug!("Stream activity: {} chunks (was {})", count, self.last_chunk_count);
            self.last_chunk_count = count;
            self.last_activity = now;
            true
        } else {
            false
        }
    }

    fn transcription_running(&self) -> bool {
        self.transcription.as_ref().map(|f| f.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Whether the live source looks finished
    pub fn stream_appears_ended(&mut self) -> bool {
        self.stream_appears_ended_at(Instant::now())
    }

    fn stream_appears_ended_at(&mut self, now: Instant) -> bool {
        let running = self.transcription_running();
        if running {
            self.transcription_was_running = true;
        } else if self.transcription_was_running {
            info!("Transcription stopped, stream appears to have ended");
            return true;
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= self.timeout {
            info!("No new chunks for {:.0}s, stream appears to have ended", idle.as_secs_f64());
            return true;
        }
        false
    }

    pub fn status(&self) -> StreamStatus {
        let idle = self.last_activity.elapsed();
        StreamStatus {
            stream_active: idle < self.timeout,
            time_since_activity: idle.as_secs_f64(),
            chunk_count: self.last_chunk_count,
            transcription_running: self.transcription_running(),
            transcription_was_running: self.transcription_was_running,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_resets_timer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut monitor = StreamMonitor::new(counter.clone(), None, Duration::from_secs(60));
        let start = Instant::now();

        assert!(!monitor.update_activity_at(start));
        counter.store(2, Ordering::SeqCst);
        assert!(monitor.update_activity_at(start + Duration::from_secs(50)));
        assert!(!monitor.update_activity_at(start + Duration::from_secs(55)));

        // 59s after the last new chunk: still live
        assert!(!monitor.stream_appears_ended_at(start + Duration::from_secs(109)));
        assert!(monitor.stream_appears_ended_at(start + Duration::from_secs(110)));
        assert_eq!(monitor.status().chunk_count, 2);
    }

    #[test]
    fn test_transcription_stop_ends_stream() {
        let counter = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicBool::new(false));
        let mut monitor = StreamMonitor::new(counter, Some(flag.clone()), Duration::from_secs(60));
        let now = Instant::now();

        // Never started: not a signal on its own
        assert!(!monitor.stream_appears_ended_at(now));

        flag.store(true, Ordering::SeqCst);
        assert!(!monitor.stream_appears_ended_at(now));
        assert!(monitor.status().transcription_running);

        flag.store(false, Ordering::SeqCst);
        assert!(monitor.stream_appears_ended_at(now));
        assert!(monitor.status().transcription_was_running);
    }

    #[test]
    fn test_status_fresh_monitor() {
        let monitor = StreamMonitor::new(Arc::new(AtomicUsize::new(0)), None, DEFAULT_STREAM_TIMEOUT);
        let status = monitor.status();
        assert!(status.stream_active);
        assert!(!status.transcription_running);
        assert_eq!(status.chunk_count, 0);
    }
}
