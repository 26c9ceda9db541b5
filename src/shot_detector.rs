//! ShotChangeDetector - frame-pair shot change detection
//!
//! Two comparison methods are supported: HSV colour-histogram correlation
//! (a change is reported when correlation drops below the threshold) and
//! grayscale mean squared error (a change is reported when the error rises
//! above the threshold). The detector works one frame at a time or on whole
//! batches, and can carry the last frame of a batch over to the next one so
//! that cuts falling exactly on a chunk boundary are still seen.
//!
//! Cross-batch mode assumes consecutive batches are gap-free. If the source
//! drops frames between two chunks (for example when the segmenter
//! restarts), the comparison at index 0 may report a cut that is not there.

use opencv::{core::{self, Mat, Vector}, imgproc, prelude::*};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};
use crate::common::{FusionError, Result};

/// Histogram bins per HSV channel
const HIST_BINS: [i32; 3] = [8, 8, 8];

/// Histogram ranges: hue is 0..180 in OpenCV, saturation and value 0..256
const HIST_RANGES: [f32; 6] = [0.0, 180.0, 0.0, 256.0, 0.0, 256.0];

/// Frame comparison method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    /// HSV histogram correlation; change when correlation < threshold
    Histogram,
    /// Grayscale mean squared error; change when error > threshold
    Mse,
}

impl Default for DetectionMethod {
    fn default() -> Self {
        DetectionMethod::Histogram
    }
}

impl FromStr for DetectionMethod {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "histogram" => Ok(DetectionMethod::Histogram),
            "mse" => Ok(DetectionMethod::Mse),
            other => Err(FusionError::config_error(format!(
                "Unknown detection method '{}'. Use 'histogram' or 'mse'",
                other
            ))),
        }
    }
}

/// Serializable snapshot of a detector's settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorConfig {
    pub method: DetectionMethod,
    pub threshold: f64,
    pub cross_chunk: bool,
    pub hist_bins: [i32; 3],
}

/// Detects shot changes between consecutive frames
pub struct ShotChangeDetector {
    method: DetectionMethod,
    threshold: f64,
    cross_chunk: bool,
    last_frame: Option<Mat>,
    previous_histogram: Option<Mat>,
    frames_seen: u64,
}

impl ShotChangeDetector {
    /// Create a detector
    ///
    /// # Arguments
    /// * `method` - Comparison method
    /// * `threshold` - Correlation floor (histogram) or error ceiling (MSE)
    /// * `cross_chunk` - Compare each batch's first frame with the previous batch's last
    ///
    /// # Panics
    /// Panics if threshold is negative (fail-fast approach)
    #[instrument]
    pub fn new(method: DetectionMethod, threshold: f64, cross_chunk: bool) -> Self {
        assert!(threshold >= 0.0, "Threshold must be non-negative, got: {}", threshold);

        debug!("Created ShotChangeDetector: method={:?}, threshold={}, cross_chunk={}",
               method, threshold, cross_chunk);

        Self {
            method,
            threshold,
            cross_chunk,
            last_frame: None,
            previous_histogram: None,
            frames_seen: 0,
        }
    }

    /// Detector tuned for standalone visual analysis (no cross-chunk state)
    pub fn visual(threshold: f64) -> Self {
        Self::new(DetectionMethod::Histogram, threshold, false)
    }

    /// Detector tuned for the live fusion pipeline (cross-chunk continuity on)
    pub fn fusion(threshold: f64) -> Self {
        Self::new(DetectionMethod::Histogram, threshold, true)
    }

    /// Compare a frame with the previously seen one
    ///
    /// # Arguments
    /// * `frame` - BGR frame
    /// * `frame_number` - Caller's frame index, used for logging and errors
    ///
    /// # Returns
    /// * `(changed, elapsed)` - Whether a shot change was detected and how long the check took
    #[instrument(skip(self, frame))]
    pub fn detect_single(&mut self, frame: &Mat, frame_number: u32) -> Result<(bool, Duration)> {
        let started = Instant::now();

        if frame.empty() {
            return Err(FusionError::frame_error(frame_number, "Empty frame provided"));
        }

        self.frames_seen += 1;

        let changed = match self.method {
            DetectionMethod::Histogram => {
                let hist = hsv_histogram(frame)
                    .map_err(|e| FusionError::frame_error(frame_number, format!("Histogram failed: {}", e)))?;
                let changed = match self.previous_histogram {
                    Some(ref previous) => {
                        let correlation = imgproc::compare_hist(previous, &hist, imgproc::HISTCMP_CORREL)?;
                        trace!("Frame {} correlation: {:.4}", frame_number, correlation);
                        correlation < self.threshold
                    }
                    None => false,
                };
                self.previous_histogram = Some(hist);
                changed
            }
            DetectionMethod::Mse => {
                let changed = match self.last_frame {
                    Some(ref previous) => {
                        let mse = mean_squared_error(previous, frame)
                            .map_err(|e| FusionError::frame_error(frame_number, format!("MSE failed: {}", e)))?;
                        trace!("Frame {} MSE: {:.2}", frame_number, mse);
                        mse > self.threshold
                    }
                    None => false,
                };
                self.last_frame = Some(frame.try_clone()?);
                changed
            }
        };

        if changed {
            debug!("Shot change at frame {}", frame_number);
        }

        Ok((changed, started.elapsed()))
    }

    /// Flag shot changes across a batch of frames
    ///
    /// Index `i > 0` is true when frame `i` differs from frame `i-1`. Index 0
    /// is only ever true in cross-chunk mode, when it differs from the last
    /// frame of the previous batch.
    #[instrument(skip(self, frames), fields(len = frames.len()))]
    pub fn detect_batch(&mut self, frames: &[Mat]) -> Result<Vec<bool>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let mut flags = vec![false; frames.len()];

        if self.cross_chunk {
            if let Some(ref previous) = self.last_frame {
                flags[0] = self.compare(previous, &frames[0])?;
                if flags[0] {
                    debug!("Shot change across chunk boundary");
                }
            }
        }

        for i in 1..frames.len() {
            flags[i] = self.compare(&frames[i - 1], &frames[i])?;
        }

        if self.cross_chunk {
            if let Some(last) = frames.last() {
                self.last_frame = Some(last.try_clone()?);
            }
        }

        self.frames_seen += frames.len() as u64;

        let changes = flags.iter().filter(|f| **f).count();
        debug!("Batch of {} frames: {} shot changes", frames.len(), changes);

        Ok(flags)
    }

    /// Indices of the frames flagged by [`ShotChangeDetector::detect_batch`]
    pub fn detect_batch_indices(&mut self, frames: &[Mat]) -> Result<Vec<usize>> {
        let flags = self.detect_batch(frames)?;
        Ok(flags
            .iter()
            .enumerate()
            .filter_map(|(i, changed)| changed.then_some(i))
            .collect())
    }

    fn compare(&self, first: &Mat, second: &Mat) -> Result<bool> {
        match self.method {
            DetectionMethod::Histogram => {
                let h1 = hsv_histogram(first)?;
                let h2 = hsv_histogram(second)?;
                let correlation = imgproc::compare_hist(&h1, &h2, imgproc::HISTCMP_CORREL)?;
                Ok(correlation < self.threshold)
            }
            DetectionMethod::Mse => Ok(mean_squared_error(first, second)? > self.threshold),
        }
    }

    /// Clear all retained frame state (start of a new video)
    #[instrument(skip(self))]
    pub fn reset(&mut self) {
        debug!("Resetting ShotChangeDetector state");
        self.last_frame = None;
        self.previous_histogram = None;
        self.frames_seen = 0;
    }

    /// Current settings
    pub fn config(&self) -> DetectorConfig {
        DetectorConfig {
            method: self.method,
            threshold: self.threshold,
            cross_chunk: self.cross_chunk,
            hist_bins: HIST_BINS,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn method(&self) -> DetectionMethod {
        self.method
    }

    /// Number of frames examined since creation or the last reset
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Whether a frame from a previous batch is being carried over
    pub fn has_carried_frame(&self) -> bool {
        self.last_frame.is_some()
    }
}

// Implement Debug manually to avoid showing internal OpenCV state
impl std::fmt::Debug for ShotChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShotChangeDetector")
            .field("method", &self.method)
            .field("threshold", &self.threshold)
            .field("cross_chunk", &self.cross_chunk)
            .field("frames_seen", &self.frames_seen)
            .field("has_last_frame", &self.last_frame.is_some())
            .finish()
    }
}

/// 3-D HSV histogram of a BGR frame
fn hsv_histogram(frame: &Mat) -> Result<Mat> {
    let mut hsv = Mat::default();
    imgproc::cvt_color_def(frame, &mut hsv, imgproc::COLOR_BGR2HSV)?;

    let mut images = Vector::<Mat>::new();
    images.push(hsv);

    let channels = Vector::<i32>::from_slice(&[0, 1, 2]);
    let hist_size = Vector::<i32>::from_slice(&HIST_BINS);
    let ranges = Vector::<f32>::from_slice(&HIST_RANGES);

    let mut hist = Mat::default();
    imgproc::calc_hist(&images, &channels, &Mat::default(), &mut hist, &hist_size, &ranges, false)?;

    Ok(hist)
}

/// Mean squared error between two BGR frames in grayscale
///
/// The second frame is resized to the first frame's shape when they differ.
fn mean_squared_error(first: &Mat, second: &Mat) -> Result<f64> {
    let mut gray1 = Mat::default();
    let mut gray2 = Mat::default();
    imgproc::cvt_color_def(first, &mut gray1, imgproc::COLOR_BGR2GRAY)?;
    imgproc::cvt_color_def(second, &mut gray2, imgproc::COLOR_BGR2GRAY)?;

    if gray1.size()? != gray2.size()? {
        let mut resized = Mat::default();
        imgproc::resize(&gray2, &mut resized, gray1.size()?, 0.0, 0.0, imgproc::INTER_LINEAR)?;
        gray2 = resized;
    }

    let pixels = (gray1.rows() * gray1.cols()) as f64;
    if pixels == 0.0 {
        return Err(FusionError::internal_error("Cannot compare zero-sized frames"));
    }

    let squared_sum = core::norm2(&gray1, &gray2, core::NORM_L2SQR, &Mat::default())?;
    Ok(squared_sum / pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn solid(width: i32, height: i32, color: (u8, u8, u8)) -> Mat {
        Mat::new_rows_cols_with_default(
            height, width, CV_8UC3, Scalar::new(color.0 as f64, color.1 as f64, color.2 as f64, 0.0)
        ).unwrap()
    }

    fn sequence() -> Vec<Mat> {
        vec![
            solid(64, 48, (0, 0, 255)),
            solid(64, 48, (0, 0, 255)),
            solid(64, 48, (0, 255, 0)),
            solid(64, 48, (0, 255, 0)),
            solid(64, 48, (255, 255, 255)),
        ]
    }

    #[test]
    fn test_detector_creation() {
        let detector = ShotChangeDetector::fusion(0.7);
        let config = detector.config();
        assert_eq!(config.method, DetectionMethod::Histogram);
        assert_eq!(config.threshold, 0.7);
        assert!(config.cross_chunk);
        assert_eq!(config.hist_bins, [8, 8, 8]);

        let visual = ShotChangeDetector::visual(0.3);
        assert!(!visual.config().cross_chunk);
    }

    #[test]
    #[should_panic(expected = "Threshold must be non-negative")]
    fn test_negative_threshold() {
        ShotChangeDetector::new(DetectionMethod::Mse, -1.0, false);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("histogram".parse::<DetectionMethod>().unwrap(), DetectionMethod::Histogram);
        assert_eq!("MSE".parse::<DetectionMethod>().unwrap(), DetectionMethod::Mse);
        assert!(matches!("sobel".parse::<DetectionMethod>(), Err(FusionError::InvalidConfig { .. })));
    }

    #[test]
    fn test_batch_edge_cases() {
        let mut detector = ShotChangeDetector::fusion(0.7);
        assert!(detector.detect_batch(&[]).unwrap().is_empty());

        let single = vec![solid(32, 32, (10, 20, 30))];
        assert_eq!(detector.detect_batch(&single).unwrap(), vec![false]);
    }

    #[test]
    fn test_histogram_batch_flags_colour_changes() {
        let mut detector = ShotChangeDetector::visual(0.7);
        let flags = detector.detect_batch(&sequence()).unwrap();
        assert_eq!(flags, vec![false, false, true, false, true]);
    }

    #[test]
    fn test_mse_batch_with_resize() {
        let mut detector = ShotChangeDetector::new(DetectionMethod::Mse, 100.0, false);
        let frames = vec![
            solid(64, 48, (0, 0, 0)),
            solid(32, 24, (0, 0, 0)),
            solid(64, 48, (255, 255, 255)),
        ];
        assert_eq!(detector.detect_batch(&frames).unwrap(), vec![false, false, true]);
    }

    #[test]
    fn test_cross_chunk_continuity() {
        let mut detector = ShotChangeDetector::fusion(0.7);
        let first = vec![solid(32, 32, (0, 0, 255)), solid(32, 32, (0, 0, 255))];
        let second = vec![solid(32, 32, (255, 0, 0)), solid(32, 32, (255, 0, 0))];

        assert_eq!(detector.detect_batch(&first).unwrap(), vec![false, false]);
        assert!(detector.has_carried_frame());
        assert_eq!(detector.detect_batch(&second).unwrap(), vec![true, false]);

        detector.reset();
        assert!(!detector.has_carried_frame());
        assert_eq!(detector.detect_batch(&second).unwrap(), vec![false, false]);
    }

    #[test]
    fn test_single_and_batch_agree() {
        for method in [DetectionMethod::Histogram, DetectionMethod::Mse] {
            let threshold = if method == DetectionMethod::Mse { 100.0 } else { 0.7 };
            let frames = sequence();

            let mut batch = ShotChangeDetector::new(method, threshold, false);
            let batch_flags = batch.detect_batch(&frames).unwrap();

            let mut single = ShotChangeDetector::new(method, threshold, false);
            let single_flags: Vec<bool> = frames
                .iter()
                .enumerate()
                .map(|(i, f)| single.detect_single(f, i as u32).unwrap().0)
                .collect();

            assert_eq!(batch_flags, single_flags, "method {:?}", method);
        }
    }

    #[test]
    fn test_detect_single_rejects_empty_frame() {
        let mut detector = ShotChangeDetector::visual(0.3);
        let result = detector.detect_single(&Mat::default(), 7);
        assert!(matches!(result, Err(FusionError::FrameProcessingFailed { frame: 7, .. })));
    }

    #[test]
    fn test_batch_indices() {
        let mut detector = ShotChangeDetector::visual(0.7);
        assert_eq!(detector.detect_batch_indices(&sequence()).unwrap(), vec![2, 4]);
        assert_eq!(detector.frames_seen(), 5);
    }

    #[test]
    fn test_debug_formatting() {
        let detector = ShotChangeDetector::fusion(0.7);
        let debug_str = format!("{:?}", detector);
        assert!(debug_str.contains("ShotChangeDetector"));
        assert!(debug_str.contains("has_last_frame"));
    }
}
