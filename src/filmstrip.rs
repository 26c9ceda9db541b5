//! FilmstripProcessor - sampled frame grids with position/timestamp labels
//!
//! A filmstrip is one JPEG holding `rows × cols` frames sampled at the
//! middle of evenly sized slots. Every cell gets a label strip underneath
//! with its grid position and absolute timestamp, and the whole grid is
//! separated by solid borders. Extraction and rendering are separate steps
//! so that shot detection sees the raw decoded frames.

use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size, Vector, CV_8UC3},
    imgcodecs, imgproc,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use crate::common::{FusionError, Result};
use crate::retry::RetryPolicy;
use crate::shot_detector::ShotChangeDetector;
use crate::video_stream::VideoStream;

/// Shape of the placeholder used when nothing has been decoded yet
const PLACEHOLDER_ROWS: i32 = 480;
const PLACEHOLDER_COLS: i32 = 640;

/// Grid geometry and colours
///
/// Colours are RGB triples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilmstripStyle {
    pub rows: u32,
    pub cols: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    pub border: u32,
    pub label_height: u32,
    pub border_color: [u8; 3],
    pub label_bg_color: [u8; 3],
    pub label_text_color: [u8; 3],
    pub jpeg_quality: u8,
}

impl Default for FilmstripStyle {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 5,
            cell_width: 512,
            cell_height: 512,
            border: 8,
            label_height: 40,
            border_color: [255, 0, 0],
            label_bg_color: [0, 0, 0],
            label_text_color: [255, 255, 255],
            jpeg_quality: 95,
        }
    }
}

impl FilmstripStyle {
    /// 4×5 grid used for live fusion chunks
    pub fn fusion() -> Self {
        Self::default()
    }

    /// 5×4 grid used for standalone visual analysis
    pub fn visual() -> Self {
        Self {
            rows: 5,
            cols: 4,
            ..Self::default()
        }
    }

    /// Number of frames one grid holds
    pub fn capacity(&self) -> usize {
        (self.rows * self.cols) as usize
    }

    /// Total canvas size as (width, height)
    pub fn canvas_size(&self) -> (u32, u32) {
        grid_canvas_size(self.rows, self.cols, self.cell_width, self.cell_height, self.border, self.label_height)
    }

    /// Top-left corner of the image area of the cell at `index` (row-major)
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let row = index as u32 / self.cols;
        let col = index as u32 % self.cols;
        let x = col * (self.cell_width + self.border) + self.border;
        let y = row * (self.cell_height + self.label_height + self.border) + self.border;
        (x, y)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(FusionError::config_error("filmstrip grid must have at least one row and column"));
        }
        if self.cell_width == 0 || self.cell_height == 0 {
            return Err(FusionError::config_error("filmstrip cells must be non-empty"));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(FusionError::config_error(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Canvas size of a labelled grid as (width, height)
pub fn grid_canvas_size(rows: u32, cols: u32, cell_width: u32, cell_height: u32, border: u32, label_height: u32) -> (u32, u32) {
    let width = cols * cell_width + (cols + 1) * border;
    let height = rows * (cell_height + label_height) + (rows + 1) * border;
    (width, height)
}

/// Label drawn under a cell, e.g. `[2x3] | 12.5s`
pub fn cell_label(row: usize, col: usize, timestamp: f64) -> String {
    format!("[{}x{}] | {:.1}s", row + 1, col + 1, timestamp)
}

/// Timestamps of the sampling slots: the middle of each `interval`
pub fn slot_timestamps(start_time: f64, num_frames: usize, interval: f64) -> Vec<f64> {
    (0..num_frames)
        .map(|i| start_time + slot_offset(i, interval))
        .collect()
}

fn slot_offset(index: usize, interval: f64) -> f64 {
    index as f64 * interval + interval / 2.0
}

/// A decoded (or placeholder) frame with its absolute timestamp
pub struct TimedFrame {
    pub frame: Mat,
    pub timestamp: f64,
    /// True when decoding failed and a black frame was substituted
    pub placeholder: bool,
}

impl std::fmt::Debug for TimedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedFrame")
            .field("timestamp", &self.timestamp)
            .field("placeholder", &self.placeholder)
            .field("size", &(self.frame.cols(), self.frame.rows()))
            .finish()
    }
}

/// Builds labelled frame grids from video segments
pub struct FilmstripProcessor {
    style: FilmstripStyle,
    detector: Option<ShotChangeDetector>,
    open_retry: RetryPolicy,
}

impl FilmstripProcessor {
    /// Create a processor
    ///
    /// # Arguments
    /// * `style` - Grid geometry and colours
    /// * `detector` - Shot detector run over each batch before rendering
    pub fn new(style: FilmstripStyle, detector: Option<ShotChangeDetector>) -> Result<Self> {
        style.validate()?;
        debug!("Created FilmstripProcessor: {}x{} grid, {}x{} cells",
               style.rows, style.cols, style.cell_width, style.cell_height);

        Ok(Self {
            style,
            detector,
            open_retry: RetryPolicy::fixed(2, Duration::from_secs(2)),
        })
    }

    /// 4×5 processor with a cross-chunk fusion detector
    pub fn fusion(threshold: f64) -> Result<Self> {
        Self::new(FilmstripStyle::fusion(), Some(ShotChangeDetector::fusion(threshold)))
    }

    /// 5×4 processor with a visual detector
    pub fn visual(threshold: f64) -> Result<Self> {
        Self::new(FilmstripStyle::visual(), Some(ShotChangeDetector::visual(threshold)))
    }

    /// Override the retry policy used when a source cannot be opened
    pub fn with_open_retry(mut self, policy: RetryPolicy) -> Self {
        self.open_retry = policy;
        self
    }

    pub fn style(&self) -> &FilmstripStyle {
        &self.style
    }

    pub fn detector_mut(&mut self) -> Option<&mut ShotChangeDetector> {
        self.detector.as_mut()
    }

    /// Hand the detector (and its cross-batch state) back to the caller
    pub fn take_detector(&mut self) -> Option<ShotChangeDetector> {
        self.detector.take()
    }

    /// Sample `num_frames` frames from a segment file
    ///
    /// Slot `i` is read at `i*interval + interval/2` seconds into the file
    /// and stamped `start_time` plus that offset. Frames that cannot be
    /// decoded are replaced by black placeholders so the slot count and
    /// timestamps are always preserved.
    ///
    /// # Errors
    /// * `VideoNotFound` / `VideoOpenFailed` - The file is unreadable even after retrying
    #[instrument(skip(self))]
    pub fn extract_frames(&self, path: &str, start_time: f64, num_frames: usize, interval: f64) -> Result<Vec<TimedFrame>> {
        self.extract_window(path, 0.0, start_time, num_frames, interval)
    }

    /// Sample frames starting `seek_origin` seconds into the file, labelled from `label_origin`
    pub(crate) fn extract_window(
        &self,
        path: &str,
        seek_origin: f64,
        label_origin: f64,
        num_frames: usize,
        interval: f64,
    ) -> Result<Vec<TimedFrame>> {
        let mut stream = VideoStream::open_with_retry(path, &self.open_retry).map_err(|e| {
            error!("Cannot read video file {}: {}", path, e);
            e
        })?;

        debug!("Extracting {} frames from {} (interval {:.3}s)", num_frames, path, interval);

        let mut frames: Vec<TimedFrame> = Vec::with_capacity(num_frames);

        for i in 0..num_frames {
            let offset = slot_offset(i, interval);
            let timestamp = label_origin + offset;

            let decoded = match stream.read_at(seek_origin + offset) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Decode error at {:.2}s: {}", offset, e);
                    None
                }
            };

            match decoded {
                Some(frame) => frames.push(TimedFrame { frame, timestamp, placeholder: false }),
                None => {
                    warn!("Could not read frame at {:.1}s, using placeholder", offset);
                    let frame = black_like(frames.first().map(|f| &f.frame))?;
                    frames.push(TimedFrame { frame, timestamp, placeholder: true });
                }
            }
        }

        let placeholders = frames.iter().filter(|f| f.placeholder).count();
        debug!("Extracted {} frames ({} placeholders)", frames.len(), placeholders);

        Ok(frames)
    }

    /// Render a filmstrip and write it as JPEG
    ///
    /// Frames beyond the grid capacity are dropped. When requested and a
    /// detector is configured, the indices of frames that start a new shot
    /// are returned.
    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    pub fn create_filmstrip(&mut self, frames: &[TimedFrame], output_path: &Path, detect_shot_changes: bool) -> Result<Vec<usize>> {
        if frames.is_empty() {
            error!("No frames provided for filmstrip");
            return Ok(Vec::new());
        }

        let capacity = self.style.capacity();
        if frames.len() > capacity {
            warn!("{} frames exceed grid capacity {}, truncating", frames.len(), capacity);
        }
        let placed = &frames[..frames.len().min(capacity)];

        let mut shot_changes = Vec::new();
        if detect_shot_changes {
            if let Some(detector) = self.detector.as_mut() {
                let mats: Vec<Mat> = placed
                    .iter()
                    .map(|f| f.frame.try_clone())
                    .collect::<std::result::Result<_, _>>()?;
                shot_changes = detector.detect_batch_indices(&mats)?;
                info!("Found {} shot changes at frames: {:?}", shot_changes.len(), shot_changes);
            }
        }

        let canvas = self.render_grid(placed)?;
        write_jpeg(output_path, &canvas, self.style.jpeg_quality)?;

        info!("Filmstrip created: {}", output_path.display());
        debug!("Grid: {}x{}, Cell: {}x{}px",
               self.style.rows, self.style.cols, self.style.cell_width, self.style.cell_height);

        Ok(shot_changes)
    }

    /// Extract and render in one step
    pub fn create_filmstrip_from_video(
        &mut self,
        video_path: &str,
        output_path: &Path,
        start_time: f64,
        num_frames: usize,
        interval: f64,
        detect_shot_changes: bool,
    ) -> Result<Vec<usize>> {
        let frames = self.extract_frames(video_path, start_time, num_frames, interval)?;
        self.create_filmstrip(&frames, output_path, detect_shot_changes)
    }

    /// Compose the grid image in memory
    pub fn render_grid(&self, frames: &[TimedFrame]) -> Result<Mat> {
        let style = &self.style;
        let (width, height) = style.canvas_size();

        // Every pixel outside a cell or label strip is border
        let mut canvas = Mat::new_rows_cols_with_default(
            height as i32, width as i32, CV_8UC3, rgb(style.border_color)
        )?;

        let cell_size = Size::new(style.cell_width as i32, style.cell_height as i32);

        for (index, timed) in frames.iter().take(style.capacity()).enumerate() {
            let (x, y) = style.cell_origin(index);
            let (x, y) = (x as i32, y as i32);

            let mut resized = Mat::default();
            imgproc::resize(&timed.frame, &mut resized, cell_size, 0.0, 0.0, imgproc::INTER_AREA)
                .map_err(|e| FusionError::frame_error(index as u32, format!("Resize failed: {}", e)))?;

            {
                let mut cell = canvas.roi_mut(Rect::new(x, y, cell_size.width, cell_size.height))?;
                resized.copy_to(&mut *cell)?;
            }

            let label_y = y + cell_size.height;
            imgproc::rectangle(
                &mut canvas,
                Rect::new(x, label_y, cell_size.width, style.label_height as i32),
                rgb(style.label_bg_color),
                imgproc::FILLED,
                imgproc::LINE_8,
                0,
            )?;

            let row = index / style.cols as usize;
            let col = index % style.cols as usize;
            let label = cell_label(row, col, timed.timestamp);
            draw_centered_text(
                &mut canvas,
                &label,
                Rect::new(x, label_y, cell_size.width, style.label_height as i32),
                rgb(style.label_text_color),
            )?;
        }

        Ok(canvas)
    }
}

impl std::fmt::Debug for FilmstripProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilmstripProcessor")
            .field("style", &self.style)
            .field("detector", &self.detector)
            .finish()
    }
}

fn rgb(color: [u8; 3]) -> Scalar {
    Scalar::new(color[2] as f64, color[1] as f64, color[0] as f64, 0.0)
}

/// Black frame shaped like `reference`, or 640×480 when there is none
fn black_like(reference: Option<&Mat>) -> Result<Mat> {
    let (rows, cols, typ) = match reference {
        Some(m) if !m.empty() => (m.rows(), m.cols(), m.typ()),
        _ => (PLACEHOLDER_ROWS, PLACEHOLDER_COLS, CV_8UC3),
    };
    Ok(Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(0.0))?)
}

fn draw_centered_text(canvas: &mut Mat, text: &str, area: Rect, color: Scalar) -> Result<()> {
    let font = imgproc::FONT_HERSHEY_SIMPLEX;
    let thickness = 2;
    let mut baseline = 0;

    // Hershey simplex glyphs are ~22px tall at scale 1.0
    let mut scale = (area.height as f64 * 0.55) / 22.0;
    let mut size = imgproc::get_text_size(text, font, scale, thickness, &mut baseline)?;
    if size.width > area.width - 4 && size.width > 0 {
        scale *= (area.width - 4) as f64 / size.width as f64;
        size = imgproc::get_text_size(text, font, scale, thickness, &mut baseline)?;
    }

    let origin = Point::new(
        area.x + (area.width - size.width) / 2,
        area.y + (area.height + size.height) / 2,
    );

    imgproc::put_text(canvas, text, origin, font, scale, color, thickness, imgproc::LINE_AA, false)?;
    Ok(())
}

/// Write a BGR image as JPEG, creating parent directories
pub(crate) fn write_jpeg(path: &Path, image: &Mat, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality as i32]);
    let path_str = path.to_string_lossy();
    if !imgcodecs::imwrite(&path_str, image, &params)? {
        return Err(FusionError::internal_error(format!("Failed to write image {}", path_str)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Vec3b;

    fn solid(color_bgr: (u8, u8, u8)) -> Mat {
        Mat::new_rows_cols_with_default(
            90, 160, CV_8UC3,
            Scalar::new(color_bgr.0 as f64, color_bgr.1 as f64, color_bgr.2 as f64, 0.0)
        ).unwrap()
    }

    fn timed(n: usize) -> Vec<TimedFrame> {
        slot_timestamps(0.0, n, 1.0)
            .into_iter()
            .enumerate()
            .map(|(i, timestamp)| TimedFrame {
                frame: solid(if i < n / 2 { (0, 0, 255) } else { (255, 0, 0) }),
                timestamp,
                placeholder: false,
            })
            .collect()
    }

    fn small_style() -> FilmstripStyle {
        FilmstripStyle {
            rows: 2,
            cols: 3,
            cell_width: 64,
            cell_height: 36,
            border: 4,
            label_height: 16,
            ..FilmstripStyle::default()
        }
    }

    #[test]
    fn test_slot_timestamps() {
        assert_eq!(slot_timestamps(40.0, 4, 1.0), vec![40.5, 41.5, 42.5, 43.5]);
        let ts = slot_timestamps(10.0, 3, 2.5);
        assert_eq!(ts, vec![11.25, 13.75, 16.25]);
        assert!(slot_timestamps(0.0, 0, 1.0).is_empty());
    }

    #[test]
    fn test_style_geometry() {
        let style = FilmstripStyle::default();
        assert_eq!(style.capacity(), 20);
        assert_eq!(style.canvas_size(), (5 * 512 + 6 * 8, 4 * (512 + 40) + 5 * 8));
        assert_eq!(style.cell_origin(0), (8, 8));
        assert_eq!(style.cell_origin(6), (512 + 8 + 8, 512 + 40 + 8 + 8));
        assert_eq!(FilmstripStyle::visual().capacity(), 20);
        assert_eq!(FilmstripStyle::visual().cols, 4);
    }

    #[test]
    fn test_style_validation() {
        assert!(FilmstripStyle { rows: 0, ..FilmstripStyle::default() }.validate().is_err());
        assert!(FilmstripStyle { jpeg_quality: 0, ..FilmstripStyle::default() }.validate().is_err());
        assert!(FilmstripProcessor::new(FilmstripStyle { cell_width: 0, ..FilmstripStyle::default() }, None).is_err());
    }

    #[test]
    fn test_cell_label() {
        assert_eq!(cell_label(0, 0, 0.5), "[1x1] | 0.5s");
        assert_eq!(cell_label(3, 4, 79.46), "[4x5] | 79.5s");
    }

    #[test]
    fn test_render_grid_layout() {
        let processor = FilmstripProcessor::new(small_style(), None).unwrap();
        let canvas = processor.render_grid(&timed(6)).unwrap();

        let (w, h) = small_style().canvas_size();
        assert_eq!((canvas.cols() as u32, canvas.rows() as u32), (w, h));

        // Top-left corner is border (red in BGR)
        let corner = canvas.at_2d::<Vec3b>(0, 0).unwrap();
        assert_eq!((corner[0], corner[1], corner[2]), (0, 0, 255));

        // Centre of the first cell is the first frame's colour
        let (x, y) = small_style().cell_origin(0);
        let px = canvas.at_2d::<Vec3b>(y as i32 + 18, x as i32 + 32).unwrap();
        assert_eq!((px[0], px[1], px[2]), (0, 0, 255));

        // Centre of the last cell is the second colour
        let (x, y) = small_style().cell_origin(5);
        let px = canvas.at_2d::<Vec3b>(y as i32 + 18, x as i32 + 32).unwrap();
        assert_eq!((px[0], px[1], px[2]), (255, 0, 0));
    }

    #[test]
    fn test_create_filmstrip_truncates_and_detects() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("filmstrips").join("filmstrip_0000_2x3.jpg");

        let mut processor = FilmstripProcessor::new(small_style(), Some(ShotChangeDetector::visual(0.7))).unwrap();
        // 8 frames into a 6-cell grid: colour switches at index 4
        let shots = processor.create_filmstrip(&timed(8), &output, true).unwrap();

        assert!(output.exists());
        assert_eq!(shots, vec![4]);

        let written = imgcodecs::imread(&output.to_string_lossy(), imgcodecs::IMREAD_COLOR).unwrap();
        let (w, h) = small_style().canvas_size();
        assert_eq!((written.cols() as u32, written.rows() as u32), (w, h));
    }

    #[test]
    fn test_create_filmstrip_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("empty.jpg");
        let mut processor = FilmstripProcessor::fusion(0.7).unwrap();

        assert!(processor.create_filmstrip(&[], &output, true).unwrap().is_empty());
        assert!(!output.exists());
    }

    #[test]
    fn test_detection_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("no_detect.jpg");
        let mut processor = FilmstripProcessor::new(small_style(), Some(ShotChangeDetector::visual(0.7))).unwrap();

        assert!(processor.create_filmstrip(&timed(6), &output, false).unwrap().is_empty());
        assert!(output.exists());
    }

    #[test]
    fn test_placeholder_shapes() {
        let default = black_like(None).unwrap();
        assert_eq!((default.rows(), default.cols()), (480, 640));

        let reference = solid((1, 2, 3));
        let shaped = black_like(Some(&reference)).unwrap();
        assert_eq!((shaped.rows(), shaped.cols()), (90, 160));
    }

    /// Write a `seconds` long MJPEG clip: red for the first half, blue after
    fn write_clip(path: &Path, seconds: u32, fps: u32) {
        use opencv::videoio::VideoWriter;

        let fourcc = VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
        let mut writer = VideoWriter::new(&path.to_string_lossy(), fourcc, fps as f64, Size::new(160, 90), true).unwrap();
        assert!(writer.is_opened().unwrap());

        let total = seconds * fps;
        for i in 0..total {
            let frame = if i < total / 2 { solid((0, 0, 255)) } else { solid((255, 0, 0)) };
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();
    }

    fn mean_intensity(frame: &Mat) -> f64 {
        let mean = core::mean(frame, &core::no_array()).unwrap();
        (mean[0] + mean[1] + mean[2]) / 3.0
    }

    #[test]
    fn test_extract_and_render_real_clip() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("chunk_0002_4s.avi");
        write_clip(&clip, 4, 10);

        let mut processor = FilmstripProcessor::new(small_style(), Some(ShotChangeDetector::visual(0.7)))
            .unwrap()
            .with_open_retry(RetryPolicy::none());

        // 8 slots of 1s over a 4s clip: the last 4 slots are past the end
        let frames = processor.extract_frames(&clip.to_string_lossy(), 40.0, 8, 1.0).unwrap();
        assert_eq!(frames.len(), 8);

        let timestamps: Vec<f64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, slot_timestamps(40.0, 8, 1.0));

        for frame in &frames[..4] {
            assert!(!frame.placeholder);
            assert!(mean_intensity(&frame.frame) > 20.0);
        }
        for frame in &frames[4..] {
            assert!(frame.placeholder);
            assert_eq!((frame.frame.rows(), frame.frame.cols()), (90, 160));
            assert_eq!(mean_intensity(&frame.frame), 0.0);
        }

        // Colour switch between slots 1 and 2, and the grid keeps only 6 cells
        let output = dir.path().join("filmstrip_0002_2x3.jpg");
        let shots = processor.create_filmstrip(&frames, &output, true).unwrap();
        assert!(shots.contains(&2));
        assert!(shots.iter().all(|&i| i < small_style().capacity()));

        let written = imgcodecs::imread(&output.to_string_lossy(), imgcodecs::IMREAD_COLOR).unwrap();
        let (w, h) = small_style().canvas_size();
        assert_eq!((written.cols() as u32, written.rows() as u32), (w, h));
    }

    #[test]
    fn test_extract_from_missing_file() {
        let processor = FilmstripProcessor::fusion(0.7)
            .unwrap()
            .with_open_retry(RetryPolicy::none());
        let result = processor.extract_frames("no_such_chunk.mp4", 0.0, 20, 1.0);
        assert!(matches!(result, Err(FusionError::VideoNotFound { .. })));
    }
}
