//! AdaptiveFilmstripProcessor - grid layout under size and count limits
//!
//! Given a video's duration, frame rate and resolution, picks how many
//! frames go into each grid image, how densely the video must be sampled
//! to stay within a maximum number of grids, and the cell size that keeps
//! every grid inside the maximum image dimensions. An optional file size
//! budget shrinks cells further using a bits-per-pixel JPEG estimate.
//!
//! The layout math is pure and deterministic; only
//! [`AdaptiveFilmstripProcessor::create_adaptive_filmstrips`] touches video.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};
use crate::common::{FusionError, Result};
use crate::filmstrip::{grid_canvas_size, FilmstripProcessor, FilmstripStyle};
use crate::shot_detector::ShotChangeDetector;
use crate::video_stream::VideoStream;

/// Largest row or column count tried by the grid search
const MAX_SEARCH_DIM: u32 = 20;

/// Cells smaller than this (in either dimension) are not considered
const MIN_CELL_SIZE: u32 = 100;

const FALLBACK_ROWS: u32 = 4;
const FALLBACK_COLS: u32 = 5;
const FALLBACK_CELL: u32 = 512;

/// Constraints for adaptive grid generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Maximum grid image size as (width, height)
    pub max_grid_size: (u32, u32),
    /// Maximum number of grid images for the whole span
    pub max_grid_images: u32,
    /// Cells use the exact source resolution
    pub preserve_source_resolution: bool,
    /// Use this (rows, cols) instead of searching
    pub fixed_grid_layout: Option<(u32, u32)>,
    /// Shrink cells so the estimated JPEG stays under this size
    pub max_file_size_mb: Option<f64>,
    /// Border, label and colour settings (rows, cols and cell size are computed)
    pub style: FilmstripStyle,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_grid_size: (8000, 8000),
            max_grid_images: 20,
            preserve_source_resolution: false,
            fixed_grid_layout: None,
            max_file_size_mb: None,
            style: FilmstripStyle::default(),
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_grid_images == 0 {
            return Err(FusionError::config_error("max_grid_images must be at least 1"));
        }
        if self.max_grid_size.0 == 0 || self.max_grid_size.1 == 0 {
            return Err(FusionError::config_error("max_grid_size must be non-zero"));
        }
        if let Some((rows, cols)) = self.fixed_grid_layout {
            if rows == 0 || cols == 0 {
                return Err(FusionError::config_error("fixed_grid_layout must have at least one row and column"));
            }
        }
        if let Some(mb) = self.max_file_size_mb {
            if !(mb > 0.0) {
                return Err(FusionError::config_error(format!("max_file_size_mb must be positive, got {}", mb)));
            }
        }
        Ok(())
    }
}

/// Computed extraction and grid parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridLayout {
    pub total_frames: u64,
    pub frames_per_grid: u32,
    pub grid_rows: u32,
    pub grid_cols: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    pub num_grids_needed: u32,
    /// 1 = every frame, n = every n-th frame
    pub sampling_rate: u64,
    pub frames_to_extract: u64,
    /// Seconds between extracted frames
    pub extraction_interval: f64,
    pub max_frames_capacity: u64,
}

/// Shot change located inside one grid
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotSegment {
    pub frame_index: usize,
    pub global_frame_index: usize,
    /// 1-based
    pub row: usize,
    /// 1-based
    pub col: usize,
    pub timestamp: f64,
}

/// Output of one grid image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridOutput {
    pub grid_index: usize,
    pub output_file: PathBuf,
    pub shot_changes: Vec<usize>,
    pub shot_segments: Vec<ShotSegment>,
    /// Inclusive range of global frame indices in this grid
    pub frame_range: (usize, usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveResult {
    pub layout: GridLayout,
    pub output_files: Vec<PathBuf>,
    pub grids: Vec<GridOutput>,
}

/// Per-run options for [`AdaptiveFilmstripProcessor::create_adaptive_filmstrips`]
///
/// Source properties left as `None` are read from the video.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveRun {
    pub video_duration: Option<f64>,
    pub source_fps: Option<f64>,
    pub source_resolution: Option<(u32, u32)>,
    pub detect_shot_changes: bool,
    pub start_time: f64,
    pub process_duration: Option<f64>,
}

impl Default for AdaptiveRun {
    fn default() -> Self {
        Self {
            video_duration: None,
            source_fps: None,
            source_resolution: None,
            detect_shot_changes: true,
            start_time: 0.0,
            process_duration: None,
        }
    }
}

/// Estimated JPEG size in MB for an image of the given size
pub fn estimate_file_size_mb(width: u32, height: u32, quality: u8) -> f64 {
    let bits_per_pixel = if quality >= 90 {
        2.8
    } else if quality >= 80 {
        2.0
    } else {
        1.5
    };
    (width as f64 * height as f64 * bits_per_pixel) / (8.0 * 1024.0 * 1024.0)
}

/// Cell geometry chosen for a grid: (cell_width, cell_height, rows, cols)
type CellLayout = (u32, u32, u32, u32);

/// Adaptive filmstrip generator
pub struct AdaptiveFilmstripProcessor {
    config: AdaptiveConfig,
    detector: Option<ShotChangeDetector>,
}

impl AdaptiveFilmstripProcessor {
    pub fn new(config: AdaptiveConfig, detector: Option<ShotChangeDetector>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Compute the frame budget and grid layout for a span of video
    ///
    /// # Arguments
    /// * `video_duration` - Seconds to cover
    /// * `source_fps` - Source frame rate
    /// * `source_resolution` - Source (width, height)
    ///
    /// # Errors
    /// * `InvalidConfig` - Zero source resolution, or a maximum grid size
    ///   too small for even a one-pixel fallback cell
    pub fn calculate_optimal_layout(&self, video_duration: f64, source_fps: f64, source_resolution: (u32, u32)) -> Result<GridLayout> {
        let (source_width, source_height) = source_resolution;
        if source_width == 0 || source_height == 0 {
            return Err(FusionError::config_error(format!(
                "Source resolution must be non-zero, got {}x{}",
                source_width, source_height
            )));
        }

        let total_frames = (video_duration.max(0.0) * source_fps.max(0.0)).floor() as u64;
        debug!("Video: {:.1}s @ {} fps, {}x{}, {} frames",
               video_duration, source_fps, source_width, source_height, total_frames);

        let aspect_ratio = source_width as f64 / source_height as f64;
        let (cell_width, cell_height, grid_rows, grid_cols) = self.grid_dimensions(aspect_ratio, source_resolution)?;

        let frames_per_grid = grid_rows * grid_cols;
        let max_frames_capacity = frames_per_grid as u64 * self.config.max_grid_images as u64;

        let (sampling_rate, frames_to_extract) = if total_frames <= max_frames_capacity {
            (1, total_frames)
        } else {
            let rate = total_frames.div_ceil(max_frames_capacity);
            (rate, total_frames.div_ceil(rate))
        };
        let num_grids_needed = frames_to_extract.div_ceil(frames_per_grid as u64) as u32;

        let extraction_interval = if frames_to_extract > 0 {
            video_duration / frames_to_extract as f64
        } else {
            1.0
        };

        let layout = GridLayout {
            total_frames,
            frames_per_grid,
            grid_rows,
            grid_cols,
            cell_width,
            cell_height,
            num_grids_needed,
            sampling_rate,
            frames_to_extract,
            extraction_interval,
            max_frames_capacity,
        };

        debug!("Layout: {}x{} grid ({} frames/grid), cell {}x{}px, {}/{} grids, sampling every {} frames, interval {:.3}s",
               grid_rows, grid_cols, frames_per_grid, cell_width, cell_height,
               num_grids_needed, self.config.max_grid_images, sampling_rate, extraction_interval);

        Ok(layout)
    }

    fn grid_dimensions(&self, aspect_ratio: f64, source_resolution: (u32, u32)) -> Result<CellLayout> {
        let chosen = if let Some((rows, cols)) = self.config.fixed_grid_layout {
            debug!("Using fixed grid layout: {}x{}", rows, cols);
            let cell = if self.config.preserve_source_resolution {
                Some(source_resolution)
            } else {
                self.fitted_cell(rows, cols, aspect_ratio)
            };
            cell.map(|(w, h)| (w, h, rows, cols))
                .filter(|&(w, h, r, c)| self.fits(r, c, w, h))
        } else if self.config.preserve_source_resolution {
            self.preserved_layout(source_resolution)
        } else {
            self.search_layout(aspect_ratio)
        };

        let (cell_width, cell_height, rows, cols) = match chosen {
            Some(layout) => layout,
            None => {
                warn!("No layout fits {}x{}, using fallback",
                      self.config.max_grid_size.0, self.config.max_grid_size.1);
                self.fallback_layout()?
            }
        };

        let (cell_width, cell_height) = match self.config.max_file_size_mb {
            Some(limit) => self.apply_file_size_constraint(cell_width, cell_height, rows, cols, aspect_ratio, limit),
            None => (cell_width, cell_height),
        };

        Ok((cell_width, cell_height, rows, cols))
    }

    fn fits(&self, rows: u32, cols: u32, cell_width: u32, cell_height: u32) -> bool {
        let (width, height) = self.canvas(rows, cols, cell_width, cell_height);
        cell_width > 0 && cell_height > 0
            && width <= self.config.max_grid_size.0
            && height <= self.config.max_grid_size.1
    }

    fn canvas(&self, rows: u32, cols: u32, cell_width: u32, cell_height: u32) -> (u32, u32) {
        let style = &self.config.style;
        grid_canvas_size(rows, cols, cell_width, cell_height, style.border, style.label_height)
    }

    /// Largest cell for the layout, before aspect-ratio fitting
    fn available_cell(&self, rows: u32, cols: u32) -> Option<(u32, u32)> {
        let style = &self.config.style;
        let (max_w, max_h) = (self.config.max_grid_size.0 as i64, self.config.max_grid_size.1 as i64);
        let border = style.border as i64;
        let label = style.label_height as i64;

        let available_width = max_w - (cols as i64 + 1) * border;
        let available_height = max_h - (rows as i64 + 1) * border - rows as i64 * label;
        if available_width <= 0 || available_height <= 0 {
            return None;
        }
        Some(((available_width / cols as i64) as u32, (available_height / rows as i64) as u32))
    }

    /// Shrink one side of the available cell to the source aspect ratio
    fn fit_aspect(cell_width: u32, cell_height: u32, aspect_ratio: f64) -> (u32, u32) {
        if cell_height == 0 {
            return (cell_width, 0);
        }
        if cell_width as f64 / cell_height as f64 > aspect_ratio {
            ((cell_height as f64 * aspect_ratio) as u32, cell_height)
        } else {
            (cell_width, (cell_width as f64 / aspect_ratio) as u32)
        }
    }

    fn fitted_cell(&self, rows: u32, cols: u32, aspect_ratio: f64) -> Option<(u32, u32)> {
        let (w, h) = self.available_cell(rows, cols)?;
        let (w, h) = Self::fit_aspect(w, h, aspect_ratio);
        (w > 0 && h > 0).then_some((w, h))
    }

    fn preserved_layout(&self, source_resolution: (u32, u32)) -> Option<CellLayout> {
        let (cell_width, cell_height) = source_resolution;
        let style = &self.config.style;
        let (max_w, max_h) = self.config.max_grid_size;

        let max_cols = max_w.saturating_sub(style.border) / (cell_width + style.border);
        let max_rows = max_h.saturating_sub(style.border) / (cell_height + style.label_height + style.border);

        if max_cols < 1 || max_rows < 1 {
            warn!("Source resolution {}x{} too large for grid", cell_width, cell_height);
            return None;
        }

        debug!("Preserving source resolution: {}x{} grid of {}x{}px", max_rows, max_cols, cell_width, cell_height);
        Some((cell_width, cell_height, max_rows, max_cols))
    }

    /// Try every layout up to 20×20 and keep the one holding the most frames
    fn search_layout(&self, aspect_ratio: f64) -> Option<CellLayout> {
        let mut best: Option<CellLayout> = None;
        let mut max_frames = 0;

        for rows in 1..=MAX_SEARCH_DIM {
            for cols in 1..=MAX_SEARCH_DIM {
                let Some((w, h)) = self.available_cell(rows, cols) else { continue };
                if w < MIN_CELL_SIZE || h < MIN_CELL_SIZE {
                    continue;
                }

                let (w, h) = Self::fit_aspect(w, h, aspect_ratio);
                if self.fits(rows, cols, w, h) && rows * cols > max_frames {
                    max_frames = rows * cols;
                    best = Some((w, h, rows, cols));
                }
            }
        }

        best
    }

    /// 4×5 at 512px, shrunk until it fits the maximum grid size
    fn fallback_layout(&self) -> Result<CellLayout> {
        let (w, h) = self
            .available_cell(FALLBACK_ROWS, FALLBACK_COLS)
            .ok_or_else(|| FusionError::config_error("max_grid_size is too small for any grid"))?;

        let cell = FALLBACK_CELL.min(w).min(h);
        if cell == 0 {
            return Err(FusionError::config_error("max_grid_size is too small for any grid"));
        }
        Ok((cell, cell, FALLBACK_ROWS, FALLBACK_COLS))
    }

    fn apply_file_size_constraint(
        &self,
        cell_width: u32,
        cell_height: u32,
        rows: u32,
        cols: u32,
        aspect_ratio: f64,
        limit_mb: f64,
    ) -> (u32, u32) {
        let quality = self.config.style.jpeg_quality;
        let (width, height) = self.canvas(rows, cols, cell_width, cell_height);
        let current_mb = estimate_file_size_mb(width, height, quality);

        if current_mb <= limit_mb {
            debug!("Estimated {:.2}MB within {:.2}MB limit", current_mb, limit_mb);
            return (cell_width, cell_height);
        }

        let scale = (limit_mb / current_mb).sqrt();
        let mut new_width = (cell_width as f64 * scale) as u32;
        let mut new_height = (cell_height as f64 * scale) as u32;

        if new_width < MIN_CELL_SIZE || new_height < MIN_CELL_SIZE {
            warn!("Downscaling would make cells too small ({}x{}px), using minimum cell size", new_width, new_height);
            new_width = ((MIN_CELL_SIZE as f64 * aspect_ratio) as u32).min(cell_width).max(1);
            new_height = MIN_CELL_SIZE.min(cell_height).max(1);
        }

        let (new_total_w, new_total_h) = self.canvas(rows, cols, new_width, new_height);
        debug!("Downscaled cells {}x{} -> {}x{} (scale {:.3}), {:.2}MB -> {:.2}MB",
               cell_width, cell_height, new_width, new_height, scale,
               current_mb, estimate_file_size_mb(new_total_w, new_total_h, quality));

        (new_width, new_height)
    }

    /// Cover a video (or a span of it) with as few grids as the layout allows
    ///
    /// Grid `n` is written to `{output_prefix}_{n:04d}.jpg`.
    ///
    /// # Errors
    /// * `VideoNotFound` / `VideoOpenFailed` - The video cannot be read
    #[instrument(skip(self, run))]
    pub fn create_adaptive_filmstrips(&mut self, video_path: &str, output_prefix: &str, run: &AdaptiveRun) -> Result<AdaptiveResult> {
        info!("Creating adaptive filmstrips from {}", video_path);

        let (fps, resolution, full_duration) = {
            let stream = VideoStream::open(video_path)?;
            let fps = run.source_fps.unwrap_or(stream.fps());
            let resolution = run
                .source_resolution
                .unwrap_or((stream.width().max(0) as u32, stream.height().max(0) as u32));
            let duration = run.video_duration.unwrap_or_else(|| stream.frame_count() as f64 / fps.max(f64::EPSILON));
            (fps, resolution, duration)
        };

        let start_time = run.start_time.max(0.0);
        let span = match run.process_duration {
            Some(limit) => limit.min(full_duration - start_time),
            None => full_duration - start_time,
        }
        .max(0.0);
        info!("Processing {:.1}s from {:.1}s (total video: {:.1}s)", span, start_time, full_duration);

        let layout = self.calculate_optimal_layout(span, fps, resolution)?;

        let style = FilmstripStyle {
            rows: layout.grid_rows,
            cols: layout.grid_cols,
            cell_width: layout.cell_width,
            cell_height: layout.cell_height,
            ..self.config.style.clone()
        };
        let mut processor = FilmstripProcessor::new(style, self.detector.take())?;

        let outcome = Self::render_grids(&mut processor, video_path, output_prefix, &layout, start_time, run.detect_shot_changes);
        self.detector = processor.take_detector();
        let grids = outcome?;
        let output_files: Vec<PathBuf> = grids.iter().map(|g| g.output_file.clone()).collect();

        info!("Created {} filmstrip grids", output_files.len());

        Ok(AdaptiveResult {
            layout,
            output_files,
            grids,
        })
    }

    fn render_grids(
        processor: &mut FilmstripProcessor,
        video_path: &str,
        output_prefix: &str,
        layout: &GridLayout,
        start_time: f64,
        detect_shot_changes: bool,
    ) -> Result<Vec<GridOutput>> {
        let per_grid = layout.frames_per_grid as usize;
        let total = layout.frames_to_extract as usize;
        let interval = layout.extraction_interval;
        let mut grids = Vec::new();

        for grid_index in 0..layout.num_grids_needed as usize {
            let start_idx = grid_index * per_grid;
            let count = per_grid.min(total.saturating_sub(start_idx));
            if count == 0 {
                break;
            }

            // Only one grid's worth of frames is decoded at a time
            let origin = start_time + start_idx as f64 * interval;
            let frames = processor.extract_window(video_path, origin, origin, count, interval)?;

            let output_file = PathBuf::from(format!("{}_{:04}.jpg", output_prefix, grid_index));
            info!("Creating grid {}/{}", grid_index + 1, layout.num_grids_needed);
            let shot_changes = processor.create_filmstrip(&frames, &output_file, detect_shot_changes)?;

            let shot_segments = shot_changes
                .iter()
                .filter_map(|&idx| {
                    frames.get(idx).map(|f| ShotSegment {
                        frame_index: idx,
                        global_frame_index: start_idx + idx,
                        row: idx / layout.grid_cols as usize + 1,
                        col: idx % layout.grid_cols as usize + 1,
                        timestamp: f.timestamp,
                    })
                })
                .collect();

            grids.push(GridOutput {
                grid_index,
                output_file,
                shot_changes,
                shot_segments,
                frame_range: (start_idx, start_idx + frames.len() - 1),
            });
        }

        Ok(grids)
    }
}

impl std::fmt::Debug for AdaptiveFilmstripProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveFilmstripProcessor")
            .field("config", &self.config)
            .field("detector", &self.detector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(config: AdaptiveConfig) -> AdaptiveFilmstripProcessor {
        AdaptiveFilmstripProcessor::new(config, None).unwrap()
    }

    fn assert_within_bounds(config: &AdaptiveConfig, layout: &GridLayout) {
        let style = &config.style;
        let width = layout.grid_cols * layout.cell_width + (layout.grid_cols + 1) * style.border;
        let height = layout.grid_rows * (layout.cell_height + style.label_height) + (layout.grid_rows + 1) * style.border;
        assert!(width <= config.max_grid_size.0, "width {} > {}: {:?}", width, config.max_grid_size.0, layout);
        assert!(height <= config.max_grid_size.1, "height {} > {}: {:?}", height, config.max_grid_size.1, layout);
        assert!(layout.num_grids_needed <= config.max_grid_images, "{:?}", layout);
        assert!(layout.cell_width > 0 && layout.cell_height > 0);
    }

    #[test]
    fn test_layout_bounds_across_inputs() {
        let sizes = [(8000, 8000), (4000, 3000), (1920, 1080), (700, 700), (300, 2000)];
        let resolutions = [(1920, 1080), (1280, 720), (640, 480), (1080, 1920), (3840, 2160)];
        let durations = [0.0, 1.0, 20.0, 600.0, 7200.0];

        for &max_grid_size in &sizes {
            for &resolution in &resolutions {
                for &duration in &durations {
                    for preserve in [false, true] {
                        let config = AdaptiveConfig {
                            max_grid_size,
                            max_grid_images: 7,
                            preserve_source_resolution: preserve,
                            ..AdaptiveConfig::default()
                        };
                        let layout = processor(config.clone())
                            .calculate_optimal_layout(duration, 29.97, resolution)
                            .unwrap();
                        assert_within_bounds(&config, &layout);
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_sampling_when_everything_fits() {
        let p = processor(AdaptiveConfig::default());
        let layout = p.calculate_optimal_layout(10.0, 30.0, (1920, 1080)).unwrap();

        assert_eq!(layout.total_frames, 300);
        assert_eq!(layout.sampling_rate, 1);
        assert_eq!(layout.frames_to_extract, 300);
        assert!((layout.extraction_interval - 10.0 / 300.0).abs() < 1e-9);
        assert_eq!(
            layout.num_grids_needed as u64,
            300u64.div_ceil(layout.frames_per_grid as u64)
        );
    }

    #[test]
    fn test_sampling_when_capacity_exceeded() {
        let config = AdaptiveConfig {
            fixed_grid_layout: Some((4, 5)),
            max_grid_images: 2,
            ..AdaptiveConfig::default()
        };
        let layout = processor(config).calculate_optimal_layout(60.0, 25.0, (1280, 720)).unwrap();

        // 1500 frames into 40 slots
        assert_eq!(layout.total_frames, 1500);
        assert_eq!(layout.max_frames_capacity, 40);
        assert_eq!(layout.sampling_rate, 38);
        assert_eq!(layout.frames_to_extract, 40);
        assert_eq!(layout.num_grids_needed, 2);
        assert!((layout.extraction_interval - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_video() {
        let layout = processor(AdaptiveConfig::default())
            .calculate_optimal_layout(0.0, 30.0, (640, 480))
            .unwrap();
        assert_eq!(layout.frames_to_extract, 0);
        assert_eq!(layout.num_grids_needed, 0);
        assert_eq!(layout.extraction_interval, 1.0);
    }

    #[test]
    fn test_search_keeps_aspect_ratio() {
        let layout = processor(AdaptiveConfig::default())
            .calculate_optimal_layout(10.0, 30.0, (1920, 1080))
            .unwrap();
        let ratio = layout.cell_width as f64 / layout.cell_height as f64;
        assert!((ratio - 16.0 / 9.0).abs() < 0.05, "ratio {}", ratio);
        assert!(layout.cell_width >= MIN_CELL_SIZE || layout.cell_height >= MIN_CELL_SIZE);
    }

    #[test]
    fn test_preserve_source_resolution() {
        let config = AdaptiveConfig {
            preserve_source_resolution: true,
            ..AdaptiveConfig::default()
        };
        let layout = processor(config).calculate_optimal_layout(10.0, 30.0, (1920, 1080)).unwrap();

        assert_eq!((layout.cell_width, layout.cell_height), (1920, 1080));
        assert_eq!(layout.grid_cols, (8000 - 8) / (1920 + 8));
        assert_eq!(layout.grid_rows, (8000 - 8) / (1080 + 40 + 8));
    }

    #[test]
    fn test_oversized_source_uses_fallback() {
        let config = AdaptiveConfig {
            max_grid_size: (1000, 1000),
            preserve_source_resolution: true,
            ..AdaptiveConfig::default()
        };
        let layout = processor(config.clone()).calculate_optimal_layout(10.0, 30.0, (3840, 2160)).unwrap();

        assert_eq!((layout.grid_rows, layout.grid_cols), (FALLBACK_ROWS, FALLBACK_COLS));
        assert_within_bounds(&config, &layout);
    }

    #[test]
    fn test_fixed_layout() {
        let config = AdaptiveConfig {
            fixed_grid_layout: Some((3, 4)),
            ..AdaptiveConfig::default()
        };
        let layout = processor(config.clone()).calculate_optimal_layout(30.0, 30.0, (1280, 720)).unwrap();
        assert_eq!((layout.grid_rows, layout.grid_cols), (3, 4));
        assert_within_bounds(&config, &layout);

        // Source-resolution cells that cannot fit fall back
        let config = AdaptiveConfig {
            fixed_grid_layout: Some((3, 4)),
            preserve_source_resolution: true,
            max_grid_size: (4000, 4000),
            ..AdaptiveConfig::default()
        };
        let layout = processor(config.clone()).calculate_optimal_layout(30.0, 30.0, (1920, 1080)).unwrap();
        assert_eq!((layout.grid_rows, layout.grid_cols), (FALLBACK_ROWS, FALLBACK_COLS));
        assert_within_bounds(&config, &layout);
    }

    #[test]
    fn test_file_size_constraint_shrinks_cells() {
        let unconstrained = processor(AdaptiveConfig {
            fixed_grid_layout: Some((4, 5)),
            ..AdaptiveConfig::default()
        })
        .calculate_optimal_layout(20.0, 30.0, (1280, 720))
        .unwrap();

        let config = AdaptiveConfig {
            fixed_grid_layout: Some((4, 5)),
            max_file_size_mb: Some(3.0),
            ..AdaptiveConfig::default()
        };
        let constrained = processor(config.clone()).calculate_optimal_layout(20.0, 30.0, (1280, 720)).unwrap();

        assert!(constrained.cell_width < unconstrained.cell_width);
        assert!(constrained.cell_height < unconstrained.cell_height);
        assert_within_bounds(&config, &constrained);

        let (w, h) = grid_canvas_size(4, 5, constrained.cell_width, constrained.cell_height, 8, 40);
        assert!(estimate_file_size_mb(w, h, 95) <= 3.0 * 1.1);
    }

    #[test]
    fn test_file_size_floor() {
        let config = AdaptiveConfig {
            fixed_grid_layout: Some((4, 5)),
            max_file_size_mb: Some(0.01),
            ..AdaptiveConfig::default()
        };
        let layout = processor(config.clone()).calculate_optimal_layout(20.0, 30.0, (1280, 720)).unwrap();
        assert_eq!(layout.cell_height, MIN_CELL_SIZE);
        assert_eq!(layout.cell_width, (MIN_CELL_SIZE as f64 * 1280.0 / 720.0) as u32);
        assert_within_bounds(&config, &layout);
    }

    #[test]
    fn test_estimate_file_size_tiers() {
        // 1Mi pixels at 2.8 bits each
        assert!((estimate_file_size_mb(1024, 1024, 95) - 0.35).abs() < 1e-9);
        assert!(estimate_file_size_mb(1000, 1000, 95) > estimate_file_size_mb(1000, 1000, 85));
        assert!(estimate_file_size_mb(1000, 1000, 85) > estimate_file_size_mb(1000, 1000, 50));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(AdaptiveFilmstripProcessor::new(AdaptiveConfig { max_grid_images: 0, ..AdaptiveConfig::default() }, None).is_err());
        assert!(processor(AdaptiveConfig::default()).calculate_optimal_layout(10.0, 30.0, (0, 480)).is_err());

        let tiny = processor(AdaptiveConfig { max_grid_size: (20, 20), ..AdaptiveConfig::default() });
        assert!(matches!(
            tiny.calculate_optimal_layout(10.0, 30.0, (640, 480)),
            Err(FusionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_missing_video() {
        let mut p = processor(AdaptiveConfig::default());
        let result = p.create_adaptive_filmstrips("missing.mp4", "/tmp/strip", &AdaptiveRun::default());
        assert!(matches!(result, Err(FusionError::VideoNotFound { .. })));
    }
}
