//! Per-chunk acoustic features
//!
//! A handful of cheap descriptors (tempo, spectral centroid, RMS energy,
//! zero crossing rate) computed from the chunk's audio track and rendered
//! as text for the model request.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use crate::common::Result;
use crate::ffmpeg::FfmpegCommand;

/// Tempo search range in BPM
const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 200.0;

/// Prior centre for tempo estimation
const PRIOR_BPM: f64 = 120.0;

/// Summary descriptors for one chunk's audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    /// Beats per minute, 0 when no periodicity was found
    pub tempo: f64,
    /// Hz
    pub spectral_centroid_mean: f64,
    pub rms_mean: f64,
    pub zero_crossing_rate_mean: f64,
    /// Seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AudioFeatures {
    /// Plain-language characterisation of brightness and loudness
    pub fn describe(&self) -> String {
        let brightness = if self.spectral_centroid_mean > 3000.0 {
            "High-frequency content (bright/sharp audio)"
        } else if self.spectral_centroid_mean > 1500.0 {
            "Mid-frequency content (typical speech)"
        } else {
            "Low-frequency content (deep/bass-heavy audio)"
        };

        let energy = if self.rms_mean > 0.1 {
            "High energy audio (loud/dynamic)"
        } else if self.rms_mean > 0.05 {
            "Moderate energy audio (normal speech levels)"
        } else {
            "Low energy audio (quiet/whispered)"
        };

        format!("{}, {}", brightness, energy)
    }

    /// Text block appended to the model request
    pub fn request_text(&self) -> String {
        let description = self.description.clone().unwrap_or_else(|| self.describe());
        let delivery = if self.spectral_centroid_mean > 2000.0 { "High energy/animated" } else { "Calm/conversational" };
        let style = if self.rms_mean > 0.1 { "Dynamic/emphatic" } else { "Steady/measured" };
        let pacing = if self.tempo > 120.0 { "Rapid/urgent" } else { "Deliberate/thoughtful" };

        format!(
            "\n\nAUDIO SPECTROGRAM ANALYSIS:\n\
             Duration: {:.1} seconds\n\
             Tempo: {:.1} BPM\n\
             Spectral Centroid: {:.1} Hz\n\
             RMS Energy: {:.4}\n\
             Zero Crossing Rate: {:.4}\n\
             Audio Characteristics: {}\n\n\
             AUDIO INSIGHTS FOR CONTENT ANALYSIS:\n\
             - Spectral Centroid ({:.1} Hz): {} delivery\n\
             - RMS Energy ({:.4}): {} speaking style\n\
             - Tempo ({:.1} BPM): {} pacing\n\n",
            self.duration,
            self.tempo,
            self.spectral_centroid_mean,
            self.rms_mean,
            self.zero_crossing_rate_mean,
            description,
            self.spectral_centroid_mean,
            delivery,
            self.rms_mean,
            style,
            self.tempo,
            pacing,
        )
    }
}

/// Anything that can produce acoustic features for a chunk file
pub trait AudioFeatureSource: Send {
    fn analyze(&self, path: &Path) -> Result<AudioFeatures>;
}

/// Decodes audio with ffmpeg and computes features frame by frame
#[derive(Debug, Clone)]
pub struct AudioAnalyzer {
    sample_rate: u32,
    frame_length: usize,
    hop_length: usize,
    decode_timeout: Duration,
}

impl Default for AudioAnalyzer {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_length: 2048,
            hop_length: 512,
            decode_timeout: Duration::from_secs(30),
        }
    }
}

impl AudioAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Decode the first audio track to mono f32 samples
    pub fn decode(&self, path: &Path) -> Result<Vec<f32>> {
        let bytes = FfmpegCommand::new(path.to_string_lossy(), "pipe:1")
            .output_args(["-vn", "-ac", "1", "-ar"])
            .output_arg(self.sample_rate.to_string())
            .output_args(["-f", "f32le"])
            .run_to_stdout(Some(self.decode_timeout))?;

        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Compute features from mono samples
    pub fn features_from_samples(&self, samples: &[f32]) -> AudioFeatures {
        let sr = self.sample_rate as f64;
        let duration = samples.len() as f64 / sr;

        let frames = self.frames(samples);
        if frames.is_empty() {
            return AudioFeatures {
                tempo: 0.0,
                spectral_centroid_mean: 0.0,
                rms_mean: 0.0,
                zero_crossing_rate_mean: 0.0,
                duration,
                description: None,
            };
        }

        let rms: Vec<f64> = frames.iter().map(|f| frame_rms(f)).collect();
        let zcr: Vec<f64> = frames.iter().map(|f| frame_zcr(f)).collect();
        let centroids = self.spectral_centroids(&frames);

        let tempo = self.estimate_tempo(&rms);

        AudioFeatures {
            tempo,
            spectral_centroid_mean: mean(&centroids),
            rms_mean: mean(&rms),
            zero_crossing_rate_mean: mean(&zcr),
            duration,
            description: None,
        }
    }

    fn frames<'a>(&self, samples: &'a [f32]) -> Vec<&'a [f32]> {
        if samples.is_empty() {
            return Vec::new();
        }
        if samples.len() <= self.frame_length {
            return vec![samples];
        }
        samples
            .windows(self.frame_length)
            .step_by(self.hop_length)
            .collect()
    }

    fn spectral_centroids(&self, frames: &[&[f32]]) -> Vec<f64> {
        let n = self.frame_length;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let window: Vec<f32> = (0..n)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
            .collect();
        let bin_hz = self.sample_rate as f64 / n as f64;

        frames
            .iter()
            .map(|frame| {
                let mut buffer: Vec<Complex<f32>> = (0..n)
                    .map(|i| Complex::new(frame.get(i).copied().unwrap_or(0.0) * window[i], 0.0))
                    .collect();
                fft.process(&mut buffer);

                let (weighted, total) = buffer[..=n / 2]
                    .iter()
                    .enumerate()
                    .fold((0.0f64, 0.0f64), |(w, t), (k, c)| {
                        let magnitude = c.norm() as f64;
                        (w + k as f64 * bin_hz * magnitude, t + magnitude)
                    });

                if total > 0.0 { weighted / total } else { 0.0 }
            })
            .collect()
    }

    /// Autocorrelation of the energy onset envelope, weighted towards 120 BPM
    fn estimate_tempo(&self, rms: &[f64]) -> f64 {
        let frames_per_sec = self.sample_rate as f64 / self.hop_length as f64;
        let onset: Vec<f64> = rms
            .windows(2)
            .map(|w| (w[1] - w[0]).max(0.0))
            .collect();

        if onset.iter().all(|&v| v == 0.0) {
            return 0.0;
        }

        let min_lag = (60.0 * frames_per_sec / MAX_BPM).ceil() as usize;
        let max_lag = (60.0 * frames_per_sec / MIN_BPM).floor() as usize;

        let mut best: Option<(usize, f64)> = None;
        for lag in min_lag.max(1)..=max_lag.min(onset.len().saturating_sub(1)) {
            let correlation: f64 = onset.iter().zip(&onset[lag..]).map(|(a, b)| a * b).sum();
            let bpm = 60.0 * frames_per_sec / lag as f64;
            let weight = (-0.5 * (bpm / PRIOR_BPM).log2().powi(2)).exp();
            let score = correlation * weight;
            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((lag, score));
            }
        }

        best.map(|(lag, _)| 60.0 * frames_per_sec / lag as f64).unwrap_or(0.0)
    }
}

impl AudioFeatureSource for AudioAnalyzer {
    #[instrument(skip(self), fields(path = %path.display()))]
    fn analyze(&self, path: &Path) -> Result<AudioFeatures> {
        let samples = self.decode(path)?;
        let mut features = self.features_from_samples(&samples);
        features.description = Some(features.describe());
        debug!("Audio features: {:.1} BPM, centroid {:.0} Hz, rms {:.4}",
               features.tempo, features.spectral_centroid_mean, features.rms_mean);
        Ok(features)
    }
}

fn frame_rms(frame: &[f32]) -> f64 {
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frame.len() as f64).sqrt()
}

fn frame_zcr(frame: &[f32]) -> f64 {
    let crossings = frame
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / frame.len() as f64
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
