//! # Level Visualizer
//!
//! Periodic loudness summary of what is being played, for UI feedback.
//!
//! Works like a browser analyser node: window the most recent `fft_size` output
//! samples, take the spectrum, smooth it over time, map each bin to a byte between
//! `min_decibels` and `max_decibels`, and average the bytes. The published level is
//! that average scaled to `0.0..=1.0`.
//!
//! Purely observational. It reads the playback tap with `try_lock` and skips a tick
//! when the tap is busy, so nothing here can stall or fail playback.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::audio::playback::AnalysisTap;

/// Analyser parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizerSettings {
    /// Window length; a power of two
    pub fft_size: usize,
    /// Time constant for bin smoothing, `0.0..=1.0`
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// How often a new level is published
    pub tick: Duration,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            tick: Duration::from_millis(16),
        }
    }
}

/// Spectrum analyser with per-bin smoothing state.
pub struct LevelAnalyzer {
    settings: VisualizerSettings,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex32>,
    smoothed: Vec<f32>,
}

impl LevelAnalyzer {
    /// An empty or non-finite decibel range falls back to the default one.
    pub fn new(settings: VisualizerSettings) -> Self {
        let n = settings.fft_size.max(2);
        let (min_decibels, max_decibels) = {
            let (min, max) = (settings.min_decibels, settings.max_decibels);
            if min.is_finite() && max.is_finite() && max > min {
                (min, max)
            } else {
                let defaults = VisualizerSettings::default();
                warn!(min, max, "Unusable decibel range, using the default");
                (defaults.min_decibels, defaults.max_decibels)
            }
        };
        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
        // Blackman, a0 = 0.42
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        Self {
            settings: VisualizerSettings {
                fft_size: n,
                min_decibels,
                max_decibels,
                ..settings
            },
            fft,
            window,
            buffer: vec![Complex32::new(0.0, 0.0); n],
            smoothed: vec![0.0; n / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.settings.fft_size
    }

    /// Byte-scaled spectrum of the last `fft_size` samples, one value per bin
    /// (`fft_size / 2` bins). Shorter input is zero-padded at the front.
    pub fn frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = self.settings.fft_size;
        let tail = &samples[samples.len().saturating_sub(n)..];
        let pad = n - tail.len();

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex32::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let tau = self.settings.smoothing;
        let range = self.settings.max_decibels - self.settings.min_decibels;
        let scale = 255.0 / range;

        self.smoothed
            .iter_mut()
            .zip(&self.buffer)
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() / n as f32;
                let value = tau * *smoothed + (1.0 - tau) * magnitude;
                // Keep NaN/inf out of the smoothing state
                *smoothed = if value.is_finite() { value } else { 0.0 };

                let db = 20.0 * smoothed.log10();
                (scale * (db - self.settings.min_decibels)).clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean of [`frequency_data`](Self::frequency_data), scaled to `0.0..=1.0`.
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        let bytes = self.frequency_data(samples);
        if bytes.is_empty() {
            return 0.0;
        }
        let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
        sum as f32 / bytes.len() as f32 / 255.0
    }
}

/// Background task publishing the playback level on a watch channel.
pub struct LevelVisualizer {
    task: Option<JoinHandle<()>>,
}

impl LevelVisualizer {
    /// Start ticking. Must be called from inside a tokio runtime.
    pub fn spawn(tap: AnalysisTap, settings: VisualizerSettings, level: Arc<watch::Sender<f32>>) -> Self {
        let task = tokio::spawn(async move {
            let fft_size = settings.fft_size;
            let mut ticker = tokio::time::interval(settings.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut analyzer = LevelAnalyzer::new(settings);

            loop {
                ticker.tick().await;
                // A busy tap keeps the previous value
                if let Some(samples) = tap.snapshot(fft_size) {
                    level.send_replace(analyzer.level(&samples));
                }
            }
        });
        debug!("Level visualizer started");
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop ticking. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Level visualizer stopped");
        }
    }
}

impl Drop for LevelVisualizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(smoothing: f32) -> VisualizerSettings {
        VisualizerSettings {
            smoothing,
            ..VisualizerSettings::default()
        }
    }

    fn sine(amplitude: f32, bin: usize, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * bin as f32 * i as f32 / n as f32).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let mut analyzer = LevelAnalyzer::new(settings(0.0));
        assert_eq!(analyzer.frequency_data(&[0.0; 256]).len(), 128);
        assert_eq!(analyzer.level(&[0.0; 256]), 0.0);
        assert_eq!(analyzer.level(&[]), 0.0);
    }

    #[test]
    fn test_tone_peaks_in_its_bin() {
        let mut analyzer = LevelAnalyzer::new(settings(0.0));
        let data = analyzer.frequency_data(&sine(1.0, 16, 256));
        assert_eq!(data[16], 255);
        assert_eq!(data[64], 0);
    }

    #[test]
    fn test_louder_means_higher_level() {
        let mut quiet = LevelAnalyzer::new(settings(0.0));
        let mut loud = LevelAnalyzer::new(settings(0.0));
        let quiet_level = quiet.level(&sine(0.001, 16, 256));
        let loud_level = loud.level(&sine(0.9, 16, 256));
        assert!(loud_level > quiet_level, "{} <= {}", loud_level, quiet_level);
        assert!(loud_level <= 1.0);
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyzer = LevelAnalyzer::new(settings(0.8));
        let tone = sine(1.0, 16, 256);
        for _ in 0..20 {
            analyzer.level(&tone);
        }
        let sustained = analyzer.frequency_data(&tone)[16];
        let after_silence = analyzer.frequency_data(&[0.0; 256])[16];
        assert!(after_silence > 0);
        assert!(after_silence <= sustained);
    }

    #[test]
    fn test_nan_input_does_not_poison_state() {
        let mut analyzer = LevelAnalyzer::new(settings(0.5));
        analyzer.level(&[f32::NAN; 256]);
        assert_eq!(analyzer.level(&[0.0; 256]), 0.0);
    }

    #[test]
    fn test_empty_decibel_range_stays_bounded() {
        for (min, max) in [(-50.0, -50.0), (-30.0, -100.0), (f32::NEG_INFINITY, -30.0)] {
            let mut analyzer = LevelAnalyzer::new(VisualizerSettings {
                min_decibels: min,
                max_decibels: max,
                ..settings(0.0)
            });
            let level = analyzer.level(&sine(0.9, 16, 256));
            assert!(level.is_finite());
            assert!((0.0..=1.0).contains(&level), "{}", level);
            assert_eq!(analyzer.frequency_data(&sine(1.0, 16, 256))[16], 255);
        }
    }

    #[tokio::test]
    async fn test_task_publishes_and_stops() {
        let tap = AnalysisTap::new(1024);
        tap.write(&sine(0.9, 16, 256));
        let (tx, rx) = watch::channel(0.0f32);

        let mut visualizer = LevelVisualizer::spawn(
            tap,
            VisualizerSettings {
                tick: Duration::from_millis(5),
                ..settings(0.0)
            },
            Arc::new(tx),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(*rx.borrow() > 0.0);
        assert!(visualizer.is_running());

        visualizer.stop();
        visualizer.stop();
        assert!(!visualizer.is_running());
    }
}
