//! # File and Null Devices
//!
//! Hardware-free devices that still keep real-time pace, so a full call can run on a
//! headless machine:
//! - [`WavFileInput`] streams a mono WAV file as if it were a microphone
//! - [`NullOutput`] pulls rendered audio at real-time pace and discards it
//!
//! Each runs its clock on a dedicated worker thread, like a hardware callback would.

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{
    DeviceErrorCallback, FrameCallback, InputDevice, OutputDevice, RenderCallback,
};
use crate::error::{SessionError, SessionResult};

/// Render block used by the null output: 20ms worth of frames.
const NULL_BLOCK_MS: u64 = 20;

/// Mono WAV file delivered frame by frame at the capture rate.
pub struct WavFileInput {
    path: String,
    samples: Arc<[f32]>,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavFileInput {
    /// Read and decode the whole file up front.
    ///
    /// ## Supported formats:
    /// 8/16/24-bit integer PCM or 32-bit float, mono. Anything else is
    /// `DeviceUnavailable`, the same as a microphone that cannot be opened.
    pub fn open(path: &str) -> SessionResult<Self> {
        let file = File::open(path)
            .map_err(|e| SessionError::capture_unavailable(format!("{}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        let (header, data) = wav::read(&mut reader)
            .map_err(|e| SessionError::capture_unavailable(format!("{}: {}", path, e)))?;

        if header.channel_count != 1 {
            return Err(SessionError::capture_unavailable(format!(
                "{}: expected mono, found {} channels",
                path, header.channel_count
            )));
        }

        let samples: Vec<f32> = match data {
            wav::BitDepth::Eight(raw) => raw.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
            wav::BitDepth::Sixteen(raw) => raw.iter().map(|&s| s as f32 / 32768.0).collect(),
            wav::BitDepth::TwentyFour(raw) => {
                raw.iter().map(|&s| s as f32 / 8_388_608.0).collect()
            }
            wav::BitDepth::ThirtyTwoFloat(raw) => raw,
            wav::BitDepth::Empty => Vec::new(),
        };

        info!(
            path = %path,
            sample_rate = header.sampling_rate,
            samples = samples.len(),
            "Loaded WAV input"
        );

        Ok(Self {
            path: path.to_string(),
            samples: samples.into(),
            sample_rate: header.sampling_rate,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl InputDevice for WavFileInput {
    fn name(&self) -> String {
        format!("wav:{}", self.path)
    }

    fn start(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        mut on_frame: FrameCallback,
        _on_error: DeviceErrorCallback,
    ) -> SessionResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if sample_rate != self.sample_rate {
            return Err(SessionError::capture_unavailable(format!(
                "{} is {}Hz, capture needs {}Hz",
                self.path, self.sample_rate, sample_rate
            )));
        }
        if frame_size == 0 {
            return Err(SessionError::capture_unavailable("frame size must be non-zero"));
        }

        let samples = self.samples.clone();
        let running = self.running.clone();
        let period = Duration::from_secs_f64(frame_size as f64 / sample_rate as f64);
        running.store(true, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("voice-wav-input".into())
            .spawn(move || {
                let mut next_tick = Instant::now();
                for frame in samples.chunks_exact(frame_size) {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    on_frame(frame);
                    next_tick += period;
                    if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                debug!("WAV input finished");
            })
            .map_err(|e| SessionError::capture_unavailable(format!("worker thread: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WAV input worker panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for WavFileInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Output that keeps the playback clock moving without any hardware.
pub struct NullOutput {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for NullOutput {
    fn name(&self) -> String {
        "null".to_string()
    }

    fn start(&mut self, sample_rate: u32, mut render: RenderCallback) -> SessionResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let block_frames = (sample_rate as u64 * NULL_BLOCK_MS / 1000).max(1) as usize;
        let period = Duration::from_millis(NULL_BLOCK_MS);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("voice-null-output".into())
            .spawn(move || {
                let mut block = vec![0.0f32; block_frames];
                let mut next_tick = Instant::now();
                while running.load(Ordering::SeqCst) {
                    render(&mut block);
                    next_tick += period;
                    if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
            })
            .map_err(|e| SessionError::playback_unavailable(format!("worker thread: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Null output worker panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
