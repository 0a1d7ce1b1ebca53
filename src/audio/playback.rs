//! # Playback Scheduler
//!
//! Turns inbound speech chunks into gapless output on the speaker's own clock, and
//! cancels everything on barge-in.
//!
//! ## Virtual Clock:
//! The clock is the number of sample frames the output device has pulled through the
//! render callback. It never looks at wall-clock time. Start times and durations are
//! integer frame counts, so back-to-back units line up exactly with no drift.
//!
//! ## Cursor Algorithm:
//! A single cursor `next_start` (0 means "unset") marks where the next unit goes:
//! 1. if the cursor fell behind `now` (a stall), snap it to `now`
//! 2. the unit starts at the cursor, and the cursor advances by the unit's duration
//!
//! Bursts and stalls both come out right without any explicit buffering.
//!
//! ## Thread Safety:
//! The timeline sits behind `Arc<Mutex<_>>`, shared by the render thread and the
//! session's event loop. Critical sections are short and never allocate audio.
//! The visualizer tap is a separate ring written with `try_lock`, so analysis
//! can never stall rendering.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::audio::codec::{decode_chunk, decode_from_transport};
use crate::audio::frame::{AudioFrame, EncodedChunk, MediaType};
use crate::device::OutputDevice;
use crate::error::{SessionError, SessionResult};
use crate::state::{SessionMetrics, SessionShared};

/// Samples retained for the visualizer (enough for the largest analyser window).
pub const TAP_CAPACITY: usize = 32_768;

/// An audio frame bound to a start time on the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPlaybackUnit {
    pub id: u64,
    /// First output frame this unit occupies
    pub start_frame: u64,
    pub duration_frames: u64,
    pub sample_rate: u32,
}

impl ScheduledPlaybackUnit {
    /// One past the last frame this unit occupies.
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.duration_frames
    }

    pub fn start_secs(&self) -> f64 {
        self.start_frame as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_frames as f64 / self.sample_rate as f64)
    }
}

struct Unit {
    start: u64,
    frame: AudioFrame,
}

impl Unit {
    fn end(&self) -> u64 {
        self.start + self.frame.duration_frames()
    }
}

/// Registry of scheduled units plus the clock and the cursor.
#[derive(Default)]
struct Timeline {
    now: u64,
    next_start: u64,
    next_id: u64,
    units: BTreeMap<u64, Unit>,
}

impl Timeline {
    fn schedule(&mut self, frame: AudioFrame) -> SessionResult<ScheduledPlaybackUnit> {
        let duration = frame.duration_frames();
        if duration == 0 {
            return Err(SessionError::SchedulingInvariantViolation(
                "unit with zero duration".to_string(),
            ));
        }

        if self.next_start < self.now {
            self.next_start = self.now;
        }
        let start = self.next_start;
        // Units never overlap: each starts at or after the end of the one before it
        if let Some(last) = self.units.values().next_back() {
            if start < last.end() {
                return Err(SessionError::SchedulingInvariantViolation(format!(
                    "unit at {} would overlap the unit ending at {}",
                    start,
                    last.end()
                )));
            }
        }
        self.next_start = start + duration;

        let id = self.next_id;
        self.next_id += 1;
        let sample_rate = frame.sample_rate();
        self.units.insert(id, Unit { start, frame });

        Ok(ScheduledPlaybackUnit {
            id,
            start_frame: start,
            duration_frames: duration,
            sample_rate,
        })
    }

    /// Mix every unit overlapping `[now, now + out.len())` into `out` and advance
    /// the clock. Returns how many units finished inside this block.
    fn render(&mut self, out: &mut [f32]) -> u64 {
        out.fill(0.0);
        let block_start = self.now;
        let block_end = block_start + out.len() as u64;

        let mut finished = Vec::new();
        for (&id, unit) in self.units.iter() {
            if unit.start >= block_end {
                // Units are scheduled in order, so nothing later can overlap either
                break;
            }
            let from = unit.start.max(block_start);
            let to = unit.end().min(block_end);
            if from < to {
                let samples = unit.frame.samples();
                let src = (from - unit.start) as usize..(to - unit.start) as usize;
                let dst = (from - block_start) as usize;
                for (slot, sample) in out[dst..].iter_mut().zip(&samples[src]) {
                    *slot += *sample;
                }
            }
            if unit.end() <= block_end {
                finished.push(id);
            }
        }

        for id in &finished {
            self.units.remove(id);
        }
        self.now = block_end;
        finished.len() as u64
    }

    fn cancel_all(&mut self) -> usize {
        let cancelled = self.units.len();
        self.units.clear();
        self.next_start = 0;
        cancelled
    }
}

/// Non-destructive copy of the most recent rendered samples.
#[derive(Clone)]
pub struct AnalysisTap {
    ring: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl AnalysisTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append rendered samples. Skipped when a reader holds the lock.
    pub(crate) fn write(&self, block: &[f32]) {
        let Ok(mut ring) = self.ring.try_lock() else {
            return;
        };
        let block = if block.len() > self.capacity {
            &block[block.len() - self.capacity..]
        } else {
            block
        };
        let overflow = (ring.len() + block.len()).saturating_sub(self.capacity);
        ring.drain(..overflow);
        ring.extend(block.iter().copied());
    }

    /// The last `len` samples, zero-padded at the front when fewer were rendered.
    /// `None` when the render thread holds the lock right now.
    pub fn snapshot(&self, len: usize) -> Option<Vec<f32>> {
        let ring = self.ring.try_lock().ok()?;
        let available = ring.len().min(len);
        let mut out = vec![0.0f32; len - available];
        out.extend(ring.iter().skip(ring.len() - available).copied());
        Some(out)
    }
}

/// Owns the output device and the playback timeline for one session.
pub struct PlaybackScheduler {
    sample_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    tap: AnalysisTap,
    device: Option<Box<dyn OutputDevice>>,
    shared: Arc<SessionShared>,
}

impl PlaybackScheduler {
    /// Start the output device at `sample_rate`. From here on the device pulls
    /// audio (silence until something is enqueued) and the clock runs.
    pub fn start(
        mut device: Box<dyn OutputDevice>,
        sample_rate: u32,
        shared: Arc<SessionShared>,
    ) -> SessionResult<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let tap = AnalysisTap::new(TAP_CAPACITY);

        let render_timeline = timeline.clone();
        let render_tap = tap.clone();
        let render_shared = shared.clone();
        device.start(
            sample_rate,
            Box::new(move |out: &mut [f32]| {
                let finished = render_timeline
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render(out);
                if finished > 0 {
                    SessionMetrics::add(&render_shared.metrics.units_completed, finished);
                }
                render_tap.write(out);
            }),
        )?;

        info!(
            session_id = %shared.id,
            device = %device.name(),
            sample_rate,
            "Playback started"
        );

        Ok(Self {
            sample_rate,
            timeline,
            tap,
            device: Some(device),
            shared,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn media_type(&self) -> MediaType {
        MediaType::pcm(self.sample_rate)
    }

    /// Current position of the output clock, in frames.
    pub fn now(&self) -> u64 {
        self.lock().now
    }

    /// Cursor for the next unit (0 when unset).
    pub fn next_start(&self) -> u64 {
        self.lock().next_start
    }

    /// Units scheduled and not yet finished or cancelled.
    pub fn registered_count(&self) -> usize {
        self.lock().units.len()
    }

    pub fn tap(&self) -> AnalysisTap {
        self.tap.clone()
    }

    /// Decode a PCM chunk and place it on the timeline.
    ///
    /// A chunk that cannot be played (odd length, empty, wrong rate) is
    /// `MalformedAudio`: it is counted as dropped and nothing is scheduled.
    pub fn enqueue(&self, chunk: &EncodedChunk) -> SessionResult<ScheduledPlaybackUnit> {
        SessionMetrics::incr(&self.shared.metrics.chunks_received);
        let result = self.decode(chunk).and_then(|frame| self.lock().schedule(frame));

        match &result {
            Ok(unit) => {
                SessionMetrics::incr(&self.shared.metrics.chunks_scheduled);
                trace!(
                    unit = unit.id,
                    start = unit.start_frame,
                    frames = unit.duration_frames,
                    "Scheduled playback unit"
                );
            }
            Err(SessionError::MalformedAudio(_)) => {
                SessionMetrics::incr(&self.shared.metrics.chunks_dropped);
            }
            Err(_) => {}
        }
        result
    }

    /// Enqueue a chunk still in transport encoding, as it arrives from the agent.
    pub fn enqueue_encoded(&self, data: &str, sample_rate: u32) -> SessionResult<ScheduledPlaybackUnit> {
        match decode_from_transport(data) {
            Ok(pcm) => self.enqueue(&EncodedChunk {
                media_type: MediaType::pcm(sample_rate),
                pcm,
            }),
            Err(e) => {
                SessionMetrics::incr(&self.shared.metrics.chunks_received);
                SessionMetrics::incr(&self.shared.metrics.chunks_dropped);
                Err(e)
            }
        }
    }

    fn decode(&self, chunk: &EncodedChunk) -> SessionResult<AudioFrame> {
        if chunk.sample_rate() != self.sample_rate {
            return Err(SessionError::MalformedAudio(format!(
                "chunk is {} but playback runs at {}Hz",
                chunk.media_type, self.sample_rate
            )));
        }
        let frame = decode_chunk(chunk)?;
        if frame.is_empty() {
            return Err(SessionError::MalformedAudio("empty audio chunk".to_string()));
        }
        Ok(frame)
    }

    /// Stop every registered unit, started or not, and unset the cursor.
    ///
    /// Takes effect before the next rendered block. Returns how many units were stopped.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.lock().cancel_all();
        SessionMetrics::add(&self.shared.metrics.units_cancelled, cancelled as u64);
        if cancelled > 0 {
            debug!(session_id = %self.shared.id, cancelled, "Cancelled scheduled playback");
        }
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_running())
    }

    /// Cancel everything and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel_all();
        if let Some(mut device) = self.device.take() {
            device.stop();
            info!(session_id = %self.shared.id, device = %device.name(), "Playback device released");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!(session_id = %self.shared.id, "Playback scheduler dropped without shutdown");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{encode_for_transport, float_to_pcm16};
    use crate::device::ManualOutput;

    const RATE: u32 = 24_000;
    const D: usize = 2400;

    fn setup() -> (PlaybackScheduler, crate::device::ManualOutputHandle, Arc<SessionShared>) {
        let shared = Arc::new(SessionShared::new());
        let (device, handle) = ManualOutput::new();
        let scheduler = PlaybackScheduler::start(Box::new(device), RATE, shared.clone()).unwrap();
        (scheduler, handle, shared)
    }

    fn chunk(frames: usize, value: f32) -> EncodedChunk {
        EncodedChunk {
            media_type: MediaType::pcm(RATE),
            pcm: float_to_pcm16(&vec![value; frames]),
        }
    }

    #[test]
    fn test_timeline_refuses_overlapping_unit() {
        let mut timeline = Timeline::default();
        let first = timeline.schedule(AudioFrame::new(vec![0.5; D], RATE)).unwrap();
        assert_eq!(first.start_frame, 0);

        // Cursor pulled back inside the first unit
        timeline.next_start = 1;
        let err = timeline
            .schedule(AudioFrame::new(vec![0.5; D], RATE))
            .unwrap_err();
        assert!(matches!(err, SessionError::SchedulingInvariantViolation(_)));
        assert_eq!(timeline.next_start, 1);
        assert_eq!(timeline.units.len(), 1);

        timeline.next_start = D as u64;
        let second = timeline.schedule(AudioFrame::new(vec![0.5; D], RATE)).unwrap();
        assert_eq!(second.start_frame, D as u64);
    }

    #[test]
    fn test_gapless_when_arrivals_keep_up() {
        let (scheduler, output, _) = setup();

        let mut starts = Vec::new();
        for _ in 0..6 {
            starts.push(scheduler.enqueue(&chunk(D, 0.5)).unwrap().start_frame);
            // Arrival gap shorter than one chunk
            output.render(1000);
        }

        for pair in starts.windows(2) {
            assert_eq!(pair[1], pair[0] + D as u64);
        }
        assert_eq!(starts[0], 0);
    }

    #[test]
    fn test_burst_is_queued_back_to_back() {
        let (scheduler, output, _) = setup();
        output.render(300);

        let units: Vec<_> = (0..4).map(|_| scheduler.enqueue(&chunk(D, 0.5)).unwrap()).collect();
        assert_eq!(units[0].start_frame, 300);
        for pair in units.windows(2) {
            assert_eq!(pair[1].start_frame, pair[0].end_frame());
        }

        // Played back contiguously: no silent sample between units
        let rendered = output.render(4 * D);
        assert!(rendered.iter().all(|&s| s == 0.5));
        assert_eq!(scheduler.registered_count(), 0);
    }

    #[test]
    fn test_stall_resumes_at_now() {
        let (scheduler, output, _) = setup();
        let first = scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        assert_eq!(first.start_frame, 0);

        output.render(10_000);
        let second = scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        assert_eq!(second.start_frame, 10_000);
        assert_eq!(scheduler.next_start(), 10_000 + D as u64);
    }

    #[test]
    fn test_interruption_cancels_started_and_pending_units() {
        let (scheduler, output, shared) = setup();
        for _ in 0..3 {
            scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        }

        // Unit 0 is halfway through when the interruption lands
        let before = output.render(D / 2);
        assert!(before.iter().all(|&s| s == 0.5));

        assert_eq!(scheduler.cancel_all(), 3);
        assert_eq!(scheduler.registered_count(), 0);
        assert_eq!(scheduler.next_start(), 0);

        let after = output.render(3 * D);
        assert!(after.iter().all(|&s| s == 0.0));

        let metrics = shared.metrics.snapshot();
        assert_eq!(metrics.units_cancelled, 3);
        assert_eq!(metrics.units_completed, 0);
    }

    #[test]
    fn test_enqueue_after_interruption_starts_now() {
        let (scheduler, output, _) = setup();
        scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        output.render(700);
        scheduler.cancel_all();

        let unit = scheduler.enqueue(&chunk(D, 0.25)).unwrap();
        assert_eq!(unit.start_frame, 700);
        assert_eq!(output.render(D), vec![0.25; D]);
    }

    #[test]
    fn test_units_self_remove_on_completion() {
        let (scheduler, output, shared) = setup();
        scheduler.enqueue(&chunk(480, 0.5)).unwrap();
        scheduler.enqueue(&chunk(480, 0.5)).unwrap();

        output.render(480);
        assert_eq!(scheduler.registered_count(), 1);
        output.render(479);
        assert_eq!(scheduler.registered_count(), 1);
        output.render(1);
        assert_eq!(scheduler.registered_count(), 0);
        assert_eq!(shared.metrics.snapshot().units_completed, 2);
    }

    #[test]
    fn test_malformed_chunks_are_dropped() {
        let (scheduler, _output, shared) = setup();

        let odd = EncodedChunk {
            media_type: MediaType::pcm(RATE),
            pcm: vec![0u8; 7],
        };
        let wrong_rate = EncodedChunk {
            media_type: MediaType::pcm(16_000),
            pcm: vec![0u8; 8],
        };
        let empty = chunk(0, 0.0);

        for bad in [&odd, &wrong_rate, &empty] {
            let err = scheduler.enqueue(bad).unwrap_err();
            assert!(matches!(err, SessionError::MalformedAudio(_)));
        }
        let err = scheduler.enqueue_encoded("%%%", RATE).unwrap_err();
        assert!(matches!(err, SessionError::MalformedAudio(_)));

        assert_eq!(scheduler.registered_count(), 0);
        assert_eq!(scheduler.next_start(), 0);
        let metrics = shared.metrics.snapshot();
        assert_eq!(metrics.chunks_received, 4);
        assert_eq!(metrics.chunks_dropped, 4);
        assert_eq!(metrics.chunks_scheduled, 0);
    }

    #[test]
    fn test_enqueue_encoded_schedules() {
        let (scheduler, _output, _) = setup();
        let data = encode_for_transport(&float_to_pcm16(&[0.1; 240]));
        let unit = scheduler.enqueue_encoded(&data, RATE).unwrap();
        assert_eq!(unit.duration_frames, 240);
        assert_eq!(unit.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_tap_observes_rendered_audio() {
        let (scheduler, output, _) = setup();
        scheduler.enqueue(&chunk(100, 0.5)).unwrap();
        output.render(150);

        let snapshot = scheduler.tap().snapshot(200).unwrap();
        assert_eq!(snapshot.len(), 200);
        assert!(snapshot[..50].iter().all(|&s| s == 0.0));
        assert!(snapshot[50..150].iter().all(|&s| s == 0.5));
        assert!(snapshot[150..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_shutdown_releases_device_once() {
        let (mut scheduler, output, _) = setup();
        scheduler.enqueue(&chunk(D, 0.5)).unwrap();
        assert!(scheduler.is_running());

        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert!(!output.is_held());
        assert_eq!(scheduler.registered_count(), 0);
    }
}
