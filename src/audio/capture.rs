//! # Capture Pipeline
//!
//! Microphone frames in, encoded chunks out to the transport.
//!
//! ## Flow:
//! 1. The input device pushes fixed-size frames from its own callback thread
//! 2. Muted frames are dropped on the spot (no explicit silence is sent)
//! 3. Everything else goes through the codec and into the transport's send queue
//!
//! Frame delivery is paced by the device clock, never by a timer. Frames reach the
//! transport in capture order because they are sent from the single callback thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::audio::codec::encode_frame;
use crate::audio::frame::AudioFrame;
use crate::device::InputDevice;
use crate::error::{SessionError, SessionResult};
use crate::state::{SessionMetrics, SessionShared};
use crate::transport::{AudioSender, EventSender, SessionEvent};

/// Whether captured frames are forwarded. Flipping it never touches the device.
#[derive(Debug, Clone, Default)]
pub struct MuteFlag(Arc<AtomicBool>);

impl MuteFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

/// Owns the microphone for the session.
pub struct CapturePipeline {
    sample_rate: u32,
    frame_size: usize,
    mute: MuteFlag,
    device: Option<Box<dyn InputDevice>>,
    shared: Arc<SessionShared>,
}

impl CapturePipeline {
    pub fn new(sample_rate: u32, frame_size: usize, shared: Arc<SessionShared>) -> Self {
        Self {
            sample_rate,
            frame_size,
            mute: MuteFlag::new(),
            device: None,
            shared,
        }
    }

    /// Shared handle on the mute gate, usable before and after `start`.
    pub fn mute_flag(&self) -> MuteFlag {
        self.mute.clone()
    }

    pub fn set_mute(&self, muted: bool) {
        self.mute.set(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    pub fn is_running(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_running())
    }

    /// Take ownership of `device` and start forwarding its frames to `sender`.
    ///
    /// A device that fails later reports through `events` as `SessionEvent::Error`.
    /// If the device cannot start, it is released and the error returned.
    pub fn start(
        &mut self,
        mut device: Box<dyn InputDevice>,
        sender: AudioSender,
        events: EventSender,
    ) -> SessionResult<()> {
        if self.device.is_some() {
            debug!(session_id = %self.shared.id, "Capture already running");
            return Ok(());
        }

        let sample_rate = self.sample_rate;
        let mute = self.mute.clone();
        let shared = self.shared.clone();
        let on_frame = Box::new(move |samples: &[f32]| {
            let metrics = &shared.metrics;
            SessionMetrics::incr(&metrics.frames_captured);
            if mute.is_muted() {
                SessionMetrics::incr(&metrics.frames_muted);
                return;
            }

            let chunk = encode_frame(&AudioFrame::new(samples, sample_rate));
            let bytes = chunk.len() as u64;
            match sender.send_audio(&chunk) {
                Ok(()) => {
                    SessionMetrics::incr(&metrics.frames_sent);
                    SessionMetrics::add(&metrics.bytes_sent, bytes);
                    trace!(bytes, "Sent captured frame");
                }
                Err(e) => {
                    SessionMetrics::incr(&metrics.send_failures);
                    trace!(error = %e, "Captured frame not sent");
                }
            }
        });
        let on_error = Box::new(move |err: SessionError| {
            let _ = events.send(SessionEvent::Error(err));
        });

        device.start(self.sample_rate, self.frame_size, on_frame, on_error)?;
        info!(
            session_id = %self.shared.id,
            device = %device.name(),
            sample_rate = self.sample_rate,
            frame_size = self.frame_size,
            "Capture started"
        );
        self.device = Some(device);
        Ok(())
    }

    /// Disconnect the device tap and release the microphone. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            info!(session_id = %self.shared.id, device = %device.name(), "Capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_from_transport;
    use crate::audio::frame::{CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE};
    use crate::device::{ManualInput, ManualInputHandle};
    use crate::transport::{EventReceiver, TransportHandle, TransportLink};
    use tokio::sync::mpsc;

    struct Rig {
        capture: CapturePipeline,
        input: ManualInputHandle,
        handle: TransportHandle,
        link: TransportLink,
        events: EventReceiver,
        shared: Arc<SessionShared>,
    }

    fn rig() -> Rig {
        let shared = Arc::new(SessionShared::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (handle, link) = TransportHandle::new(8, events_tx.clone());
        let (device, input) = ManualInput::new();

        let mut capture = CapturePipeline::new(CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE, shared.clone());
        capture
            .start(Box::new(device), handle.audio_sender(), events_tx)
            .unwrap();
        Rig {
            capture,
            input,
            handle,
            link,
            events,
            shared,
        }
    }

    fn sine_frame() -> Vec<f32> {
        (0..DEFAULT_FRAME_SIZE)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / CAPTURE_SAMPLE_RATE as f32).sin() * 0.8)
            .collect()
    }

    #[test]
    fn test_sine_frame_becomes_one_payload() {
        let mut rig = rig();
        assert_eq!(rig.input.frame_size(), 4096);
        assert!(rig.input.push(&sine_frame()));

        let frame = rig.link.outbound.try_recv().unwrap();
        assert!(rig.link.outbound.try_recv().is_err());
        assert_eq!(frame.media_type, "audio/pcm;rate=16000");
        assert_eq!(decode_from_transport(&frame.data).unwrap().len(), 8192);

        let metrics = rig.shared.metrics.snapshot();
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.bytes_sent, 8192);
    }

    #[test]
    fn test_mute_drops_frames_without_touching_device() {
        let mut rig = rig();
        for _ in 0..50 {
            rig.capture.set_mute(true);
            rig.capture.set_mute(false);
        }
        let flag = rig.capture.mute_flag();
        assert!(flag.toggle());
        assert!(rig.capture.is_muted());

        rig.input.push(&sine_frame());
        assert!(rig.link.outbound.try_recv().is_err());

        assert!(!flag.toggle());
        rig.input.push(&sine_frame());
        assert!(rig.link.outbound.try_recv().is_ok());

        assert_eq!(rig.input.start_count(), 1);
        assert!(rig.capture.is_running());
        let metrics = rig.shared.metrics.snapshot();
        assert_eq!(metrics.frames_captured, 2);
        assert_eq!(metrics.frames_muted, 1);
        assert_eq!(metrics.frames_sent, 1);
    }

    #[test]
    fn test_mute_before_start() {
        let shared = Arc::new(SessionShared::new());
        let capture = CapturePipeline::new(CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE, shared);
        capture.set_mute(true);
        assert!(capture.is_muted());
        assert!(!capture.is_running());
    }

    #[test]
    fn test_frames_keep_capture_order() {
        let mut rig = rig();
        for level in [0.1f32, 0.2, 0.3] {
            rig.input.push(&vec![level; DEFAULT_FRAME_SIZE]);
        }
        let firsts: Vec<i16> = (0..3)
            .map(|_| {
                let frame = rig.link.outbound.try_recv().unwrap();
                let pcm = decode_from_transport(&frame.data).unwrap();
                i16::from_le_bytes([pcm[0], pcm[1]])
            })
            .collect();
        assert_eq!(firsts, vec![3277, 6553, 9830]);
    }

    #[test]
    fn test_device_failure_is_reported() {
        let mut rig = rig();
        assert!(rig.input.fail("unplugged"));
        match rig.events.try_recv() {
            Ok(SessionEvent::Error(err)) => assert!(err.is_capture_unavailable()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_device() {
        let mut rig = rig();
        rig.capture.stop();
        rig.capture.stop();
        assert!(!rig.capture.is_running());
        assert!(!rig.input.is_held());
        assert!(!rig.input.push(&sine_frame()));
    }

    #[test]
    fn test_closed_transport_counts_failures() {
        let rig = rig();
        rig.handle.close();
        rig.input.push(&sine_frame());
        let metrics = rig.shared.metrics.snapshot();
        assert_eq!(metrics.send_failures, 1);
        assert_eq!(metrics.frames_sent, 0);
    }
}
