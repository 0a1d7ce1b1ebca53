//! # CPAL Devices
//!
//! Platform microphone and speaker through `cpal`.
//!
//! `cpal::Stream` is not `Send`, so every stream is built, played and dropped on its
//! own worker thread. The device object only keeps the control side: a stop channel
//! and the join handle. `start` waits for the worker to report whether the stream
//! came up, so format problems still surface synchronously as `DeviceUnavailable`.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::device::{
    DeviceErrorCallback, FrameCallback, InputDevice, OutputDevice, RenderCallback,
};
use crate::error::{DeviceRole, SessionError, SessionResult};

fn unavailable(role: DeviceRole, reason: impl Into<String>) -> SessionError {
    SessionError::DeviceUnavailable {
        role,
        reason: reason.into(),
    }
}

fn mono_config(sample_rate: u32) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Control side of a stream living on a worker thread.
struct StreamWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamWorker {
    fn shutdown(self, role: DeviceRole) {
        // A dropped receiver means the worker already exited
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!(role = %role, "Audio stream worker panicked");
        }
    }
}

/// Park the worker until asked to stop, keeping `stream` alive meanwhile.
fn hold_stream(stream: cpal::Stream, stop_rx: Receiver<()>, ready_tx: SyncSender<SessionResult<()>>, role: DeviceRole) {
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(unavailable(role, format!("failed to start stream: {}", e))));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    // Either an explicit stop or the device object going away
    let _ = stop_rx.recv();
    drop(stream);
    debug!(role = %role, "Audio stream released");
}

/// Default platform microphone.
pub struct CpalInput {
    name: String,
    worker: Option<StreamWorker>,
}

impl CpalInput {
    /// Check that a default input device exists.
    pub fn open_default() -> SessionResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| unavailable(DeviceRole::Input, "no default input device"))?;
        let name = device.name().unwrap_or_else(|_| "default input".to_string());
        info!(device = %name, "Acquired input device");
        Ok(Self { name, worker: None })
    }
}

impl InputDevice for CpalInput {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        mut on_frame: FrameCallback,
        on_error: DeviceErrorCallback,
    ) -> SessionResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("voice-cpal-input".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_input_device() else {
                    let _ = ready_tx.send(Err(unavailable(DeviceRole::Input, "input device disappeared")));
                    return;
                };

                // cpal delivers whatever block size the driver likes; re-frame it
                let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
                let stream = device.build_input_stream(
                    &mono_config(sample_rate),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        pending.extend_from_slice(data);
                        while pending.len() >= frame_size {
                            on_frame(&pending[..frame_size]);
                            pending.drain(..frame_size);
                        }
                    },
                    move |err| on_error(unavailable(DeviceRole::Input, err.to_string())),
                    None,
                );

                match stream {
                    Ok(stream) => hold_stream(stream, stop_rx, ready_tx, DeviceRole::Input),
                    Err(e) => {
                        let _ = ready_tx.send(Err(unavailable(
                            DeviceRole::Input,
                            format!("cannot capture mono {}Hz: {}", sample_rate, e),
                        )));
                    }
                }
            })
            .map_err(|e| unavailable(DeviceRole::Input, format!("worker thread: {}", e)))?;

        let worker = StreamWorker { stop_tx, handle };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                worker.shutdown(DeviceRole::Input);
                Err(e)
            }
            Err(_) => {
                worker.shutdown(DeviceRole::Input);
                Err(unavailable(DeviceRole::Input, "stream worker exited"))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(DeviceRole::Input);
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default platform speaker.
pub struct CpalOutput {
    name: String,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    pub fn open_default() -> SessionResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| unavailable(DeviceRole::Output, "no default output device"))?;
        let name = device.name().unwrap_or_else(|_| "default output".to_string());
        info!(device = %name, "Acquired output device");
        Ok(Self { name, worker: None })
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&mut self, sample_rate: u32, mut render: RenderCallback) -> SessionResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("voice-cpal-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err(unavailable(DeviceRole::Output, "output device disappeared")));
                    return;
                };

                let stream = device.build_output_stream(
                    &mono_config(sample_rate),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data),
                    move |err| warn!(error = %err, "Output stream error"),
                    None,
                );

                match stream {
                    Ok(stream) => hold_stream(stream, stop_rx, ready_tx, DeviceRole::Output),
                    Err(e) => {
                        let _ = ready_tx.send(Err(unavailable(
                            DeviceRole::Output,
                            format!("cannot play mono {}Hz: {}", sample_rate, e),
                        )));
                    }
                }
            })
            .map_err(|e| unavailable(DeviceRole::Output, format!("worker thread: {}", e)))?;

        let worker = StreamWorker { stop_tx, handle };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                worker.shutdown(DeviceRole::Output);
                Err(e)
            }
            Err(_) => {
                worker.shutdown(DeviceRole::Output);
                Err(unavailable(DeviceRole::Output, "stream worker exited"))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(DeviceRole::Output);
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
