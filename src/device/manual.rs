//! # Manual Devices
//!
//! Devices driven by the caller instead of a hardware clock. Pushing a frame into a
//! [`ManualInputHandle`] behaves exactly like a hardware capture callback, and calling
//! [`ManualOutputHandle::render`] advances the playback clock by exactly the number of
//! frames requested. That makes timing-sensitive behavior testable without sleeping.
//!
//! The handles also count device opens/starts and report whether a device is still
//! held, which is how teardown and mute behavior are verified.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::device::{
    AudioBackend, DeviceErrorCallback, FrameCallback, InputDevice, OutputDevice, RenderCallback,
};
use crate::error::{SessionError, SessionResult};

#[derive(Default)]
struct InputShared {
    on_frame: Mutex<Option<FrameCallback>>,
    on_error: Mutex<Option<DeviceErrorCallback>>,
    frame_size: AtomicUsize,
    starts: AtomicUsize,
    running: AtomicBool,
    held: AtomicBool,
}

/// Test-side view of a [`ManualInput`].
#[derive(Clone, Default)]
pub struct ManualInputHandle {
    shared: Arc<InputShared>,
}

impl ManualInputHandle {
    /// Deliver one frame as if the hardware callback fired.
    /// Returns false when the device is not running (the frame goes nowhere).
    pub fn push(&self, samples: &[f32]) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut on_frame = self
            .shared
            .on_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match on_frame.as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// Simulate the device failing mid-call (e.g. unplugged).
    pub fn fail(&self, reason: &str) -> bool {
        let on_error = self
            .shared
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match on_error.as_ref() {
            Some(callback) => {
                callback(SessionError::capture_unavailable(reason));
                true
            }
            None => false,
        }
    }

    /// Frame size requested by the last `start`.
    pub fn frame_size(&self) -> usize {
        self.shared.frame_size.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether a device object for this handle still exists (not yet dropped).
    pub fn is_held(&self) -> bool {
        self.shared.held.load(Ordering::SeqCst)
    }
}

/// Input device whose frames come from a [`ManualInputHandle`].
pub struct ManualInput {
    shared: Arc<InputShared>,
}

impl ManualInput {
    pub fn new() -> (Self, ManualInputHandle) {
        let handle = ManualInputHandle::default();
        (Self::attach(&handle), handle)
    }

    fn attach(handle: &ManualInputHandle) -> Self {
        handle.shared.held.store(true, Ordering::SeqCst);
        Self {
            shared: handle.shared.clone(),
        }
    }
}

impl InputDevice for ManualInput {
    fn name(&self) -> String {
        "manual-input".to_string()
    }

    fn start(
        &mut self,
        _sample_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
        on_error: DeviceErrorCallback,
    ) -> SessionResult<()> {
        *self.shared.on_frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(on_frame);
        *self.shared.on_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(on_error);
        self.shared.frame_size.store(frame_size, Ordering::SeqCst);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared
            .on_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for ManualInput {
    fn drop(&mut self) {
        self.stop();
        self.shared.held.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct OutputShared {
    render: Mutex<Option<RenderCallback>>,
    sample_rate: AtomicUsize,
    starts: AtomicUsize,
    running: AtomicBool,
    held: AtomicBool,
}

/// Test-side view of a [`ManualOutput`].
#[derive(Clone, Default)]
pub struct ManualOutputHandle {
    shared: Arc<OutputShared>,
}

impl ManualOutputHandle {
    /// Pull `frames` samples through the render callback, advancing the
    /// playback clock. Returns silence when the device is not running.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut block = vec![0.0f32; frames];
        if self.shared.running.load(Ordering::SeqCst) {
            let mut render = self
                .shared
                .render
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(callback) = render.as_mut() {
                callback(&mut block);
            }
        }
        block
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::SeqCst) as u32
    }

    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.shared.held.load(Ordering::SeqCst)
    }
}

/// Output device whose clock advances only when the handle renders.
pub struct ManualOutput {
    shared: Arc<OutputShared>,
}

impl ManualOutput {
    pub fn new() -> (Self, ManualOutputHandle) {
        let handle = ManualOutputHandle::default();
        (Self::attach(&handle), handle)
    }

    fn attach(handle: &ManualOutputHandle) -> Self {
        handle.shared.held.store(true, Ordering::SeqCst);
        Self {
            shared: handle.shared.clone(),
        }
    }
}

impl OutputDevice for ManualOutput {
    fn name(&self) -> String {
        "manual-output".to_string()
    }

    fn start(&mut self, sample_rate: u32, render: RenderCallback) -> SessionResult<()> {
        *self.shared.render.lock().unwrap_or_else(PoisonError::into_inner) = Some(render);
        self.shared
            .sample_rate
            .store(sample_rate as usize, Ordering::SeqCst);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared
            .render
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for ManualOutput {
    fn drop(&mut self) {
        self.stop();
        self.shared.held.store(false, Ordering::SeqCst);
    }
}

/// Backend handing out manual devices, with optional scripted failures.
#[derive(Default)]
pub struct ManualBackend {
    input: ManualInputHandle,
    output: ManualOutputHandle,
    input_opens: AtomicUsize,
    output_opens: AtomicUsize,
    deny_input: Mutex<Option<String>>,
    deny_output: Mutex<Option<String>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open_input` calls fail, like a denied microphone permission.
    pub fn deny_input(&self, reason: &str) {
        *self.deny_input.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    pub fn deny_output(&self, reason: &str) {
        *self.deny_output.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    pub fn input(&self) -> ManualInputHandle {
        self.input.clone()
    }

    pub fn output(&self) -> ManualOutputHandle {
        self.output.clone()
    }

    pub fn input_open_count(&self) -> usize {
        self.input_opens.load(Ordering::SeqCst)
    }

    pub fn output_open_count(&self) -> usize {
        self.output_opens.load(Ordering::SeqCst)
    }
}

impl AudioBackend for ManualBackend {
    fn open_input(&self) -> SessionResult<Box<dyn InputDevice>> {
        if let Some(reason) = self
            .deny_input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(SessionError::capture_unavailable(reason));
        }
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualInput::attach(&self.input)))
    }

    fn open_output(&self) -> SessionResult<Box<dyn OutputDevice>> {
        if let Some(reason) = self
            .deny_output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(SessionError::playback_unavailable(reason));
        }
        self.output_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualOutput::attach(&self.output)))
    }
}
