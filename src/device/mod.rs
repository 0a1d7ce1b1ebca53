//! # Audio Devices
//!
//! Contracts for the two devices a session owns, plus the backends that provide them.
//!
//! ## Ownership:
//! - the **input device** is owned by the capture pipeline for the whole call
//! - the **output device** is owned by the playback scheduler for the whole call
//! - both are acquired once through an [`AudioBackend`] at session start and released
//!   at teardown; nothing is global
//!
//! ## Clocks:
//! Both devices run on their own hardware clock. Input devices push fixed-size frames
//! from their callback thread; output devices pull blocks from a render callback, and
//! the number of frames pulled *is* the playback virtual clock.
//!
//! ## Backends:
//! - **cpal** (feature `cpal`): platform microphone and speaker
//! - **wav** input / **null** output: real-time paced, no hardware needed
//! - **manual**: caller-driven devices for deterministic tests

use std::sync::Arc;

use tracing::info;

use crate::error::{SessionError, SessionResult};

pub mod file;
pub mod manual;

#[cfg(feature = "cpal")]
pub mod cpal_backend;

pub use file::{NullOutput, WavFileInput};
pub use manual::{ManualBackend, ManualInput, ManualInputHandle, ManualOutput, ManualOutputHandle};

/// Called with each captured frame of exactly `frame_size` mono samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Called when a running device fails.
pub type DeviceErrorCallback = Box<dyn Fn(SessionError) + Send + Sync + 'static>;

/// Fills the next block of mono output samples.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// A microphone-like source that pushes frames from its own clock.
pub trait InputDevice: Send {
    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Begin delivering frames. Fails with `DeviceUnavailable` if the device
    /// cannot run at the requested format.
    fn start(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
        on_error: DeviceErrorCallback,
    ) -> SessionResult<()>;

    /// Stop delivering frames. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// A speaker-like sink that pulls samples from a render callback.
pub trait OutputDevice: Send {
    fn name(&self) -> String;

    /// Begin pulling audio. Fails with `DeviceUnavailable` if the device cannot
    /// run at the requested format.
    fn start(&mut self, sample_rate: u32, render: RenderCallback) -> SessionResult<()>;

    /// Stop pulling audio. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Acquires the devices for one session.
///
/// Opening a device is the "permission" step: a denied or missing device surfaces
/// here as `DeviceUnavailable` and is never retried automatically.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self) -> SessionResult<Box<dyn InputDevice>>;
    fn open_output(&self) -> SessionResult<Box<dyn OutputDevice>>;
}

/// Which input device the configuration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSelector {
    /// Platform default microphone
    Default,
    /// Stream a WAV file as if it were a microphone
    Wav(String),
}

/// Which output device the configuration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSelector {
    /// Platform default speaker
    Default,
    /// Discard audio at real-time pace
    Null,
}

impl std::str::FromStr for InputSelector {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("default") {
            return Ok(InputSelector::Default);
        }
        match trimmed.strip_prefix("wav:") {
            Some(path) if !path.is_empty() => Ok(InputSelector::Wav(path.to_string())),
            _ => Err(SessionError::Config(format!("Unknown input device: {}", s))),
        }
    }
}

impl std::str::FromStr for OutputSelector {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(OutputSelector::Default),
            "null" | "none" => Ok(OutputSelector::Null),
            _ => Err(SessionError::Config(format!("Unknown output device: {}", s))),
        }
    }
}

/// Backend built from configuration selectors.
pub struct ConfiguredBackend {
    input: InputSelector,
    output: OutputSelector,
}

impl ConfiguredBackend {
    pub fn new(input: InputSelector, output: OutputSelector) -> Self {
        Self { input, output }
    }

    /// Parse the `devices.input` / `devices.output` strings.
    pub fn from_selectors(input: &str, output: &str) -> SessionResult<Self> {
        Ok(Self::new(input.parse()?, output.parse()?))
    }

    pub fn into_shared(self) -> Arc<dyn AudioBackend> {
        Arc::new(self)
    }
}

impl AudioBackend for ConfiguredBackend {
    fn open_input(&self) -> SessionResult<Box<dyn InputDevice>> {
        match &self.input {
            InputSelector::Wav(path) => {
                info!(path = %path, "Using WAV file as microphone");
                Ok(Box::new(WavFileInput::open(path)?))
            }
            InputSelector::Default => open_default_input(),
        }
    }

    fn open_output(&self) -> SessionResult<Box<dyn OutputDevice>> {
        match self.output {
            OutputSelector::Null => Ok(Box::new(NullOutput::new())),
            OutputSelector::Default => open_default_output(),
        }
    }
}

#[cfg(feature = "cpal")]
fn open_default_input() -> SessionResult<Box<dyn InputDevice>> {
    Ok(Box::new(cpal_backend::CpalInput::open_default()?))
}

#[cfg(not(feature = "cpal"))]
fn open_default_input() -> SessionResult<Box<dyn InputDevice>> {
    tracing::warn!("Built without the `cpal` feature; no platform microphone");
    Err(SessionError::capture_unavailable(
        "no platform audio backend compiled in (enable the `cpal` feature or use wav:<path>)",
    ))
}

#[cfg(feature = "cpal")]
fn open_default_output() -> SessionResult<Box<dyn OutputDevice>> {
    Ok(Box::new(cpal_backend::CpalOutput::open_default()?))
}

#[cfg(not(feature = "cpal"))]
fn open_default_output() -> SessionResult<Box<dyn OutputDevice>> {
    tracing::warn!("Built without the `cpal` feature; no platform speaker");
    Err(SessionError::playback_unavailable(
        "no platform audio backend compiled in (enable the `cpal` feature or use null)",
    ))
}
