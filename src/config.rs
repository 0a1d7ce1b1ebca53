//! # Configuration Management
//!
//! This module loads the settings for one voice call from multiple sources:
//! - TOML configuration file (`voice.toml`, optional)
//! - Environment variables (with `VOICE__` prefix, `__` between levels)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the config layers are merged as generic values and deserialized into typed structs
//! - **#[serde(default)]**: a partial `voice.toml` only needs the keys it changes
//! - **Result<T, E>**: every loading and validation step can fail and says why
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `AGENT_URL` (special case for the agent endpoint)
//! 2. Environment variables (`VOICE__AGENT__VOICE`, `VOICE__AUDIO__FRAME_SIZE`, ...)
//! 3. Configuration file (`voice.toml`)
//! 4. Default values (defined in the Default impls)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::audio::frame::{CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE, PLAYBACK_SAMPLE_RATE};
use crate::audio::visualizer::VisualizerSettings;
use crate::device::{AudioBackend, ConfiguredBackend, InputSelector, OutputSelector};
use crate::session::SessionOptions;
use crate::transport::{Capabilities, SessionConfig, TransportSettings};

/// Persona used when none is configured.
const DEFAULT_INSTRUCTIONS: &str = "You are a helpful and empathetic career counsellor having a \
real-time voice conversation with a student. Listen to their concerns about their career or \
education and give guidance. Be warm, encouraging and realistic. Keep answers to one to three \
sentences and ask clarifying questions. Do not use any text formatting.";

/// Main configuration for a voice call.
///
/// ## Why separate config structs:
/// Each section maps onto one component (agent, audio pipeline, transport,
/// visualizer, devices), so a section can be handed to its component as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub visualizer: VisualizerConfig,
    pub devices: DevicesConfig,
}

/// Remote agent settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the agent (`ws://` or `wss://`)
/// - `model`: model identifier, passed through untouched
/// - `instructions`: persona and instruction text
/// - `voice`: voice/style selector (for example "Kore")
/// - `search_enabled`: let the agent use web search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    pub model: String,
    pub instructions: String,
    pub voice: String,
    pub search_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/live".to_string(),
            model: "native-audio-dialog".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: "Kore".to_string(),
            search_enabled: true,
        }
    }
}

/// Audio pipeline formats.
///
/// ## Common values:
/// - `capture_sample_rate = 16000`: what speech recognisers expect
/// - `playback_sample_rate = 24000`: what the agent synthesises
/// - `frame_size = 4096`: ~256ms per outbound frame at 16kHz
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

/// Connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Outbound frames allowed in flight before the call is treated as backed up
    pub send_buffer_frames: usize,
    pub connect_timeout_ms: u64,
    pub await_setup_ack: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_frames: 32,
            connect_timeout_ms: 10_000,
            await_setup_ack: true,
        }
    }
}

/// Level visualizer tuning. Mirrors a browser analyser node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub enabled: bool,
    pub fft_size: usize,
    pub tick_ms: u64,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fft_size: 256,
            tick_ms: 16,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Device selectors.
///
/// ## Values:
/// - `input = "default"` | `"wav:<path>"`
/// - `output = "default"` | `"null"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub input: String,
    pub output: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            input: "default".to_string(),
            output: "default".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `voice.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from("voice")
    }

    /// Load configuration with `file` as the optional configuration file.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from `file` (if it exists)
    /// 3. Override with `VOICE__`-prefixed environment variables
    /// 4. Apply `AGENT_URL` if set
    ///
    /// ## Environment Variable Examples:
    /// - `VOICE__AGENT__VOICE=Puck`: change the agent voice
    /// - `VOICE__DEVICES__INPUT=wav:question.wav`: use a file as the microphone
    /// - `VOICE__VISUALIZER__ENABLED=false`: turn the level meter off
    pub fn load_from(file: &str) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(url) = env::var("AGENT_URL") {
            settings = settings.set_override("agent.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Sample rates and frame size are non-zero
    /// - The agent URL is a WebSocket URL
    /// - The send buffer holds at least one frame
    /// - The FFT size is a power of two the analyser supports
    /// - Smoothing and decibel range are usable
    /// - Device selectors are known
    pub fn validate(&self) -> Result<()> {
        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            bail!("Sample rates must be greater than 0");
        }

        if self.audio.frame_size == 0 {
            bail!("Frame size must be greater than 0");
        }

        let url = self.agent.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!("Agent URL must start with ws:// or wss://, got {}", url);
        }

        if self.transport.send_buffer_frames == 0 {
            bail!("Send buffer must hold at least one frame");
        }

        let fft_size = self.visualizer.fft_size;
        if !fft_size.is_power_of_two() || !(32..=32_768).contains(&fft_size) {
            bail!("Visualizer FFT size must be a power of two between 32 and 32768, got {}", fft_size);
        }

        if !(0.0..=1.0).contains(&self.visualizer.smoothing) {
            bail!("Visualizer smoothing must be between 0 and 1");
        }

        if self.visualizer.min_decibels >= self.visualizer.max_decibels {
            bail!("Visualizer min_decibels must be below max_decibels");
        }

        self.devices.input.parse::<InputSelector>()?;
        self.devices.output.parse::<OutputSelector>()?;

        Ok(())
    }

    /// Everything the lifecycle manager needs for one call.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            agent: SessionConfig {
                model: self.agent.model.clone(),
                instructions: self.agent.instructions.clone(),
                voice: self.agent.voice.clone(),
                capabilities: Capabilities {
                    search: self.agent.search_enabled,
                },
            },
            capture_sample_rate: self.audio.capture_sample_rate,
            playback_sample_rate: self.audio.playback_sample_rate,
            frame_size: self.audio.frame_size,
            visualizer: self.visualizer.enabled.then(|| VisualizerSettings {
                fft_size: self.visualizer.fft_size,
                smoothing: self.visualizer.smoothing,
                min_decibels: self.visualizer.min_decibels,
                max_decibels: self.visualizer.max_decibels,
                tick: Duration::from_millis(self.visualizer.tick_ms),
            }),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            send_buffer_frames: self.transport.send_buffer_frames,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            await_setup_ack: self.transport.await_setup_ack,
        }
    }

    /// Device backend for the configured selectors.
    pub fn backend(&self) -> Result<Arc<dyn AudioBackend>> {
        let backend = ConfiguredBackend::from_selectors(&self.devices.input, &self.devices.output)?;
        Ok(backend.into_shared())
    }
}
