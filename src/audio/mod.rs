//! # Audio Pipeline
//!
//! Everything that touches samples.
//!
//! ## Key Components:
//! - **Frames**: float and PCM16 representations plus media-type tags
//! - **Codec**: float <-> PCM16 <-> base64 conversions
//! - **Capture**: microphone frames to the transport, behind a mute gate
//! - **Playback**: gapless, interruptible scheduling on the speaker's clock
//! - **Visualizer**: loudness summary tapped from the playback output
//!
//! ## Audio Format:
//! - **Capture**: 16kHz mono, 4096-sample frames
//! - **Playback**: 24kHz mono
//! - **Wire**: 16-bit little-endian PCM, base64 encoded

pub mod capture;
pub mod codec;
pub mod frame;
pub mod playback;
pub mod visualizer;

pub use capture::{CapturePipeline, MuteFlag};
pub use frame::{AudioFrame, EncodedChunk, MediaType, Pcm16Buffer};
pub use playback::{AnalysisTap, PlaybackScheduler, ScheduledPlaybackUnit};
pub use visualizer::{LevelAnalyzer, LevelVisualizer, VisualizerSettings};
