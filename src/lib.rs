//! # Voice Duplex
//!
//! Real-time, full-duplex voice conversation with a remote agent.
//!
//! ## Crate Architecture:
//! - **audio**: codec, capture pipeline, playback scheduler and level visualizer
//! - **device**: microphone/speaker contracts and backends
//! - **transport**: connection to the agent (WebSocket or in-memory)
//! - **session**: lifecycle manager that wires everything together
//! - **state**: shared session record and metrics
//! - **config**: layered configuration
//! - **error**: error taxonomy

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod state;
pub mod transport;
