//! # Transport Adapter
//!
//! The boundary to the remote conversational agent. One connection per session.
//!
//! ## Views:
//! - [`TransportHandle`]: owned by the lifecycle manager; the only thing that can close
//!   the connection
//! - [`AudioSender`]: send-only view handed to the capture pipeline
//! - inbound [`SessionEvent`]s arrive on an unbounded channel consumed by the
//!   lifecycle manager's event loop, which forwards audio to the playback scheduler
//!
//! ## Backpressure:
//! Outbound frames go through a bounded queue. Sending never blocks the capture
//! thread: when the queue is full the frame is refused with `TransportBackpressure`
//! and the lifecycle manager is told once per backpressure episode.
//!
//! ## Implementations:
//! - [`websocket::WsConnector`]: JSON over WebSocket
//! - [`memory::MemoryConnector`]: in-process, for tests and offline runs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::audio::codec::{decode_from_transport, encode_for_transport};
use crate::audio::frame::{EncodedChunk, MediaType, PLAYBACK_SAMPLE_RATE};
use crate::error::{SessionError, SessionResult};

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryRemote};
pub use websocket::{AgentMessage, ClientMessage, WsConnector};

/// Connection tuning shared by every connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Outbound queue length, in frames, before sends report backpressure
    pub send_buffer_frames: usize,
    pub connect_timeout: Duration,
    /// Wait for the agent to acknowledge the setup message before reporting open
    pub await_setup_ack: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            send_buffer_frames: 32,
            connect_timeout: Duration::from_secs(10),
            await_setup_ack: true,
        }
    }
}

/// Capability flags enabled for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Let the agent ground answers with web search
    pub search: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { search: true }
    }
}

/// Session configuration passed through to the agent at open.
///
/// Opaque to this crate: nothing here changes how audio is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    /// Persona and instruction text
    pub instructions: String,
    /// Voice/style selector
    pub voice: String,
    pub capabilities: Capabilities,
}

/// One outbound audio frame as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// PCM16 bytes in transport encoding
    pub data: String,
}

impl OutboundFrame {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            media_type: chunk.media_type.to_string(),
            data: encode_for_transport(&chunk.pcm),
        }
    }

    /// Back to a chunk. Used by receivers of outbound traffic (tests, loopback agents).
    pub fn decode(&self) -> SessionResult<EncodedChunk> {
        let media_type: MediaType = self.media_type.parse()?;
        Ok(EncodedChunk {
            media_type,
            pcm: decode_from_transport(&self.data)?,
        })
    }
}

/// Synthesized speech from the agent, still in transport encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    pub data: String,
    pub sample_rate: u32,
}

impl InboundAudio {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

/// Everything the transport can tell the lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A chunk of synthesized speech to play
    AudioChunk(InboundAudio),
    /// The user started talking; stop all playback now
    Interrupted,
    /// The agent finished its turn
    TurnComplete,
    /// The connection ended
    Closed { reason: String },
    /// A transport, remote or device failure
    Error(SessionError),
}

impl SessionEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::AudioChunk(_) => "audio_chunk",
            SessionEvent::Interrupted => "interrupted",
            SessionEvent::TurnComplete => "turn_complete",
            SessionEvent::Closed { .. } => "closed",
            SessionEvent::Error(_) => "error",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Opens the connection to the agent.
pub trait Connector: Send + Sync {
    /// Resolves once the connection is open. Inbound events go to `events`
    /// from then on, until the handle is closed or the connection ends.
    fn open<'a>(
        &'a self,
        config: &'a SessionConfig,
        events: EventSender,
    ) -> BoxFuture<'a, SessionResult<TransportHandle>>;
}

/// The lifecycle manager's handle on an open connection.
pub struct TransportHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    capacity: usize,
    events: EventSender,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: Arc<AtomicBool>,
    backpressured: Arc<AtomicBool>,
}

/// The connection side of a [`TransportHandle`], driven by a connector's I/O task.
pub struct TransportLink {
    /// Frames to put on the wire, in capture order
    pub outbound: mpsc::Receiver<OutboundFrame>,
    /// Fires when the handle is closed
    pub shutdown: oneshot::Receiver<()>,
    /// Where to deliver inbound events
    pub events: EventSender,
    closed: Arc<AtomicBool>,
}

impl TransportLink {
    /// Mark the connection as gone so further sends fail fast.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an inbound event. Returns false once nobody is listening.
    pub fn deliver(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl TransportHandle {
    /// Create a handle with an outbound queue of `capacity` frames, and the link
    /// the connector drives.
    pub fn new(capacity: usize, events: EventSender) -> (Self, TransportLink) {
        let capacity = capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let handle = Self {
            outbound: outbound_tx,
            capacity,
            events: events.clone(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            closed: closed.clone(),
            backpressured: Arc::new(AtomicBool::new(false)),
        };
        let link = TransportLink {
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            events,
            closed,
        };
        (handle, link)
    }

    /// Send-only view for the capture pipeline.
    pub fn audio_sender(&self) -> AudioSender {
        AudioSender {
            outbound: self.outbound.clone(),
            capacity: self.capacity,
            events: self.events.clone(),
            closed: self.closed.clone(),
            backpressured: self.backpressured.clone(),
        }
    }

    /// Best-effort graceful shutdown. Safe to call repeatedly, including from
    /// inside close or error handling.
    pub fn close(&self) {
        // The remote side may have marked us closed already; the driver still needs releasing
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        self.signal_shutdown();
        if !was_closed {
            info!("Transport closed");
        }
    }

    fn signal_shutdown(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The driver may already be gone
            let _ = sender.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Send-only view of the transport. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct AudioSender {
    outbound: mpsc::Sender<OutboundFrame>,
    capacity: usize,
    events: EventSender,
    closed: Arc<AtomicBool>,
    backpressured: Arc<AtomicBool>,
}

impl AudioSender {
    /// Queue one chunk for sending without blocking.
    ///
    /// ## Errors:
    /// - `TransportBackpressure` when the outbound queue is full (the lifecycle
    ///   manager is also notified, once per episode)
    /// - `TransportClosed` once the connection is gone
    pub fn send_audio(&self, chunk: &EncodedChunk) -> SessionResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::TransportClosed("transport is closed".to_string()));
        }

        match self.outbound.try_send(OutboundFrame::from_chunk(chunk)) {
            Ok(()) => {
                if self.backpressured.swap(false, Ordering::SeqCst) {
                    info!("Transport send queue drained");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = SessionError::TransportBackpressure {
                    queued: self.capacity,
                };
                if !self.backpressured.swap(true, Ordering::SeqCst) {
                    warn!(queued = self.capacity, "Transport send queue full");
                    let _ = self.events.send(SessionEvent::Error(err.clone()));
                }
                Err(err)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(SessionError::TransportClosed("connection is gone".to_string()))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
