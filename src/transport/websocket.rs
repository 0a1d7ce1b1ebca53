//! # WebSocket Agent Transport
//!
//! Talks to the remote agent with JSON text frames over one WebSocket.
//!
//! ## Protocol:
//! 1. **Connect**: plain `ws://` or TLS `wss://`
//! 2. **Setup**: client sends `{"type":"setup", model, instructions, voice, capabilities}`
//! 3. **Ack**: agent answers `{"type":"setup_complete"}` (awaited when configured)
//! 4. **Streaming**: client sends `{"type":"audio","mediaType":"audio/pcm;rate=16000","data":"<base64>"}`
//!    while the agent sends `audio_chunk`, `interrupted`, `turn_complete`, `error` and `closed`
//!
//! ## I/O Task:
//! After the handshake one tokio task owns the socket. It multiplexes the outbound
//! queue, inbound messages and the local shutdown signal with `tokio::select!`.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::audio::frame::PLAYBACK_SAMPLE_RATE;
use crate::error::{SessionError, SessionResult};
use crate::transport::{
    Connector, EventSender, InboundAudio, OutboundFrame, SessionConfig, SessionEvent,
    TransportHandle, TransportLink, TransportSettings,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Messages the client puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sent once, right after connecting
    Setup(SessionConfig),
    /// One captured frame
    Audio(OutboundFrame),
}

/// Messages the agent sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    SetupComplete,
    AudioChunk {
        data: String,
        #[serde(default = "default_chunk_rate")]
        rate: u32,
    },
    Interrupted,
    TurnComplete,
    Error {
        cause: String,
    },
    Closed {
        #[serde(default)]
        reason: String,
    },
}

fn default_chunk_rate() -> u32 {
    PLAYBACK_SAMPLE_RATE
}

impl AgentMessage {
    /// The session event this message stands for. `setup_complete` has none.
    pub fn into_event(self) -> Option<SessionEvent> {
        match self {
            AgentMessage::SetupComplete => None,
            AgentMessage::AudioChunk { data, rate } => Some(SessionEvent::AudioChunk(InboundAudio {
                data,
                sample_rate: rate,
            })),
            AgentMessage::Interrupted => Some(SessionEvent::Interrupted),
            AgentMessage::TurnComplete => Some(SessionEvent::TurnComplete),
            AgentMessage::Error { cause } => Some(SessionEvent::Error(SessionError::Remote(cause))),
            AgentMessage::Closed { reason } => Some(SessionEvent::Closed { reason }),
        }
    }
}

/// Opens agent connections over WebSocket.
pub struct WsConnector {
    url: String,
    settings: TransportSettings,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, settings: TransportSettings) -> Self {
        // wss:// needs a process-level crypto provider (ignore if already installed)
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            url: url.into(),
            settings,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn handshake(&self, config: &SessionConfig) -> SessionResult<WsStream> {
        let (mut ws, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SessionError::TransportOpenFailed(format!("{}: {}", self.url, e)))?;
        info!(url = %self.url, status = %response.status(), "Connected to agent");

        let setup = serde_json::to_string(&ClientMessage::Setup(config.clone()))
            .map_err(|e| SessionError::TransportOpenFailed(format!("encode setup: {}", e)))?;
        ws.send(Message::Text(setup))
            .await
            .map_err(|e| SessionError::TransportOpenFailed(format!("send setup: {}", e)))?;

        if self.settings.await_setup_ack {
            wait_for_setup(&mut ws).await?;
            debug!("Agent acknowledged setup");
        }
        Ok(ws)
    }
}

impl Connector for WsConnector {
    fn open<'a>(
        &'a self,
        config: &'a SessionConfig,
        events: EventSender,
    ) -> BoxFuture<'a, SessionResult<TransportHandle>> {
        Box::pin(async move {
            let ws = tokio::time::timeout(self.settings.connect_timeout, self.handshake(config))
                .await
                .map_err(|_| {
                    SessionError::TransportOpenFailed(format!(
                        "no answer from {} within {}ms",
                        self.url,
                        self.settings.connect_timeout.as_millis()
                    ))
                })??;

            let (handle, link) = TransportHandle::new(self.settings.send_buffer_frames, events);
            tokio::spawn(drive(ws, link));
            Ok(handle)
        })
    }
}

async fn wait_for_setup(ws: &mut WsStream) -> SessionResult<()> {
    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| SessionError::TransportOpenFailed(e.to_string()))?;
        match message {
            Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(AgentMessage::SetupComplete) => return Ok(()),
                Ok(AgentMessage::Error { cause }) => {
                    return Err(SessionError::TransportOpenFailed(format!("agent refused setup: {}", cause)))
                }
                Ok(AgentMessage::Closed { reason }) => {
                    return Err(SessionError::TransportOpenFailed(format!("agent closed during setup: {}", reason)))
                }
                Ok(other) => debug!(message = ?other, "Ignoring message before setup_complete"),
                Err(e) => warn!(error = %e, "Unparseable message during setup"),
            },
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(SessionError::TransportOpenFailed(format!(
                    "connection closed during setup: {}",
                    reason
                )));
            }
            _ => {}
        }
    }
    Err(SessionError::TransportOpenFailed(
        "connection ended before setup completed".to_string(),
    ))
}

/// Deliver one inbound text frame. Returns false when the agent closed the session.
fn dispatch(events: &EventSender, text: &str) -> bool {
    match serde_json::from_str::<AgentMessage>(text) {
        Ok(message) => {
            let closing = matches!(message, AgentMessage::Closed { .. });
            if let Some(event) = message.into_event() {
                trace!(kind = event.kind(), "Agent event");
                let _ = events.send(event);
            }
            !closing
        }
        Err(e) => {
            warn!(error = %e, "Skipping unparseable agent message");
            true
        }
    }
}

async fn drive(ws: WsStream, mut link: TransportLink) {
    let (mut writer, mut reader) = ws.split();
    let events = link.events.clone();

    loop {
        tokio::select! {
            _ = &mut link.shutdown => {
                let _ = writer.send(Message::Close(None)).await;
                debug!("Closed agent socket");
                break;
            }
            frame = link.outbound.recv() => {
                let Some(frame) = frame else {
                    // Handle dropped
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&ClientMessage::Audio(frame)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode audio frame");
                        continue;
                    }
                };
                if let Err(e) = writer.send(Message::Text(json)).await {
                    let _ = events.send(SessionEvent::Error(SessionError::TransportClosed(e.to_string())));
                    break;
                }
            }
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(&events, &text) {
                        let _ = writer.send(Message::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by agent".to_string());
                    let _ = events.send(SessionEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SessionEvent::Error(SessionError::TransportClosed(e.to_string())));
                    break;
                }
                None => {
                    let _ = events.send(SessionEvent::Closed { reason: "connection ended".to_string() });
                    break;
                }
            },
        }
    }

    link.mark_closed();
    debug!("Agent transport task finished");
}
