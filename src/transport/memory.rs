//! # In-Memory Transport
//!
//! A connector with no network behind it. The [`MemoryRemote`] plays the agent:
//! it injects events, reads what the client sent, and can refuse connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::audio::codec::encode_for_transport;
use crate::error::{SessionError, SessionResult};
use crate::transport::{
    Connector, EventSender, InboundAudio, OutboundFrame, SessionConfig, SessionEvent,
    TransportHandle, TransportLink, TransportSettings,
};

#[derive(Default)]
struct RemoteState {
    link: Mutex<Option<TransportLink>>,
    config: Mutex<Option<SessionConfig>>,
    fail_open: Mutex<Option<String>>,
    opens: AtomicUsize,
}

/// The agent's side of a [`MemoryConnector`].
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<RemoteState>,
}

impl MemoryRemote {
    fn link(&self) -> MutexGuard<'_, Option<TransportLink>> {
        self.state.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an event to the session. Returns false when no session is listening.
    pub fn inject(&self, event: SessionEvent) -> bool {
        self.link().as_ref().is_some_and(|link| link.deliver(event))
    }

    /// Inject PCM16 bytes as an `audio_chunk` at the default playback rate.
    pub fn inject_audio(&self, pcm: &[u8]) -> bool {
        self.inject(SessionEvent::AudioChunk(InboundAudio::new(encode_for_transport(pcm))))
    }

    /// The agent hangs up: the connection is marked closed and `closed` is delivered.
    pub fn hang_up(&self, reason: &str) -> bool {
        let link = self.link();
        match link.as_ref() {
            Some(link) => {
                link.mark_closed();
                link.deliver(SessionEvent::Closed {
                    reason: reason.to_string(),
                })
            }
            None => false,
        }
    }

    /// Everything the client has sent so far and not yet taken.
    pub fn take_outbound(&self) -> Vec<OutboundFrame> {
        let mut link = self.link();
        let mut frames = Vec::new();
        if let Some(link) = link.as_mut() {
            while let Ok(frame) = link.outbound.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Refuse every following open with `TransportOpenFailed`.
    pub fn fail_open(&self, reason: &str) {
        *self.state.fail_open.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Configuration received by the last successful open.
    pub fn last_config(&self) -> Option<SessionConfig> {
        self.state
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a connection was opened and has not been closed by either side.
    pub fn is_open(&self) -> bool {
        self.link().as_ref().is_some_and(|link| !link.is_closed())
    }
}

/// Connector backed by a [`MemoryRemote`].
pub struct MemoryConnector {
    send_buffer_frames: usize,
    remote: MemoryRemote,
}

impl MemoryConnector {
    pub fn new(settings: &TransportSettings) -> (Self, MemoryRemote) {
        let remote = MemoryRemote::default();
        let connector = Self {
            send_buffer_frames: settings.send_buffer_frames,
            remote: remote.clone(),
        };
        (connector, remote)
    }
}

impl Connector for MemoryConnector {
    fn open<'a>(
        &'a self,
        config: &'a SessionConfig,
        events: EventSender,
    ) -> BoxFuture<'a, SessionResult<TransportHandle>> {
        Box::pin(async move {
            let state = &self.remote.state;
            state.opens.fetch_add(1, Ordering::SeqCst);

            let refusal = state
                .fail_open
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(reason) = refusal {
                return Err(SessionError::TransportOpenFailed(reason));
            }

            let (handle, link) = TransportHandle::new(self.send_buffer_frames, events);
            *self.remote.link() = Some(link);
            *state.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
            debug!(voice = %config.voice, "In-memory transport opened");
            Ok(handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{EncodedChunk, Pcm16Buffer, CAPTURE_SAMPLE_RATE};
    use crate::transport::Capabilities;
    use tokio::sync::mpsc;

    fn config() -> SessionConfig {
        SessionConfig {
            model: "test".to_string(),
            instructions: String::new(),
            voice: "Kore".to_string(),
            capabilities: Capabilities::default(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_remote() {
        let (connector, remote) = MemoryConnector::new(&TransportSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = connector.open(&config(), tx).await.unwrap();

        assert!(remote.is_open());
        assert_eq!(remote.last_config().unwrap().voice, "Kore");

        let chunk = EncodedChunk::new(Pcm16Buffer::new(vec![0u8; 4], CAPTURE_SAMPLE_RATE));
        handle.audio_sender().send_audio(&chunk).unwrap();
        let sent = remote.take_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].decode().unwrap(), chunk);

        assert!(remote.inject(SessionEvent::TurnComplete));
        assert_eq!(rx.recv().await, Some(SessionEvent::TurnComplete));

        handle.close();
        assert!(!remote.is_open());
    }

    #[tokio::test]
    async fn test_refused_open() {
        let (connector, remote) = MemoryConnector::new(&TransportSettings::default());
        remote.fail_open("agent offline");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = connector.open(&config(), tx).await.err().unwrap();
        assert_eq!(err, SessionError::TransportOpenFailed("agent offline".to_string()));
        assert_eq!(remote.open_count(), 1);
        assert!(!remote.is_open());
        assert!(!remote.inject(SessionEvent::Interrupted));
    }
}
