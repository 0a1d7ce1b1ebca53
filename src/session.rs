//! # Voice Session Lifecycle
//!
//! Orchestrates one duplex voice call: acquires the devices, opens the transport,
//! routes inbound events, and guarantees cleanup on every exit path.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created, nothing acquired
//! 2. **Connecting**: microphone acquired, speaker started, transport opening
//! 3. **Active**: capture streaming to the agent, agent speech scheduled for playback
//! 4. **Error**: a fatal failure; the cause is kept for the UI
//! 5. **Closed**: ended by the user or by the agent
//!
//! ## Ownership:
//! The session owns the transport handle. The capture pipeline gets a send-only
//! [`AudioSender`](crate::transport::AudioSender), the playback scheduler only ever
//! sees audio that the event loop hands it, and each pipeline owns its device.
//!
//! ## Cleanup:
//! `end()`, fatal errors, remote close and `Drop` all go through one idempotent
//! teardown. Each step checks whether its resource is still held, so it is safe
//! from any state, including a half-finished `start()`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::capture::{CapturePipeline, MuteFlag};
use crate::audio::frame::{CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE, PLAYBACK_SAMPLE_RATE};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::visualizer::{LevelVisualizer, VisualizerSettings};
use crate::device::{AudioBackend, InputDevice};
use crate::error::{SessionError, SessionResult};
use crate::state::{MetricsSnapshot, SessionMetrics, SessionShared, SessionState};
use crate::transport::{
    Capabilities, Connector, EventReceiver, EventSender, SessionConfig, SessionEvent,
    TransportHandle,
};

/// Everything the lifecycle manager needs to run one call.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Passed through to the agent untouched
    pub agent: SessionConfig,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// `None` disables the level visualizer
    pub visualizer: Option<VisualizerSettings>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            agent: SessionConfig {
                model: String::new(),
                instructions: String::new(),
                voice: "Kore".to_string(),
                capabilities: Capabilities::default(),
            },
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            visualizer: Some(VisualizerSettings::default()),
        }
    }
}

/// Requests from a [`SessionControl`] to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    End,
}

/// How `connect()` finished when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connected {
    Active,
    /// A hang-up arrived before the call went active
    HungUp,
}

/// Report of a session, for logs and UIs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Time spent active, up to the end of the call or now
    pub duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// Cloneable UI-facing handle on a running session.
///
/// Everything here is safe to call from any task or thread, at any point in the
/// session's life, including after it ended.
#[derive(Clone)]
pub struct SessionControl {
    shared: Arc<SessionShared>,
    mute: MuteFlag,
    level: watch::Receiver<f32>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionControl {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Ask the event loop to hang up. Returns false if the session no longer exists.
    pub fn end(&self) -> bool {
        self.commands.send(Command::End).is_ok()
    }

    pub fn set_mute(&self, muted: bool) {
        self.mute.set(muted);
        info!(session_id = %self.shared.id, muted, "Microphone mute changed");
    }

    /// Flip mute and return the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = self.mute.toggle();
        info!(session_id = %self.shared.id, muted, "Microphone mute changed");
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    /// Latest playback level in `0.0..=1.0`.
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.last_error()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

/// One duplex voice call.
///
/// ## Usage Example:
/// ```rust,no_run
/// # async fn call(
/// #     connector: std::sync::Arc<dyn voice_duplex::transport::Connector>,
/// #     backend: std::sync::Arc<dyn voice_duplex::device::AudioBackend>,
/// # ) -> voice_duplex::error::SessionResult<()> {
/// use voice_duplex::session::{SessionOptions, VoiceSession};
///
/// let mut session = VoiceSession::new(SessionOptions::default(), connector, backend);
/// let control = session.control();
/// session.start().await?;
/// // hand `control` to the UI; `control.end()` hangs up
/// let final_state = session.run().await;
/// # Ok(())
/// # }
/// ```
pub struct VoiceSession {
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    shared: Arc<SessionShared>,

    capture: CapturePipeline,
    /// Microphone acquired during `start()` but not yet handed to capture
    pending_input: Option<Box<dyn InputDevice>>,
    playback: Option<PlaybackScheduler>,
    transport: Option<TransportHandle>,
    visualizer: Option<LevelVisualizer>,
    level: Arc<watch::Sender<f32>>,

    events_tx: EventSender,
    events_rx: EventReceiver,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    torn_down: bool,
}

impl VoiceSession {
    /// Create an idle session. Nothing is acquired until [`start`](Self::start).
    pub fn new(
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let shared = Arc::new(SessionShared::new());
        let capture = CapturePipeline::new(
            options.capture_sample_rate,
            options.frame_size,
            shared.clone(),
        );
        let (level, _) = watch::channel(0.0f32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        debug!(session_id = %shared.id, "Session created");
        Self {
            options,
            connector,
            backend,
            shared,
            capture,
            pending_input: None,
            playback: None,
            transport: None,
            visualizer: None,
            level: Arc::new(level),
            events_tx,
            events_rx,
            commands_tx,
            commands_rx,
            torn_down: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn control(&self) -> SessionControl {
        SessionControl {
            shared: self.shared.clone(),
            mute: self.capture.mute_flag(),
            level: self.level.subscribe(),
            commands: self.commands_tx.clone(),
        }
    }

    /// Sender for injecting events as if they came from the transport.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Acquire devices, open the transport and go active.
    ///
    /// Only valid from `idle`. On failure the session is left in `error`, fully
    /// torn down, and the cause is returned. Retrying means creating a new session.
    ///
    /// A hang-up from a [`SessionControl`] while connecting wins over the pending
    /// open: the session ends `closed` without starting capture, and `Ok` is returned.
    pub async fn start(&mut self) -> SessionResult<()> {
        let from = self.shared.state();
        if from != SessionState::Idle {
            return Err(SessionError::InvalidTransition {
                from: from.to_string(),
                to: SessionState::Connecting.to_string(),
            });
        }
        self.shared.transition(SessionState::Connecting);
        info!(session_id = %self.shared.id, "Session connecting");

        match self.connect().await {
            Ok(Connected::Active) => {
                info!(session_id = %self.shared.id, state = %self.shared.state(), "Session active");
                Ok(())
            }
            Ok(Connected::HungUp) => {
                info!(session_id = %self.shared.id, "Hang-up requested while connecting");
                self.end();
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    async fn connect(&mut self) -> SessionResult<Connected> {
        // Microphone permission is the first thing asked for
        self.pending_input = Some(self.backend.open_input()?);

        let output = self.backend.open_output()?;
        self.playback = Some(PlaybackScheduler::start(
            output,
            self.options.playback_sample_rate,
            self.shared.clone(),
        )?);

        let connector = self.connector.clone();
        let handle = tokio::select! {
            biased;
            Some(Command::End) = self.commands_rx.recv() => return Ok(Connected::HungUp),
            opened = connector.open(&self.options.agent, self.events_tx.clone()) => opened?,
        };
        let sender = handle.audio_sender();
        self.transport = Some(handle);

        if self.hang_up_pending() {
            return Ok(Connected::HungUp);
        }
        self.shared.transition(SessionState::Active);

        let input = self.pending_input.take().ok_or_else(|| {
            SessionError::capture_unavailable("input device released before capture started")
        })?;
        self.capture.start(input, sender, self.events_tx.clone())?;

        if let (Some(settings), Some(playback)) = (&self.options.visualizer, &self.playback) {
            self.visualizer = Some(LevelVisualizer::spawn(
                playback.tap(),
                settings.clone(),
                self.level.clone(),
            ));
        }
        Ok(Connected::Active)
    }

    /// Drain queued commands; true if any of them asks to hang up.
    fn hang_up_pending(&mut self) -> bool {
        let mut hang_up = false;
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                Command::End => hang_up = true,
            }
        }
        hang_up
    }

    /// Event loop: route transport events and control commands until the session
    /// reaches a terminal state, then return that state.
    ///
    /// Returns immediately for a session that was never started.
    pub async fn run(&mut self) -> SessionState {
        loop {
            let state = self.shared.state();
            if state.is_terminal() {
                self.teardown();
                return state;
            }
            if state == SessionState::Idle {
                return state;
            }

            tokio::select! {
                biased;
                Some(command) = self.commands_rx.recv() => self.handle_command(command),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::End => self.end(),
        }
    }

    /// Apply one inbound event. Events after the session ended are ignored.
    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.shared.state().is_terminal() {
            trace!(kind = event.kind(), "Ignoring event after session end");
            return;
        }

        match event {
            SessionEvent::AudioChunk(audio) => {
                let Some(playback) = self.playback.as_ref() else {
                    warn!(session_id = %self.shared.id, "Audio chunk before playback started");
                    return;
                };
                match playback.enqueue_encoded(&audio.data, audio.sample_rate) {
                    Ok(unit) => trace!(
                        unit = unit.id,
                        start = unit.start_frame,
                        frames = unit.duration_frames,
                        "Agent audio scheduled"
                    ),
                    Err(e) if !e.is_fatal() => {
                        warn!(session_id = %self.shared.id, error = %e, "Dropped inbound audio chunk");
                    }
                    Err(e) => self.fail(e),
                }
            }
            SessionEvent::Interrupted => {
                SessionMetrics::incr(&self.shared.metrics.interruptions);
                let cancelled = self.playback.as_ref().map_or(0, |p| p.cancel_all());
                info!(session_id = %self.shared.id, cancelled, "Agent interrupted, playback cancelled");
            }
            SessionEvent::TurnComplete => {
                debug!(session_id = %self.shared.id, "Agent turn complete");
            }
            SessionEvent::Closed { reason } => {
                info!(session_id = %self.shared.id, reason = %reason, "Transport closed by agent");
                self.shared.transition(SessionState::Closed);
                self.teardown();
            }
            SessionEvent::Error(e) if e.is_fatal() => self.fail(e),
            SessionEvent::Error(e) => {
                warn!(session_id = %self.shared.id, error = %e, "Recoverable session error");
            }
        }
    }

    /// Hang up. Always succeeds, from any state, any number of times.
    pub fn end(&mut self) {
        if !self.shared.state().is_terminal() {
            self.shared.transition(SessionState::Closed);
            info!(session_id = %self.shared.id, "Session ended by user");
        }
        self.teardown();
    }

    fn fail(&mut self, error: SessionError) {
        if self.shared.state().is_terminal() {
            debug!(session_id = %self.shared.id, error = %error, "Error after session end");
        } else {
            error!(session_id = %self.shared.id, code = error.code(), error = %error, "Session failed");
            self.shared.record_error(error);
            self.shared.transition(SessionState::Error);
        }
        self.teardown();
    }

    /// Cancel playback, stop capture, close the transport, release both devices.
    fn teardown(&mut self) {
        if let Some(playback) = self.playback.as_ref() {
            playback.cancel_all();
        }
        self.capture.stop();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut visualizer) = self.visualizer.take() {
            visualizer.stop();
        }
        if let Some(mut input) = self.pending_input.take() {
            input.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.shutdown();
        }

        if !self.torn_down {
            self.torn_down = true;
            self.level.send_replace(0.0);
            let metrics = self.shared.metrics.snapshot();
            info!(
                session_id = %self.shared.id,
                state = %self.shared.state(),
                frames_sent = metrics.frames_sent,
                chunks_scheduled = metrics.chunks_scheduled,
                interruptions = metrics.interruptions,
                "Session torn down"
            );
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let started_at = self.shared.started_at();
        let ended_at = self.shared.ended_at();
        let duration_ms = started_at.map(|start| {
            (ended_at.unwrap_or_else(Utc::now) - start).num_milliseconds()
        });

        SessionSummary {
            id: self.shared.id,
            state: self.shared.state(),
            created_at: self.shared.created_at,
            started_at,
            ended_at,
            duration_ms,
            last_error: self.shared.last_error().map(|e| e.to_string()),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    #[cfg(test)]
    fn process_pending_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{decode_from_transport, float_to_pcm16};
    use crate::device::ManualBackend;
    use crate::transport::{InboundAudio, MemoryConnector, MemoryRemote, TransportSettings};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Agent that takes `delay` to answer, then behaves like the in-memory one.
    struct SlowConnector {
        inner: MemoryConnector,
        delay: Duration,
        /// Hang up through this handle right as the connection comes up
        end_on_open: Mutex<Option<SessionControl>>,
    }

    impl Connector for SlowConnector {
        fn open<'a>(
            &'a self,
            config: &'a SessionConfig,
            events: EventSender,
        ) -> BoxFuture<'a, SessionResult<TransportHandle>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                let handle = self.inner.open(config, events).await?;
                if let Some(control) = self.end_on_open.lock().unwrap().take() {
                    control.end();
                }
                Ok(handle)
            })
        }
    }

    fn slow_harness(delay: Duration) -> (Harness, Arc<SlowConnector>) {
        let backend = Arc::new(ManualBackend::new());
        let (inner, remote) = MemoryConnector::new(&TransportSettings::default());
        let connector = Arc::new(SlowConnector {
            inner,
            delay,
            end_on_open: Mutex::new(None),
        });
        let session = VoiceSession::new(options(None), connector.clone(), backend.clone());
        (
            Harness {
                session,
                backend,
                remote,
            },
            connector,
        )
    }

    struct Harness {
        session: VoiceSession,
        backend: Arc<ManualBackend>,
        remote: MemoryRemote,
    }

    fn options(visualizer: Option<VisualizerSettings>) -> SessionOptions {
        SessionOptions {
            agent: SessionConfig {
                model: "live-audio".to_string(),
                instructions: "You are a career counsellor.".to_string(),
                voice: "Kore".to_string(),
                capabilities: Capabilities { search: true },
            },
            visualizer,
            ..SessionOptions::default()
        }
    }

    fn harness_with(options: SessionOptions, settings: TransportSettings) -> Harness {
        let backend = Arc::new(ManualBackend::new());
        let (connector, remote) = MemoryConnector::new(&settings);
        let session = VoiceSession::new(options, Arc::new(connector), backend.clone());
        Harness {
            session,
            backend,
            remote,
        }
    }

    fn harness() -> Harness {
        harness_with(options(None), TransportSettings::default())
    }

    fn sine_frame() -> Vec<f32> {
        (0..DEFAULT_FRAME_SIZE)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin() * 0.5)
            .collect()
    }

    fn speech(frames: usize, value: f32) -> Vec<u8> {
        float_to_pcm16(&vec![value; frames])
    }

    fn nothing_held(h: &Harness) -> bool {
        !h.backend.input().is_held() && !h.backend.output().is_held() && !h.remote.is_open()
    }

    #[tokio::test]
    async fn test_start_goes_active() {
        let mut h = harness();
        let mut states = h.session.control().subscribe_state();
        h.session.start().await.unwrap();

        assert_eq!(h.session.state(), SessionState::Active);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Active);
        assert_eq!(h.backend.input_open_count(), 1);
        assert_eq!(h.backend.input().start_count(), 1);
        assert_eq!(h.backend.input().frame_size(), 4096);
        assert_eq!(h.backend.output().sample_rate(), 24_000);
        assert!(h.remote.is_open());

        let config = h.remote.last_config().unwrap();
        assert_eq!(config.voice, "Kore");
        assert!(config.capabilities.search);
        assert!(h.session.summary().started_at.is_some());
    }

    #[tokio::test]
    async fn test_sine_frame_reaches_agent_as_one_payload() {
        let mut h = harness();
        h.session.start().await.unwrap();

        assert!(h.backend.input().push(&sine_frame()));
        let sent = h.remote.take_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].media_type, "audio/pcm;rate=16000");
        assert_eq!(decode_from_transport(&sent[0].data).unwrap().len(), 8192);
    }

    #[tokio::test]
    async fn test_agent_audio_plays_gaplessly() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let output = h.backend.output();

        h.remote.inject_audio(&speech(2400, 0.5));
        h.remote.inject_audio(&speech(2400, 0.25));
        h.session.process_pending_events();

        let rendered = output.render(4800);
        assert!(rendered[..2400].iter().all(|&s| s == 0.5));
        assert!(rendered[2400..].iter().all(|&s| s == 0.25));
        assert_eq!(h.session.summary().metrics.units_completed, 2);
    }

    #[tokio::test]
    async fn test_interruption_silences_playback_immediately() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let output = h.backend.output();

        for _ in 0..3 {
            h.remote.inject_audio(&speech(2400, 0.5));
        }
        h.session.process_pending_events();
        assert!(output.render(1200).iter().all(|&s| s == 0.5));

        h.remote.inject(SessionEvent::Interrupted);
        h.session.process_pending_events();

        assert!(output.render(7200).iter().all(|&s| s == 0.0));
        assert_eq!(h.session.state(), SessionState::Active);
        let metrics = h.session.summary().metrics;
        assert_eq!(metrics.interruptions, 1);
        assert_eq!(metrics.units_cancelled, 3);
        assert_eq!(metrics.units_completed, 0);

        // The next turn starts from the current clock
        h.remote.inject_audio(&speech(480, 0.25));
        h.session.process_pending_events();
        assert_eq!(output.render(480), vec![0.25; 480]);
    }

    #[tokio::test]
    async fn test_mute_toggling_never_reacquires_microphone() {
        let mut h = harness();
        let control = h.session.control();
        control.set_mute(true);
        h.session.start().await.unwrap();

        h.backend.input().push(&sine_frame());
        assert!(h.remote.take_outbound().is_empty());

        for _ in 0..25 {
            control.toggle_mute();
            control.toggle_mute();
        }
        control.set_mute(false);
        h.backend.input().push(&sine_frame());
        assert_eq!(h.remote.take_outbound().len(), 1);

        assert_eq!(h.backend.input_open_count(), 1);
        assert_eq!(h.backend.input().start_count(), 1);
        assert_eq!(control.metrics().frames_muted, 1);
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_dropped_not_fatal() {
        let mut h = harness();
        h.session.start().await.unwrap();

        h.remote.inject(SessionEvent::AudioChunk(InboundAudio::new("***")));
        h.remote.inject_audio(&[1, 2, 3]);
        h.remote.inject(SessionEvent::AudioChunk(InboundAudio {
            data: "AAAA".to_string(),
            sample_rate: 16_000,
        }));
        h.session.process_pending_events();

        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.session.summary().metrics.chunks_dropped, 3);
        assert!(h.session.control().last_error().is_none());
    }

    #[tokio::test]
    async fn test_agent_close_tears_everything_down() {
        let mut h = harness();
        h.session.start().await.unwrap();
        h.remote.inject_audio(&speech(2400, 0.5));
        h.remote.hang_up("goodbye");
        h.session.process_pending_events();

        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(nothing_held(&h));
        assert!(h.session.control().last_error().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let mut h = harness();
        h.session.start().await.unwrap();

        let cause = SessionError::TransportClosed("connection reset".to_string());
        h.remote.inject(SessionEvent::Error(cause.clone()));
        h.remote.inject(SessionEvent::Closed { reason: "late".to_string() });
        h.session.process_pending_events();

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.session.control().last_error(), Some(cause));
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_microphone_failure_mid_call() {
        let mut h = harness();
        h.session.start().await.unwrap();

        assert!(h.backend.input().fail("device unplugged"));
        h.session.process_pending_events();

        assert_eq!(h.session.state(), SessionState::Error);
        assert!(h.session.control().last_error().unwrap().is_capture_unavailable());
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_backpressure_ends_the_call() {
        let settings = TransportSettings {
            send_buffer_frames: 2,
            ..TransportSettings::default()
        };
        let mut h = harness_with(options(None), settings);
        h.session.start().await.unwrap();

        for _ in 0..3 {
            h.backend.input().push(&sine_frame());
        }
        h.session.process_pending_events();

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(
            h.session.control().last_error(),
            Some(SessionError::TransportBackpressure { queued: 2 })
        );
        assert_eq!(h.session.summary().metrics.send_failures, 1);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_start_cleanly() {
        let mut h = harness();
        h.backend.deny_input("permission denied");

        let err = h.session.start().await.unwrap_err();
        assert!(err.is_capture_unavailable());
        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.backend.output_open_count(), 0);
        assert_eq!(h.remote.open_count(), 0);

        h.session.end();
        h.session.end();
        assert_eq!(h.session.state(), SessionState::Error);
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_transport_open_failure_releases_devices() {
        let mut h = harness();
        h.remote.fail_open("agent offline");

        let err = h.session.start().await.unwrap_err();
        assert_eq!(err, SessionError::TransportOpenFailed("agent offline".to_string()));
        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.backend.input_open_count(), 1);
        assert_eq!(h.backend.output_open_count(), 1);
        assert_eq!(h.backend.input().start_count(), 0);
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_speaker_unavailable_releases_microphone() {
        let mut h = harness();
        h.backend.deny_output("no speaker");

        let err = h.session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable { .. }));
        assert!(!err.is_capture_unavailable());
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_end_twice_after_active() {
        let mut h = harness();
        h.session.start().await.unwrap();
        h.session.end();
        h.session.end();

        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(nothing_held(&h));
        assert!(h.session.summary().ended_at.is_some());
        // Late events are ignored
        h.remote.inject(SessionEvent::Error(SessionError::Remote("late".to_string())));
        h.session.process_pending_events();
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_end_before_start() {
        let mut h = harness();
        h.session.end();
        h.session.end();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.backend.input_open_count(), 0);
        assert_eq!(h.remote.open_count(), 0);

        let err = h.session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let err = h.session.start().await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                from: "active".to_string(),
                to: "connecting".to_string()
            }
        );
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.backend.input_open_count(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_routes_events_until_close() {
        let mut h = harness();
        h.session.start().await.unwrap();

        h.remote.inject_audio(&speech(2400, 0.5));
        h.remote.inject(SessionEvent::TurnComplete);
        h.remote.hang_up("done");

        let state = tokio::time::timeout(Duration::from_secs(1), h.session.run())
            .await
            .unwrap();
        assert_eq!(state, SessionState::Closed);
        assert_eq!(h.session.summary().metrics.chunks_scheduled, 1);
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_control_end_stops_run_loop() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let control = h.session.control();

        let ender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            control.end()
        });
        let state = tokio::time::timeout(Duration::from_secs(1), h.session.run())
            .await
            .unwrap();

        assert!(ender.await.unwrap());
        assert_eq!(state, SessionState::Closed);
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_hang_up_while_connecting_wins() {
        let (mut h, _connector) = slow_harness(Duration::from_millis(200));
        let control = h.session.control();

        let ender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let state = control.state();
            control.end();
            state
        });
        let started = tokio::time::timeout(Duration::from_millis(150), h.session.start())
            .await
            .expect("hang-up must not wait for the connect to finish");

        assert!(started.is_ok());
        assert_eq!(ender.await.unwrap(), SessionState::Connecting);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.backend.input().start_count(), 0);
        assert_eq!(h.remote.open_count(), 0);
        assert!(nothing_held(&h));
        assert!(h.session.control().last_error().is_none());
        assert_eq!(h.session.run().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_hang_up_queued_before_start() {
        let mut h = harness();
        assert!(h.session.control().end());

        h.session.start().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.remote.open_count(), 0);
        assert_eq!(h.backend.input().start_count(), 0);
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_hang_up_as_transport_opens_skips_capture() {
        let (mut h, connector) = slow_harness(Duration::ZERO);
        *connector.end_on_open.lock().unwrap() = Some(h.session.control());

        h.session.start().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.remote.open_count(), 1);
        assert_eq!(h.backend.input().start_count(), 0);
        assert!(h.session.summary().started_at.is_none());
        assert!(nothing_held(&h));
    }

    #[tokio::test]
    async fn test_run_without_start_returns_idle() {
        let mut h = harness();
        assert_eq!(h.session.run().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_visualizer_follows_playback() {
        let visualizer = VisualizerSettings {
            tick: Duration::from_millis(5),
            smoothing: 0.0,
            ..VisualizerSettings::default()
        };
        let mut h = harness_with(options(Some(visualizer)), TransportSettings::default());
        let control = h.session.control();
        h.session.start().await.unwrap();

        let tone: Vec<f32> = (0..2400)
            .map(|i| 0.8 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 24_000.0).sin())
            .collect();
        h.remote.inject_audio(&float_to_pcm16(&tone));
        h.session.process_pending_events();
        h.backend.output().render(2400);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(control.level() > 0.0);

        h.session.end();
        assert_eq!(control.level(), 0.0);
    }

    #[tokio::test]
    async fn test_drop_releases_everything() {
        let mut h = harness();
        h.session.start().await.unwrap();
        let control = h.session.control();

        let Harness {
            session,
            backend,
            remote,
        } = h;
        drop(session);

        assert_eq!(control.state(), SessionState::Closed);
        assert!(!backend.input().is_held());
        assert!(!backend.output().is_held());
        assert!(!remote.is_open());
        assert!(!control.end());
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let mut h = harness();
        h.session.start().await.unwrap();
        h.backend.input().push(&sine_frame());
        h.session.end();

        let summary = h.session.summary();
        assert_eq!(summary.state, SessionState::Closed);
        assert!(summary.duration_ms.unwrap() >= 0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["metrics"]["bytes_sent"], 8192);
    }
}
