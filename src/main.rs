//! # Voice Duplex - Terminal Client
//!
//! Runs one voice call against the configured agent from the terminal.
//!
//! ## Controls:
//! - `m` + Enter: toggle microphone mute
//! - `q` + Enter: end the call
//! - Ctrl+C / SIGTERM: end the call
//!
//! When the call ends, a JSON summary of the session is printed to stdout.
//! Logs go to stderr and are controlled by `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex::config::AppConfig;
use voice_duplex::session::{SessionControl, VoiceSession};
use voice_duplex::state::SessionState;
use voice_duplex::transport::WsConnector;

/// Entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `voice.toml`, `.env` and the environment
/// 2. **Sets up logging**
/// 3. **Builds the device backend** and the WebSocket connector
/// 4. **Starts the session** and wires terminal controls and signals to it
/// 5. **Runs the event loop** until the call ends, then prints the summary
#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-duplex v{}", env!("CARGO_PKG_VERSION"));
    info!(
        agent = %config.agent.url,
        input = %config.devices.input,
        output = %config.devices.output,
        "Configuration loaded"
    );

    let backend = config.backend()?;
    let connector = Arc::new(WsConnector::new(
        config.agent.url.clone(),
        config.transport_settings(),
    ));

    let mut session = VoiceSession::new(config.session_options(), connector, backend);
    let control = session.control();

    spawn_state_logger(&control);
    spawn_level_logger(&control);
    setup_signal_handlers(control.clone());

    if let Err(e) = session.start().await {
        error!(error = %e, "Could not start the call");
        print_summary(&session);
        bail!("Could not start the call: {}", e);
    }

    info!("Call active. Type `m` + Enter to toggle mute, `q` + Enter to hang up");
    spawn_stdin_controls(control.clone());

    let final_state = session.run().await;
    print_summary(&session);

    if final_state == SessionState::Error {
        match control.last_error() {
            Some(cause) => bail!("Call ended with an error: {}", cause),
            None => bail!("Call ended with an error"),
        }
    }

    info!("Call ended");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged (e.g. "debug", "voice_duplex=trace")
/// - If not set, defaults to "voice_duplex=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_duplex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// End the call on SIGTERM or SIGINT.
fn setup_signal_handlers(control: SessionControl) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers; use `q` to hang up");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        control.end();
    });
}

/// Stand-ins for the mute and hang-up buttons.
fn spawn_stdin_controls(control: SessionControl) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        let muted = control.toggle_mute();
                        info!("Microphone {}", if muted { "muted" } else { "live" });
                    }
                    "q" => {
                        control.end();
                        break;
                    }
                    "" => {}
                    other => warn!(command = other, "Unknown command (use `m` or `q`)"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Stopped reading terminal controls");
                    break;
                }
            }
        }
    });
}

fn spawn_state_logger(control: &SessionControl) {
    let mut states = control.subscribe_state();
    let session_id = control.id();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(session_id = %session_id, state = %state, "Session state changed");
            if state.is_terminal() {
                break;
            }
        }
    });
}

/// Log the playback level once per second while the call is active.
fn spawn_level_logger(control: &SessionControl) {
    let control = control.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            match control.state() {
                SessionState::Active => info!(
                    level = %format!("{:.2}", control.level()),
                    muted = control.is_muted(),
                    "Agent level"
                ),
                state if state.is_terminal() => break,
                _ => {}
            }
        }
    });
}

fn print_summary(session: &VoiceSession) {
    match serde_json::to_string_pretty(&session.summary()) {
        Ok(json) => println!("{}", json),
        Err(e) => error!(error = %e, "Failed to serialize session summary"),
    }
}
