//! Headless Voice Bridge
//!
//! Meldet sich als `VOICE_BRIDGE_USER` (oder erstes Argument) am
//! Signaling-Server an und wartet auf Anrufe, bis Ctrl-C kommt.

use anyhow::{bail, Context};
use tokio::sync::broadcast;
use voice_bridge_lib::call_engine::{CallEvent, CallSessionController, CallState};
use voice_bridge_lib::config::Config;
use voice_bridge_lib::host::HostServices;
use voice_bridge_lib::{init_logging, VoiceBridge};

const ENV_USER: &str = "VOICE_BRIDGE_USER";
const ENV_AUTO_ANSWER: &str = "VOICE_BRIDGE_AUTO_ANSWER";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::load().context("Failed to load configuration")?;

    let user_id = std::env::var(ENV_USER)
        .ok()
        .or_else(|| std::env::args().nth(1))
        .filter(|user| !user.trim().is_empty());
    let Some(user_id) = user_id else {
        bail!("No user id: set {} or pass it as the first argument", ENV_USER);
    };

    let host = host_services(&config, user_id.clone());
    let bridge = VoiceBridge::init(config, host);
    bridge.connect().context("Failed to start signaling")?;
    tracing::info!("Voice bridge running as {}", user_id);

    let auto_answer = std::env::var(ENV_AUTO_ANSWER).is_ok_and(|v| v == "1");
    if auto_answer {
        tracing::info!("Auto-answer enabled");
        tokio::spawn(auto_answer_calls(bridge.calls().clone(), bridge.calls().subscribe()));
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    bridge.shutdown().await;
    Ok(())
}

fn host_services(config: &Config, user_id: String) -> HostServices {
    #[allow(unused_mut)]
    let mut host = HostServices::headless(Some(user_id), config.playback.resolve_clip_dir());

    #[cfg(feature = "cpal-audio")]
    {
        use std::sync::Arc;
        use voice_bridge_lib::call_engine::{CpalCapture, CpalPlayback};
        host.capture = Arc::new(CpalCapture::new());
        host.playback = Arc::new(CpalPlayback::new());
    }

    host
}

/// Nimmt jeden klingelnden Anruf an
async fn auto_answer_calls(calls: CallSessionController, mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged(CallState::Ringing)) => {
                if let Err(e) = calls.accept().await {
                    tracing::warn!("Auto-answer failed: {}", e);
                }
            }
            Ok(CallEvent::Notice(notice)) => {
                tracing::info!("{}: {}", notice.title, notice.message);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
