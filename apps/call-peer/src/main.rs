mod cli;
mod logging;
mod pump;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use call_core::{CallHandle, CallSettings, CallSnapshot, CallStatus};
use call_media::{IceServer, MediaSessionManager, RtcPeerConnectionFactory, SyntheticDevices};
use call_signaling::{
    CallType, RelayContext, RoomId, SignalingTransport, UserId, WebSocketConfig,
    WebSocketTransport,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging.to_config())?;

    let mut settings = CallSettings::from_env();
    if let Some(relay) = &cli.relay {
        settings.relay_url = relay.clone();
    }

    let transport = Arc::new(WebSocketTransport::new(WebSocketConfig {
        url: settings.relay_url.clone(),
        heartbeat: settings.heartbeat(),
        join_timeout: settings.join_timeout(),
    }));
    let mut context = RelayContext::new(UserId(cli.user_id));
    if let Some(token) = &cli.token {
        context = context.with_token(token.clone());
    }

    let ice_servers = settings
        .ice_server_urls()
        .into_iter()
        .map(IceServer::new)
        .collect();
    let factory = RtcPeerConnectionFactory::new(ice_servers).context("failed to set up WebRTC")?;
    let (media, media_events) =
        MediaSessionManager::new(Arc::new(SyntheticDevices::default()), Arc::new(factory));

    let signaling: Arc<dyn SignalingTransport> = transport.clone();
    let (handle, engine) = CallHandle::spawn(signaling, Arc::new(media), media_events, &settings)?;
    transport
        .connect(&context)
        .await
        .with_context(|| format!("failed to join relay at {}", settings.relay_url))?;
    info!(user = cli.user_id, relay = %settings.relay_url, "joined relay");
    let pump = pump::spawn(handle.subscribe());

    let outcome = match cli.command {
        Command::Dial {
            target,
            room,
            audio_only,
        } => {
            let call_type = if audio_only {
                CallType::Audio
            } else {
                CallType::Video
            };
            dial(&handle, UserId(target), RoomId(room), call_type).await
        }
        Command::Listen { auto_answer } => listen(&handle, auto_answer).await,
    };

    handle.shutdown().await?;
    pump.abort();
    transport.disconnect().await;
    if let Err(err) = engine.await {
        warn!(error = %err, "call engine task failed");
    }
    outcome
}

async fn dial(handle: &CallHandle, target: UserId, room: RoomId, call_type: CallType) -> Result<()> {
    handle.initiate_call(target, room, call_type).await?;
    println!("calling {target} in room {room} ({call_type})");
    let mut snapshots = handle.subscribe();
    let finished = follow(handle, &mut snapshots, None).await?;
    if finished.session.status != CallStatus::Ended {
        bail!("call did not complete: {}", describe(&finished));
    }
    Ok(())
}

async fn listen(handle: &CallHandle, auto_answer: bool) -> Result<()> {
    let mut prompt = (!auto_answer).then(|| BufReader::new(tokio::io::stdin()).lines());
    let mut snapshots = handle.subscribe();
    println!("waiting for calls, ctrl-c to quit");
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.session.status != CallStatus::Ringing {
            continue;
        }
        let caller = snapshot
            .session
            .caller_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".into());
        println!("incoming call from {caller}");

        let accept = match prompt.as_mut() {
            None => true,
            Some(lines) => {
                println!("answer? [y/N]");
                matches!(
                    lines.next_line().await?.as_deref().map(str::trim),
                    Some("y" | "Y" | "yes")
                )
            }
        };
        // The caller may have given up while we were asking.
        let answered = if accept {
            handle.answer_call().await
        } else {
            handle.reject_call().await
        };
        if let Err(err) = answered {
            println!("call no longer available: {err}");
        } else if accept {
            let finished = follow(handle, &mut snapshots, Some(CallStatus::Connected)).await?;
            println!("{}", describe(&finished));
        }
        if handle.session().status.is_terminal() {
            handle.dismiss().await?;
        }
    }
}

/// Prints state changes until the call finishes. Ctrl-c hangs up.
async fn follow(
    handle: &CallHandle,
    snapshots: &mut watch::Receiver<CallSnapshot>,
    mut last: Option<CallStatus>,
) -> Result<CallSnapshot> {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let status = snapshot.session.status;
        if last != Some(status) {
            println!("{status}");
            last = Some(status);
        }
        if status.is_terminal() {
            return Ok(snapshot);
        }
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(handle.snapshot());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                handle.end_call().await?;
            }
        }
    }
}

fn describe(snapshot: &CallSnapshot) -> String {
    let session = &snapshot.session;
    match session.status {
        CallStatus::Ended => match session.duration() {
            Some(duration) => format!("call ended after {}s", duration.num_seconds()),
            None => "call ended before it connected".to_string(),
        },
        CallStatus::Rejected => format!(
            "call rejected: {}",
            session.reject_reason.as_deref().unwrap_or("no reason given")
        ),
        CallStatus::Error => format!(
            "call failed: {}",
            session.error.as_deref().unwrap_or("unknown error")
        ),
        other => other.to_string(),
    }
}
