use std::sync::Arc;

use call_media::{MediaEvent, MediaSessionManager, TrackKind};
use call_signaling::{CallType, RoomId, SignalingTransport, UserId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::CallSettings;
use crate::engine::{CallSnapshot, Command, Engine, EngineChannels};
use crate::error::CallError;
use crate::machine::Trigger;
use crate::session::CallSession;

/// Cloneable front door to one client's call engine.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    /// Starts the engine task. Takes the transport's inbound stream, so the
    /// transport must not have been subscribed to before.
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        media: Arc<MediaSessionManager>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
        settings: &CallSettings,
    ) -> Result<(Self, JoinHandle<()>), CallError> {
        let transport_events = transport.subscribe()?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots) = watch::channel(CallSnapshot::default());
        let engine = Engine::new(
            transport,
            media,
            snapshots_tx,
            settings.unanswered_timeout(),
        );
        let task = tokio::spawn(engine.run(EngineChannels {
            commands,
            transport: transport_events,
            media: media_events,
        }));
        Ok((
            Self {
                commands: commands_tx,
                snapshots,
            },
            task,
        ))
    }

    pub async fn initiate_call(
        &self,
        target: UserId,
        room: RoomId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.intent(Trigger::Initiate {
            target,
            room,
            call_type,
        })
        .await
    }

    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.intent(Trigger::Answer).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.intent(Trigger::Reject).await
    }

    /// Hangs up. Calling it again after the call has ended is a no-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.intent(Trigger::End).await
    }

    /// Clears a rejected, ended or failed call back to idle.
    pub async fn dismiss(&self) -> Result<(), CallError> {
        self.intent(Trigger::Dismiss).await
    }

    /// Gives up on a call nobody has answered.
    pub async fn expire(&self) -> Result<(), CallError> {
        self.intent(Trigger::Expire).await
    }

    /// Mutes or unmutes the local tracks of `kind`. Returns whether anything
    /// changed.
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetTrack {
            kind,
            enabled,
            reply,
        })?;
        rx.await.map_err(|_| CallError::EngineClosed)?
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn session(&self) -> CallSession {
        self.snapshots.borrow().session.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Ends any active call, waits for queued effects and releases media.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| CallError::EngineClosed)
    }

    async fn intent(&self, trigger: Trigger) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Intent { trigger, reply })?;
        rx.await.map_err(|_| CallError::EngineClosed)?
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::EngineClosed)
    }
}
