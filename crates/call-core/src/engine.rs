//! The engine task owns the call session. It is the only writer: every
//! intent, envelope, media event and effect report is folded through
//! [`transition`] here, in arrival order. Effects other than media release
//! run on a separate sequential executor so a slow SDP exchange never
//! blocks envelope handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use call_media::{
    LocalStream, MediaError, MediaEvent, MediaSessionManager, RemoteStream, SessionKey, TrackKind,
};
use call_signaling::{
    RelayRequest, RoomId, SessionDescription, Signal, SignalingTransport, TransportEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::CallError;
use crate::machine::{Context, Effect, Transition, Trigger, transition};
use crate::session::{CallSession, CallStatus};

/// What a subscriber sees after every transition.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub session: CallSession,
    pub local: Option<LocalStream>,
    pub remote: Option<RemoteStream>,
}

pub(crate) enum Command {
    Intent {
        trigger: Trigger,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetTrack {
        kind: TrackKind,
        enabled: bool,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcome of executor work that the engine has to know about.
#[derive(Debug)]
enum Report {
    LocalReady { epoch: u64, stream: LocalStream },
    Fault { epoch: u64, error: String },
}

struct Batch {
    epoch: u64,
    room: Option<RoomId>,
    effects: Vec<Effect>,
}

pub(crate) struct Engine {
    session: CallSession,
    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaSessionManager>,
    /// Epoch of the session while it is calling, ringing or connected; 0
    /// otherwise.
    live: Arc<AtomicU64>,
    snapshots: watch::Sender<CallSnapshot>,
    batches: Option<mpsc::UnboundedSender<Batch>>,
    executor: Option<JoinHandle<()>>,
    unanswered_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

pub(crate) struct EngineChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub media: mpsc::UnboundedReceiver<MediaEvent>,
}

impl Engine {
    pub(crate) fn new(
        transport: Arc<dyn SignalingTransport>,
        media: Arc<MediaSessionManager>,
        snapshots: watch::Sender<CallSnapshot>,
        unanswered_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session: CallSession::idle(),
            local: None,
            remote: None,
            transport,
            media,
            live: Arc::new(AtomicU64::new(0)),
            snapshots,
            batches: None,
            executor: None,
            unanswered_timeout,
            deadline: None,
        }
    }

    pub(crate) async fn run(mut self, channels: EngineChannels) {
        let EngineChannels {
            mut commands,
            transport: mut transport_events,
            media: mut media_events,
        } = channels;

        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let executor = Executor {
            transport: Arc::clone(&self.transport),
            media: Arc::clone(&self.media),
            live: Arc::clone(&self.live),
            reports: report_tx,
            offer: None,
            answered: None,
            faulted: None,
        };
        self.executor = Some(tokio::spawn(executor.run(batch_rx)));
        self.batches = Some(batch_tx);

        let mut transport_open = true;
        let mut media_open = true;
        let shutdown_reply = loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                event = transport_events.recv(), if transport_open => match event {
                    Some(TransportEvent::Envelope(envelope)) => {
                        trace!(
                            target = "call",
                            sender = %envelope.sender_id,
                            room = %envelope.room_id,
                            kind = ?envelope.signal_type(),
                            "envelope received"
                        );
                        self.apply(Trigger::Signal(envelope)).await;
                    }
                    Some(TransportEvent::Refused { room_id, reason }) => {
                        self.refused(room_id, reason).await;
                    }
                    Some(TransportEvent::Lost { reason }) => self.transport_lost(reason).await,
                    None => {
                        transport_open = false;
                        self.transport_lost("transport closed".to_string()).await;
                    }
                },
                event = media_events.recv(), if media_open => match event {
                    Some(event) => self.media_event(event).await,
                    None => media_open = false,
                },
                Some(report) = reports.recv() => self.report(report).await,
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.deadline = None;
                    debug!(target = "call", epoch = self.session.epoch, "call went unanswered");
                    self.apply(Trigger::Expire).await;
                }
            }
        };

        self.shutdown().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Intent { trigger, reply } => {
                let result = self.intent(trigger).await;
                let _ = reply.send(result);
            }
            Command::SetTrack {
                kind,
                enabled,
                reply,
            } => {
                let result = if self.session.status.is_active() {
                    Ok(self.media.set_track_enabled(kind, enabled))
                } else {
                    Err(CallError::NotPermitted {
                        intent: "set_track_enabled",
                        status: self.session.status,
                    })
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn intent(&mut self, trigger: Trigger) -> Result<(), CallError> {
        let status = self.session.status;
        match trigger {
            Trigger::Initiate { .. } if status.is_active() => return Err(CallError::Busy),
            // A second hangup is harmless.
            Trigger::End if status.is_terminal() => return Ok(()),
            _ => {}
        }
        let intent = intent_name(&trigger);
        if self.apply(trigger).await {
            info!(target = "call", intent, status = %self.session.status, "intent applied");
            Ok(())
        } else {
            Err(CallError::NotPermitted { intent, status })
        }
    }

    /// Folds `trigger` into the session. Returns false when it was not valid
    /// for the current state.
    async fn apply(&mut self, trigger: Trigger) -> bool {
        let context = Context::new(self.transport.local_user());
        match transition(&self.session, &trigger, &context) {
            Some(Transition { session, effects }) => {
                self.adopt(session, effects).await;
                true
            }
            None => {
                debug!(
                    target = "call",
                    status = %self.session.status,
                    trigger = ?trigger,
                    "trigger dropped"
                );
                false
            }
        }
    }

    async fn adopt(&mut self, next: CallSession, effects: Vec<Effect>) {
        let previous = std::mem::replace(&mut self.session, next);
        let epoch = self.session.epoch;
        let status = self.session.status;

        self.live
            .store(if status.is_active() { epoch } else { 0 }, Ordering::SeqCst);

        if previous.epoch != epoch {
            self.local = None;
            self.remote = None;
        }

        let (release, rest): (Vec<Effect>, Vec<Effect>) = effects
            .into_iter()
            .partition(|effect| *effect == Effect::ReleaseMedia);
        if !release.is_empty() {
            if self.media.teardown_session(epoch).await {
                debug!(target = "call", epoch, "media released");
            }
            self.local = None;
            self.remote = None;
        }

        self.deadline = match status {
            CallStatus::Calling | CallStatus::Ringing => {
                if previous.epoch == epoch && previous.status == status {
                    self.deadline
                } else {
                    self.unanswered_timeout
                        .map(|timeout| Instant::now() + timeout)
                }
            }
            _ => None,
        };

        if previous.status != status {
            info!(
                target = "call",
                epoch,
                from = %previous.status,
                to = %status,
                "call state changed"
            );
        }
        self.publish();

        if rest.is_empty() {
            return;
        }
        if let Some(batches) = &self.batches {
            let batch = Batch {
                epoch,
                room: self.session.room_id,
                effects: rest,
            };
            if batches.send(batch).is_err() {
                warn!(target = "call", epoch, "effect executor has stopped");
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(CallSnapshot {
            session: self.session.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
        });
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.session.epoch == epoch && self.session.status.is_active()
    }

    async fn media_event(&mut self, event: MediaEvent) {
        if !self.is_live(event.session()) {
            trace!(target = "call", session = event.session(), "stale media event");
            return;
        }
        match event {
            MediaEvent::RemoteStreamReceived { stream, .. } => {
                self.remote = Some(stream);
                self.publish();
            }
            MediaEvent::ConnectionStateChanged { state, .. } => {
                debug!(target = "call", epoch = self.session.epoch, ?state, "media connection");
                self.apply(Trigger::Media(event)).await;
            }
            MediaEvent::CandidateDiscovered { .. } => {
                self.apply(Trigger::Media(event)).await;
            }
        }
    }

    async fn report(&mut self, report: Report) {
        match report {
            Report::LocalReady { epoch, stream } => {
                if self.is_live(epoch) {
                    self.local = Some(stream);
                    self.publish();
                }
            }
            Report::Fault { epoch, error } => {
                warn!(target = "call", epoch, error = %error, "call setup failed");
                self.apply(Trigger::Fault { epoch, error }).await;
            }
        }
    }

    /// A routing failure only matters for the call living in that room.
    async fn refused(&mut self, room: RoomId, reason: String) {
        if !self.session.status.is_active() || self.session.room_id != Some(room) {
            debug!(target = "call", %room, reason = %reason, "stale relay refusal");
            return;
        }
        let epoch = self.session.epoch;
        warn!(target = "call", epoch, %room, reason = %reason, "relay refused call signal");
        self.apply(Trigger::Fault {
            epoch,
            error: format!("relay refused signal: {reason}"),
        })
        .await;
    }

    async fn transport_lost(&mut self, reason: String) {
        warn!(target = "call", reason = %reason, "signaling channel lost");
        if self.session.status.is_active() {
            let epoch = self.session.epoch;
            self.apply(Trigger::Fault {
                epoch,
                error: format!("signaling lost: {reason}"),
            })
            .await;
        }
    }

    async fn shutdown(&mut self) {
        if self.session.status.is_active() {
            self.apply(Trigger::End).await;
        }
        self.batches = None;
        if let Some(executor) = self.executor.take() {
            if let Err(err) = executor.await {
                warn!(target = "call", error = %err, "effect executor panicked");
            }
        }
        self.media.teardown().await;
        debug!(target = "call", "engine stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn intent_name(trigger: &Trigger) -> &'static str {
    match trigger {
        Trigger::Initiate { .. } => "initiate_call",
        Trigger::Answer => "answer_call",
        Trigger::Reject => "reject_call",
        Trigger::End => "end_call",
        Trigger::Dismiss => "dismiss",
        Trigger::Expire => "expire",
        Trigger::Signal(_) => "signal",
        Trigger::Media(_) => "media",
        Trigger::Fault { .. } => "fault",
    }
}

/// Runs effect batches one at a time, in the order the engine produced them.
struct Executor {
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaSessionManager>,
    live: Arc<AtomicU64>,
    reports: mpsc::UnboundedSender<Report>,
    /// Remote offer waiting for the local answer.
    offer: Option<(u64, String)>,
    answered: Option<(u64, String)>,
    /// Epoch whose setup already failed; its remaining setup is skipped.
    faulted: Option<u64>,
}

impl Executor {
    async fn run(mut self, mut batches: mpsc::UnboundedReceiver<Batch>) {
        while let Some(batch) = batches.recv().await {
            for effect in batch.effects.iter().cloned() {
                if effect.is_setup() && !self.wanted(batch.epoch) {
                    trace!(target = "call", epoch = batch.epoch, ?effect, "setup abandoned");
                    continue;
                }
                if let Err(error) = self.execute(batch.epoch, batch.room, effect).await {
                    self.faulted = Some(batch.epoch);
                    let _ = self.reports.send(Report::Fault {
                        epoch: batch.epoch,
                        error,
                    });
                }
            }
        }
    }

    fn wanted(&self, epoch: u64) -> bool {
        self.live.load(Ordering::SeqCst) == epoch && self.faulted != Some(epoch)
    }

    /// An `Err` carries the message for a fatal setup failure.
    async fn execute(
        &mut self,
        epoch: SessionKey,
        room: Option<RoomId>,
        effect: Effect,
    ) -> Result<(), String> {
        match effect {
            Effect::AcquireMedia(call_type) => {
                match self.media.create_local_media(epoch, call_type).await {
                    Ok(stream) => {
                        let _ = self.reports.send(Report::LocalReady { epoch, stream });
                        Ok(())
                    }
                    Err(err) => media_failure("could not acquire local media", err),
                }
            }
            Effect::Send(signal) => match room {
                Some(room) => self.send(room, signal).await,
                None => {
                    warn!(target = "call", epoch, "no room to send into");
                    Ok(())
                }
            },
            Effect::SendTo { room, signal } => self.send(room, signal).await,
            Effect::SendOffer => {
                let offer = match self.media.create_offer(epoch).await {
                    Ok(offer) => offer,
                    Err(err) => return media_failure("could not create offer", err),
                };
                match room {
                    Some(room) => self.send(room, Signal::from_description(offer)).await,
                    None => Ok(()),
                }
            }
            Effect::StashOffer(sdp) => {
                self.offer = Some((epoch, sdp));
                Ok(())
            }
            Effect::AnswerOffer => self.answer(epoch, room).await,
            Effect::ApplyAnswer(sdp) => {
                match self
                    .media
                    .apply_remote_description(epoch, SessionDescription::answer(sdp))
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(err) => media_failure("could not apply remote answer", err),
                }
            }
            Effect::ApplyCandidate(candidate) => {
                if let Err(err) = self.media.apply_remote_candidate(epoch, candidate).await {
                    if err != MediaError::Cancelled {
                        warn!(target = "call", epoch, error = %err, "remote candidate rejected");
                    }
                }
                Ok(())
            }
            Effect::ReleaseMedia => {
                self.media.teardown_session(epoch).await;
                Ok(())
            }
        }
    }

    async fn answer(&mut self, epoch: u64, room: Option<RoomId>) -> Result<(), String> {
        let Some((offer_epoch, sdp)) = self.offer.clone() else {
            debug!(target = "call", epoch, "no offer to answer yet");
            return Ok(());
        };
        if offer_epoch != epoch {
            debug!(target = "call", epoch, "stashed offer belongs to another call");
            return Ok(());
        }
        if self.answered.as_ref() == Some(&(epoch, sdp.clone())) {
            trace!(target = "call", epoch, "offer already answered");
            return Ok(());
        }
        let answer = match self
            .media
            .create_answer_from_offer(epoch, SessionDescription::offer(sdp.clone()))
            .await
        {
            Ok(answer) => answer,
            Err(err) => return media_failure("could not answer offer", err),
        };
        self.answered = Some((epoch, sdp));
        match room {
            Some(room) => self.send(room, Signal::from_description(answer)).await,
            None => Ok(()),
        }
    }

    async fn send(&self, room: RoomId, signal: Signal) -> Result<(), String> {
        let kind = signal.signal_type();
        let critical = matches!(
            signal,
            Signal::Invite { .. } | Signal::Accept | Signal::Offer { .. } | Signal::Answer { .. }
        );
        match self.transport.send(RelayRequest::new(room, signal)).await {
            Ok(()) => {
                trace!(target = "call", %room, ?kind, "signal sent");
                Ok(())
            }
            Err(err) if critical => Err(format!("could not send {kind:?}: {err}")),
            Err(err) => {
                warn!(target = "call", %room, ?kind, error = %err, "best-effort send failed");
                Ok(())
            }
        }
    }
}

fn media_failure(what: &str, err: MediaError) -> Result<(), String> {
    match err {
        MediaError::Cancelled => Ok(()),
        err => Err(format!("{what}: {err}")),
    }
}
