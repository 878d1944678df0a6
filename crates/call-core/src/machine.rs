//! The call state machine as a pure function: `(session, trigger) -> next
//! session + effects`. Nothing here performs I/O.

use call_media::{ConnectionState, MediaEvent};
use call_signaling::{CallType, Envelope, IceCandidate, RoomId, Signal, UserId};
use chrono::{DateTime, Utc};

use crate::session::{CallSession, CallStatus};

pub const REJECTED_BY_TARGET: &str = "REJECTED_BY_TARGET";
pub const BUSY: &str = "BUSY";
pub const NO_ANSWER: &str = "NO_ANSWER";
const REJECTED: &str = "REJECTED";
const MEDIA_FAILED: &str = "media connection failed";

#[derive(Debug, Clone)]
pub enum Trigger {
    Initiate {
        target: UserId,
        room: RoomId,
        call_type: CallType,
    },
    Answer,
    Reject,
    End,
    Dismiss,
    /// Nobody picked up in time.
    Expire,
    Signal(Envelope),
    Media(MediaEvent),
    /// An effect or the transport failed for the session `epoch`.
    Fault { epoch: u64, error: String },
}

/// Work the engine performs after adopting a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AcquireMedia(CallType),
    /// Send into the session's room.
    Send(Signal),
    /// Send into a room other than the session's.
    SendTo { room: RoomId, signal: Signal },
    /// Create the local offer and send it as OFFER.
    SendOffer,
    /// Answer the stashed offer, if any, and send ANSWER.
    AnswerOffer,
    StashOffer(String),
    ApplyAnswer(String),
    ApplyCandidate(IceCandidate),
    ReleaseMedia,
}

impl Effect {
    /// Setup work that is pointless once its session is no longer live.
    pub fn is_setup(&self) -> bool {
        match self {
            Effect::Send(signal) => !matches!(signal, Signal::Hangup | Signal::Reject { .. }),
            Effect::SendTo { .. } | Effect::ReleaseMedia => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session: CallSession,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(session: CallSession, effects: Vec<Effect>) -> Option<Self> {
        Some(Self { session, effects })
    }

    /// Same session, effects only.
    fn stay(session: &CallSession, effects: Vec<Effect>) -> Option<Self> {
        Self::to(session.clone(), effects)
    }
}

/// What the transition function needs from outside the session.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub local_user: Option<UserId>,
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn new(local_user: Option<UserId>) -> Self {
        Self {
            local_user,
            now: Utc::now(),
        }
    }
}

/// `None` means the trigger is not valid in the current state and the
/// session stays as it is.
pub fn transition(session: &CallSession, trigger: &Trigger, ctx: &Context) -> Option<Transition> {
    use CallStatus::*;

    match trigger {
        Trigger::Initiate {
            target,
            room,
            call_type,
        } => {
            if !(session.status == Idle || session.status.is_terminal()) {
                return None;
            }
            if ctx.local_user == Some(*target) {
                return None;
            }
            let next = CallSession {
                status: Calling,
                call_type: Some(*call_type),
                caller_id: ctx.local_user,
                target_user_id: Some(*target),
                room_id: Some(*room),
                is_initiator: true,
                epoch: session.epoch + 1,
                ..CallSession::idle()
            };
            Transition::to(
                next,
                vec![
                    Effect::AcquireMedia(*call_type),
                    Effect::Send(Signal::Invite {
                        call_type: *call_type,
                        target_user_id: *target,
                    }),
                    Effect::SendOffer,
                ],
            )
        }
        Trigger::Answer => match session.status {
            Ringing => {
                let call_type = session.call_type?;
                let next = CallSession {
                    status: Connected,
                    start_time: Some(ctx.now),
                    ..session.clone()
                };
                Transition::to(
                    next,
                    vec![
                        Effect::AcquireMedia(call_type),
                        Effect::AnswerOffer,
                        Effect::Send(Signal::Accept),
                    ],
                )
            }
            _ => None,
        },
        Trigger::Reject => match session.status {
            Ringing => Transition::to(
                finish(session, Rejected, ctx).with_reason(REJECTED_BY_TARGET),
                vec![
                    Effect::Send(Signal::reject(REJECTED_BY_TARGET)),
                    Effect::ReleaseMedia,
                ],
            ),
            _ => None,
        },
        Trigger::End => match session.status {
            Calling | Ringing | Connected => Transition::to(
                finish(session, Ended, ctx),
                vec![Effect::Send(Signal::Hangup), Effect::ReleaseMedia],
            ),
            _ => None,
        },
        Trigger::Dismiss => {
            if session.status.is_terminal() {
                Transition::to(session.reset(), Vec::new())
            } else {
                None
            }
        }
        Trigger::Expire => match session.status {
            Calling => Transition::to(
                finish(session, Rejected, ctx).with_reason(NO_ANSWER),
                vec![Effect::Send(Signal::Hangup), Effect::ReleaseMedia],
            ),
            Ringing => Transition::to(
                finish(session, Rejected, ctx).with_reason(NO_ANSWER),
                vec![Effect::Send(Signal::reject(NO_ANSWER)), Effect::ReleaseMedia],
            ),
            _ => None,
        },
        Trigger::Signal(envelope) => on_signal(session, envelope, ctx),
        Trigger::Media(event) => on_media(session, event, ctx),
        Trigger::Fault { epoch, error } => {
            if *epoch != session.epoch || !session.status.is_active() {
                return None;
            }
            Transition::to(
                fail(session, error, ctx),
                vec![Effect::ReleaseMedia, Effect::Send(Signal::Hangup)],
            )
        }
    }
}

fn on_signal(session: &CallSession, envelope: &Envelope, ctx: &Context) -> Option<Transition> {
    use CallStatus::*;

    if let Signal::Invite {
        call_type,
        target_user_id,
    } = &envelope.signal
    {
        if ctx.local_user.is_some_and(|me| me != *target_user_id) {
            return None;
        }
        if session.status.is_active() {
            let same_call = session.room_id == Some(envelope.room_id)
                && session.counterpart() == Some(envelope.sender_id);
            if same_call {
                return None;
            }
            return Transition::stay(
                session,
                vec![Effect::SendTo {
                    room: envelope.room_id,
                    signal: Signal::reject(BUSY),
                }],
            );
        }
        let next = CallSession {
            status: Ringing,
            call_type: Some(*call_type),
            caller_id: Some(envelope.sender_id),
            target_user_id: Some(*target_user_id),
            room_id: Some(envelope.room_id),
            is_initiator: false,
            epoch: session.epoch + 1,
            ..CallSession::idle()
        };
        return Transition::to(next, Vec::new());
    }

    if !session.status.is_active()
        || session.room_id != Some(envelope.room_id)
        || session.counterpart() != Some(envelope.sender_id)
    {
        return None;
    }

    match (&envelope.signal, session.status) {
        (Signal::Accept, Calling) => Transition::to(
            CallSession {
                status: Connected,
                start_time: Some(ctx.now),
                ..session.clone()
            },
            Vec::new(),
        ),
        (Signal::Reject { reason }, Calling) => Transition::to(
            finish(session, Rejected, ctx).with_reason(reason.as_deref().unwrap_or(REJECTED)),
            vec![Effect::ReleaseMedia],
        ),
        (Signal::Hangup, Calling | Ringing | Connected) => {
            Transition::to(finish(session, Ended, ctx), vec![Effect::ReleaseMedia])
        }
        (Signal::Offer { sdp }, Ringing) => {
            Transition::stay(session, vec![Effect::StashOffer(sdp.clone())])
        }
        (Signal::Offer { sdp }, Connected) if !session.is_initiator => Transition::stay(
            session,
            vec![Effect::StashOffer(sdp.clone()), Effect::AnswerOffer],
        ),
        (Signal::Answer { sdp }, Calling | Connected) if session.is_initiator => {
            Transition::stay(session, vec![Effect::ApplyAnswer(sdp.clone())])
        }
        (Signal::Candidate(candidate), Calling | Ringing | Connected) => {
            Transition::stay(session, vec![Effect::ApplyCandidate(candidate.clone())])
        }
        _ => None,
    }
}

fn on_media(session: &CallSession, event: &MediaEvent, ctx: &Context) -> Option<Transition> {
    if event.session() != session.epoch || !session.status.is_active() {
        return None;
    }
    match event {
        MediaEvent::CandidateDiscovered { candidate, .. } => Transition::stay(
            session,
            vec![Effect::Send(Signal::Candidate(candidate.clone()))],
        ),
        MediaEvent::ConnectionStateChanged {
            state: ConnectionState::Failed,
            ..
        } => Transition::to(
            fail(session, MEDIA_FAILED, ctx),
            vec![Effect::ReleaseMedia, Effect::Send(Signal::Hangup)],
        ),
        _ => None,
    }
}

fn finish(session: &CallSession, status: CallStatus, ctx: &Context) -> CallSession {
    CallSession {
        status,
        end_time: Some(ctx.now),
        ..session.clone()
    }
}

fn fail(session: &CallSession, error: &str, ctx: &Context) -> CallSession {
    CallSession {
        error: Some(error.to_string()),
        ..finish(session, CallStatus::Error, ctx)
    }
}

trait WithReason {
    fn with_reason(self, reason: &str) -> Self;
}

impl WithReason for CallSession {
    fn with_reason(mut self, reason: &str) -> Self {
        self.reject_reason = Some(reason.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_media::RemoteStream;
    use call_signaling::RelayRequest;

    const ME: UserId = UserId(42);
    const PEER: UserId = UserId(9);
    const ROOM: RoomId = RoomId(7);

    fn ctx() -> Context {
        Context::new(Some(ME))
    }

    fn from_peer(signal: Signal) -> Trigger {
        Trigger::Signal(RelayRequest::new(ROOM, signal).stamp(PEER))
    }

    fn invite_from_peer() -> Trigger {
        from_peer(Signal::Invite {
            call_type: CallType::Video,
            target_user_id: ME,
        })
    }

    fn step(session: &CallSession, trigger: Trigger) -> Transition {
        transition(session, &trigger, &ctx()).expect("valid transition")
    }

    fn calling() -> CallSession {
        step(
            &CallSession::idle(),
            Trigger::Initiate {
                target: PEER,
                room: ROOM,
                call_type: CallType::Video,
            },
        )
        .session
    }

    fn ringing() -> CallSession {
        step(&CallSession::idle(), invite_from_peer()).session
    }

    fn connected_caller() -> CallSession {
        step(&calling(), from_peer(Signal::Accept)).session
    }

    fn all_sessions() -> Vec<CallSession> {
        let connected = connected_caller();
        vec![
            CallSession::idle(),
            calling(),
            ringing(),
            connected.clone(),
            step(&calling(), from_peer(Signal::reject("X"))).session,
            step(&connected, Trigger::End).session,
            step(
                &connected,
                Trigger::Fault {
                    epoch: connected.epoch,
                    error: "boom".into(),
                },
            )
            .session,
        ]
    }

    #[test_timeout::timeout]
    fn initiate_from_idle_acquires_invites_and_offers() {
        let t = step(
            &CallSession::idle(),
            Trigger::Initiate {
                target: PEER,
                room: ROOM,
                call_type: CallType::Video,
            },
        );
        assert_eq!(t.session.status, CallStatus::Calling);
        assert_eq!(t.session.caller_id, Some(ME));
        assert_eq!(t.session.target_user_id, Some(PEER));
        assert_eq!(t.session.room_id, Some(ROOM));
        assert!(t.session.is_initiator);
        assert_eq!(t.session.epoch, 1);
        assert_eq!(
            t.effects,
            vec![
                Effect::AcquireMedia(CallType::Video),
                Effect::Send(Signal::Invite {
                    call_type: CallType::Video,
                    target_user_id: PEER
                }),
                Effect::SendOffer,
            ]
        );
    }

    #[test_timeout::timeout]
    fn invite_from_idle_rings_with_sender_as_caller() {
        let t = step(&CallSession::idle(), invite_from_peer());
        assert_eq!(t.session.status, CallStatus::Ringing);
        assert_eq!(t.session.caller_id, Some(PEER));
        assert_eq!(t.session.target_user_id, Some(ME));
        assert!(!t.session.is_initiator);
        assert!(t.effects.is_empty());
    }

    #[test_timeout::timeout]
    fn accept_connects_caller_and_stamps_start_time() {
        let t = step(&calling(), from_peer(Signal::Accept));
        assert_eq!(t.session.status, CallStatus::Connected);
        assert!(t.session.start_time.is_some());
        assert!(t.session.end_time.is_none());
    }

    #[test_timeout::timeout]
    fn remote_reject_records_reason_and_releases() {
        let t = step(&calling(), from_peer(Signal::reject(REJECTED_BY_TARGET)));
        assert_eq!(t.session.status, CallStatus::Rejected);
        assert_eq!(t.session.reject_reason.as_deref(), Some(REJECTED_BY_TARGET));
        assert!(t.session.end_time.is_some());
        assert_eq!(t.effects, vec![Effect::ReleaseMedia]);
    }

    #[test_timeout::timeout]
    fn remote_hangup_ends_every_active_state() {
        for session in [calling(), ringing(), connected_caller()] {
            let t = step(&session, from_peer(Signal::Hangup));
            assert_eq!(t.session.status, CallStatus::Ended);
            assert!(t.session.end_time.is_some());
            assert_eq!(t.effects, vec![Effect::ReleaseMedia]);
        }
    }

    #[test_timeout::timeout]
    fn answer_acquires_answers_then_accepts() {
        let t = step(&ringing(), Trigger::Answer);
        assert_eq!(t.session.status, CallStatus::Connected);
        assert!(t.session.start_time.is_some());
        assert_eq!(
            t.effects,
            vec![
                Effect::AcquireMedia(CallType::Video),
                Effect::AnswerOffer,
                Effect::Send(Signal::Accept),
            ]
        );
    }

    #[test_timeout::timeout]
    fn local_reject_sends_reason() {
        let t = step(&ringing(), Trigger::Reject);
        assert_eq!(t.session.status, CallStatus::Rejected);
        assert_eq!(t.session.reject_reason.as_deref(), Some(REJECTED_BY_TARGET));
        assert_eq!(
            t.effects,
            vec![
                Effect::Send(Signal::reject(REJECTED_BY_TARGET)),
                Effect::ReleaseMedia
            ]
        );
    }

    #[test_timeout::timeout]
    fn end_sends_hangup_from_any_active_state() {
        for session in [calling(), ringing(), connected_caller()] {
            let t = step(&session, Trigger::End);
            assert_eq!(t.session.status, CallStatus::Ended);
            assert!(t.session.end_time.is_some());
            assert_eq!(
                t.effects,
                vec![Effect::Send(Signal::Hangup), Effect::ReleaseMedia]
            );
        }
    }

    #[test_timeout::timeout]
    fn media_failure_moves_connected_call_to_error() {
        let session = connected_caller();
        let t = step(
            &session,
            Trigger::Media(MediaEvent::ConnectionStateChanged {
                session: session.epoch,
                state: ConnectionState::Failed,
            }),
        );
        assert_eq!(t.session.status, CallStatus::Error);
        assert!(t.session.error.is_some());
        assert!(t.effects.contains(&Effect::ReleaseMedia));
    }

    #[test_timeout::timeout]
    fn faults_for_old_epochs_are_ignored() {
        let session = connected_caller();
        let stale = Trigger::Fault {
            epoch: session.epoch - 1,
            error: "late".into(),
        };
        assert!(transition(&session, &stale, &ctx()).is_none());
    }

    #[test_timeout::timeout]
    fn dismiss_resets_terminal_states_only() {
        for session in all_sessions() {
            let result = transition(&session, &Trigger::Dismiss, &ctx());
            if session.status.is_terminal() {
                let t = result.expect("dismiss");
                assert_eq!(t.session, session.reset());
            } else {
                assert!(result.is_none(), "dismiss from {}", session.status);
            }
        }
    }

    #[test_timeout::timeout]
    fn second_invite_while_active_is_auto_rejected() {
        for session in [calling(), ringing(), connected_caller()] {
            let other = Trigger::Signal(
                RelayRequest::new(
                    RoomId(99),
                    Signal::Invite {
                        call_type: CallType::Audio,
                        target_user_id: ME,
                    },
                )
                .stamp(UserId(5)),
            );
            let t = step(&session, other);
            assert_eq!(t.session, session);
            assert_eq!(
                t.effects,
                vec![Effect::SendTo {
                    room: RoomId(99),
                    signal: Signal::reject(BUSY)
                }]
            );
        }
    }

    #[test_timeout::timeout]
    fn new_call_from_terminal_state_resets_first() {
        let ended = step(&connected_caller(), Trigger::End).session;
        let t = step(&ended, invite_from_peer());
        assert_eq!(t.session.status, CallStatus::Ringing);
        assert_eq!(t.session.epoch, ended.epoch + 1);
        assert!(t.session.start_time.is_none());
        assert!(t.session.end_time.is_none());

        let t = step(
            &ended,
            Trigger::Initiate {
                target: PEER,
                room: RoomId(8),
                call_type: CallType::Audio,
            },
        );
        assert_eq!(t.session.status, CallStatus::Calling);
        assert_eq!(t.session.room_id, Some(RoomId(8)));
    }

    #[test_timeout::timeout]
    fn envelopes_from_other_rooms_or_senders_are_dropped() {
        let session = connected_caller();
        let wrong_room =
            Trigger::Signal(RelayRequest::new(RoomId(1), Signal::Hangup).stamp(PEER));
        let wrong_sender = Trigger::Signal(RelayRequest::new(ROOM, Signal::Hangup).stamp(UserId(3)));
        assert!(transition(&session, &wrong_room, &ctx()).is_none());
        assert!(transition(&session, &wrong_sender, &ctx()).is_none());
    }

    #[test_timeout::timeout]
    fn negotiation_signals_route_to_media_effects() {
        let offer = from_peer(Signal::Offer { sdp: "o".into() });
        assert_eq!(
            step(&ringing(), offer.clone()).effects,
            vec![Effect::StashOffer("o".into())]
        );
        let callee_connected = step(&ringing(), Trigger::Answer).session;
        assert_eq!(
            step(&callee_connected, offer).effects,
            vec![Effect::StashOffer("o".into()), Effect::AnswerOffer]
        );
        assert_eq!(
            step(&calling(), from_peer(Signal::Answer { sdp: "a".into() })).effects,
            vec![Effect::ApplyAnswer("a".into())]
        );
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        };
        assert_eq!(
            step(&ringing(), from_peer(Signal::Candidate(candidate.clone()))).effects,
            vec![Effect::ApplyCandidate(candidate)]
        );
    }

    #[test_timeout::timeout]
    fn local_candidates_are_relayed_while_active() {
        let session = calling();
        let candidate = IceCandidate {
            candidate: "candidate:2".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let event = MediaEvent::CandidateDiscovered {
            session: session.epoch,
            candidate: candidate.clone(),
        };
        assert_eq!(
            step(&session, Trigger::Media(event)).effects,
            vec![Effect::Send(Signal::Candidate(candidate))]
        );
    }

    #[test_timeout::timeout]
    fn expire_rejects_unanswered_calls() {
        let t = step(&calling(), Trigger::Expire);
        assert_eq!(t.session.reject_reason.as_deref(), Some(NO_ANSWER));
        assert_eq!(t.effects, vec![Effect::Send(Signal::Hangup), Effect::ReleaseMedia]);

        let t = step(&ringing(), Trigger::Expire);
        assert_eq!(t.session.status, CallStatus::Rejected);
        assert_eq!(
            t.effects,
            vec![Effect::Send(Signal::reject(NO_ANSWER)), Effect::ReleaseMedia]
        );
    }

    /// Every pair not in the table leaves the session untouched.
    #[test_timeout::timeout]
    fn invalid_pairs_change_nothing() {
        let remote_stream = MediaEvent::RemoteStreamReceived {
            session: 1,
            stream: RemoteStream::new(),
        };
        for session in all_sessions() {
            let status = session.status;
            let mut invalid: Vec<Trigger> = vec![Trigger::Media(remote_stream.clone())];
            if status != CallStatus::Ringing {
                invalid.extend([Trigger::Answer, Trigger::Reject]);
            }
            if !status.is_active() {
                invalid.extend([
                    Trigger::End,
                    Trigger::Expire,
                    from_peer(Signal::Accept),
                    from_peer(Signal::Hangup),
                    from_peer(Signal::Answer { sdp: "a".into() }),
                    from_peer(Signal::Offer { sdp: "o".into() }),
                    from_peer(Signal::Candidate(IceCandidate {
                        candidate: "candidate:9".into(),
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                    })),
                    Trigger::Media(MediaEvent::CandidateDiscovered {
                        session: session.epoch,
                        candidate: IceCandidate {
                            candidate: "candidate:10".into(),
                            sdp_mid: None,
                            sdp_mline_index: Some(0),
                        },
                    }),
                ]);
            }
            if status.is_active() {
                invalid.push(Trigger::Initiate {
                    target: PEER,
                    room: ROOM,
                    call_type: CallType::Audio,
                });
            }
            if matches!(status, CallStatus::Ringing | CallStatus::Connected) {
                invalid.push(from_peer(Signal::Accept));
            }
            for trigger in invalid {
                assert!(
                    transition(&session, &trigger, &ctx()).is_none(),
                    "{trigger:?} from {status}"
                );
            }
        }
    }
}
