//! Routing rules shared by the relay server and the in-process relay.

use std::collections::HashMap;

use thiserror::Error;

use crate::envelope::{Envelope, RelayRequest, RoomId, Signal, UserId};

/// Reason the relay puts on a REJECT when an INVITE target is not connected.
pub const UNAVAILABLE_REASON: &str = "UNAVAILABLE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("cannot invite yourself")]
    SelfInvite,
    #[error("room {0} belongs to other participants")]
    Forbidden(RoomId),
    #[error("room {0} has no active call")]
    UnknownRoom(RoomId),
    #[error("user {user} is not a member of room {room}")]
    NotMember { room: RoomId, user: UserId },
}

/// A stamped envelope and the single user it must reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: UserId,
    pub envelope: Envelope,
}

impl Delivery {
    /// The REJECT the relay answers with when this delivery is an INVITE
    /// whose recipient is offline. It is stamped as coming from the target.
    pub fn unavailable_reply(&self) -> Option<Delivery> {
        match self.envelope.signal {
            Signal::Invite { .. } => Some(Delivery {
                recipient: self.envelope.sender_id,
                envelope: Envelope {
                    sender_id: self.recipient,
                    room_id: self.envelope.room_id,
                    signal: Signal::reject(UNAVAILABLE_REASON),
                },
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Members(UserId, UserId);

impl Members {
    fn contains(&self, user: UserId) -> bool {
        self.0 == user || self.1 == user
    }

    fn other(&self, user: UserId) -> Option<UserId> {
        if self.0 == user {
            Some(self.1)
        } else if self.1 == user {
            Some(self.0)
        } else {
            None
        }
    }
}

/// Binds rooms to the two users of a call and resolves where each
/// envelope goes.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, Members>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps `request` with `sender` and resolves its recipient. INVITE binds
    /// the room; everything else needs the sender to be a bound member.
    /// HANGUP and REJECT close the call, so they unbind the room once routed.
    pub fn route(&mut self, sender: UserId, request: RelayRequest) -> Result<Delivery, RouteError> {
        let room = request.room_id;
        let closes = matches!(request.signal, Signal::Hangup | Signal::Reject { .. });
        let recipient = match &request.signal {
            Signal::Invite { target_user_id, .. } => {
                let target = *target_user_id;
                if target == sender {
                    return Err(RouteError::SelfInvite);
                }
                if let Some(existing) = self.rooms.get(&room) {
                    if !(existing.contains(sender) && existing.contains(target)) {
                        return Err(RouteError::Forbidden(room));
                    }
                }
                self.rooms.insert(room, Members(sender, target));
                target
            }
            _ => {
                let members = self.rooms.get(&room).ok_or(RouteError::UnknownRoom(room))?;
                members
                    .other(sender)
                    .ok_or(RouteError::NotMember { room, user: sender })?
            }
        };
        if closes {
            self.rooms.remove(&room);
        }
        Ok(Delivery {
            recipient,
            envelope: request.stamp(sender),
        })
    }

    /// Unbinds `room`, e.g. after its INVITE could not be delivered.
    pub fn release(&mut self, room: RoomId) -> bool {
        self.rooms.remove(&room).is_some()
    }

    /// Drops every room `user` belongs to and returns their ids.
    pub fn release_user(&mut self, user: UserId) -> Vec<RoomId> {
        let released: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(room, _)| *room)
            .collect();
        for room in &released {
            self.rooms.remove(room);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallType;

    fn invite(room: u64, target: u64) -> RelayRequest {
        RelayRequest::new(
            RoomId(room),
            Signal::Invite {
                call_type: CallType::Video,
                target_user_id: UserId(target),
            },
        )
    }

    #[test_timeout::timeout]
    fn invite_binds_room_and_reaches_target() {
        let mut directory = RoomDirectory::new();
        let delivery = directory.route(UserId(1), invite(7, 42)).expect("route");
        assert_eq!(delivery.recipient, UserId(42));
        assert_eq!(delivery.envelope.sender_id, UserId(1));
        assert_eq!(directory.len(), 1);

        let reply = directory
            .route(UserId(42), RelayRequest::new(RoomId(7), Signal::Accept))
            .expect("route accept");
        assert_eq!(reply.recipient, UserId(1));
        assert_eq!(reply.envelope.sender_id, UserId(42));
    }

    #[test_timeout::timeout]
    fn outsiders_cannot_use_a_bound_room() {
        let mut directory = RoomDirectory::new();
        directory.route(UserId(1), invite(7, 42)).expect("route");

        assert_eq!(
            directory.route(UserId(9), invite(7, 42)),
            Err(RouteError::Forbidden(RoomId(7)))
        );
        assert_eq!(
            directory.route(UserId(9), RelayRequest::new(RoomId(7), Signal::Hangup)),
            Err(RouteError::NotMember {
                room: RoomId(7),
                user: UserId(9)
            })
        );
    }

    #[test_timeout::timeout]
    fn either_member_may_reinvite() {
        let mut directory = RoomDirectory::new();
        directory.route(UserId(1), invite(7, 42)).expect("route");
        let delivery = directory.route(UserId(42), invite(7, 1)).expect("reinvite");
        assert_eq!(delivery.recipient, UserId(1));
    }

    #[test_timeout::timeout]
    fn unknown_room_and_self_invite_fail() {
        let mut directory = RoomDirectory::new();
        assert_eq!(
            directory.route(UserId(1), RelayRequest::new(RoomId(3), Signal::Accept)),
            Err(RouteError::UnknownRoom(RoomId(3)))
        );
        assert_eq!(
            directory.route(UserId(1), invite(3, 1)),
            Err(RouteError::SelfInvite)
        );
    }

    #[test_timeout::timeout]
    fn unavailable_reply_is_stamped_by_target() {
        let mut directory = RoomDirectory::new();
        let delivery = directory.route(UserId(1), invite(7, 42)).expect("route");
        let reply = delivery.unavailable_reply().expect("invite reply");
        assert_eq!(reply.recipient, UserId(1));
        assert_eq!(reply.envelope.sender_id, UserId(42));
        assert_eq!(reply.envelope.signal, Signal::reject(UNAVAILABLE_REASON));
    }

    #[test_timeout::timeout]
    fn hangup_and_reject_free_the_room() {
        let mut directory = RoomDirectory::new();
        directory.route(UserId(1), invite(7, 42)).expect("route");
        let delivery = directory
            .route(UserId(42), RelayRequest::new(RoomId(7), Signal::reject("REJECTED_BY_TARGET")))
            .expect("route reject");
        assert_eq!(delivery.recipient, UserId(1));
        assert!(directory.is_empty());

        let delivery = directory.route(UserId(9), invite(7, 42)).expect("room reused");
        assert_eq!(delivery.recipient, UserId(42));
        directory
            .route(UserId(42), RelayRequest::new(RoomId(7), Signal::Accept))
            .expect("accept");
        directory
            .route(UserId(9), RelayRequest::new(RoomId(7), Signal::Hangup))
            .expect("hangup");
        assert!(directory.is_empty());
        assert_eq!(
            directory.route(UserId(42), RelayRequest::new(RoomId(7), Signal::Hangup)),
            Err(RouteError::UnknownRoom(RoomId(7)))
        );
    }

    #[test_timeout::timeout]
    fn release_user_forgets_their_rooms() {
        let mut directory = RoomDirectory::new();
        directory.route(UserId(1), invite(7, 42)).expect("route");
        directory.route(UserId(2), invite(8, 3)).expect("route");
        assert_eq!(directory.release_user(UserId(42)), vec![RoomId(7)]);
        assert_eq!(directory.len(), 1);
    }
}
