//! Outbound fan-out seam
//!
//! The lobby addresses participants and rooms; how events reach a socket is
//! the transport's business.

use crate::lobby::allocator::SessionId;
use crate::lobby::player::ParticipantId;
use crate::net::protocol::ServerEvent;

pub trait Broadcaster: Send + Sync {
    /// Deliver to every member of `room`
    fn to_room(&self, room: SessionId, event: &ServerEvent);

    fn to_participant(&self, participant: &ParticipantId, event: &ServerEvent);

    fn join_room(&self, participant: &ParticipantId, room: SessionId);

    fn leave_room(&self, participant: &ParticipantId, room: SessionId);

    /// Evict every remaining member
    fn close_room(&self, room: SessionId);
}
