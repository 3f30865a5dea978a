//! Room fan-out
//!
//! The envelope is serialized once, membership is snapshotted under the
//! registry's read guard, and the guard is released before any queue is
//! touched. Sends never wait; a recipient whose queue is full is reported
//! back so the hub can tear it down after the loop, and delivery to the other
//! recipients carries on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::envelope::{encode, Envelope, RoomId, UserId};
use crate::core::room::RoomRegistry;
use crate::core::session::{Frame, Session};
use crate::error::{Result, SignalError};

/// Who in the room receives a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    ExceptSender(UserId),
}

impl Recipients {
    fn includes(&self, user_id: UserId) -> bool {
        match self {
            Self::All => true,
            Self::ExceptSender(sender) => *sender != user_id,
        }
    }
}

/// Statistics for broadcast operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastStats {
    pub total_recipients: usize,
    pub sent_count: usize,
    /// Recipients whose queue was full
    pub overflow_count: usize,
    pub duration: Duration,
}

impl BroadcastStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_recipients == 0 {
            1.0
        } else {
            self.sent_count as f64 / self.total_recipients as f64
        }
    }
}

/// Result of one fan-out
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub stats: BroadcastStats,
    /// Sessions that must be closed because they could not keep up
    pub overflowed: Vec<Arc<Session>>,
}

/// Delivers envelopes to the members of a room
pub struct BroadcastEngine {
    rooms: Arc<RoomRegistry>,
}

impl BroadcastEngine {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }

    /// Deliver to every selected member of the room
    pub async fn fan_out(
        &self,
        room_id: RoomId,
        envelope: &Envelope,
        recipients: Recipients,
    ) -> Result<BroadcastOutcome> {
        let frame: Frame = Arc::from(encode(envelope)?);
        let members = self.rooms.members(room_id).await;
        Ok(deliver(&frame, members, recipients))
    }
}

/// Push one frame onto each recipient's queue
pub fn deliver(
    frame: &Frame,
    members: Vec<Arc<Session>>,
    recipients: Recipients,
) -> BroadcastOutcome {
    let start = Instant::now();
    let mut outcome = BroadcastOutcome::default();

    for member in members {
        if !recipients.includes(member.user_id()) {
            continue;
        }
        outcome.stats.total_recipients += 1;

        match member.send(frame.clone()) {
            Ok(()) => {
                outcome.stats.sent_count += 1;
                log::trace!("Frame queued for user {}", member.user_id());
            }
            Err(SignalError::BackpressureExceeded(user_id)) => {
                outcome.stats.overflow_count += 1;
                log::warn!("Dropping slow consumer {} during broadcast", user_id);
                outcome.overflowed.push(member);
            }
            Err(e) => {
                log::debug!("Skipping user {}: {}", member.user_id(), e);
            }
        }
    }

    outcome.stats.duration = start.elapsed();
    outcome
}
