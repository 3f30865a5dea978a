//! Routes decoded envelopes to room membership changes or broadcasts
//!
//! Each session is either in no room or in exactly one. Membership changes
//! happen while holding the session's room state, and notices are broadcast
//! only after it is released.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::core::envelope::{Envelope, MessageKind, RoomId};
use crate::core::server::SharedServerManager;
use crate::core::session::Session;
use crate::error::{Result, SignalError};

/// Interprets inbound envelopes on behalf of their sender
pub struct Dispatcher {
    server: SharedServerManager,
}

impl Dispatcher {
    pub fn new(server: SharedServerManager) -> Self {
        Self { server }
    }

    /// Handle one envelope from `sender`.
    ///
    /// The sender is always the session the envelope arrived on; any
    /// `user_id` in the envelope is overwritten.
    pub async fn dispatch(&self, sender: &Arc<Session>, mut envelope: Envelope) -> Result<()> {
        envelope.user_id = Some(sender.user_id());

        match envelope.kind {
            MessageKind::JoinRoom => {
                let room_id = envelope.join_target().ok_or(SignalError::MissingRoomId)?;
                self.join_room(sender, room_id).await
            }
            MessageKind::LeaveRoom => self.leave_room(sender).await,
            _ if envelope.kind.is_signaling() => self.relay_signaling(sender, envelope).await,
            ref other => Err(SignalError::UnknownMessageType(other.as_str().to_string())),
        }
    }

    /// Move the sender into `room_id`, leaving its current room first
    pub async fn join_room(&self, sender: &Arc<Session>, room_id: RoomId) -> Result<()> {
        let previous = {
            let mut state = sender.room_state().await;
            // A session closed while we waited must not be re-added
            if sender.is_closed() {
                return Err(SignalError::ConnectionClosed);
            }
            let previous = state.take();
            if let Some(previous_id) = previous {
                self.server.rooms().leave(previous_id, sender).await;
            }
            self.server.rooms().join(room_id, sender).await;
            *state = Some(room_id);
            previous
        };

        if let Some(previous_id) = previous {
            info!("User {} left room {}", sender.user_id(), previous_id);
            let notice = Envelope::user_left(previous_id, sender.user_id())?;
            self.server.broadcast_all(previous_id, &notice).await?;
        }

        info!("User {} joined room {}", sender.user_id(), room_id);
        let notice = Envelope::user_joined(room_id, sender.identity())?;
        self.server.broadcast_all(room_id, &notice).await?;
        Ok(())
    }

    /// Take the sender out of its room, if it is in one
    pub async fn leave_room(&self, sender: &Arc<Session>) -> Result<()> {
        let left = {
            let mut state = sender.room_state().await;
            let left = state.take();
            if let Some(room_id) = left {
                self.server.rooms().leave(room_id, sender).await;
            }
            left
        };

        let Some(room_id) = left else {
            debug!("User {} sent leave_room while not in a room", sender.user_id());
            return Ok(());
        };

        info!("User {} left room {}", sender.user_id(), room_id);
        let notice = Envelope::user_left(room_id, sender.user_id())?;
        self.server.broadcast_all(room_id, &notice).await?;
        Ok(())
    }

    /// Forward an offer, answer or candidate to the rest of the sender's room
    async fn relay_signaling(&self, sender: &Arc<Session>, mut envelope: Envelope) -> Result<()> {
        let current = sender
            .current_room()
            .await
            .ok_or(SignalError::NotInRoom(sender.user_id()))?;

        if let Some(requested) = envelope.room_id {
            if requested != current {
                warn!(
                    "User {} addressed {} to room {} while in room {}",
                    sender.user_id(),
                    envelope.kind.as_str(),
                    requested,
                    current
                );
                return Err(SignalError::RoomMismatch { requested, current });
            }
        }
        envelope.room_id = Some(current);

        let stats = self
            .server
            .broadcast_except_sender(current, &envelope, sender.user_id())
            .await?;
        debug!(
            "Relayed {} from user {} to {} peer(s) in room {}",
            envelope.kind.as_str(),
            sender.user_id(),
            stats.sent_count,
            current
        );
        Ok(())
    }
}
