//! Per-connection session state
//!
//! A session owns the producer side of a bounded outbound queue. The write
//! loop owns the consumer side, and the read loop feeds the dispatcher.
//! Both loops watch the session's cancellation token, so a close issued from
//! any task interrupts whichever loop is blocked on I/O.

use chrono::{DateTime, Utc};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::auth::identity::Identity;
use crate::core::envelope::{RoomId, UserId};
use crate::error::{Result, SignalError};

/// A serialized envelope waiting in an outbound queue
pub type Frame = Arc<str>;

/// Represents one connected principal and its transport
pub struct Session {
    /// Distinguishes two connections that resolved to the same user
    connection_id: Uuid,
    identity: Identity,
    connected_at: DateTime<Utc>,
    sender: mpsc::Sender<Frame>,
    /// Current room; held while a membership change is in flight
    room: Mutex<Option<RoomId>>,
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue
    pub fn new(
        identity: Identity,
        queue_size: usize,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let session = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            identity,
            connected_at: Utc::now(),
            sender,
            room: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel_token,
        });
        (session, receiver)
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True if both handles refer to the same connection
    pub fn is_same(&self, other: &Session) -> bool {
        self.connection_id == other.connection_id
    }

    /// Enqueue a frame without waiting.
    ///
    /// A full queue means the client is not keeping up: the frame is dropped,
    /// the session's pumps are cancelled, and `BackpressureExceeded` tells the
    /// caller to finish the teardown.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(SignalError::ConnectionClosed);
        }

        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for user {} ({} frames), dropping connection",
                    self.user_id(),
                    self.sender.max_capacity()
                );
                self.cancel_token.cancel();
                Err(SignalError::BackpressureExceeded(self.user_id()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalError::ConnectionClosed),
        }
    }

    /// Number of frames waiting for the write loop
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Room the session is currently in
    pub async fn current_room(&self) -> Option<RoomId> {
        *self.room.lock().await
    }

    /// Exclusive access to the room state for a membership transition
    pub(crate) async fn room_state(&self) -> MutexGuard<'_, Option<RoomId>> {
        self.room.lock().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag the session closed; only the first caller gets `true`
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Stop both pumps
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the session has been cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel_token.cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.identity.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
