//! Hub that owns the registries and coordinates session lifecycle

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::identity::Identity;
use crate::config::{DuplicatePolicy, ServerConfig};
use crate::core::broadcast::{BroadcastEngine, BroadcastStats, Recipients};
use crate::core::clients::ClientRegistry;
use crate::core::envelope::{encode, Envelope, RoomId, UserId};
use crate::core::room::RoomRegistry;
use crate::core::session::{Frame, Session};
use crate::error::{Result, SignalError};

/// Integrated server service that manages sessions and rooms together
pub struct ServerManager {
    config: ServerConfig,
    clients: ClientRegistry,
    rooms: Arc<RoomRegistry>,
    broadcaster: BroadcastEngine,
    /// Parent of every session token; cancelled on shutdown
    cancel_token: CancellationToken,
    /// Tracks session pumps so shutdown can wait for them
    tracker: TaskTracker,
}

impl ServerManager {
    /// Create a new server manager
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        Self {
            config,
            clients: ClientRegistry::new(),
            broadcaster: BroadcastEngine::new(rooms.clone()),
            rooms,
            cancel_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Create and register a session for a resolved identity.
    ///
    /// Returns the session and the consumer side of its outbound queue.
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Frame>)> {
        if self.is_shutting_down() {
            return Err(SignalError::ConnectionClosed);
        }

        let (session, outbound) = Session::new(
            identity,
            self.config.outbound_queue_size,
            self.cancel_token.child_token(),
        );

        match self.config.duplicate_policy {
            DuplicatePolicy::Replace => {
                if let Some(previous) = self.clients.register(session.clone()).await {
                    warn!(
                        "User {} reconnected, closing previous connection {}",
                        session.user_id(),
                        previous.connection_id()
                    );
                    self.close(&previous).await;
                }
            }
            DuplicatePolicy::Reject => self.clients.register_unique(session.clone()).await?,
        }

        info!(
            "Client connected: user={} connection={}",
            session.user_id(),
            session.connection_id()
        );
        debug!("Current connections: {}", self.clients.len().await);
        Ok((session, outbound))
    }

    /// Tear a session down: leave its room, unregister it, stop its pumps,
    /// and tell the vacated room. Only the first call for a session has any effect.
    pub async fn close(&self, session: &Arc<Session>) {
        self.close_all(vec![session.clone()]).await;
    }

    /// Close sessions, including any that overflow while being notified of these departures
    async fn close_all(&self, mut pending: Vec<Arc<Session>>) {
        while let Some(session) = pending.pop() {
            let Some(vacated) = self.teardown(&session).await else {
                continue;
            };

            let notice = match Envelope::user_left(vacated, session.user_id()) {
                Ok(notice) => notice,
                Err(e) => {
                    warn!("Failed to build leave notice for room {}: {}", vacated, e);
                    continue;
                }
            };
            match self
                .broadcaster
                .fan_out(vacated, &notice, Recipients::All)
                .await
            {
                Ok(outcome) => pending.extend(outcome.overflowed),
                Err(e) => warn!("Failed to notify room {}: {}", vacated, e),
            }
        }
    }

    /// Registry and pump teardown; returns the room the session was in
    async fn teardown(&self, session: &Arc<Session>) -> Option<RoomId> {
        if !session.mark_closed() {
            return None;
        }
        session.cancel();

        let vacated = {
            let mut room = session.room_state().await;
            match room.take() {
                Some(room_id) => {
                    self.rooms.leave(room_id, session).await;
                    Some(room_id)
                }
                None => None,
            }
        };
        self.clients.unregister(session).await;

        let connected_for = chrono::Utc::now() - session.connected_at();
        info!(
            "Client disconnected: user={} connection={} after {}s",
            session.user_id(),
            session.connection_id(),
            connected_for.num_seconds()
        );
        vacated
    }

    /// Deliver an envelope to every member of a room
    pub async fn broadcast_all(
        &self,
        room_id: RoomId,
        envelope: &Envelope,
    ) -> Result<BroadcastStats> {
        self.broadcast(room_id, envelope, Recipients::All).await
    }

    /// Deliver an envelope to every member of a room except the sender
    pub async fn broadcast_except_sender(
        &self,
        room_id: RoomId,
        envelope: &Envelope,
        sender_id: UserId,
    ) -> Result<BroadcastStats> {
        self.broadcast(room_id, envelope, Recipients::ExceptSender(sender_id))
            .await
    }

    async fn broadcast(
        &self,
        room_id: RoomId,
        envelope: &Envelope,
        recipients: Recipients,
    ) -> Result<BroadcastStats> {
        let outcome = self.broadcaster.fan_out(room_id, envelope, recipients).await?;
        debug!(
            "Broadcast {} to {}/{} members of room {} in {:?}",
            envelope.kind.as_str(),
            outcome.stats.sent_count,
            outcome.stats.total_recipients,
            room_id,
            outcome.stats.duration
        );
        if !outcome.overflowed.is_empty() {
            warn!(
                "Broadcast to room {} reached {:.0}% of recipients, closing {} slow consumer(s)",
                room_id,
                outcome.stats.success_rate() * 100.0,
                outcome.stats.overflow_count
            );
            self.close_all(outcome.overflowed).await;
        }
        Ok(outcome.stats)
    }

    /// Send an envelope to one connected user
    pub async fn send_to_user(&self, user_id: UserId, envelope: &Envelope) -> Result<()> {
        let session = self
            .clients
            .lookup(user_id)
            .await
            .ok_or(SignalError::SessionNotFound(user_id))?;
        let frame: Frame = Arc::from(encode(envelope)?);
        match session.send(frame) {
            Err(SignalError::BackpressureExceeded(id)) => {
                self.close(&session).await;
                Err(SignalError::BackpressureExceeded(id))
            }
            other => other,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.len().await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    /// Stop every session and wait up to `grace` for their pumps to finish
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        info!("Shutting down: closing {} sessions", self.clients.len().await);
        self.cancel_token.cancel();
        self.tracker.close();

        for session in self.clients.sessions().await {
            self.close(&session).await;
        }

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("All session tasks finished");
                Ok(())
            }
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(
                    "Shutdown grace period of {}s expired with {} task(s) running",
                    grace.as_secs(),
                    remaining
                );
                Err(SignalError::ShutdownTimeout(remaining))
            }
        }
    }
}

// Shared reference to server manager
pub type SharedServerManager = Arc<ServerManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::MessageKind;

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame.to_string());
        }
        frames
    }

    async fn seat(server: &ServerManager, session: &Arc<Session>, room_id: RoomId) {
        let mut room = session.room_state().await;
        server.rooms().join(room_id, session).await;
        *room = Some(room_id);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let server = ServerManager::new(ServerConfig::for_testing());
        let (a, _rx_a) = server.connect(Identity::new(1)).await.unwrap();
        let (b, mut rx_b) = server.connect(Identity::new(2)).await.unwrap();
        seat(&server, &a, 5).await;
        seat(&server, &b, 5).await;

        tokio::join!(server.close(&a), server.close(&a));

        assert!(a.is_closed());
        assert!(a.is_cancelled());
        assert!(server.clients().lookup(1).await.is_none());
        assert_eq!(server.rooms().member_ids(5).await, vec![2]);
        let notices = drain(&mut rx_b);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("user_left"));
    }

    #[tokio::test]
    async fn test_last_member_close_destroys_room() {
        let server = ServerManager::new(ServerConfig::for_testing());
        let (u3, _rx) = server.connect(Identity::new(3)).await.unwrap();
        seat(&server, &u3, 7).await;

        server.close(&u3).await;
        assert!(!server.rooms().contains(7).await);
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_session() {
        let server = ServerManager::new(ServerConfig::for_testing());
        let (first, _rx1) = server.connect(Identity::new(1)).await.unwrap();
        let (second, _rx2) = server.connect(Identity::new(1)).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(server.connection_count().await, 1);
        assert!(server.clients().lookup(1).await.unwrap().is_same(&second));
    }

    #[tokio::test]
    async fn test_reconnect_rejected_by_policy() {
        let mut config = ServerConfig::for_testing();
        config.duplicate_policy = DuplicatePolicy::Reject;
        let server = ServerManager::new(config);
        let (first, _rx1) = server.connect(Identity::new(1)).await.unwrap();

        let result = server.connect(Identity::new(1)).await;
        assert!(matches!(result, Err(SignalError::DuplicateSession(1))));
        assert!(!first.is_closed());
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_to_user() {
        let server = ServerManager::new(ServerConfig::for_testing());
        let (_a, mut rx_a) = server.connect(Identity::new(1)).await.unwrap();

        server
            .send_to_user(1, &Envelope::new(MessageKind::SdpOffer))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx_a), vec![r#"{"type":"sdp_offer"}"#.to_string()]);

        let missing = server
            .send_to_user(2, &Envelope::new(MessageKind::SdpOffer))
            .await;
        assert!(matches!(missing, Err(SignalError::SessionNotFound(2))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
        let server = ServerManager::new(ServerConfig::for_testing());
        let (a, _rx) = server.connect(Identity::new(1)).await.unwrap();
        let pump_session = a.clone();
        server.tracker().spawn(async move {
            pump_session.cancelled().await;
        });

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(a.is_closed());
        assert_eq!(server.connection_count().await, 0);
        assert!(server.connect(Identity::new(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let server = ServerManager::new(ServerConfig::for_testing());
        server.tracker().spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let result = server.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SignalError::ShutdownTimeout(1))));
    }
}
