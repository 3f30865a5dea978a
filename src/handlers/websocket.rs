use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use log::{debug, info, warn};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use warp::ws::{Message, WebSocket};

use crate::auth::identity::Identity;
use crate::config::ServerConfig;
use crate::constants::BATCH_DELIMITER;
use crate::core::dispatcher::Dispatcher;
use crate::core::envelope::decode;
use crate::core::server::SharedServerManager;
use crate::core::session::{Frame, Session};
use crate::error::{Result, SignalError};

/// Close code sent when a connection is refused after the upgrade
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Timing settings shared by both pumps
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl From<&ServerConfig> for PumpSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            write_timeout: config.write_timeout,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

// Handle an upgraded WebSocket for an already resolved identity
pub async fn handle_ws_client(ws: WebSocket, server: SharedServerManager, identity: Identity) {
    let user_id = identity.user_id;
    let (mut ws_tx, ws_rx) = ws.split();

    let (session, outbound) = match server.connect(identity).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Refusing connection for user {}: {}", user_id, e);
            let _ = ws_tx
                .send(Message::close_with(CLOSE_POLICY_VIOLATION, e.to_string()))
                .await;
            return;
        }
    };

    let settings = PumpSettings::from(server.config());

    // Spawn the write loop; it owns the sink and the consumer side of the queue
    let writer_server = server.clone();
    let writer_session = session.clone();
    server.tracker().spawn(async move {
        let cancel = writer_session.cancel_token().clone();
        if let Err(e) = write_pump(ws_tx, outbound, cancel, settings).await {
            warn!(
                "Write loop for user {} failed: {}",
                writer_session.user_id(),
                e
            );
        }
        writer_server.close(&writer_session).await;
    });

    let dispatcher = Dispatcher::new(server.clone());
    match read_pump(ws_rx, &session, &dispatcher, settings.idle_timeout).await {
        Ok(()) => debug!("Read loop for user {} finished", user_id),
        Err(e) => info!("Read loop for user {} ended: {}", user_id, e),
    }

    server.close(&session).await;
}

/// Read frames until the peer closes, the transport fails, or the session is cancelled.
///
/// Undecodable frames and rejected envelopes are logged and skipped.
pub async fn read_pump<S, E>(
    mut stream: S,
    session: &Arc<Session>,
    dispatcher: &Dispatcher,
    idle_timeout: Duration,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => return Ok(()),
            next = timeout(idle_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return Err(SignalError::IdleTimeout),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(SignalError::TransportError(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };

        if message.is_close() {
            return Ok(());
        }
        // Pings are answered by the transport; pongs only refresh the idle timer
        if !message.is_text() && !message.is_binary() {
            continue;
        }

        let envelope = match decode(message.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame from user {}: {}", session.user_id(), e);
                continue;
            }
        };

        if let Err(e) = dispatcher.dispatch(session, envelope).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Dropped message from user {}: {}", session.user_id(), e);
        }
    }
}

/// Write queued frames to the transport until the queue closes or the session is cancelled.
///
/// Frames already waiting when one is dequeued are sent with it in a single
/// newline-delimited text frame, in queue order.
pub async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    settings: PumpSettings,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = timeout(settings.write_timeout, sink.send(Message::close())).await;
                return Ok(());
            }
            frame = outbound.recv() => match frame {
                Some(first) => {
                    let batch = coalesce(first, &mut outbound);
                    write_frame(&mut sink, Message::text(batch), settings.write_timeout).await?;
                }
                None => {
                    let _ = timeout(settings.write_timeout, sink.send(Message::close())).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => {
                write_frame(&mut sink, Message::ping(Vec::new()), settings.write_timeout).await?;
            }
        }
    }
}

/// Join `first` with everything queued behind it right now
fn coalesce(first: Frame, outbound: &mut mpsc::Receiver<Frame>) -> String {
    let pending = outbound.len();
    let mut batch = String::from(&*first);
    for _ in 0..pending {
        match outbound.try_recv() {
            Ok(next) => {
                batch.push(BATCH_DELIMITER);
                batch.push_str(&next);
            }
            Err(_) => break,
        }
    }
    batch
}

async fn write_frame<S>(sink: &mut S, message: Message, limit: Duration) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SignalError::TransportError(e.to_string())),
        Err(_) => Err(SignalError::TransportError(format!(
            "write timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::core::envelope::encode;
    use crate::core::server::ServerManager;
    use futures_util::stream;

    fn settings() -> PumpSettings {
        PumpSettings {
            write_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_write_pump_coalesces_queued_frames() {
        let (tx, rx) = mpsc::channel::<Frame>(8);
        for text in ["a", "b", "c"] {
            tx.send(Arc::from(text)).await.unwrap();
        }
        drop(tx);

        let mut written: Vec<Message> = Vec::new();
        write_pump(&mut written, rx, CancellationToken::new(), settings())
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(written[0].to_str(), Ok("a\nb\nc"));
        assert!(written[1].is_close());
    }

    #[tokio::test]
    async fn test_batched_pretty_payloads_split_cleanly() {
        let pretty = b"{\"type\":\"ice_candidate\",\"payload\":{\n  \"candidate\": \"c1\"\n}}";
        let frame: Frame = Arc::from(encode(&decode(pretty).unwrap()).unwrap());
        let (tx, rx) = mpsc::channel::<Frame>(8);
        tx.send(frame.clone()).await.unwrap();
        tx.send(frame).await.unwrap();
        drop(tx);

        let mut written: Vec<Message> = Vec::new();
        write_pump(&mut written, rx, CancellationToken::new(), settings())
            .await
            .unwrap();

        let batch = written[0].to_str().unwrap();
        let parts: Vec<&str> = batch.split(BATCH_DELIMITER).collect();
        assert_eq!(parts.len(), 2);
        for part in parts {
            let value: serde_json::Value = serde_json::from_str(part).unwrap();
            assert_eq!(value["payload"]["candidate"], "c1");
        }
    }

    #[tokio::test]
    async fn test_write_pump_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<Frame>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut written: Vec<Message> = Vec::new();
        write_pump(&mut written, rx, cancel, settings()).await.unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].is_close());
    }

    #[tokio::test]
    async fn test_read_pump_skips_garbage_and_dispatches() {
        let server = Arc::new(ServerManager::new(ServerConfig::for_testing()));
        let dispatcher = Dispatcher::new(server.clone());
        let (session, mut rx) = server.connect(Identity::new(4)).await.unwrap();

        let frames = vec![
            Ok::<_, String>(Message::text("garbage")),
            Ok(Message::text(r#"{"type":"unknown"}"#)),
            Ok(Message::text(r#"{"type":"join_room","payload":{"room_id":11}}"#)),
            Ok(Message::close()),
            Ok(Message::text(r#"{"type":"leave_room"}"#)),
        ];
        read_pump(stream::iter(frames), &session, &dispatcher, Duration::from_secs(1))
            .await
            .unwrap();

        // Frames after the close frame are never read
        assert_eq!(session.current_room().await, Some(11));
        assert!(rx.try_recv().unwrap().contains("user_joined"));
    }

    #[tokio::test]
    async fn test_read_pump_reports_transport_error() {
        let server = Arc::new(ServerManager::new(ServerConfig::for_testing()));
        let dispatcher = Dispatcher::new(server.clone());
        let (session, _rx) = server.connect(Identity::new(4)).await.unwrap();

        let frames = vec![Err::<Message, _>("connection reset".to_string())];
        let result =
            read_pump(stream::iter(frames), &session, &dispatcher, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SignalError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_read_pump_times_out_when_idle() {
        let server = Arc::new(ServerManager::new(ServerConfig::for_testing()));
        let dispatcher = Dispatcher::new(server.clone());
        let (session, _rx) = server.connect(Identity::new(4)).await.unwrap();

        let result = read_pump(
            stream::pending::<std::result::Result<Message, String>>(),
            &session,
            &dispatcher,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(SignalError::IdleTimeout)));
    }

    #[tokio::test]
    async fn test_read_pump_returns_when_cancelled() {
        let server = Arc::new(ServerManager::new(ServerConfig::for_testing()));
        let dispatcher = Dispatcher::new(server.clone());
        let (session, _rx) = server.connect(Identity::new(4)).await.unwrap();
        session.cancel();

        let result = read_pump(
            stream::pending::<std::result::Result<Message, String>>(),
            &session,
            &dispatcher,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_ok());
    }
}
