//! Per-socket client sessions.
//!
//! A session owns one websocket: a read pump that decodes inbound frames
//! and hands them to the router, and a write pump that drains two bounded
//! outbound queues. The priority queue (state, signaling, errors) is
//! strictly preferred over the normal queue (chat and the like); enqueue
//! never blocks, and a full queue drops the frame so a slow consumer can
//! never stall a room.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::protocol::{self, ConferenceMessage, Role};
use crate::room::Room;
use crate::router::Router;

/// Outbound queue capacities, from the server configuration.
#[derive(Clone, Copy, Debug)]
pub struct QueueCapacity {
    pub normal: usize,
    pub priority: usize,
}

/// Server-side representation of one connected client socket.
pub struct ClientSession {
    client_id: String,
    display_name: String,
    /// Correlation id, unique per socket. Distinguishes a session from
    /// its same-client-id successor after an eviction.
    conn_id: Uuid,
    role: Mutex<Role>,
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Pings sent since the last pong. Two unanswered pings tear the
    /// session down.
    pending_pings: AtomicU32,
    priority_tx: flume::Sender<Bytes>,
    priority_rx: flume::Receiver<Bytes>,
    normal_tx: flume::Sender<Bytes>,
    normal_rx: flume::Receiver<Bytes>,
    metrics: Arc<Metrics>,
}

impl ClientSession {
    pub fn new(
        client_id: impl Into<String>,
        display_name: impl Into<String>,
        capacity: QueueCapacity,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (priority_tx, priority_rx) = flume::bounded(capacity.priority);
        let (normal_tx, normal_rx) = flume::bounded(capacity.normal);
        Arc::new(Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
            conn_id: Uuid::new_v4(),
            role: Mutex::new(Role::Waiting),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pending_pings: AtomicU32::new(0),
            priority_tx,
            priority_rx,
            normal_tx,
            normal_rx,
            metrics,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// The role cache, updated by the room inside its serialization
    /// domain and read here for logging and dispatch.
    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub(crate) fn set_role(&self, role: Role) {
        *self.role.lock() = role;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the session closes; companion tasks (direct
    /// bus delivery, media forwarding) tie their lifetime to it.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Marks the session closed and wakes the pumps. Idempotent. The
    /// write pump drains both queues, writes a close frame, and exits;
    /// the read pump exits and runs the room disconnect path.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
    }

    /// Serializes and enqueues one message.
    pub fn enqueue(&self, msg: &ConferenceMessage) {
        self.enqueue_frame(protocol::encode(msg), msg.is_priority());
    }

    /// Enqueues an already-encoded frame. Non-blocking: a full priority
    /// queue drops at error severity, a full normal queue at warn.
    pub fn enqueue_frame(&self, frame: Bytes, priority: bool) {
        if self.is_closed() {
            return;
        }
        let tx = if priority {
            &self.priority_tx
        } else {
            &self.normal_tx
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(flume::TrySendError::Disconnected(_)) => {}
            Err(flume::TrySendError::Full(_)) => {
                self.metrics.frame_dropped(priority);
                if priority {
                    error!(
                        conn = %self.conn_id,
                        client = %self.client_id,
                        "priority queue full, dropping frame"
                    );
                } else {
                    warn!(
                        conn = %self.conn_id,
                        client = %self.client_id,
                        "send queue full, dropping frame"
                    );
                }
            }
        }
    }

    pub(crate) fn pong_received(&self) {
        self.pending_pings.store(0, Ordering::Relaxed);
    }

    /// Drains both outbound queues without a write pump, decoding each
    /// frame. Returns `(priority, normal)` in enqueue order.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> (Vec<ConferenceMessage>, Vec<ConferenceMessage>) {
        let drain = |rx: &flume::Receiver<Bytes>| {
            rx.try_iter()
                .map(|frame| protocol::decode(&frame).expect("queued frames decode"))
                .collect()
        };
        (drain(&self.priority_rx), drain(&self.normal_rx))
    }

    /// Drains the outbound queues into the socket until the session is
    /// closed or the transport fails. Sends keep-alive pings and gives up
    /// after two go unanswered.
    pub async fn write_pump<S>(
        self: Arc<Self>,
        mut sink: S,
        ping_interval: Duration,
        write_timeout: Duration,
    ) where
        S: Sink<Message> + Unpin + Send,
        S::Error: std::fmt::Display,
    {
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so an idle socket is
        // not pinged at connect time.
        ping_timer.tick().await;

        let mut transport_ok = true;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                frame = self.priority_rx.recv_async() => {
                    let Ok(frame) = frame else { break };
                    if !self.write(&mut sink, Message::Binary(frame), write_timeout).await {
                        transport_ok = false;
                        break;
                    }
                }
                frame = self.normal_rx.recv_async() => {
                    let Ok(frame) = frame else { break };
                    if !self.write(&mut sink, Message::Binary(frame), write_timeout).await {
                        transport_ok = false;
                        break;
                    }
                }
                _ = ping_timer.tick() => {
                    if self.pending_pings.fetch_add(1, Ordering::Relaxed) >= 2 {
                        info!(conn = %self.conn_id, "client missed two pings, closing");
                        transport_ok = false;
                        break;
                    }
                    if !self.write(&mut sink, Message::Ping(Bytes::new()), write_timeout).await {
                        transport_ok = false;
                        break;
                    }
                }
            }
        }

        if transport_ok {
            // Drain whatever was queued before the close, priority first.
            while let Ok(frame) = self.priority_rx.try_recv() {
                if !self.write(&mut sink, Message::Binary(frame), write_timeout).await {
                    transport_ok = false;
                    break;
                }
            }
            while transport_ok {
                let Ok(frame) = self.normal_rx.try_recv() else {
                    break;
                };
                if !self.write(&mut sink, Message::Binary(frame), write_timeout).await {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        }

        self.close();
        debug!(conn = %self.conn_id, client = %self.client_id, "write pump exited");
    }

    async fn write<S>(&self, sink: &mut S, msg: Message, write_timeout: Duration) -> bool
    where
        S: Sink<Message> + Unpin + Send,
        S::Error: std::fmt::Display,
    {
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(conn = %self.conn_id, "socket write failed: {e}");
                false
            }
            Err(_) => {
                warn!(conn = %self.conn_id, "socket write deadline exceeded");
                false
            }
        }
    }

    /// Reads inbound frames until the socket or session dies, then runs
    /// the disconnect path exactly once.
    ///
    /// Decode failures are logged and skipped; non-binary frames are
    /// ignored. The room is held weakly: if it is gone, so are we.
    pub async fn read_pump<St, E>(self: Arc<Self>, mut stream: St, room: Weak<Room>, router: Arc<Router>)
    where
        St: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                None => break,
                Some(Err(e)) => {
                    debug!(conn = %self.conn_id, "socket read failed: {e}");
                    break;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let msg = match protocol::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(
                                conn = %self.conn_id,
                                client = %self.client_id,
                                "dropping malformed frame: {e}"
                            );
                            continue;
                        }
                    };
                    let Some(room) = room.upgrade() else { break };
                    router.dispatch(&room, &self, msg).await;
                }
                Some(Ok(Message::Pong(_))) => self.pong_received(),
                Some(Ok(Message::Close(_))) => break,
                // Text and ping frames are not part of the protocol.
                Some(Ok(_)) => {}
            }
        }

        if let Some(room) = room.upgrade() {
            room.on_disconnect(&self);
        }
        self.close();
        debug!(conn = %self.conn_id, client = %self.client_id, "read pump exited");
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("conn_id", &self.conn_id)
            .field("role", &self.role())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::protocol::{ChatEvent, ErrorCode, ErrorEvent, Payload, RoomState};

    use super::*;

    fn session(capacity: QueueCapacity) -> Arc<ClientSession> {
        ClientSession::new("u1", "Ada", capacity, Arc::new(Metrics::new()))
    }

    fn chat(n: usize) -> ConferenceMessage {
        ConferenceMessage::new(ChatEvent {
            id: format!("c{n}"),
            content: "hi".into(),
            ..ChatEvent::default()
        })
    }

    fn decode_binary(msg: &Message) -> ConferenceMessage {
        match msg {
            Message::Binary(bytes) => protocol::decode(bytes).unwrap(),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    /// Frames already sitting in the normal queue are overtaken by a
    /// later priority frame.
    #[tokio::test(flavor = "multi_thread")]
    async fn priority_overtakes_normal_backlog() {
        let session = session(QueueCapacity {
            normal: 32,
            priority: 8,
        });
        for n in 0..10 {
            session.enqueue(&chat(n));
        }
        session.enqueue(&ConferenceMessage::new(RoomState::default()));
        session.enqueue(&chat(10));

        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let pump = tokio::spawn(session.clone().write_pump(
            tx,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));

        // Close once everything is queued; the pump drains before the
        // close frame.
        session.close();
        pump.await.unwrap();

        let frames: Vec<Message> = rx.collect().await;
        let binary: Vec<ConferenceMessage> = frames
            .iter()
            .filter(|m| m.is_binary())
            .map(decode_binary)
            .collect();
        assert_eq!(binary.len(), 12);
        assert_matches!(binary[0].payload, Some(Payload::RoomState(_)));
        assert_matches!(binary[1].payload, Some(Payload::ChatEvent(_)));
        assert_matches!(
            frames.last(),
            Some(Message::Close(_)),
            "close frame after drain"
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn full_queues_drop_instead_of_blocking() {
        let metrics = Arc::new(Metrics::new());
        let session = ClientSession::new(
            "u1",
            "Ada",
            QueueCapacity {
                normal: 2,
                priority: 1,
            },
            metrics.clone(),
        );

        for n in 0..5 {
            session.enqueue(&chat(n));
        }
        session.enqueue(&ConferenceMessage::new(ErrorEvent::new(
            ErrorCode::RateLimited,
            "slow down",
        )));
        session.enqueue(&ConferenceMessage::new(ErrorEvent::new(
            ErrorCode::RateLimited,
            "slow down",
        )));

        let snap = metrics.snapshot();
        assert_eq!(snap.dropped_normal_frames, 3);
        assert_eq!(snap.dropped_priority_frames, 1);
        assert!(logs_contain("send queue full"));
        assert!(logs_contain("priority queue full"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_enqueue() {
        let session = session(QueueCapacity {
            normal: 4,
            priority: 4,
        });
        session.close();
        session.close();
        assert!(session.is_closed());

        session.enqueue(&chat(0));
        assert!(
            session.normal_rx.is_empty(),
            "no frames enqueued after close"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_error_tears_down_session() {
        let session = session(QueueCapacity {
            normal: 4,
            priority: 4,
        });
        session.enqueue(&chat(0));

        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        drop(rx); // every write now fails
        session
            .clone()
            .write_pump(tx, Duration::from_secs(60), Duration::from_secs(5))
            .await;
        assert!(session.is_closed());
    }
}
