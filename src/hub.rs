//! The room registry and its lifecycle.
//!
//! The hub owns two maps behind one coarse mutex: room id to room, and
//! room id to pending-deletion timer. Rooms that report themselves empty
//! or hostless are given a grace period before deletion so a transient
//! disconnect (most importantly the sole host's) does not destroy the
//! room and its recent chat history. No hub operation blocks on a room;
//! rooms notify the hub only after releasing their own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::{Admission, Admitted, TokenValidator};
use crate::bus::EventBus;
use crate::config::{Config, HostlessPolicy};
use crate::limit::RateGate;
use crate::media::{self, MediaPlane};
use crate::metrics::Metrics;
use crate::protocol::{ConferenceMessage, Role, SignalEvent};
use crate::room::Room;
use crate::router::Router;
use crate::session::{ClientSession, QueueCapacity};
use crate::SignalingError;

struct HubState {
    rooms: HashMap<String, Arc<Room>>,
    pending_deletes: HashMap<String, JoinHandle<()>>,
    /// Cancellation for each room's bus subscriber pump.
    room_subs: HashMap<String, CancellationToken>,
    shutting_down: bool,
}

pub struct Hub {
    instance_id: String,
    config: Config,
    state: Mutex<HubState>,
    admission: Admission,
    gate: Arc<RateGate>,
    router: Arc<Router>,
    bus: Option<Arc<dyn EventBus>>,
    media: Option<Arc<dyn MediaPlane>>,
    metrics: Arc<Metrics>,
    tasks: TaskTracker,
}

impl Hub {
    pub fn new(
        config: Config,
        validator: Box<dyn TokenValidator>,
        bus: Option<Arc<dyn EventBus>>,
        media: Option<Arc<dyn MediaPlane>>,
    ) -> Arc<Self> {
        let admission = Admission::new(validator, &config.allowed_origins, config.dev_mode);
        let gate = Arc::new(RateGate::new(&config));
        let router = Arc::new(Router::new(gate.clone(), media.clone()));
        Arc::new(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            config,
            state: Mutex::new(HubState {
                rooms: HashMap::new(),
                pending_deletes: HashMap::new(),
                room_subs: HashMap::new(),
                shutting_down: false,
            }),
            admission,
            gate,
            router,
            bus,
            media,
            metrics: Arc::new(Metrics::new()),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.state.lock().rooms.get(room_id).cloned()
    }

    /// Fetches a room, cancelling any pending deletion, or creates it.
    pub fn get_or_create(self: &Arc<Self>, room_id: &str) -> Result<Arc<Room>, SignalingError> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(SignalingError::Transport("server shutting down".to_owned()));
        }
        if let Some(room) = state.rooms.get(room_id).cloned() {
            if let Some(timer) = state.pending_deletes.remove(room_id) {
                debug!(room = %room_id, "reconnect within grace, cancelling deletion");
                timer.abort();
            }
            return Ok(room);
        }

        let hub = Arc::downgrade(self);
        let room = Room::new(
            room_id,
            self.instance_id.clone(),
            self.config.recent_chat_capacity,
            self.bus.clone(),
            self.metrics.clone(),
            Box::new(move |id: &str| {
                if let Some(hub) = hub.upgrade() {
                    hub.on_room_empty(id);
                }
            }),
        );
        state.rooms.insert(room_id.to_owned(), room.clone());
        self.metrics.room_opened();
        info!(room = %room_id, "room created");

        if let Some(bus) = &self.bus {
            let token = CancellationToken::new();
            state.room_subs.insert(room_id.to_owned(), token.clone());
            self.tasks
                .spawn(run_room_subscriber(bus.clone(), room.clone(), token));
        }
        Ok(room)
    }

    /// Schedules deferred deletion of an empty or hostless room,
    /// replacing any earlier timer.
    pub fn on_room_empty(self: &Arc<Self>, room_id: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.rooms.contains_key(room_id) {
            return;
        }
        if let Some(prior) = state.pending_deletes.remove(room_id) {
            prior.abort();
        }

        let grace = self.config.cleanup_grace;
        debug!(room = %room_id, ?grace, "scheduling room cleanup");
        let hub = Arc::downgrade(self);
        let room_id_owned = room_id.to_owned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(hub) = hub.upgrade() {
                hub.finish_cleanup(&room_id_owned);
            }
        });
        state.pending_deletes.insert(room_id.to_owned(), timer);
    }

    /// Runs when a cleanup timer fires: re-checks the room under the hub
    /// lock and only then decides its fate.
    fn finish_cleanup(self: &Arc<Self>, room_id: &str) {
        let (room, sub) = {
            let mut state = self.state.lock();
            state.pending_deletes.remove(room_id);
            let Some(room) = state.rooms.get(room_id).cloned() else {
                return;
            };

            if room.is_empty() {
                state.rooms.remove(room_id);
                let sub = state.room_subs.remove(room_id);
                drop(state);
                if let Some(sub) = sub {
                    sub.cancel();
                }
                self.metrics.room_closed(room_id);
                info!(room = %room_id, "empty room dropped after grace period");
                return;
            }

            if !room.is_empty_or_hostless() {
                // A host returned while the timer was in flight.
                return;
            }

            match self.config.hostless_policy {
                HostlessPolicy::AutoPromoteOldest => {
                    drop(state);
                    if room.promote_oldest() {
                        return;
                    }
                    // Nobody to promote (only waiting members): fall
                    // through to closing.
                    let mut state = self.state.lock();
                    state.rooms.remove(room_id);
                    (room, state.room_subs.remove(room_id))
                }
                HostlessPolicy::CloseAfterGrace => {
                    state.rooms.remove(room_id);
                    (room, state.room_subs.remove(room_id))
                }
            }
        };

        // Close outside the hub lock; Room::close re-enters the hub via
        // its on-empty callback, which must find the room already gone.
        if let Some(sub) = sub {
            sub.cancel();
        }
        room.close("host did not return");
        self.metrics.room_closed(room_id);
    }

    /// Brings up a freshly upgraded socket: room resolution, admission
    /// into the room, pump and companion tasks.
    pub async fn attach(
        self: &Arc<Self>,
        stream: WebSocketStream<TcpStream>,
        admitted: Admitted,
        room_id: &str,
    ) -> Result<(), SignalingError> {
        let room = self.get_or_create(room_id)?;
        let session = ClientSession::new(
            admitted.client_id,
            admitted.display_name,
            QueueCapacity {
                normal: self.config.send_queue_capacity,
                priority: self.config.priority_queue_capacity,
            },
            self.metrics.clone(),
        );
        self.metrics.socket_opened();

        let role = match room.on_connect(session.clone()) {
            Ok(role) => role,
            Err(e) => {
                self.metrics.socket_closed();
                return Err(e);
            }
        };
        info!(
            conn = %session.conn_id(),
            client = %session.client_id(),
            room = %room_id,
            ?role,
            "session attached"
        );

        // A waiting join into a hostless room must not silently cancel
        // its pending cleanup (get_or_create just did exactly that).
        if role == Role::Waiting && room.is_empty_or_hostless() {
            self.on_room_empty(room_id);
        }

        let (sink, source) = stream.split();
        self.tasks.spawn(session.clone().write_pump(
            sink,
            self.config.ping_interval,
            self.config.write_timeout,
        ));

        if let Some(bus) = &self.bus {
            self.tasks.spawn(run_direct_subscriber(
                bus.clone(),
                room.clone(),
                session.clone(),
            ));
        }
        if role != Role::Waiting {
            if let Some(media_plane) = &self.media {
                self.tasks.spawn(start_media_session(
                    media_plane.clone(),
                    room.clone(),
                    session.clone(),
                ));
            }
        }

        let hub = self.clone();
        let room_weak = Arc::downgrade(&room);
        let router = self.router.clone();
        let room_id = room_id.to_owned();
        self.tasks.spawn(async move {
            session.clone().read_pump(source, room_weak, router).await;
            hub.metrics.socket_closed();
            if let Some(media_plane) = &hub.media {
                if let Err(e) = media_plane
                    .delete_session(session.client_id(), &room_id)
                    .await
                {
                    debug!(client = %session.client_id(), "media session delete failed: {e}");
                }
            }
        });
        Ok(())
    }

    /// Closes every room, the bus, and the media plane, waiting up to the
    /// configured deadline for queues to drain.
    pub async fn shutdown(&self) {
        info!("shutting down hub");
        let (rooms, timers, subs) = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            let rooms: Vec<Arc<Room>> = state.rooms.drain().map(|(_, room)| room).collect();
            let timers: Vec<JoinHandle<()>> =
                state.pending_deletes.drain().map(|(_, t)| t).collect();
            let subs: Vec<CancellationToken> =
                state.room_subs.drain().map(|(_, t)| t).collect();
            (rooms, timers, subs)
        };

        for timer in timers {
            timer.abort();
        }
        for sub in subs {
            sub.cancel();
        }
        for room in rooms {
            room.close("server shutting down");
            self.metrics.room_closed(room.id());
        }

        if let Some(bus) = &self.bus {
            bus.close().await;
        }

        self.tasks.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded with session tasks still running");
        }
        info!(metrics = ?self.metrics.snapshot(), "hub stopped");
    }
}

/// Applies a room's bus traffic locally, resubscribing with capped
/// backoff if the subscription drops.
async fn run_room_subscriber(bus: Arc<dyn EventBus>, room: Arc<Room>, token: CancellationToken) {
    let mut delay = Duration::from_millis(200);
    loop {
        let subscribed = tokio::select! {
            () = token.cancelled() => return,
            sub = bus.subscribe(room.id()) => sub,
        };
        match subscribed {
            Ok(sub) => {
                delay = Duration::from_millis(200);
                loop {
                    tokio::select! {
                        () = token.cancelled() => return,
                        envelope = sub.recv() => match envelope {
                            Some(envelope) => room.apply_remote(envelope),
                            None => break,
                        }
                    }
                }
            }
            Err(e) => {
                warn!(room = %room.id(), "bus subscription failed: {e}");
            }
        }
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(10));
    }
}

/// Delivers direct (user-topic) envelopes to one session for as long as
/// it lives.
async fn run_direct_subscriber(
    bus: Arc<dyn EventBus>,
    room: Arc<Room>,
    session: Arc<ClientSession>,
) {
    let token = session.cancel_token();
    let sub = tokio::select! {
        () = token.cancelled() => return,
        sub = bus.subscribe_direct(session.client_id()) => sub,
    };
    let sub = match sub {
        Ok(sub) => sub,
        Err(e) => {
            warn!(client = %session.client_id(), "direct subscription failed: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            envelope = sub.recv() => match envelope {
                Some(envelope) => room.apply_direct(&session, envelope),
                None => return,
            }
        }
    }
}

/// Creates the media-plane session for a member and forwards its event
/// stream until it ends or the session dies.
async fn start_media_session(
    media_plane: Arc<dyn MediaPlane>,
    room: Arc<Room>,
    session: Arc<ClientSession>,
) {
    let uid = session.client_id().to_owned();
    let room_id = room.id().to_owned();
    match media_plane.create_session(&uid, &room_id).await {
        Ok(offer) => {
            session.enqueue(&ConferenceMessage::new(SignalEvent {
                sender_id: String::new(),
                signal: Some(offer),
            }));
        }
        Err(e) => {
            warn!(client = %uid, room = %room_id, "media session create failed: {e}");
            return;
        }
    }
    match media_plane.listen_events(&uid, &room_id).await {
        Ok(events) => media::forward_events(events, session, room).await,
        Err(e) => {
            warn!(client = %uid, room = %room_id, "media event stream failed: {e}");
        }
    }
}
