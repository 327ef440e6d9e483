//! Authoritative per-room state.
//!
//! A room is a single-writer state machine: every mutation happens under
//! one mutex, and the event it produces is enqueued to every member's
//! outbound queues before the lock is released. That single rule gives
//! both the consistent total order across members and the atomicity of
//! duplicate-session eviction. Enqueue is non-blocking, so holding the
//! lock across the fan-out cannot stall on a slow socket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEnvelope, EventBus};
use crate::metrics::Metrics;
use crate::protocol::{
    self, AdminEvent, AdminOp, ChatEvent, ChatRequest, ConferenceMessage, ErrorCode, ErrorEvent,
    HandUpdate, JoinResponse, MediaKind, MediaStateChanged, ParticipantInfo, Payload, RecentChats,
    Role, ScreenshareChanged, WaitingRoomNotification,
};
use crate::session::ClientSession;
use crate::SignalingError;

/// Per-member media and attention flags. All off on join.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub audio_on: bool,
    pub video_on: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
}

struct State {
    /// First client to join an empty room; sticky across its own
    /// disconnects, reassigned only by explicit transfer.
    owner_id: Option<String>,
    members: HashMap<String, Arc<ClientSession>>,
    roles: HashMap<String, Role>,
    /// Non-waiting member ids in join order.
    draw_order: Vec<String>,
    flags: HashMap<String, MediaFlags>,
    recent_chats: VecDeque<ChatEvent>,
    closed: bool,
}

/// Called (with the room id) whenever a room becomes empty or hostless,
/// so the hub can schedule deferred cleanup.
pub type OnEmpty = Box<dyn Fn(&str) + Send + Sync>;

pub struct Room {
    id: String,
    /// This instance's identity on the bus, for loopback suppression.
    instance_id: String,
    recent_chat_capacity: usize,
    state: Mutex<State>,
    on_empty: OnEmpty,
    bus: Option<Arc<dyn EventBus>>,
    metrics: Arc<Metrics>,
}

/// Bus scope of an emitted event.
enum Publish<'a> {
    /// Local-only (room snapshots, replies to one session).
    No,
    /// Replicate to other instances, optionally restricted by role.
    Fanout { sender: &'a str, roles: &'a [Role] },
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Room {
    pub fn new(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        recent_chat_capacity: usize,
        bus: Option<Arc<dyn EventBus>>,
        metrics: Arc<Metrics>,
        on_empty: OnEmpty,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            instance_id: instance_id.into(),
            recent_chat_capacity,
            state: Mutex::new(State {
                owner_id: None,
                members: HashMap::new(),
                roles: HashMap::new(),
                draw_order: Vec::new(),
                flags: HashMap::new(),
                recent_chats: VecDeque::new(),
                closed: false,
            }),
            on_empty,
            bus,
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> Option<String> {
        self.state.lock().owner_id.clone()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Empty, or occupied without a single host.
    pub fn is_empty_or_hostless(&self) -> bool {
        self.is_empty_or_hostless_locked(&self.state.lock())
    }

    /// Wire-format snapshot of the current membership.
    pub fn snapshot(&self) -> protocol::RoomState {
        self.build_snapshot(&self.state.lock(), "")
    }

    // ---- connection lifecycle ----------------------------------------

    /// Admits a socket into the room and broadcasts the new state.
    ///
    /// Role assignment: first join of an empty, ownerless room makes the
    /// owner (host); the owner rejoining is a host again; everyone else
    /// starts in the waiting room. A second connection for an id already
    /// present displaces the old session first.
    pub fn on_connect(self: &Arc<Self>, session: Arc<ClientSession>) -> Result<Role, SignalingError> {
        let client_id = session.client_id().to_owned();
        let mut state = self.state.lock();
        if state.closed {
            session.enqueue(&ConferenceMessage::new(ErrorEvent::new(
                ErrorCode::RoomClosed,
                "room is closed",
            )));
            session.close();
            return Err(SignalingError::RoomClosed);
        }

        if let Some(old) = state.members.get(&client_id).cloned() {
            info!(
                room = %self.id,
                client = %client_id,
                old_conn = %old.conn_id(),
                new_conn = %session.conn_id(),
                "displacing stale session"
            );
            old.enqueue(&ConferenceMessage::new(ErrorEvent::new(
                ErrorCode::Displaced,
                "signed in from another connection",
            )));
            old.close();
            self.remove_member(&mut state, &client_id);
        }

        let role = if state.owner_id.is_none() && state.members.is_empty() {
            state.owner_id = Some(client_id.clone());
            Role::Host
        } else if state.owner_id.as_deref() == Some(client_id.as_str()) {
            Role::Host
        } else {
            Role::Waiting
        };

        session.set_role(role);
        state.members.insert(client_id.clone(), session.clone());
        state.roles.insert(client_id.clone(), role);
        state.flags.insert(client_id.clone(), MediaFlags::default());
        if role != Role::Waiting {
            state.draw_order.push(client_id.clone());
        }

        session.enqueue(&ConferenceMessage::new(JoinResponse {
            client_id: client_id.clone(),
            role: role as i32,
            room_id: self.id.clone(),
        }));
        if role != Role::Waiting {
            self.send_recent_chats(&state, &session);
        }

        self.emit_room_state(&mut state);
        if role == Role::Waiting {
            let notification = ConferenceMessage::new(WaitingRoomNotification {
                client_id: client_id.clone(),
                display_name: session.display_name().to_owned(),
            });
            self.emit(
                &state,
                &notification,
                &[Role::Host],
                Publish::Fanout {
                    sender: &client_id,
                    roles: &[Role::Host],
                },
            );
        }

        self.metrics
            .set_room_participants(&self.id, state.members.len());
        self.track_membership(&client_id, true);
        Ok(role)
    }

    /// Removes a session and broadcasts the shrunken state. A no-op for
    /// sessions that were already displaced by a successor.
    pub fn on_disconnect(&self, session: &Arc<ClientSession>) {
        let client_id = session.client_id();
        let mut state = self.state.lock();
        match state.members.get(client_id) {
            Some(current) if current.conn_id() == session.conn_id() => {}
            _ => return,
        }
        let client_id = client_id.to_owned();
        self.remove_member(&mut state, &client_id);
        debug!(room = %self.id, client = %client_id, "member disconnected");

        if state.closed {
            return;
        }
        self.emit_room_state(&mut state);
        self.metrics
            .set_room_participants(&self.id, state.members.len());
        let needs_cleanup = self.is_empty_or_hostless_locked(&state);
        // The hub locks itself before inspecting rooms, so the empty
        // notification must go out without our lock held.
        drop(state);
        self.track_membership(&client_id, false);
        if needs_cleanup {
            (self.on_empty)(&self.id);
        }
    }

    /// Sends a terminal snapshot, disconnects everyone, and marks the
    /// room unjoinable. Idempotent.
    pub fn close(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        info!(room = %self.id, reason, "closing room");

        let snapshot = ConferenceMessage::new(self.build_snapshot(&state, reason));
        for session in state.members.values() {
            session.enqueue(&snapshot);
            session.close();
        }

        let members: Vec<String> = state.members.keys().cloned().collect();
        state.members.clear();
        state.roles.clear();
        state.flags.clear();
        state.draw_order.clear();
        state.recent_chats.clear();
        drop(state);

        for client_id in &members {
            self.track_membership(client_id, false);
        }
        self.metrics.set_room_participants(&self.id, 0);
        (self.on_empty)(&self.id);
    }

    // ---- member actions ----------------------------------------------

    /// Records and fans out a chat message. Private chats reach only the
    /// sender and the target and are not retained.
    pub fn handle_chat(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        req: ChatRequest,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        self.require_role(&state, session, &[Role::Host, Role::Participant], "chat")?;

        let event = ChatEvent {
            id: Uuid::new_v4().to_string(),
            sender_id: session.client_id().to_owned(),
            sender_name: session.display_name().to_owned(),
            content: req.content,
            timestamp_ms: now_ms(),
            is_private: req.is_private,
            target_id: req.target_id.clone(),
        };
        let msg = ConferenceMessage::new(event.clone());

        if req.is_private {
            let Some(target) = state.members.get(&req.target_id) else {
                return Err(SignalingError::Protocol(format!(
                    "unknown chat target {:?}",
                    req.target_id
                )));
            };
            target.enqueue(&msg);
            session.enqueue(&msg);
            return Ok(());
        }

        state.recent_chats.push_back(event);
        while state.recent_chats.len() > self.recent_chat_capacity {
            state.recent_chats.pop_front();
        }
        self.emit(
            &state,
            &msg,
            &[Role::Host, Role::Participant],
            Publish::Fanout {
                sender: session.client_id(),
                roles: &[Role::Host, Role::Participant],
            },
        );
        Ok(())
    }

    pub fn toggle_media(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        self.require_role(
            &state,
            session,
            &[Role::Host, Role::Participant],
            "toggle media",
        )?;
        let client_id = session.client_id().to_owned();
        self.set_media_flag(&mut state, &client_id, kind, enabled);
        Ok(())
    }

    pub fn toggle_screenshare(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        enabled: bool,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        self.require_role(
            &state,
            session,
            &[Role::Host, Role::Participant],
            "toggle screen share",
        )?;
        let client_id = session.client_id().to_owned();
        self.set_screenshare(&mut state, &client_id, enabled);
        Ok(())
    }

    pub fn toggle_hand(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        raised: bool,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        self.require_role(
            &state,
            session,
            &[Role::Host, Role::Participant],
            "raise hand",
        )?;
        let client_id = session.client_id().to_owned();
        if let Some(flags) = state.flags.get_mut(&client_id) {
            flags.hand_raised = raised;
        }
        let update = ConferenceMessage::new(HandUpdate {
            client_id: client_id.clone(),
            raised,
        });
        self.emit(
            &state,
            &update,
            &[],
            Publish::Fanout {
                sender: &client_id,
                roles: &[],
            },
        );
        Ok(())
    }

    /// Role gate for WebRTC signaling; the payload itself goes to the
    /// media plane, not through room state.
    pub fn authorize_signal(&self, session: &Arc<ClientSession>) -> Result<(), SignalingError> {
        let state = self.state.lock();
        self.require_role(&state, session, &[Role::Host, Role::Participant], "signal")
    }

    // ---- host actions ------------------------------------------------

    /// Applies a host (or, for transfer, owner-only) administrative
    /// action. Denying a waiting member is expressed as a kick while the
    /// target is still waiting.
    pub fn admin(
        self: &Arc<Self>,
        actor: &Arc<ClientSession>,
        op: AdminOp,
        target_id: &str,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        self.require_role(&state, actor, &[Role::Host], "administer the room")?;
        if op == AdminOp::Transfer && state.owner_id.as_deref() != Some(actor.client_id()) {
            return Err(SignalingError::Permission(
                "only the owner can transfer ownership".to_owned(),
            ));
        }

        if !state.members.contains_key(target_id) {
            // Only admission and removal travel between instances; the
            // target may be waiting on another instance's replica. Every
            // other action requires the target here.
            if !matches!(op, AdminOp::Approve | AdminOp::Kick) {
                return Err(SignalingError::Protocol(format!(
                    "unknown admin target {target_id:?}"
                )));
            }
            drop(state);
            return self.relay_admin(actor.client_id(), op, target_id);
        }

        let actor_id = actor.client_id().to_owned();
        let mut needs_cleanup = false;
        match op {
            AdminOp::Approve => self.admit_locally(&mut state, target_id, &actor_id),
            AdminOp::Kick => {
                needs_cleanup = self.kick_locally(&mut state, target_id, &actor_id);
            }
            AdminOp::Mute => {
                self.set_media_flag(&mut state, target_id, MediaKind::Audio, false);
                self.emit_admin_event(&state, AdminOp::Mute, target_id, &actor_id);
            }
            AdminOp::Unmute => {
                self.set_media_flag(&mut state, target_id, MediaKind::Audio, true);
                self.emit_admin_event(&state, AdminOp::Unmute, target_id, &actor_id);
            }
            AdminOp::StopShare => {
                self.set_screenshare(&mut state, target_id, false);
                self.emit_admin_event(&state, AdminOp::StopShare, target_id, &actor_id);
            }
            AdminOp::Promote => {
                if state.roles.get(target_id) == Some(&Role::Participant) {
                    self.set_role(&mut state, target_id, Role::Host);
                    self.emit_admin_event(&state, AdminOp::Promote, target_id, &actor_id);
                    self.emit_room_state(&mut state);
                }
            }
            AdminOp::Demote => {
                if state.roles.get(target_id) == Some(&Role::Host) {
                    self.set_role(&mut state, target_id, Role::Participant);
                    self.emit_admin_event(&state, AdminOp::Demote, target_id, &actor_id);
                    self.emit_room_state(&mut state);
                    needs_cleanup = self.is_empty_or_hostless_locked(&state);
                }
            }
            AdminOp::Transfer => {
                if state.roles.get(target_id) == Some(&Role::Waiting) {
                    return Err(SignalingError::Permission(
                        "cannot transfer ownership to a waiting member".to_owned(),
                    ));
                }
                state.owner_id = Some(target_id.to_owned());
                self.set_role(&mut state, target_id, Role::Host);
                if target_id != actor_id {
                    self.set_role(&mut state, &actor_id, Role::Participant);
                }
                self.emit_admin_event(&state, AdminOp::Transfer, target_id, &actor_id);
                self.emit_room_state(&mut state);
            }
        }
        drop(state);
        if needs_cleanup {
            (self.on_empty)(&self.id);
        }
        Ok(())
    }

    // ---- cleanup support ---------------------------------------------

    /// Promotes the earliest participant in draw order to host. Used by
    /// the hub when `hostless_policy = auto_promote_oldest`. Returns
    /// whether anyone was promoted.
    pub fn promote_oldest(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        let candidate = state
            .draw_order
            .iter()
            .find(|id| state.roles.get(*id) == Some(&Role::Participant))
            .cloned();
        let Some(client_id) = candidate else {
            return false;
        };
        info!(room = %self.id, client = %client_id, "auto-promoting oldest participant to host");
        self.set_role(&mut state, &client_id, Role::Host);
        self.emit_admin_event(&state, AdminOp::Promote, &client_id, "");
        self.emit_room_state(&mut state);
        true
    }

    // ---- cross-instance ----------------------------------------------

    /// Applies an event published by another instance: same fan-out as a
    /// local mutation, minus re-publication. Own envelopes (loopback) are
    /// dropped.
    pub fn apply_remote(&self, envelope: BusEnvelope) {
        if envelope.origin == self.instance_id {
            return;
        }
        let msg = match protocol::decode(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(room = %self.id, "dropping undecodable bus envelope: {e}");
                return;
            }
        };
        let roles: Vec<Role> = envelope
            .roles
            .iter()
            .filter_map(|r| Role::try_from(*r).ok())
            .collect();

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        // Keep the pieces of replicated state we serve locally in sync.
        match &msg.payload {
            Some(Payload::ChatEvent(event)) if !event.is_private => {
                state.recent_chats.push_back(event.clone());
                while state.recent_chats.len() > self.recent_chat_capacity {
                    state.recent_chats.pop_front();
                }
            }
            Some(Payload::MediaStateChanged(change)) => {
                if let (Some(flags), Ok(kind)) = (
                    state.flags.get_mut(&change.client_id),
                    MediaKind::try_from(change.kind),
                ) {
                    match kind {
                        MediaKind::Audio => flags.audio_on = change.enabled,
                        MediaKind::Video => flags.video_on = change.enabled,
                    }
                }
            }
            Some(Payload::ScreenshareChanged(change)) => {
                if let Some(flags) = state.flags.get_mut(&change.client_id) {
                    flags.screen_sharing = change.enabled;
                }
            }
            Some(Payload::HandUpdate(update)) => {
                if let Some(flags) = state.flags.get_mut(&update.client_id) {
                    flags.hand_raised = update.raised;
                }
            }
            _ => {}
        }
        self.emit(&state, &msg, &roles, Publish::No);
    }

    /// Applies a direct (user-topic) envelope addressed to one local
    /// session: cross-instance admits and kicks mutate state, everything
    /// else is delivered verbatim.
    pub fn apply_direct(&self, session: &Arc<ClientSession>, envelope: BusEnvelope) {
        if envelope.origin == self.instance_id {
            return;
        }
        let msg = match protocol::decode(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(room = %self.id, "dropping undecodable direct envelope: {e}");
                return;
            }
        };

        if let Some(Payload::AdminEvent(event)) = &msg.payload {
            let target = event.target_id.clone();
            let actor = event.actor_id.clone();
            let mut state = self.state.lock();
            let is_current = state
                .members
                .get(&target)
                .is_some_and(|s| s.conn_id() == session.conn_id());
            if state.closed || !is_current {
                return;
            }
            match AdminOp::try_from(event.action) {
                Ok(AdminOp::Approve) => {
                    self.admit_locally(&mut state, &target, &actor);
                }
                Ok(AdminOp::Kick) => {
                    let needs_cleanup = self.kick_locally(&mut state, &target, &actor);
                    drop(state);
                    if needs_cleanup {
                        (self.on_empty)(&self.id);
                    }
                }
                // The relay wire format carries admission and removal
                // only; anything else is a protocol mismatch from the
                // sending instance, not a notification to deliver.
                _ => {
                    warn!(
                        room = %self.id,
                        action = event.action,
                        "dropping unsupported direct admin action"
                    );
                }
            }
            return;
        }
        session.enqueue(&msg);
    }

    // ---- internals ---------------------------------------------------

    fn require_role(
        &self,
        state: &State,
        session: &Arc<ClientSession>,
        allowed: &[Role],
        action: &str,
    ) -> Result<(), SignalingError> {
        // The authoritative role lives here, not in the session cache;
        // checking under the lock closes the race with role transitions.
        let role = state
            .roles
            .get(session.client_id())
            .copied()
            .ok_or_else(|| SignalingError::Permission(format!("not a member: cannot {action}")))?;
        if allowed.contains(&role) {
            Ok(())
        } else {
            Err(SignalingError::Permission(format!(
                "role {role:?} may not {action}"
            )))
        }
    }

    fn admit_locally(&self, state: &mut State, target_id: &str, actor_id: &str) {
        if state.roles.get(target_id) != Some(&Role::Waiting) {
            return; // already admitted, or gone
        }
        self.set_role(state, target_id, Role::Participant);
        state.draw_order.push(target_id.to_owned());
        if let Some(session) = state.members.get(target_id).cloned() {
            self.send_recent_chats(state, &session);
        }
        self.emit_admin_event(state, AdminOp::Approve, target_id, actor_id);
        self.emit_room_state(state);
    }

    /// Removes a member outright. Returns whether the room is now empty
    /// or hostless, so the caller can notify the hub after unlocking.
    fn kick_locally(&self, state: &mut State, target_id: &str, actor_id: &str) -> bool {
        let Some(target) = state.members.get(target_id).cloned() else {
            return false;
        };
        target.enqueue(&ConferenceMessage::new(ErrorEvent::new(
            ErrorCode::Forbidden,
            "removed by a host",
        )));
        target.close();
        self.remove_member(state, target_id);
        self.emit_admin_event(state, AdminOp::Kick, target_id, actor_id);
        self.emit_room_state(state);
        self.metrics
            .set_room_participants(&self.id, state.members.len());
        self.track_membership(target_id, false);
        self.is_empty_or_hostless_locked(state)
    }

    /// Hands an admit or kick for a non-local target to the instance
    /// that hosts it, if the cross-instance membership set knows the
    /// target.
    ///
    /// The set lookup happens off the serialization domain, so the
    /// actor's `Ok` only means "relayed"; a target unknown on every
    /// instance is answered later with an `error` frame to the actor.
    fn relay_admin(
        self: &Arc<Self>,
        actor_id: &str,
        op: AdminOp,
        target_id: &str,
    ) -> Result<(), SignalingError> {
        // The direct-topic protocol carries admission and removal only;
        // admin() filters everything else before calling us.
        if !matches!(op, AdminOp::Approve | AdminOp::Kick) {
            return Err(SignalingError::Protocol(format!(
                "cannot relay {op:?} to a remote target"
            )));
        }
        let Some(bus) = &self.bus else {
            return Err(SignalingError::Protocol(format!(
                "unknown admin target {target_id:?}"
            )));
        };
        let envelope = BusEnvelope {
            origin: self.instance_id.clone(),
            sender_id: actor_id.to_owned(),
            event: "admin_event".to_owned(),
            payload: protocol::encode(&ConferenceMessage::new(AdminEvent {
                action: op as i32,
                target_id: target_id.to_owned(),
                actor_id: actor_id.to_owned(),
            }))
            .to_vec(),
            roles: Vec::new(),
        };
        let bus = bus.clone();
        let room = self.clone();
        let actor = actor_id.to_owned();
        let target = target_id.to_owned();
        tokio::spawn(async move {
            let known = bus
                .set_members(&membership_key(room.id()))
                .await
                .unwrap_or_default();
            if !known.iter().any(|id| *id == target) {
                debug!(room = %room.id, target = %target, "admin target unknown on every instance");
                room.send_error_to(
                    &actor,
                    ErrorCode::Malformed,
                    format!("unknown admin target {target:?}"),
                );
                return;
            }
            if let Err(e) = bus.publish_direct(&target, envelope).await {
                room.metrics.bus_publish_failed();
                warn!(room = %room.id, "direct admin relay failed: {e}");
            }
        });
        Ok(())
    }

    /// Answers one member with an `error` frame, if they are still here.
    fn send_error_to(&self, client_id: &str, code: ErrorCode, reason: impl Into<String>) {
        let state = self.state.lock();
        if let Some(session) = state.members.get(client_id) {
            session.enqueue(&ConferenceMessage::new(ErrorEvent::new(code, reason)));
        }
    }

    fn set_media_flag(&self, state: &mut State, client_id: &str, kind: MediaKind, enabled: bool) {
        let Some(flags) = state.flags.get_mut(client_id) else {
            return;
        };
        match kind {
            MediaKind::Audio => flags.audio_on = enabled,
            MediaKind::Video => flags.video_on = enabled,
        }
        let change = ConferenceMessage::new(MediaStateChanged {
            client_id: client_id.to_owned(),
            kind: kind as i32,
            enabled,
        });
        self.emit(
            state,
            &change,
            &[],
            Publish::Fanout {
                sender: client_id,
                roles: &[],
            },
        );
    }

    fn set_screenshare(&self, state: &mut State, client_id: &str, enabled: bool) {
        let Some(flags) = state.flags.get_mut(client_id) else {
            return;
        };
        flags.screen_sharing = enabled;
        let change = ConferenceMessage::new(ScreenshareChanged {
            client_id: client_id.to_owned(),
            enabled,
        });
        self.emit(
            state,
            &change,
            &[],
            Publish::Fanout {
                sender: client_id,
                roles: &[],
            },
        );
    }

    /// Role change that preserves draw order (promotion and demotion do
    /// not reorder; admission appends separately).
    fn set_role(&self, state: &mut State, client_id: &str, role: Role) {
        state.roles.insert(client_id.to_owned(), role);
        if let Some(session) = state.members.get(client_id) {
            session.set_role(role);
        }
    }

    fn remove_member(&self, state: &mut State, client_id: &str) {
        state.members.remove(client_id);
        state.roles.remove(client_id);
        state.flags.remove(client_id);
        state.draw_order.retain(|id| id != client_id);
    }

    fn is_empty_or_hostless_locked(&self, state: &State) -> bool {
        state.members.is_empty() || !state.roles.values().any(|r| *r == Role::Host)
    }

    fn build_snapshot(&self, state: &State, close_reason: &str) -> protocol::RoomState {
        let info = |id: &String| -> Option<ParticipantInfo> {
            let session = state.members.get(id)?;
            let role = state.roles.get(id)?;
            let flags = state.flags.get(id).copied().unwrap_or_default();
            Some(ParticipantInfo {
                client_id: id.clone(),
                display_name: session.display_name().to_owned(),
                role: *role as i32,
                audio_on: flags.audio_on,
                video_on: flags.video_on,
                screen_sharing: flags.screen_sharing,
                hand_raised: flags.hand_raised,
            })
        };
        let mut participants = Vec::new();
        let mut waiting = Vec::new();
        // Participants in draw order, then waiting members.
        for id in &state.draw_order {
            participants.extend(info(id));
        }
        let mut waiting_ids: Vec<&String> = state
            .roles
            .iter()
            .filter(|(_, role)| **role == Role::Waiting)
            .map(|(id, _)| id)
            .collect();
        waiting_ids.sort();
        for id in waiting_ids {
            waiting.extend(info(id));
        }
        protocol::RoomState {
            room_id: self.id.clone(),
            owner_id: state.owner_id.clone().unwrap_or_default(),
            participants,
            waiting,
            draw_order: state.draw_order.clone(),
            closed: state.closed,
            close_reason: close_reason.to_owned(),
        }
    }

    fn emit_room_state(&self, state: &mut State) {
        let snapshot = ConferenceMessage::new(self.build_snapshot(state, ""));
        self.emit(state, &snapshot, &[], Publish::No);
    }

    fn emit_admin_event(&self, state: &State, op: AdminOp, target_id: &str, actor_id: &str) {
        let event = ConferenceMessage::new(AdminEvent {
            action: op as i32,
            target_id: target_id.to_owned(),
            actor_id: actor_id.to_owned(),
        });
        self.emit(
            state,
            &event,
            &[],
            Publish::Fanout {
                sender: actor_id,
                roles: &[],
            },
        );
    }

    fn send_recent_chats(&self, state: &State, session: &Arc<ClientSession>) {
        if state.recent_chats.is_empty() {
            return;
        }
        session.enqueue(&ConferenceMessage::new(RecentChats {
            chats: state.recent_chats.iter().cloned().collect(),
        }));
    }

    /// Enqueues `msg` to every member whose role matches `roles` (empty
    /// means all), then optionally replicates it. Must be called with the
    /// state lock held: the fan-out completing before the lock is
    /// released is what §ordering rests on.
    fn emit(&self, state: &State, msg: &ConferenceMessage, roles: &[Role], publish: Publish<'_>) {
        let frame = protocol::encode(msg);
        let priority = msg.is_priority();
        for (id, session) in &state.members {
            if roles.is_empty() || state.roles.get(id).is_some_and(|r| roles.contains(r)) {
                session.enqueue_frame(frame.clone(), priority);
            }
        }

        if let Publish::Fanout { sender, roles } = publish {
            let Some(bus) = &self.bus else { return };
            self.metrics.message_published();
            let envelope = BusEnvelope {
                origin: self.instance_id.clone(),
                sender_id: sender.to_owned(),
                event: payload_label(msg).to_owned(),
                payload: frame.to_vec(),
                roles: roles.iter().map(|r| *r as i32).collect(),
            };
            let bus = bus.clone();
            let room_id = self.id.clone();
            let metrics = self.metrics.clone();
            // Fire and forget: a bus failure never fails the mutation.
            tokio::spawn(async move {
                if let Err(e) = bus.publish(&room_id, envelope).await {
                    metrics.bus_publish_failed();
                    warn!(room = %room_id, "bus publish failed: {e}");
                }
            });
        }
    }

    /// Broadcasts a server-originated event (media-plane announcements)
    /// to all members and other instances.
    pub fn broadcast(self: &Arc<Self>, msg: &ConferenceMessage) {
        let state = self.state.lock();
        if state.closed {
            return;
        }
        self.emit(
            &state,
            msg,
            &[],
            Publish::Fanout {
                sender: "",
                roles: &[],
            },
        );
    }

    fn track_membership(&self, client_id: &str, joined: bool) {
        let Some(bus) = &self.bus else { return };
        let bus = bus.clone();
        let key = membership_key(&self.id);
        let client_id = client_id.to_owned();
        tokio::spawn(async move {
            let result = if joined {
                bus.set_add(&key, &client_id).await
            } else {
                bus.set_remove(&key, &client_id).await
            };
            if let Err(e) = result {
                warn!("membership set update failed: {e}");
            }
        });
    }
}

/// Key of the cross-instance membership set for a room.
pub(crate) fn membership_key(room_id: &str) -> String {
    format!("members:{room_id}")
}

fn payload_label(msg: &ConferenceMessage) -> &'static str {
    match &msg.payload {
        Some(Payload::ChatEvent(_)) => "chat_event",
        Some(Payload::MediaStateChanged(_)) => "media_state_changed",
        Some(Payload::ScreenshareChanged(_)) => "screenshare_changed",
        Some(Payload::HandUpdate(_)) => "hand_update",
        Some(Payload::AdminEvent(_)) => "admin_event",
        Some(Payload::WaitingRoomNotification(_)) => "waiting_room_notification",
        Some(Payload::TrackAdded(_)) => "track_added",
        Some(Payload::RoomState(_)) => "room_state",
        _ => "event",
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &state.members.len())
            .field("owner_id", &state.owner_id)
            .field("closed", &state.closed)
            .finish()
    }
}
