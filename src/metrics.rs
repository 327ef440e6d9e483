//! In-process counters.
//!
//! Kept as plain atomics; the embedding deployment decides how to export
//! them. A snapshot is logged once at shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Default)]
pub struct Metrics {
    active_rooms: AtomicI64,
    active_sockets: AtomicI64,
    messages_published: AtomicU64,
    bus_publish_failures: AtomicU64,
    dropped_priority_frames: AtomicU64,
    dropped_normal_frames: AtomicU64,
    room_participants: RwLock<HashMap<String, usize>>,
}

/// Point-in-time copy of every counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_rooms: i64,
    pub active_sockets: i64,
    pub messages_published: u64,
    pub bus_publish_failures: u64,
    pub dropped_priority_frames: u64,
    pub dropped_normal_frames: u64,
    pub room_participants: HashMap<String, usize>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_opened(&self) {
        self.active_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_closed(&self, room_id: &str) {
        self.active_rooms.fetch_sub(1, Ordering::Relaxed);
        self.room_participants.write().remove(room_id);
    }

    pub fn socket_opened(&self) {
        self.active_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self) {
        self.active_sockets.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_publish_failed(&self) {
        self.bus_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self, priority: bool) {
        let counter = if priority {
            &self.dropped_priority_frames
        } else {
            &self.dropped_normal_frames
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_room_participants(&self, room_id: &str, count: usize) {
        self.room_participants
            .write()
            .insert(room_id.to_owned(), count);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            active_sockets: self.active_sockets.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bus_publish_failures: self.bus_publish_failures.load(Ordering::Relaxed),
            dropped_priority_frames: self.dropped_priority_frames.load(Ordering::Relaxed),
            dropped_normal_frames: self.dropped_normal_frames.load(Ordering::Relaxed),
            room_participants: self.room_participants.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_lifecycle() {
        let metrics = Metrics::new();
        metrics.room_opened();
        metrics.socket_opened();
        metrics.socket_opened();
        metrics.set_room_participants("r1", 2);
        metrics.frame_dropped(true);
        metrics.frame_dropped(false);
        metrics.message_published();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_rooms, 1);
        assert_eq!(snap.active_sockets, 2);
        assert_eq!(snap.dropped_priority_frames, 1);
        assert_eq!(snap.dropped_normal_frames, 1);
        assert_eq!(snap.room_participants.get("r1"), Some(&2));

        metrics.socket_closed();
        metrics.room_closed("r1");
        let snap = metrics.snapshot();
        assert_eq!(snap.active_rooms, 0);
        assert_eq!(snap.active_sockets, 1);
        assert!(snap.room_participants.is_empty());
    }
}
