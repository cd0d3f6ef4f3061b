//! Synchronous broadcast bus with a bounded in-memory ring log.
//!
//! Producers publish normalized events; the bus stamps a monotonically
//! increasing id and a wall-clock timestamp, appends the event to a ring
//! of the most recent [`RING_CAP`] entries, and invokes every registered
//! listener on the publishing thread. Listeners must be fast, must not
//! block, and must not publish re-entrantly.

use crate::types::{
    truncate_utf8, Event, EVENT_MSG_MAX, EVENT_PAYLOAD_MAX, EVENT_SCHEMA_VERSION,
    EVENT_SOURCE_MAX, EVENT_TYPE_MAX, UID_MAX,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Number of events retained in the ring log.
pub const RING_CAP: usize = 64;

/// Handle returned by [`EventBus::add_listener`], used for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Ring {
    events: VecDeque<Event>,
    next_id: u32,
}

struct Listeners {
    slots: Vec<(u64, Listener)>,
    next_id: u64,
}

/// Process-wide event bus.
///
/// The ring and the listener table are guarded by separate short critical
/// sections; listener callbacks run outside both.
pub struct EventBus {
    ring: Mutex<Ring>,
    listeners: RwLock<Listeners>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(RING_CAP),
                next_id: 1,
            }),
            listeners: RwLock::new(Listeners {
                slots: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Publish an event and fan it out to all listeners.
    ///
    /// Fields are truncated to their schema bounds. Returns the assigned id.
    pub fn publish(
        &self,
        kind: &str,
        source: &str,
        device_uid: &str,
        short_addr: u16,
        msg: &str,
        payload_json: &str,
    ) -> u32 {
        let mut event = Event {
            v: EVENT_SCHEMA_VERSION,
            id: 0,
            ts_ms: unix_millis(),
            kind: truncate_utf8(kind, EVENT_TYPE_MAX).to_owned(),
            source: truncate_utf8(source, EVENT_SOURCE_MAX).to_owned(),
            device_uid: truncate_utf8(device_uid, UID_MAX).to_owned(),
            short_addr,
            msg: truncate_utf8(msg, EVENT_MSG_MAX).to_owned(),
            payload_json: truncate_utf8(payload_json, EVENT_PAYLOAD_MAX).to_owned(),
        };

        {
            let mut ring = self.ring.lock();
            event.id = ring.next_id;
            ring.next_id = ring.next_id.wrapping_add(1);
            if ring.events.len() == RING_CAP {
                ring.events.pop_front();
            }
            ring.events.push_back(event.clone());
        }

        // Snapshot the listener table so callbacks run outside the lock.
        let listeners: Vec<Listener> = {
            let table = self.listeners.read();
            table.slots.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in &listeners {
            listener(&event);
        }

        info!(
            "#{} {}/{} uid={} short=0x{:04x} {}",
            event.id,
            event.source,
            event.kind,
            if event.device_uid.is_empty() { "-" } else { &event.device_uid },
            event.short_addr,
            if event.msg.is_empty() { "-" } else { &event.msg },
        );

        event.id
    }

    /// Newest assigned event id, 0 when nothing has been published.
    pub fn last_id(&self) -> u32 {
        let ring = self.ring.lock();
        ring.events.back().map(|e| e.id).unwrap_or(0)
    }

    /// Events with `id > since_id` in ascending id order (at most `max`),
    /// plus the newest id known to the ring.
    pub fn list_since(&self, since_id: u32, max: usize) -> (Vec<Event>, u32) {
        let ring = self.ring.lock();
        let last = ring.events.back().map(|e| e.id).unwrap_or(0);
        let events = ring
            .events
            .iter()
            .filter(|e| e.id > since_id)
            .take(max)
            .cloned()
            .collect();
        (events, last)
    }

    /// Register a listener invoked synchronously for every published event.
    pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let mut table = self.listeners.write();
        let id = table.next_id;
        table.next_id += 1;
        table.slots.push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Remove a previously registered listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut table = self.listeners.write();
        table.slots.retain(|(slot_id, _)| *slot_id != id.0);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_from_one() {
        let bus = EventBus::new();
        assert_eq!(bus.last_id(), 0);
        let a = bus.publish("test.a", "t", "", 0, "", "");
        let b = bus.publish("test.b", "t", "", 0, "", "");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(bus.last_id(), 2);
    }

    #[test]
    fn ring_keeps_most_recent() {
        let bus = EventBus::new();
        for i in 0..(RING_CAP as u32 + 10) {
            bus.publish("test.tick", "t", "", 0, &format!("n={i}"), "");
        }
        let (events, last) = bus.list_since(0, 1024);
        assert_eq!(events.len(), RING_CAP);
        assert_eq!(last, RING_CAP as u32 + 10);
        // Oldest retained id is last - RING_CAP + 1.
        assert_eq!(events[0].id, last - RING_CAP as u32 + 1);
        let ids: Vec<u32> = events.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn list_since_filters_and_limits() {
        let bus = EventBus::new();
        for _ in 0..10 {
            bus.publish("test.tick", "t", "", 0, "", "");
        }
        let (events, last) = bus.list_since(7, 100);
        assert_eq!(last, 10);
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![8, 9, 10]);

        let (events, _) = bus.list_since(0, 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 1);
    }

    #[test]
    fn listeners_observe_published_events() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.add_listener(move |ev| sink.lock().push(ev.kind.clone()));

        bus.publish("test.one", "t", "", 0, "", "");
        bus.remove_listener(id);
        bus.publish("test.two", "t", "", 0, "", "");

        assert_eq!(*seen.lock(), vec!["test.one".to_owned()]);
    }

    #[test]
    fn fields_are_truncated_to_bounds() {
        let bus = EventBus::new();
        let long = "x".repeat(512);
        bus.publish(&long, &long, &long, 0, &long, &long);
        let (events, _) = bus.list_since(0, 1);
        let ev = &events[0];
        assert_eq!(ev.kind.len(), EVENT_TYPE_MAX);
        assert_eq!(ev.source.len(), EVENT_SOURCE_MAX);
        assert_eq!(ev.device_uid.len(), UID_MAX);
        assert_eq!(ev.msg.len(), EVENT_MSG_MAX);
        assert_eq!(ev.payload_json.len(), EVENT_PAYLOAD_MAX);
    }
}
