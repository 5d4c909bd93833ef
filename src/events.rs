//! Per-NPID friend event inboxes and long-poll wakeups.
//!
//! Events queue in memory and are mirrored to the `events.json` journal on
//! every mutation, so pending friend requests survive a restart.  Each inbox
//! is drained whole by its owner's long poll.
//!
//! Wakeups go through a refcounted per-NPID signal registry: a
//! [`PollWaiter`] guard increments the refcount on registration and erases
//! the registry entry when the last waiter for that NPID departs, so idle
//! NPIDs never accumulate signal state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::vlog;

/// One pending event in a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FriendEvent {
    /// A friend's presence flipped; `status` is `"online"` or `"offline"`.
    StatusChanged { npid: String, status: String, at: i64 },
    FriendsRequestReceived { npid: String, at: i64 },
}

impl FriendEvent {
    pub fn at(&self) -> i64 {
        match self {
            FriendEvent::StatusChanged { at, .. } => *at,
            FriendEvent::FriendsRequestReceived { at, .. } => *at,
        }
    }
}

// ---------------------------------------------------------------------------
// Inboxes
// ---------------------------------------------------------------------------

/// Per-NPID inbox map with a journal mirror.
///
/// Lock order: the inbox mutex is taken first, the file mutex second.  The
/// file mutex only serialises journal rewrites.
pub struct EventBus {
    path: PathBuf,
    inbox: Mutex<HashMap<String, Vec<FriendEvent>>>,
    file_lock: Mutex<()>,
}

impl EventBus {
    /// Open the bus, restoring any journalled inboxes.  A corrupt journal is
    /// logged and dropped rather than refusing to start.
    pub fn open(path: PathBuf) -> Self {
        let inbox = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Vec<FriendEvent>>>(&content)
            {
                Ok(map) => map,
                Err(e) => {
                    vlog!("Discarding unreadable event journal: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        EventBus {
            path,
            inbox: Mutex::new(inbox),
            file_lock: Mutex::new(()),
        }
    }

    fn persist(&self, inbox: &HashMap<String, Vec<FriendEvent>>) {
        // Stable key order keeps journal diffs readable.
        let snapshot: BTreeMap<&String, &Vec<FriendEvent>> = inbox.iter().collect();
        let _file = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    vlog!("Failed to write event journal: {e}");
                }
            }
            Err(e) => vlog!("Failed to serialize event journal: {e}"),
        }
    }

    pub fn push(&self, inbox_npid: &str, event: FriendEvent) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.entry(inbox_npid.to_string()).or_default().push(event);
        self.persist(&inbox);
    }

    pub fn push_status(&self, inbox_npid: &str, target_npid: &str, online: bool, at: i64) {
        self.push(
            inbox_npid,
            FriendEvent::StatusChanged {
                npid: target_npid.to_string(),
                status: if online { "online" } else { "offline" }.to_string(),
                at,
            },
        );
    }

    pub fn push_request(&self, inbox_npid: &str, sender_npid: &str, at: i64) {
        self.push(
            inbox_npid,
            FriendEvent::FriendsRequestReceived {
                npid: sender_npid.to_string(),
                at,
            },
        );
    }

    /// Withdraw a pending friend-request event (request cancelled before the
    /// recipient polled it).
    pub fn remove_request(&self, inbox_npid: &str, sender_npid: &str) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(events) = inbox.get_mut(inbox_npid) {
            events.retain(|e| {
                !matches!(e, FriendEvent::FriendsRequestReceived { npid, .. } if npid == sender_npid)
            });
            if events.is_empty() {
                inbox.remove(inbox_npid);
            }
            self.persist(&inbox);
        }
    }

    /// Take the whole inbox in arrival order.
    pub fn drain(&self, inbox_npid: &str) -> Vec<FriendEvent> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        match inbox.remove(inbox_npid) {
            Some(events) => {
                self.persist(&inbox);
                events
            }
            None => Vec::new(),
        }
    }

    /// Drop events older than `cutoff`; empty inboxes are removed.
    pub fn prune_older_than(&self, cutoff: i64) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let before: usize = inbox.values().map(Vec::len).sum();
        inbox.retain(|_, events| {
            events.retain(|e| e.at() >= cutoff);
            !events.is_empty()
        });
        let after: usize = inbox.values().map(Vec::len).sum();
        if after != before {
            self.persist(&inbox);
        }
    }

    #[cfg(test)]
    fn pending(&self, inbox_npid: &str) -> usize {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.get(inbox_npid).map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Poll signals
// ---------------------------------------------------------------------------

struct SignalEntry {
    notify: Arc<Notify>,
    waiters: usize,
}

/// Refcounted per-NPID wakeup registry.
#[derive(Default)]
pub struct PollSignals {
    inner: Mutex<HashMap<String, SignalEntry>>,
}

impl PollSignals {
    /// Register interest in wakeups for `npid`.  The returned guard keeps the
    /// signal alive; dropping it releases the registry entry once the last
    /// waiter is gone.
    pub fn register(self: &Arc<Self>, npid: &str) -> PollWaiter {
        let notify = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let entry = map.entry(npid.to_string()).or_insert_with(|| SignalEntry {
                notify: Arc::new(Notify::new()),
                waiters: 0,
            });
            entry.waiters += 1;
            Arc::clone(&entry.notify)
        };
        PollWaiter {
            registry: Arc::clone(self),
            npid: npid.to_string(),
            notify,
        }
    }

    /// Wake one waiter for `npid`, or do nothing if no one is waiting.
    pub fn notify(&self, npid: &str) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(npid) {
            entry.notify.notify_one();
        }
    }

    pub fn waiter_count(&self, npid: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(npid).map_or(0, |e| e.waiters)
    }
}

/// Scoped waiter handle for one NPID's poll signal.
pub struct PollWaiter {
    registry: Arc<PollSignals>,
    npid: String,
    notify: Arc<Notify>,
}

impl PollWaiter {
    /// Wait until notified or `budget` elapses.  Returns true when woken by a
    /// notification.
    pub async fn wait_for(&self, budget: Duration) -> bool {
        tokio::time::timeout(budget, self.notify.notified())
            .await
            .is_ok()
    }
}

impl Drop for PollWaiter {
    fn drop(&mut self) {
        let mut map = self.registry.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(&self.npid) {
            entry.waiters = entry.waiters.saturating_sub(1);
            if entry.waiters == 0 {
                map.remove(&self.npid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_bus() -> EventBus {
        let pid = std::process::id();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("v3kn-events-{pid}-{ts}"));
        EventBus::open(dir.join("events.json"))
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let bus = test_bus();
        bus.push_status("alice", "bob", true, 10);
        bus.push_request("alice", "carol", 11);
        bus.push_status("alice", "dave", false, 12);

        let events = bus.drain("alice");
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], FriendEvent::StatusChanged { npid, status, .. }
            if npid == "bob" && status == "online"));
        assert!(matches!(&events[1], FriendEvent::FriendsRequestReceived { npid, .. }
            if npid == "carol"));
        assert!(matches!(&events[2], FriendEvent::StatusChanged { npid, status, .. }
            if npid == "dave" && status == "offline"));

        assert!(bus.drain("alice").is_empty());
    }

    #[test]
    fn journal_survives_reopen() {
        let bus = test_bus();
        bus.push_request("alice", "bob", 5);
        let path = bus.path.clone();
        drop(bus);

        let reopened = EventBus::open(path);
        let events = reopened.drain("alice");
        assert_eq!(
            events,
            vec![FriendEvent::FriendsRequestReceived {
                npid: "bob".into(),
                at: 5
            }]
        );
    }

    #[test]
    fn cancelled_request_is_withdrawn() {
        let bus = test_bus();
        bus.push_request("alice", "bob", 5);
        bus.push_status("alice", "carol", true, 6);
        bus.remove_request("alice", "bob");

        let events = bus.drain("alice");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FriendEvent::StatusChanged { npid, .. } if npid == "carol"));
    }

    #[test]
    fn prune_drops_old_events() {
        let bus = test_bus();
        bus.push_request("alice", "bob", 100);
        bus.push_request("alice", "carol", 200);
        bus.prune_older_than(150);
        assert_eq!(bus.pending("alice"), 1);
        bus.prune_older_than(300);
        assert_eq!(bus.pending("alice"), 0);
    }

    #[test]
    fn event_wire_encoding() {
        let event = FriendEvent::StatusChanged {
            npid: "bob".into(),
            status: "online".into(),
            at: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "status_changed", "npid": "bob", "status": "online", "at": 42})
        );

        let event = FriendEvent::FriendsRequestReceived {
            npid: "carol".into(),
            at: 43,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "friends_request_received", "npid": "carol", "at": 43})
        );
    }

    #[tokio::test]
    async fn registry_refcounts_waiters() {
        let signals = Arc::new(PollSignals::default());
        assert_eq!(signals.waiter_count("alice"), 0);

        let w1 = signals.register("alice");
        let w2 = signals.register("alice");
        assert_eq!(signals.waiter_count("alice"), 2);

        drop(w1);
        assert_eq!(signals.waiter_count("alice"), 1);
        drop(w2);
        assert_eq!(signals.waiter_count("alice"), 0);
    }

    #[tokio::test]
    async fn notify_wakes_registered_waiter() {
        let signals = Arc::new(PollSignals::default());
        let waiter = signals.register("alice");

        signals.notify("alice");
        assert!(waiter.wait_for(Duration::from_millis(100)).await);

        // Nothing pending now: the wait should time out.
        assert!(!waiter.wait_for(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn notify_without_waiters_is_a_noop() {
        let signals = Arc::new(PollSignals::default());
        signals.notify("ghost");
        assert_eq!(signals.waiter_count("ghost"), 0);
    }
}
