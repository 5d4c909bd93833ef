//! In-memory presence: heartbeats, now-playing, and the timeout sweeper.
//!
//! A user is online exactly while they have a heartbeat entry; going offline
//! (explicitly or by timeout) removes every trace.  The sweeper is the only
//! background task in the process: it sleeps while the table is empty, and
//! otherwise wakes every 30 s to expire silent users and prune week-old
//! status-change records.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::events::EventBus;
use crate::vlog;

/// Heartbeats older than this flip a user to offline.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;
/// Status-change records and inbox events older than this are pruned.
pub const PRUNE_AGE_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Online,
    NotAvailable,
    Offline,
}

impl Status {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Status::Online),
            "not_available" => Some(Status::NotAvailable),
            "offline" => Some(Status::Offline),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::NotAvailable => "not_available",
            Status::Offline => "offline",
        }
    }
}

#[derive(Default)]
struct Tables {
    /// NPID -> last heartbeat time.  Presence in this map *is* being online.
    heartbeat: HashMap<String, i64>,
    now_playing: HashMap<String, String>,
    status: HashMap<String, Status>,
    /// Users whose `not_available` heartbeat arrived while offline; their
    /// next `online` heartbeat still fans out to friends.
    pending_online_poll: HashSet<String>,
    last_status_change: HashMap<String, i64>,
}

/// What one heartbeat changed, for the caller to log and fan out.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatOutcome {
    pub status_changed: bool,
    pub now_playing_changed: bool,
    /// Push a `status_changed(online)` event to every online friend.
    pub fan_out: bool,
}

/// Presence fields attached to friend-list and profile entries.
#[derive(Debug, Clone)]
pub struct PresenceFields {
    pub status: Status,
    pub now_playing: String,
    pub last_activity: Option<i64>,
}

pub struct Presence {
    tables: Mutex<Tables>,
    /// Wakes the sweeper when the first user comes online.
    monitor: Notify,
}

impl Default for Presence {
    fn default() -> Self {
        Presence {
            tables: Mutex::new(Tables::default()),
            monitor: Notify::new(),
        }
    }
}

impl Presence {
    /// Apply one heartbeat.  The fan-out decision and the pending-online flag
    /// are resolved under the table lock.
    pub fn heartbeat(
        &self,
        npid: &str,
        status: Status,
        now_playing: &str,
        now: i64,
    ) -> HeartbeatOutcome {
        let mut t = self.tables.lock().unwrap_or_else(|e| e.into_inner());

        let old_status = t.status.get(npid).copied().unwrap_or(Status::Offline);
        let old_now_playing = t.now_playing.get(npid).cloned().unwrap_or_default();

        match status {
            Status::Online | Status::NotAvailable => {
                let was_empty = t.heartbeat.is_empty();
                t.heartbeat.insert(npid.to_string(), now);
                t.now_playing.insert(npid.to_string(), now_playing.to_string());
                t.status.insert(npid.to_string(), status);

                let status_changed = old_status != status;
                let now_playing_changed =
                    old_status != Status::Offline && old_now_playing != now_playing;

                if status == Status::NotAvailable {
                    if old_status == Status::Offline {
                        t.pending_online_poll.insert(npid.to_string());
                    } else {
                        t.pending_online_poll.remove(npid);
                    }
                }

                if status_changed || now_playing_changed {
                    t.last_status_change.insert(npid.to_string(), now);
                }

                let fan_out = status == Status::Online
                    && status_changed
                    && (old_status == Status::Offline || t.pending_online_poll.contains(npid));
                if status == Status::Online && status_changed {
                    t.pending_online_poll.remove(npid);
                }

                if was_empty {
                    self.monitor.notify_one();
                }

                HeartbeatOutcome {
                    status_changed,
                    now_playing_changed,
                    fan_out,
                }
            }
            Status::Offline => {
                t.heartbeat.remove(npid);
                t.now_playing.remove(npid);
                t.status.remove(npid);
                t.pending_online_poll.remove(npid);

                let status_changed = old_status != Status::Offline;
                if status_changed {
                    t.last_status_change.insert(npid.to_string(), now);
                }

                HeartbeatOutcome {
                    status_changed,
                    now_playing_changed: false,
                    fan_out: false,
                }
            }
        }
    }

    pub fn is_online(&self, npid: &str) -> bool {
        let t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        t.heartbeat.contains_key(npid)
    }

    pub fn is_empty(&self) -> bool {
        let t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        t.heartbeat.is_empty()
    }

    /// Filter `candidates` down to those currently present, in one lock take.
    pub fn online_among<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        candidates
            .into_iter()
            .filter(|npid| t.heartbeat.contains_key(*npid))
            .map(str::to_string)
            .collect()
    }

    /// Presence fields for list/profile enrichment.  `now_playing` is only
    /// reported while the user is present.
    pub fn fields(&self, npid: &str) -> PresenceFields {
        let t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let status = t.status.get(npid).copied().unwrap_or(Status::Offline);
        let now_playing = if status != Status::Offline {
            t.now_playing.get(npid).cloned().unwrap_or_default()
        } else {
            String::new()
        };
        PresenceFields {
            status,
            now_playing,
            last_activity: t.last_status_change.get(npid).copied(),
        }
    }

    /// Expire users whose heartbeat is older than the timeout, returning who
    /// timed out.  Called by the sweeper.
    pub fn expire_stale(&self, now: i64) -> Vec<String> {
        let mut t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let timed_out: Vec<String> = t
            .heartbeat
            .iter()
            .filter(|(_, last)| now - **last > HEARTBEAT_TIMEOUT_SECS)
            .map(|(npid, _)| npid.clone())
            .collect();
        for npid in &timed_out {
            t.heartbeat.remove(npid);
            t.now_playing.remove(npid);
            t.status.remove(npid);
            t.pending_online_poll.remove(npid);
            t.last_status_change.insert(npid.clone(), now);
        }
        timed_out
    }

    /// Drop status-change records older than [`PRUNE_AGE_SECS`].
    pub fn prune_status_changes(&self, now: i64) {
        let mut t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        t.last_status_change
            .retain(|_, at| now - *at <= PRUNE_AGE_SECS);
    }

    fn now_secs() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// Lifetime background task: expire stale heartbeats and prune old records.
///
/// Timeouts do not fan out `status_changed` events; only a user's own online
/// resumption does.  Sweep failures are logged and the loop continues.
pub async fn sweeper_loop(presence: Arc<Presence>, events: Arc<EventBus>) {
    loop {
        while presence.is_empty() {
            presence.monitor.notified().await;
        }

        let _ = tokio::time::timeout(
            Duration::from_secs(HEARTBEAT_TIMEOUT_SECS as u64),
            presence.monitor.notified(),
        )
        .await;

        let now = Presence::now_secs();
        for npid in presence.expire_stale(now) {
            vlog!("User timeout detected: {npid} -> offline");
        }
        presence.prune_status_changes(now);
        events.prune_older_than(now - PRUNE_AGE_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000_000;

    #[test]
    fn first_online_heartbeat_fans_out() {
        let p = Presence::default();
        let outcome = p.heartbeat("alice", Status::Online, "", NOW);
        assert!(outcome.status_changed);
        assert!(outcome.fan_out);
        assert!(p.is_online("alice"));
    }

    #[test]
    fn repeat_online_heartbeat_is_quiet() {
        let p = Presence::default();
        p.heartbeat("alice", Status::Online, "Wipeout", NOW);
        let outcome = p.heartbeat("alice", Status::Online, "Wipeout", NOW + 5);
        assert!(!outcome.status_changed);
        assert!(!outcome.now_playing_changed);
        assert!(!outcome.fan_out);
    }

    #[test]
    fn now_playing_change_is_flagged_without_fanout() {
        let p = Presence::default();
        p.heartbeat("alice", Status::Online, "Wipeout", NOW);
        let outcome = p.heartbeat("alice", Status::Online, "Tearaway", NOW + 5);
        assert!(!outcome.status_changed);
        assert!(outcome.now_playing_changed);
        assert!(!outcome.fan_out);
        assert_eq!(p.fields("alice").now_playing, "Tearaway");
    }

    #[test]
    fn fresh_not_available_defers_fanout_until_online() {
        let p = Presence::default();
        // Fresh not_available from offline: no fan-out yet, but flagged.
        let outcome = p.heartbeat("alice", Status::NotAvailable, "", NOW);
        assert!(outcome.status_changed);
        assert!(!outcome.fan_out);

        // The deferred online transition fans out even though the previous
        // status was not offline.
        let outcome = p.heartbeat("alice", Status::Online, "", NOW + 5);
        assert!(outcome.status_changed);
        assert!(outcome.fan_out);

        // And the flag is cleared: dropping back to NA and online again
        // without an offline gap no longer fans out.
        p.heartbeat("alice", Status::NotAvailable, "", NOW + 10);
        let outcome = p.heartbeat("alice", Status::Online, "", NOW + 15);
        assert!(outcome.status_changed);
        assert!(!outcome.fan_out);
    }

    #[test]
    fn explicit_offline_clears_everything() {
        let p = Presence::default();
        p.heartbeat("alice", Status::Online, "Wipeout", NOW);
        let outcome = p.heartbeat("alice", Status::Offline, "", NOW + 5);
        assert!(outcome.status_changed);
        assert!(!outcome.fan_out);
        assert!(!p.is_online("alice"));
        assert_eq!(p.fields("alice").status, Status::Offline);
        assert_eq!(p.fields("alice").now_playing, "");

        // Offline while already offline changes nothing.
        let outcome = p.heartbeat("alice", Status::Offline, "", NOW + 6);
        assert!(!outcome.status_changed);
    }

    #[test]
    fn expire_stale_drops_only_silent_users() {
        let p = Presence::default();
        p.heartbeat("quiet", Status::Online, "", NOW);
        p.heartbeat("chatty", Status::Online, "", NOW + 40);

        let timed_out = p.expire_stale(NOW + 45);
        assert_eq!(timed_out, vec!["quiet".to_string()]);
        assert!(!p.is_online("quiet"));
        assert!(p.is_online("chatty"));
        // Timeout is recorded as a status change.
        assert_eq!(p.fields("quiet").last_activity, Some(NOW + 45));
    }

    #[test]
    fn timed_out_user_resuming_online_fans_out() {
        let p = Presence::default();
        p.heartbeat("alice", Status::Online, "", NOW);
        p.expire_stale(NOW + 60);
        let outcome = p.heartbeat("alice", Status::Online, "", NOW + 90);
        assert!(outcome.fan_out);
    }

    #[test]
    fn online_among_filters_offline_friends() {
        let p = Presence::default();
        p.heartbeat("bob", Status::Online, "", NOW);
        let online = p.online_among(["bob", "carol"].into_iter());
        assert_eq!(online, vec!["bob".to_string()]);
    }

    #[test]
    fn prune_drops_week_old_status_changes() {
        let p = Presence::default();
        p.heartbeat("alice", Status::Online, "", NOW);
        p.heartbeat("alice", Status::Offline, "", NOW + 1);
        p.prune_status_changes(NOW + 1 + PRUNE_AGE_SECS + 1);
        assert_eq!(p.fields("alice").last_activity, None);
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(Status::parse("online"), Some(Status::Online));
        assert_eq!(Status::parse("not_available"), Some(Status::NotAvailable));
        assert_eq!(Status::parse("offline"), Some(Status::Offline));
        assert_eq!(Status::parse("busy"), None);
    }
}
