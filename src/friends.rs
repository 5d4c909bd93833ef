//! Bilateral friend relations.
//!
//! Every relation between two users is stored twice, once in each user's
//! `friends.json`, and every transition rewrites both files inside the
//! caller's account-lock critical section so the two views stay consistent.
//! The one deliberate asymmetry: a request sent to a user who has blocked the
//! sender is recorded on the sender's side only ("silent" pending).

use crate::events::{EventBus, PollSignals};
use crate::store::{
    BlockEntry, FriendEntry, ReceivedRequest, SentRequest, Store, StoreError, UserDb,
};

#[derive(Debug)]
pub enum FriendError {
    UserNotFound,
    AlreadyFriends,
    RequestAlreadySent,
    NoRequestFound,
    NotFriends,
    CannotAddYourself,
    CannotBlockYourself,
    Store(StoreError),
}

impl std::fmt::Display for FriendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FriendError::Store(e) => write!(f, "store error: {e}"),
            other => write!(f, "{}", other.code()),
        }
    }
}

impl std::error::Error for FriendError {}

impl From<StoreError> for FriendError {
    fn from(e: StoreError) -> Self {
        FriendError::Store(e)
    }
}

impl FriendError {
    /// Wire name surfaced as `ERR:<code>`.
    pub fn code(&self) -> &'static str {
        match self {
            FriendError::UserNotFound => "UserNotFound",
            FriendError::AlreadyFriends => "AlreadyFriends",
            FriendError::RequestAlreadySent => "RequestAlreadySent",
            FriendError::NoRequestFound => "NoRequestFound",
            FriendError::NotFriends => "NotFriends",
            FriendError::CannotAddYourself => "CannotAddYourself",
            FriendError::CannotBlockYourself => "CannotBlockYourself",
            FriendError::Store(_) => "Internal",
        }
    }
}

/// How an `add` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A plain (or silently stored) request is now pending.
    RequestSent,
    /// Crossed requests auto-promoted both sides to friends.
    FriendAdded,
}

/// The requester's relation to a target, as reported by `profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    Itself,
    Friends,
    RequestSent,
    RequestReceived,
    Blocked,
    None,
}

impl Relationship {
    pub fn as_str(self) -> &'static str {
        match self {
            Relationship::Itself => "self",
            Relationship::Friends => "friends",
            Relationship::RequestSent => "request_sent",
            Relationship::RequestReceived => "request_received",
            Relationship::Blocked => "blocked",
            Relationship::None => "none",
        }
    }
}

fn ensure_user(db: &UserDb, npid: &str) -> Result<(), FriendError> {
    if db.users.contains_key(npid) {
        Ok(())
    } else {
        Err(FriendError::UserNotFound)
    }
}

/// `npid` asks to befriend `target`.  Callers hold the account lock.
pub fn add(
    store: &Store,
    events: &EventBus,
    signals: &PollSignals,
    db: &UserDb,
    npid: &str,
    target: &str,
    now: i64,
) -> Result<AddOutcome, FriendError> {
    if npid == target {
        return Err(FriendError::CannotAddYourself);
    }
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if user.is_friend(target) {
        return Err(FriendError::AlreadyFriends);
    }
    if user.has_sent(target) {
        return Err(FriendError::RequestAlreadySent);
    }

    if other.has_blocked(npid) {
        // Silent: the request exists only on the sender's side.  Should the
        // target unblock later, the pending entry is resurrected from here.
        user.friend_requests.sent.push(SentRequest {
            npid: target.to_string(),
            sent_at: now,
        });
        store.save_friends(npid, &user)?;
        return Ok(AddOutcome::RequestSent);
    }

    if user.has_received(target) || other.has_sent(npid) {
        // Crossed requests: promote both sides.
        user.remove_received(target);
        other.remove_sent(npid);
        user.friends.push(FriendEntry {
            npid: target.to_string(),
            since: now,
        });
        other.friends.push(FriendEntry {
            npid: npid.to_string(),
            since: now,
        });
        store.save_friends(npid, &user)?;
        store.save_friends(target, &other)?;
        return Ok(AddOutcome::FriendAdded);
    }

    user.friend_requests.sent.push(SentRequest {
        npid: target.to_string(),
        sent_at: now,
    });
    other.friend_requests.received.push(ReceivedRequest {
        npid: npid.to_string(),
        received_at: now,
    });
    store.save_friends(npid, &user)?;
    store.save_friends(target, &other)?;

    events.push_request(target, npid, now);
    signals.notify(target);

    Ok(AddOutcome::RequestSent)
}

/// `npid` accepts the pending request from `target`.
pub fn accept(
    store: &Store,
    db: &UserDb,
    npid: &str,
    target: &str,
    now: i64,
) -> Result<(), FriendError> {
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if !user.has_received(target) {
        return Err(FriendError::NoRequestFound);
    }

    user.remove_received(target);
    other.remove_sent(npid);
    user.friends.push(FriendEntry {
        npid: target.to_string(),
        since: now,
    });
    other.friends.push(FriendEntry {
        npid: npid.to_string(),
        since: now,
    });

    store.save_friends(npid, &user)?;
    store.save_friends(target, &other)?;
    Ok(())
}

/// `npid` rejects the pending request from `target`.
pub fn reject(store: &Store, db: &UserDb, npid: &str, target: &str) -> Result<(), FriendError> {
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if !user.has_received(target) {
        return Err(FriendError::NoRequestFound);
    }

    user.remove_received(target);
    other.remove_sent(npid);

    store.save_friends(npid, &user)?;
    store.save_friends(target, &other)?;
    Ok(())
}

/// `npid` ends an existing friendship with `target`.
pub fn remove(store: &Store, db: &UserDb, npid: &str, target: &str) -> Result<(), FriendError> {
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if !user.is_friend(target) {
        return Err(FriendError::NotFriends);
    }

    user.remove_friend(target);
    other.remove_friend(npid);

    store.save_friends(npid, &user)?;
    store.save_friends(target, &other)?;
    Ok(())
}

/// `npid` withdraws their own pending request to `target`, including the
/// not-yet-polled inbox event on the target's side.
pub fn cancel(
    store: &Store,
    events: &EventBus,
    db: &UserDb,
    npid: &str,
    target: &str,
) -> Result<(), FriendError> {
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if !user.has_sent(target) {
        return Err(FriendError::NoRequestFound);
    }

    user.remove_sent(target);
    other.remove_received(npid);

    store.save_friends(npid, &user)?;
    store.save_friends(target, &other)?;

    events.remove_request(target, npid);
    Ok(())
}

/// `npid` blocks `target`: any friendship and any requests between the two
/// are cleared, except that an outgoing request from `target` survives on the
/// target's own side (the silent case).
pub fn block(store: &Store, db: &UserDb, npid: &str, target: &str, now: i64) -> Result<(), FriendError> {
    if npid == target {
        return Err(FriendError::CannotBlockYourself);
    }
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let mut other = store.load_friends(target)?;

    if !user.has_blocked(target) {
        user.players_blocked.push(BlockEntry {
            npid: target.to_string(),
            blocked_at: now,
        });
    }

    let were_friends = user.is_friend(target);
    let user_sent = user.has_sent(target);
    let target_sent = other.has_sent(npid);

    if were_friends {
        user.remove_friend(target);
        other.remove_friend(npid);
    }
    if user_sent {
        user.remove_sent(target);
        other.remove_received(npid);
    }
    if target_sent {
        // Only the mirrored entry goes; the target keeps their outgoing
        // request and may be resurrected by a later unblock.
        user.remove_received(target);
    }

    store.save_friends(npid, &user)?;
    if were_friends || user_sent {
        store.save_friends(target, &other)?;
    }
    Ok(())
}

/// `npid` unblocks `target`; a surviving silent request from `target` becomes
/// visible again and the unblocker's poll is woken.
pub fn unblock(
    store: &Store,
    signals: &PollSignals,
    db: &UserDb,
    npid: &str,
    target: &str,
    now: i64,
) -> Result<(), FriendError> {
    ensure_user(db, target)?;

    let mut user = store.load_friends(npid)?;
    let other = store.load_friends(target)?;

    user.remove_blocked(target);

    if other.has_sent(npid) && !user.has_received(target) {
        user.friend_requests.received.push(ReceivedRequest {
            npid: target.to_string(),
            received_at: now,
        });
        signals.notify(npid);
    }

    store.save_friends(npid, &user)?;
    Ok(())
}

/// Classify `npid`'s relation to `target` for the profile endpoint.
pub fn relationship(store: &Store, npid: &str, target: &str) -> Result<Relationship, FriendError> {
    let user = store.load_friends(npid)?;
    Ok(if user.has_blocked(target) {
        Relationship::Blocked
    } else if user.is_friend(target) {
        Relationship::Friends
    } else if user.has_sent(target) {
        Relationship::RequestSent
    } else if user.has_received(target) {
        Relationship::RequestReceived
    } else if npid == target {
        Relationship::Itself
    } else {
        Relationship::None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FriendsFile, UserRecord};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct Fixture {
        store: Store,
        events: EventBus,
        signals: Arc<PollSignals>,
        db: UserDb,
    }

    fn fixture(npids: &[&str]) -> Fixture {
        let pid = std::process::id();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("v3kn-friends-{pid}-{ts}"));
        let store = Store::new(root);
        let events = EventBus::open(store.events_path());

        let mut db = UserDb::default();
        for npid in npids {
            db.users.insert(
                npid.to_string(),
                UserRecord {
                    quota_used: 0,
                    password: String::new(),
                    salt: String::new(),
                    token: format!("token-{npid}"),
                    created_at: 0,
                    last_login: 0,
                    last_activity: 0,
                    remote_addr: Vec::new(),
                },
            );
        }

        Fixture {
            store,
            events,
            signals: Arc::new(PollSignals::default()),
            db,
        }
    }

    fn assert_bilateral(store: &Store, a: &str, b: &str) {
        let fa = store.load_friends(a).unwrap();
        let fb = store.load_friends(b).unwrap();
        assert_eq!(fa.is_friend(b), fb.is_friend(a));
        assert_eq!(fa.has_sent(b), fb.has_received(a));
        assert_eq!(fb.has_sent(a), fa.has_received(b));
    }

    /// The relation sets for an ordered pair are pairwise disjoint.
    fn assert_disjoint(friends: &FriendsFile, other: &str) {
        let states = [
            friends.is_friend(other),
            friends.has_sent(other),
            friends.has_received(other),
        ];
        assert!(states.iter().filter(|s| **s).count() <= 1);
    }

    #[test]
    fn add_then_accept_makes_friends() {
        let fx = fixture(&["alice", "bob"]);
        let outcome = add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 10).unwrap();
        assert_eq!(outcome, AddOutcome::RequestSent);
        assert_bilateral(&fx.store, "alice", "bob");
        // The recipient got an inbox event.
        assert_eq!(fx.events.drain("bob").len(), 1);

        accept(&fx.store, &fx.db, "bob", "alice", 11).unwrap();
        assert_bilateral(&fx.store, "alice", "bob");
        let alice = fx.store.load_friends("alice").unwrap();
        assert!(alice.is_friend("bob"));
        assert!(!alice.has_sent("bob"));
        assert_disjoint(&alice, "bob");
    }

    #[test]
    fn crossed_adds_auto_accept() {
        let fx = fixture(&["alice", "bob"]);
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 10).unwrap();
        let outcome = add(&fx.store, &fx.events, &fx.signals, &fx.db, "bob", "alice", 11).unwrap();
        assert_eq!(outcome, AddOutcome::FriendAdded);

        assert_bilateral(&fx.store, "alice", "bob");
        let alice = fx.store.load_friends("alice").unwrap();
        let bob = fx.store.load_friends("bob").unwrap();
        assert!(alice.is_friend("bob") && bob.is_friend("alice"));
        assert!(alice.friend_requests.sent.is_empty());
        assert!(alice.friend_requests.received.is_empty());
        assert!(bob.friend_requests.sent.is_empty());
        assert!(bob.friend_requests.received.is_empty());
    }

    #[test]
    fn add_precondition_errors() {
        let fx = fixture(&["alice", "bob"]);
        assert!(matches!(
            add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "alice", 1),
            Err(FriendError::CannotAddYourself)
        ));
        assert!(matches!(
            add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "ghost", 1),
            Err(FriendError::UserNotFound)
        ));

        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        assert!(matches!(
            add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 2),
            Err(FriendError::RequestAlreadySent)
        ));

        accept(&fx.store, &fx.db, "bob", "alice", 3).unwrap();
        assert!(matches!(
            add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 4),
            Err(FriendError::AlreadyFriends)
        ));
    }

    #[test]
    fn reject_clears_both_sides() {
        let fx = fixture(&["alice", "bob"]);
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        reject(&fx.store, &fx.db, "bob", "alice").unwrap();

        assert_bilateral(&fx.store, "alice", "bob");
        assert!(!fx.store.load_friends("alice").unwrap().has_sent("bob"));
        assert!(matches!(
            reject(&fx.store, &fx.db, "bob", "alice"),
            Err(FriendError::NoRequestFound)
        ));
    }

    #[test]
    fn cancel_withdraws_request_and_event() {
        let fx = fixture(&["alice", "bob"]);
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        cancel(&fx.store, &fx.events, &fx.db, "alice", "bob").unwrap();

        assert_bilateral(&fx.store, "alice", "bob");
        assert!(!fx.store.load_friends("bob").unwrap().has_received("alice"));
        // The pending inbox event was withdrawn too.
        assert!(fx.events.drain("bob").is_empty());
    }

    #[test]
    fn remove_requires_friendship() {
        let fx = fixture(&["alice", "bob"]);
        assert!(matches!(
            remove(&fx.store, &fx.db, "alice", "bob"),
            Err(FriendError::NotFriends)
        ));

        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        accept(&fx.store, &fx.db, "bob", "alice", 2).unwrap();
        remove(&fx.store, &fx.db, "alice", "bob").unwrap();

        assert_bilateral(&fx.store, "alice", "bob");
        assert!(!fx.store.load_friends("bob").unwrap().is_friend("alice"));
    }

    #[test]
    fn block_clears_friendship_and_requests() {
        let fx = fixture(&["alice", "bob"]);
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        accept(&fx.store, &fx.db, "bob", "alice", 2).unwrap();

        block(&fx.store, &fx.db, "alice", "bob", 3).unwrap();
        let alice = fx.store.load_friends("alice").unwrap();
        let bob = fx.store.load_friends("bob").unwrap();
        assert!(alice.has_blocked("bob"));
        assert!(!alice.is_friend("bob"));
        assert!(!bob.is_friend("alice"));
        assert_disjoint(&alice, "bob");

        assert!(matches!(
            block(&fx.store, &fx.db, "alice", "alice", 4),
            Err(FriendError::CannotBlockYourself)
        ));
    }

    #[test]
    fn add_to_blocker_is_silent() {
        let fx = fixture(&["alice", "bob"]);
        block(&fx.store, &fx.db, "alice", "bob", 1).unwrap();

        let outcome = add(&fx.store, &fx.events, &fx.signals, &fx.db, "bob", "alice", 2).unwrap();
        assert_eq!(outcome, AddOutcome::RequestSent);

        // The request exists only on bob's side and alice saw no event.
        let alice = fx.store.load_friends("alice").unwrap();
        let bob = fx.store.load_friends("bob").unwrap();
        assert!(bob.has_sent("alice"));
        assert!(!alice.has_received("bob"));
        assert!(fx.events.drain("alice").is_empty());
    }

    #[test]
    fn unblock_resurrects_silent_request() {
        let fx = fixture(&["alice", "bob"]);
        block(&fx.store, &fx.db, "alice", "bob", 1).unwrap();
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "bob", "alice", 2).unwrap();

        unblock(&fx.store, &fx.signals, &fx.db, "alice", "bob", 3).unwrap();
        let alice = fx.store.load_friends("alice").unwrap();
        assert!(!alice.has_blocked("bob"));
        assert!(alice.has_received("bob"));
        assert_bilateral(&fx.store, "alice", "bob");

        // And the pair can now complete the handshake.
        accept(&fx.store, &fx.db, "alice", "bob", 4).unwrap();
        assert!(fx.store.load_friends("alice").unwrap().is_friend("bob"));
    }

    #[test]
    fn block_keeps_targets_outgoing_request() {
        let fx = fixture(&["alice", "bob"]);
        add(&fx.store, &fx.events, &fx.signals, &fx.db, "bob", "alice", 1).unwrap();
        block(&fx.store, &fx.db, "alice", "bob", 2).unwrap();

        // bob still believes the request is pending; alice no longer sees it.
        let alice = fx.store.load_friends("alice").unwrap();
        let bob = fx.store.load_friends("bob").unwrap();
        assert!(bob.has_sent("alice"));
        assert!(!alice.has_received("bob"));
        assert!(alice.has_blocked("bob"));
    }

    #[test]
    fn relationship_classification() {
        let fx = fixture(&["alice", "bob", "carol"]);
        assert_eq!(
            relationship(&fx.store, "alice", "alice").unwrap(),
            Relationship::Itself
        );
        assert_eq!(
            relationship(&fx.store, "alice", "carol").unwrap(),
            Relationship::None
        );

        add(&fx.store, &fx.events, &fx.signals, &fx.db, "alice", "bob", 1).unwrap();
        assert_eq!(
            relationship(&fx.store, "alice", "bob").unwrap(),
            Relationship::RequestSent
        );
        assert_eq!(
            relationship(&fx.store, "bob", "alice").unwrap(),
            Relationship::RequestReceived
        );

        accept(&fx.store, &fx.db, "bob", "alice", 2).unwrap();
        assert_eq!(
            relationship(&fx.store, "alice", "bob").unwrap(),
            Relationship::Friends
        );

        block(&fx.store, &fx.db, "alice", "carol", 3).unwrap();
        assert_eq!(
            relationship(&fx.store, "alice", "carol").unwrap(),
            Relationship::Blocked
        );
    }
}
