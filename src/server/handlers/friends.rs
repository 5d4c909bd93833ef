//! Friend relation, presence, and social long-poll handlers.

use std::collections::HashSet;
use std::time::Instant;

use axum::extract::rejection::FormRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Form;
use serde::Deserialize;

use crate::events::FriendEvent;
use crate::friends::{self, AddOutcome, FriendError, Relationship};
use crate::presence::Status;
use crate::server::config::POLL_BUDGET;
use crate::server::state::SharedState;
use crate::server::utils::{err, internal, json, now_secs, plain, require_npid, trim_npid};
use crate::trophies;
use crate::vlog;

fn form_or_default<T: Default>(form: Result<Form<T>, FormRejection>) -> T {
    form.map(|f| f.0).unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct TargetParams {
    target_npid: Option<String>,
}

/// Shared prologue for the relation handlers: authenticate and pull a
/// non-empty trimmed target out of the form.
fn require_target(
    state: &SharedState,
    headers: &HeaderMap,
    params: &TargetParams,
    what: &str,
) -> Result<(String, String), Response> {
    let npid = require_npid(state, headers, what)?;
    let target = trim_npid(params.target_npid.as_deref().unwrap_or(""));
    if target.is_empty() {
        vlog!("Missing target_npid on {what} for NPID {npid}");
        return Err(err("MissingTargetNPID"));
    }
    Ok((npid, target))
}

fn friend_err(e: FriendError) -> Response {
    match e {
        FriendError::Store(inner) => internal(inner),
        other => err(other.code()),
    }
}

pub async fn add(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend add request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::add(
        &state.store,
        &state.events,
        &state.poll_signals,
        &db,
        &npid,
        &target,
        now_secs(),
    ) {
        Ok(AddOutcome::FriendAdded) => {
            vlog!("Auto-accepted friend request: {npid} <-> {target}");
            plain("OK:FriendAdded")
        }
        Ok(AddOutcome::RequestSent) => {
            vlog!("Friend request sent from {npid} to {target}");
            plain("OK:RequestSent")
        }
        Err(e) => {
            vlog!("Friend add request failed for {npid} -> {target}: {e}");
            friend_err(e)
        }
    }
}

pub async fn accept(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend accept request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::accept(&state.store, &db, &npid, &target, now_secs()) {
        Ok(()) => {
            vlog!("Friend request accepted: {npid} <-> {target}");
            plain("OK:FriendAdded")
        }
        Err(e) => {
            vlog!("No friend request from {target} to accept by {npid}");
            friend_err(e)
        }
    }
}

pub async fn reject(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend reject request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::reject(&state.store, &db, &npid, &target) {
        Ok(()) => {
            vlog!("Friend request rejected: {target} -> {npid}");
            plain("OK:RequestRejected")
        }
        Err(e) => {
            vlog!("No friend request from {target} to reject by {npid}");
            friend_err(e)
        }
    }
}

pub async fn remove(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend remove request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::remove(&state.store, &db, &npid, &target) {
        Ok(()) => {
            vlog!("Friendship removed: {npid} <-> {target}");
            plain("OK:FriendRemoved")
        }
        Err(e) => {
            vlog!("Friend remove request failed for {npid} -> {target}: {e}");
            friend_err(e)
        }
    }
}

pub async fn cancel(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend cancel request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::cancel(&state.store, &state.events, &db, &npid, &target) {
        Ok(()) => {
            vlog!("Friend request cancelled: {npid} -> {target}");
            plain("OK:RequestCancelled")
        }
        Err(e) => {
            vlog!("No friend request to cancel from {npid} to {target}");
            friend_err(e)
        }
    }
}

pub async fn block(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend block request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::block(&state.store, &db, &npid, &target, now_secs()) {
        Ok(()) => {
            vlog!("Player blocked: {npid} -> {target}");
            plain("OK:PlayerBlocked")
        }
        Err(e) => {
            vlog!("Friend block request failed for {npid} -> {target}: {e}");
            friend_err(e)
        }
    }
}

pub async fn unblock(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<TargetParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);
    let (npid, target) = match require_target(&state, &headers, &params, "friend unblock request") {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match friends::unblock(&state.store, &state.poll_signals, &db, &npid, &target, now_secs()) {
        Ok(()) => {
            vlog!("Player unblocked: {npid} -> {target}");
            plain("OK:PlayerUnblocked")
        }
        Err(e) => {
            vlog!("Friend unblock request failed for {npid} -> {target}: {e}");
            friend_err(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PresenceParams {
    status: Option<String>,
    now_playing: Option<String>,
}

/// Heartbeat RPC.  Deliberately skips the request lock: heartbeats arrive
/// constantly and only touch the presence tables.
pub async fn presence(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<PresenceParams>, FormRejection>,
) -> Response {
    let npid = match require_npid(&state, &headers, "friends presence") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let params = form_or_default(form);
    let status_str = params.status.unwrap_or_default();
    if status_str.is_empty() {
        vlog!("Missing status parameter on presence update for NPID {npid}");
        return err("MissingStatus");
    }
    let Some(status) = Status::parse(&status_str) else {
        return err("InvalidStatus");
    };
    let now_playing = params.now_playing.unwrap_or_default();

    let now = now_secs();
    let outcome = state.presence.heartbeat(&npid, status, &now_playing, now);

    if outcome.status_changed {
        vlog!("Status changed for: {npid} -> {status_str}");
        if outcome.fan_out {
            fan_out_online(&state, &npid, now);
        }
    } else if outcome.now_playing_changed {
        vlog!("Now playing updated for: {npid} -> {now_playing}");
    }

    plain("OK")
}

/// Tell every online friend that `npid` came online.
fn fan_out_online(state: &SharedState, npid: &str, now: i64) {
    let friends = match state.store.load_friends(npid) {
        Ok(file) => file.friends,
        Err(e) => {
            vlog!("Presence fan-out skipped for {npid}: {e}");
            return;
        }
    };

    let online = state
        .presence
        .online_among(friends.iter().map(|f| f.npid.as_str()));
    for friend_npid in online {
        state.events.push_status(&friend_npid, npid, true, now);
        state.poll_signals.notify(&friend_npid);
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    group: Option<String>,
}

pub async fn list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "friends list request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let group = query.group.unwrap_or_default();
    if group.is_empty() {
        return err("MissingGroup");
    }

    let friends_file = match state.store.load_friends(&npid) {
        Ok(file) => file,
        Err(e) => return internal(e),
    };

    let response = match group.as_str() {
        "friends" => {
            let enriched: Vec<serde_json::Value> = friends_file
                .friends
                .iter()
                .map(|f| friend_list_entry(&state, &f.npid, f.since))
                .collect();
            serde_json::json!({
                "friends": enriched,
                "self": friend_list_entry(&state, &npid, 0),
            })
        }
        "friend_requests" => serde_json::json!({
            "friend_requests": friends_file.friend_requests,
        }),
        "players_blocked" => serde_json::json!({
            "players_blocked": friends_file.players_blocked,
        }),
        _ => return err("InvalidGroup"),
    };

    vlog!("Friends list requested by {npid} ({group})");
    json(response)
}

/// One friends-list row: relation data plus live presence and trophy level.
fn friend_list_entry(state: &SharedState, npid: &str, since: i64) -> serde_json::Value {
    let fields = state.presence.fields(npid);
    serde_json::json!({
        "npid": npid,
        "since": since,
        "status": fields.status.as_str(),
        "now_playing": fields.now_playing,
        "trophy_level": trophies::load_summary(&state.store, npid).level,
    })
}

pub async fn profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TargetParams>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "friends profile request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let target = trim_npid(query.target_npid.as_deref().unwrap_or(""));
    if target.is_empty() {
        vlog!("Missing target_npid on friend profile request for NPID {npid}");
        return err("MissingTargetNPID");
    }

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    if !db.users.contains_key(&target) {
        vlog!("Friend profile request to non-existing NPID {target} by {npid}");
        return err("UserNotFound");
    }

    let relationship = match friends::relationship(&state.store, &npid, &target) {
        Ok(rel) => rel,
        Err(FriendError::Store(e)) => return internal(e),
        Err(e) => return err(e.code()),
    };

    let mut response = serde_json::json!({
        "npid": target,
        "relationship": relationship.as_str(),
        "friends": [],
        "trophies": trophies::load_summary(&state.store, &target),
    });

    if matches!(relationship, Relationship::Friends | Relationship::Itself) {
        let target_friends = match state.store.load_friends(&target) {
            Ok(file) => file.friends,
            Err(e) => return internal(e),
        };
        response["friends"] = match serde_json::to_value(target_friends) {
            Ok(value) => value,
            Err(e) => return internal(e),
        };
        let fields = state.presence.fields(&target);
        response["status"] = serde_json::json!(fields.status.as_str());
        response["now_playing"] = serde_json::json!(fields.now_playing);
    }

    vlog!(
        "Friend profile requested by {npid} for {target} -> {}",
        relationship.as_str()
    );
    json(response)
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    since: Option<String>,
}

/// Friends long poll: drain the caller's inbox, fold status changes, and
/// park on the per-NPID signal for the rest of the 30 s budget.
/// Never takes the request lock.
pub async fn poll(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Response {
    let npid = match require_npid(&state, &headers, "friends poll request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    // `since` is advisory; the inbox drains on read.  It still has to parse.
    if let Some(since) = query.since.as_deref().filter(|s| !s.is_empty()) {
        if since.parse::<i64>().is_err() {
            vlog!("Invalid timestamp in poll request from {npid}");
            return err("InvalidTimestamp");
        }
    }

    let waiter = state.poll_signals.register(&npid);
    let start = Instant::now();

    loop {
        let events = state.events.drain(&npid);

        let mut friend_status = Vec::new();
        let mut remaining = Vec::new();
        let mut seen_senders: HashSet<String> = HashSet::new();
        for event in events {
            match event {
                FriendEvent::StatusChanged { npid, status, .. } => {
                    friend_status.push(serde_json::json!({"npid": npid, "status": status}));
                }
                FriendEvent::FriendsRequestReceived { ref npid, .. } => {
                    // At most one request event per sender per drain.
                    if seen_senders.insert(npid.clone()) {
                        remaining.push(event);
                    }
                }
            }
        }

        if !friend_status.is_empty() || !remaining.is_empty() {
            let mut details = Vec::new();
            if !remaining.is_empty() {
                details.push(format!("{} event(s)", remaining.len()));
            }
            if !friend_status.is_empty() {
                details.push(format!("{} status change(s)", friend_status.len()));
            }
            vlog!("Poll: {npid} - {}", details.join(", "));

            let mut changes = serde_json::json!({ "friend_status": friend_status });
            if !remaining.is_empty() {
                changes["events"] = match serde_json::to_value(remaining) {
                    Ok(value) => value,
                    Err(e) => return internal(e),
                };
            }
            return json(changes);
        }

        let elapsed = start.elapsed();
        if elapsed >= POLL_BUDGET {
            return json(serde_json::json!({}));
        }
        waiter.wait_for(POLL_BUDGET - elapsed).await;
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    query: Option<String>,
}

pub async fn search(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<SearchQuery>,
) -> Response {
    let npid = match require_npid(&state, &headers, "friends search") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let query = params.query.unwrap_or_default();
    if query.len() < 3 {
        return err("QueryTooShort");
    }
    let query_lower = query.to_lowercase();

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    let results: Vec<serde_json::Value> = db
        .users
        .keys()
        .filter(|user_npid| *user_npid != &npid)
        .filter(|user_npid| user_npid.to_lowercase().contains(&query_lower))
        .map(|user_npid| serde_json::json!({"npid": user_npid}))
        .collect();

    vlog!(
        "Friend search by {npid} for '{query}' -> {} result(s)",
        results.len()
    );
    json(serde_json::Value::Array(results))
}
