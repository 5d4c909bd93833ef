//! Conversation and messaging handlers, including the messages long poll.

use std::pin::pin;
use std::time::Instant;

use axum::extract::rejection::FormRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Form;
use serde::Deserialize;

use crate::messaging::{self, MessageError, MAX_MESSAGE_LEN};
use crate::server::config::POLL_BUDGET;
use crate::server::state::SharedState;
use crate::server::utils::{
    err, internal, json, now_millis, now_secs, plain, require_npid, trim_npid,
};
use crate::vlog;

fn message_err(e: MessageError) -> Response {
    match e {
        MessageError::Store(inner) => internal(inner),
        other => err(other.code()),
    }
}

/// JSON request bodies are parsed by hand so a malformed body surfaces as
/// `ERR:InvalidJSON` rather than a framework rejection.
fn parse_json_body(npid: &str, what: &str, body: &str) -> Result<serde_json::Value, Response> {
    match serde_json::from_str(body) {
        Ok(value) => Ok(value),
        Err(_) => {
            vlog!("Invalid JSON in {what} from {npid}");
            Err(err("InvalidJSON"))
        }
    }
}

fn require_conversation_id(
    npid: &str,
    what: &str,
    data: &serde_json::Value,
) -> Result<String, Response> {
    let Some(id) = data.get("conversation_id").and_then(|v| v.as_str()) else {
        vlog!("Missing conversation_id in {what} from {npid}");
        return Err(err("MissingConversationID"));
    };
    Ok(id.to_string())
}

pub async fn create(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "create conversation request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let what = "create conversation request";
    let data = match parse_json_body(&npid, what, &body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };

    let Some(raw_participants) = data.get("participants").and_then(|v| v.as_array()) else {
        vlog!("Missing or invalid participants in {what} from {npid}");
        return err("MissingParticipants");
    };

    let Some(first_message) = data.get("message").and_then(|v| v.as_str()) else {
        vlog!("Missing message in {what} from {npid}");
        return err("MissingMessage");
    };
    if first_message.is_empty() || first_message.len() > MAX_MESSAGE_LEN {
        vlog!("Invalid message in {what} from {npid}");
        return err("InvalidMessage");
    }

    // The creator is always a participant; duplicates and self drop out.
    let mut participants = vec![npid.clone()];
    for raw in raw_participants {
        let Some(value) = raw.as_str() else {
            vlog!("Invalid participant in {what} from {npid}");
            return err("InvalidParticipant");
        };
        let participant = trim_npid(value);
        if !participant.is_empty()
            && participant != npid
            && !participants.contains(&participant)
        {
            participants.push(participant);
        }
    }

    if participants.len() < 2 {
        vlog!("Conversation must have at least 2 participants (from {npid})");
        return err("NotEnoughParticipants");
    }

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match messaging::create(
        &state.store,
        &db,
        &npid,
        &participants,
        first_message,
        now_secs(),
        now_millis(),
    ) {
        Ok(conversation_id) => {
            state.messages_signal.notify_waiters();
            vlog!(
                "Conversation created: {conversation_id} by {npid} with {} participants",
                participants.len()
            );
            plain(format!("OK:{conversation_id}"))
        }
        Err(MessageError::ParticipantNotFound(p)) => {
            vlog!("Create conversation request with non-existing participant {p} by {npid}");
            message_err(MessageError::ParticipantNotFound(p))
        }
        Err(e) => {
            vlog!("Create conversation request failed for {npid}: {e}");
            message_err(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SendParams {
    conversation_id: Option<String>,
    message: Option<String>,
}

pub async fn send(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<SendParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "message send request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let params = form.map(|f| f.0).unwrap_or_default();
    let conversation_id = trim_npid(params.conversation_id.as_deref().unwrap_or(""));
    if conversation_id.is_empty() {
        vlog!("Missing conversation_id on message send request for NPID {npid}");
        return err("MissingConversationID");
    }

    let message = params.message.unwrap_or_default();
    if message.is_empty() {
        vlog!("Missing message on message send request for NPID {npid}");
        return err("MissingMessage");
    }
    if message.len() > MAX_MESSAGE_LEN {
        vlog!("Message too long from {npid} in conversation {conversation_id}");
        return err("MessageTooLong");
    }

    match messaging::send(&state.store, &npid, &conversation_id, &message, now_secs()) {
        Ok(()) => {
            state.messages_signal.notify_waiters();
            vlog!("Message sent from {npid} to conversation {conversation_id}");
            plain("OK:MessageSent")
        }
        Err(e) => {
            vlog!("Message send to conversation {conversation_id} failed for {npid}: {e}");
            message_err(e)
        }
    }
}

pub async fn delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "message delete request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let what = "message delete request";
    let data = match parse_json_body(&npid, what, &body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };

    let conversation_id = match require_conversation_id(&npid, what, &data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(raw_timestamps) = data.get("timestamps").and_then(|v| v.as_array()) else {
        vlog!("Missing or invalid timestamps in {what} from {npid}");
        return err("MissingTimestamps");
    };

    if conversation_id.is_empty() {
        vlog!("Empty conversation_id in {what} from {npid}");
        return err("EmptyConversationID");
    }

    let mut timestamps = Vec::with_capacity(raw_timestamps.len());
    for raw in raw_timestamps {
        let Some(ts) = raw.as_i64() else {
            vlog!("Invalid timestamp in delete request from {npid}");
            return err("InvalidTimestamp");
        };
        timestamps.push(ts);
    }
    if timestamps.is_empty() {
        vlog!("No timestamps provided in delete request from {npid}");
        return err("NoTimestamps");
    }

    match messaging::delete_messages(&state.store, &npid, &conversation_id, &timestamps) {
        Ok(deleted) => {
            state.messages_signal.notify_waiters();
            vlog!(
                "Messages deleted by {npid} in conversation {conversation_id} (count: {deleted})"
            );
            plain(format!("OK:MessagesDeleted:{deleted}"))
        }
        Err(MessageError::NoMessagesDeleted) => {
            vlog!("No messages deleted for {npid} in conversation {conversation_id}");
            err("NoMessagesDeleted")
        }
        Err(e) => {
            vlog!("Message delete request to conversation {conversation_id} failed for {npid}: {e}");
            message_err(e)
        }
    }
}

pub async fn add_participant(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "add participant request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let what = "add participant request";
    let data = match parse_json_body(&npid, what, &body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };

    let conversation_id = match require_conversation_id(&npid, what, &data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(raw_participant) = data.get("participant").and_then(|v| v.as_str()) else {
        vlog!("Missing participant in {what} from {npid}");
        return err("MissingParticipant");
    };
    let participant = trim_npid(raw_participant);
    if participant.is_empty() {
        vlog!("Empty participant in {what} from {npid}");
        return err("EmptyParticipant");
    }

    let _account = state.account_lock.lock().await;
    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };

    match messaging::add_participant(&state.store, &db, &npid, &conversation_id, &participant) {
        Ok(()) => {
            state.messages_signal.notify_waiters();
            vlog!(
                "Participant {participant} added to conversation {conversation_id} by {npid}"
            );
            plain("OK:ParticipantAdded")
        }
        Err(e) => {
            vlog!(
                "Add participant request to conversation {conversation_id} failed for {npid}: {e}"
            );
            message_err(e)
        }
    }
}

pub async fn leave(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "leave conversation request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let what = "leave conversation request";
    let data = match parse_json_body(&npid, what, &body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };

    let conversation_id = match require_conversation_id(&npid, what, &data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match messaging::leave(&state.store, &npid, &conversation_id) {
        Ok(()) => {
            state.messages_signal.notify_waiters();
            vlog!("User {npid} left conversation {conversation_id}");
            plain("OK:LeftConversation")
        }
        Err(e) => {
            vlog!(
                "Leave conversation request to conversation {conversation_id} failed for {npid}: {e}"
            );
            message_err(e)
        }
    }
}

pub async fn delete_conversation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "delete conversation request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let what = "delete conversation request";
    let data = match parse_json_body(&npid, what, &body) {
        Ok(data) => data,
        Err(resp) => return resp,
    };

    let conversation_id = match require_conversation_id(&npid, what, &data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match messaging::delete_conversation(&state.store, &npid, &conversation_id) {
        Ok(()) => {
            state.messages_signal.notify_waiters();
            vlog!("Conversation {conversation_id} deleted by creator {npid}");
            plain("OK:ConversationDeleted")
        }
        Err(e) => {
            vlog!(
                "Delete conversation request to conversation {conversation_id} failed for {npid}: {e}"
            );
            message_err(e)
        }
    }
}

pub async fn conversations(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "conversations list request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    match messaging::list_conversations(&state.store, &npid) {
        Ok(listing) => {
            vlog!(
                "Conversations list requested by {npid} ({} conversations)",
                listing.len()
            );
            json(serde_json::Value::Array(listing))
        }
        Err(e) => internal(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    conversation_id: Option<String>,
}

pub async fn read(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ReadQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "messages read request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let conversation_id = trim_npid(query.conversation_id.as_deref().unwrap_or(""));
    if conversation_id.is_empty() {
        vlog!("Missing conversation_id on messages read request for NPID {npid}");
        return err("MissingConversationID");
    }

    match messaging::read(&state.store, &npid, &conversation_id) {
        Ok(messages) => {
            vlog!(
                "Messages read: {npid} <-> conversation {conversation_id} ({} messages)",
                messages.len()
            );
            match serde_json::to_value(messages) {
                Ok(value) => json(value),
                Err(e) => internal(e),
            }
        }
        Err(e) => {
            vlog!(
                "Messages read request to conversation {conversation_id} failed for {npid}: {e}"
            );
            message_err(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    since: Option<String>,
}

/// Messages long poll: scan for received messages newer than `since`, or park
/// on the messages signal for the rest of the 30 s budget.
/// Never takes the request lock.
pub async fn poll(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Response {
    let npid = match require_npid(&state, &headers, "messages poll request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let since = match query.since.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(since) => since,
            Err(_) => {
                vlog!("Invalid timestamp in poll request from {npid}");
                return err("InvalidTimestamp");
            }
        },
        None => 0,
    };

    let start = Instant::now();

    loop {
        // Register interest before scanning so a send landing between the
        // scan and the wait still wakes this poll.
        let mut notified = pin!(state.messages_signal.notified());
        notified.as_mut().enable();

        let new_messages = match messaging::collect_new(&state.store, &npid, since) {
            Ok(messages) => messages,
            Err(e) => return internal(e),
        };

        if !new_messages.is_empty() {
            vlog!("Poll: {npid} - {} new messages", new_messages.len());
            return match serde_json::to_value(new_messages) {
                Ok(value) => json(value),
                Err(e) => internal(e),
            };
        }

        let elapsed = start.elapsed();
        if elapsed >= POLL_BUDGET {
            return json(serde_json::json!([]));
        }
        let _ = tokio::time::timeout(POLL_BUDGET - elapsed, notified).await;
    }
}
