//! Conversation lifecycle and message storage.
//!
//! Conversations shard into `conversations/<id>/{metadata.json,
//! messages.json}` and are cross-referenced from each participant's
//! `conversations.json` index.  Pair conversations get the deterministic
//! `a_b` ID; groups get `group_<digest>` so re-creating the same set of
//! people yields a fresh room.

use sha2::{Digest, Sha256};

use crate::store::{ChatMessage, ConversationMeta, Store, StoreError, UserDb};

/// Longest accepted chat message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug)]
pub enum MessageError {
    ConversationNotFound,
    ConversationAlreadyExists,
    NotInConversation,
    AlreadyInConversation,
    NotCreator,
    ParticipantNotFound(String),
    NoMessagesDeleted,
    Store(StoreError),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for MessageError {}

impl From<StoreError> for MessageError {
    fn from(e: StoreError) -> Self {
        MessageError::Store(e)
    }
}

impl MessageError {
    /// Wire name surfaced as `ERR:<code>`.
    pub fn code(&self) -> String {
        match self {
            MessageError::ConversationNotFound => "ConversationNotFound".into(),
            MessageError::ConversationAlreadyExists => "ConversationAlreadyExists".into(),
            MessageError::NotInConversation => "NotInConversation".into(),
            MessageError::AlreadyInConversation => "AlreadyInConversation".into(),
            MessageError::NotCreator => "NotCreator".into(),
            MessageError::ParticipantNotFound(npid) if npid.is_empty() => {
                "ParticipantNotFound".into()
            }
            MessageError::ParticipantNotFound(npid) => format!("ParticipantNotFound:{npid}"),
            MessageError::NoMessagesDeleted => "NoMessagesDeleted".into(),
            MessageError::Store(_) => "Internal".into(),
        }
    }
}

/// Deterministic conversation ID: sorted pair joined with `_`, or
/// `group_<16 hex digits>` over the sorted participants plus the creation
/// timestamp for anything larger.
pub fn conversation_id(participants: &[String], now_ms: i64) -> String {
    let mut sorted: Vec<&str> = participants.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    if sorted.len() == 2 {
        return format!("{}_{}", sorted[0], sorted[1]);
    }

    let mut hasher = Sha256::new();
    for p in &sorted {
        hasher.update(p.as_bytes());
    }
    hasher.update(now_ms.to_string().as_bytes());
    let digest = hasher.finalize();
    let word = u64::from_be_bytes(digest[..8].try_into().unwrap_or_default());
    format!("group_{word:016x}")
}

fn append_to_index(store: &Store, npid: &str, conversation_id: &str) -> Result<(), StoreError> {
    let mut index = store.load_user_conversations(npid)?;
    if !index.iter().any(|id| id == conversation_id) {
        index.push(conversation_id.to_string());
        store.save_user_conversations(npid, &index)?;
    }
    Ok(())
}

fn remove_from_index(store: &Store, npid: &str, conversation_id: &str) -> Result<(), StoreError> {
    let mut index = store.load_user_conversations(npid)?;
    index.retain(|id| id != conversation_id);
    store.save_user_conversations(npid, &index)
}

/// Create a conversation.  `participants` is the cleaned list including the
/// creator first; all must exist.
pub fn create(
    store: &Store,
    db: &UserDb,
    creator: &str,
    participants: &[String],
    first_message: &str,
    now: i64,
    now_ms: i64,
) -> Result<String, MessageError> {
    for p in participants {
        if !db.users.contains_key(p) {
            return Err(MessageError::ParticipantNotFound(p.clone()));
        }
    }

    let id = conversation_id(participants, now_ms);
    if store.load_conversation_meta(&id)?.is_some() {
        return Err(MessageError::ConversationAlreadyExists);
    }

    store.save_conversation_meta(&ConversationMeta {
        conversation_id: id.clone(),
        participants: participants.to_vec(),
        creator: creator.to_string(),
        created_at: now,
    })?;
    store.save_conversation_messages(
        &id,
        &[ChatMessage {
            from: creator.to_string(),
            msg: first_message.to_string(),
            timestamp: now,
        }],
    )?;

    for p in participants {
        append_to_index(store, p, &id)?;
    }

    Ok(id)
}

/// Append one message from a participant.
pub fn send(
    store: &Store,
    npid: &str,
    conversation_id: &str,
    message: &str,
    now: i64,
) -> Result<(), MessageError> {
    let meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if !meta.has_participant(npid) {
        return Err(MessageError::NotInConversation);
    }

    let mut messages = store.load_conversation_messages(conversation_id)?;
    messages.push(ChatMessage {
        from: npid.to_string(),
        msg: message.to_string(),
        timestamp: now,
    });
    store.save_conversation_messages(conversation_id, &messages)?;
    Ok(())
}

/// Delete the requester's own messages by timestamp.  Each timestamp deletes
/// the first matching entry; a `from` mismatch abandons just that timestamp.
/// Returns how many were deleted.
pub fn delete_messages(
    store: &Store,
    npid: &str,
    conversation_id: &str,
    timestamps: &[i64],
) -> Result<usize, MessageError> {
    let meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if !meta.has_participant(npid) {
        return Err(MessageError::NotInConversation);
    }

    let mut messages = store.load_conversation_messages(conversation_id)?;
    let mut deleted = 0;
    for &ts in timestamps {
        if let Some(i) = messages.iter().position(|m| m.timestamp == ts) {
            if messages[i].from != npid {
                continue;
            }
            messages.remove(i);
            deleted += 1;
        }
    }

    if deleted == 0 {
        return Err(MessageError::NoMessagesDeleted);
    }

    store.save_conversation_messages(conversation_id, &messages)?;
    Ok(deleted)
}

/// Bring one more user into an existing conversation.
pub fn add_participant(
    store: &Store,
    db: &UserDb,
    npid: &str,
    conversation_id: &str,
    participant: &str,
) -> Result<(), MessageError> {
    if !db.users.contains_key(participant) {
        return Err(MessageError::ParticipantNotFound(String::new()));
    }

    let mut meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if !meta.has_participant(npid) {
        return Err(MessageError::NotInConversation);
    }
    if meta.has_participant(participant) {
        return Err(MessageError::AlreadyInConversation);
    }

    meta.participants.push(participant.to_string());
    store.save_conversation_meta(&meta)?;
    append_to_index(store, participant, conversation_id)?;
    Ok(())
}

/// Leave a conversation: the member disappears from the metadata and their
/// own index, and the room survives for everyone else.
pub fn leave(store: &Store, npid: &str, conversation_id: &str) -> Result<(), MessageError> {
    let mut meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if !meta.has_participant(npid) {
        return Err(MessageError::NotInConversation);
    }

    meta.participants.retain(|p| p != npid);
    store.save_conversation_meta(&meta)?;
    remove_from_index(store, npid, conversation_id)?;
    Ok(())
}

/// Destroy a conversation; only the creator may.  Every participant's index
/// entry goes with it.
pub fn delete_conversation(
    store: &Store,
    npid: &str,
    conversation_id: &str,
) -> Result<(), MessageError> {
    let meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if meta.creator != npid {
        return Err(MessageError::NotCreator);
    }

    for p in &meta.participants {
        remove_from_index(store, p, conversation_id)?;
    }
    store.remove_conversation(conversation_id)?;
    Ok(())
}

/// Listing entry for the `conversations` endpoint.
pub fn list_conversations(store: &Store, npid: &str) -> Result<Vec<serde_json::Value>, StoreError> {
    let mut out = Vec::new();
    for id in store.load_user_conversations(npid)? {
        let Some(meta) = store.load_conversation_meta(&id)? else {
            continue;
        };
        let messages = store.load_conversation_messages(&id)?;
        let mut entry = serde_json::json!({
            "npid": id,
            "count": messages.len(),
            "creator": meta.creator,
            "participants": meta.participants,
        });
        if let Some(last) = messages.last() {
            entry["last_message"] = serde_json::to_value(last)?;
        }
        out.push(entry);
    }
    Ok(out)
}

/// Full log for a participant.
pub fn read(store: &Store, npid: &str, conversation_id: &str) -> Result<Vec<ChatMessage>, MessageError> {
    let meta = store
        .load_conversation_meta(conversation_id)?
        .ok_or(MessageError::ConversationNotFound)?;
    if !meta.has_participant(npid) {
        return Err(MessageError::NotInConversation);
    }
    Ok(store.load_conversation_messages(conversation_id)?)
}

/// Poll scan: everything received (not sent) after `since` across the user's
/// conversations.
pub fn collect_new(store: &Store, npid: &str, since: i64) -> Result<Vec<ChatMessage>, StoreError> {
    let mut out = Vec::new();
    for id in store.load_user_conversations(npid)? {
        for msg in store.load_conversation_messages(&id)? {
            if msg.timestamp > since && msg.from != npid {
                out.push(msg);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserRecord;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn fixture(npids: &[&str]) -> (Store, UserDb) {
        let pid = std::process::id();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let store = Store::new(std::env::temp_dir().join(format!("v3kn-msg-{pid}-{ts}")));

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
        (store, db)
    }

    fn participants(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pair_ids_are_order_independent() {
        assert_eq!(
            conversation_id(&participants(&["bob", "alice"]), 1),
            "alice_bob"
        );
        assert_eq!(
            conversation_id(&participants(&["alice", "bob"]), 2),
            "alice_bob"
        );
    }

    #[test]
    fn group_ids_depend_on_timestamp() {
        let people = participants(&["alice", "bob", "carol"]);
        let a = conversation_id(&people, 1000);
        let b = conversation_id(&people, 1001);
        assert!(a.starts_with("group_"));
        assert_eq!(a.len(), "group_".len() + 16);
        assert_ne!(a, b);
        // Same inputs, same ID.
        assert_eq!(a, conversation_id(&people, 1000));
    }

    #[test]
    fn create_indexes_every_participant() {
        let (store, db) = fixture(&["alice", "bob", "dave"]);
        let people = participants(&["alice", "bob", "dave"]);
        let id = create(&store, &db, "alice", &people, "hi", 100, 100_000).unwrap();

        for p in ["alice", "bob", "dave"] {
            assert!(store.load_user_conversations(p).unwrap().contains(&id));
        }
        let messages = store.load_conversation_messages(&id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from, "alice");
        assert_eq!(messages[0].msg, "hi");
    }

    #[test]
    fn create_rejects_missing_participant_and_duplicate_room() {
        let (store, db) = fixture(&["alice", "bob"]);
        let err =
            create(&store, &db, "alice", &participants(&["alice", "ghost"]), "hi", 1, 1).unwrap_err();
        assert!(matches!(err, MessageError::ParticipantNotFound(ref p) if p == "ghost"));

        let people = participants(&["alice", "bob"]);
        create(&store, &db, "alice", &people, "hi", 1, 1).unwrap();
        assert!(matches!(
            create(&store, &db, "alice", &people, "again", 2, 2),
            Err(MessageError::ConversationAlreadyExists)
        ));
    }

    #[test]
    fn send_appends_for_participants_only() {
        let (store, db) = fixture(&["alice", "bob", "mallory"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 1, 1).unwrap();

        send(&store, "bob", &id, "hey", 2).unwrap();
        assert_eq!(store.load_conversation_messages(&id).unwrap().len(), 2);

        assert!(matches!(
            send(&store, "mallory", &id, "intruding", 3),
            Err(MessageError::NotInConversation)
        ));
        assert!(matches!(
            send(&store, "alice", "nope", "void", 3),
            Err(MessageError::ConversationNotFound)
        ));
    }

    #[test]
    fn delete_only_own_messages_by_timestamp() {
        let (store, db) = fixture(&["alice", "bob"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 10, 1).unwrap();
        send(&store, "bob", &id, "from bob", 20).unwrap();
        send(&store, "alice", &id, "from alice", 30).unwrap();

        // bob cannot delete alice's message; that timestamp is skipped.
        assert!(matches!(
            delete_messages(&store, "bob", &id, &[30]),
            Err(MessageError::NoMessagesDeleted)
        ));

        let deleted = delete_messages(&store, "alice", &id, &[10, 30, 999]).unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.load_conversation_messages(&id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].from, "bob");
    }

    #[test]
    fn add_participant_updates_meta_and_index() {
        let (store, db) = fixture(&["alice", "bob", "carol"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 1, 1).unwrap();

        add_participant(&store, &db, "alice", &id, "carol").unwrap();
        let meta = store.load_conversation_meta(&id).unwrap().unwrap();
        assert!(meta.has_participant("carol"));
        assert!(store.load_user_conversations("carol").unwrap().contains(&id));

        assert!(matches!(
            add_participant(&store, &db, "alice", &id, "carol"),
            Err(MessageError::AlreadyInConversation)
        ));
        assert!(matches!(
            add_participant(&store, &db, "alice", &id, "ghost"),
            Err(MessageError::ParticipantNotFound(_))
        ));
    }

    #[test]
    fn leave_keeps_room_for_others() {
        let (store, db) = fixture(&["alice", "bob", "carol"]);
        let people = participants(&["alice", "bob", "carol"]);
        let id = create(&store, &db, "alice", &people, "hi", 1, 1).unwrap();

        leave(&store, "bob", &id).unwrap();
        let meta = store.load_conversation_meta(&id).unwrap().unwrap();
        assert!(!meta.has_participant("bob"));
        assert!(meta.has_participant("alice"));
        assert!(!store.load_user_conversations("bob").unwrap().contains(&id));
        assert!(store.load_user_conversations("alice").unwrap().contains(&id));

        assert!(matches!(
            leave(&store, "bob", &id),
            Err(MessageError::NotInConversation)
        ));
    }

    #[test]
    fn delete_conversation_is_creator_only_and_unindexes_all() {
        let (store, db) = fixture(&["alice", "bob"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 1, 1).unwrap();

        assert!(matches!(
            delete_conversation(&store, "bob", &id),
            Err(MessageError::NotCreator)
        ));

        delete_conversation(&store, "alice", &id).unwrap();
        assert!(store.load_conversation_meta(&id).unwrap().is_none());
        assert!(store.load_user_conversations("alice").unwrap().is_empty());
        assert!(store.load_user_conversations("bob").unwrap().is_empty());
    }

    #[test]
    fn listing_carries_counts_and_last_message() {
        let (store, db) = fixture(&["alice", "bob"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 1, 1).unwrap();
        send(&store, "bob", &id, "latest", 2).unwrap();

        let listing = list_conversations(&store, "alice").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0]["npid"], id);
        assert_eq!(listing[0]["count"], 2);
        assert_eq!(listing[0]["creator"], "alice");
        assert_eq!(listing[0]["last_message"]["msg"], "latest");
    }

    #[test]
    fn collect_new_skips_own_and_old_messages() {
        let (store, db) = fixture(&["alice", "bob"]);
        let id = create(&store, &db, "alice", &participants(&["alice", "bob"]), "hi", 10, 1).unwrap();
        send(&store, "bob", &id, "early", 20).unwrap();
        send(&store, "bob", &id, "late", 40).unwrap();
        send(&store, "alice", &id, "own", 50).unwrap();

        let new = collect_new(&store, "alice", 30).unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].msg, "late");

        // For bob, alice's creation message is old, her reply is new.
        let new = collect_new(&store, "bob", 30).unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].from, "alice");
    }
}
