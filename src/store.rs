//! JSON file persistence for the v3kn data tree.
//!
//! Everything the server persists lives under `<root>/v3kn/`:
//!
//! ```text
//! v3kn/users.json                          user table + token index
//! v3kn/events.json                         friend event journal
//! v3kn/Users/<NPID>/friends.json           per-user friend relations
//! v3kn/Users/<NPID>/conversations.json     per-user conversation index
//! v3kn/Users/<NPID>/Avatar.png
//! v3kn/Users/<NPID>/savedata/<TitleID>/{savedata.psvimg, savedata.xml}
//! v3kn/Users/<NPID>/trophy/<NPWR..>/TROPUSR.DAT
//! v3kn/Users/<NPID>/trophy/trophies.xml
//! v3kn/conversations/<id>/{metadata.json, messages.json}
//! v3kn/Trophies/<NPWR..>/<conf files>
//! ```
//!
//! Files are rewritten whole on every mutation; callers hold the appropriate
//! locks (see `server::state`).  A missing file reads back as its empty value.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// User table
// ---------------------------------------------------------------------------

/// One account in `users.json`, keyed externally by NPID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub quota_used: u64,
    pub password: String,
    pub salt: String,
    pub token: String,
    pub created_at: i64,
    pub last_login: i64,
    pub last_activity: i64,
    /// Client addresses seen for this account, insertion-ordered, no dupes.
    #[serde(default)]
    pub remote_addr: Vec<String>,
}

impl UserRecord {
    /// Record `addr` if this account has not been seen from it before.
    pub fn note_remote_addr(&mut self, addr: &str) {
        if !self.remote_addr.iter().any(|a| a == addr) {
            self.remote_addr.push(addr.to_string());
        }
    }
}

/// The whole persisted user database: accounts plus the token index.
///
/// Invariant: `tokens[user.token] == npid` for every user, and every token
/// entry points at an existing user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDb {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Friend file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendEntry {
    pub npid: String,
    pub since: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentRequest {
    pub npid: String,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedRequest {
    pub npid: String,
    pub received_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub npid: String,
    pub blocked_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FriendRequests {
    #[serde(default)]
    pub sent: Vec<SentRequest>,
    #[serde(default)]
    pub received: Vec<ReceivedRequest>,
}

/// Per-user `friends.json`.  Sections default to empty so a partial or absent
/// file reads back cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FriendsFile {
    #[serde(default)]
    pub friends: Vec<FriendEntry>,
    #[serde(default)]
    pub friend_requests: FriendRequests,
    #[serde(default)]
    pub players_blocked: Vec<BlockEntry>,
}

impl FriendsFile {
    pub fn is_friend(&self, npid: &str) -> bool {
        self.friends.iter().any(|f| f.npid == npid)
    }

    pub fn has_sent(&self, npid: &str) -> bool {
        self.friend_requests.sent.iter().any(|r| r.npid == npid)
    }

    pub fn has_received(&self, npid: &str) -> bool {
        self.friend_requests.received.iter().any(|r| r.npid == npid)
    }

    pub fn has_blocked(&self, npid: &str) -> bool {
        self.players_blocked.iter().any(|b| b.npid == npid)
    }

    pub fn remove_friend(&mut self, npid: &str) {
        self.friends.retain(|f| f.npid != npid);
    }

    pub fn remove_sent(&mut self, npid: &str) {
        self.friend_requests.sent.retain(|r| r.npid != npid);
    }

    pub fn remove_received(&mut self, npid: &str) {
        self.friend_requests.received.retain(|r| r.npid != npid);
    }

    pub fn remove_blocked(&mut self, npid: &str) {
        self.players_blocked.retain(|b| b.npid != npid);
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    pub participants: Vec<String>,
    pub creator: String,
    pub created_at: i64,
}

impl ConversationMeta {
    pub fn has_participant(&self, npid: &str) -> bool {
        self.participants.iter().any(|p| p == npid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub msg: String,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Which kind of per-title content a user uploads or downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Savedata,
    Trophy,
}

impl ContentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "savedata" => Some(ContentKind::Savedata),
            "trophy" => Some(ContentKind::Trophy),
            _ => None,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            ContentKind::Savedata => "savedata",
            ContentKind::Trophy => "trophy",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ContentKind::Savedata => "savedata.psvimg",
            ContentKind::Trophy => "TROPUSR.DAT",
        }
    }

    /// Savedata IDs look like `PCSxxxxxx`, trophy IDs like `NPWRxxxxxxxx`.
    pub fn valid_id(self, id: &str) -> bool {
        match self {
            ContentKind::Savedata => id.starts_with("PCS") && id.len() == 9,
            ContentKind::Trophy => id.starts_with("NPWR") && id.len() == 12,
        }
    }
}

/// Handle on the persisted data tree.  Cloning is cheap; the path is the only
/// state, and locking discipline lives with the caller.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

fn read_json_or<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("v3kn")
    }

    // -- user table ---------------------------------------------------------

    pub fn users_path(&self) -> PathBuf {
        self.data_dir().join("users.json")
    }

    pub fn load_users(&self) -> Result<UserDb, StoreError> {
        read_json_or(&self.users_path())
    }

    pub fn save_users(&self, db: &UserDb) -> Result<(), StoreError> {
        write_json(&self.users_path(), db)
    }

    // -- per-user tree ------------------------------------------------------

    pub fn user_dir(&self, npid: &str) -> PathBuf {
        self.data_dir().join("Users").join(npid)
    }

    /// Lay out the directories a fresh account expects.
    pub fn create_user_dirs(&self, npid: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.user_dir(npid).join("savedata"))?;
        fs::create_dir_all(self.user_dir(npid).join("trophy"))?;
        Ok(())
    }

    pub fn remove_user_dir(&self, npid: &str) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.user_dir(npid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory rename accompanying an NPID re-key.
    pub fn rename_user_dir(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let from = self.user_dir(old);
        if from.exists() {
            fs::rename(from, self.user_dir(new))?;
        }
        Ok(())
    }

    pub fn avatar_path(&self, npid: &str) -> PathBuf {
        self.user_dir(npid).join("Avatar.png")
    }

    // -- friend files -------------------------------------------------------

    pub fn friends_path(&self, npid: &str) -> PathBuf {
        self.user_dir(npid).join("friends.json")
    }

    pub fn load_friends(&self, npid: &str) -> Result<FriendsFile, StoreError> {
        read_json_or(&self.friends_path(npid))
    }

    pub fn save_friends(&self, npid: &str, friends: &FriendsFile) -> Result<(), StoreError> {
        write_json(&self.friends_path(npid), friends)
    }

    // -- event journal ------------------------------------------------------

    pub fn events_path(&self) -> PathBuf {
        self.data_dir().join("events.json")
    }

    // -- conversations ------------------------------------------------------

    pub fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.data_dir().join("conversations").join(conversation_id)
    }

    pub fn load_conversation_meta(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationMeta>, StoreError> {
        let path = self.conversation_dir(conversation_id).join("metadata.json");
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_conversation_meta(&self, meta: &ConversationMeta) -> Result<(), StoreError> {
        write_json(
            &self.conversation_dir(&meta.conversation_id).join("metadata.json"),
            meta,
        )
    }

    pub fn load_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        read_json_or(&self.conversation_dir(conversation_id).join("messages.json"))
    }

    pub fn save_conversation_messages(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        write_json(
            &self.conversation_dir(conversation_id).join("messages.json"),
            &messages,
        )
    }

    pub fn remove_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.conversation_dir(conversation_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -- per-user conversation index ----------------------------------------

    pub fn load_user_conversations(&self, npid: &str) -> Result<Vec<String>, StoreError> {
        read_json_or(&self.user_dir(npid).join("conversations.json"))
    }

    pub fn save_user_conversations(
        &self,
        npid: &str,
        conversations: &[String],
    ) -> Result<(), StoreError> {
        write_json(&self.user_dir(npid).join("conversations.json"), &conversations)
    }

    // -- savedata / trophy content ------------------------------------------

    pub fn content_path(&self, npid: &str, kind: ContentKind, id: &str) -> PathBuf {
        self.user_dir(npid)
            .join(kind.dir_name())
            .join(id)
            .join(kind.file_name())
    }

    /// Side-car XML written on upload: per-title savedata info, or the
    /// user-wide trophies manifest.
    pub fn content_xml_path(&self, npid: &str, kind: ContentKind, id: &str) -> PathBuf {
        match kind {
            ContentKind::Savedata => self
                .user_dir(npid)
                .join("savedata")
                .join(id)
                .join("savedata.xml"),
            ContentKind::Trophy => self.trophies_xml_path(npid),
        }
    }

    pub fn savedata_dir(&self, npid: &str, title_id: &str) -> PathBuf {
        self.user_dir(npid).join("savedata").join(title_id)
    }

    pub fn trophies_xml_path(&self, npid: &str) -> PathBuf {
        self.user_dir(npid).join("trophy").join("trophies.xml")
    }

    /// Shared (not per-user) trophy configuration data for one title.
    pub fn trophy_conf_dir(&self, id: &str) -> PathBuf {
        self.data_dir().join("Trophies").join(id)
    }
}
