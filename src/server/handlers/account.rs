//! Account lifecycle handlers: creation, login, credentials, avatars.

use std::net::SocketAddr;

use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use axum_extra::extract::Multipart;
use serde::Deserialize;

use crate::auth;
use crate::server::config::{MAX_AVATAR_DIM, MAX_AVATAR_SIZE, QUOTA_TOTAL};
use crate::server::state::SharedState;
use crate::server::utils::{
    client_ip, err, internal, now_secs, plain, require_npid, trim_npid, update_last_activity,
};
use crate::store::UserRecord;
use crate::vlog;

fn form_or_default<T: Default>(form: Result<Form<T>, FormRejection>) -> T {
    form.map(|f| f.0).unwrap_or_default()
}

pub async fn check_connection(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "check connection") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    let Some(user) = db.users.get(&npid) else {
        return err("UserNotFound");
    };
    let created_at = user.created_at;
    let used = user.quota_used;

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|ua| !ua.is_empty())
        .unwrap_or("Unknown");
    vlog!("Connection check OK for NPID {npid} from {user_agent}");
    plain(format!("OK:Connected:{created_at}:{used}:{QUOTA_TOTAL}"))
}

pub async fn get_quota(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "quota request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    let Some(user) = db.users.get(&npid) else {
        return err("UserNotFound");
    };
    let used = user.quota_used;

    vlog!("Quota for NPID {npid}: {used} / {QUOTA_TOTAL}");
    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;

    plain(format!("OK:{used}:{QUOTA_TOTAL}"))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    npid: Option<String>,
    password: Option<String>,
}

pub async fn create_account(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    form: Result<Form<CreateParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);

    let npid = trim_npid(params.npid.as_deref().unwrap_or(""));
    if npid.is_empty() || npid.len() < 3 || npid.len() > 16 {
        vlog!("Invalid NPID attempt");
        return err("InvalidNPID");
    }

    let base64_password = params.password.unwrap_or_default();
    if base64_password.is_empty() {
        vlog!("Missing password attempt for NPID {npid}");
        return err("MissingPassword");
    }

    let _account = state.account_lock.lock().await;
    let mut db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    if db.users.contains_key(&npid) {
        vlog!("Account creation attempt for existing NPID {npid}");
        return err("UserExists");
    }

    let salt = auth::generate_salt();
    let token = auth::generate_token();
    let now = now_secs();

    let mut user = UserRecord {
        quota_used: 0,
        password: auth::password_from_submission(&base64_password, &salt),
        salt: auth::encode_salt(&salt),
        token: token.clone(),
        created_at: now,
        last_login: now,
        last_activity: now,
        remote_addr: Vec::new(),
    };
    user.note_remote_addr(&client_ip(&headers, &addr));

    db.users.insert(npid.clone(), user);
    db.tokens.insert(token.clone(), npid.clone());
    if let Err(e) = state.store.save_users(&db) {
        return internal(e);
    }
    state.tokens.insert(&token, &npid);

    if let Err(e) = state.store.create_user_dirs(&npid) {
        return internal(e);
    }

    vlog!("Created account for NPID {npid}");
    plain(format!("OK:{token}"))
}

#[derive(Debug, Default, Deserialize)]
pub struct PasswordParams {
    password: Option<String>,
}

pub async fn delete_account(
    State(state): State<SharedState>,
    headers: HeaderMap,
    form: Result<Form<PasswordParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "account deletion") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let params = form_or_default(form);
    let base64_password = params.password.unwrap_or_default();
    if base64_password.is_empty() {
        vlog!("Missing password on account deletion attempt for NPID {npid}");
        return err("MissingPassword");
    }

    let _account = state.account_lock.lock().await;
    let mut db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    let Some(user) = db.users.get(&npid) else {
        return err("UserNotFound");
    };

    if !auth::verify_password(user, &base64_password) {
        vlog!("Invalid password on account deletion attempt for NPID {npid}");
        return err("InvalidPassword");
    }

    let token = user.token.clone();
    db.tokens.remove(&token);
    db.users.remove(&npid);
    if let Err(e) = state.store.save_users(&db) {
        return internal(e);
    }
    state.tokens.remove(&token);

    if let Err(e) = state.store.remove_user_dir(&npid) {
        return internal(e);
    }

    vlog!("Deleting account for NPID {npid}");
    plain("OK:UserDeleted")
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    npid: Option<String>,
    password: Option<String>,
}

pub async fn login(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    form: Result<Form<LoginParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;
    let params = form_or_default(form);

    let npid = trim_npid(params.npid.as_deref().unwrap_or(""));
    if npid.is_empty() {
        vlog!("Missing NPID on login attempt");
        return err("MissingNPID");
    }

    let base64_password = params.password.unwrap_or_default();
    if base64_password.is_empty() {
        vlog!("Missing password on login attempt for NPID {npid}");
        return err("MissingPassword");
    }

    let _account = state.account_lock.lock().await;
    let mut db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    let Some(user) = db.users.get_mut(&npid) else {
        vlog!("Login attempt for non-existing NPID {npid}");
        return err("UserNotFound");
    };

    if !auth::verify_password(user, &base64_password) {
        vlog!("Invalid password on login attempt for NPID {npid}");
        return err("InvalidPassword");
    }

    let token = user.token.clone();
    let used = user.quota_used;
    let created_at = user.created_at;
    let now = now_secs();
    user.last_login = now;
    user.last_activity = now;
    user.note_remote_addr(&client_ip(&headers, &addr));
    if let Err(e) = state.store.save_users(&db) {
        return internal(e);
    }
    state.tokens.insert(&token, &npid);

    vlog!("User {npid} logged in.");
    plain(format!("OK:{token}:{created_at}:{used}:{QUOTA_TOTAL}"))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeNpidParams {
    new_npid: Option<String>,
}

pub async fn change_npid(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    form: Result<Form<ChangeNpidParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "NPID change") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let params = form_or_default(form);
    let new_npid = trim_npid(params.new_npid.as_deref().unwrap_or(""));
    if new_npid.is_empty() {
        vlog!("Missing new NPID on NPID change attempt for NPID {npid}");
        return err("MissingNPID");
    }

    let _account = state.account_lock.lock().await;
    let mut db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    if db.users.contains_key(&new_npid) {
        vlog!("NPID change attempt to existing NPID {new_npid} by user {npid}");
        return err("UserExists");
    }

    let Some(mut user) = db.users.remove(&npid) else {
        return err("UserNotFound");
    };
    user.last_activity = now_secs();
    user.note_remote_addr(&client_ip(&headers, &addr));

    let token = user.token.clone();
    db.tokens.insert(token.clone(), new_npid.clone());
    db.users.insert(new_npid.clone(), user);
    if let Err(e) = state.store.save_users(&db) {
        return internal(e);
    }
    state.tokens.insert(&token, &new_npid);

    if let Err(e) = state.store.rename_user_dir(&npid, &new_npid) {
        return internal(e);
    }

    vlog!("User {npid} changed NPID to {new_npid}");
    plain("OK:NPIDChanged")
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangePasswordParams {
    old_password: Option<String>,
    new_password: Option<String>,
}

pub async fn change_password(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    form: Result<Form<ChangePasswordParams>, FormRejection>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "password change") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let params = form_or_default(form);
    let base64_old = params.old_password.unwrap_or_default();
    if base64_old.is_empty() {
        vlog!("Missing old password on password change attempt for NPID {npid}");
        return err("MissingOldPassword");
    }
    let base64_new = params.new_password.unwrap_or_default();
    if base64_new.is_empty() {
        vlog!("Missing new password on password change attempt for NPID {npid}");
        return err("MissingNewPassword");
    }
    if base64_old == base64_new {
        vlog!("Same password provided on password change attempt for NPID {npid}");
        return err("SamePassword");
    }

    let _account = state.account_lock.lock().await;
    let mut db = match state.store.load_users() {
        Ok(db) => db,
        Err(e) => return internal(e),
    };
    let Some(user) = db.users.get_mut(&npid) else {
        return err("UserNotFound");
    };

    if !auth::verify_password(user, &base64_old) {
        vlog!("Invalid old password on password change attempt for NPID {npid}");
        return err("InvalidPassword");
    }

    let old_token = user.token.clone();
    let new_salt = auth::generate_salt();
    let new_token = auth::generate_token();

    user.password = auth::password_from_submission(&base64_new, &new_salt);
    user.salt = auth::encode_salt(&new_salt);
    user.token = new_token.clone();
    user.last_activity = now_secs();
    user.note_remote_addr(&client_ip(&headers, &addr));

    db.tokens.remove(&old_token);
    db.tokens.insert(new_token.clone(), npid.clone());
    if let Err(e) = state.store.save_users(&db) {
        return internal(e);
    }
    state.tokens.remove(&old_token);
    state.tokens.insert(&new_token, &npid);

    vlog!("User {npid} changed their password (new token generated).");
    plain(format!("OK:{new_token}"))
}

pub async fn upload_avatar(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "avatar upload") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let mut file_data: Option<Vec<u8>> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            match field.bytes().await {
                Ok(bytes) => file_data = Some(bytes.to_vec()),
                Err(_) => break,
            }
        }
    }

    let Some(data) = file_data else {
        vlog!("Missing file on avatar upload for NPID {npid}");
        return err("MissingFile");
    };
    if data.is_empty() {
        vlog!("Empty file on avatar upload for NPID {npid}");
        return err("EmptyFile");
    }
    if data.len() > MAX_AVATAR_SIZE {
        vlog!("Avatar too large for NPID {npid} ({} bytes)", data.len());
        return err("FileTooLarge");
    }

    const PNG_SIG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    if data.len() < 24 || data[..8] != PNG_SIG {
        vlog!("Invalid PNG file on avatar upload for NPID {npid}");
        return err("InvalidPNG");
    }

    // IHDR width at offset 16, height at offset 20, big-endian.
    let read_be32 = |offset: usize| -> u32 {
        u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    };
    let width = read_be32(16);
    let height = read_be32(20);
    if width > MAX_AVATAR_DIM || height > MAX_AVATAR_DIM {
        vlog!("Avatar dimensions too large for NPID {npid} ({width}x{height})");
        return err("DimensionsTooLarge");
    }

    let avatar_path = state.store.avatar_path(&npid);
    if let Some(parent) = avatar_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return internal(e);
        }
    }
    if let Err(e) = std::fs::write(&avatar_path, &data) {
        return internal(e);
    }

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;
    vlog!("Avatar uploaded for NPID {npid} ({} bytes)", data.len());
    plain("OK:AvatarUploaded")
}

#[derive(Debug, Default, Deserialize)]
pub struct AvatarQuery {
    npid: Option<String>,
}

pub async fn get_avatar(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AvatarQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "avatar download") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let lookup_npid = match query.npid.as_deref() {
        Some(target) if !target.is_empty() => trim_npid(target),
        _ => npid.clone(),
    };

    let avatar_path = state.store.avatar_path(&lookup_npid);
    let Ok(data) = std::fs::read(&avatar_path) else {
        vlog!("Avatar not found for NPID {lookup_npid} requested by NPID {npid}");
        return err("NoAvatar");
    };

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;
    vlog!("Avatar downloaded for NPID {lookup_npid} requested by NPID {npid}");

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        data,
    )
        .into_response()
}
