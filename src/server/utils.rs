//! Shared helpers for the HTTP handlers.

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::auth;
use crate::server::state::AppState;
use crate::vlog;

/// Plain-text 200 response; the status lives in the `OK:`/`ERR:`/`WARN:`
/// prefix, not the HTTP code.
pub fn plain(body: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body.into(),
    )
        .into_response()
}

pub fn err(kind: impl AsRef<str>) -> Response {
    plain(format!("ERR:{}", kind.as_ref()))
}

pub fn warn(kind: &str) -> Response {
    plain(format!("WARN:{kind}"))
}

pub fn json(value: serde_json::Value) -> Response {
    (StatusCode::OK, axum::Json(value)).into_response()
}

/// Failed store access; the condition is logged, the client gets a 500.
pub fn internal(e: impl std::fmt::Display) -> Response {
    vlog!("Internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain")],
        "ERR:Internal".to_string(),
    )
        .into_response()
}

/// Strip ASCII whitespace around an NPID-bearing field.
pub fn trim_npid(npid: &str) -> String {
    npid.trim_matches([' ', '\t', '\n', '\r']).to_string()
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Client address: the CDN-forwarded header wins over the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("CF-Connecting-IP")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Authenticate a request, logging the failure mode against `what`.
pub fn require_npid(state: &AppState, headers: &HeaderMap, what: &str) -> Result<String, Response> {
    let Some(token) = auth::bearer_token(headers) else {
        vlog!("Missing token on request: {what}");
        return Err(err("MissingToken"));
    };
    match state.tokens.npid_for(&token) {
        Some(npid) => Ok(npid),
        None => {
            vlog!("Invalid token on request: {what}");
            Err(err("InvalidToken"))
        }
    }
}

/// Stamp `last_activity` and record the client address for an account.
/// Takes the account lock; callers must not already hold it.
pub async fn update_last_activity(state: &AppState, ip: &str, npid: &str) {
    let _account = state.account_lock.lock().await;
    let Ok(mut db) = state.store.load_users() else {
        return;
    };
    let Some(user) = db.users.get_mut(npid) else {
        return;
    };
    user.last_activity = now_secs();
    user.note_remote_addr(ip);
    let _ = state.store.save_users(&db);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_npid_strips_ascii_whitespace() {
        assert_eq!(trim_npid("  alice \t\r\n"), "alice");
        assert_eq!(trim_npid("alice"), "alice");
        assert_eq!(trim_npid(" a lice "), "a lice");
        assert_eq!(trim_npid("   "), "");
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, &addr), "10.0.0.1");

        headers.insert("CF-Connecting-IP", "203.0.113.9".parse().unwrap());
        assert_eq!(client_ip(&headers, &addr), "203.0.113.9");
    }
}
