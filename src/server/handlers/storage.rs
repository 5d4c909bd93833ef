//! Cloud save and trophy storage handlers.
//!
//! Upload quota is accounted as a size delta against the previous file, so
//! replacing a save with a smaller one always succeeds and frees budget.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::Multipart;
use serde::Deserialize;

use crate::server::config::QUOTA_TOTAL;
use crate::server::state::SharedState;
use crate::server::utils::{
    client_ip, err, internal, now_secs, plain, require_npid, update_last_activity, warn,
};
use crate::store::ContentKind;
use crate::vlog;

#[derive(Debug, Default, Deserialize)]
pub struct SaveInfoQuery {
    titleid: Option<String>,
}

pub async fn save_info(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SaveInfoQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "save info request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let title_id = query.titleid.unwrap_or_default();
    if title_id.is_empty() {
        vlog!("Missing TitleID on save info request for NPID {npid}");
        return err("MissingTitleID");
    }

    vlog!("NPID: {npid}, TitleID: {title_id}");

    let savedata_dir = state.store.savedata_dir(&npid, &title_id);
    if !savedata_dir.exists() {
        vlog!("No savedata for NPID {npid} TitleID {title_id}");
        return warn("NoSavedata");
    }

    let Ok(content) = std::fs::read_to_string(savedata_dir.join("savedata.xml")) else {
        vlog!("No savedata info file for NPID {npid} TitleID {title_id}");
        return warn("NoSavedataInfo");
    };

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        content,
    )
        .into_response()
}

pub async fn trophies_info(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "trophies info request") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    vlog!("NPID: {npid} requesting trophies info");

    let Ok(content) = std::fs::read_to_string(state.store.trophies_xml_path(&npid)) else {
        vlog!("No trophies info file for NPID {npid}");
        return warn("NoTrophiesInfo");
    };

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        content,
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
}

/// Validate the `type`/`id` pair shared by download and upload.
fn resolve_content(npid: &str, query: &ContentQuery, verb: &str) -> Result<(ContentKind, String), Response> {
    let kind_str = query.kind.as_deref().unwrap_or("");
    let Some(kind) = ContentKind::parse(kind_str) else {
        vlog!("NPID {npid} try to {verb} with invalid type: {kind_str}");
        return Err(err("InvalidType"));
    };

    let id = query.id.clone().unwrap_or_default();
    if !kind.valid_id(&id) {
        vlog!("NPID {npid} try to {verb} with invalid id: {id}");
        return Err(err("InvalidID"));
    }

    Ok((kind, id))
}

pub async fn download_file(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ContentQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "file download") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let (kind, id) = match resolve_content(&npid, &query, "download") {
        Ok(resolved) => resolved,
        Err(resp) => return resp,
    };

    let msg = format!("NPID: {npid} type: {} id: {id}", kind.dir_name());
    let file_path = state.store.content_path(&npid, kind, &id);

    let Ok(data) = std::fs::read(&file_path) else {
        vlog!("{msg}, File not found: {}", file_path.display());
        return err("FileNotFound");
    };

    vlog!(
        "{msg}\nServing file: {} ({} bytes)",
        file_path.display(),
        data.len()
    );

    update_last_activity(&state, &client_ip(&headers, &addr), &npid).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response()
}

pub async fn upload_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ContentQuery>,
    mut multipart: Multipart,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "file upload") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let (kind, id) = match resolve_content(&npid, &query, "upload") {
        Ok(resolved) => resolved,
        Err(resp) => return resp,
    };

    let msg = format!("NPID: {npid} type: {} id: {id}", kind.dir_name());

    let mut file_data: Option<Vec<u8>> = None;
    let mut xml_content: Option<String> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => match field.bytes().await {
                Ok(bytes) => file_data = Some(bytes.to_vec()),
                Err(_) => break,
            },
            Some("xml") => {
                if let Ok(text) = field.text().await {
                    xml_content = Some(text);
                }
            }
            _ => {}
        }
    }

    let Some(data) = file_data else {
        vlog!("{msg}, missing file on upload attempt");
        return err("MissingFile");
    };

    let new_size = data.len() as u64;
    let file_path = state.store.content_path(&npid, kind, &id);
    let old_size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
    let delta = new_size as i64 - old_size as i64;

    let new_used;
    {
        let _account = state.account_lock.lock().await;
        let mut db = match state.store.load_users() {
            Ok(db) => db,
            Err(e) => return internal(e),
        };
        let Some(user) = db.users.get_mut(&npid) else {
            return err("UserNotFound");
        };

        let used = user.quota_used;
        new_used = used.saturating_add_signed(delta);

        if delta > 0 && new_used > QUOTA_TOTAL {
            vlog!(
                "{msg}, exceeded quota on upload attempt. Used: {used}, New Used: {new_used}, Total: {QUOTA_TOTAL}"
            );
            return err("QuotaExceeded");
        }

        user.quota_used = new_used;
        user.last_activity = now_secs();
        if let Err(e) = state.store.save_users(&db) {
            return internal(e);
        }
    }

    if let Some(parent) = file_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return internal(e);
        }
    }
    if let Err(e) = std::fs::write(&file_path, &data) {
        return internal(e);
    }

    if let Some(xml) = xml_content {
        let xml_path = state.store.content_xml_path(&npid, kind, &id);
        if let Err(e) = std::fs::write(&xml_path, xml) {
            return internal(e);
        }
    }

    vlog!(
        "{msg}\nUploaded file {} ({new_size} bytes), quota: {new_used} / {QUOTA_TOTAL}",
        file_path.display()
    );
    plain(format!("OK:{new_used}:{QUOTA_TOTAL}"))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrophyConfQuery {
    id: Option<String>,
}

/// Whether the shared configuration data for a trophy title is already on the
/// server, keyed by the presence of `TROPCONF.SFM`.
pub async fn check_trophy_conf_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TrophyConfQuery>,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "trophy conf check") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let id = query.id.unwrap_or_default();
    if !ContentKind::Trophy.valid_id(&id) {
        vlog!("NPID {npid} try to check trophy conf with invalid id: {id}");
        return err("InvalidID");
    }

    let present = state.store.trophy_conf_dir(&id).join("TROPCONF.SFM").exists();
    vlog!(
        "Trophy conf check by NPID {npid} for {id}: {}",
        if present { "found" } else { "not found" }
    );
    plain(if present { "OK:Found" } else { "OK:NotFound" })
}

pub async fn upload_trophy_conf_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TrophyConfQuery>,
    mut multipart: Multipart,
) -> Response {
    let _req = state.request_lock.lock().await;

    let npid = match require_npid(&state, &headers, "trophy conf upload") {
        Ok(npid) => npid,
        Err(resp) => return resp,
    };

    let id = query.id.unwrap_or_default();
    if !ContentKind::Trophy.valid_id(&id) {
        vlog!("NPID {npid} try to upload trophy conf with invalid id: {id}");
        return err("InvalidID");
    }

    let mut file_data: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            file_name = field.file_name().map(str::to_string);
            match field.bytes().await {
                Ok(bytes) => file_data = Some(bytes.to_vec()),
                Err(_) => break,
            }
        }
    }

    let Some(data) = file_data else {
        vlog!("Missing file on trophy conf upload for NPID {npid} ({id})");
        return err("MissingFile");
    };
    if data.is_empty() {
        vlog!("Empty file on trophy conf upload for NPID {npid} ({id})");
        return err("EmptyFile");
    }

    // Flatten the client-supplied name; conf data lives directly in the
    // title's directory.
    let name = file_name
        .as_deref()
        .and_then(|n| std::path::Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("TROPCONF.SFM")
        .to_string();

    let conf_dir = state.store.trophy_conf_dir(&id);
    if let Err(e) = std::fs::create_dir_all(&conf_dir) {
        return internal(e);
    }
    if let Err(e) = std::fs::write(conf_dir.join(&name), &data) {
        return internal(e);
    }

    vlog!(
        "Trophy conf uploaded by NPID {npid} for {id}: {name} ({} bytes)",
        data.len()
    );
    plain("OK:FileUploaded")
}
