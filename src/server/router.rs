//! Axum router construction and the access log.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::server::config::MAX_BODY_SIZE;
use crate::server::handlers;
use crate::server::state::SharedState;
use crate::vlog;

/// Build the complete router with every v3kn route.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/favicon.ico", get(favicon))
        // Account
        .route("/v3kn/check", get(handlers::account::check_connection))
        .route("/v3kn/quota", get(handlers::account::get_quota))
        .route("/v3kn/create", post(handlers::account::create_account))
        .route("/v3kn/delete", post(handlers::account::delete_account))
        .route("/v3kn/login", post(handlers::account::login))
        .route("/v3kn/change_npid", post(handlers::account::change_npid))
        .route(
            "/v3kn/change_password",
            post(handlers::account::change_password),
        )
        .route(
            "/v3kn/avatar",
            post(handlers::account::upload_avatar).get(handlers::account::get_avatar),
        )
        // Storage
        .route("/v3kn/save_info", get(handlers::storage::save_info))
        .route("/v3kn/trophies_info", get(handlers::storage::trophies_info))
        .route("/v3kn/download_file", get(handlers::storage::download_file))
        .route("/v3kn/upload_file", post(handlers::storage::upload_file))
        .route(
            "/v3kn/check_trophy_conf_data",
            get(handlers::storage::check_trophy_conf_data),
        )
        .route(
            "/v3kn/upload_trophy_conf_data",
            post(handlers::storage::upload_trophy_conf_data),
        )
        // Friends
        .route("/v3kn/friends/add", post(handlers::friends::add))
        .route("/v3kn/friends/accept", post(handlers::friends::accept))
        .route("/v3kn/friends/reject", post(handlers::friends::reject))
        .route("/v3kn/friends/remove", post(handlers::friends::remove))
        .route("/v3kn/friends/cancel", post(handlers::friends::cancel))
        .route("/v3kn/friends/block", post(handlers::friends::block))
        .route("/v3kn/friends/unblock", post(handlers::friends::unblock))
        .route("/v3kn/friends/presence", post(handlers::friends::presence))
        .route("/v3kn/friends/list", get(handlers::friends::list))
        .route("/v3kn/friends/profile", get(handlers::friends::profile))
        .route("/v3kn/friends/poll", get(handlers::friends::poll))
        .route("/v3kn/friends/search", get(handlers::friends::search))
        // Messages
        .route("/v3kn/messages/create", post(handlers::messages::create))
        .route("/v3kn/messages/send", post(handlers::messages::send))
        .route("/v3kn/messages/delete", post(handlers::messages::delete))
        .route(
            "/v3kn/messages/add_participant",
            post(handlers::messages::add_participant),
        )
        .route("/v3kn/messages/leave", post(handlers::messages::leave))
        .route(
            "/v3kn/messages/delete_conversation",
            post(handlers::messages::delete_conversation),
        )
        .route(
            "/v3kn/messages/conversations",
            get(handlers::messages::conversations),
        )
        .route("/v3kn/messages/read", get(handlers::messages::read))
        .route("/v3kn/messages/poll", get(handlers::messages::poll))
        .layer(middleware::from_fn(access_log))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

async fn landing_page() -> Html<&'static str> {
    Html(
        r#"<html>
    <head><title>v3kn</title></head>
    <body>
        <h1>v3kn server is running</h1>
        <p>Welcome to the Vita3K Network server!</p>
    </body>
</html>"#,
    )
}

async fn favicon() -> Response {
    match std::fs::read("favicon.ico") {
        Ok(data) => (
            axum::http::StatusCode::OK,
            [(header::CONTENT_TYPE, "image/x-icon")],
            data,
        )
            .into_response(),
        Err(_) => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

/// Log every request except the emulator's own chatter.
async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers();

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !user_agent.contains("Vita3K") {
        let country = headers
            .get("CF-IPCountry")
            .and_then(|v| v.to_str().ok())
            .filter(|c| !c.is_empty())
            .unwrap_or("XX");
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = headers
            .get("CF-Connecting-IP")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_default();
        let port = peer.map(|addr| addr.port()).unwrap_or(0);

        let mut msg = format!("{method} {path} from [{country}] {ip}:{port}");
        if !user_agent.is_empty() {
            msg += &format!("\n  UA: {user_agent}");
        }
        vlog!("{msg}");
    }

    next.run(request).await
}
