//! HTTP surface: the WebSocket upgrade plus health, stats and room listing endpoints

use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use warp::http::{HeaderMap, StatusCode};
use warp::{Filter, Rejection, Reply};

use crate::auth::identity::{ConnectionRequest, Identity, SharedIdentityResolver};
use crate::constants::WS_PATH;
use crate::core::server::SharedServerManager;
use crate::handlers::websocket::handle_ws_client;

/// Rejection raised when the identity collaborator cannot resolve the caller
#[derive(Debug)]
pub struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

/// Point-in-time registry counts
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub rooms: usize,
}

/// Build every route the relay serves
pub fn routes(
    server: SharedServerManager,
    resolver: SharedIdentityResolver,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let max_message_size = server.config().max_message_size;

    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_identity(resolver))
        .and(with_server(server.clone()))
        .map(
            move |ws: warp::ws::Ws, identity: Identity, server: SharedServerManager| {
                info!("New websocket connection for user {}", identity.user_id);
                let tracker = server.tracker().clone();
                ws.max_message_size(max_message_size)
                    .on_upgrade(move |socket| {
                        tracker.track_future(handle_ws_client(socket, server, identity))
                    })
            },
        );

    let health_route = warp::path("health")
        .and(warp::path::end())
        .map(|| "OK");

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(stats);

    let rooms_route = warp::path("rooms")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(list_rooms);

    ws_route
        .or(health_route)
        .or(stats_route)
        .or(rooms_route)
        .recover(handle_rejection)
}

// Helper function to include the server state in a request
fn with_server(
    server: SharedServerManager,
) -> impl Filter<Extract = (SharedServerManager,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Resolve the caller through the identity collaborator before upgrading
fn with_identity(
    resolver: SharedIdentityResolver,
) -> impl Filter<Extract = (Identity,), Error = Rejection> + Clone {
    warp::query::<HashMap<String, String>>()
        .and(warp::header::headers_cloned())
        .and_then(move |query: HashMap<String, String>, headers: HeaderMap| {
            let resolver = resolver.clone();
            async move {
                let request = ConnectionRequest::new(query, headers);
                resolver.resolve(&request).await.map_err(|e| {
                    warn!(
                        "Identity resolution failed ({} resolver): {}",
                        resolver.resolver_name(),
                        e
                    );
                    warp::reject::custom(Unauthorized)
                })
            }
        })
}

async fn stats(server: SharedServerManager) -> Result<impl Reply, Infallible> {
    let response = StatsResponse {
        connections: server.connection_count().await,
        rooms: server.room_count().await,
    };
    Ok(warp::reply::json(&response))
}

async fn list_rooms(server: SharedServerManager) -> Result<impl Reply, Infallible> {
    let rooms = server.rooms().list_rooms().await;
    Ok(warp::reply::json(&rooms))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "unauthorized")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        (StatusCode::BAD_REQUEST, "bad request")
    };
    Ok(warp::reply::with_status(message, status))
}
