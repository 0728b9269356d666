//! Standalone rendezvous server.
//!
//! Rooms register their public addresses here; joiners look them up when
//! LAN discovery fails. Entries idle for two hours are garbage-collected.
//! State is in-memory only — the server is a hint cache, not a directory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Registrations idle longer than this are dropped.
const ROOM_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Garbage-collection cadence.
const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(name = "execp2p-signaling", version)]
struct Cli {
    /// Port to serve on.
    #[arg(long, default_value_t = 8085)]
    port: u16,

    /// Log level (debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire types (mirrors the client's signalling DTOs)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RoomRegistration {
    room_id: String,
    public_addr: String,
    #[serde(default)]
    #[allow(dead_code)]
    is_nated: bool,
    #[serde(default)]
    stun_addr: String,
    #[serde(default)]
    behind_sym_nat: bool,
    #[serde(default)]
    #[allow(dead_code)]
    creation_time: i64,
    #[serde(default)]
    #[allow(dead_code)]
    expiration_time: i64,
}

#[derive(Debug, Clone, Serialize)]
struct RoomInfo {
    room_id: String,
    public_addrs: Vec<String>,
    last_seen: i64,
    behind_sym_nat: bool,
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

type Rooms = Arc<RwLock<HashMap<String, RoomInfo>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));

    tokio::spawn(gc_loop(Arc::clone(&rooms)));

    let app = router(rooms);
    let addr: SocketAddr = ([0, 0, 0, 0], cli.port).into();
    info!(%addr, "signalling server listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(rooms: Rooms) -> Router {
    Router::new()
        .route("/api/register", post(handle_register))
        .route("/api/room/{room_id}", get(handle_get_room))
        .route("/api/rooms", get(handle_list_rooms))
        .layer(middleware::from_fn(cors))
        .with_state(rooms)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_register(
    State(rooms): State<Rooms>,
    Json(registration): Json<RoomRegistration>,
) -> Response {
    if registration.room_id.is_empty() || registration.public_addr.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing required fields").into_response();
    }

    let mut rooms = rooms.write().await;
    let entry = rooms
        .entry(registration.room_id.clone())
        .or_insert_with(|| RoomInfo {
            room_id: registration.room_id.clone(),
            public_addrs: Vec::new(),
            last_seen: unix_now(),
            behind_sym_nat: registration.behind_sym_nat,
        });

    if !entry.public_addrs.contains(&registration.public_addr) {
        entry.public_addrs.push(registration.public_addr.clone());
    }
    // The STUN mapping may differ from the self-reported address; keep both.
    if !registration.stun_addr.is_empty()
        && registration.stun_addr != registration.public_addr
        && !entry.public_addrs.contains(&registration.stun_addr)
    {
        entry.public_addrs.push(registration.stun_addr.clone());
    }
    entry.last_seen = unix_now();

    info!(room = %registration.room_id, addr = %registration.public_addr, "room registered");
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn handle_get_room(
    State(rooms): State<Rooms>,
    Path(room_id): Path<String>,
) -> Response {
    let rooms = rooms.read().await;
    match rooms.get(&room_id) {
        Some(info) => Json(info.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "room not found").into_response(),
    }
}

async fn handle_list_rooms(State(rooms): State<Rooms>) -> Response {
    let rooms = rooms.read().await;
    let list: Vec<RoomInfo> = rooms.values().cloned().collect();
    Json(list).into_response()
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn gc_loop(rooms: Rooms) {
    let mut tick = tokio::time::interval(GC_INTERVAL);
    loop {
        tick.tick().await;
        let cutoff = unix_now() - ROOM_TTL.as_secs() as i64;
        let mut rooms = rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, info| info.last_seen > cutoff);
        let removed = before - rooms.len();
        if removed > 0 {
            warn!(removed, "expired room registrations removed");
        }
    }
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(RwLock::new(HashMap::new())))
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let app = app();

        let body = serde_json::json!({
            "room_id": "ExecP2P_test_room",
            "public_addr": "203.0.113.5:9001",
            "is_nated": true,
            "stun_addr": "203.0.113.5:9002",
            "behind_sym_nat": false,
            "creation_time": 0,
            "expiration_time": 0,
        });
        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/register")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                HttpRequest::get("/api/room/ExecP2P_test_room")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let info: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let addrs = info["public_addrs"].as_array().unwrap();
        // Self-reported and STUN addresses, de-duplicated.
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn unknown_room_is_404() {
        let response = app()
            .oneshot(
                HttpRequest::get("/api/room/ExecP2P_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_headers_present() {
        let response = app()
            .oneshot(
                HttpRequest::get("/api/rooms").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }
}
