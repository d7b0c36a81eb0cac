//!
//! bookmarkd HTTP/WS server
//! ------------------------
//! Axum-based HTTP API and WebSocket change-feed endpoint.
//!
//! Responsibilities:
//! - Session-authority gate mounted as middleware on every route.
//! - Code-exchange callback installing the session cookie.
//! - Bookmark insert/delete endpoints delegating to the record store.
//! - WebSocket endpoint streaming the identity's owner-scoped change feed.
//!
//! Page rendering stays client-side; `/` returns the seed payload (identity
//! plus the newest-first bookmark list) that a view hydrates from before its
//! feed subscription attaches.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::feed::ChangeFeed;
use crate::gate::{self, clear_session_cookie, parse_cookie, set_session_cookie};
use crate::identity::{Identity, SessionAuthority, SESSION_COOKIE};
use crate::reconcile::Reconciler;
use crate::store::{BookmarkStore, MemoryStore};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<SessionAuthority>,
    pub store: Arc<MemoryStore>,
    pub feed: ChangeFeed,
}

impl AppState {
    pub fn new(session_ttl: Duration) -> Self {
        let feed = ChangeFeed::new();
        Self {
            authority: Arc::new(SessionAuthority::new(session_ttl)),
            store: Arc::new(MemoryStore::new(feed.clone())),
            feed,
        }
    }
}

/// Build the full router with the gate applied to every route.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/login", get(login_page).post(login_begin))
        .route("/auth/callback", get(auth_callback))
        .route("/logout", post(logout))
        .route("/logout/all", post(logout_all))
        .route("/api/bookmarks", post(insert_bookmark))
        .route("/api/bookmarks/{id}", delete(delete_bookmark))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), gate::middleware))
        .with_state(state)
}

pub async fn run_with_port(http_port: u16, session_ttl: Duration) -> anyhow::Result<()> {
    let state = AppState::new(session_ttl);

    // Background sweeper: expired session state and idle feed channels
    {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            loop {
                let sessions = sweep_state.authority.sweep();
                let channels = sweep_state.feed.prune_idle();
                if sessions + channels > 0 {
                    tracing::debug!(sessions, channels, "sweep");
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    let app = app(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Convenience entry point using the default port and a one-hour session TTL.
pub async fn run() -> anyhow::Result<()> {
    run_with_port(7878, Duration::from_secs(60 * 60)).await
}

fn error_json(e: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "error", "code": e.code_str(), "message": e.message()})))
}

fn redirect_to(location: &str) -> axum::response::Response {
    match HeaderValue::from_str(location) {
        Ok(loc) => (StatusCode::SEE_OTHER, [(header::LOCATION, loc)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Seed payload for an authenticated view: identity plus the newest-first
/// bookmark list the reconciler is later seeded from.
async fn home(State(state): State<AppState>, Extension(identity): Extension<Identity>) -> impl IntoResponse {
    let bookmarks = state.store.list_by_owner(&identity.id);
    Json(json!({"status": "ok", "identity": identity, "bookmarks": bookmarks}))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    #[serde(default)]
    error: Option<String>,
}

/// Login page payload; carries the failure token through so the client can
/// render e.g. `auth_failed` after a bad code exchange.
async fn login_page(Query(q): Query<LoginQuery>) -> impl IntoResponse {
    Json(json!({"status": "login", "error": q.error}))
}

#[derive(Debug, Deserialize)]
struct LoginBeginPayload {
    user_id: String,
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Provider stand-in: mints the one-time code the real OAuth provider would
/// hand the browser, and returns the callback URL to follow. Credential
/// issuance proper (provider negotiation) is outside this service.
async fn login_begin(State(state): State<AppState>, Json(payload): Json<LoginBeginPayload>) -> impl IntoResponse {
    let identity = Identity {
        id: payload.user_id,
        email: payload.email,
        display_name: payload.display_name,
        avatar_url: payload.avatar_url,
    };
    let code = state.authority.begin_login(identity);
    Json(json!({
        "status": "ok",
        "callback": format!("{}?code={}", gate::CALLBACK_PATH, urlencoding::encode(&code))
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
}

/// Exchange the one-time code for a session. Success installs the session
/// cookie and lands on `/` with a clean URL; failure routes back to login
/// with the `auth_failed` token attached. A consumed code is a failure like
/// any other here, so a replayed callback cannot mint a second session.
async fn auth_callback(State(state): State<AppState>, Query(q): Query<CallbackQuery>) -> impl IntoResponse {
    let Some(code) = q.code else {
        return redirect_to(&format!("{}?error=auth_failed", gate::LOGIN_PATH));
    };
    match state.authority.exchange_code(&code) {
        Ok(session) => {
            let mut response = redirect_to(gate::HOME_PATH);
            if let Ok(cookie) = HeaderValue::from_str(&set_session_cookie(&session.token)) {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(e) => {
            error!("code exchange failed: {e}");
            redirect_to(&format!("{}?error=auth_failed", gate::LOGIN_PATH))
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = parse_cookie(&headers, SESSION_COOKIE) {
        state.authority.sign_out(&token);
    }
    let mut response = redirect_to(gate::LOGIN_PATH);
    if let Ok(cookie) = HeaderValue::from_str(&clear_session_cookie()) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Sign out everywhere: revoke every session of the acting identity, the
/// presenting one included, then route to login with the cookie cleared.
async fn logout_all(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = parse_cookie(&headers, SESSION_COOKIE) {
        let revoked = state.authority.sign_out_everywhere(&token);
        info!(revoked, "sign out everywhere");
    }
    let mut response = redirect_to(gate::LOGIN_PATH);
    if let Ok(cookie) = HeaderValue::from_str(&clear_session_cookie()) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

#[derive(Debug, Deserialize)]
struct InsertPayload {
    title: String,
    url: String,
}

/// Validated insert for the acting identity. The reconciler is a per-request
/// scoped handle here, so validation and url normalization match what the
/// view-side handle does.
async fn insert_bookmark(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<InsertPayload>,
) -> impl IntoResponse {
    let handle = Reconciler::new(&identity.id, state.store.clone() as Arc<dyn BookmarkStore>);
    match handle.local_insert(&payload.title, &payload.url) {
        Ok(bookmark) => (StatusCode::OK, Json(json!({"status": "ok", "bookmark": bookmark}))),
        Err(e) => error_json(&e),
    }
}

/// Owner-checked delete. A foreign or missing id reports not-found either
/// way, so the endpoint leaks nothing about other owners' records. Unlike
/// the view-side fire-and-forget delete, the HTTP surface does return the
/// store error to its caller.
async fn delete_bookmark(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.owner_of(id) {
        Some(owner) if owner == identity.id => match state.store.delete(id) {
            Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
            Err(e) => error_json(&e),
        },
        _ => error_json(&AppError::not_found("bookmark_not_found", "no bookmark with that id")),
    }
}

/// Stream the identity's change feed over a WebSocket, one JSON event per
/// message. The subscription is torn down exactly once when the socket ends,
/// whichever side closes first.
async fn ws_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| {
        let mut sub = state.feed.subscribe(&identity.id);
        async move {
            use futures_util::StreamExt;
            loop {
                tokio::select! {
                    event = sub.recv() => {
                        match event {
                            Some(Ok(ev)) => {
                                let payload = match serde_json::to_string(&ev) {
                                    Ok(s) => s,
                                    Err(e) => { error!("feed event serialize failed: {e}"); continue; }
                                };
                                if socket.send(Message::Text(payload.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                // Lag gap: tell the client to refetch, keep streaming
                                let _ = socket.send(Message::Text(
                                    json!({"status": "error", "code": e.code_str(), "message": e.message()})
                                        .to_string()
                                        .into(),
                                )).await;
                            }
                            None => break,
                        }
                    }
                    msg = socket.next() => {
                        match msg {
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                }
            }
            sub.unsubscribe();
        }
    })
}
