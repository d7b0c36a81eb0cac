//! Session authority gate.
//!
//! Runs once per inbound request, before any handler. Decides between
//! passing the request through, bouncing an authorization code to the
//! callback path, and redirecting between `/login` and `/`. The decision
//! logic is a plain function over (path, query, cookie) so the redirect
//! matrix is testable without a running server; `middleware` adapts it to
//! axum.
//!
//! Cookie discipline: identity resolution may rotate a near-expiry session.
//! Whatever branch the gate takes, a rotated cookie is copied onto the
//! outgoing response, so a refresh is never lost to a redirect.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::identity::{Identity, SessionAuthority, SESSION_COOKIE};
use crate::server::AppState;

pub const HOME_PATH: &str = "/";
pub const LOGIN_PATH: &str = "/login";
pub const CALLBACK_PATH: &str = "/auth/callback";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    /// Let the request through to its handler.
    Proceed,
    /// 303 to the given location.
    Redirect(String),
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub action: GateAction,
    /// Resolved identity when one exists (attached to request extensions on
    /// pass-through so handlers never re-query the authority).
    pub identity: Option<Identity>,
    /// `Set-Cookie` values to attach to the response on every branch.
    pub set_cookies: Vec<String>,
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

pub fn set_session_cookie(token: &str) -> String {
    format!("{}={}; HttpOnly; Secure; SameSite=Lax; Path=/", SESSION_COOKIE, token)
}

pub fn clear_session_cookie() -> String {
    format!("{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Lax; Path=/", SESSION_COOKIE)
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        let mut it = pair.splitn(2, '=');
        let k = it.next()?;
        if k == name {
            let raw = it.next().unwrap_or("");
            return Some(urlencoding::decode(raw).map(|c| c.into_owned()).unwrap_or_else(|_| raw.to_string()));
        }
    }
    None
}

/// The routing decision for one request.
///
/// 1. A `code` anywhere but the callback path bounces straight to the
///    callback with the code preserved; no session lookup happens, so the
///    one-time code cannot be consumed twice along the way.
/// 2. Otherwise the authority resolves (and possibly rotates) the session.
/// 3. Anonymous outside `/login*` and `/auth*` redirects to `/login` with the
///    query stripped; authenticated on `/login*` redirects home; everything
///    else proceeds.
pub fn decide(
    authority: &SessionAuthority,
    path: &str,
    query: Option<&str>,
    session_token: Option<&str>,
) -> GateDecision {
    if let Some(code) = query_param(query, "code") {
        if path != CALLBACK_PATH {
            return GateDecision {
                action: GateAction::Redirect(format!("{}?code={}", CALLBACK_PATH, urlencoding::encode(&code))),
                identity: None,
                set_cookies: Vec::new(),
            };
        }
    }

    // Resolution failures come back anonymous: fail closed to login.
    let lookup = authority.get_identity(session_token);
    let set_cookies: Vec<String> = lookup
        .refreshed
        .as_ref()
        .map(|s| vec![set_session_cookie(&s.token)])
        .unwrap_or_default();

    let in_login = path.starts_with(LOGIN_PATH);
    let in_auth = path.starts_with("/auth");

    match &lookup.identity {
        None if !in_login && !in_auth => GateDecision {
            action: GateAction::Redirect(LOGIN_PATH.to_string()),
            identity: None,
            set_cookies,
        },
        Some(_) if in_login => GateDecision {
            action: GateAction::Redirect(HOME_PATH.to_string()),
            identity: lookup.identity,
            set_cookies,
        },
        _ => GateDecision { action: GateAction::Proceed, identity: lookup.identity, set_cookies },
    }
}

/// Axum adapter: apply the decision, attach rotated cookies to whichever
/// response goes out, and expose the identity to handlers via extensions.
pub async fn middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let token = parse_cookie(req.headers(), SESSION_COOKIE);

    let decision = decide(&state.authority, &path, query.as_deref(), token.as_deref());

    let mut response = match decision.action {
        GateAction::Redirect(location) => {
            tracing::debug!(%path, %location, "gate redirect");
            match HeaderValue::from_str(&location) {
                Ok(loc) => (StatusCode::SEE_OTHER, [(header::LOCATION, loc)]).into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        GateAction::Proceed => {
            if let Some(identity) = decision.identity.clone() {
                req.extensions_mut().insert(identity);
            }
            next.run(req).await
        }
    };

    for cookie in &decision.set_cookies {
        if let Ok(val) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(header::SET_COOKIE, val);
        }
    }
    response
}
