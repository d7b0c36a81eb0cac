use std::time::Duration;

use crate::error::AppResult;
use crate::tprintln;

use super::exchange::CodeExchange;
use super::principal::Identity;
use super::session::{Session, SessionManager};

/// Result of a request-time identity lookup. `refreshed` carries a rotated
/// session that the gate must copy onto the outgoing response as a cookie,
/// regardless of which routing branch it takes.
#[derive(Debug, Clone, Default)]
pub struct IdentityLookup {
    pub identity: Option<Identity>,
    pub refreshed: Option<Session>,
}

/// Facade over session validation and code exchange. One instance lives in
/// the server's shared state; the gate consults it once per inbound request.
pub struct SessionAuthority {
    sessions: SessionManager,
    exchange: CodeExchange,
}

impl Default for SessionAuthority {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionAuthority {
    pub fn new(session_ttl: Duration) -> Self {
        Self { sessions: SessionManager::new(session_ttl), exchange: CodeExchange::new() }
    }

    /// Override the rotation window (defaults to a quarter of the TTL).
    pub fn with_refresh_window(session_ttl: Duration, refresh_window: Duration) -> Self {
        let mut sessions = SessionManager::new(session_ttl);
        sessions.refresh_window = refresh_window;
        Self { sessions, exchange: CodeExchange::new() }
    }

    /// Resolve the identity behind a session token. Lookup failures and
    /// stale tokens both come back as an anonymous result: the gate fails
    /// closed to the login redirect either way.
    pub fn get_identity(&self, token: Option<&str>) -> IdentityLookup {
        let Some(token) = token else { return IdentityLookup::default() };
        match self.sessions.validate(token) {
            Some((identity, refreshed)) => IdentityLookup { identity: Some(identity), refreshed },
            None => IdentityLookup::default(),
        }
    }

    /// Redeem a one-time authorization code and install a session for the
    /// identity it was minted for.
    pub fn exchange_code(&self, code: &str) -> AppResult<Session> {
        let identity = self.exchange.redeem(code)?;
        let session = self.sessions.issue(identity.clone());
        tprintln!("auth.exchange user={} sid={}", identity.id, session.session_id);
        Ok(session)
    }

    /// Provider stand-in: mint the code the callback URL will carry.
    pub fn begin_login(&self, identity: Identity) -> String {
        self.exchange.mint(identity)
    }

    pub fn sign_out(&self, token: &str) -> bool {
        self.sessions.logout(token)
    }

    /// Sign out every session of the identity behind `token`, the presenting
    /// one included. Returns how many sessions were revoked.
    pub fn sign_out_everywhere(&self, token: &str) -> usize {
        let Some((identity, _)) = self.sessions.validate(token) else { return 0 };
        self.sessions.revoke_user(&identity.id)
    }

    /// Periodic maintenance: drop expired session, grace and revocation state.
    pub fn sweep(&self) -> usize {
        self.sessions.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_installs_a_validatable_session() {
        let auth = SessionAuthority::default();
        let code = auth.begin_login(Identity::new("u1", "u1@example.com"));
        let session = auth.exchange_code(&code).expect("exchange succeeds");
        let lookup = auth.get_identity(Some(&session.token));
        assert_eq!(lookup.identity.expect("resolved").id, "u1");
    }

    #[test]
    fn sign_out_invalidates_the_session() {
        let auth = SessionAuthority::default();
        let code = auth.begin_login(Identity::new("u1", "u1@example.com"));
        let session = auth.exchange_code(&code).expect("exchange succeeds");
        assert!(auth.sign_out(&session.token));
        assert!(auth.get_identity(Some(&session.token)).identity.is_none());
    }

    #[test]
    fn anonymous_lookup_without_cookie() {
        let auth = SessionAuthority::default();
        let lookup = auth.get_identity(None);
        assert!(lookup.identity.is_none());
        assert!(lookup.refreshed.is_none());
    }
}
