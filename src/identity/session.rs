use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use base64::Engine;
use parking_lot::RwLock;
use crate::tprintln;

use super::principal::Identity;

pub type SessionToken = String;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "bookmarkd_session";

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub identity: Identity,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
}

/// Grace record for a token replaced by rotation: the replacement it maps to
/// and how long the old token stays resolvable.
#[derive(Debug)]
struct RotatedEntry {
    session: Session,
    expires_at: Instant,
}

fn gen_id() -> String {
    // 256-bit random token, base64url without padding. A token from a failed
    // RNG would be predictable credential material, so abort instead.
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).expect("system rng unavailable");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Session store with TTL and near-expiry rotation. State is instance-scoped
/// (held in the server's shared state) rather than module-static, so two
/// concurrent server instances never share credential material.
pub struct SessionManager {
    pub ttl: Duration,
    /// Remaining-lifetime threshold under which `validate` rotates the session.
    pub refresh_window: Duration,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Old token -> replacement, kept until the old token's natural expiry so
    /// requests racing a rotation with the same cookie still resolve.
    rotated: RwLock<HashMap<String, RotatedEntry>>,
    user_index: RwLock<HashMap<String, HashSet<String>>>,
    /// Token -> original expiry; entries are droppable once that passes.
    revoked: RwLock<HashMap<String, Instant>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            refresh_window: ttl / 4,
            sessions: RwLock::new(HashMap::new()),
            rotated: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashMap::new()),
        }
    }

    pub fn issue(&self, identity: Identity) -> Session {
        let now = Instant::now();
        let sid = gen_id();
        let token = gen_id();
        let sess = Session {
            session_id: sid.clone(),
            token: token.clone(),
            identity: identity.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut m = self.sessions.write();
            m.insert(token.clone(), SessionEntry { session: sess.clone() });
        }
        {
            let mut uidx = self.user_index.write();
            let set = uidx.entry(identity.id.clone()).or_insert_with(HashSet::new);
            set.insert(token.clone());
        }
        tprintln!("session.issue user={} sid={} ttl_secs={}", identity.id, sid, self.ttl.as_secs());
        sess
    }

    /// Validate a token, rotating the session when it is close to expiry.
    /// Returns the identity plus the replacement session when one was issued;
    /// the caller must forward the replacement token to the client as a cookie.
    ///
    /// A token already replaced by rotation keeps resolving until its natural
    /// expiry and maps to the existing replacement without rotating again, so
    /// concurrent requests carrying the same near-expiry cookie (page load
    /// firing `/` and `/ws` together) all pass.
    pub fn validate(&self, token: &str) -> Option<(Identity, Option<Session>)> {
        if self.revoked.read().contains_key(token) { return None; }
        let now = Instant::now();

        {
            let rot = self.rotated.read();
            if let Some(ent) = rot.get(token) {
                if ent.expires_at > now && self.sessions.read().contains_key(&ent.session.token) {
                    return Some((ent.session.identity.clone(), Some(ent.session.clone())));
                }
                // expired grace entry, or the replacement itself is gone
                return None;
            }
        }

        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(ent) = map.get(token) {
                if ent.session.expires_at > now {
                    let near_expiry = ent.session.expires_at.saturating_duration_since(now) < self.refresh_window;
                    Some((ent.session.identity.clone(), near_expiry, ent.session.expires_at))
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else { None }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        let (identity, near_expiry, old_expires_at) = out?;
        if near_expiry {
            // Retire the old token into the grace map and issue a replacement
            {
                let mut s = self.sessions.write();
                s.remove(token);
            }
            {
                let mut idx = self.user_index.write();
                if let Some(set) = idx.get_mut(&identity.id) { set.remove(token); }
            }
            let fresh = self.issue(identity.clone());
            self.rotated.write().insert(
                token.to_string(),
                RotatedEntry { session: fresh.clone(), expires_at: old_expires_at },
            );
            tracing::info!(user = %identity.id, sid = %fresh.session_id, "session rotated");
            return Some((identity, Some(fresh)));
        }
        Some((identity, None))
    }

    pub fn logout(&self, token: &str) -> bool {
        // A grace-period token logs out the session it was rotated into
        let target = self.rotated.write().remove(token).map(|e| e.session.token);
        if let Some(t) = target {
            self.revoked.write().insert(token.to_string(), Instant::now() + self.ttl);
            return self.logout(&t);
        }
        let mut removed = false;
        if let Some(ent) = self.sessions.write().remove(token) {
            removed = true;
            let uid = ent.session.identity.id;
            let mut idx = self.user_index.write();
            if let Some(set) = idx.get_mut(&uid) { set.remove(token); }
            self.revoked.write().insert(token.to_string(), ent.session.expires_at);
        }
        removed
    }

    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = self.user_index.read().get(user_id).cloned() {
            let mut s = self.sessions.write();
            let mut r = self.revoked.write();
            for t in tokens.iter() {
                if let Some(ent) = s.remove(t) {
                    count += 1;
                    r.insert(t.clone(), ent.session.expires_at);
                }
            }
        }
        tprintln!("session.revoke user={} count={}", user_id, count);
        count
    }

    /// Drop expired sessions, finished grace entries and stale revocations.
    /// Run periodically; the maps otherwise only shrink on targeted lookups.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        {
            let mut s = self.sessions.write();
            let mut idx = self.user_index.write();
            s.retain(|tok, ent| {
                let keep = ent.session.expires_at > now;
                if !keep {
                    removed += 1;
                    if let Some(set) = idx.get_mut(&ent.session.identity.id) { set.remove(tok); }
                }
                keep
            });
            idx.retain(|_, set| !set.is_empty());
        }
        {
            let mut rot = self.rotated.write();
            let before = rot.len();
            rot.retain(|_, ent| ent.expires_at > now);
            removed += before - rot.len();
        }
        {
            let mut rv = self.revoked.write();
            let before = rv.len();
            rv.retain(|_, exp| *exp > now);
            removed += before - rv.len();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(id: &str) -> Identity {
        Identity::new(id, "x@example.com")
    }

    /// Manager whose refresh window exceeds the TTL, so every validate rotates.
    fn always_rotating() -> SessionManager {
        let mut sm = SessionManager::new(Duration::from_secs(60));
        sm.refresh_window = Duration::from_secs(120);
        sm
    }

    #[test]
    fn issue_then_validate_returns_identity() {
        let sm = SessionManager::default();
        let sess = sm.issue(ident("u1"));
        let (who, rotated) = sm.validate(&sess.token).expect("valid");
        assert_eq!(who.id, "u1");
        assert!(rotated.is_none(), "fresh session must not rotate");
    }

    #[test]
    fn logout_revokes_token() {
        let sm = SessionManager::default();
        let sess = sm.issue(ident("u1"));
        assert!(sm.logout(&sess.token));
        assert!(sm.validate(&sess.token).is_none());
        // second logout is a no-op
        assert!(!sm.logout(&sess.token));
    }

    #[test]
    fn near_expiry_session_rotates_once() {
        let sm = always_rotating();
        let sess = sm.issue(ident("u1"));
        let (who, rotated) = sm.validate(&sess.token).expect("valid");
        assert_eq!(who.id, "u1");
        let fresh = rotated.expect("rotation expected inside refresh window");
        assert_ne!(fresh.token, sess.token);
        assert!(sm.validate(&fresh.token).is_some());
    }

    #[test]
    fn old_token_keeps_resolving_during_the_grace_window() {
        let sm = always_rotating();
        let sess = sm.issue(ident("u1"));
        let (_, rotated) = sm.validate(&sess.token).expect("first request rotates");
        let fresh = rotated.expect("rotation");

        // A request racing the rotation with the same cookie still passes and
        // is handed the same replacement, not a second rotation.
        let (who, again) = sm.validate(&sess.token).expect("grace token resolves");
        assert_eq!(who.id, "u1");
        assert_eq!(again.expect("replacement cookie").token, fresh.token);
        let (_, third) = sm.validate(&sess.token).expect("still resolving");
        assert_eq!(third.expect("same replacement").token, fresh.token);
    }

    #[test]
    fn logout_via_grace_token_kills_the_replacement() {
        let sm = always_rotating();
        let sess = sm.issue(ident("u1"));
        let fresh = sm.validate(&sess.token).expect("rotates").1.expect("rotation");

        assert!(sm.logout(&sess.token), "old cookie still signs out");
        assert!(sm.validate(&fresh.token).is_none(), "replacement revoked too");
        assert!(sm.validate(&sess.token).is_none());
    }

    #[test]
    fn revoke_user_kills_all_sessions() {
        let sm = SessionManager::default();
        let a = sm.issue(ident("u1"));
        let b = sm.issue(ident("u1"));
        let other = sm.issue(ident("u2"));
        assert_eq!(sm.revoke_user("u1"), 2);
        assert!(sm.validate(&a.token).is_none());
        assert!(sm.validate(&b.token).is_none());
        assert!(sm.validate(&other.token).is_some());
    }

    #[test]
    fn sweep_drops_expired_state() {
        // Zero TTL: everything is expired the moment it exists
        let sm = SessionManager::new(Duration::ZERO);
        sm.issue(ident("u1"));
        let logged_out = sm.issue(ident("u2"));
        sm.logout(&logged_out.token);

        // two expired sessions swept on the first pass (the revocation entry
        // carries the same already-passed expiry)
        assert!(sm.sweep() >= 2);
        assert_eq!(sm.sweep(), 0, "second pass finds nothing left");
    }
}
