//! Credential-exchange and session lifecycle tests across the authority
//! facade: single-use codes, fail-closed lookups and rotation chains.

use std::time::Duration;

use bookmarkd::identity::{Identity, SessionAuthority};

fn ident(id: &str) -> Identity {
    Identity {
        id: id.into(),
        email: format!("{}@example.com", id),
        display_name: Some("Test User".into()),
        avatar_url: None,
    }
}

#[test]
fn full_exchange_flow_resolves_the_identity() {
    let auth = SessionAuthority::default();
    let code = auth.begin_login(ident("u1"));
    let session = auth.exchange_code(&code).expect("exchange succeeds");
    let lookup = auth.get_identity(Some(&session.token));
    let who = lookup.identity.expect("resolved");
    assert_eq!(who.id, "u1");
    assert_eq!(who.email, "u1@example.com");
}

#[test]
fn replayed_code_fails_distinctly_and_mints_no_session() {
    let auth = SessionAuthority::default();
    let code = auth.begin_login(ident("u1"));
    auth.exchange_code(&code).expect("first exchange");

    let err = auth.exchange_code(&code).expect_err("replay must fail");
    assert_eq!(err.code_str(), "code_used", "replay is distinct from an unknown code");

    let err = auth.exchange_code("never-minted").expect_err("unknown code");
    assert_eq!(err.code_str(), "invalid_code");
}

#[test]
fn garbage_token_fails_closed() {
    let auth = SessionAuthority::default();
    assert!(auth.get_identity(Some("not-a-token")).identity.is_none());
}

#[test]
fn rotation_hands_out_one_replacement_per_token() {
    // Every validate rotates: refresh window exceeds the TTL.
    let auth = SessionAuthority::with_refresh_window(Duration::from_secs(60), Duration::from_secs(120));
    let code = auth.begin_login(ident("u1"));
    let token = auth.exchange_code(&code).expect("exchange").token;

    let first = auth.get_identity(Some(&token));
    assert_eq!(first.identity.expect("resolved").id, "u1");
    let fresh = first.refreshed.expect("rotation expected");

    // The old token keeps resolving during its grace window and maps to the
    // same replacement rather than rotating again.
    let again = auth.get_identity(Some(&token));
    assert_eq!(again.identity.expect("resolved").id, "u1");
    assert_eq!(again.refreshed.expect("replacement").token, fresh.token);

    // The replacement rotates on its own schedule.
    let next = auth.get_identity(Some(&fresh.token));
    assert!(next.identity.is_some());
    assert_ne!(next.refreshed.expect("rotation").token, fresh.token);
}

#[test]
fn sign_out_everywhere_revokes_every_session() {
    let auth = SessionAuthority::default();
    let first = auth.exchange_code(&auth.begin_login(ident("u1"))).expect("exchange");
    let second = auth.exchange_code(&auth.begin_login(ident("u1"))).expect("exchange");
    let other = auth.exchange_code(&auth.begin_login(ident("u2"))).expect("exchange");

    assert_eq!(auth.sign_out_everywhere(&first.token), 2);
    assert!(auth.get_identity(Some(&first.token)).identity.is_none());
    assert!(auth.get_identity(Some(&second.token)).identity.is_none());
    assert!(auth.get_identity(Some(&other.token)).identity.is_some(), "other identities untouched");
}

#[test]
fn sign_out_is_effective_and_repeatable() {
    let auth = SessionAuthority::default();
    let code = auth.begin_login(ident("u1"));
    let session = auth.exchange_code(&code).expect("exchange");
    assert!(auth.sign_out(&session.token));
    assert!(!auth.sign_out(&session.token), "second sign-out is a no-op");
    assert!(auth.get_identity(Some(&session.token)).identity.is_none());
}
