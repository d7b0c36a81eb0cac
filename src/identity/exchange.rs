use std::collections::HashMap;
use parking_lot::RwLock;
use uuid::Uuid;
use crate::error::{AppError, AppResult};
use crate::tprintln;

use super::principal::Identity;

enum CodeState {
    Pending(Identity),
    Redeemed,
}

/// One-time authorization codes. The upstream provider hands the browser a
/// code; redeeming it here is the only way to turn it into a session. A code
/// survives exactly one redemption: a replay fails with `code_used`, which is
/// distinct from `invalid_code` so callers never auto-retry a consumed code.
#[derive(Default)]
pub struct CodeExchange {
    codes: RwLock<HashMap<String, CodeState>>,
}

impl CodeExchange {
    pub fn new() -> Self { Self::default() }

    /// Register a pending identity and return the code the browser will carry
    /// back on the callback URL.
    pub fn mint(&self, identity: Identity) -> String {
        let code = Uuid::new_v4().to_string();
        self.codes.write().insert(code.clone(), CodeState::Pending(identity));
        tprintln!("exchange.mint code={}", code);
        code
    }

    /// Redeem a code exactly once.
    pub fn redeem(&self, code: &str) -> AppResult<Identity> {
        let mut map = self.codes.write();
        match map.get_mut(code) {
            Some(slot) => match std::mem::replace(slot, CodeState::Redeemed) {
                CodeState::Pending(identity) => Ok(identity),
                CodeState::Redeemed => Err(AppError::auth(
                    "code_used",
                    "authorization code already redeemed",
                )),
            },
            None => Err(AppError::auth("invalid_code", "unknown authorization code")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeem_is_single_use() {
        let ex = CodeExchange::new();
        let code = ex.mint(Identity::new("u1", "u1@example.com"));
        let who = ex.redeem(&code).expect("first redemption succeeds");
        assert_eq!(who.id, "u1");
        let err = ex.redeem(&code).expect_err("second redemption must fail");
        assert_eq!(err.code_str(), "code_used");
    }

    #[test]
    fn unknown_code_fails_distinctly() {
        let ex = CodeExchange::new();
        let err = ex.redeem("nope").expect_err("unknown code");
        assert_eq!(err.code_str(), "invalid_code");
    }
}
