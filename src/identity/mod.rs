//! Central identity and session management for the bookmark service.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod exchange;
mod authority;

pub use principal::Identity;
pub use session::{Session, SessionToken, SessionManager, SESSION_COOKIE};
pub use exchange::CodeExchange;
pub use authority::{SessionAuthority, IdentityLookup};
