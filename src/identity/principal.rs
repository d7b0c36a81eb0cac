use serde::{Deserialize, Serialize};

/// Resolved principal behind a session. Read-only once issued; sourced from
/// the session store, never from request input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new<S: Into<String>>(id: S, email: S) -> Self {
        Self { id: id.into(), email: email.into(), display_name: None, avatar_url: None }
    }
}
