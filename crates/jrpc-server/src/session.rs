//! WebSocket session identity, lifecycle states and the authentication gate.

use sha2::{Digest, Sha256};

use crate::config::ServerConfig;

/// Random per-connection identifier, queryable with the `session` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().as_u64_pair().0)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Unauthenticated,
    Authenticated,
    Disconnecting,
    Closed,
}

/// What the read lane must do with a decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGate {
    /// Authenticated session, ordinary command: dispatch it.
    Dispatch,
    /// Unauthenticated session sent `authenticate`: check credentials.
    Authenticate,
    /// A second `authenticate` on an authenticated session.
    AlreadyAuthenticated,
    /// Anything but `authenticate` before authenticating.
    NotAuthenticated,
}

impl AuthGate {
    #[must_use]
    pub fn evaluate(authenticated: bool, is_authenticate: bool) -> Self {
        match (authenticated, is_authenticate) {
            (true, false) => Self::Dispatch,
            (false, true) => Self::Authenticate,
            (true, true) => Self::AlreadyAuthenticated,
            (false, false) => Self::NotAuthenticated,
        }
    }

    /// Whether this outcome ends the session without a reply.
    #[must_use]
    pub fn disconnects(self) -> bool {
        matches!(self, Self::AlreadyAuthenticated | Self::NotAuthenticated)
    }
}

type AuthDigest = [u8; 32];

fn auth_digest(user: &str, pass: &str) -> AuthDigest {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(format!("{user}:{pass}").as_bytes()));
    digest
}

fn digests_match(a: &AuthDigest, b: &AuthDigest) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Admin and limited-user credentials, stored as SHA-256 digests.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    admin: Option<AuthDigest>,
    limited: Option<AuthDigest>,
}

impl Credentials {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let pair = |user: &Option<String>, pass: &Option<String>| match (user, pass) {
            (Some(user), Some(pass)) => Some(auth_digest(user, pass)),
            _ => None,
        };
        Self {
            admin: pair(&config.rpc_user, &config.rpc_pass),
            limited: pair(&config.rpc_limit_user, &config.rpc_limit_pass),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.admin.is_some() || self.limited.is_some()
    }

    /// Check a username and passphrase.
    ///
    /// Returns `Some(is_admin)` on success and `None` on mismatch. With no
    /// credentials configured every attempt succeeds as admin.
    #[must_use]
    pub fn check(&self, user: &str, pass: &str) -> Option<bool> {
        if !self.is_configured() {
            return Some(true);
        }
        let digest = auth_digest(user, pass);
        if self.admin.is_some_and(|admin| digests_match(&admin, &digest)) {
            return Some(true);
        }
        if self.limited.is_some_and(|limited| digests_match(&limited, &digest)) {
            return Some(false);
        }
        None
    }
}
