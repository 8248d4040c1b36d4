//! The identity realm: user database and credential verification.
//!
//! Engines never see passwords at rest. Each SASL mechanism consumes one
//! realm capability; a backend that cannot serve a capability answers
//! [`Lookup::Unsupported`], which the engine turns into a clean mechanism
//! rejection rather than an error.

use crate::{error::RealmError, sasl::Mechanism};

/// Outcome of a realm capability lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    /// The user is unknown (indistinguishable from bad credentials on the
    /// wire).
    NoSuchUser,
    /// The backend cannot serve this capability at all.
    Unsupported,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Credentials stored for SCRAM authentication (RFC 5802/7677).
#[derive(Clone, PartialEq, Eq)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iterations: u32,
    /// `H(ClientKey)`.
    pub stored_key: Vec<u8>,
    /// `HMAC(SaltedPassword, "Server Key")`.
    pub server_key: Vec<u8>,
}

impl std::fmt::Debug for ScramCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramCredentials")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Identity backend consumed by the protocol engines.
///
/// Implementations are shared across connections and must be internally
/// synchronised.
pub trait Realm: Send + Sync {
    /// Verify a plaintext password (LOGIN, USER/PASS, PLAIN).
    fn password_match(&self, user: &str, password: &str) -> Result<bool, RealmError>;

    fn user_exists(&self, user: &str) -> Result<bool, RealmError>;

    /// The hex HMAC-MD5 the named user would produce for `challenge`.
    fn cram_md5_response(&self, user: &str, challenge: &str) -> Result<Lookup<String>, RealmError>;

    /// The hex `H(user:realm:password)` used as HA1 in DIGEST-MD5.
    fn digest_ha1(&self, user: &str, realm: &str) -> Result<Lookup<String>, RealmError>;

    fn scram_credentials(&self, user: &str) -> Result<Lookup<ScramCredentials>, RealmError>;

    /// Resolve a bearer token to a principal name.
    fn validate_bearer_token(&self, token: &str) -> Result<Lookup<String>, RealmError>;

    /// The hex MD5 of `timestamp + password` used by APOP.
    fn apop_response(&self, user: &str, timestamp: &str) -> Result<Lookup<String>, RealmError>;

    fn is_user_in_role(&self, user: &str, role: &str) -> Result<bool, RealmError>;

    /// Mechanisms this realm can serve, advertised in capability lists.
    fn sasl_mechanisms(&self) -> Vec<Mechanism>;
}

/// Role granting quota administration (SETQUOTA, foreign GETQUOTA).
pub const ROLE_ADMIN: &str = "admin";
