//! Auth Gateway (component J): validates user credentials (cookie session,
//! basic, bearer), OAuth2 confidential-client credentials, and site
//! credentials (uuid/secret) against the Directory.
//!
//! Password and site-secret hashes are Argon2id; its verifier is already
//! constant-time with respect to the supplied secret, so "constant-time
//! compare" for those two paths means "use Argon2's verifier, never a
//! manual byte comparison of a recomputed hash". OAuth2 client secrets are
//! stored as a SHA-256 digest and compared with `subtle::ConstantTimeEq`,
//! since that genuinely is a fixed-value comparison rather than a salted
//! password-hash verification.

use std::sync::Arc;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::instrument;

use crate::directory::{BearerToken, Directory, OAuthClient, Site, User};
use crate::errors::AuthError;

/// External collaborator backing cookie sessions: the sign-in page (out of
/// core, §1) writes a session record here when a user logs in. This crate
/// only ever reads it, to validate a cookie already presented by a client —
/// it never creates a session itself.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_user_id(&self, session_id: &str) -> Result<Option<i64>, AuthError>;
}

/// Stand-in for the real session store until the sign-in page's backing
/// store is wired up: every session lookup misses, so cookie auth always
/// falls through to Basic/Bearer without itself failing the request.
pub struct EmptySessionStore;

#[async_trait]
impl SessionStore for EmptySessionStore {
    async fn find_user_id(&self, _session_id: &str) -> Result<Option<i64>, AuthError> {
        Ok(None)
    }
}

pub struct InMemorySessionStore {
    sessions: parking_lot::RwLock<std::collections::HashMap<String, i64>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self {
            sessions: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: impl Into<String>, user_id: i64) {
        self.sessions.write().insert(session_id.into(), user_id);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn find_user_id(&self, session_id: &str) -> Result<Option<i64>, AuthError> {
        Ok(self.sessions.read().get(session_id).copied())
    }
}

pub struct AuthGateway {
    directory: Arc<dyn Directory>,
    sessions: Arc<dyn SessionStore>,
}

impl AuthGateway {
    pub fn new(directory: Arc<dyn Directory>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { directory, sessions }
    }

    /// Validates an existing session cookie's id against the session store
    /// and loads the user it names. Issuing the cookie is the sign-in
    /// page's job (out of core, §1); this only ever reads one back.
    #[instrument(skip(self, session_id))]
    pub async fn authenticate_cookie(&self, session_id: &str) -> Result<User, AuthError> {
        let user_id = self
            .sessions
            .find_user_id(session_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let user = self
            .directory
            .find_user(user_id)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !user.active {
            return Err(AuthError::Inactive);
        }
        Ok(user)
    }

    /// Local/Basic auth. Failures are indistinguishable to the caller —
    /// "unknown user or incorrect password" regardless of which check
    /// failed, so this never reveals whether a username exists.
    #[instrument(skip(self, password))]
    pub async fn authenticate_basic(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let lowered = username.to_lowercase();
        let user = self
            .directory
            .find_user_by_username(&lowered)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;

        let Some(hash) = &user.password_hash else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_argon2(hash, password) {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.active {
            return Err(AuthError::Inactive);
        }
        Ok(user)
    }

    #[instrument(skip(self, token))]
    pub async fn authenticate_bearer(&self, token: &str) -> Result<(User, Vec<String>), AuthError> {
        let bearer: BearerToken = self
            .directory
            .find_user_by_bearer_token(token)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;
        let user = self
            .directory
            .find_user(bearer.user_id)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !user.active {
            return Err(AuthError::Inactive);
        }
        Ok((user, bearer.scopes))
    }

    /// Confidential-client credential check. Called from
    /// `dispatch::authenticate()`'s Basic-auth step as the fallback when the
    /// decoded `identifier:secret` pair doesn't match a known user — the
    /// same header doubles as `client_id:client_secret` for OAuth2 clients
    /// acting on their own account's behalf, rather than this validator
    /// requiring a dedicated token-issuance endpoint this crate doesn't own.
    #[instrument(skip(self, secret))]
    pub async fn authenticate_oauth_client(
        &self,
        client_id: &str,
        secret: &str,
    ) -> Result<OAuthClient, AuthError> {
        let client = self
            .directory
            .find_oauth_client(client_id)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !sha256_hex_eq(secret, &client.secret_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        if !client.active {
            return Err(AuthError::Inactive);
        }
        Ok(client)
    }

    /// Site handshake credential check (used by `TunnelSession`'s
    /// AUTHENTICATING → LOCK_PENDING transition).
    #[instrument(skip(self, secret))]
    pub async fn authenticate_site(&self, uuid: uuid::Uuid, secret: &str) -> Result<Site, AuthError> {
        let site = self
            .directory
            .find_site_by_uuid(uuid)
            .await
            .map_err(|_| AuthError::DirectoryUnavailable)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_argon2(&site.secret_hash, secret) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(site)
    }
}

fn verify_argon2(stored_hash: &str, supplied: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied.as_bytes(), &parsed)
        .is_ok()
}

fn sha256_hex_eq(supplied: &str, stored_hex: &str) -> bool {
    let digest = Sha256::digest(supplied.as_bytes());
    let supplied_hex = hex::encode(digest);
    supplied_hex.as_bytes().ct_eq(stored_hex.as_bytes()).into()
}

pub fn hash_password(password: &str) -> String {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::{PasswordHasher, SaltString};
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .expect("argon2 hashing with a freshly generated salt cannot fail")
        .to_string()
}

/// Hex-encoded SHA-256 digest of an OAuth2 client secret, as stored in
/// `OAuthClient::secret_hash`.
pub fn hash_oauth_client_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
