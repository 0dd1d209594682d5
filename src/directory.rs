//! Directory (component B): maps site identifiers to accounts, secret
//! hashes, and last-seen timestamps. An external collaborator — this module
//! only specifies the query surface the tunnel gateway needs and two
//! implementations of it (an in-memory test double and a Postgres-backed
//! production client modeled on a single-connection `PgPool` wrapper).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Site {
    pub id: i64,
    pub uuid: Uuid,
    /// Argon2id hash of the site secret.
    pub secret_hash: String,
    pub account_id: i64,
    pub last_online: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub account_id: i64,
    pub username: String,
    /// Argon2id hash of the user's password. `None` for bearer/OAuth2-only users.
    pub password_hash: Option<String>,
    pub active: bool,
    pub verified_email: bool,
}

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub user_id: i64,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub secret_hash: String,
    pub active: bool,
    /// The single account this confidential client acts on behalf of
    /// (mirrors `Site`/`User`'s own `account_id` — this deployment has no
    /// multi-account OAuth2 clients).
    pub account_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_site_by_uuid(&self, uuid: Uuid) -> DirectoryResult<Option<Site>>;
    async fn find_site_for_account(&self, account_id: i64) -> DirectoryResult<Option<Site>>;
    /// `username` is matched lowercased against a lowercased stored value —
    /// callers are expected to already have lowercased it, but implementations
    /// must not rely on that and should normalize again at the query boundary.
    async fn find_user_by_username(&self, username: &str) -> DirectoryResult<Option<User>>;
    async fn find_user_by_bearer_token(&self, token: &str) -> DirectoryResult<Option<BearerToken>>;
    async fn find_user(&self, user_id: i64) -> DirectoryResult<Option<User>>;
    async fn find_oauth_client(&self, client_id: &str) -> DirectoryResult<Option<OAuthClient>>;
    async fn bump_last_online(&self, site_id: i64, at: DateTime<Utc>) -> DirectoryResult<()>;
    async fn ping(&self) -> DirectoryResult<()>;
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryDirectory {
        sites_by_uuid: RwLock<HashMap<Uuid, Site>>,
        sites_by_account: RwLock<HashMap<i64, Uuid>>,
        users_by_username: RwLock<HashMap<String, User>>,
        bearer_tokens: RwLock<HashMap<String, BearerToken>>,
        oauth_clients: RwLock<HashMap<String, OAuthClient>>,
    }

    impl InMemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert_site(&self, site: Site) {
            self.sites_by_account
                .write()
                .await
                .insert(site.account_id, site.uuid);
            self.sites_by_uuid.write().await.insert(site.uuid, site);
        }

        pub async fn insert_user(&self, mut user: User) {
            user.username = user.username.to_lowercase();
            self.users_by_username
                .write()
                .await
                .insert(user.username.clone(), user);
        }

        pub async fn insert_bearer_token(&self, token: String, bearer: BearerToken) {
            self.bearer_tokens.write().await.insert(token, bearer);
        }

        pub async fn insert_oauth_client(&self, client: OAuthClient) {
            self.oauth_clients
                .write()
                .await
                .insert(client.client_id.clone(), client);
        }
    }

    #[async_trait]
    impl Directory for InMemoryDirectory {
        async fn find_site_by_uuid(&self, uuid: Uuid) -> DirectoryResult<Option<Site>> {
            Ok(self.sites_by_uuid.read().await.get(&uuid).cloned())
        }

        async fn find_site_for_account(&self, account_id: i64) -> DirectoryResult<Option<Site>> {
            let Some(uuid) = self.sites_by_account.read().await.get(&account_id).copied() else {
                return Ok(None);
            };
            Ok(self.sites_by_uuid.read().await.get(&uuid).cloned())
        }

        async fn find_user_by_username(&self, username: &str) -> DirectoryResult<Option<User>> {
            Ok(self
                .users_by_username
                .read()
                .await
                .get(&username.to_lowercase())
                .cloned())
        }

        async fn find_user_by_bearer_token(
            &self,
            token: &str,
        ) -> DirectoryResult<Option<BearerToken>> {
            Ok(self.bearer_tokens.read().await.get(token).cloned())
        }

        async fn find_user(&self, user_id: i64) -> DirectoryResult<Option<User>> {
            Ok(self
                .users_by_username
                .read()
                .await
                .values()
                .find(|u| u.id == user_id)
                .cloned())
        }

        async fn find_oauth_client(&self, client_id: &str) -> DirectoryResult<Option<OAuthClient>> {
            Ok(self.oauth_clients.read().await.get(client_id).cloned())
        }

        async fn bump_last_online(&self, site_id: i64, at: DateTime<Utc>) -> DirectoryResult<()> {
            let mut sites = self.sites_by_uuid.write().await;
            if let Some(site) = sites.values_mut().find(|s| s.id == site_id) {
                site.last_online = Some(at);
            }
            Ok(())
        }

        async fn ping(&self) -> DirectoryResult<()> {
            Ok(())
        }
    }
}

pub mod postgres {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;

    /// Wraps a small `PgPool` (this process only ever issues one query at a
    /// time per authentication attempt, so a handful of connections is ample).
    pub struct PostgresDirectory {
        pool: PgPool,
    }

    impl PostgresDirectory {
        pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(connection_string)
                .await?;
            Ok(Self { pool })
        }
    }

    #[derive(sqlx::FromRow)]
    struct SiteRow {
        id: i64,
        uuid: Uuid,
        secret_hash: String,
        account_id: i64,
        last_online: Option<DateTime<Utc>>,
    }

    impl From<SiteRow> for Site {
        fn from(r: SiteRow) -> Self {
            Site {
                id: r.id,
                uuid: r.uuid,
                secret_hash: r.secret_hash,
                account_id: r.account_id,
                last_online: r.last_online,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: i64,
        account_id: i64,
        username: String,
        password_hash: Option<String>,
        active: bool,
        verified_email: bool,
    }

    impl From<UserRow> for User {
        fn from(r: UserRow) -> Self {
            User {
                id: r.id,
                account_id: r.account_id,
                username: r.username,
                password_hash: r.password_hash,
                active: r.active,
                verified_email: r.verified_email,
            }
        }
    }

    #[async_trait]
    impl Directory for PostgresDirectory {
        async fn find_site_by_uuid(&self, uuid: Uuid) -> DirectoryResult<Option<Site>> {
            let row: Option<SiteRow> = sqlx::query_as(
                "SELECT id, uuid, secret_hash, account_id, last_online FROM sites WHERE uuid = $1",
            )
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(Into::into))
        }

        async fn find_site_for_account(&self, account_id: i64) -> DirectoryResult<Option<Site>> {
            let row: Option<SiteRow> = sqlx::query_as(
                "SELECT id, uuid, secret_hash, account_id, last_online FROM sites WHERE account_id = $1",
            )
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(Into::into))
        }

        async fn find_user_by_username(&self, username: &str) -> DirectoryResult<Option<User>> {
            let row: Option<UserRow> = sqlx::query_as(
                "SELECT id, account_id, username, password_hash, active, verified_email \
                 FROM users WHERE lower(username) = lower($1)",
            )
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(Into::into))
        }

        async fn find_user_by_bearer_token(
            &self,
            token: &str,
        ) -> DirectoryResult<Option<BearerToken>> {
            #[derive(sqlx::FromRow)]
            struct TokenRow {
                user_id: i64,
                scopes: Vec<String>,
            }
            let row: Option<TokenRow> = sqlx::query_as(
                "SELECT user_id, scopes FROM bearer_tokens WHERE token = $1 AND valid = true",
            )
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(|r| BearerToken {
                user_id: r.user_id,
                scopes: r.scopes,
            }))
        }

        async fn find_user(&self, user_id: i64) -> DirectoryResult<Option<User>> {
            let row: Option<UserRow> = sqlx::query_as(
                "SELECT id, account_id, username, password_hash, active, verified_email \
                 FROM users WHERE id = $1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(Into::into))
        }

        async fn find_oauth_client(&self, client_id: &str) -> DirectoryResult<Option<OAuthClient>> {
            #[derive(sqlx::FromRow)]
            struct ClientRow {
                client_id: String,
                secret_hash: String,
                active: bool,
                account_id: i64,
            }
            let row: Option<ClientRow> = sqlx::query_as(
                "SELECT client_id, secret_hash, active, account_id FROM oauth_clients WHERE client_id = $1",
            )
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(row.map(|r| OAuthClient {
                client_id: r.client_id,
                secret_hash: r.secret_hash,
                active: r.active,
                account_id: r.account_id,
            }))
        }

        async fn bump_last_online(&self, site_id: i64, at: DateTime<Utc>) -> DirectoryResult<()> {
            sqlx::query("UPDATE sites SET last_online = $1 WHERE id = $2")
                .bind(at)
                .bind(site_id)
                .execute(&self.pool)
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(())
        }

        async fn ping(&self) -> DirectoryResult<()> {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(())
        }
    }
}
