//! User persistence.
//!
//! `UserStore` is the seam the REST handlers and the CDC change handler
//! share; `PgUserStore` is the PostgreSQL implementation. Queries always
//! select the safe column set — the password hash never leaves the
//! database through this interface.

use async_trait::async_trait;
use beacon_core::{CreateUserRequest, UpdateUserRequest, User, UserRole, UserStatus};
use thiserror::Error;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

/// Columns exposed to the application.
const USER_COLUMNS: &str = "id, email, name, role, status, created_at, updated_at";

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    fn invalid_row(msg: impl Into<String>) -> Self {
        Self::InvalidRow(msg.into())
    }
}

/// Authoritative access to the `users` table.
///
/// `get` returns `None` for missing rows — "not found" is a value here,
/// not an error, because the CDC re-read path treats it as expected.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn list(&self) -> Result<Vec<User>, StoreError>;
    async fn get(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn create(&self, req: &CreateUserRequest) -> Result<User, StoreError>;
    async fn update(&self, id: i64, req: &UpdateUserRequest) -> Result<Option<User>, StoreError>;
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
    /// Connectivity probe for the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store.
pub struct PgUserStore {
    client: Client,
}

impl PgUserStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::Config::new()
            .host(host)
            .port(port)
            .user(user)
            .password(password)
            .dbname(database)
            .connect(NoTls)
            .await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });

        Ok(Self { client })
    }

    /// Raw client access for the migration runner.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn list(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at DESC");
        let rows = self.client.query(sql.as_str(), &[]).await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = self.client.query_opt(sql.as_str(), &[&id]).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create(&self, req: &CreateUserRequest) -> Result<User, StoreError> {
        let role = req.role.unwrap_or(UserRole::User).as_str();
        let sql = format!(
            "INSERT INTO users (email, name, password, role, status) \
             VALUES ($1, $2, $3, $4, 'active') RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&req.email, &req.name, &req.password, &role])
            .await?;
        row_to_user(&row)
    }

    async fn update(&self, id: i64, req: &UpdateUserRequest) -> Result<Option<User>, StoreError> {
        let role = req.role.map(|r| r.as_str());
        let status = req.status.map(|s| s.as_str());

        let mut sets: Vec<String> = vec!["updated_at = now()".into()];
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(email) = req.email.as_ref() {
            params.push(email);
            sets.push(format!("email = ${}", params.len()));
        }
        if let Some(name) = req.name.as_ref() {
            params.push(name);
            sets.push(format!("name = ${}", params.len()));
        }
        if let Some(password) = req.password.as_ref() {
            params.push(password);
            sets.push(format!("password = ${}", params.len()));
        }
        if let Some(role) = role.as_ref() {
            params.push(role);
            sets.push(format!("role = ${}", params.len()));
        }
        if let Some(status) = status.as_ref() {
            params.push(status);
            sets.push(format!("status = ${}", params.len()));
        }

        params.push(&id);
        let sql = format!(
            "UPDATE users SET {} WHERE id = ${} RETURNING {USER_COLUMNS}",
            sets.join(", "),
            params.len()
        );

        let row = self.client.query_opt(sql.as_str(), &params).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let affected = self
            .client
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}

/// In-memory store used by tests and local demos.
pub mod memory {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// A `UserStore` over a plain map. Mirrors the SQL implementation's
    /// observable behavior: safe fields only, `created_at DESC` listing,
    /// defaults on create, `updated_at` bump on update.
    #[derive(Default)]
    pub struct MemoryUserStore {
        state: Mutex<MemoryState>,
    }

    #[derive(Default)]
    struct MemoryState {
        rows: Vec<User>,
        next_id: i64,
    }

    impl MemoryUserStore {
        /// Seed the store with existing rows.
        pub fn with_users(users: Vec<User>) -> Self {
            let next_id = users.iter().map(|u| u.id).max().unwrap_or(0);
            Self {
                state: Mutex::new(MemoryState {
                    rows: users,
                    next_id,
                }),
            }
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn list(&self) -> Result<Vec<User>, StoreError> {
            let state = self.state.lock();
            let mut rows = state.rows.clone();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows)
        }

        async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
            let state = self.state.lock();
            Ok(state.rows.iter().find(|u| u.id == id).cloned())
        }

        async fn create(&self, req: &CreateUserRequest) -> Result<User, StoreError> {
            let mut state = self.state.lock();
            state.next_id += 1;
            let user = User {
                id: state.next_id,
                email: req.email.clone(),
                name: req.name.clone(),
                role: req.role.unwrap_or(UserRole::User),
                status: UserStatus::Active,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            state.rows.push(user.clone());
            Ok(user)
        }

        async fn update(
            &self,
            id: i64,
            req: &UpdateUserRequest,
        ) -> Result<Option<User>, StoreError> {
            let mut state = self.state.lock();
            let Some(user) = state.rows.iter_mut().find(|u| u.id == id) else {
                return Ok(None);
            };
            if let Some(email) = &req.email {
                user.email = email.clone();
            }
            if let Some(name) = &req.name {
                user.name = name.clone();
            }
            if let Some(role) = req.role {
                user.role = role;
            }
            if let Some(status) = req.status {
                user.status = status;
            }
            user.updated_at = Utc::now();
            Ok(Some(user.clone()))
        }

        async fn delete(&self, id: i64) -> Result<bool, StoreError> {
            let mut state = self.state.lock();
            let before = state.rows.len();
            state.rows.retain(|u| u.id != id);
            Ok(state.rows.len() < before)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }
}

fn row_to_user(row: &Row) -> Result<User, StoreError> {
    let role_raw: String = row.try_get("role")?;
    let status_raw: String = row.try_get("status")?;
    let role = UserRole::parse(&role_raw)
        .ok_or_else(|| StoreError::invalid_row(format!("unknown role {role_raw:?}")))?;
    let status = UserStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::invalid_row(format!("unknown status {status_raw:?}")))?;

    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        role,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
