//! Postgres store (sqlx)
//!
//! Expects the bank schema: `accounts`, `transfers`, `entries`, `users` and
//! `sessions`, with unique keys on `users.username`, `users.email` and the
//! `public_id` columns, and foreign keys from transfers/entries to accounts.
//! Schema management lives outside this crate.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{Queries, Store, StoreTx};
use crate::config::DatabaseConfig;
use crate::error::{
    PG_FOREIGN_KEY_VIOLATION, PG_LOCK_NOT_AVAILABLE, PG_NUMERIC_VALUE_OUT_OF_RANGE,
    PG_UNIQUE_VIOLATION,
};
use crate::types::{
    Account, CreateAccountParams, CreateEntryParams, CreateSessionParams, CreateTransferParams,
    CreateUserParams, Currency, Entry, Session, Transfer, User,
};
use crate::{Error, Result};

const ACCOUNT_COLUMNS: &str = "id, public_id, owner, balance, currency, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, transfer_id, amount, created_at";
const USER_COLUMNS: &str =
    "id, public_id, username, hashed_password, full_name, email, password_changed_at, created_at";
const SESSION_COLUMNS: &str = "id, public_id, username, refresh_token, user_agent, client_ip, \
                               is_blocked, expires_at, created_at";

/// Pool-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    /// Connect a new pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected Postgres pool"
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Apply `SET LOCAL lock_timeout` to every transaction
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        let mut tx = self.pool.begin().await?;

        if let Some(limit) = self.lock_timeout {
            // SET does not take bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = {}", limit.as_millis()))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgTx { tx })
    }
}

/// Transaction on a [`PgStore`]; rolled back by sqlx when dropped unfinished
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

/// Translate constraint violations; everything else passes through untouched
fn map_db_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        let constraint = db.constraint().unwrap_or_default().to_string();
        match db.code().as_deref() {
            Some(PG_UNIQUE_VIOLATION) => return Error::Conflict { constraint },
            Some(PG_FOREIGN_KEY_VIOLATION) => return Error::ForeignKeyViolation { constraint },
            _ => {}
        }
    }
    Error::Database(err)
}

/// Balance update errors: lock wait expiry and bigint overflow get their own variants
fn map_balance_error(err: sqlx::Error, account_id: i64) -> Error {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(PG_LOCK_NOT_AVAILABLE) => return Error::LockTimeout { account_id },
            Some(PG_NUMERIC_VALUE_OUT_OF_RANGE) => return Error::BalanceOverflow { account_id },
            _ => {}
        }
    }
    map_db_error(err)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let code: String = row.try_get("currency")?;
    let currency = Currency::parse(&code)
        .ok_or_else(|| Error::Database(sqlx::Error::Decode(format!("unknown currency {code}").into())))?;

    Ok(Account {
        id: row.try_get("id")?,
        public_id: row.try_get("public_id")?,
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        transfer_id: row.try_get("transfer_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        public_id: row.try_get("public_id")?,
        username: row.try_get("username")?,
        hashed_password: row.try_get("hashed_password")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        password_changed_at: row.try_get("password_changed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        public_id: row.try_get("public_id")?,
        username: row.try_get("username")?,
        refresh_token: row.try_get("refresh_token")?,
        user_agent: row.try_get("user_agent")?,
        client_ip: row.try_get("client_ip")?,
        is_blocked: row.try_get("is_blocked")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (public_id, owner, balance, currency)
             VALUES ($1, $2, $3, $4)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.public_id)
        .bind(&params.owner)
        .bind(params.balance)
        .bind(params.currency.code())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        account_from_row(&row)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::not_found("account", id))?;

        account_from_row(&row)
    }

    async fn get_account_by_public_id(&mut self, public_id: Uuid) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::not_found("account", public_id))?;

        account_from_row(&row)
    }

    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account> {
        // Single statement: the row lock is taken and the new balance returned atomically
        let row = sqlx::query(&format!(
            "UPDATE accounts
             SET balance = balance + $2
             WHERE id = $1
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_balance_error(e, id))?
        .ok_or_else(|| Error::not_found("account", id))?;

        account_from_row(&row)
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        let row = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount)
             VALUES ($1, $2, $3)
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        transfer_from_row(&row)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::not_found("transfer", id))?;

        transfer_from_row(&row)
    }

    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE from_account_id = $1 OR to_account_id = $1
             ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(transfer_from_row).collect()
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, transfer_id, amount)
             VALUES ($1, $2, $3)
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(params.account_id)
        .bind(params.transfer_id)
        .bind(params.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        entry_from_row(&row)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| Error::not_found("entry", id))?;

        entry_from_row(&row)
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (public_id, username, hashed_password, full_name, email)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(params.public_id)
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        user_from_row(&row)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| Error::not_found("user", username))?;

        user_from_row(&row)
    }

    async fn create_session(&mut self, params: CreateSessionParams) -> Result<Session> {
        let row = sqlx::query(&format!(
            "INSERT INTO sessions (public_id, username, refresh_token, user_agent, client_ip,
                                   is_blocked, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(params.public_id)
        .bind(&params.username)
        .bind(&params.refresh_token)
        .bind(&params.user_agent)
        .bind(&params.client_ip)
        .bind(params.is_blocked)
        .bind(params.expires_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;

        session_from_row(&row)
    }

    async fn get_session(&mut self, public_id: Uuid) -> Result<Session> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| Error::not_found("session", public_id))?;

        session_from_row(&row)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
