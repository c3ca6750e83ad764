//! Persistence gateway
//!
//! The engine only talks to the store through these traits:
//!
//! - [`Queries`] - single-row operations, all scoped to one transaction
//! - [`StoreTx`] - a transaction-scoped handle that can commit or roll back
//! - [`Store`] - the shared, pool-backed entry point that opens transactions
//!
//! Adapters: [`postgres::PgStore`] for production and [`memory::MemoryStore`]
//! for tests. Both hold a row lock on an account from the moment
//! `add_account_balance` touches it until commit or rollback, which is what the
//! engine's lock ordering relies on.

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    Account, CreateAccountParams, CreateEntryParams, CreateSessionParams, CreateTransferParams,
    CreateUserParams, Entry, Session, Transfer, User,
};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Row-level operations available inside a transaction
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===

    /// Insert an account
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account>;

    /// Account by internal id
    async fn get_account(&mut self, id: i64) -> Result<Account>;

    /// Account by public id
    async fn get_account_by_public_id(&mut self, public_id: Uuid) -> Result<Account>;

    /// Atomically add `delta` to the balance and return the updated row.
    ///
    /// Takes the account's row lock for the rest of the transaction.
    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account>;

    // === Transfers ===

    /// Insert a transfer
    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer>;

    /// Transfer by id
    async fn get_transfer(&mut self, id: i64) -> Result<Transfer>;

    /// Transfers touching an account (either side), ordered by id
    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>>;

    // === Entries ===

    /// Insert an entry
    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry>;

    /// Entry by id
    async fn get_entry(&mut self, id: i64) -> Result<Entry>;

    /// Entries booked against an account, ordered by id
    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>>;

    // === Users ===

    /// Insert a user
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User>;

    /// User by username
    async fn get_user(&mut self, username: &str) -> Result<User>;

    // === Sessions ===

    /// Insert a session
    async fn create_session(&mut self, params: CreateSessionParams) -> Result<Session>;

    /// Session by public id
    async fn get_session(&mut self, public_id: Uuid) -> Result<Session>;
}

/// Transaction-scoped store handle
///
/// Dropping a handle without calling [`StoreTx::commit`] rolls it back.
#[async_trait]
pub trait StoreTx: Queries {
    /// Make every write of this transaction durable and visible
    async fn commit(self) -> Result<()>;

    /// Discard every write of this transaction
    async fn rollback(self) -> Result<()>;
}

/// Shared store; cheap to clone, safe to use from many tasks
#[async_trait]
pub trait Store: Send + Sync {
    /// Handle type produced by [`Store::begin`]
    type Tx: StoreTx + 'static;

    /// Open a transaction on its own connection
    async fn begin(&self) -> Result<Self::Tx>;
}
