//! In-memory store
//!
//! Behaves like a read-committed relational store with row locks:
//!
//! - writes are staged per transaction and published atomically on commit
//! - a transaction reads its own staged rows, everyone else sees committed rows
//! - `add_account_balance` takes the account's row lock and keeps it until the
//!   transaction ends, so two transactions updating the same account serialize
//! - unique keys are reserved at insert time and released on rollback
//! - ids come from sequences and are never reused, even after a rollback
//!
//! Lock waits are bounded by `lock_timeout`; an expired wait aborts with
//! [`Error::LockTimeout`], the equivalent of Postgres giving up on a deadlock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{Queries, Store, StoreTx};
use crate::config::LedgerConfig;
use crate::types::{
    Account, CreateAccountParams, CreateEntryParams, CreateSessionParams, CreateTransferParams,
    CreateUserParams, Entry, Session, Transfer, User,
};
use crate::{Error, Result};

const ACCOUNTS_PUBLIC_ID_KEY: &str = "accounts_public_id_key";
const USERS_USERNAME_KEY: &str = "users_username_key";
const USERS_EMAIL_KEY: &str = "users_email_key";
const USERS_PUBLIC_ID_KEY: &str = "users_public_id_key";
const SESSIONS_PUBLIC_ID_KEY: &str = "sessions_public_id_key";

type UniqueKey = (&'static str, String);

/// Committed rows
#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    transfers: BTreeMap<i64, Transfer>,
    entries: BTreeMap<i64, Entry>,
    users: BTreeMap<i64, User>,
    sessions: BTreeMap<i64, Session>,
    /// Committed keys plus keys reserved by in-flight transactions
    unique: HashSet<UniqueKey>,
}

#[derive(Default)]
struct Sequences {
    accounts: AtomicI64,
    transfers: AtomicI64,
    entries: AtomicI64,
    users: AtomicI64,
    sessions: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    seq: Sequences,
}

/// In-process [`Store`] for tests and local runs
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    lock_timeout: Option<Duration>,
}

impl MemoryStore {
    /// Store whose lock waits never time out
    pub fn new() -> Self {
        Self::default()
    }

    /// Store using the configured lock timeout
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new().with_lock_timeout(config.lock_timeout())
    }

    /// Bound row lock waits
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            lock_timeout: self.lock_timeout,
            locks: HashMap::new(),
            staged: Staged::default(),
            finished: false,
        })
    }
}

/// Writes not yet visible to other transactions
#[derive(Default)]
struct Staged {
    accounts: BTreeMap<i64, Account>,
    transfers: BTreeMap<i64, Transfer>,
    entries: BTreeMap<i64, Entry>,
    users: BTreeMap<i64, User>,
    sessions: BTreeMap<i64, Session>,
    reserved: Vec<UniqueKey>,
}

/// Transaction on a [`MemoryStore`]
pub struct MemoryTx {
    shared: Arc<Shared>,
    lock_timeout: Option<Duration>,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
    staged: Staged,
    finished: bool,
}

impl MemoryTx {
    fn account(&self, id: i64) -> Option<Account> {
        if let Some(account) = self.staged.accounts.get(&id) {
            return Some(account.clone());
        }
        self.shared.tables.lock().accounts.get(&id).cloned()
    }

    fn transfer(&self, id: i64) -> Option<Transfer> {
        if let Some(transfer) = self.staged.transfers.get(&id) {
            return Some(transfer.clone());
        }
        self.shared.tables.lock().transfers.get(&id).cloned()
    }

    fn user(&self, username: &str) -> Option<User> {
        if let Some(user) = self.staged.users.values().find(|u| u.username == username) {
            return Some(user.clone());
        }
        self.shared
            .tables
            .lock()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    /// Reserve every key or none of them
    fn reserve(&mut self, keys: Vec<UniqueKey>) -> Result<()> {
        let mut tables = self.shared.tables.lock();
        if let Some((constraint, _)) = keys.iter().find(|key| tables.unique.contains(*key)) {
            return Err(Error::Conflict {
                constraint: constraint.to_string(),
            });
        }
        for key in keys {
            tables.unique.insert(key.clone());
            self.staged.reserved.push(key);
        }
        Ok(())
    }

    async fn lock_row(&mut self, account_id: i64) -> Result<()> {
        if self.locks.contains_key(&account_id) {
            return Ok(());
        }

        let cell = self
            .shared
            .row_locks
            .entry(account_id)
            .or_default()
            .value()
            .clone();

        let guard = match self.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, cell.lock_owned())
                .await
                .map_err(|_| Error::LockTimeout { account_id })?,
            None => cell.lock_owned().await,
        };

        self.locks.insert(account_id, guard);
        Ok(())
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let reserved = std::mem::take(&mut self.staged.reserved);
        if !reserved.is_empty() {
            let mut tables = self.shared.tables.lock();
            for key in &reserved {
                tables.unique.remove(key);
            }
        }
        self.staged = Staged::default();
        self.locks.clear();
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        self.reserve(vec![(ACCOUNTS_PUBLIC_ID_KEY, params.public_id.to_string())])?;

        let account = Account {
            id: next_id(&self.shared.seq.accounts),
            public_id: params.public_id,
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.staged.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account> {
        self.account(id).ok_or_else(|| Error::not_found("account", id))
    }

    async fn get_account_by_public_id(&mut self, public_id: Uuid) -> Result<Account> {
        if let Some(account) = self
            .staged
            .accounts
            .values()
            .find(|a| a.public_id == public_id)
        {
            return Ok(account.clone());
        }
        self.shared
            .tables
            .lock()
            .accounts
            .values()
            .find(|a| a.public_id == public_id)
            .cloned()
            .ok_or_else(|| Error::not_found("account", public_id))
    }

    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account> {
        // An UPDATE matching no row takes no lock
        if self.account(id).is_none() {
            return Err(Error::not_found("account", id));
        }

        self.lock_row(id).await?;

        // Re-read under the lock: the previous holder has published by now
        let mut account = self
            .account(id)
            .ok_or_else(|| Error::not_found("account", id))?;
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or(Error::BalanceOverflow { account_id: id })?;

        self.staged.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        if self.account(params.from_account_id).is_none() {
            return Err(Error::ForeignKeyViolation {
                constraint: "transfers_from_account_id_fkey".to_string(),
            });
        }
        if self.account(params.to_account_id).is_none() {
            return Err(Error::ForeignKeyViolation {
                constraint: "transfers_to_account_id_fkey".to_string(),
            });
        }

        let transfer = Transfer {
            id: next_id(&self.shared.seq.transfers),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer> {
        self.transfer(id).ok_or_else(|| Error::not_found("transfer", id))
    }

    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>> {
        let touches =
            |t: &Transfer| t.from_account_id == account_id || t.to_account_id == account_id;

        let mut rows: BTreeMap<i64, Transfer> = self
            .shared
            .tables
            .lock()
            .transfers
            .values()
            .filter(|t| touches(t))
            .map(|t| (t.id, t.clone()))
            .collect();
        rows.extend(
            self.staged
                .transfers
                .values()
                .filter(|t| touches(t))
                .map(|t| (t.id, t.clone())),
        );
        Ok(rows.into_values().collect())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        if self.account(params.account_id).is_none() {
            return Err(Error::ForeignKeyViolation {
                constraint: "entries_account_id_fkey".to_string(),
            });
        }
        if self.transfer(params.transfer_id).is_none() {
            return Err(Error::ForeignKeyViolation {
                constraint: "entries_transfer_id_fkey".to_string(),
            });
        }

        let entry = Entry {
            id: next_id(&self.shared.seq.entries),
            account_id: params.account_id,
            transfer_id: params.transfer_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.staged.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry> {
        if let Some(entry) = self.staged.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.shared
            .tables
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("entry", id))
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>> {
        let mut rows: BTreeMap<i64, Entry> = self
            .shared
            .tables
            .lock()
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .map(|e| (e.id, e.clone()))
            .collect();
        rows.extend(
            self.staged
                .entries
                .values()
                .filter(|e| e.account_id == account_id)
                .map(|e| (e.id, e.clone())),
        );
        Ok(rows.into_values().collect())
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        self.reserve(vec![
            (USERS_USERNAME_KEY, params.username.clone()),
            (USERS_EMAIL_KEY, params.email.clone()),
            (USERS_PUBLIC_ID_KEY, params.public_id.to_string()),
        ])?;

        let now = Utc::now();
        let user = User {
            id: next_id(&self.shared.seq.users),
            public_id: params.public_id,
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            password_changed_at: now,
            created_at: now,
        };
        self.staged.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        self.user(username)
            .ok_or_else(|| Error::not_found("user", username))
    }

    async fn create_session(&mut self, params: CreateSessionParams) -> Result<Session> {
        if self.user(&params.username).is_none() {
            return Err(Error::ForeignKeyViolation {
                constraint: "sessions_username_fkey".to_string(),
            });
        }
        self.reserve(vec![(SESSIONS_PUBLIC_ID_KEY, params.public_id.to_string())])?;

        let session = Session {
            id: next_id(&self.shared.seq.sessions),
            public_id: params.public_id,
            username: params.username,
            refresh_token: params.refresh_token,
            user_agent: params.user_agent,
            client_ip: params.client_ip,
            is_blocked: params.is_blocked,
            expires_at: params.expires_at,
            created_at: Utc::now(),
        };
        self.staged.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&mut self, public_id: Uuid) -> Result<Session> {
        if let Some(session) = self
            .staged
            .sessions
            .values()
            .find(|s| s.public_id == public_id)
        {
            return Ok(session.clone());
        }
        self.shared
            .tables
            .lock()
            .sessions
            .values()
            .find(|s| s.public_id == public_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", public_id))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        {
            let mut tables = self.shared.tables.lock();
            tables.accounts.extend(staged.accounts);
            tables.transfers.extend(staged.transfers);
            tables.entries.extend(staged.entries);
            tables.users.extend(staged.users);
            tables.sessions.extend(staged.sessions);
        }
        self.finished = true;
        // Rows are published; now let waiters in
        self.locks.clear();
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Currency;

    fn account_params(balance: i64) -> CreateAccountParams {
        CreateAccountParams {
            public_id: Uuid::new_v4(),
            owner: "alice".to_string(),
            balance,
            currency: Currency::USD,
        }
    }

    fn user_params(username: &str, email: &str) -> CreateUserParams {
        CreateUserParams {
            public_id: Uuid::new_v4(),
            username: username.to_string(),
            hashed_password: "hash".to_string(),
            full_name: "Test User".to_string(),
            email: email.to_string(),
        }
    }

    async fn seeded_account(store: &MemoryStore, balance: i64) -> Account {
        let mut tx = store.begin().await.unwrap();
        let account = tx.create_account(account_params(balance)).await.unwrap();
        tx.commit().await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_staged_rows_invisible_until_commit() {
        let store = MemoryStore::new();

        let mut writer = store.begin().await.unwrap();
        let account = writer.create_account(account_params(100)).await.unwrap();

        // Read-your-writes inside the transaction
        assert_eq!(writer.get_account(account.id).await.unwrap(), account);

        let mut reader = store.begin().await.unwrap();
        let err = reader.get_account(account.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "account", .. }));

        writer.commit().await.unwrap();
        assert_eq!(reader.get_account(account.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_keeps_sequence() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        let discarded = tx.create_account(account_params(5)).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_account(discarded.id).await.is_err());
        let kept = tx.create_account(account_params(5)).await.unwrap();
        tx.commit().await.unwrap();

        assert!(kept.id > discarded.id);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let store = MemoryStore::new();
        let account = seeded_account(&store, 10).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.add_account_balance(account.id, 90).await.unwrap();
            tx.create_user(user_params("dropped", "dropped@example.com"))
                .await
                .unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_account(account.id).await.unwrap().balance, 10);
        assert!(tx.get_user("dropped").await.is_err());
        // Unique key released and row lock free again
        tx.create_user(user_params("dropped", "dropped@example.com"))
            .await
            .unwrap();
        tx.add_account_balance(account.id, 1).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_account_balance_missing_account() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx.add_account_balance(404, 10).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "account", .. }));
    }

    #[tokio::test]
    async fn test_add_account_balance_overflow() {
        let store = MemoryStore::new();
        let account = seeded_account(&store, i64::MAX - 1).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx.add_account_balance(account.id, 2).await.unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow { account_id } if account_id == account.id));
    }

    #[tokio::test]
    async fn test_unique_violation_names_constraint() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.create_user(user_params("bob", "bob@example.com"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .create_user(user_params("bob", "other@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some(USERS_USERNAME_KEY));

        let err = tx
            .create_user(user_params("robert", "bob@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some(USERS_EMAIL_KEY));
    }

    #[tokio::test]
    async fn test_in_flight_reservation_conflicts() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        first
            .create_user(user_params("carol", "carol@example.com"))
            .await
            .unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second
            .create_user(user_params("carol", "c2@example.com"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Nothing half-reserved by the failed insert
        second
            .create_user(user_params("carla", "c2@example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let store = MemoryStore::new();
        let account = seeded_account(&store, 0).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .create_transfer(CreateTransferParams {
                from_account_id: account.id,
                to_account_id: 999,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some("transfers_to_account_id_fkey"));

        let err = tx
            .create_entry(CreateEntryParams {
                account_id: account.id,
                transfer_id: 999,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some("entries_transfer_id_fkey"));

        let err = tx
            .create_session(CreateSessionParams {
                public_id: Uuid::new_v4(),
                username: "nobody".to_string(),
                refresh_token: "t".to_string(),
                user_agent: String::new(),
                client_ip: String::new(),
                is_blocked: false,
                expires_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.constraint(), Some("sessions_username_fkey"));
    }

    #[tokio::test]
    async fn test_row_lock_serializes_writers() {
        let store = MemoryStore::new();
        let account = seeded_account(&store, 0).await;

        let mut first = store.begin().await.unwrap();
        first.add_account_balance(account.id, 10).await.unwrap();

        let contender = {
            let store = store.clone();
            let id = account.id;
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let updated = tx.add_account_balance(id, 5).await.unwrap();
                tx.commit().await.unwrap();
                updated.balance
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.commit().await.unwrap();
        // No lost update: the waiter saw the committed +10
        assert_eq!(contender.await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_opposite_lock_order_times_out() {
        let store = MemoryStore::new().with_lock_timeout(Some(Duration::from_millis(50)));
        let a = seeded_account(&store, 100).await;
        let b = seeded_account(&store, 100).await;

        let mut tx1 = store.begin().await.unwrap();
        let mut tx2 = store.begin().await.unwrap();
        tx1.add_account_balance(a.id, -1).await.unwrap();
        tx2.add_account_balance(b.id, -1).await.unwrap();

        // Circular wait: each holds what the other wants
        let (r1, r2) = tokio::join!(
            tx1.add_account_balance(b.id, 1),
            tx2.add_account_balance(a.id, 1)
        );
        assert!(matches!(r1, Err(Error::LockTimeout { .. })));
        assert!(matches!(r2, Err(Error::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_lists_merge_staged_and_committed() {
        let store = MemoryStore::new();
        let a = seeded_account(&store, 0).await;
        let b = seeded_account(&store, 0).await;

        let mut tx = store.begin().await.unwrap();
        let committed = tx
            .create_transfer(CreateTransferParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 3,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let staged = tx
            .create_transfer(CreateTransferParams {
                from_account_id: b.id,
                to_account_id: a.id,
                amount: 4,
            })
            .await
            .unwrap();
        tx.create_entry(CreateEntryParams {
            account_id: a.id,
            transfer_id: staged.id,
            amount: 4,
        })
        .await
        .unwrap();

        let ids: Vec<i64> = tx
            .list_transfers(a.id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![committed.id, staged.id]);
        assert_eq!(tx.list_entries(a.id).await.unwrap().len(), 1);
        assert!(tx.list_entries(b.id).await.unwrap().is_empty());
    }
}
