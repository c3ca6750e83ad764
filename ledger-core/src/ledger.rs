//! Ledger engine
//!
//! Every operation is one unit of work on the store. The interesting ones are
//! [`Ledger::transfer_tx`] and [`Ledger::create_user_tx`]; the rest are single
//! statements wrapped the same way so they share cancellation, deadlines,
//! tracing and metrics.
//!
//! # Invariants
//!
//! - Double entry: every transfer commits together with exactly two entries,
//!   `-amount` on the source and `+amount` on the destination
//! - Conservation: the sum of all balance deltas of a transfer is zero
//! - Lock order: balances are updated in ascending account id order,
//!   independent of transfer direction, so opposite transfers cannot deadlock
//!
//! # Example
//!
//! ```no_run
//! use bank_ledger::{Config, Ledger, TransferTxParams};
//! use bank_ledger::store::MemoryStore;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> bank_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::new(MemoryStore::from_config(&config.ledger), config.ledger)?;
//!     let cancel = CancellationToken::new();
//!
//!     let result = ledger
//!         .transfer_tx(&cancel, TransferTxParams { from_account_id: 1, to_account_id: 2, amount: 30 })
//!         .await?;
//!     println!("{} -> {}", result.from_account.balance, result.to_account.balance);
//!     Ok(())
//! }
//! ```

use futures::future::BoxFuture;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{LedgerConfig, OverdraftPolicy};
use crate::metrics::Metrics;
use crate::store::{Queries, Store};
use crate::types::{
    Account, CreateAccountParams, CreateEntryParams, CreateSessionParams, CreateUserParams,
    CreateUserTxResult, Currency, Entry, Session, Transfer, TransferTxParams, TransferTxResult,
    User,
};
use crate::unit_of_work::execute_in_transaction;
use crate::{Error, Result};

/// Ledger engine over a [`Store`]
///
/// Stateless apart from configuration and metrics; share it behind an `Arc`.
pub struct Ledger<S: Store> {
    store: S,
    config: LedgerConfig,
    metrics: Metrics,
}

impl<S: Store> Ledger<S> {
    /// Create a ledger over `store`
    pub fn new(store: S, config: LedgerConfig) -> Result<Self> {
        Ok(Self {
            store,
            config,
            metrics: Metrics::new()?,
        })
    }

    /// Backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Engine configuration
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Unit of work with this ledger's deadline, tracing and metrics
    pub async fn exec_tx<T, F>(&self, cancel: &CancellationToken, op: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>> + Send,
    {
        let started = Instant::now();
        let span = tracing::debug_span!("unit_of_work", op);

        let outcome = execute_in_transaction(
            &self.store,
            cancel,
            self.config.transaction_timeout(),
            work,
        )
        .instrument(span)
        .await;

        self.metrics
            .record_unit_of_work(outcome.is_ok(), started.elapsed().as_secs_f64());
        if let Err(err) = &outcome {
            tracing::debug!(op, error = %err, "Unit of work failed");
        }
        outcome
    }

    /// Move `amount` from one account to another atomically
    ///
    /// Writes one transfer, two entries and both balances in a single
    /// transaction. Self-transfers and non-positive amounts are rejected
    /// before the store is touched; store errors come back unchanged.
    pub async fn transfer_tx(
        &self,
        cancel: &CancellationToken,
        params: TransferTxParams,
    ) -> Result<TransferTxResult> {
        params.validate()?;

        let overdraft = self.config.overdraft;
        let result = self
            .exec_tx(cancel, "transfer_tx", move |tx| {
                Box::pin(transfer(tx, params, overdraft))
            })
            .await?;

        self.metrics.record_transfer(result.transfer.amount);
        tracing::info!(
            transfer_id = result.transfer.id,
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount,
            "Transfer committed"
        );
        Ok(result)
    }

    /// Insert a user and run `after_create` inside the same transaction
    ///
    /// The hook sees the inserted row before it is visible to anyone else. If
    /// it fails the user row is rolled back with it, so a committed user always
    /// has its follow-up (e.g. a queued verification email) accepted. Keep the
    /// hook fast: it runs while the transaction is open.
    pub async fn create_user_tx<H, Fut>(
        &self,
        cancel: &CancellationToken,
        params: CreateUserParams,
        after_create: H,
    ) -> Result<CreateUserTxResult>
    where
        H: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let result = self
            .exec_tx(cancel, "create_user_tx", move |tx| {
                Box::pin(async move {
                    let user = tx.create_user(params).await?;
                    after_create(user.clone())
                        .await
                        .map_err(Error::AfterCreate)?;
                    Ok(CreateUserTxResult { user })
                })
            })
            .await?;

        self.metrics.record_user_created();
        tracing::info!(user_id = result.user.id, username = %result.user.username, "User created");
        Ok(result)
    }

    /// Open an account with a zero balance
    pub async fn create_account(
        &self,
        cancel: &CancellationToken,
        owner: &str,
        currency: Currency,
        public_id: Uuid,
    ) -> Result<Account> {
        let params = CreateAccountParams {
            public_id,
            owner: owner.to_string(),
            balance: 0,
            currency,
        };
        self.exec_tx(cancel, "create_account", move |tx| {
            Box::pin(async move { tx.create_account(params).await })
        })
        .await
    }

    /// Account by internal id
    pub async fn get_account(&self, cancel: &CancellationToken, id: i64) -> Result<Account> {
        self.exec_tx(cancel, "get_account", move |tx| {
            Box::pin(async move { tx.get_account(id).await })
        })
        .await
    }

    /// Account by public id
    pub async fn get_account_by_public_id(
        &self,
        cancel: &CancellationToken,
        public_id: Uuid,
    ) -> Result<Account> {
        self.exec_tx(cancel, "get_account_by_public_id", move |tx| {
            Box::pin(async move { tx.get_account_by_public_id(public_id).await })
        })
        .await
    }

    /// Transfer by id
    pub async fn get_transfer(&self, cancel: &CancellationToken, id: i64) -> Result<Transfer> {
        self.exec_tx(cancel, "get_transfer", move |tx| {
            Box::pin(async move { tx.get_transfer(id).await })
        })
        .await
    }

    /// Transfers touching an account
    pub async fn list_transfers(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
    ) -> Result<Vec<Transfer>> {
        self.exec_tx(cancel, "list_transfers", move |tx| {
            Box::pin(async move { tx.list_transfers(account_id).await })
        })
        .await
    }

    /// Entry by id
    pub async fn get_entry(&self, cancel: &CancellationToken, id: i64) -> Result<Entry> {
        self.exec_tx(cancel, "get_entry", move |tx| {
            Box::pin(async move { tx.get_entry(id).await })
        })
        .await
    }

    /// Entries booked against an account
    pub async fn list_entries(
        &self,
        cancel: &CancellationToken,
        account_id: i64,
    ) -> Result<Vec<Entry>> {
        self.exec_tx(cancel, "list_entries", move |tx| {
            Box::pin(async move { tx.list_entries(account_id).await })
        })
        .await
    }

    /// User by username
    pub async fn get_user(&self, cancel: &CancellationToken, username: &str) -> Result<User> {
        let username = username.to_string();
        self.exec_tx(cancel, "get_user", move |tx| {
            Box::pin(async move { tx.get_user(&username).await })
        })
        .await
    }

    /// Record a refresh-token session
    pub async fn create_session(
        &self,
        cancel: &CancellationToken,
        params: CreateSessionParams,
    ) -> Result<Session> {
        self.exec_tx(cancel, "create_session", move |tx| {
            Box::pin(async move { tx.create_session(params).await })
        })
        .await
    }

    /// Session by public id
    pub async fn get_session(&self, cancel: &CancellationToken, public_id: Uuid) -> Result<Session> {
        self.exec_tx(cancel, "get_session", move |tx| {
            Box::pin(async move { tx.get_session(public_id).await })
        })
        .await
    }
}

/// Transfer steps, run against a transaction handle
async fn transfer<Q>(
    q: &mut Q,
    params: TransferTxParams,
    overdraft: OverdraftPolicy,
) -> Result<TransferTxResult>
where
    Q: Queries + ?Sized,
{
    let transfer = q.create_transfer(params.into()).await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: params.from_account_id,
            transfer_id: transfer.id,
            amount: -params.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: params.to_account_id,
            transfer_id: transfer.id,
            amount: params.amount,
        })
        .await?;

    let [first, _] = params.lock_order();
    let (from_account, to_account) = if first == params.from_account_id {
        let from = debit(q, params.from_account_id, params.amount, overdraft).await?;
        let to = q.add_account_balance(params.to_account_id, params.amount).await?;
        (from, to)
    } else {
        let to = q.add_account_balance(params.to_account_id, params.amount).await?;
        let from = debit(q, params.from_account_id, params.amount, overdraft).await?;
        (from, to)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply `-amount`; the row lock is held afterwards, so the check cannot race
async fn debit<Q>(q: &mut Q, account_id: i64, amount: i64, overdraft: OverdraftPolicy) -> Result<Account>
where
    Q: Queries + ?Sized,
{
    let account = q.add_account_balance(account_id, -amount).await?;

    if overdraft == OverdraftPolicy::Reject && account.balance < 0 {
        return Err(Error::InsufficientFunds {
            account_id,
            balance: account.balance + amount,
            amount,
        });
    }
    Ok(account)
}
