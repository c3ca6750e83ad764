//! Service layer
//!
//! Request-level checks in front of the [`Ledger`]: currency compatibility for
//! transfers and user-facing names for registration conflicts.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ledger::Ledger;
use crate::store::Store;
use crate::types::{
    Account, CreateUserParams, CreateUserTxResult, Currency, TransferTxParams, TransferTxResult,
    User,
};
use crate::{Error, Result};

/// Transfer request as received from a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferRequest {
    /// Account to debit
    pub from_account_id: i64,
    /// Account to credit
    pub to_account_id: i64,
    /// Amount in minor units
    pub amount: i64,
    /// Currency both accounts must hold
    pub currency: Currency,
}

/// Transfers with currency checks
pub struct TransferService<S: Store> {
    ledger: Arc<Ledger<S>>,
}

impl<S: Store> TransferService<S> {
    /// Service over a shared ledger
    pub fn new(ledger: Arc<Ledger<S>>) -> Self {
        Self { ledger }
    }

    /// Check both accounts against the request currency, then transfer
    pub async fn create_transfer(
        &self,
        cancel: &CancellationToken,
        request: CreateTransferRequest,
    ) -> Result<TransferTxResult> {
        let from = self.ledger.get_account(cancel, request.from_account_id).await?;
        ensure_currency(&from, request.currency)?;

        let to = self.ledger.get_account(cancel, request.to_account_id).await?;
        ensure_currency(&to, request.currency)?;

        self.ledger
            .transfer_tx(
                cancel,
                TransferTxParams {
                    from_account_id: request.from_account_id,
                    to_account_id: request.to_account_id,
                    amount: request.amount,
                },
            )
            .await
    }
}

fn ensure_currency(account: &Account, currency: Currency) -> Result<()> {
    if account.currency != currency {
        return Err(Error::CurrencyMismatch {
            account_id: account.id,
            expected: account.currency.to_string(),
            actual: currency.to_string(),
        });
    }
    Ok(())
}

/// User registration
pub struct UserService<S: Store> {
    ledger: Arc<Ledger<S>>,
}

impl<S: Store> UserService<S> {
    /// Service over a shared ledger
    pub fn new(ledger: Arc<Ledger<S>>) -> Self {
        Self { ledger }
    }

    /// Register a user; `after_create` runs inside the same transaction
    pub async fn create_user<H, Fut>(
        &self,
        cancel: &CancellationToken,
        params: CreateUserParams,
        after_create: H,
    ) -> Result<CreateUserTxResult>
    where
        H: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ledger
            .create_user_tx(cancel, params, after_create)
            .await
            .map_err(|err| match err.constraint() {
                Some("users_username_key") => {
                    Error::AlreadyExists("username already exists".to_string())
                }
                Some(_) if err.is_conflict() => {
                    Error::AlreadyExists("user already exists".to_string())
                }
                _ => err,
            })
    }
}
