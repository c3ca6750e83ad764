//! Unit-of-work executor
//!
//! Runs a caller-supplied function against a fresh transaction and settles it
//! exactly once: commit on `Ok`, rollback on `Err`, cancellation or deadline.
//! A panic inside the work drops the handle, and every [`StoreTx`] rolls back
//! on drop.
//!
//! ```no_run
//! use bank_ledger::store::{MemoryStore, Queries};
//! use bank_ledger::unit_of_work::execute_in_transaction;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> bank_ledger::Result<()> {
//! let store = MemoryStore::new();
//! let cancel = CancellationToken::new();
//! let balance = execute_in_transaction(&store, &cancel, None, |tx| {
//!     Box::pin(async move { Ok(tx.get_account(1).await?.balance) })
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::store::{Store, StoreTx};
use crate::{Error, Result};

/// Run `work` inside one transaction of `store`
///
/// `work` must do all of its I/O through the handle it is given; anything it
/// does outside that handle is not covered by the rollback.
pub async fn execute_in_transaction<S, T, F>(
    store: &S,
    cancel: &CancellationToken,
    deadline: Option<Duration>,
    work: F,
) -> Result<T>
where
    S: Store,
    T: Send + 'static,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>> + Send,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut tx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        tx = store.begin() => tx?,
    };

    let outcome = {
        let run = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, work(&mut tx))
                    .await
                    .unwrap_or(Err(Error::DeadlineExceeded {
                        after_ms: limit.as_millis() as u64,
                    })),
                None => work(&mut tx).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = run => result,
        }
    };

    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                // The work error is what the caller needs to see
                tracing::warn!(error = %rollback_err, cause = %err, "Rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Queries};
    use crate::types::{CreateAccountParams, Currency};
    use uuid::Uuid;

    fn params() -> CreateAccountParams {
        CreateAccountParams {
            public_id: Uuid::new_v4(),
            owner: "uow".to_string(),
            balance: 0,
            currency: Currency::USD,
        }
    }

    async fn account_exists(store: &MemoryStore, id: i64) -> bool {
        let mut tx = store.begin().await.unwrap();
        tx.get_account(id).await.is_ok()
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let account = execute_in_transaction(&store, &cancel, None, |tx| {
            Box::pin(async move { tx.create_account(params()).await })
        })
        .await
        .unwrap();

        assert!(account_exists(&store, account.id).await);
    }

    #[tokio::test]
    async fn test_rolls_back_on_error() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let err = execute_in_transaction(&store, &cancel, None, |tx| {
            Box::pin(async move {
                let account = tx.create_account(params()).await?;
                tx.add_account_balance(account.id, 10).await?;
                // Fails after two writes
                tx.get_transfer(404).await?;
                Ok(account.id)
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::NotFound { entity: "transfer", .. }));
        // Sequence value 1 was handed out and then discarded
        assert!(!account_exists(&store, 1).await);
    }

    #[tokio::test]
    async fn test_cancelled_before_begin() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = execute_in_transaction(&store, &cancel, None, |tx| {
            Box::pin(async move { tx.create_account(params()).await })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!account_exists(&store, 1).await);
    }

    #[tokio::test]
    async fn test_cancel_mid_transaction_rolls_back() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let err = execute_in_transaction(&store, &cancel, None, move |tx| {
            Box::pin(async move {
                let account = tx.create_account(params()).await?;
                trigger.cancel();
                // Parked until the executor notices the token
                std::future::pending::<()>().await;
                Ok(account.id)
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!account_exists(&store, 1).await);
    }

    #[tokio::test]
    async fn test_deadline_rolls_back() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let err = execute_in_transaction(
            &store,
            &cancel,
            Some(Duration::from_millis(20)),
            |tx| {
                Box::pin(async move {
                    let account = tx.create_account(params()).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(account.id)
                })
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded { after_ms: 20 }));
        assert!(!account_exists(&store, 1).await);
    }

    #[tokio::test]
    async fn test_panic_in_work_rolls_back() {
        let store = MemoryStore::new();

        let task_store = store.clone();
        let joined = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            execute_in_transaction(&task_store, &cancel, None, |tx| {
                Box::pin(async move {
                    let account = tx.create_account(params()).await?;
                    if account.id > 0 {
                        panic!("boom");
                    }
                    Ok(())
                })
            })
            .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!account_exists(&store, 1).await);
    }
}
