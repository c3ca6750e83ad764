//! Bank Ledger Core
//!
//! Double-entry money transfers and user registration over a transactional
//! store.
//!
//! # Architecture
//!
//! - **Store port**: [`store::Queries`] is the only way rows are read or
//!   written; [`store::PgStore`] backs it with Postgres, [`store::MemoryStore`]
//!   with an in-process fake that keeps the same locking rules
//! - **Unit of work**: [`unit_of_work::execute_in_transaction`] commits or rolls
//!   back exactly once, including on cancellation, deadline and panic
//! - **Engine**: [`Ledger`] composes the multi-step operations
//! - **Services**: [`service`] adds request-level checks on top
//!
//! # Invariants
//!
//! - Money conservation: a committed transfer changes the sum of balances by 0
//! - Double entry: one transfer row, two entries, two balance updates, or none
//! - Deadlock freedom: balance rows are locked in ascending id order

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod unit_of_work;

// Re-exports
pub use config::{Config, LedgerConfig, OverdraftPolicy};
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use types::{
    Account, CreateUserParams, CreateUserTxResult, Currency, Entry, Session, Transfer,
    TransferTxParams, TransferTxResult, User,
};
