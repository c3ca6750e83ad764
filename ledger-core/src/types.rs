//! Core types for the ledger
//!
//! Rows mirror the relational schema one-to-one. Money is always an `i64`
//! count of minor currency units (cents); no floating point anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Bank account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Internal id; also the global lock-ordering key
    pub id: i64,

    /// Externally exposed identifier
    pub public_id: Uuid,

    /// Owner reference (username)
    pub owner: String,

    /// Balance in minor units
    pub balance: i64,

    /// Account currency
    pub currency: Currency,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Money movement between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Transfer id
    pub id: i64,

    /// Debited account
    pub from_account_id: i64,

    /// Credited account
    pub to_account_id: i64,

    /// Always positive
    pub amount: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One signed line against a single account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry id
    pub id: i64,

    /// Account the line is booked against
    pub account_id: i64,

    /// Owning transfer
    pub transfer_id: i64,

    /// Negative for debits, positive for credits
    pub amount: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal id
    pub id: i64,

    /// Externally exposed identifier
    pub public_id: Uuid,

    /// Unique login name
    pub username: String,

    /// Password hash (hashing happens outside the ledger)
    #[serde(skip_serializing)]
    pub hashed_password: String,

    /// Display name
    pub full_name: String,

    /// Unique email
    pub email: String,

    /// Last password change
    pub password_changed_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Refresh-token session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Internal id
    pub id: i64,

    /// Session identifier (the refresh token payload id)
    pub public_id: Uuid,

    /// Session owner
    pub username: String,

    /// Issued refresh token
    pub refresh_token: String,

    /// Client user agent
    pub user_agent: String,

    /// Client IP
    pub client_ip: String,

    /// Revoked flag
    pub is_blocked: bool,

    /// Expiry
    pub expires_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Insert parameters for [`Account`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    /// Externally exposed identifier
    pub public_id: Uuid,
    /// Owner name
    pub owner: String,
    /// Opening balance (minor units)
    pub balance: i64,
    /// Account currency
    pub currency: Currency,
}

/// Insert parameters for [`Transfer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    /// Debited account
    pub from_account_id: i64,
    /// Credited account
    pub to_account_id: i64,
    /// Positive amount (minor units)
    pub amount: i64,
}

/// Insert parameters for [`Entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    /// Account the entry is booked against
    pub account_id: i64,
    /// Owning transfer
    pub transfer_id: i64,
    /// Signed amount: negative debit, positive credit
    pub amount: i64,
}

/// Insert parameters for [`User`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    /// Externally exposed identifier
    pub public_id: Uuid,
    /// Unique login name
    pub username: String,
    /// Already-hashed password
    pub hashed_password: String,
    /// Display name
    pub full_name: String,
    /// Unique email
    pub email: String,
}

/// Insert parameters for [`Session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionParams {
    /// Session id handed to the client
    pub public_id: Uuid,
    /// Owning user
    pub username: String,
    /// Refresh token issued with the session
    pub refresh_token: String,
    /// Client user agent
    pub user_agent: String,
    /// Client address
    pub client_ip: String,
    /// Revoked sessions are kept but blocked
    pub is_blocked: bool,
    /// Refresh token expiry
    pub expires_at: DateTime<Utc>,
}

/// Input of [`crate::Ledger::transfer_tx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    /// Account to debit
    pub from_account_id: i64,
    /// Account to credit
    pub to_account_id: i64,
    /// Amount to move (minor units, must be positive)
    pub amount: i64,
}

impl TransferTxParams {
    /// Reject transfers that must never reach the store
    pub fn validate(&self) -> Result<()> {
        if self.from_account_id == self.to_account_id {
            return Err(Error::InvalidTransfer(format!(
                "cannot transfer from account {} to itself",
                self.from_account_id
            )));
        }
        if self.amount <= 0 {
            return Err(Error::InvalidTransfer(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }

    /// Account ids in global lock order (ascending)
    pub fn lock_order(&self) -> [i64; 2] {
        if self.from_account_id < self.to_account_id {
            [self.from_account_id, self.to_account_id]
        } else {
            [self.to_account_id, self.from_account_id]
        }
    }
}

impl From<TransferTxParams> for CreateTransferParams {
    fn from(p: TransferTxParams) -> Self {
        Self {
            from_account_id: p.from_account_id,
            to_account_id: p.to_account_id,
            amount: p.amount,
        }
    }
}

/// Everything one transfer wrote, as seen at commit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    /// Inserted transfer
    pub transfer: Transfer,
    /// Row keyed by `from_account_id`, whichever account was locked first
    pub from_account: Account,
    /// Row keyed by `to_account_id`
    pub to_account: Account,
    /// `-amount` entry on the source
    pub from_entry: Entry,
    /// `+amount` entry on the destination
    pub to_entry: Entry,
}

/// Output of [`crate::Ledger::create_user_tx`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    /// Committed user
    pub user: User,
}
