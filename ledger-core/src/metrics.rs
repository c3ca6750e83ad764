//! Metrics collection for observability
//!
//! Prometheus metrics on a private registry, so several ledgers (and tests)
//! can live in one process.
//!
//! # Metrics
//!
//! - `bank_ledger_tx_commits_total` - Units of work committed
//! - `bank_ledger_tx_failures_total` - Units of work that ended without a commit
//!   (rolled back, or never began: cancelled early, `begin` failed)
//! - `bank_ledger_tx_duration_seconds` - Histogram of unit-of-work latencies
//! - `bank_ledger_transfers_total` - Committed transfers
//! - `bank_ledger_transferred_minor_units_total` - Sum of committed transfer amounts
//! - `bank_ledger_users_created_total` - Committed user registrations

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed units of work
    pub tx_commits: IntCounter,

    /// Units of work that did not commit, whether or not a transaction was open
    pub tx_failures: IntCounter,

    /// Unit-of-work duration histogram
    pub tx_duration: Histogram,

    /// Committed transfers
    pub transfers_total: IntCounter,

    /// Sum of committed transfer amounts (minor units)
    pub transferred_total: IntCounter,

    /// Committed user registrations
    pub users_created: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("bank_ledger".to_string()), None)?);

        let tx_commits = IntCounter::new("tx_commits_total", "Units of work committed")?;
        registry.register(Box::new(tx_commits.clone()))?;

        let tx_failures = IntCounter::new(
            "tx_failures_total",
            "Units of work that ended without a commit",
        )?;
        registry.register(Box::new(tx_failures.clone()))?;

        let tx_duration = Histogram::with_opts(
            HistogramOpts::new("tx_duration_seconds", "Histogram of unit-of-work latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(tx_duration.clone()))?;

        let transfers_total = IntCounter::new("transfers_total", "Committed transfers")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transferred_total = IntCounter::new(
            "transferred_minor_units_total",
            "Sum of committed transfer amounts",
        )?;
        registry.register(Box::new(transferred_total.clone()))?;

        let users_created = IntCounter::new("users_created_total", "Committed user registrations")?;
        registry.register(Box::new(users_created.clone()))?;

        Ok(Self {
            tx_commits,
            tx_failures,
            tx_duration,
            transfers_total,
            transferred_total,
            users_created,
            registry,
        })
    }

    /// Record a finished unit of work; `committed == false` counts a failure
    pub fn record_unit_of_work(&self, committed: bool, duration_seconds: f64) {
        if committed {
            self.tx_commits.inc();
        } else {
            self.tx_failures.inc();
        }
        self.tx_duration.observe(duration_seconds);
    }

    /// Record a committed transfer
    pub fn record_transfer(&self, amount: i64) {
        self.transfers_total.inc();
        self.transferred_total.inc_by(amount.unsigned_abs());
    }

    /// Record a committed user
    pub fn record_user_created(&self) {
        self.users_created.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
