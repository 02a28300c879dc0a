//! Transaction tunables.

use keystone_kv::{DurabilityLevel, KeyspaceRef};
use std::time::Duration;

/// Safety cushion added to an attempt's expiry before another client
/// may take it over, absorbing clock skew between nodes.
pub const CLEANUP_SAFETY_MARGIN_MS: u64 = 1_500;

/// How long a registry heartbeat stays valid.
pub const CLIENT_RECORD_EXPIRES_MS: u64 = 60_000;

/// Interval between registry heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_500);

/// Configuration for [`crate::Transactions`].
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Whole-transaction deadline (default 15 s)
    pub timeout: Duration,
    /// Per-attempt expiry window (default 15 s)
    pub expiration: Duration,
    /// Durability required of every mutation (default Majority)
    pub durability: DurabilityLevel,
    /// Budget for a single store operation (default 2.5 s)
    pub kv_timeout: Duration,
    /// Period of one lost-attempt scan over the assigned ATR shard
    /// (default 60 s)
    pub cleanup_window: Duration,
    /// Scan for attempts abandoned by other clients (default true)
    pub cleanup_lost_attempts: bool,
    /// Clean this process's own failed attempts (default true)
    pub cleanup_client_attempts: bool,
    /// Collection holding ATRs and the client record; `None` means the
    /// `_default._default` collection of the mutated bucket
    pub metadata_collection: Option<KeyspaceRef>,
    /// How long `close()` waits for background work to drain
    /// (default 5 s)
    pub shutdown_budget: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            expiration: Duration::from_secs(15),
            durability: DurabilityLevel::Majority,
            kv_timeout: Duration::from_millis(2_500),
            cleanup_window: Duration::from_secs(60),
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            metadata_collection: None,
            shutdown_budget: Duration::from_secs(5),
        }
    }
}

impl TransactionConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the whole-transaction deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-attempt expiry window.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Set the durability level.
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Set the lost-attempt scan window.
    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = window;
        self
    }

    /// Enable or disable lost-attempt cleanup.
    pub fn with_cleanup_lost_attempts(mut self, on: bool) -> Self {
        self.cleanup_lost_attempts = on;
        self
    }

    /// Enable or disable cleanup of this client's own attempts.
    pub fn with_cleanup_client_attempts(mut self, on: bool) -> Self {
        self.cleanup_client_attempts = on;
        self
    }

    /// Set the per-operation budget.
    pub fn with_kv_timeout(mut self, kv_timeout: Duration) -> Self {
        self.kv_timeout = kv_timeout;
        self
    }

    /// Override the collection holding transaction metadata.
    pub fn with_metadata_collection(mut self, keyspace: KeyspaceRef) -> Self {
        self.metadata_collection = Some(keyspace);
        self
    }

    /// Set the shutdown budget.
    pub fn with_shutdown_budget(mut self, budget: Duration) -> Self {
        self.shutdown_budget = budget;
        self
    }

    /// Collection holding ATRs and the client record for documents in
    /// `bucket`.
    pub fn metadata_keyspace_for(&self, bucket: &str) -> KeyspaceRef {
        self.metadata_collection
            .clone()
            .unwrap_or_else(|| KeyspaceRef::default_collection(bucket))
    }

    /// Per-attempt expiry in milliseconds, as recorded in the ATR.
    pub fn expiration_ms(&self) -> u64 {
        self.expiration.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TransactionConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(15));
        assert_eq!(cfg.durability, DurabilityLevel::Majority);
        assert_eq!(cfg.cleanup_window, Duration::from_secs(60));
        assert!(cfg.cleanup_lost_attempts);
        assert!(cfg.cleanup_client_attempts);
    }

    #[test]
    fn test_metadata_keyspace_override() {
        let cfg = TransactionConfig::default();
        assert_eq!(
            cfg.metadata_keyspace_for("orders"),
            KeyspaceRef::default_collection("orders")
        );
        let cfg = cfg.with_metadata_collection(KeyspaceRef::new("meta", "txn", "records"));
        assert_eq!(
            cfg.metadata_keyspace_for("orders"),
            KeyspaceRef::new("meta", "txn", "records")
        );
    }
}
