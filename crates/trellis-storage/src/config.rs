//! Storage driver settings

use serde::{Deserialize, Serialize};

/// Settings for the node storage driver
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Upper bound on licensing distances
    pub max_license_distance: u8,
    /// Grace window (ms) applied to expiry/creation checks in permissioned
    /// reads
    pub now_tolerance_ms: u64,
    /// Bounded retry count on busy/serialization failures
    pub busy_retries: u32,
    /// Sleep between busy retries (ms)
    pub busy_backoff_ms: u64,
    /// Per-call deadline (ms); the active transaction is rolled back on
    /// expiry
    pub call_timeout_ms: Option<u64>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            max_license_distance: trellis_node::MAX_LICENSE_DISTANCE,
            now_tolerance_ms: 60_000,
            busy_retries: 3,
            busy_backoff_ms: 50,
            call_timeout_ms: None,
        }
    }
}
