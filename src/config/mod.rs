//! Engine configuration
//!
//! Per-field serde defaults so partial config files deserialize cleanly.
//! Protocol-level limits that peers must agree on stay as constants in
//! `network::protocol`; only locally tunable knobs live here.

use serde::{Deserialize, Serialize};

fn default_target_block_interval_ms() -> u64 {
    600_000
}

fn default_max_orphan_transactions() -> usize {
    100
}

fn default_discouragement_threshold() -> u32 {
    100
}

fn default_max_extra_txn_for_reconstruction() -> usize {
    100
}

fn default_blocks_only() -> bool {
    false
}

fn default_enable_voting() -> bool {
    false
}

fn default_max_outbound_full_relay() -> usize {
    8
}

fn default_serve_compact_filters() -> bool {
    false
}

/// Tunable engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Target spacing between blocks, used by download timeouts and stale
    /// tip detection.
    #[serde(default = "default_target_block_interval_ms")]
    pub target_block_interval_ms: u64,

    /// Maximum transactions held in the orphan pool.
    #[serde(default = "default_max_orphan_transactions")]
    pub max_orphan_transactions: usize,

    /// Misbehavior score at which a peer is marked for discouragement.
    #[serde(default = "default_discouragement_threshold")]
    pub discouragement_threshold: u32,

    /// Recently seen loose transactions kept for compact block
    /// reconstruction.
    #[serde(default = "default_max_extra_txn_for_reconstruction")]
    pub max_extra_txn_for_reconstruction: usize,

    /// Refuse transaction relay entirely.
    #[serde(default = "default_blocks_only")]
    pub blocks_only: bool,

    /// Enable the pre-consensus polling sub-protocol.
    #[serde(default = "default_enable_voting")]
    pub enable_voting: bool,

    /// Target number of full-relay outbound connections; peers beyond this
    /// are eviction candidates.
    #[serde(default = "default_max_outbound_full_relay")]
    pub max_outbound_full_relay: usize,

    /// Answer compact filter requests (requires a filter index).
    #[serde(default = "default_serve_compact_filters")]
    pub serve_compact_filters: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            target_block_interval_ms: default_target_block_interval_ms(),
            max_orphan_transactions: default_max_orphan_transactions(),
            discouragement_threshold: default_discouragement_threshold(),
            max_extra_txn_for_reconstruction: default_max_extra_txn_for_reconstruction(),
            blocks_only: default_blocks_only(),
            enable_voting: default_enable_voting(),
            max_outbound_full_relay: default_max_outbound_full_relay(),
            serve_compact_filters: default_serve_compact_filters(),
        }
    }
}

impl NetConfig {
    /// Stale tip threshold: three target intervals without a tip update.
    pub fn stale_tip_threshold_ms(&self) -> u64 {
        self.target_block_interval_ms * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = NetConfig::default();
        assert_eq!(config.target_block_interval_ms, 600_000);
        assert_eq!(config.max_orphan_transactions, 100);
        assert_eq!(config.discouragement_threshold, 100);
        assert!(!config.blocks_only);
        assert!(!config.enable_voting);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{"blocks_only": true, "enable_voting": true}"#).unwrap();
        assert!(config.blocks_only);
        assert!(config.enable_voting);
        assert_eq!(config.max_orphan_transactions, 100);
        assert_eq!(config.stale_tip_threshold_ms(), 1_800_000);
    }
}
