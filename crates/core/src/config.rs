use serde::{Deserialize, Serialize};

use crate::kv_cache::{RadixCache, ReqSlotTable, TokenSlotPool};

/// Sizing and policy knobs for the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Total KV cache slots; one slot holds one token position's KV data.
    pub pool_capacity: usize,
    /// Maximum concurrently admitted requests (slot-table rows).
    pub max_requests: usize,
    /// Maximum context length per request (slot-table columns).
    pub max_context_len: usize,
    /// Per-step extend token budget for chunked prefill.
    /// `None` admits each prompt in full in a single step.
    #[serde(default)]
    pub chunked_prefill_budget: Option<usize>,
    /// Trailing token window withheld by incremental detokenization until it
    /// decodes to complete text.
    #[serde(default = "default_surrogate_window")]
    pub surrogate_window: usize,
    /// Whether decode under memory pressure may retract running requests
    /// back to the waiting state.
    #[serde(default = "default_true")]
    pub retract_decode: bool,
}

impl CoreConfig {
    /// Config with the given sizes and default policy settings.
    pub fn new(pool_capacity: usize, max_requests: usize, max_context_len: usize) -> Self {
        Self {
            pool_capacity,
            max_requests,
            max_context_len,
            chunked_prefill_budget: None,
            surrogate_window: default_surrogate_window(),
            retract_decode: true,
        }
    }

    /// Build the shared cache structures this config sizes: the row
    /// table, the token pool, and an empty radix tree.
    pub fn build_state(&self) -> (ReqSlotTable, TokenSlotPool, RadixCache) {
        (
            ReqSlotTable::new(self.max_requests, self.max_context_len),
            TokenSlotPool::new(self.pool_capacity),
            RadixCache::new(),
        )
    }
}

fn default_surrogate_window() -> usize {
    5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "pool_capacity": 4096,
            "max_requests": 64,
            "max_context_len": 512,
            "chunked_prefill_budget": 256,
            "surrogate_window": 8,
            "retract_decode": false
        }"#;
        let config: CoreConfig = serde_json::from_str(json).expect("failed to parse config");
        assert_eq!(config.pool_capacity, 4096);
        assert_eq!(config.max_requests, 64);
        assert_eq!(config.max_context_len, 512);
        assert_eq!(config.chunked_prefill_budget, Some(256));
        assert_eq!(config.surrogate_window, 8);
        assert!(!config.retract_decode);
    }

    #[test]
    fn omitted_fields_get_defaults() {
        let json = r#"{
            "pool_capacity": 128,
            "max_requests": 8,
            "max_context_len": 64
        }"#;
        let config: CoreConfig = serde_json::from_str(json).expect("failed to parse config");
        assert_eq!(config.chunked_prefill_budget, None);
        assert_eq!(config.surrogate_window, 5);
        assert!(config.retract_decode);
    }

    #[test]
    fn round_trips_through_json() {
        let config = CoreConfig {
            chunked_prefill_budget: Some(32),
            ..CoreConfig::new(256, 16, 128)
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: CoreConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn new_fills_policy_defaults() {
        let config = CoreConfig::new(1024, 32, 256);
        assert_eq!(config.surrogate_window, 5);
        assert!(config.retract_decode);
        assert_eq!(config.chunked_prefill_budget, None);
    }

    #[test]
    fn build_state_applies_sizes() {
        let (table, pool, cache) = CoreConfig::new(128, 8, 64).build_state();
        assert_eq!(pool.capacity(), 128);
        assert_eq!(table.max_requests(), 8);
        assert_eq!(table.max_context_len(), 64);
        assert_eq!(cache.total_size(), 0);
    }
}
