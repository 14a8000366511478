//! Cache behavior configuration.
//!
//! This module defines:
//! - TTL policies per resource type (three-state: fresh / stale / expired)
//! - Size limits and cleanup thresholds
//! - Cache key derivation from canonicalised parameters
//! - The startup warming plan

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// TTL state of a cache entry at read time.
///
/// Consumers only ever observe `Fresh` and `Stale`; expired entries are
/// removed on read and reported as a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Fresh,
    Stale,
    Expired,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Fresh => "fresh",
            CacheState::Stale => "stale",
            CacheState::Expired => "expired",
        }
    }
}

/// Fresh/stale horizon pair for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub fresh_seconds: u64,
    pub stale_seconds: u64,
}

impl TtlPolicy {
    pub const fn new(fresh_seconds: u64, stale_seconds: u64) -> Self {
        Self {
            fresh_seconds,
            stale_seconds,
        }
    }

    pub fn fresh_minutes(&self) -> f64 {
        self.fresh_seconds as f64 / 60.0
    }

    pub fn stale_minutes(&self) -> f64 {
        self.stale_seconds as f64 / 60.0
    }
}

/// Policy applied to resource types without an explicit entry.
pub const DEFAULT_TTL_POLICY: TtlPolicy = TtlPolicy::new(5 * 60, 30 * 60);

/// Static TTL policy table, keyed by resource type.
pub const TTL_POLICIES: &[(&str, TtlPolicy)] = &[
    ("folder_get_tree", TtlPolicy::new(30 * 60, 2 * 60 * 60)),
    ("folder_list", TtlPolicy::new(30 * 60, 2 * 60 * 60)),
    ("email_list", TtlPolicy::new(5 * 60, 30 * 60)),
    ("email_get", TtlPolicy::new(60 * 60, 4 * 60 * 60)),
    ("file_list", TtlPolicy::new(10 * 60, 60 * 60)),
    ("file_get", TtlPolicy::new(60 * 60, 4 * 60 * 60)),
    ("contact_list", TtlPolicy::new(30 * 60, 2 * 60 * 60)),
    ("contact_get", TtlPolicy::new(60 * 60, 4 * 60 * 60)),
    ("calendar_list_events", TtlPolicy::new(5 * 60, 30 * 60)),
    ("calendar_get_event", TtlPolicy::new(15 * 60, 60 * 60)),
    ("search_emails", TtlPolicy::new(5 * 60, 15 * 60)),
    ("search_files", TtlPolicy::new(5 * 60, 15 * 60)),
    ("search_events", TtlPolicy::new(5 * 60, 15 * 60)),
    ("search_contacts", TtlPolicy::new(5 * 60, 15 * 60)),
];

/// Look up the TTL policy for a resource type, defaulting for unknown types.
pub fn ttl_policy(resource_type: &str) -> TtlPolicy {
    TTL_POLICIES
        .iter()
        .find(|(name, _)| *name == resource_type)
        .map(|(_, policy)| *policy)
        .unwrap_or(DEFAULT_TTL_POLICY)
}

/// Cache capacity limits and cleanup thresholds.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Maximum stored payload size for a single entry
    pub max_entry_bytes: usize,

    /// Maximum total stored bytes across all entries
    pub max_total_bytes: u64,

    /// Fraction of `max_total_bytes` that triggers a cleanup pass
    pub cleanup_threshold: f64,

    /// Fraction of `max_total_bytes` a cleanup pass reduces to
    pub cleanup_target: f64,

    /// Advisory per-account entry ceiling
    pub max_entries_per_account: u64,

    /// Encoded payloads at or above this size are gzip-compressed
    pub compression_threshold: usize,

    /// gzip compression level
    pub compression_level: u32,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 10 * 1024 * 1024,
            max_total_bytes: 2 * 1024 * 1024 * 1024,
            cleanup_threshold: 0.8,
            cleanup_target: 0.6,
            max_entries_per_account: 10_000,
            compression_threshold: 50 * 1024,
            compression_level: 6,
        }
    }
}

/// Derive the cache key for a request.
///
/// Keys are `resource_type:account_id` for parameterless requests and
/// `resource_type:account_id:param_hash` otherwise, where the hash is the
/// first 8 hex characters of SHA-256 over the canonical JSON encoding of the
/// parameters. Equal parameters always derive equal keys regardless of map
/// ordering.
pub fn generate_cache_key(account_id: &str, resource_type: &str, params: Option<&Value>) -> String {
    match params {
        Some(value) if !is_empty_params(value) => {
            format!("{}:{}:{}", resource_type, account_id, param_hash(value))
        }
        _ => format!("{}:{}", resource_type, account_id),
    }
}

/// Structured form of a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCacheKey {
    pub resource_type: String,
    pub account_id: String,
    pub param_hash: Option<String>,
}

/// Split a cache key back into its segments. Returns `None` for strings that
/// are not two- or three-segment keys.
pub fn parse_cache_key(key: &str) -> Option<ParsedCacheKey> {
    let segments: Vec<&str> = key.split(':').collect();
    match segments.as_slice() {
        [resource_type, account_id] => Some(ParsedCacheKey {
            resource_type: resource_type.to_string(),
            account_id: account_id.to_string(),
            param_hash: None,
        }),
        [resource_type, account_id, hash] => Some(ParsedCacheKey {
            resource_type: resource_type.to_string(),
            account_id: account_id.to_string(),
            param_hash: Some(hash.to_string()),
        }),
        _ => None,
    }
}

fn is_empty_params(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn param_hash(params: &Value) -> String {
    let canonical = canonical_json(params);
    let digest = Sha256::digest(canonical.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render JSON with object keys sorted recursively and compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; Value::String gives JSON escaping.
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// One entry of the startup warming plan.
#[derive(Debug, Clone)]
pub struct WarmingOperation {
    pub operation: String,
    pub params: Value,
    pub priority: u8,
    pub throttle: Duration,
}

/// Operations executed once per account at startup to pre-fill hot entries.
pub fn warming_plan() -> Vec<WarmingOperation> {
    vec![
        WarmingOperation {
            operation: "folder_get_tree".to_string(),
            params: serde_json::json!({"folder_id": "root", "max_depth": 10}),
            priority: 1,
            throttle: Duration::from_secs(1),
        },
        WarmingOperation {
            operation: "email_list".to_string(),
            params: serde_json::json!({"folder": "inbox", "limit": 50}),
            priority: 2,
            throttle: Duration::from_millis(500),
        },
        WarmingOperation {
            operation: "contact_list".to_string(),
            params: serde_json::json!({"limit": 100}),
            priority: 3,
            throttle: Duration::from_millis(500),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_generate_cache_key_without_params() {
        assert_eq!(
            generate_cache_key("acc-123", "folder_get_tree", None),
            "folder_get_tree:acc-123"
        );
        assert_eq!(
            generate_cache_key("acc-123", "folder_get_tree", Some(&json!({}))),
            "folder_get_tree:acc-123"
        );
    }

    #[test]
    fn test_generate_cache_key_with_params() {
        let params = json!({"folder_id": "root", "max_depth": 10});
        let key = generate_cache_key("acc-123", "folder_get_tree", Some(&params));
        assert!(key.starts_with("folder_get_tree:acc-123:"));
        assert_eq!(key.split(':').count(), 3);
        assert_eq!(key.split(':').last().unwrap().len(), 8);
    }

    #[test]
    fn test_param_order_does_not_change_key() {
        let a = json!({"folder_id": "root", "max_depth": 10});
        let b = json!({"max_depth": 10, "folder_id": "root"});
        assert_eq!(
            generate_cache_key("acc", "folder_get_tree", Some(&a)),
            generate_cache_key("acc", "folder_get_tree", Some(&b))
        );
    }

    #[test]
    fn test_parse_cache_key_round_trip() {
        let parsed = parse_cache_key("folder_get_tree:acc-123").unwrap();
        assert_eq!(parsed.resource_type, "folder_get_tree");
        assert_eq!(parsed.account_id, "acc-123");
        assert!(parsed.param_hash.is_none());

        let parsed = parse_cache_key("folder_get_tree:acc-123:8f4b2c3d").unwrap();
        assert_eq!(parsed.param_hash.as_deref(), Some("8f4b2c3d"));

        assert!(parse_cache_key("bare").is_none());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"y": 1, "x": [2, {"q": 3, "p": 4}]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"b":{"x":[2,{"p":4,"q":3}],"y":1}}"#
        );
    }

    #[test]
    fn test_ttl_policy_lookup() {
        let policy = ttl_policy("folder_get_tree");
        assert_eq!(policy.fresh_seconds, 30 * 60);
        assert_eq!(policy.stale_seconds, 2 * 60 * 60);
        assert_eq!(policy.fresh_minutes(), 30.0);
        assert_eq!(policy.stale_minutes(), 120.0);

        assert_eq!(ttl_policy("unknown_resource"), DEFAULT_TTL_POLICY);
    }

    #[test]
    fn test_ttl_policies_are_ordered() {
        for (name, policy) in TTL_POLICIES {
            assert!(
                policy.fresh_seconds <= policy.stale_seconds,
                "fresh exceeds stale for {name}"
            );
        }
    }

    #[test]
    fn test_ttl_policies_cover_expected_resources() {
        for resource in [
            "folder_get_tree",
            "folder_list",
            "email_list",
            "email_get",
            "file_list",
            "file_get",
            "contact_list",
            "contact_get",
            "calendar_list_events",
            "calendar_get_event",
            "search_emails",
            "search_files",
        ] {
            assert!(
                TTL_POLICIES.iter().any(|(name, _)| *name == resource),
                "no TTL policy for {resource}"
            );
        }
    }

    #[test]
    fn test_default_limits() {
        let limits = CacheLimits::default();
        assert_eq!(limits.max_entry_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.max_total_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(limits.cleanup_threshold, 0.8);
        assert_eq!(limits.cleanup_target, 0.6);
        assert_eq!(limits.compression_threshold, 50 * 1024);
        assert_eq!(limits.compression_level, 6);
    }

    #[test]
    fn test_warming_plan_sorted_by_priority() {
        let plan = warming_plan();
        assert!(plan.iter().any(|op| op.operation == "folder_get_tree"));
        assert!(plan.iter().any(|op| op.operation == "email_list"));
        assert!(plan.iter().any(|op| op.operation == "contact_list"));
        assert!(plan.windows(2).all(|w| w[0].priority <= w[1].priority));
    }

    proptest! {
        #[test]
        fn prop_key_stable_under_shuffled_maps(
            pairs in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 1..8)
        ) {
            let forward: serde_json::Map<String, Value> = pairs
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let reversed: serde_json::Map<String, Value> = pairs
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();

            let a = generate_cache_key("acc", "email_list", Some(&Value::Object(forward)));
            let b = generate_cache_key("acc", "email_list", Some(&Value::Object(reversed)));
            prop_assert_eq!(a, b);
        }
    }
}
