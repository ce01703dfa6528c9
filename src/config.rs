// src/config.rs
use crate::{QueueError, Result, RetryPolicy, RetryPolicyPatch};
use std::collections::HashMap;

pub const MAX_RETRIES: &str = "max_retries";
pub const BACKOFF_BASE: &str = "backoff_base";
pub const BACKOFF_FACTOR: &str = "backoff_factor";

pub const CONFIG_KEYS: [&str; 3] = [MAX_RETRIES, BACKOFF_BASE, BACKOFF_FACTOR];

/// Options for connecting to the shared store
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "queuectl".to_string(),
        }
    }
}

impl QueueOptions {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Effective retry defaults: stored values laid over the built-in ones.
pub fn policy_from_values(values: &HashMap<String, String>) -> Result<RetryPolicy> {
    let mut patch = RetryPolicyPatch::default();
    for (key, raw) in values {
        set_patch_value(&mut patch, key, raw)?;
    }
    let policy = patch.apply_to(RetryPolicy::default());
    validate_policy(&policy)?;
    Ok(policy)
}

/// Parse one `key = value` setting. Dashes in the key are accepted for underscores.
pub fn patch_from_pair(key: &str, raw: &str) -> Result<RetryPolicyPatch> {
    let mut patch = RetryPolicyPatch::default();
    set_patch_value(&mut patch, &key.trim().replace('-', "_"), raw)?;
    Ok(patch)
}

fn set_patch_value(patch: &mut RetryPolicyPatch, key: &str, raw: &str) -> Result<()> {
    match key {
        MAX_RETRIES => patch.max_retries = Some(parse_value(key, raw)?),
        BACKOFF_BASE => patch.backoff_base = Some(parse_value(key, raw)?),
        BACKOFF_FACTOR => patch.backoff_factor = Some(parse_value(key, raw)?),
        other => {
            return Err(QueueError::Config(format!(
                "unknown configuration key '{}' (expected one of {})",
                other,
                CONFIG_KEYS.join(", ")
            )))
        }
    }
    Ok(())
}

/// Store representation of a patch.
pub fn patch_values(patch: &RetryPolicyPatch) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(v) = patch.max_retries {
        out.push((MAX_RETRIES.to_string(), v.to_string()));
    }
    if let Some(v) = patch.backoff_base {
        out.push((BACKOFF_BASE.to_string(), v.to_string()));
    }
    if let Some(v) = patch.backoff_factor {
        out.push((BACKOFF_FACTOR.to_string(), v.to_string()));
    }
    out
}

pub fn policy_values(policy: &RetryPolicy) -> Vec<(String, String)> {
    patch_values(&RetryPolicyPatch {
        max_retries: Some(policy.max_retries),
        backoff_base: Some(policy.backoff_base),
        backoff_factor: Some(policy.backoff_factor),
    })
}

pub fn validate_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.backoff_factor == 0 {
        return Err(QueueError::Config(
            "backoff_factor must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        QueueError::Config(format!(
            "'{}' is not a valid value for {}",
            raw, key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_store_yields_builtin_defaults() {
        assert_eq!(
            policy_from_values(&HashMap::new()).unwrap(),
            RetryPolicy::default()
        );
    }

    #[test]
    fn stored_values_override_defaults() {
        let policy = policy_from_values(&values(&[("max_retries", "5"), ("backoff_base", "1")]))
            .unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_base, 1);
        assert_eq!(policy.backoff_factor, 2);
    }

    #[test]
    fn bad_values_are_config_errors() {
        assert!(matches!(
            policy_from_values(&values(&[("max_retries", "many")])),
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            policy_from_values(&values(&[("priority", "1")])),
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            policy_from_values(&values(&[("backoff_factor", "0")])),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn single_pair_accepts_dashed_keys() {
        let patch = patch_from_pair("max-retries", "5").unwrap();
        assert_eq!(patch.max_retries, Some(5));
        assert_eq!(patch.backoff_base, None);
        assert!(patch_from_pair("retries", "5").is_err());
        assert!(patch_from_pair("backoff_base", "-1").is_err());
    }

    #[test]
    fn patch_writes_only_present_keys() {
        let patch = RetryPolicyPatch {
            backoff_factor: Some(3),
            ..Default::default()
        };
        assert_eq!(
            patch_values(&patch),
            vec![("backoff_factor".to_string(), "3".to_string())]
        );
        assert_eq!(policy_values(&RetryPolicy::default()).len(), CONFIG_KEYS.len());
    }
}
