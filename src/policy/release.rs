//! Result-release gate.
//!
//! Runs after a script finishes successfully and before anything is
//! persisted or returned: enforces the minimum cohort size, scans the
//! nested result for individual-level identifier keys, normalizes
//! numeric precision, collapses record-shaped lists, and optionally
//! perturbs numeric summaries with Laplace noise.

use crate::config::PrivacyConfig;
use rand::Rng;
use serde_json::{Map, Value, json};

/// Keys whose presence anywhere in a result auto-blocks release.
const DENY_KEY_FRAGMENTS: &[&str] = &[
    "subject_id",
    "patient_id",
    "participant_id",
    "ssn",
    "email",
    "phone",
    "address",
    "birth_date",
    "dob",
];

/// Short keys matched exactly rather than by fragment, so that e.g.
/// `sample_size` or `name_length_mean` are not swept up.
const DENY_KEYS_EXACT: &[&str] = &["id", "name"];

/// Integer keys that receive noise when noise is enabled.
const NOISED_COUNT_KEYS: &[&str] = &["count", "n", "size"];

/// Lists longer than the cohort threshold survive only if they look like
/// a small aggregate of scalars no longer than this.
const AGGREGATE_LIST_MAX: usize = 32;

const MAX_SCAN_DEPTH: usize = 6;

/// Effective release policy for one job: node defaults with the
/// catalog's cohort override applied.
#[derive(Debug, Clone)]
pub struct ReleasePolicy {
    pub min_cohort_size: i64,
    pub result_precision: u32,
    pub enable_noise: bool,
    pub noise_epsilon: f64,
}

impl ReleasePolicy {
    pub fn new(privacy: &PrivacyConfig, catalog_min_cohort: Option<i64>) -> Self {
        Self {
            min_cohort_size: catalog_min_cohort.unwrap_or(privacy.min_cohort_size),
            result_precision: privacy.result_precision,
            enable_noise: privacy.enable_noise,
            noise_epsilon: privacy.noise_epsilon,
        }
    }

    /// Policy parameters echoed into blocked results and audit rows.
    pub fn describe(&self) -> Value {
        json!({
            "min_cohort_size": self.min_cohort_size,
            "result_precision": self.result_precision,
            "noise_enabled": self.enable_noise,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ReleaseDecision {
    Released(Value),
    Blocked { reason: String },
}

/// Gate one result. `cohort_n` is the number of underlying records the
/// result was computed from; `None` means it could not be established,
/// which blocks by itself.
pub fn release(policy: &ReleasePolicy, result: &Value, cohort_n: Option<i64>) -> ReleaseDecision {
    let Some(n) = cohort_n else {
        return ReleaseDecision::Blocked {
            reason: "cohort size unknown: result has no sample_size and the catalog \
                     has no tabular record count"
                .to_string(),
        };
    };

    if n < policy.min_cohort_size {
        return ReleaseDecision::Blocked {
            reason: format!(
                "cohort size ({n}) below minimum ({})",
                policy.min_cohort_size
            ),
        };
    }

    if let Some(key) = find_identifier_key(result, 0) {
        return ReleaseDecision::Blocked {
            reason: format!("individual-level data not permitted: result contains key '{key}'"),
        };
    }

    ReleaseDecision::Released(sanitize_value(policy, None, result))
}

/// The payload persisted as `result_data` for blocked jobs: the reason
/// and the policy parameters, never any original values.
pub fn blocked_payload(policy: &ReleasePolicy, reason: &str) -> Value {
    json!({
        "message": format!("Results blocked: {reason}"),
        "policy": policy.describe(),
    })
}

fn find_identifier_key(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_SCAN_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let lower = key.to_lowercase();
                if DENY_KEYS_EXACT.contains(&lower.as_str())
                    || DENY_KEY_FRAGMENTS.iter().any(|f| lower.contains(f))
                {
                    return Some(key.clone());
                }
                if let Some(hit) = find_identifier_key(child, depth + 1) {
                    return Some(hit);
                }
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .find_map(|item| find_identifier_key(item, depth + 1)),
        _ => None,
    }
}

fn sanitize_value(policy: &ReleasePolicy, key: Option<&str>, value: &Value) -> Value {
    match value {
        Value::Number(num) => sanitize_number(policy, key, num),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), sanitize_value(policy, Some(k), v));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if items.len() > policy.min_cohort_size.max(0) as usize
                && !is_scalar_aggregate(items)
            {
                Value::String(format!("<list of {} items>", items.len()))
            } else {
                Value::Array(
                    items
                        .iter()
                        .map(|item| sanitize_value(policy, key, item))
                        .collect(),
                )
            }
        }
        other => other.clone(),
    }
}

fn sanitize_number(policy: &ReleasePolicy, key: Option<&str>, num: &serde_json::Number) -> Value {
    if num.is_i64() || num.is_u64() {
        // Integer counts pass through, optionally perturbed.
        let value = num.as_i64().unwrap_or(i64::MAX);
        let noised = if policy.enable_noise && key.is_some_and(is_count_key) {
            (value + laplace(1.0 / policy.noise_epsilon) as i64).max(0)
        } else {
            value
        };
        return Value::from(noised);
    }

    let mut value = num.as_f64().unwrap_or(0.0);
    if policy.enable_noise {
        value += laplace(1.0 / policy.noise_epsilon);
    }
    let rounded = round_to(value, policy.result_precision);
    serde_json::Number::from_f64(rounded)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn is_count_key(key: &str) -> bool {
    NOISED_COUNT_KEYS.contains(&key.to_lowercase().as_str())
}

fn is_scalar_aggregate(items: &[Value]) -> bool {
    items.len() <= AGGREGATE_LIST_MAX
        && items
            .iter()
            .all(|v| matches!(v, Value::Number(_) | Value::Bool(_) | Value::Null))
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

fn laplace(scale: f64) -> f64 {
    let u: f64 = rand::thread_rng().gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_policy(min_cohort: i64) -> ReleasePolicy {
        ReleasePolicy {
            min_cohort_size: min_cohort,
            result_precision: 3,
            enable_noise: false,
            noise_epsilon: 1.0,
        }
    }

    #[test]
    fn blocks_small_cohorts_with_explicit_reason() {
        let policy = quiet_policy(10);
        let result = json!({"sample_size": 3, "age_mean": 45.2});

        match release(&policy, &result, Some(3)) {
            ReleaseDecision::Blocked { reason } => {
                assert!(reason.contains("cohort size (3)"));
                assert!(reason.contains("minimum (10)"));
            }
            ReleaseDecision::Released(_) => panic!("expected block"),
        }
    }

    #[test]
    fn blocks_unknown_cohorts() {
        let policy = quiet_policy(5);
        match release(&policy, &json!({"x": 1.0}), None) {
            ReleaseDecision::Blocked { reason } => {
                assert!(reason.contains("cohort size unknown"))
            }
            ReleaseDecision::Released(_) => panic!("expected block"),
        }
    }

    #[test]
    fn releases_and_rounds_floats() {
        let policy = quiet_policy(5);
        let result = json!({"sample_size": 150, "age_mean": 45.20004, "ratio": 0.123456});

        match release(&policy, &result, Some(150)) {
            ReleaseDecision::Released(out) => {
                assert_eq!(out["sample_size"], json!(150));
                assert_eq!(out["age_mean"], json!(45.2));
                assert_eq!(out["ratio"], json!(0.123));
            }
            ReleaseDecision::Blocked { reason } => panic!("blocked: {reason}"),
        }
    }

    #[test]
    fn blocks_identifier_keys_anywhere() {
        let policy = quiet_policy(1);
        let result = json!({
            "summary": {"stats": [{"patient_id": "p-1", "score": 0.4}]}
        });

        match release(&policy, &result, Some(100)) {
            ReleaseDecision::Blocked { reason } => {
                assert!(reason.contains("patient_id"));
            }
            ReleaseDecision::Released(_) => panic!("expected block"),
        }
    }

    #[test]
    fn sample_size_is_not_an_identifier() {
        let policy = quiet_policy(1);
        let result = json!({"sample_size": 20, "filename_count": 2});
        assert!(matches!(
            release(&policy, &result, Some(20)),
            ReleaseDecision::Released(_)
        ));
    }

    #[test]
    fn collapses_record_shaped_lists() {
        let policy = quiet_policy(3);
        let rows: Vec<Value> = (0..10).map(|i| json!({"row": i})).collect();
        let result = json!({"rows": rows, "bins": [1, 2, 3, 4, 5]});

        match release(&policy, &result, Some(100)) {
            ReleaseDecision::Released(out) => {
                assert_eq!(out["rows"], json!("<list of 10 items>"));
                // Short scalar aggregates survive even above the threshold.
                assert_eq!(out["bins"], json!([1, 2, 3, 4, 5]));
            }
            ReleaseDecision::Blocked { reason } => panic!("blocked: {reason}"),
        }
    }

    #[test]
    fn noise_perturbs_floats_but_keeps_precision() {
        let policy = ReleasePolicy {
            enable_noise: true,
            ..quiet_policy(1)
        };
        let result = json!({"mean": 10.0});

        match release(&policy, &result, Some(50)) {
            ReleaseDecision::Released(out) => {
                let mean = out["mean"].as_f64().unwrap();
                // Laplace(1.0) noise stays close with overwhelming probability.
                assert!((mean - 10.0).abs() < 25.0);
                let scaled = mean * 1000.0;
                assert!((scaled - scaled.round()).abs() < 1e-6);
            }
            ReleaseDecision::Blocked { reason } => panic!("blocked: {reason}"),
        }
    }

    #[test]
    fn blocked_payload_carries_reason_and_policy() {
        let policy = quiet_policy(10);
        let payload = blocked_payload(&policy, "cohort size (3) below minimum (10)");
        assert!(
            payload["message"]
                .as_str()
                .unwrap()
                .contains("cohort size (3)")
        );
        assert_eq!(payload["policy"]["min_cohort_size"], json!(10));
    }
}
