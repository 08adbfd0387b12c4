//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Desired state**: What the cluster should run (expanded from releases).
//! - **Observed state**: What the cluster backend reports it is running.
//! - **Convergence**: The schedule/unschedule actions that close the gap.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A spec hash string could not be parsed.
    #[error("invalid spec hash: {0}")]
    InvalidSpecHash(String),
}

/// Convergence status for a set of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed matches desired.
    Converged,

    /// Actions are outstanding.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

const SPEC_HASH_PREFIX: &str = "sha256:";

/// A spec hash for deterministic comparison.
///
/// Used to detect when a unit's definition has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("{SPEC_HASH_PREFIX}{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SpecHash {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = s
            .strip_prefix(SPEC_HASH_PREFIX)
            .ok_or_else(|| ReconcileError::InvalidSpecHash(s.to_string()))?;

        if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReconcileError::InvalidSpecHash(s.to_string()));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for SpecHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SpecHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// The actions needed to converge observed state onto desired state.
///
/// Every key lands in exactly one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePlan<K> {
    /// Desired but not observed.
    pub create: Vec<K>,

    /// Desired and observed, but the observed spec differs, is unknown, or
    /// the caller forced a replacement.
    pub replace: Vec<K>,

    /// Observed but no longer desired.
    pub remove: Vec<K>,

    /// Desired and observed with a matching spec.
    pub unchanged: Vec<K>,
}

impl<K> ConvergencePlan<K> {
    /// Overall status of the plan.
    pub fn status(&self) -> ConvergenceStatus {
        if self.create.is_empty() && self.replace.is_empty() && self.remove.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// Number of actions the plan requires.
    pub fn action_count(&self) -> usize {
        self.create.len() + self.replace.len() + self.remove.len()
    }
}

/// Diff desired specs against observed specs.
///
/// `force` lists keys that must be replaced even when their spec matches
/// (for example, units displaced from a dead node). Forced keys that are not
/// observed are plain creates; forced keys that are not desired are removes.
pub fn plan<K>(
    desired: &BTreeMap<K, SpecHash>,
    observed: &BTreeMap<K, Option<SpecHash>>,
    force: &BTreeSet<K>,
) -> ConvergencePlan<K>
where
    K: Ord + Clone,
{
    let mut create = Vec::new();
    let mut replace = Vec::new();
    let mut unchanged = Vec::new();

    for (key, want) in desired {
        match observed.get(key) {
            None => create.push(key.clone()),
            Some(Some(have)) if have == want && !force.contains(key) => {
                unchanged.push(key.clone())
            }
            Some(_) => replace.push(key.clone()),
        }
    }

    let remove = observed
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();

    ConvergencePlan {
        create,
        replace,
        remove,
        unchanged,
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    spent: u32,
    since: Instant,
}

/// Restart budget per resource.
///
/// Each key may fail `max_retries` times within `window` of its first
/// failure; the next failure exhausts it. A window that has run out starts
/// a fresh budget.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_retries: u32,
    window: Duration,
    budgets: BTreeMap<K, Budget>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            budgets: BTreeMap::new(),
        }
    }

    fn open(&self, budget: &Budget, now: Instant) -> bool {
        now.duration_since(budget.since) <= self.window
    }

    /// Record a failure of `key`. Returns true once its budget is spent.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let fresh = Budget {
            spent: 0,
            since: now,
        };

        let budget = match self.budgets.get(key) {
            Some(budget) if self.open(budget, now) => *budget,
            _ => fresh,
        };
        let budget = Budget {
            spent: budget.spent + 1,
            ..budget
        };
        self.budgets.insert(key.clone(), budget);

        budget.spent > self.max_retries
    }

    /// Whether `key` has spent its budget in the current window.
    pub fn is_exhausted(&self, key: &K) -> bool {
        let now = Instant::now();
        self.budgets
            .get(key)
            .is_some_and(|b| self.open(b, now) && b.spent > self.max_retries)
    }

    /// Forget `key`, e.g. once it is healthy again.
    pub fn clear(&mut self, key: &K) {
        self.budgets.remove(key);
    }

    /// Drop budgets whose window has run out.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.budgets
            .retain(|_, b| now.duration_since(b.since) <= window);
    }

    pub fn tracked(&self) -> usize {
        self.budgets.len()
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default minion heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default minion check TTL.
pub const DEFAULT_MINION_TTL: Duration = Duration::from_secs(30);

/// Default retry limit per unit per window.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hash(s: &str) -> SpecHash {
        SpecHash::from_json(&serde_json::json!({ "v": s }))
    }

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_parse_roundtrip() {
        let h = hash("a");
        let parsed: SpecHash = h.to_string().parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[rstest]
    #[case("")]
    #[case("md5:abcdef")]
    #[case("sha256:zz")]
    #[case("sha256:0123456789abcdef0123456789abcde")]
    fn test_spec_hash_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<SpecHash>().is_err());
    }

    #[test]
    fn test_plan_buckets() {
        let desired = BTreeMap::from([
            ("new", hash("1")),
            ("same", hash("2")),
            ("changed", hash("3")),
            ("unknown", hash("4")),
        ]);
        let observed = BTreeMap::from([
            ("same", Some(hash("2"))),
            ("changed", Some(hash("old"))),
            ("unknown", None),
            ("gone", Some(hash("5"))),
        ]);

        let plan = plan(&desired, &observed, &BTreeSet::new());

        assert_eq!(plan.create, vec!["new"]);
        assert_eq!(plan.replace, vec!["changed", "unknown"]);
        assert_eq!(plan.remove, vec!["gone"]);
        assert_eq!(plan.unchanged, vec!["same"]);
        assert_eq!(plan.action_count(), 4);
        assert_eq!(plan.status(), ConvergenceStatus::Converging);
    }

    #[test]
    fn test_plan_forced_replace() {
        let desired = BTreeMap::from([("a", hash("1")), ("b", hash("2"))]);
        let observed = BTreeMap::from([("a", Some(hash("1"))), ("b", Some(hash("2")))]);
        let force = BTreeSet::from(["b"]);

        let plan = plan(&desired, &observed, &force);

        assert_eq!(plan.unchanged, vec!["a"]);
        assert_eq!(plan.replace, vec!["b"]);
    }

    #[test]
    fn test_plan_converged() {
        let desired = BTreeMap::from([("a", hash("1"))]);
        let observed = BTreeMap::from([("a", Some(hash("1")))]);

        let plan = plan(&desired, &observed, &BTreeSet::new());
        assert!(plan.status().is_converged());
        assert_eq!(plan.action_count(), 0);
    }

    #[test]
    fn test_retry_budget() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));
        let web = "acme.web.1".to_string();

        for _ in 0..3 {
            assert!(!tracker.record_failure(&web));
        }
        assert!(tracker.record_failure(&web));

        assert!(tracker.is_exhausted(&web));
        assert!(!tracker.is_exhausted(&"acme.web.2".to_string()));

        tracker.clear(&web);
        assert!(!tracker.is_exhausted(&web));
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn test_retry_window_resets_budget() {
        let mut tracker = RetryTracker::new(0, Duration::from_millis(10));

        assert!(tracker.record_failure(&1u32));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.is_exhausted(&1));

        tracker.prune();
        assert_eq!(tracker.tracked(), 0);
        assert!(tracker.record_failure(&1));
    }
}
