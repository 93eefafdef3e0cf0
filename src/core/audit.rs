use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One append-only entry in the hash chain. `hash` covers `id`,
/// `timestamp`, `action`, `actor`, `target`, canonical-JSON `details`, and
/// `previous_hash`.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: i64,
    pub action: String,
    pub actor: String,
    pub actor_type: Option<String>,
    pub target: String,
    pub target_type: Option<String>,
    pub source: Option<String>,
    pub details: Value,
    pub previous_hash: String,
    pub hash: String,
}

/// Canonical JSON for hashing: sorted object keys, no whitespace, stable
/// number encoding — required so two implementations hash the same
/// `details` identically. `serde_json::Value` backed by a `BTreeMap`-like
/// sort is achieved here by re-serializing through a sorted-key walk.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn compute_hash(
    id: u64,
    timestamp: i64,
    action: &str,
    actor: &str,
    target: &str,
    details: &Value,
    previous_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string());
    hasher.update(timestamp.to_string());
    hasher.update(action);
    hasher.update(actor);
    hasher.update(target);
    hasher.update(canonicalize(details));
    hasher.update(previous_hash);
    hex::encode(hasher.finalize())
}

#[derive(Default)]
pub struct AuditFilter<'a> {
    pub action: Option<&'a str>,
    pub actor: Option<&'a str>,
    pub target: Option<&'a str>,
}

/// Hash-chained, append-only, eviction-bounded audit trail. Chain
/// integrity is preserved within the retained window because every
/// `previous_hash` was computed at append time, before any eviction.
pub struct AuditTrail {
    max_entries: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    next_id: Mutex<u64>,
}

impl AuditTrail {
    pub fn new(max_entries: usize) -> Self {
        AuditTrail {
            max_entries: max_entries.max(1),
            entries: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn append(
        &self,
        action: impl Into<String>,
        actor: impl Into<String>,
        actor_type: Option<String>,
        target: impl Into<String>,
        target_type: Option<String>,
        source: Option<String>,
        details: Value,
        now: i64,
    ) -> AuditEntry {
        let action = action.into();
        let actor = actor.into();
        let target = target.into();

        let mut entries = self.entries.lock();
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;

        let previous_hash = entries
            .back()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| "0".to_string());
        let hash = compute_hash(id, now, &action, &actor, &target, &details, &previous_hash);

        let entry = AuditEntry {
            id,
            timestamp: now,
            action,
            actor,
            actor_type,
            target,
            target_type,
            source,
            details,
            previous_hash,
            hash,
        };
        entries.push_back(entry.clone());
        if entries.len() > self.max_entries {
            entries.pop_front();
        }
        entry
    }

    /// Recomputes each entry's hash and compares it to the stored value,
    /// and checks `entry[i].previous_hash == entry[i-1].hash` for every
    /// adjacent pair in the retained window.
    pub fn verify_chain(&self) -> bool {
        let entries = self.entries.lock();
        let mut prev_hash: Option<String> = None;
        for entry in entries.iter() {
            if let Some(prev) = &prev_hash {
                if &entry.previous_hash != prev {
                    return false;
                }
            }
            let recomputed = compute_hash(
                entry.id,
                entry.timestamp,
                &entry.action,
                &entry.actor,
                &entry.target,
                &entry.details,
                &entry.previous_hash,
            );
            if recomputed != entry.hash {
                return false;
            }
            prev_hash = Some(entry.hash.clone());
        }
        true
    }

    /// Newest-first, filtered, offset/limit paginated query.
    pub fn query(&self, filter: &AuditFilter, offset: usize, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .filter(|e| filter.action.map_or(true, |a| e.action == a))
            .filter(|e| filter.actor.map_or(true, |a| e.actor == a))
            .filter(|e| filter.target.map_or(true, |t| e.target == t))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_entry_has_zero_previous_hash() {
        let trail = AuditTrail::new(100);
        let entry = trail.append("create_key", "admin", None, "k1", None, None, json!({}), 0);
        assert_eq!(entry.previous_hash, "0");
    }

    #[test]
    fn chain_links_and_verifies() {
        let trail = AuditTrail::new(100);
        trail.append("create_key", "admin", None, "k1", None, None, json!({"a": 1}), 0);
        trail.append("suspend_key", "admin", None, "k1", None, None, json!({"b": 2}), 1);
        trail.append("revoke_key", "admin", None, "k1", None, None, json!({}), 2);
        assert!(trail.verify_chain());
    }

    #[test]
    fn canonical_json_is_order_independent() {
        let trail = AuditTrail::new(100);
        let e1 = trail.append("a", "admin", None, "k1", None, None, json!({"z": 1, "a": 2}), 0);
        let trail2 = AuditTrail::new(100);
        let e2 = trail2.append("a", "admin", None, "k1", None, None, json!({"a": 2, "z": 1}), 0);
        assert_eq!(e1.hash, e2.hash);
    }

    #[test]
    fn query_is_newest_first_with_pagination() {
        let trail = AuditTrail::new(100);
        trail.append("create_key", "admin", None, "k1", None, None, json!({}), 0);
        trail.append("create_key", "admin", None, "k2", None, None, json!({}), 1);
        trail.append("create_key", "admin", None, "k3", None, None, json!({}), 2);
        let results = trail.query(&AuditFilter::default(), 0, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].target, "k3");
        assert_eq!(results[1].target, "k2");
    }

    #[test]
    fn eviction_keeps_remaining_chain_valid() {
        let trail = AuditTrail::new(2);
        trail.append("a", "admin", None, "k1", None, None, json!({}), 0);
        trail.append("b", "admin", None, "k1", None, None, json!({}), 1);
        trail.append("c", "admin", None, "k1", None, None, json!({}), 2);
        assert_eq!(trail.len(), 2);
        assert!(trail.verify_chain());
    }

    #[test]
    fn ids_are_strictly_monotonic() {
        let trail = AuditTrail::new(100);
        let e1 = trail.append("a", "admin", None, "k1", None, None, json!({}), 0);
        let e2 = trail.append("a", "admin", None, "k1", None, None, json!({}), 1);
        assert!(e2.id > e1.id);
    }
}
