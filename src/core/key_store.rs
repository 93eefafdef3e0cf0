use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::Mutex;

/// A note attached to a key by an admin, newest appended last.
#[derive(Debug, Clone)]
pub struct Note {
    pub text: String,
    pub at: i64,
}

/// Per-key quota limits. `0` means "no limit" throughout.
#[derive(Debug, Clone, Default)]
pub struct QuotaConfig {
    pub daily_call_limit: u64,
    pub monthly_call_limit: u64,
    pub daily_credit_limit: u64,
    pub monthly_credit_limit: u64,
    pub hourly_call_limit: u64,
    pub hourly_credit_limit: u64,
}

/// Mutable quota counters, reset lazily on first access past a boundary.
#[derive(Debug, Clone, Default)]
pub struct QuotaCounters {
    pub daily_calls: u64,
    pub monthly_calls: u64,
    pub daily_credits: u64,
    pub monthly_credits: u64,
    pub last_reset_day: String,
    pub last_reset_month: String,
}

/// The full record for one API key. Guarded by the owning `KeyStore`'s
/// per-key mutex — every mutation (credit debit, quota counters,
/// lifecycle flags) happens under that lock, which is the serialization
/// boundary the admission pipeline relies on.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub name: String,
    pub credits: i64,
    pub total_spent: u64,
    pub total_calls: u64,
    pub active: bool,
    pub suspended: bool,
    pub expires_at: Option<i64>,
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub scopes: HashSet<String>,
    pub sandbox_policy: Option<String>,
    pub spending_limit: Option<u64>,
    pub shadow_mode: bool,
    pub allow_negative_balance: bool,
    pub quota: QuotaConfig,
    pub quota_counters: QuotaCounters,
    pub tags: HashMap<String, String>,
    pub notes: Vec<Note>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KeyRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        KeyRecord {
            name: name.into(),
            credits: 0,
            total_spent: 0,
            total_calls: 0,
            active: true,
            suspended: false,
            expires_at: None,
            namespace: None,
            group: None,
            allowed_tools: HashSet::new(),
            denied_tools: HashSet::new(),
            scopes: HashSet::new(),
            sandbox_policy: None,
            spending_limit: None,
            shadow_mode: false,
            allow_negative_balance: false,
            quota: QuotaConfig::default(),
            quota_counters: QuotaCounters::default(),
            tags: HashMap::new(),
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Display-safe key prefix: first 10 chars followed by an ellipsis.
    pub fn display_prefix(full_key: &str) -> String {
        let take = full_key.chars().take(10).collect::<String>();
        format!("{}...", take)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generates an opaque bearer key: a stable prefix plus 24 random bytes
/// hex-encoded, well over the 128 bits of entropy the data model requires.
pub fn generate_key(prefix: &str) -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}_{}", prefix, hex::encode(bytes))
}

/// Owns every key record plus the alias table mapping a short alias string
/// to the full bearer key it stands in for. Each record is wrapped in its
/// own `tokio::sync::Mutex` so that concurrent mutations on distinct keys
/// never contend. `Gate::evaluate` and `Proxy::execute` each acquire and
/// release this lock independently rather than holding one guard across
/// both calls — see the proxy module notes for why that is still safe in
/// practice.
pub struct KeyStore {
    keys: DashMap<String, Arc<Mutex<KeyRecord>>>,
    aliases: DashMap<String, String>,
    id_counter: AtomicU64,
}

impl KeyStore {
    pub fn new() -> Self {
        KeyStore {
            keys: DashMap::new(),
            aliases: DashMap::new(),
            id_counter: AtomicU64::new(1),
        }
    }

    pub fn create_key(&self, full_key: String, record: KeyRecord) {
        self.id_counter.fetch_add(1, Ordering::Relaxed);
        self.keys.insert(full_key, Arc::new(Mutex::new(record)));
    }

    /// Resolves an identifier that may be a full key or a registered alias
    /// to the `Arc<Mutex<KeyRecord>>` handle, if any.
    pub fn resolve(&self, identifier: &str) -> Option<Arc<Mutex<KeyRecord>>> {
        if let Some(entry) = self.keys.get(identifier) {
            return Some(entry.clone());
        }
        let full = self.aliases.get(identifier).map(|e| e.clone())?;
        self.keys.get(&full).map(|e| e.clone())
    }

    pub fn create_alias(&self, alias: String, full_key: String) -> bool {
        if !self.keys.contains_key(&full_key) {
            return false;
        }
        self.aliases.insert(alias, full_key);
        true
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        self.aliases.remove(alias).is_some()
    }

    pub fn delete_key(&self, full_key: &str) -> bool {
        self.keys.remove(full_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All full keys sharing the given group, for usage roll-up queries.
    pub async fn keys_in_group(&self, group: &str) -> Vec<String> {
        let mut out = Vec::new();
        for entry in self.keys.iter() {
            let rec = entry.value().lock().await;
            if rec.group.as_deref() == Some(group) {
                out.push(entry.key().clone());
            }
        }
        out
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_resolve() {
        let store = KeyStore::new();
        store.create_key("key_abc".into(), KeyRecord::new("alice"));
        let handle = store.resolve("key_abc").expect("key found");
        let rec = handle.lock().await;
        assert_eq!(rec.name, "alice");
    }

    #[tokio::test]
    async fn alias_resolves_to_same_record() {
        let store = KeyStore::new();
        store.create_key("key_abc".into(), KeyRecord::new("alice"));
        assert!(store.create_alias("alice-alias".into(), "key_abc".into()));
        let handle = store.resolve("alice-alias").expect("alias resolves");
        assert_eq!(handle.lock().await.name, "alice");
    }

    #[tokio::test]
    async fn unknown_alias_does_not_resolve() {
        let store = KeyStore::new();
        assert!(!store.create_alias("ghost".into(), "missing".into()));
        assert!(store.resolve("ghost").is_none());
    }

    #[test]
    fn display_prefix_truncates() {
        let full = "key_0123456789abcdef";
        assert_eq!(KeyRecord::display_prefix(full), "key_012345...");
    }

    #[tokio::test]
    async fn group_rollup_lists_members() {
        let store = KeyStore::new();
        let mut a = KeyRecord::new("a");
        a.group = Some("team1".into());
        let mut b = KeyRecord::new("b");
        b.group = Some("team1".into());
        let c = KeyRecord::new("c");
        store.create_key("ka".into(), a);
        store.create_key("kb".into(), b);
        store.create_key("kc".into(), c);
        let mut members = store.keys_in_group("team1").await;
        members.sort();
        assert_eq!(members, vec!["ka".to_string(), "kb".to_string()]);
    }
}
