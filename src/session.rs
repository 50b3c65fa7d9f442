//! Sensitive-data session store backing reversible PII redaction.
//!
//! Sharded the same way the teacher shards its stats counters: fixed
//! number of buckets, each behind its own lock, selected by a hash of the
//! session id so unrelated sessions never contend on the same mutex.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

const SHARD_COUNT: usize = 16;
const PLACEHOLDER_SENTINEL: char = '#';

/// One redacted value and the metadata needed to describe it in an alert.
#[derive(Debug, Clone)]
pub struct SensitiveRecord {
    pub original_value: String,
    pub service_tag: String,
    pub kind: String,
    pub placeholder_token: String,
}

struct Session {
    records: HashMap<String, SensitiveRecord>,
    last_touched: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            last_touched: Instant::now(),
        }
    }
}

struct Shard {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

/// Shared, sharded store mapping `session_id -> (placeholder -> record)`.
pub struct SessionStore {
    shards: Vec<Shard>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        let shards = (0..SHARD_COUNT).map(|_| Shard::new()).collect();
        Arc::new(Self {
            shards,
            idle_timeout,
        })
    }

    fn shard_for(&self, session_id: &str) -> &Shard {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in session_id.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// Redacts `original_value`, allocating a fresh placeholder token and
    /// recording the mapping for later unredaction. Creates the session
    /// lazily if this is its first redaction.
    pub fn store(
        &self,
        session_id: &str,
        original_value: String,
        service_tag: String,
        kind: String,
    ) -> String {
        let placeholder_token = wrap_placeholder(&Uuid::new_v4());
        let record = SensitiveRecord {
            original_value,
            service_tag,
            kind,
            placeholder_token: placeholder_token.clone(),
        };

        let shard = self.shard_for(session_id);
        let mut sessions = shard.sessions.write().expect("session shard poisoned");
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(Session::new);
        session.records.insert(placeholder_token.clone(), record);
        session.last_touched = Instant::now();
        placeholder_token
    }

    /// Looks up the original value for a placeholder within a session.
    pub fn get_original(&self, session_id: &str, placeholder: &str) -> Option<String> {
        let shard = self.shard_for(session_id);
        let sessions = shard.sessions.read().expect("session shard poisoned");
        sessions
            .get(session_id)?
            .records
            .get(placeholder)
            .map(|r| r.original_value.clone())
    }

    /// Snapshot of every placeholder mapping for a session, for bulk
    /// unredaction passes that don't want to take the lock per lookup.
    pub fn get_by_session(&self, session_id: &str) -> HashMap<String, String> {
        let shard = self.shard_for(session_id);
        let sessions = shard.sessions.read().expect("session shard poisoned");
        sessions
            .get(session_id)
            .map(|s| {
                s.records
                    .iter()
                    .map(|(k, v)| (k.clone(), v.original_value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn drop_session(&self, session_id: &str) {
        let shard = self.shard_for(session_id);
        let mut sessions = shard.sessions.write().expect("session shard poisoned");
        sessions.remove(session_id);
    }

    /// Removes sessions idle past the configured timeout. Intended to be
    /// called periodically from a background task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut sessions = shard.sessions.write().expect("session shard poisoned");
            sessions.retain(|_, session| now.duration_since(session.last_touched) < self.idle_timeout);
        }
    }
}

fn wrap_placeholder(id: &Uuid) -> String {
    format!("{PLACEHOLDER_SENTINEL}{id}{PLACEHOLDER_SENTINEL}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_get_original_round_trips() {
        let store = SessionStore::new(Duration::from_secs(60));
        let placeholder = store.store("s1", "john@example.com".into(), "pii".into(), "email".into());
        assert!(placeholder.starts_with('#') && placeholder.ends_with('#'));
        assert_eq!(
            store.get_original("s1", &placeholder).as_deref(),
            Some("john@example.com")
        );
    }

    #[test]
    fn unknown_session_or_placeholder_returns_none() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert!(store.get_original("nope", "#x#").is_none());
        let placeholder = store.store("s1", "a".into(), "pii".into(), "email".into());
        assert!(store.get_original("other-session", &placeholder).is_none());
    }

    #[test]
    fn get_by_session_snapshots_all_mappings() {
        let store = SessionStore::new(Duration::from_secs(60));
        let p1 = store.store("s1", "a@example.com".into(), "pii".into(), "email".into());
        let p2 = store.store("s1", "1.2.3.4".into(), "pii".into(), "ip".into());
        let snapshot = store.get_by_session("s1");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&p1).unwrap(), "a@example.com");
        assert_eq!(snapshot.get(&p2).unwrap(), "1.2.3.4");
    }

    #[test]
    fn drop_session_removes_everything() {
        let store = SessionStore::new(Duration::from_secs(60));
        let placeholder = store.store("s1", "a".into(), "pii".into(), "email".into());
        store.drop_session("s1");
        assert!(store.get_original("s1", &placeholder).is_none());
    }

    #[test]
    fn sweep_expired_evicts_idle_sessions() {
        let store = SessionStore::new(Duration::from_millis(1));
        store.store("s1", "a".into(), "pii".into(), "email".into());
        std::thread::sleep(Duration::from_millis(20));
        store.sweep_expired();
        assert!(store.get_by_session("s1").is_empty());
    }

    #[test]
    fn placeholders_are_unique() {
        let store = SessionStore::new(Duration::from_secs(60));
        let p1 = store.store("s1", "a".into(), "pii".into(), "email".into());
        let p2 = store.store("s1", "a".into(), "pii".into(), "email".into());
        assert_ne!(p1, p2);
    }
}
