use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::glob::glob_match;
use crate::kv::{KeyValueStore, StoreError};

/// In-process [`KeyValueStore`] backend.
///
/// Used by tests and by deployments that run without a shared store. Counters
/// and locks are only visible to the local process, so the cross-instance
/// guarantees of the Redis backend do not apply here.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    windows: HashMap<String, WindowEntry>,
    sets: HashMap<String, SetEntry>,
    locks: HashMap<String, LockEntry>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct WindowEntry {
    entries: Vec<(i64, String)>,
    expires_at: Option<Instant>,
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

struct LockEntry {
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expired(expires_at: Option<Instant>, now: Instant) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn window_record(
        &self,
        key: &str,
        cutoff_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let window = inner.windows.entry(key.to_string()).or_default();
        if expired(window.expires_at, now) {
            window.entries.clear();
        }
        window.entries.retain(|(score, _)| *score >= cutoff_ms);
        window.entries.push((now_ms, member.to_string()));
        window.expires_at = Some(now + ttl);
        Ok(window.entries.len() as u64)
    }

    async fn window_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.windows.get_mut(key) {
            None => return Ok(0),
            Some(window) => {
                if !expired(window.expires_at, now) {
                    window.entries.retain(|(score, _)| *score >= cutoff_ms);
                    return Ok(window.entries.len() as u64);
                }
            }
        }
        // Window TTL elapsed; mirror the external store dropping the key.
        inner.windows.remove(key);
        Ok(0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let hit = match inner.strings.get(key) {
            None => return Ok(None),
            Some(entry) if expired(entry.expires_at, now) => None,
            Some(entry) => Some(entry.value.clone()),
        };
        if hit.is_none() {
            inner.strings.remove(key);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        for key in keys {
            let hit = inner.strings.remove(key).is_some()
                || inner.windows.remove(key).is_some()
                || inner.sets.remove(key).is_some()
                || inner.locks.remove(key).is_some();
            if hit {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let before =
            inner.strings.len() + inner.windows.len() + inner.sets.len() + inner.locks.len();
        inner.strings.retain(|key, _| !glob_match(pattern, key));
        inner.windows.retain(|key, _| !glob_match(pattern, key));
        inner.sets.retain(|key, _| !glob_match(pattern, key));
        inner.locks.retain(|key, _| !glob_match(pattern, key));
        let after =
            inner.strings.len() + inner.windows.len() + inner.sets.len() + inner.locks.len();
        Ok((before - after) as u64)
    }

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let set = inner.sets.entry(key.to_string()).or_insert_with(|| SetEntry {
            members: HashSet::new(),
            expires_at: None,
        });
        if expired(set.expires_at, now) {
            set.members.clear();
            set.expires_at = None;
        }
        set.members.insert(member.to_string());
        match ttl {
            // Expiration only ever moves forward so the set outlives its
            // longest-lived member.
            Some(t) => {
                let candidate = now + t;
                set.expires_at = match set.expires_at {
                    Some(current) if current >= candidate => Some(current),
                    _ => Some(candidate),
                };
            }
            None => set.expires_at = None,
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let members = match inner.sets.get(key) {
            None => return Ok(Vec::new()),
            Some(set) if expired(set.expires_at, now) => None,
            Some(set) => Some(set.members.iter().cloned().collect()),
        };
        match members {
            Some(members) => Ok(members),
            None => {
                inner.sets.remove(key);
                Ok(Vec::new())
            }
        }
    }

    async fn try_acquire(
        &self,
        key: &str,
        _token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(lock) = inner.locks.get(key)
            && lock.expires_at > now
        {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            LockEntry {
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.remove(key);
        Ok(())
    }
}
