//! Backing store for routed messages.
//!
//! Modeled on a key/value server with list and set values and per-key
//! expiry. Every operation touches a single key, so each one is atomic on
//! its own. Expired keys are dropped lazily on access.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from the backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Key {key} holds a {found}, not a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Single-key list and set operations with expiry.
pub trait MessageStore: Send + Sync {
    /// Append to the list at `key`, returning the new length.
    fn push(&self, key: &str, value: String) -> Result<usize, StoreError>;

    /// Every element of the list at `key`, oldest first.
    fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Set a time-to-live on `key`. Returns false if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add a member to the set at `key`. Returns true if it was new.
    fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members of the set at `key`, sorted.
    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Remove `key`. Returns true if it existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining time-to-live of `key`, if it has one.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

#[derive(Debug, Clone)]
enum Value {
    List(Vec<String>),
    Set(BTreeSet<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::List(_) => "list",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    fn poisoned<T>(_: T) -> StoreError {
        StoreError::Unavailable("lock poisoned".to_string())
    }
}

impl MessageStore for InMemoryStore {
    fn push(&self, key: &str, value: String) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::List(list) => {
                list.push(value);
                Ok(list.len())
            }
            other => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
                found: other.kind(),
            }),
        }
    }

    fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().map_err(Self::poisoned)?;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => match &entry.value {
                Value::List(list) => Ok(list.clone()),
                other => Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: "list",
                    found: other.kind(),
                }),
            },
            _ => Ok(Vec::new()),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            other => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "set",
                found: other.kind(),
            }),
        }
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().map_err(Self::poisoned)?;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                other => Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: "set",
                    found: other.kind(),
                }),
            },
            _ => Ok(Vec::new()),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired(now)))
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let entries = self.entries.read().map_err(Self::poisoned)?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}
