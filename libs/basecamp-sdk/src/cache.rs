//! In-memory ETag store backing conditional GET revalidation.
//!
//! Entries are keyed by the request URL and an isolation token derived from
//! the `Authorization` header, so responses fetched with one credential are
//! never replayed to another.

use bytes::Bytes;
use http::HeaderValue;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Marker header set on responses rebuilt from a cached body after a 304.
///
/// Informational only: the cache layer strips it from network responses, and
/// hit detection reads the [`CacheHit`] extension.
pub const CACHE_STATUS_HEADER: &str = "x-basecamp-cache";

/// Response extension present only on bodies replayed by the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheHit;

/// Distinct `Authorization` values whose digests are remembered.
const HASH_MEMO_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    isolation: String,
    url: String,
}

impl CacheKey {
    pub(crate) fn new(isolation: String, url: impl Into<String>) -> Self {
        Self {
            isolation,
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheEntry {
    pub(crate) etag: HeaderValue,
    pub(crate) body: Bytes,
}

/// Insertion-ordered map that evicts its oldest key once full.
///
/// Re-inserting a key moves it to the newest position.
struct BoundedFifo<K, V> {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> BoundedFifo<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some((seq, _)) = self.entries.remove(&key) {
            self.order.remove(&seq);
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, value));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Bounded response cache shared by all clones of a client.
pub struct CacheStore {
    entries: Mutex<BoundedFifo<CacheKey, CacheEntry>>,
    digests: Mutex<BoundedFifo<HeaderValue, String>>,
}

impl CacheStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedFifo::new(capacity)),
            digests: Mutex::new(BoundedFifo::new(HASH_MEMO_CAPACITY)),
        }
    }

    /// Number of cached responses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.lock().capacity
    }

    /// Drop every cached response.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Isolation token for a credential: hex SHA-256 of the header value,
    /// or the empty string for unauthenticated requests.
    pub(crate) fn isolation_token(&self, authorization: Option<&HeaderValue>) -> String {
        let Some(value) = authorization else {
            return String::new();
        };
        let mut digests = self.digests.lock();
        if let Some(hex) = digests.get(value) {
            return hex.clone();
        }
        let hex = hex::encode(Sha256::digest(value.as_bytes()));
        digests.insert(value.clone(), hex.clone());
        hex
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.lock().insert(key, entry);
    }

    #[cfg(test)]
    fn memoized_digests(&self) -> usize {
        self.digests.lock().len()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}
