//! # Vertex Fingerprint Cache
//!
//! The upstream happily re-delivers metadata notifications that change
//! nothing the mirror cares about. This bounded LRU remembers the last-seen
//! fingerprint per vertex so those can be acked without a store read. A miss
//! is always safe -- it just means the classifier runs and says `Ignore`.
//!
//! Only the single-threaded dispatch loop touches the cache, so there is no
//! locking here at all.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::ledger::{TxFingerprint, VertexHash};

/// Bounded LRU of `vertex hash -> fingerprint`.
pub struct TxCache {
    inner: LruCache<VertexHash, TxFingerprint>,
}

impl TxCache {
    /// Creates a cache holding at most `capacity` entries. A zero capacity
    /// is clamped to one -- an uncacheable cache is never what anyone means.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to >= 1");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// `true` if the cached fingerprint for `hash` equals `fingerprint` --
    /// the notification carries nothing new. Touches the entry's recency.
    pub fn is_unchanged(&mut self, hash: &str, fingerprint: &TxFingerprint) -> bool {
        self.inner.get(hash) == Some(fingerprint)
    }

    /// Records the latest fingerprint for a vertex, evicting the oldest
    /// entry if the cache is full.
    pub fn insert(&mut self, hash: VertexHash, fingerprint: TxFingerprint) {
        self.inner.put(hash, fingerprint);
    }

    /// Forgets one vertex. Used when the upstream removes a vertex -- a
    /// later re-announcement with identical metadata must not be skipped.
    pub fn remove(&mut self, hash: &str) {
        self.inner.pop(hash);
    }

    /// Drops every entry. Used on machine reset, where stale fingerprints
    /// could mask events the fresh stream re-delivers.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
