//! Time-bounded stat cache.
//!
//! Entries live in an insertion-ordered map and all share one TTL, so the
//! oldest entry always expires first. A sweep walks from the front and stops
//! at the first live entry. Re-caching a path removes and re-inserts it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::time::Instant;

/// Minimum time between two sweeps.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What a lookup learned about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// The file actually served, after index probing.
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    pub inode: u64,
    pub etag: String,
    /// File content, for small files.
    pub buffer: Option<Bytes>,
}

/// A cached lookup; `None` records that nothing servable exists.
pub(crate) type Lookup = Option<Arc<FileStat>>;

#[derive(Debug)]
struct Entry {
    lookup: Lookup,
    expires: Instant,
}

#[derive(Debug)]
pub(crate) struct StatCache {
    entries: IndexMap<String, Entry>,
    ttl: Duration,
    max_entries: usize,
    max_buffered: usize,
    buffered: usize,
    /// Buffer slots handed out to reads that have not been inserted yet.
    reserved: usize,
    next_sweep: Option<Instant>,
}

impl StatCache {
    pub(crate) fn new(ttl: Duration, max_entries: usize, max_buffered: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            ttl,
            max_entries,
            max_buffered,
            buffered: 0,
            reserved: 0,
            next_sweep: None,
        }
    }

    /// Returns the live entry for `key`.
    pub(crate) fn get(&self, key: &str, now: Instant) -> Option<Lookup> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.lookup.clone())
    }

    /// Claims room for one more file in memory. A successful claim must be
    /// paired with [`release_buffer`](Self::release_buffer) once the read
    /// has been inserted or abandoned.
    pub(crate) fn reserve_buffer(&mut self) -> bool {
        let free = self.buffered + self.reserved < self.max_buffered
            && self.entries.len() < self.max_entries;
        if free {
            self.reserved += 1;
        }
        free
    }

    pub(crate) fn release_buffer(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    pub(crate) fn insert(&mut self, key: String, lookup: Lookup, now: Instant) {
        if self.max_entries == 0 {
            return;
        }
        if let Some(old) = self.entries.shift_remove(&key) {
            self.forget(&old);
        }
        while self.entries.len() >= self.max_entries {
            match self.entries.shift_remove_index(0) {
                Some((_, old)) => self.forget(&old),
                None => break,
            }
        }
        if is_buffered(&lookup) {
            self.buffered += 1;
        }
        self.entries.insert(
            key,
            Entry {
                lookup,
                expires: now + self.ttl,
            },
        );
    }

    /// Drops expired entries from the front. Returns how many went.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, entry)) = self.entries.first() {
            if entry.expires > now {
                break;
            }
            if let Some((_, old)) = self.entries.shift_remove_index(0) {
                self.forget(&old);
            }
            evicted += 1;
        }
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        evicted
    }

    /// Sweeps if the last sweep is at least [`SWEEP_INTERVAL`] old.
    pub(crate) fn maybe_sweep(&mut self, now: Instant) -> usize {
        match self.next_sweep {
            Some(next) if now < next => 0,
            _ => self.sweep(now),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffered
    }

    fn forget(&mut self, entry: &Entry) {
        if is_buffered(&entry.lookup) {
            self.buffered -= 1;
        }
    }
}

fn is_buffered(lookup: &Lookup) -> bool {
    lookup.as_ref().is_some_and(|stat| stat.buffer.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(buffered: bool) -> Lookup {
        Some(Arc::new(FileStat {
            path: PathBuf::from("/srv/a.txt"),
            size: 2,
            mtime: SystemTime::UNIX_EPOCH,
            inode: 1,
            etag: "\"x\"".to_owned(),
            buffer: buffered.then(|| Bytes::from_static(b"hi")),
        }))
    }

    #[test]
    fn entries_expire_after_ttl() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_secs(10), 16, 4);
        cache.insert("/a".into(), stat(false), t0);

        assert!(cache.get("/a", t0 + Duration::from_secs(9)).is_some());
        assert!(cache.get("/a", t0 + Duration::from_secs(11)).is_none());

        assert_eq!(cache.sweep(t0 + Duration::from_secs(9)), 0);
        assert_eq!(cache.sweep(t0 + Duration::from_secs(11)), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_stops_at_first_live_entry() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_secs(10), 16, 4);
        cache.insert("/a".into(), stat(false), t0);
        cache.insert("/b".into(), None, t0 + Duration::from_secs(5));
        cache.insert("/c".into(), stat(false), t0 + Duration::from_secs(1));

        // "/c" has expired but sits behind the live "/b".
        let now = t0 + Duration::from_secs(12);
        assert_eq!(cache.sweep(now), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/c", now).is_none());
    }

    #[test]
    fn recaching_moves_entry_to_the_back() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_secs(10), 16, 4);
        cache.insert("/a".into(), stat(false), t0);
        cache.insert("/b".into(), stat(false), t0 + Duration::from_secs(1));
        cache.insert("/a".into(), stat(false), t0 + Duration::from_secs(2));

        assert_eq!(cache.sweep(t0 + Duration::from_secs(11)), 1);
        assert!(cache.get("/a", t0 + Duration::from_secs(11)).is_some());
    }

    #[test]
    fn count_limits_evict_oldest() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_secs(10), 2, 1);
        cache.insert("/a".into(), stat(true), t0);
        assert_eq!(cache.buffered(), 1);
        assert!(!cache.reserve_buffer());

        cache.insert("/b".into(), stat(false), t0);
        cache.insert("/c".into(), stat(false), t0);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a", t0).is_none());
        assert_eq!(cache.buffered(), 0);
    }

    #[test]
    fn buffer_reservations_count_against_the_limit() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_secs(10), 16, 1);
        assert!(cache.reserve_buffer());
        assert!(!cache.reserve_buffer());

        cache.insert("/a".into(), stat(true), t0);
        cache.release_buffer();
        assert_eq!(cache.buffered(), 1);
        assert!(!cache.reserve_buffer());

        cache.insert("/a".into(), stat(false), t0);
        assert!(cache.reserve_buffer());
        cache.release_buffer();
        assert!(cache.reserve_buffer());
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let t0 = Instant::now();
        let mut cache = StatCache::new(Duration::from_millis(100), 16, 4);
        cache.insert("/a".into(), stat(false), t0);
        assert_eq!(cache.maybe_sweep(t0), 0);
        assert_eq!(cache.maybe_sweep(t0 + Duration::from_millis(500)), 0);
        assert_eq!(cache.maybe_sweep(t0 + SWEEP_INTERVAL), 1);
    }
}
