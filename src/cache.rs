//! Process-wide query cache with borrow/release discipline.
//!
//! Maps a normalized cache key to a [`CachedQuery`]. Entries are evicted LRU
//! by last access, except that a borrowed entry is never evicted. Evicting an
//! entry that is named on the server does not destroy the statement directly;
//! the name is handed back to the connection, which issues `Close(statement)`
//! lazily before the next execution.
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use lru::LruCache;

use crate::{
    Result,
    postgres::Oid,
    sql::{RewriteOptions, RewrittenQuery},
    statement::StatementName,
};

/// Identity of one cache entry.
///
/// Two executions share an entry only when the text and every rewrite-visible
/// option agree, since any of them changes the rewritten form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sql: String,
    pub options: RewriteOptions,
}

/// A borrowed handle to one cached, rewritten query.
///
/// Cloning shares the entry; the borrow count is managed by
/// [`QueryCache::borrow`] and [`QueryCache::release`].
#[derive(Debug, Clone)]
pub struct CachedQuery {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    key: CacheKey,
    query: RewrittenQuery,
    execute_count: AtomicU64,
    borrows: AtomicU32,
    prepared: Mutex<PrepareState>,
}

#[derive(Debug, Default)]
struct PrepareState {
    server_name: Option<StatementName>,
    described: bool,
    /// Parameter type oids sent with the last `Parse` of this entry. A
    /// mismatch on a named statement forces a re-prepare.
    param_oids: Vec<Oid>,
}

impl CachedQuery {
    pub(crate) fn new(key: CacheKey, query: RewrittenQuery) -> CachedQuery {
        CachedQuery {
            inner: Arc::new(Shared {
                key,
                query,
                execute_count: AtomicU64::new(0),
                borrows: AtomicU32::new(0),
                prepared: Mutex::new(PrepareState::default()),
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn query(&self) -> &RewrittenQuery {
        &self.inner.query
    }

    /// Number of executions so far. Only ever increases.
    pub fn execute_count(&self) -> u64 {
        self.inner.execute_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increase_execute_count(&self) -> u64 {
        self.inner.execute_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The server-side statement name, once promoted.
    pub fn server_name(&self) -> Option<StatementName> {
        self.inner.prepared.lock().expect("cache entry poisoned").server_name.clone()
    }

    pub(crate) fn is_described(&self) -> bool {
        self.inner.prepared.lock().expect("cache entry poisoned").described
    }

    pub(crate) fn set_described(&self) {
        self.inner.prepared.lock().expect("cache entry poisoned").described = true;
    }

    /// Record a successful `Parse` under `name` with the given types.
    /// Promotion is monotonic: the name stays until [`take_server_name`][1].
    ///
    /// [1]: CachedQuery::take_server_name
    pub(crate) fn promote(&self, name: StatementName, oids: Vec<Oid>) {
        let mut state = self.inner.prepared.lock().expect("cache entry poisoned");
        state.server_name = Some(name);
        state.param_oids = oids;
    }

    /// Whether the named statement can be reused for parameters of `oids`.
    pub(crate) fn types_match(&self, oids: &[Oid]) -> bool {
        let state = self.inner.prepared.lock().expect("cache entry poisoned");
        state.param_oids == oids
    }

    /// Demote the entry, returning the server name for a deferred `Close`.
    pub(crate) fn take_server_name(&self) -> Option<StatementName> {
        let mut state = self.inner.prepared.lock().expect("cache entry poisoned");
        state.described = false;
        state.server_name.take()
    }

    fn borrows(&self) -> u32 {
        self.inner.borrows.load(Ordering::Acquire)
    }
}

/// Bounded LRU mapping from [`CacheKey`] to [`CachedQuery`].
#[derive(Debug)]
pub struct QueryCache {
    entries: LruCache<CacheKey, CachedQuery>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> QueryCache {
        QueryCache {
            // the lru bound is enforced manually so borrowed entries survive
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrow the entry for `key`, creating it with `build` on first use.
    ///
    /// Returns the handle plus any server statement names that fell out of
    /// the cache and must be closed before the next execution.
    pub fn borrow(
        &mut self,
        key: CacheKey,
        build: impl FnOnce(&CacheKey) -> Result<RewrittenQuery>,
    ) -> Result<(CachedQuery, Vec<StatementName>)> {
        if let Some(hit) = self.entries.get(&key) {
            hit.inner.borrows.fetch_add(1, Ordering::AcqRel);
            return Ok((hit.clone(), Vec::new()));
        }

        let query = build(&key)?;
        let entry = CachedQuery::new(key.clone(), query);
        entry.inner.borrows.store(1, Ordering::Release);
        self.entries.push(key, entry.clone());

        let mut closes = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((key, victim)) = self.entries.pop_lru() else {
                break;
            };
            if victim.borrows() > 0 {
                // never evict a borrowed entry; re-inserting makes it most
                // recently used, so stop instead of cycling the whole map
                self.entries.push(key, victim);
                break;
            }
            if let Some(name) = victim.take_server_name() {
                closes.push(name);
            }
        }

        Ok((entry, closes))
    }

    /// Return a borrow taken by [`borrow`][QueryCache::borrow].
    pub fn release(&mut self, entry: &CachedQuery) {
        let prev = entry.inner.borrows.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without borrow");
    }

    /// Build a query without inserting it, for one-shot execution.
    pub fn detached(
        key: CacheKey,
        build: impl FnOnce(&CacheKey) -> Result<RewrittenQuery>,
    ) -> Result<CachedQuery> {
        let query = build(&key)?;
        Ok(CachedQuery::new(key, query))
    }

    /// Drop every entry, returning the names that need a server-side close.
    pub fn clear(&mut self) -> Vec<StatementName> {
        let mut closes = Vec::new();
        while let Some((_, victim)) = self.entries.pop_lru() {
            if let Some(name) = victim.take_server_name() {
                closes.push(name);
            }
        }
        closes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::{PlaceholderStyle, rewrite};

    fn key(sql: &str) -> CacheKey {
        CacheKey {
            sql: sql.to_owned(),
            options: RewriteOptions {
                style: PlaceholderStyle::Jdbc,
                parameterized: true,
                ..Default::default()
            },
        }
    }

    fn build(key: &CacheKey) -> Result<RewrittenQuery> {
        rewrite(&key.sql, &key.options)
    }

    #[test]
    fn borrow_shares_one_entry() {
        let mut cache = QueryCache::new(4);
        let (a, _) = cache.borrow(key("SELECT ?"), build).unwrap();
        let (b, _) = cache.borrow(key("SELECT ?"), build).unwrap();
        assert_eq!(cache.len(), 1);

        a.increase_execute_count();
        assert_eq!(b.execute_count(), 1);

        cache.release(&a);
        cache.release(&b);
    }

    #[test]
    fn execute_count_is_monotonic() {
        let mut cache = QueryCache::new(4);
        let (q, _) = cache.borrow(key("SELECT 1"), build).unwrap();
        let mut last = 0;
        for _ in 0..5 {
            let now = q.increase_execute_count();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn lru_eviction_skips_borrowed() {
        let mut cache = QueryCache::new(2);
        let (a, _) = cache.borrow(key("SELECT 1"), build).unwrap();
        let (_b, _) = cache.borrow(key("SELECT 2"), build).unwrap();
        cache.release(&_b);

        // `a` stays borrowed: inserting two more must never evict it
        let (_c, _) = cache.borrow(key("SELECT 3"), build).unwrap();
        let (_d, _) = cache.borrow(key("SELECT 4"), build).unwrap();

        let (a2, _) = cache.borrow(key("SELECT 1"), build).unwrap();
        assert_eq!(a2.execute_count(), a.execute_count());
        assert!(Arc::ptr_eq(&a.inner, &a2.inner));
    }

    #[test]
    fn evicting_named_entry_defers_close() {
        let mut cache = QueryCache::new(1);
        let (a, _) = cache.borrow(key("SELECT 1"), build).unwrap();
        a.promote(StatementName::next(), vec![23]);
        cache.release(&a);

        let (_b, closes) = cache.borrow(key("SELECT 2"), build).unwrap();
        assert_eq!(closes.len(), 1);
        assert!(!closes[0].as_str().is_empty());
    }

    #[test]
    fn promotion_is_monotonic_until_taken() {
        let cache_entry = CachedQuery::new(key("SELECT 1"), build(&key("SELECT 1")).unwrap());
        assert!(cache_entry.server_name().is_none());

        cache_entry.promote(StatementName::next(), vec![]);
        let name = cache_entry.server_name().unwrap();
        assert_eq!(cache_entry.server_name().unwrap(), name);

        let taken = cache_entry.take_server_name().unwrap();
        assert_eq!(taken, name);
        assert!(cache_entry.server_name().is_none());
    }

    #[test]
    fn type_mismatch_detected() {
        let entry = CachedQuery::new(key("SELECT ?"), build(&key("SELECT ?")).unwrap());
        entry.promote(StatementName::next(), vec![23]);
        assert!(entry.types_match(&[23]));
        assert!(!entry.types_match(&[25]));
    }
}
