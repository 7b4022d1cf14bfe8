//! Single-flight, time-boxed memoization
//!
//! [`Memo`] holds one value with the instant it was stored. Readers take a
//! shared lock and never observe a partially written value. A refresh runs
//! under a separate exclusive lock, so concurrent callers that all find the
//! value stale wait for one refresh instead of issuing their own.
//!
//! [`KeyedMemo`] is the same discipline per key. Keys never share a lock.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Memoized value with an optional time-to-live
pub struct Memo<T> {
    value: RwLock<Option<(T, Instant)>>,
    refresh: Mutex<()>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }
}

impl<T: Clone> Memo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored value if it is younger than `ttl`
    ///
    /// `None` as the TTL means the value never expires.
    pub async fn get(&self, ttl: Option<Duration>) -> Option<T> {
        let guard = self.value.read().await;
        match guard.as_ref() {
            Some((value, stored_at)) if is_fresh(*stored_at, ttl) => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the fresh value, or run `refresh` to produce one
    ///
    /// Only one refresh runs at a time. A failed refresh leaves the previous
    /// value in place and returns the error to the caller that ran it.
    pub async fn get_or_refresh<F, Fut, E>(&self, ttl: Option<Duration>, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(ttl).await {
            return Ok(value);
        }

        let _refreshing = self.refresh.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(value) = self.get(ttl).await {
            return Ok(value);
        }

        let value = refresh().await?;
        *self.value.write().await = Some((value.clone(), Instant::now()));
        Ok(value)
    }

    /// Return the stored value if `keep` accepts it, or replace it
    ///
    /// `refresh` receives the value being replaced, if any. The check is
    /// repeated under the refresh lock, so callers that find the same
    /// rejected value replace it once. A failed refresh leaves the previous
    /// value in place.
    pub async fn get_or_replace<K, F, Fut, E>(&self, keep: K, refresh: F) -> Result<T, E>
    where
        K: Fn(&T) -> bool,
        F: FnOnce(Option<T>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(None).await.filter(|v| keep(v)) {
            return Ok(value);
        }

        let _refreshing = self.refresh.lock().await;

        let previous = self.get(None).await;
        if let Some(value) = previous.as_ref().filter(|v| keep(*v)) {
            return Ok(value.clone());
        }

        let value = refresh(previous).await?;
        *self.value.write().await = Some((value.clone(), Instant::now()));
        Ok(value)
    }

    /// Replace the stored value and restart its TTL
    pub async fn set(&self, value: T) {
        let _refreshing = self.refresh.lock().await;
        *self.value.write().await = Some((value, Instant::now()));
    }

    /// Drop the stored value so the next read refreshes
    pub async fn invalidate(&self) {
        let _refreshing = self.refresh.lock().await;
        *self.value.write().await = None;
    }
}

fn is_fresh(stored_at: Instant, ttl: Option<Duration>) -> bool {
    match ttl {
        Some(ttl) => stored_at.elapsed() < ttl,
        None => true,
    }
}

/// Per-key [`Memo`]s created on first use
pub struct KeyedMemo<K, V> {
    entries: RwLock<HashMap<K, Arc<Memo<V>>>>,
}

impl<K, V> Default for KeyedMemo<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedMemo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, key: &K) -> Arc<Memo<V>> {
        if let Some(memo) = self.entries.read().await.get(key) {
            return Arc::clone(memo);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Keyed form of [`Memo::get_or_refresh`]
    ///
    /// The map lock is released before `refresh` runs; only the key's own
    /// memo is held during the refresh.
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        key: &K,
        ttl: Option<Duration>,
        refresh: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let memo = self.entry(key).await;
        memo.get_or_refresh(ttl, refresh).await
    }

    /// Keyed form of [`Memo::get_or_replace`]
    pub async fn get_or_replace<P, F, Fut, E>(&self, key: &K, keep: P, refresh: F) -> Result<V, E>
    where
        P: Fn(&V) -> bool,
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let memo = self.entry(key).await;
        memo.get_or_replace(keep, refresh).await
    }

    /// Forget the value stored for `key`
    pub async fn invalidate(&self, key: &K) {
        let memo = self.entries.write().await.remove(key);
        if let Some(memo) = memo {
            memo.invalidate().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
