use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};

/// Value produced by a refresh together with how long it may be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refreshed {
    pub value: String,
    pub ttl: Duration,
}

impl Refreshed {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Live entry as seen by snapshot persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    pub remaining_secs: i64,
}

type Pending = Shared<BoxFuture<'static, GateResult<String>>>;

struct Inner {
    namespace: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Pending>>,
}

/// TTL-scoped credential store with at most one refresh in flight per key.
///
/// Reads of live entries never wait on a refresh. Callers that find a key
/// absent or lapsed while another caller is already refreshing it wait for
/// that refresh and share its outcome. Refreshes of different keys never
/// block each other. Expiry is evaluated lazily on read.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("namespace", &self.inner.namespace)
            .field("entries", &self.inner.entries.read().len())
            .field("inflight", &self.inner.inflight.lock().len())
            .finish()
    }
}

impl CredentialCache {
    /// `namespace` identifies the owning account, e.g. `wx123|mp`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace: namespace.into(),
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Return the live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        self.inner
            .entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Remaining lifetime of a live entry.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let now = Utc::now();
        self.inner
            .entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.remaining(now))
    }

    /// Store `value` for `ttl`, replacing any previous entry. A zero or
    /// negative ttl stores an entry that already reads as lapsed.
    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        let entry = CacheEntry {
            value: value.into(),
            expires_at: Utc::now() + ttl,
        };
        debug!(
            namespace = %self.inner.namespace,
            key = %key,
            ttl_secs = ttl.num_seconds(),
            "credential stored"
        );
        self.inner.entries.write().insert(key.to_string(), entry);
    }

    /// Drop the entry so the next `get_or_refresh` fetches a fresh value.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.entries.write().remove(key).is_some();
        if removed {
            debug!(namespace = %self.inner.namespace, key = %key, "credential invalidated");
        }
        removed
    }

    /// Drop the entry only while it still holds `rejected`.
    ///
    /// A caller that saw `rejected` turned down upstream must not discard a
    /// value another caller has already refreshed.
    pub fn invalidate_if(&self, key: &str, rejected: &str) -> bool {
        let mut entries = self.inner.entries.write();
        if entries.get(key).map(|e| e.value.as_str()) != Some(rejected) {
            return false;
        }
        entries.remove(key);
        debug!(namespace = %self.inner.namespace, key = %key, "credential invalidated");
        true
    }

    /// Return the live value for `key`, or run `refresh` to produce one.
    ///
    /// Concurrent callers for the same key share a single invocation of
    /// `refresh`; callers whose closure was not needed never run it. A failed
    /// refresh is returned to every waiter and leaves any previous entry in
    /// place, except that a `CredentialExpired` failure removes the entry.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> GateResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GateResult<Refreshed>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let pending = {
            let mut inflight = self.inner.inflight.lock();
            // a refresh may have landed between the read above and taking the lock
            if let Some(value) = self.get(key) {
                return Ok(value);
            }
            match inflight.get(key) {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.spawn_refresh(key, refresh());
                    inflight.insert(key.to_string(), pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_refresh<Fut>(&self, key: &str, fut: Fut) -> Pending
    where
        Fut: Future<Output = GateResult<Refreshed>> + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        async move {
            let outcome = fut.await;
            match &outcome {
                Ok(refreshed) => cache.set(&key, refreshed.value.clone(), refreshed.ttl),
                Err(err) => {
                    if err.is_credential_expired() {
                        cache.invalidate(&key);
                    }
                    warn!(
                        namespace = %cache.inner.namespace,
                        key = %key,
                        error = %err,
                        "credential refresh failed"
                    );
                }
            }
            cache.inner.inflight.lock().remove(&key);
            outcome.map(|r| r.value)
        }
        .boxed()
        .shared()
    }

    /// Live entries with their remaining lifetime in whole seconds.
    pub fn export(&self) -> Vec<SnapshotEntry> {
        let now = Utc::now();
        let mut out: Vec<SnapshotEntry> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| SnapshotEntry {
                key: k.clone(),
                value: e.value.clone(),
                remaining_secs: e.remaining(now).num_seconds(),
            })
            .filter(|e| e.remaining_secs > 0)
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Rehydrate entries; non-positive lifetimes are skipped.
    pub fn import<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = SnapshotEntry>,
    {
        let mut loaded = 0;
        for entry in entries {
            if entry.remaining_secs <= 0 {
                continue;
            }
            self.set(&entry.key, entry.value, Duration::seconds(entry.remaining_secs));
            loaded += 1;
        }
        loaded
    }
}

/// Fail fast on an empty credential coming back from a refresh.
pub fn require_value(value: &str, what: &str) -> GateResult<()> {
    if value.is_empty() {
        Err(GateError::RefreshFailed(format!("{what} missing from response")))
    } else {
        Ok(())
    }
}
