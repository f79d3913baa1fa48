use std::{collections::HashSet, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use moka::{notification::RemovalCause, policy::EvictionPolicy, sync::Cache};

/// Why an entry left the activity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EvictionCause {
    /// The write TTL or the access TTL lapsed.
    Expired,
    /// Evicted to stay within `max_entries`.
    Size,
    /// Removed via [`ActivityCache::remove`].
    Explicit,
}

/// Invoked once per removed entry with the client id and the cause.
pub type EvictionListener = Arc<dyn Fn(&str, EvictionCause) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityCacheSettings {
    pub write_ttl: Duration,
    pub access_ttl: Duration,
    pub max_entries: u64,
}

impl Default for ActivityCacheSettings {
    fn default() -> Self {
        Self {
            write_ttl: Duration::from_secs(10),
            access_ttl: Duration::from_secs(10),
            max_entries: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The client had no entry; one was created.
    NewClient,
    /// The client was known but the resource was not.
    NewResource,
    /// Both were already present. Only the TTL clocks were reset.
    Known,
}

/// Bounded map from client id to the set of resources the client recently touched.
///
/// Entries expire `write_ttl` after their last [`record`](Self::record) and `access_ttl`
/// after their last read or write, whichever comes first. Once `max_entries` is reached the
/// least recently used client is evicted before [`record`](Self::record) returns. Expiry
/// housekeeping is amortized over cache operations; call
/// [`run_pending_tasks`](Self::run_pending_tasks) to force it.
///
/// Safe to share between request threads: all operations are non-blocking apart from
/// per-key synchronization inside the cache.
#[derive(Clone)]
pub struct ActivityCache<R> {
    inner: Cache<String, Arc<HashSet<R>>>,
}

impl<R> Debug for ActivityCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityCache")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

impl<R> ActivityCache<R>
where
    R: Hash + Eq + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(settings: ActivityCacheSettings) -> Self {
        Self::with_eviction_listener(settings, Arc::new(log_eviction))
    }

    #[must_use]
    pub fn with_eviction_listener(
        settings: ActivityCacheSettings,
        listener: EvictionListener,
    ) -> Self {
        let initial_capacity = usize::try_from(settings.max_entries / 2).unwrap_or(usize::MAX);
        let inner = Cache::builder()
            .max_capacity(settings.max_entries)
            .initial_capacity(initial_capacity)
            .time_to_live(settings.write_ttl)
            .time_to_idle(settings.access_ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |client_id: Arc<String>, _resources, cause| {
                let cause = match cause {
                    // Re-inserting on `record` replaces the value; the entry itself stays.
                    RemovalCause::Replaced => return,
                    RemovalCause::Expired => EvictionCause::Expired,
                    RemovalCause::Size => EvictionCause::Size,
                    RemovalCause::Explicit => EvictionCause::Explicit,
                };
                listener(&client_id, cause);
            })
            .build();
        Self { inner }
    }

    /// Adds `resource` to the set of `client_id` and resets both TTL clocks of the entry.
    pub fn record(&self, client_id: &str, resource: R) -> RecordOutcome {
        let mut outcome = RecordOutcome::Known;
        self.inner
            .entry(client_id.to_string())
            .and_upsert_with(|existing| match existing {
                None => {
                    outcome = RecordOutcome::NewClient;
                    Arc::new(HashSet::from([resource]))
                }
                Some(entry) => {
                    let current = entry.into_value();
                    if current.contains(&resource) {
                        current
                    } else {
                        outcome = RecordOutcome::NewResource;
                        let mut resources = HashSet::clone(&current);
                        resources.insert(resource);
                        Arc::new(resources)
                    }
                }
            });
        if outcome == RecordOutcome::NewClient {
            self.inner.run_pending_tasks();
        }
        outcome
    }

    /// Read access: refreshes the access TTL but not the write TTL.
    #[must_use]
    pub fn contains(&self, client_id: &str, resource: &R) -> bool {
        self.inner
            .get(client_id)
            .is_some_and(|resources| resources.contains(resource))
    }

    /// Snapshot of the resources recorded for `client_id`. Counts as a read access.
    #[must_use]
    pub fn resources(&self, client_id: &str) -> Option<Arc<HashSet<R>>> {
        self.inner.get(client_id)
    }

    pub fn remove(&self, client_id: &str) {
        self.inner.invalidate(client_id);
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
    }
}

fn log_eviction(client_id: &str, cause: EvictionCause) {
    tracing::debug!("Removing client {client_id} from activity cache: {cause}");
}
