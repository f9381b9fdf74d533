//! TTL-expiring keyed registry with lazy per-entry initialization.
//!
//! Each entry holds one lazily-constructed `T`. The first reader forces
//! construction; eviction (explicit, expiry, or drain) runs the finalize hook
//! exactly once, after construction has been forced, so finalizers always
//! operate on a real value. Accessing an entry extends its lifetime by the
//! entry's original TTL.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempts the id generator gets before allocation fails.
const MAX_NEW_ID_CALLS: usize = 1000;

/// How often the expiry driver scans for elapsed deadlines.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Why a finalize hook is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// The entry was removed explicitly ([`Vapor::evict`] or the drain).
    Deleted,
    /// The entry's TTL elapsed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VaporError {
    #[error("id generator did not produce a unique id after {MAX_NEW_ID_CALLS} attempts")]
    NoUniqueId,

    #[error("no longer accepting new elements")]
    Stopped,

    #[error("id not found (is it expired?)")]
    NotFound,
}

type NewIdFn = Box<dyn Fn() -> String + Send + Sync>;
type InitFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type FinalizeFn<T> = Box<dyn Fn(FinalizeReason, Arc<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<T> {
    cell: OnceLock<Arc<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }
}

struct Entry<T> {
    slot: Arc<Slot<T>>,
    deadline: Instant,
    ttl: Duration,
}

struct State<T> {
    entries: HashMap<String, Entry<T>>,
    drained: bool,
    driver: Option<(JoinHandle<()>, CancellationToken)>,
}

/// The registry. Construct with [`Vapor::new`]; share as `Arc<Vapor<T>>`.
pub struct Vapor<T> {
    weak: Weak<Vapor<T>>,
    new_id: NewIdFn,
    initialize: InitFn<T>,
    finalize: FinalizeFn<T>,
    state: Mutex<State<T>>,
}

impl<T: Send + Sync + 'static> Vapor<T> {
    pub fn new(new_id: NewIdFn, initialize: InitFn<T>, finalize: FinalizeFn<T>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            new_id,
            initialize,
            finalize,
            state: Mutex::new(State {
                entries: HashMap::new(),
                drained: false,
                driver: None,
            }),
        })
    }

    /// Reserve a fresh entry expiring after `d` and return its id. The value
    /// is not constructed until the first [`Vapor::get`].
    pub fn reserve(&self, d: Duration) -> Result<String, VaporError> {
        self.allocate(d).map(|(id, _)| id)
    }

    /// [`Vapor::reserve`] followed by [`Vapor::get`], without the second
    /// lookup.
    pub fn create(&self, d: Duration) -> Result<(String, Arc<T>), VaporError> {
        let (id, slot) = self.allocate(d)?;
        let value = self.force(&slot);
        Ok((id, value))
    }

    /// Fetch the entry with `id`, constructing the value on first read and
    /// extending the entry's deadline by its original TTL.
    pub fn get(&self, id: &str) -> Result<Arc<T>, VaporError> {
        self.ensure_driver();

        let slot = {
            let mut state = self.state.lock();
            let entry = state.entries.get_mut(id).ok_or(VaporError::NotFound)?;
            let now = Instant::now();
            if entry.deadline <= now {
                // elapsed but not yet swept; the driver owns its finalize
                return Err(VaporError::NotFound);
            }
            entry.deadline = now + entry.ttl;
            entry.slot.clone()
        };
        Ok(self.force(&slot))
    }

    /// Remove the entry with `id`, finalizing it with
    /// [`FinalizeReason::Deleted`]. No-op if absent.
    pub async fn evict(&self, id: &str) {
        self.ensure_driver();

        let slot = self.state.lock().entries.remove(id).map(|e| e.slot);
        if let Some(slot) = slot {
            let value = self.force(&slot);
            (self.finalize)(FinalizeReason::Deleted, value).await;
        }
    }

    /// Drain the registry: atomically refuse all future allocations, then for
    /// every current entry force initialization, run `f`, and finalize with
    /// [`FinalizeReason::Deleted`]. Resolves once every `f` and finalize has
    /// completed. Expiries that fire concurrently are tolerated; whoever
    /// removes an entry from the map finalizes it, exactly once.
    pub async fn evict_after<F>(&self, f: F)
    where
        F: Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync,
    {
        let entries: Vec<(String, Arc<Slot<T>>)> = {
            let mut state = self.state.lock();
            state.drained = true;
            state.entries.drain().map(|(id, e)| (id, e.slot)).collect()
        };

        let f = &f;
        join_all(entries.into_iter().map(|(id, slot)| {
            let value = self.force(&slot);
            async move {
                debug!(id = %id, "draining entry");
                f(value.clone()).await;
                (self.finalize)(FinalizeReason::Deleted, value).await;
            }
        }))
        .await;
    }

    /// Stop the background expiry driver. It restarts on the next operation;
    /// a drained registry stays drained.
    pub fn close(&self) {
        let driver = self.state.lock().driver.take();
        if let Some((_, stop)) = driver {
            stop.cancel();
        }
    }

    fn allocate(&self, d: Duration) -> Result<(String, Arc<Slot<T>>), VaporError> {
        self.ensure_driver();

        for _ in 0..MAX_NEW_ID_CALLS {
            let id = (self.new_id)();
            if id.is_empty() {
                continue;
            }

            let mut state = self.state.lock();
            if state.drained {
                return Err(VaporError::Stopped);
            }
            if state.entries.contains_key(&id) {
                continue;
            }
            let slot = Arc::new(Slot::default());
            state.entries.insert(
                id.clone(),
                Entry {
                    slot: Arc::clone(&slot),
                    deadline: Instant::now() + d,
                    ttl: d,
                },
            );
            return Ok((id, slot));
        }
        Err(VaporError::NoUniqueId)
    }

    fn force(&self, slot: &Arc<Slot<T>>) -> Arc<T> {
        Arc::clone(slot.cell.get_or_init(|| Arc::new((self.initialize)())))
    }

    fn ensure_driver(&self) {
        let mut state = self.state.lock();
        if state.driver.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let weak = self.weak.clone();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let Some(vapor) = weak.upgrade() else { return };
                vapor.sweep().await;
            }
        });
        state.driver = Some((handle, stop));
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(String, Arc<Slot<T>>)> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id).map(|e| (id, e.slot)))
                .collect()
        };

        for (id, slot) in expired {
            debug!(id = %id, "entry expired");
            let value = self.force(&slot);
            (self.finalize)(FinalizeReason::Expired, value).await;
        }
    }
}
