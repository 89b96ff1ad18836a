//! Bounded pool of raster engine handles.
//!
//! Render handles are stateful and must not be shared, so each checkout hands
//! out exclusive ownership of one handle wrapped in a guard:
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//! checkout(key) ─►│ LRU<FactoryKey, KeySlot>                 │
//!                 │   KeySlot { permits: Semaphore(n),       │
//!                 │             idle: Vec<handle> }          │
//!                 └──────┬───────────────────────────────────┘
//!                        │ permit acquired (bounded wait)
//!                        ▼
//!           idle handle? ── yes ──► PooledFactory
//!                 │ no
//!                 ▼
//!     engine.open(key) on a blocking thread
//!                 │ error ──► PooledFactory (unreadable sentinel)
//!                 ▼
//!           PooledFactory ── drop ──► handle back to idle, permit released
//! ```
//!
//! A handle therefore lives either in exactly one guard or in the idle list
//! of its slot. The slot table is bounded by `max_keys`, but only slots with
//! no guard or waiter are evicted; while every slot is busy the table may
//! briefly grow past the bound. Handles dropped while the thread is panicking are discarded
//! rather than returned, since their state is unknown.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::engine::{FactoryKey, RasterEngine, TileFactory};
use crate::error::TileError;

/// Default number of concurrent handles per image variant.
pub const DEFAULT_MAX_HANDLES_PER_KEY: usize = 4;

/// Default number of image variants with pooled handles.
pub const DEFAULT_MAX_KEYS: usize = 64;

/// Default bound on the wait for a free handle.
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_handles_per_key: usize,
    pub max_keys: usize,
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handles_per_key: DEFAULT_MAX_HANDLES_PER_KEY,
            max_keys: DEFAULT_MAX_KEYS,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub opens: u64,
    pub open_failures: u64,
    pub checkouts: u64,
    pub checked_out: usize,
    pub keys: usize,
}

struct KeySlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn TileFactory>>>,
}

struct PoolInner {
    engine: Arc<dyn RasterEngine>,
    config: PoolConfig,
    slots: Mutex<LruCache<FactoryKey, Arc<KeySlot>>>,
    opens: AtomicU64,
    open_failures: AtomicU64,
    checkouts: AtomicU64,
    checked_out: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool of [`TileFactory`] handles keyed by image variant.
///
/// Cloning is cheap; clones share the same handles and counters.
#[derive(Clone)]
pub struct TileFactoryPool {
    inner: Arc<PoolInner>,
}

impl TileFactoryPool {
    pub fn new(engine: Arc<dyn RasterEngine>) -> Self {
        Self::with_config(engine, PoolConfig::default())
    }

    pub fn with_config(engine: Arc<dyn RasterEngine>, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_handles_per_key: config.max_handles_per_key.max(1),
            ..config
        };
        let config = PoolConfig {
            max_keys: config.max_keys.max(1),
            ..config
        };

        Self {
            inner: Arc::new(PoolInner {
                engine,
                config,
                slots: Mutex::new(LruCache::unbounded()),
                opens: AtomicU64::new(0),
                open_failures: AtomicU64::new(0),
                checkouts: AtomicU64::new(0),
                checked_out: AtomicUsize::new(0),
            }),
        }
    }

    /// Take exclusive use of a handle for `key`.
    ///
    /// Waits at most the configured checkout timeout for a free handle. When
    /// the engine cannot open the image the returned guard carries the
    /// unreadable sentinel instead of a handle.
    pub async fn checkout(&self, key: &FactoryKey) -> Result<PooledFactory, TileError> {
        let slot = self.slot(key);
        let exhausted = || TileError::PoolExhausted {
            path: key.path.to_string(),
        };

        let permit = match tokio::time::timeout(
            self.inner.config.checkout_timeout,
            slot.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                debug!(path = %key.path, "Timed out waiting for a render handle");
                return Err(exhausted());
            }
        };

        self.inner.checkouts.fetch_add(1, Ordering::Relaxed);

        let idle = lock(&slot.idle).pop();
        let factory = match idle {
            Some(factory) => Some(factory),
            None => self.open(key).await,
        };

        self.inner.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(PooledFactory {
            factory,
            slot,
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Drop the pooled handles of every variant of `path`, and the engine's
    /// decoded state for it.
    ///
    /// Handles currently checked out are released into their detached slot
    /// and closed once the last guard goes away.
    pub fn evict_path(&self, path: &str) -> usize {
        self.inner.engine.evict(path);

        let mut slots = lock(&self.inner.slots);
        let keys: Vec<FactoryKey> = slots
            .iter()
            .filter(|(key, _)| key.path.as_ref() == path)
            .map(|(key, _)| key.clone())
            .collect();

        let mut closed = 0;
        for key in keys {
            if let Some(slot) = slots.pop(&key) {
                closed += lock(&slot.idle).drain(..).count();
            }
        }
        if closed > 0 {
            debug!(path, closed, "Evicted render handles");
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opens: self.inner.opens.load(Ordering::Relaxed),
            open_failures: self.inner.open_failures.load(Ordering::Relaxed),
            checkouts: self.inner.checkouts.load(Ordering::Relaxed),
            checked_out: self.inner.checked_out.load(Ordering::Relaxed),
            keys: lock(&self.inner.slots).len(),
        }
    }

    fn slot(&self, key: &FactoryKey) -> Arc<KeySlot> {
        let mut slots = lock(&self.inner.slots);
        if let Some(slot) = slots.get(key) {
            return slot.clone();
        }
        let slot = Arc::new(KeySlot {
            permits: Arc::new(Semaphore::new(self.inner.config.max_handles_per_key)),
            idle: Mutex::new(Vec::new()),
        });
        slots.put(key.clone(), slot.clone());

        while slots.len() > self.inner.config.max_keys {
            // Only slots nobody holds may go; a busy slot still owns its permits
            let victim = slots
                .iter()
                .rev()
                .find(|(_, slot)| Arc::strong_count(slot) == 1)
                .map(|(key, _)| key.clone());
            match victim {
                Some(victim) => {
                    slots.pop(&victim);
                }
                None => break,
            }
        }
        slot
    }

    async fn open(&self, key: &FactoryKey) -> Option<Box<dyn TileFactory>> {
        let engine = self.inner.engine.clone();
        let owned = key.clone();
        let result = tokio::task::spawn_blocking(move || engine.open(&owned)).await;

        match result {
            Ok(Ok(factory)) => {
                self.inner.opens.fetch_add(1, Ordering::Relaxed);
                debug!(path = %key.path, format = %key.format, "Opened render handle");
                Some(factory)
            }
            Ok(Err(e)) => {
                self.inner.open_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %key.path, error = %e, "Failed to open image for rendering");
                None
            }
            Err(e) => {
                self.inner.open_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %key.path, error = %e, "Render handle open task failed");
                None
            }
        }
    }
}

/// Exclusive use of one pooled handle; returned to the pool on drop.
pub struct PooledFactory {
    factory: Option<Box<dyn TileFactory>>,
    slot: Arc<KeySlot>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledFactory {
    /// The handle, or `None` when the image could not be opened.
    pub fn factory(&mut self) -> Option<&mut dyn TileFactory> {
        match self.factory.as_mut() {
            Some(factory) => Some(&mut **factory),
            None => None,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.factory.is_none()
    }
}

impl Drop for PooledFactory {
    fn drop(&mut self) {
        self.inner.checked_out.fetch_sub(1, Ordering::Relaxed);
        if let Some(factory) = self.factory.take() {
            if std::thread::panicking() {
                warn!("Discarding render handle released during a panic");
                return;
            }
            lock(&self.slot.idle).push(factory);
        }
    }
}
