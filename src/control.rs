//! Test-suite control over registered caches.
//!
//! Test environments need to refresh caches deterministically instead of
//! waiting for the periodic schedule. Every running engine registers itself
//! here on start and deregisters on stop; the test suite then triggers updates
//! and dump writes by cache name, in registration (i.e. dependency) order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::engine::UpdateType;

/// Engine-side interface the registry drives.
pub(crate) trait ControlledCache: Send + Sync {
    fn name(&self) -> &str;
    fn update(self: Arc<Self>, update_type: UpdateType) -> BoxFuture<'static, anyhow::Result<()>>;
    fn write_dump_sync(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

/// Registry of running caches, shared between the embedder and its test suite.
#[derive(Default)]
pub struct CacheControl {
    periodic_updates_disabled: AtomicBool,
    caches: Mutex<Vec<Weak<dyn ControlledCache>>>,
}

impl CacheControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A control whose caches never run periodic tasks; every refresh is
    /// triggered explicitly. This is how test suites use the registry.
    pub fn with_periodic_updates_disabled() -> Arc<Self> {
        let control = Self::default();
        control.periodic_updates_disabled.store(true, Ordering::Relaxed);
        Arc::new(control)
    }

    pub fn periodic_updates_enabled(&self) -> bool {
        !self.periodic_updates_disabled.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, cache: Weak<dyn ControlledCache>) {
        self.caches.lock().push(cache);
    }

    pub(crate) fn deregister(&self, cache: &Weak<dyn ControlledCache>) {
        let target = cache.as_ptr() as *const ();
        self.caches
            .lock()
            .retain(|registered| registered.as_ptr() as *const () != target);
    }

    fn alive_caches(&self) -> Vec<Arc<dyn ControlledCache>> {
        let mut caches = self.caches.lock();
        caches.retain(|cache| cache.strong_count() > 0);
        caches.iter().filter_map(Weak::upgrade).collect()
    }

    /// Triggers one update on every registered cache, in registration order.
    pub async fn update_all(&self, update_type: UpdateType) -> anyhow::Result<()> {
        for cache in self.alive_caches() {
            let name = cache.name().to_owned();
            cache
                .update(update_type)
                .await
                .with_context(|| format!("failed to update cache `{name}`"))?;
        }
        Ok(())
    }

    /// Triggers one update on the cache registered under `name`.
    pub async fn update_one(&self, name: &str, update_type: UpdateType) -> anyhow::Result<()> {
        let cache = self
            .alive_caches()
            .into_iter()
            .find(|cache| cache.name() == name)
            .with_context(|| format!("no running cache is registered under `{name}`"))?;
        cache.update(update_type).await
    }

    /// Forces a dump on every registered cache and waits for each to finish.
    pub async fn write_all_dumps(&self) {
        for cache in self.alive_caches() {
            cache.write_dump_sync().await;
        }
    }
}

impl std::fmt::Debug for CacheControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheControl")
            .field(
                "periodic_updates_disabled",
                &self.periodic_updates_disabled.load(Ordering::Relaxed),
            )
            .field("registered", &self.caches.lock().len())
            .finish()
    }
}
