//! Scoped key/value caches threading artifacts between planning layers.
//!
//! Four separately scoped caches exist per run: one pipeline cache, one
//! module cache per module, one task cache per task, and a fresh step cache
//! per node-host invocation. The scoping is a lifecycle and concurrency
//! boundary: pipeline/module/task caches are written during single-threaded
//! planning (last writer wins), while step caches are private to one
//! invocation and never shared across hosts.
//!
//! Keys are strings; values are opaque `Arc<dyn Any + Send + Sync>` payloads
//! retrieved with a typed [`Cache::get`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One scoped key/value store.
#[derive(Clone, Default)]
pub struct Cache {
    inner: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        map.insert(key.into(), Arc::new(value));
    }

    /// Retrieves the value under `key` when it has type `T`.
    ///
    /// Returns `None` both for a missing key and for a type mismatch; a
    /// mismatch means two writers disagree about a key's meaning, which the
    /// string-key protocol treats the same as absence.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let map = self.inner.lock().expect("cache lock poisoned");
        map.get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        let map = self.inner.lock().expect("cache lock poisoned");
        map.contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.lock().expect("cache lock poisoned");
        f.debug_struct("Cache").field("keys", &map.len()).finish()
    }
}

/// The full cache hierarchy of one run.
///
/// Module and task caches are created lazily at first access (which happens
/// when the owning scope plans) and persist until the pipeline result is
/// finalized, so steps from later modules can read artifacts produced by
/// earlier ones via explicit handoff through the pipeline cache.
#[derive(Default)]
pub struct CacheSet {
    pipeline: Cache,
    modules: Mutex<HashMap<String, Cache>>,
    tasks: Mutex<HashMap<String, Cache>>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The run-wide pipeline cache.
    pub fn pipeline(&self) -> Cache {
        self.pipeline.clone()
    }

    /// The cache scoped to the named module.
    pub fn module(&self, name: &str) -> Cache {
        let mut map = self.modules.lock().expect("cache lock poisoned");
        map.entry(name.to_string()).or_default().clone()
    }

    /// The cache scoped to the named task.
    pub fn task(&self, name: &str) -> Cache {
        let mut map = self.tasks.lock().expect("cache lock poisoned");
        map.entry(name.to_string()).or_default().clone()
    }
}
