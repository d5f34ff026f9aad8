//! Informer caches and watch loops
//!
//! Each object kind the controller cares about gets an [`ObjectCache`]: a
//! concurrent map of `namespace/name` keys to immutable snapshots, kept
//! up to date by a background task driving a `kube::runtime::watcher`
//! stream. Readers never block and never talk to the API server.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crd::Notebook;

/// Cache key for an object: `namespace/name`.
pub fn object_key<K: kube::Resource>(object: &K) -> String {
    format!(
        "{}/{}",
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

/// Callbacks invoked by an informer as its cache changes.
///
/// Handlers run on the informer task and must not block; the dispatcher
/// only translates events into queue adds.
pub trait EventHandler<K>: Send + Sync {
    /// A previously unseen object appeared.
    fn on_add(&self, object: &K);
    /// A cached object changed. Re-lists and resyncs deliver synthetic
    /// updates where old and new may be identical.
    fn on_update(&self, old: &K, new: &K);
    /// A cached object disappeared.
    fn on_delete(&self, object: &K);
}

/// Read-mostly cache of one object kind, shared between the informer
/// (writer) and the dispatcher/reconcilers (readers).
pub struct ObjectCache<K> {
    objects: DashMap<String, Arc<K>>,
    synced: AtomicBool,
}

impl<K: kube::Resource> ObjectCache<K> {
    /// Create an empty, not-yet-synced cache.
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }

    /// Snapshot for the given `namespace/name` key.
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Publish a new snapshot, returning the one it replaced.
    pub fn insert(&self, object: K) -> Option<Arc<K>> {
        self.objects.insert(object_key(&object), Arc::new(object))
    }

    /// Drop the snapshot for the given key, returning it.
    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.objects.remove(key).map(|(_, object)| object)
    }

    /// All cached keys.
    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    /// All cached snapshots.
    pub fn snapshot(&self) -> Vec<Arc<K>> {
        self.objects
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// True once the initial list has been fully processed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn set_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

impl<K: kube::Resource> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The informer caches for every kind the controller watches.
#[derive(Clone)]
pub struct Caches {
    /// Notebook cache.
    pub notebooks: Arc<ObjectCache<Notebook>>,
    /// Service cache.
    pub services: Arc<ObjectCache<Service>>,
    /// Secret cache.
    pub secrets: Arc<ObjectCache<Secret>>,
    /// StatefulSet cache.
    pub stateful_sets: Arc<ObjectCache<StatefulSet>>,
    /// Ingress cache.
    pub ingresses: Arc<ObjectCache<Ingress>>,
}

impl Caches {
    /// Create a fresh set of empty caches.
    pub fn new() -> Self {
        Self {
            notebooks: Arc::new(ObjectCache::new()),
            services: Arc::new(ObjectCache::new()),
            secrets: Arc::new(ObjectCache::new()),
            stateful_sets: Arc::new(ObjectCache::new()),
            ingresses: Arc::new(ObjectCache::new()),
        }
    }

    /// True once every cache has processed its initial list.
    pub fn all_synced(&self) -> bool {
        self.notebooks.has_synced()
            && self.services.has_synced()
            && self.secrets.has_synced()
            && self.stateful_sets.has_synced()
            && self.ingresses.has_synced()
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive a watch stream into the cache, firing handler callbacks, until
/// the stop token fires.
///
/// The watcher re-lists on every reconnect; objects that disappeared
/// between watches are detected at `InitDone` and delivered as deletes.
pub async fn run_informer<K>(
    api: Api<K>,
    cache: Arc<ObjectCache<K>>,
    handler: Arc<dyn EventHandler<K>>,
    stop: CancellationToken,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut init_keys: HashSet<String> = HashSet::new();

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Ok(Event::Init) => {
                init_keys.clear();
            }
            Ok(Event::InitApply(object)) => {
                init_keys.insert(object_key(&object));
                apply(&cache, handler.as_ref(), object);
            }
            Ok(Event::InitDone) => {
                for key in cache.keys() {
                    if !init_keys.contains(&key) {
                        if let Some(gone) = cache.remove(&key) {
                            debug!(%key, "object vanished between watches");
                            handler.on_delete(&gone);
                        }
                    }
                }
                init_keys.clear();
                cache.set_synced();
            }
            Ok(Event::Apply(object)) => apply(&cache, handler.as_ref(), object),
            Ok(Event::Delete(object)) => {
                cache.remove(&object_key(&object));
                handler.on_delete(&object);
            }
            Err(err) => warn!(error = %err, "watch stream error"),
        }
    }
}

fn apply<K>(cache: &ObjectCache<K>, handler: &dyn EventHandler<K>, object: K)
where
    K: kube::Resource + Clone,
{
    let incoming = object.clone();
    match cache.insert(object) {
        None => handler.on_add(&incoming),
        Some(previous) => handler.on_update(&previous, &incoming),
    }
}

/// Periodically re-fire update callbacks for every cached object.
///
/// This is the self-healing backstop against dropped events: a synthetic
/// update re-enqueues every notebook, while dependents are filtered out
/// by the dispatcher's resourceVersion check. An interval of zero
/// disables resync.
pub async fn run_resync<K>(
    cache: Arc<ObjectCache<K>>,
    handler: Arc<dyn EventHandler<K>>,
    interval: Duration,
    stop: CancellationToken,
) where
    K: kube::Resource + Send + Sync,
{
    if interval.is_zero() {
        return;
    }
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        for object in cache.snapshot() {
            handler.on_update(&object, &object);
        }
    }
}
