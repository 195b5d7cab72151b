// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! [`Informer`] backed by a `kube` watch stream.
//!
//! The informer keeps its own cache of the last seen state of every object so
//! it can hand handlers the previous object on update, and so that objects
//! which vanished while the watch was down can be reported as tombstones once
//! the relist completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::Api;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::informer::{
    DeletedFinalStateUnknown, DeletedObject, DynObject, Informer, ResourceEventHandler,
};

type Cache<K> = HashMap<ObjectRef<K>, Arc<K>>;

struct State<K: kube::Resource<DynamicType = ()>> {
    cache: Cache<K>,
    /// Objects seen since the last `Init`, swapped into `cache` on `InitDone`.
    relist: Option<Cache<K>>,
}

/// Watches one resource type and fans its events out to handlers.
///
/// Nothing happens until [`WatchInformer::run`] is polled; spawn it next to
/// the controllers that consume the informer.
pub struct WatchInformer<K: kube::Resource<DynamicType = ()>> {
    api: Api<K>,
    config: watcher::Config,
    cache: WatchCache<K>,
}

/// Local cache of a watch, folding watch events into handler notifications.
struct WatchCache<K: kube::Resource<DynamicType = ()>> {
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
    synced: AtomicBool,
    state: Mutex<State<K>>,
}

enum Notification {
    Add(DynObject),
    Update(DynObject, DynObject),
    Delete(DeletedObject),
}

impl<K> WatchInformer<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static,
{
    /// Creates an informer over `api` using the given watch configuration.
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self {
            api,
            config,
            cache: WatchCache::new(),
        }
    }

    /// Returns the number of objects currently cached.
    pub fn len(&self) -> usize {
        self.cache.state().cache.len()
    }

    /// Returns true if the cache holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached state of every object.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.cache.list()
    }

    /// Watches until `cancel` fires.
    ///
    /// Watch errors are logged and retried with the default `kube` backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        let kind = <K as kube::Resource>::kind(&());
        info!(kind = %kind, "starting watch informer");

        let mut stream = watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .boxed();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => self.cache.handle_event(event),
                Some(Err(err)) => warn!(kind = %kind, error = %err, "watch failed, retrying"),
                None => {
                    warn!(kind = %kind, "watch stream ended");
                    break;
                }
            }
        }

        info!(kind = %kind, "watch informer stopped");
    }
}

impl<K> WatchCache<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static,
{
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            state: Mutex::new(State {
                cache: HashMap::new(),
                relist: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.state().cache.values().cloned().collect()
    }

    /// Folds one watch event into the cache and notifies the handlers.
    fn handle_event(&self, event: watcher::Event<K>) {
        let notifications = {
            let mut state = self.state();
            match event {
                watcher::Event::Init => {
                    debug!("relist started");
                    state.relist = Some(HashMap::new());
                    Vec::new()
                }
                watcher::Event::InitApply(obj) => {
                    let obj = Arc::new(obj);
                    state
                        .relist
                        .get_or_insert_with(HashMap::new)
                        .insert(ObjectRef::from_obj(obj.as_ref()), obj);
                    Vec::new()
                }
                watcher::Event::InitDone => {
                    let relisted = state.relist.take().unwrap_or_default();
                    let previous = std::mem::replace(&mut state.cache, relisted);
                    let mut notifications = Vec::new();

                    for (key, obj) in &state.cache {
                        let new: DynObject = obj.clone();
                        match previous.get(key) {
                            Some(old) => {
                                let old: DynObject = old.clone();
                                notifications.push(Notification::Update(old, new));
                            }
                            None => notifications.push(Notification::Add(new)),
                        }
                    }
                    for (key, obj) in previous {
                        if !state.cache.contains_key(&key) {
                            let last: DynObject = obj;
                            notifications.push(Notification::Delete(DeletedObject::Tombstone(
                                DeletedFinalStateUnknown::new(last),
                            )));
                        }
                    }

                    self.synced.store(true, Ordering::SeqCst);
                    debug!(objects = state.cache.len(), "relist complete");
                    notifications
                }
                watcher::Event::Apply(obj) => {
                    let obj = Arc::new(obj);
                    let new: DynObject = obj.clone();
                    match state.cache.insert(ObjectRef::from_obj(obj.as_ref()), obj) {
                        Some(old) => vec![Notification::Update(old, new)],
                        None => vec![Notification::Add(new)],
                    }
                }
                watcher::Event::Delete(obj) => {
                    let obj = Arc::new(obj);
                    state.cache.remove(&ObjectRef::from_obj(obj.as_ref()));
                    vec![Notification::Delete(DeletedObject::Object(obj))]
                }
            }
        };

        if notifications.is_empty() {
            return;
        }
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for notification in notifications {
            for handler in &handlers {
                match &notification {
                    Notification::Add(obj) => handler.on_add(obj.clone()),
                    Notification::Update(old, new) => handler.on_update(old.clone(), new.clone()),
                    Notification::Delete(obj) => handler.on_delete(obj.clone()),
                }
            }
        }
    }
}

impl<K> Informer for WatchCache<K>
where
    K: kube::Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

impl<K> Informer for WatchInformer<K>
where
    K: kube::Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.cache.add_event_handler(handler);
    }

    fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }
}

impl<K: kube::Resource<DynamicType = ()>> fmt::Debug for WatchCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchCache")
            .field("kind", &<K as kube::Resource>::kind(&()))
            .field("synced", &self.synced.load(Ordering::SeqCst))
            .field("objects", &self.state.lock().unwrap_or_else(PoisonError::into_inner).cache.len())
            .finish()
    }
}

impl<K: kube::Resource<DynamicType = ()>> fmt::Debug for WatchInformer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchInformer")
            .field("cache", &self.cache)
            .finish()
    }
}
