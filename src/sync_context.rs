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

//! Sync context - the queue, current key and recorder handed to sync functions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::core::v1::Namespace;

use crate::events::Recorder;
use crate::informer::{meta_namespace_key, DeletedObject, DynObject, ResourceEventHandler, RuntimeObject};
use crate::queue::WorkQueue;
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

/// Identifies one unit of reconciliation work.
pub type QueueKey = String;

/// Key used when the work is not about one particular object, including
/// periodic resyncs.
pub const DEFAULT_QUEUE_KEY: &str = "";

/// Maps an object to the queue keys it should trigger.
pub type QueueKeysFn = Arc<dyn Fn(&dyn RuntimeObject) -> Vec<QueueKey> + Send + Sync>;

/// Decides whether an event for the given object is worth queueing.
pub type EventFilter = Arc<dyn Fn(&dyn RuntimeObject) -> bool + Send + Sync>;

/// Queues [`DEFAULT_QUEUE_KEY`] for every object.
pub fn default_queue_keys_fn() -> QueueKeysFn {
    Arc::new(|_: &dyn RuntimeObject| vec![DEFAULT_QUEUE_KEY.to_string()])
}

/// Queues the `<namespace>/<name>` key of every object.
pub fn object_queue_keys_fn() -> QueueKeysFn {
    Arc::new(|obj: &dyn RuntimeObject| vec![meta_namespace_key(obj)])
}

/// Returns a filter accepting only `Namespace` objects named in `interesting`.
///
/// Lets a cluster-wide namespace informer behave as if it only watched a
/// fixed set of namespaces. Any other kind of object is rejected.
pub fn namespace_checker<I, S>(interesting: I) -> EventFilter
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let interesting: HashSet<String> = interesting.into_iter().map(Into::into).collect();
    Arc::new(move |obj: &dyn RuntimeObject| {
        match obj.as_any().downcast_ref::<Namespace>() {
            Some(ns) => ns
                .metadata
                .name
                .as_deref()
                .is_some_and(|name| interesting.contains(name)),
            None => {
                tracing::warn!(kind = %obj.kind(), "unexpected object type in namespace event, dropping");
                false
            }
        }
    })
}

type ObjectStore = Arc<Mutex<HashMap<QueueKey, DynObject>>>;

fn lock(objects: &ObjectStore) -> MutexGuard<'_, HashMap<QueueKey, DynObject>> {
    objects.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-controller handle to the work queue and event recorder.
///
/// The controller keeps one long-lived context, keyed by the controller name,
/// to register event handlers. Every dequeued key gets a cheap copy sharing
/// the same queue and recorder but carrying that key.
#[derive(Clone)]
pub struct SyncContext {
    queue: WorkQueue<QueueKey>,
    queue_key: QueueKey,
    recorder: Arc<dyn Recorder>,

    /// Latest object per key, present only when objects travel with keys.
    objects: Option<ObjectStore>,

    /// The object that triggered this key, for per-item contexts.
    queue_object: Option<DynObject>,
}

impl SyncContext {
    /// Creates a sync context with the default controller rate limiter.
    pub fn new(name: impl Into<String>, recorder: Arc<dyn Recorder>) -> Self {
        Self::with_rate_limiter(name, recorder, default_controller_rate_limiter())
    }

    /// Creates a sync context whose queue uses `rate_limiter`.
    pub fn with_rate_limiter(
        name: impl Into<String>,
        recorder: Arc<dyn Recorder>,
        rate_limiter: impl RateLimiter<QueueKey> + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            queue: WorkQueue::with_rate_limiter(name.clone(), rate_limiter),
            queue_key: name,
            recorder,
            objects: None,
            queue_object: None,
        }
    }

    /// Returns the work queue shared by the whole controller.
    pub fn queue(&self) -> &WorkQueue<QueueKey> {
        &self.queue
    }

    /// Returns the key this context was created for.
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Returns the event recorder.
    pub fn recorder(&self) -> &dyn Recorder {
        self.recorder.as_ref()
    }

    /// Returns the most recent object seen for [`SyncContext::queue_key`].
    ///
    /// Only populated when the controller was built with
    /// [`Factory::with_queued_objects`](crate::factory::Factory::with_queued_objects).
    pub fn queue_object(&self) -> Option<&DynObject> {
        self.queue_object.as_ref()
    }

    pub(crate) fn track_objects(&mut self) {
        if self.objects.is_none() {
            self.objects = Some(Arc::new(Mutex::new(HashMap::new())));
        }
    }

    pub(crate) fn tracks_objects(&self) -> bool {
        self.objects.is_some()
    }

    /// Returns a copy of this context for one dequeued key.
    pub(crate) fn for_key(&self, key: QueueKey) -> Self {
        let queue_object = self
            .objects
            .as_ref()
            .and_then(|objects| lock(objects).get(&key).cloned());
        Self {
            queue: self.queue.clone(),
            queue_key: key,
            recorder: Arc::clone(&self.recorder),
            objects: self.objects.clone(),
            queue_object,
        }
    }

    /// Drops the stored object for this key unless a newer one arrived meanwhile.
    pub(crate) fn release_queue_object(&self) {
        let (Some(objects), Some(processed)) = (&self.objects, &self.queue_object) else {
            return;
        };
        let mut objects = lock(objects);
        if objects
            .get(&self.queue_key)
            .is_some_and(|current| Arc::ptr_eq(current, processed))
        {
            objects.remove(&self.queue_key);
        }
    }

    /// Builds an event handler that queues the keys `keys_fn` returns for
    /// every add, update and delete.
    ///
    /// Tombstones are unwrapped to their last known state first. When a
    /// `filter` is given, events it rejects are dropped.
    pub fn event_handler(
        &self,
        keys_fn: QueueKeysFn,
        filter: Option<EventFilter>,
    ) -> Arc<dyn ResourceEventHandler> {
        Arc::new(QueueEventHandler {
            queue: self.queue.clone(),
            objects: self.objects.clone(),
            keys_fn,
            filter,
        })
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("queue", &self.queue)
            .field("queue_key", &self.queue_key)
            .field("tracks_objects", &self.objects.is_some())
            .finish()
    }
}

struct QueueEventHandler {
    queue: WorkQueue<QueueKey>,
    objects: Option<ObjectStore>,
    keys_fn: QueueKeysFn,
    filter: Option<EventFilter>,
}

impl QueueEventHandler {
    fn enqueue(&self, obj: &DynObject) {
        if let Some(filter) = &self.filter {
            if !filter(obj.as_ref()) {
                return;
            }
        }

        for key in (self.keys_fn)(obj.as_ref()) {
            if let Some(objects) = &self.objects {
                lock(objects).insert(key.clone(), Arc::clone(obj));
            }
            self.queue.add(key);
        }
    }
}

impl ResourceEventHandler for QueueEventHandler {
    fn on_add(&self, obj: DynObject) {
        self.enqueue(&obj);
    }

    fn on_update(&self, _old: DynObject, new: DynObject) {
        self.enqueue(&new);
    }

    fn on_delete(&self, obj: DeletedObject) {
        self.enqueue(obj.object());
    }
}
