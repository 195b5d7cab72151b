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

//! Builder assembling a [`BaseController`] from a sync function and its inputs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::base_controller::{BaseController, PostStartHook, PreconditionFn, SyncFn};
use crate::conditions::{degraded_condition_type, OperatorClient};
use crate::controller::{default_fatal, BoxFuture, CancellationToken};
use crate::errors::SyncError;
use crate::events::Recorder;
use crate::informer::{Informer, RuntimeObject};
use crate::sync_context::{
    default_queue_keys_fn, namespace_checker, object_queue_keys_fn, EventFilter, QueueKey,
    QueueKeysFn, SyncContext,
};

struct InformerRegistration {
    informers: Vec<Arc<dyn Informer>>,
    keys_fn: Option<QueueKeysFn>,
    filter: Option<EventFilter>,
}

/// Collects everything a controller needs and builds it with
/// [`Factory::to_controller`].
///
/// # Example
///
/// ```ignore
/// let controller = Factory::new()
///     .with_sync(|cancel, ctx| async move { reconcile(cancel, ctx).await })
///     .with_informers([config_maps.clone() as Arc<dyn Informer>])
///     .resync_every(Duration::from_secs(60))
///     .to_controller("ConfigMapController", recorder);
/// ```
#[derive(Default)]
pub struct Factory {
    sync: Option<SyncFn>,
    sync_context: Option<SyncContext>,
    resync_interval: Duration,
    informers: Vec<InformerRegistration>,
    bare_informers: Vec<Arc<dyn Informer>>,
    queue_objects: bool,
    cache_sync_timeout: Option<Duration>,
    preconditions: Vec<PreconditionFn>,
    post_start_hooks: Vec<PostStartHook>,
    sync_degraded_client: Option<Arc<dyn OperatorClient>>,
    instance_name: Option<String>,
}

impl Factory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the function called for every dequeued key. Required.
    pub fn with_sync<F, Fut>(mut self, sync: F) -> Self
    where
        F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let sync: SyncFn = Arc::new(move |cancel: CancellationToken, ctx: SyncContext| {
            Box::pin(sync(cancel, ctx)) as BoxFuture<'static, _>
        });
        self.sync = Some(sync);
        self
    }

    /// Queues the default key for every event of `informers`.
    ///
    /// With [`Factory::with_queued_objects`] the object key is queued instead.
    pub fn with_informers<I>(self, informers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.register(informers, None, None)
    }

    /// Queues the keys returned by `keys_fn` for every event of `informers`.
    pub fn with_informers_queue_keys_fn<F, I>(self, keys_fn: F, informers: I) -> Self
    where
        F: Fn(&dyn RuntimeObject) -> Vec<QueueKey> + Send + Sync + 'static,
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.register(informers, Some(Arc::new(keys_fn)), None)
    }

    /// Like [`Factory::with_informers`], dropping events `filter` rejects.
    pub fn with_filtered_event_informers<P, I>(self, filter: P, informers: I) -> Self
    where
        P: Fn(&dyn RuntimeObject) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.register(informers, None, Some(Arc::new(filter)))
    }

    /// Combines a custom key function with an event filter.
    pub fn with_filtered_event_informers_queue_keys_fn<F, P, I>(
        self,
        keys_fn: F,
        filter: P,
        informers: I,
    ) -> Self
    where
        F: Fn(&dyn RuntimeObject) -> Vec<QueueKey> + Send + Sync + 'static,
        P: Fn(&dyn RuntimeObject) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.register(informers, Some(Arc::new(keys_fn)), Some(Arc::new(filter)))
    }

    /// Waits for `informers` to sync without reacting to their events.
    pub fn with_bare_informers<I>(mut self, informers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.bare_informers.extend(informers);
        self
    }

    /// Registers a namespace informer that only reacts to the namespaces
    /// named in `interesting`.
    pub fn with_namespace_informer<I, S>(self, informer: Arc<dyn Informer>, interesting: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = namespace_checker(interesting);
        self.register([informer], None, Some(filter))
    }

    /// Queues the default key every `interval`. Zero disables resync.
    pub fn resync_every(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Keeps the triggering object next to each key so the sync function can
    /// read it from [`SyncContext::queue_object`].
    pub fn with_queued_objects(mut self) -> Self {
        self.queue_objects = true;
        self
    }

    /// Uses `sync_context` instead of creating one in [`Factory::to_controller`].
    pub fn with_sync_context(mut self, sync_context: SyncContext) -> Self {
        self.sync_context = Some(sync_context);
        self
    }

    /// Bounds the wait for informer caches. Unbounded by default.
    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = Some(timeout);
        self
    }

    /// Adds a precondition that must report ready before workers start.
    ///
    /// Preconditions are checked in registration order; the first one not
    /// ready ends the round.
    pub fn with_precondition<F, Fut>(mut self, precondition: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let precondition: PreconditionFn = Arc::new(move |cancel: CancellationToken| {
            Box::pin(precondition(cancel)) as BoxFuture<'static, _>
        });
        self.preconditions.push(precondition);
        self
    }

    /// Adds a hook started together with the workers.
    pub fn with_post_start_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(CancellationToken, SyncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook: PostStartHook = Arc::new(move |cancel: CancellationToken, ctx: SyncContext| {
            Box::pin(hook(cancel, ctx)) as BoxFuture<'static, _>
        });
        self.post_start_hooks.push(hook);
        self
    }

    /// Reports every sync result on the controller's Degraded condition.
    pub fn with_sync_degraded_on_error(mut self, client: Arc<dyn OperatorClient>) -> Self {
        self.sync_degraded_client = Some(client);
        self
    }

    /// Names the Degraded condition after `instance_name` instead of the
    /// controller name.
    pub fn with_controller_instance_name(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    fn register<I>(
        mut self,
        informers: I,
        keys_fn: Option<QueueKeysFn>,
        filter: Option<EventFilter>,
    ) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Informer>>,
    {
        self.informers.push(InformerRegistration {
            informers: informers.into_iter().collect(),
            keys_fn,
            filter,
        });
        self
    }

    /// Builds the controller and hooks its event handlers into the informers.
    ///
    /// # Panics
    ///
    /// Panics if [`Factory::with_sync`] was never called.
    pub fn to_controller(self, name: &str, recorder: Arc<dyn Recorder>) -> BaseController {
        let Some(sync) = self.sync else {
            panic!("controller {name:?} has no sync function, call with_sync() before to_controller()");
        };

        let mut sync_context = self
            .sync_context
            .unwrap_or_else(|| SyncContext::new(name, recorder));
        if self.queue_objects {
            sync_context.track_objects();
        }
        let default_keys_fn = if sync_context.tracks_objects() {
            object_queue_keys_fn()
        } else {
            default_queue_keys_fn()
        };

        let mut cached_syncs: Vec<Arc<dyn Informer>> = Vec::new();
        for registration in self.informers {
            let keys_fn = registration
                .keys_fn
                .unwrap_or_else(|| Arc::clone(&default_keys_fn));
            for informer in registration.informers {
                informer.add_event_handler(
                    sync_context.event_handler(Arc::clone(&keys_fn), registration.filter.clone()),
                );
                cached_syncs.push(informer);
            }
        }
        cached_syncs.extend(self.bare_informers);

        let instance_name = self.instance_name.as_deref().unwrap_or(name);

        tracing::debug!(
            controller = %name,
            informers = cached_syncs.len(),
            resync = ?self.resync_interval,
            "built controller"
        );

        BaseController {
            name: name.to_string(),
            degraded_condition_type: degraded_condition_type(instance_name),
            sync,
            sync_context,
            resync_every: self.resync_interval,
            cached_syncs: Arc::new(cached_syncs),
            preconditions: Arc::new(self.preconditions),
            post_start_hooks: Arc::new(self.post_start_hooks),
            cache_sync_timeout: self.cache_sync_timeout,
            sync_degraded_client: self.sync_degraded_client,
            fatal: default_fatal(),
        }
    }
}
