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

//! The reconciliation loop behind every factory-built controller.
//!
//! [`BaseController::run`] moves through these phases:
//!
//! 1. Wait for every informer cache to sync, bounded by the cache sync timeout.
//! 2. Poll the preconditions with backoff until they all report ready. Each
//!    round's token is cancelled once the precondition deadline passes.
//! 3. Start the workers, the resync ticker and the post-start hooks.
//! 4. On cancellation, shut the queue down, let the workers drain it and wait
//!    for every task to finish.
//!
//! A timeout in phase 1 or 2 is fatal and goes to the fatal handler.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::conditions::{sync_degraded_condition, OperatorClient};
use crate::controller::{
    BoxFuture, CancellationToken, Controller, ControllerError, FatalFn, Result, ERR_WAIT_TIMEOUT,
};
use crate::errors::SyncError;
use crate::informer::Informer;
use crate::queue::WorkQueue;
use crate::sync_context::{QueueKey, SyncContext, DEFAULT_QUEUE_KEY};

/// The business logic of a controller, called once per dequeued key.
pub type SyncFn = Arc<
    dyn Fn(CancellationToken, SyncContext) -> BoxFuture<'static, std::result::Result<(), SyncError>>
        + Send
        + Sync,
>;

/// Gate checked before any worker starts; `Ok(false)` means not ready yet.
pub type PreconditionFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Long-running task started next to the workers; expected to return once
/// its token is cancelled.
pub type PostStartHook = Arc<
    dyn Fn(CancellationToken, SyncContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// How often informer caches are polled while waiting for them to sync.
pub const CACHE_SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Bound on the precondition wait when no cache sync timeout is configured.
pub const DEFAULT_PRECONDITION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const PRECONDITION_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const PRECONDITION_MAX_BACKOFF: Duration = Duration::from_secs(5);
const PRECONDITION_JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Ready,
    Cancelled,
}

fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..PRECONDITION_JITTER);
    base.mul_f64(factor)
}

/// A controller assembled by [`Factory`](crate::factory::Factory).
///
/// Cloning is cheap; clones share the queue and all configuration.
#[derive(Clone)]
pub struct BaseController {
    pub(crate) name: String,
    pub(crate) degraded_condition_type: String,
    pub(crate) sync: SyncFn,
    pub(crate) sync_context: SyncContext,
    pub(crate) resync_every: Duration,
    pub(crate) cached_syncs: Arc<Vec<Arc<dyn Informer>>>,
    pub(crate) preconditions: Arc<Vec<PreconditionFn>>,
    pub(crate) post_start_hooks: Arc<Vec<PostStartHook>>,
    pub(crate) cache_sync_timeout: Option<Duration>,
    pub(crate) sync_degraded_client: Option<Arc<dyn OperatorClient>>,
    pub(crate) fatal: FatalFn,
}

impl fmt::Debug for BaseController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseController")
            .field("name", &self.name)
            .field("resync_every", &self.resync_every)
            .field("informers", &self.cached_syncs.len())
            .field("preconditions", &self.preconditions.len())
            .field("post_start_hooks", &self.post_start_hooks.len())
            .field("cache_sync_timeout", &self.cache_sync_timeout)
            .field("sync_degraded", &self.sync_degraded_client.is_some())
            .finish()
    }
}

impl BaseController {
    /// Replaces the handler for fatal errors, which exits the process by default.
    pub fn with_fatal_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ControllerError) + Send + Sync + 'static,
    {
        self.fatal = Arc::new(handler);
        self
    }

    /// Returns the long-lived sync context used to register event handlers.
    pub fn sync_context(&self) -> &SyncContext {
        &self.sync_context
    }

    /// Returns the condition type reported when sync-degraded reporting is on.
    pub fn degraded_condition_type(&self) -> &str {
        &self.degraded_condition_type
    }

    fn fail(&self, err: ControllerError) -> Result<()> {
        error!(controller = %self.name, error = %err, "controller cannot start");
        (self.fatal)(&err);
        Err(err)
    }

    async fn wait_for_caches(&self, cancel: &CancellationToken) -> Result<WaitOutcome> {
        if self.cached_syncs.is_empty() {
            return Ok(WaitOutcome::Ready);
        }
        info!(controller = %self.name, "waiting for caches to sync");

        let poll = async {
            while !self.cached_syncs.iter().all(|informer| informer.has_synced()) {
                tokio::time::sleep(CACHE_SYNC_POLL_PERIOD).await;
            }
        };
        let bounded = async {
            match self.cache_sync_timeout {
                Some(timeout) => tokio::time::timeout(timeout, poll).await.is_ok(),
                None => {
                    poll.await;
                    true
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
            synced = bounded => {
                if synced {
                    info!(controller = %self.name, "caches are synced");
                    Ok(WaitOutcome::Ready)
                } else if cancel.is_cancelled() {
                    Ok(WaitOutcome::Cancelled)
                } else {
                    Err(ControllerError::CacheSyncTimeout(self.name.clone()))
                }
            }
        }
    }

    async fn check_preconditions(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        for precondition in self.preconditions.iter() {
            if !precondition(cancel.clone()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn preconditions_timed_out(&self, last_error: Option<String>) -> ControllerError {
        let mut errors: Vec<String> = last_error.into_iter().collect();
        errors.push(ERR_WAIT_TIMEOUT.to_string());
        ControllerError::PreconditionsNotReady {
            name: self.name.clone(),
            errors,
        }
    }

    async fn wait_for_preconditions(&self, cancel: &CancellationToken) -> Result<WaitOutcome> {
        if self.preconditions.is_empty() {
            return Ok(WaitOutcome::Ready);
        }

        let timeout = self
            .cache_sync_timeout
            .unwrap_or(DEFAULT_PRECONDITION_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let mut backoff = PRECONDITION_INITIAL_BACKOFF;
        let mut last_error: Option<String> = None;

        loop {
            // Preconditions see a token that also fires at the deadline.
            let round = cancel.child_token();
            let checked = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                checked = tokio::time::timeout_at(deadline, self.check_preconditions(&round)) => checked,
            };
            round.cancel();

            match checked {
                Ok(Ok(true)) => return Ok(WaitOutcome::Ready),
                Ok(Ok(false)) => {
                    debug!(controller = %self.name, "preconditions not ready yet");
                }
                Ok(Err(err)) => {
                    warn!(controller = %self.name, error = %err, "precondition check failed");
                    last_error = Some(format!("{err:#}"));
                }
                Err(_) => {
                    warn!(controller = %self.name, "precondition check did not finish before the deadline");
                    return Err(self.preconditions_timed_out(last_error));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.preconditions_timed_out(last_error));
            }

            let pause = jittered(backoff).min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
            backoff = (backoff * 2).min(PRECONDITION_MAX_BACKOFF);
        }
    }

    /// Runs the sync function and, when configured, reports the outcome on
    /// the Degraded condition.
    async fn reconcile(
        &self,
        cancel: CancellationToken,
        sync_ctx: SyncContext,
    ) -> std::result::Result<(), SyncError> {
        let result = (self.sync)(cancel, sync_ctx).await;

        let Some(client) = &self.sync_degraded_client else {
            return result;
        };
        let Some(condition) = sync_degraded_condition(&self.degraded_condition_type, &result) else {
            return result;
        };

        match (result, client.apply_operator_conditions(vec![condition]).await) {
            (Ok(()), Ok(_)) => Ok(()),
            (Ok(()), Err(update_err)) => Err(SyncError::StatusUpdate(update_err)),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(update_err)) => {
                warn!(
                    controller = %self.name,
                    error = %update_err,
                    "unable to update {}", self.degraded_condition_type
                );
                Err(err)
            }
        }
    }

    async fn process_next_work_item(&self, cancel: &CancellationToken) -> bool {
        let queue = self.sync_context.queue();
        let Some(key) = queue.get().await else {
            return false;
        };

        let sync_ctx = self.sync_context.for_key(key.clone());
        let result = AssertUnwindSafe(self.reconcile(cancel.clone(), sync_ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SyncError::msg("sync panicked")));

        match result {
            Ok(()) => {
                debug!(controller = %self.name, key = %key, "synced");
                queue.forget(&key);
                sync_ctx.release_queue_object();
            }
            Err(err) if err.is_synthetic_requeue() => {
                debug!(controller = %self.name, key = %key, "requeue requested");
                queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                error!(
                    controller = %self.name,
                    key = %key,
                    error = %err,
                    "sync failed, requeuing with backoff"
                );
                queue.add_rate_limited(key.clone());
            }
        }

        queue.done(&key);
        true
    }

    async fn run_worker(self, cancel: CancellationToken, worker: usize) {
        debug!(controller = %self.name, worker, "starting worker");
        while self.process_next_work_item(&cancel).await {}
        debug!(controller = %self.name, worker, "worker stopped");
    }

    async fn run_resync(queue: WorkQueue<QueueKey>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => queue.add(DEFAULT_QUEUE_KEY.to_string()),
            }
        }
    }
}

#[async_trait]
impl Controller for BaseController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()> {
        match self.wait_for_caches(&cancel).await {
            Ok(WaitOutcome::Ready) => {}
            Ok(WaitOutcome::Cancelled) => {
                info!(controller = %self.name, "shutdown requested while waiting for caches");
                return Ok(());
            }
            Err(err) => return self.fail(err),
        }

        match self.wait_for_preconditions(&cancel).await {
            Ok(WaitOutcome::Ready) => {}
            Ok(WaitOutcome::Cancelled) => {
                info!(controller = %self.name, "shutdown requested while checking preconditions");
                return Ok(());
            }
            Err(err) => return self.fail(err),
        }

        let mut tasks = JoinSet::new();

        for worker in 1..=workers {
            info!(controller = %self.name, "starting #{} worker", worker);
            tasks.spawn(self.clone().run_worker(cancel.clone(), worker));
        }

        if !self.resync_every.is_zero() {
            tasks.spawn(Self::run_resync(
                self.sync_context.queue().clone(),
                self.resync_every,
                cancel.clone(),
            ));
        }

        for (index, hook) in self.post_start_hooks.iter().enumerate() {
            let hook = Arc::clone(hook);
            let name = self.name.clone();
            let hook_cancel = cancel.clone();
            let sync_ctx = self.sync_context.clone();
            tasks.spawn(async move {
                if let Err(err) = hook(hook_cancel, sync_ctx).await {
                    warn!(controller = %name, hook = index, error = %err, "post start hook failed");
                }
            });
        }

        cancel.cancelled().await;
        info!(controller = %self.name, "shutting down");
        self.sync_context.queue().shut_down();

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(controller = %self.name, error = %err, "controller task failed");
            }
        }
        info!(controller = %self.name, "all workers have been terminated");
        Ok(())
    }

    async fn sync(
        &self,
        cancel: CancellationToken,
        sync_ctx: SyncContext,
    ) -> std::result::Result<(), SyncError> {
        (self.sync)(cancel, sync_ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::conditions::{find_operator_condition, ConditionStatus, REASON_AS_EXPECTED, REASON_SYNC_ERROR};
    use crate::factory::Factory;
    use crate::testing::{FakeInformer, FakeOperatorClient, InMemoryRecorder};

    type Fatals = Arc<Mutex<Vec<ControllerError>>>;

    fn with_recorded_fatals(controller: BaseController) -> (BaseController, Fatals) {
        let fatals: Fatals = Arc::default();
        let sink = Arc::clone(&fatals);
        let controller = controller.with_fatal_handler(move |err| sink.lock().unwrap().push(err.clone()));
        (controller, fatals)
    }

    fn spawn_run(controller: &BaseController, workers: usize) -> (CancellationToken, JoinHandle<Result<()>>) {
        let cancel = CancellationToken::new();
        let controller = controller.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { controller.run(workers, token).await });
        (cancel, handle)
    }

    /// Sync function reporting every key it sees and failing the first
    /// `failures` calls.
    fn reporting_sync(failures: usize) -> (Factory, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = Factory::new().with_sync(move |_, ctx: SyncContext| {
            let tx = tx.clone();
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = tx.send(ctx.queue_key().to_string());
                if call < failures {
                    Err(SyncError::msg(format!("failure {call}")))
                } else {
                    Ok(())
                }
            }
        });
        (factory, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for sync")
            .expect("sync channel closed")
    }

    fn recorder() -> Arc<InMemoryRecorder> {
        Arc::new(InMemoryRecorder::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_queues_default_key() {
        let (factory, mut rx) = reporting_sync(0);
        let controller = factory
            .resync_every(Duration::from_secs(1))
            .to_controller("Test", recorder());
        let (cancel, handle) = spawn_run(&controller, 1);

        assert_eq!(next(&mut rx).await, DEFAULT_QUEUE_KEY);
        assert_eq!(next(&mut rx).await, DEFAULT_QUEUE_KEY);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_sync_timeout_is_fatal() {
        let informer = Arc::new(FakeInformer::unsynced());
        let (factory, _rx) = reporting_sync(0);
        let (controller, fatals) = with_recorded_fatals(
            factory
                .with_informers([informer as Arc<dyn Informer>])
                .with_cache_sync_timeout(Duration::from_secs(1))
                .to_controller("Test", recorder()),
        );

        let (_cancel, handle) = spawn_run(&controller, 1);
        let err = handle.await.unwrap().unwrap_err();

        assert_eq!(err, ControllerError::CacheSyncTimeout("Test".to_string()));
        assert_eq!(fatals.lock().unwrap().as_slice(), &[err]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_caches_is_clean() {
        let informer = Arc::new(FakeInformer::unsynced());
        let (factory, _rx) = reporting_sync(0);
        let (controller, fatals) = with_recorded_fatals(
            factory
                .with_informers([informer as Arc<dyn Informer>])
                .with_cache_sync_timeout(Duration::from_secs(10))
                .to_controller("Test", recorder()),
        );

        let (cancel, handle) = spawn_run(&controller, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert!(fatals.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_start_once_caches_sync() {
        let informer = Arc::new(FakeInformer::unsynced());
        let (factory, mut rx) = reporting_sync(0);
        let controller = factory
            .with_informers([informer.clone() as Arc<dyn Informer>])
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("early".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        informer.set_synced(true);
        assert_eq!(next(&mut rx).await, "early");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions_are_retried_until_ready() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        let (factory, mut rx) = reporting_sync(0);
        let controller = factory
            .with_precondition(move |_| {
                let round = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(round >= 2) }
            })
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);
        assert_eq!(next(&mut rx).await, "key");
        assert_eq!(checks.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_precondition_error_reported_at_deadline() {
        let (factory, mut rx) = reporting_sync(0);
        let (controller, fatals) = with_recorded_fatals(
            factory
                .with_precondition(|_| async { Err::<bool, _>(anyhow::anyhow!("etcd not ready")) })
                .with_cache_sync_timeout(Duration::from_secs(2))
                .to_controller("Test", recorder()),
        );
        controller.sync_context().queue().add("key".to_string());

        let (_cancel, handle) = spawn_run(&controller, 1);
        let err = handle.await.unwrap().unwrap_err();

        let message = err.to_string();
        assert!(message.contains("etcd not ready"), "{message}");
        assert!(message.contains(ERR_WAIT_TIMEOUT), "{message}");
        assert_eq!(fatals.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_precondition_is_bounded_by_timeout() {
        let (factory, mut rx) = reporting_sync(0);
        let (controller, fatals) = with_recorded_fatals(
            factory
                .with_precondition(|cancel: CancellationToken| async move {
                    cancel.cancelled().await;
                    Ok::<_, anyhow::Error>(false)
                })
                .with_cache_sync_timeout(Duration::from_secs(1))
                .to_controller("Test", recorder()),
        );
        controller.sync_context().queue().add("key".to_string());

        let started = Instant::now();
        let (_cancel, handle) = spawn_run(&controller, 1);
        let err = tokio::time::timeout(Duration::from_secs(3600), handle)
            .await
            .expect("run did not return")
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ControllerError::PreconditionsNotReady { .. }));
        assert!(err.to_string().contains(ERR_WAIT_TIMEOUT), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fatals.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_queued_keys() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = Factory::new()
            .with_sync(move |_, ctx: SyncContext| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _ = tx.send(ctx.queue_key().to_string());
                    Ok::<_, SyncError>(())
                }
            })
            .to_controller("Test", recorder());
        let keys = ["a", "b", "c", "d"];
        for key in keys {
            controller.sync_context().queue().add(key.to_string());
        }

        let (cancel, handle) = spawn_run(&controller, 1);
        assert_eq!(next(&mut rx).await, "a");
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let mut synced = vec!["a".to_string()];
        while let Ok(key) = rx.try_recv() {
            synced.push(key);
        }
        assert_eq!(synced, keys);
        assert!(controller.sync_context().queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_is_requeued_then_forgotten() {
        let (factory, mut rx) = reporting_sync(2);
        let controller = factory.to_controller("Test", recorder());
        let queue = controller.sync_context().queue().clone();
        queue.add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 2);
        for _ in 0..3 {
            assert_eq!(next(&mut rx).await, "key");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.num_requeues(&"key".to_string()), 0);
        assert!(queue.is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sync_is_requeued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let controller = Factory::new()
            .with_sync(move |_, _| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        panic!("boom");
                    }
                    Ok::<_, SyncError>(())
                }
            })
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_degraded_condition_follows_sync_result() {
        let client = Arc::new(FakeOperatorClient::new());
        let (factory, mut rx) = reporting_sync(1);
        let controller = factory
            .with_sync_degraded_on_error(client.clone())
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);

        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let status = client.status();
        let degraded = find_operator_condition(&status.conditions, "TestDegraded").unwrap();
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, REASON_SYNC_ERROR);
        assert_eq!(degraded.message, "failure 0");

        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = client.status();
        let degraded = find_operator_condition(&status.conditions, "TestDegraded").unwrap();
        assert_eq!(degraded.status, ConditionStatus::False);
        assert_eq!(degraded.reason, REASON_AS_EXPECTED);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_requeue_leaves_degraded_untouched() {
        let client = Arc::new(FakeOperatorClient::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let controller = Factory::new()
            .with_sync(move |_, _| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(SyncError::SyntheticRequeue)
                    } else {
                        Ok(())
                    }
                }
            })
            .with_sync_degraded_on_error(client.clone())
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.update_count(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_update_requeues_successful_sync() {
        let client = Arc::new(FakeOperatorClient::new());
        client.fail_updates_with("apiserver down");
        let (factory, mut rx) = reporting_sync(0);
        let controller = factory
            .with_sync_degraded_on_error(client.clone())
            .to_controller("Test", recorder());
        controller.sync_context().queue().add("key".to_string());

        let (cancel, handle) = spawn_run(&controller, 1);
        assert_eq!(next(&mut rx).await, "key");
        assert_eq!(next(&mut rx).await, "key");
        assert_eq!(client.update_count(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_start_hook_sees_cancellation() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicUsize::new(0));
        let stopped_flag = Arc::clone(&stopped);
        let (factory, _rx) = reporting_sync(0);
        let controller = factory
            .with_post_start_hook(move |cancel, ctx: SyncContext| {
                let started_tx = started_tx.clone();
                let stopped = Arc::clone(&stopped_flag);
                async move {
                    let _ = started_tx.send(ctx.queue_key().to_string());
                    cancel.cancelled().await;
                    stopped.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .to_controller("Test", recorder());

        let (cancel, handle) = spawn_run(&controller, 1);
        assert_eq!(next(&mut started_rx).await, "Test");
        assert_eq!(stopped.load(Ordering::SeqCst), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_calls_sync_function_directly() {
        let (factory, mut rx) = reporting_sync(1);
        let controller = factory.to_controller("Test", recorder());
        let ctx = controller.sync_context().for_key("direct".to_string());

        let err = controller
            .sync(CancellationToken::new(), ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failure 0");
        assert_eq!(rx.recv().await.unwrap(), "direct");
        assert!(controller.sync_context().queue().is_empty());
    }
}
