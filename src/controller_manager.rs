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

//! Controller manager - runs a set of controllers side by side.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerManagerConfig;
use crate::controller::{Controller, ControllerError, Result};

struct ManagedController {
    controller: Arc<dyn Controller>,
    workers: usize,
}

/// Runs several controllers until shutdown.
///
/// This:
/// 1. Starts every controller, spacing the starts by a jittered interval
/// 2. Cancels all of them when shutdown is requested or one fails
/// 3. Waits a bounded time for them to stop, logging the ones that do not
///
/// # Example
///
/// ```ignore
/// let mut manager = ControllerManager::new(&config);
/// manager.add_controller(Arc::new(controller), config.workers);
///
/// let token = manager.shutdown_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     token.cancel();
/// });
/// manager.run().await?;
/// ```
pub struct ControllerManager {
    /// Base delay between two controller starts.
    start_interval: Duration,

    /// Maximum time to wait for controllers once shutdown begins.
    shutdown_timeout: Duration,

    controllers: Vec<ManagedController>,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a manager using the start interval and shutdown timeout of `config`.
    pub fn new(config: &ControllerManagerConfig) -> Self {
        Self::with_timings(config.controller_start_interval, config.shutdown_timeout)
    }

    /// Creates a manager with explicit timings.
    pub fn with_timings(start_interval: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            start_interval,
            shutdown_timeout,
            controllers: Vec::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Adds a controller to run with `workers` concurrent workers.
    ///
    /// # Panics
    ///
    /// Panics if a controller with the same name was already added.
    pub fn add_controller(&mut self, controller: Arc<dyn Controller>, workers: usize) -> &mut Self {
        if self
            .controllers
            .iter()
            .any(|managed| managed.controller.name() == controller.name())
        {
            panic!("controller {:?} registered twice", controller.name());
        }
        self.controllers.push(ManagedController { controller, workers });
        self
    }

    /// Returns the names of the added controllers in start order.
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers
            .iter()
            .map(|managed| managed.controller.name())
            .collect()
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    fn jittered_start_interval(&self) -> Duration {
        let jitter = rand::random::<f64>();
        self.start_interval.mul_f64(1.0 + jitter)
    }

    /// Runs every controller until shutdown.
    ///
    /// Returns the first error a controller stopped with, after the others
    /// have been asked to stop.
    pub async fn run(&self) -> Result<()> {
        if self.controllers.is_empty() {
            tracing::warn!("no controllers added, exiting");
            return Ok(());
        }
        tracing::info!("starting {} controllers", self.controllers.len());

        let mut join_set = JoinSet::new();
        let mut start_delay = Duration::ZERO;

        for managed in &self.controllers {
            let controller = Arc::clone(&managed.controller);
            let workers = managed.workers;
            let name = controller.name().to_string();
            let cancel = self.shutdown_token.clone();
            let running = Arc::clone(&self.running_controllers);
            let delay = start_delay;
            start_delay += self.jittered_start_interval();

            join_set.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return (name, Ok(())),
                    _ = tokio::time::sleep(delay) => {}
                }

                tracing::info!(controller = %name, workers, "starting controller");
                running.write().await.insert(name.clone());

                let result = controller.run(workers, cancel).await;

                running.write().await.remove(&name);
                match &result {
                    Ok(()) => tracing::info!(controller = %name, "controller terminated"),
                    Err(e) => {
                        tracing::error!(controller = %name, error = %e, "controller terminated with error")
                    }
                }
                (name, result)
            });
        }

        let mut first_error: Option<ControllerError> = None;

        tokio::select! {
            _ = async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((name, Err(e))) => {
                            tracing::error!(controller = %name, error = %e, "controller failed, stopping the others");
                            first_error = Some(e);
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "controller task failed, stopping the others");
                            return;
                        }
                    }
                }
            } => {}

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.shutdown_token.cancel();
        self.wait_for_shutdown(&mut join_set).await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait_for_shutdown(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                if !running.is_empty() {
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                }
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::errors::SyncError;
    use crate::sync_context::SyncContext;

    enum Behavior {
        UntilCancelled,
        IgnoreCancel,
        FailImmediately,
    }

    struct TestController {
        name: String,
        behavior: Behavior,
        started_with: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl TestController {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                started_with: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Controller for TestController {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()> {
            self.started_with.store(workers, Ordering::SeqCst);
            match self.behavior {
                Behavior::UntilCancelled => cancel.cancelled().await,
                Behavior::IgnoreCancel => std::future::pending::<()>().await,
                Behavior::FailImmediately => {
                    return Err(ControllerError::CacheSyncTimeout(self.name.clone()))
                }
            }
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn sync(
            &self,
            _cancel: CancellationToken,
            _sync_ctx: SyncContext,
        ) -> std::result::Result<(), SyncError> {
            Ok(())
        }
    }

    fn manager() -> ControllerManager {
        ControllerManager::new(&ControllerManagerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_controllers_start_and_stop_on_shutdown() {
        let first = TestController::new("first", Behavior::UntilCancelled);
        let second = TestController::new("second", Behavior::UntilCancelled);

        let mut manager = manager();
        manager
            .add_controller(first.clone(), 2)
            .add_controller(second.clone(), 5);
        assert_eq!(manager.controller_names(), vec!["first", "second"]);

        let token = manager.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });
        manager.run().await.unwrap();

        assert_eq!(first.started_with.load(Ordering::SeqCst), 2);
        assert_eq!(second.started_with.load(Ordering::SeqCst), 5);
        assert_eq!(first.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(second.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_controller_stops_the_others() {
        let healthy = TestController::new("healthy", Behavior::UntilCancelled);
        let broken = TestController::new("broken", Behavior::FailImmediately);

        let mut manager = manager();
        manager
            .add_controller(healthy.clone(), 1)
            .add_controller(broken, 1);

        let err = manager.run().await.unwrap_err();
        assert_eq!(err, ControllerError::CacheSyncTimeout("broken".to_string()));
        assert_eq!(healthy.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_bounds_the_wait() {
        let stuck = TestController::new("stuck", Behavior::IgnoreCancel);

        let mut manager = ControllerManager::with_timings(Duration::ZERO, Duration::from_secs(3));
        manager.add_controller(stuck.clone(), 1);

        let started = tokio::time::Instant::now();
        let token = manager.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        manager.run().await.unwrap();

        assert_eq!(stuck.started_with.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_controllers() {
        manager().run().await.unwrap();
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_names_panic() {
        let mut manager = manager();
        manager
            .add_controller(TestController::new("same", Behavior::UntilCancelled), 1)
            .add_controller(TestController::new("same", Behavior::UntilCancelled), 1);
    }
}
