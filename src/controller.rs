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

//! Core controller trait and types.
//!
//! This module defines the interface every runnable controller implements.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

// Re-export cancellation token for use in controller interface
pub use tokio_util::sync::CancellationToken;

use crate::errors::SyncError;
use crate::sync_context::SyncContext;

/// Boxed future returned by sync functions, preconditions and hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Message marking a wait that ran out of time.
pub const ERR_WAIT_TIMEOUT: &str = "timed out waiting for the condition";

/// Errors that stop a controller from running at all.
///
/// These are fatal: the controller hands them to its fatal handler, which
/// by default terminates the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Informer caches did not sync within the cache sync timeout.
    #[error("unable to sync caches for {0}")]
    CacheSyncTimeout(String),

    /// Preconditions were still failing when their wait ran out.
    #[error("{name} preconditions not met: [{}]", .errors.join(", "))]
    PreconditionsNotReady {
        /// Controller name.
        name: String,
        /// Last precondition error, if any, followed by the timeout marker.
        errors: Vec<String>,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Handler invoked on fatal controller errors.
pub type FatalFn = Arc<dyn Fn(&ControllerError) + Send + Sync>;

/// Logs the error and exits the process with status 1.
///
/// A controller that cannot observe its resources must not keep running
/// blind; the process supervisor is expected to restart it.
pub fn default_fatal() -> FatalFn {
    Arc::new(|err: &ControllerError| {
        tracing::error!(error = %err, "fatal controller error, exiting");
        std::process::exit(1);
    })
}

/// A runnable controller.
///
/// # Lifecycle
///
/// 1. The controller is built, usually via [`Factory::to_controller`](crate::factory::Factory::to_controller)
/// 2. [`Controller::run`] is called once with a cancellation token
/// 3. The controller runs until the token is cancelled
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    ///
    /// This name is used for:
    /// - Logging
    /// - The work queue name
    /// - The default Degraded condition type
    fn name(&self) -> &str;

    /// Runs the controller with `workers` concurrent workers.
    ///
    /// Blocks until `cancel` is triggered and every worker and hook has
    /// stopped, then returns `Ok(())`.
    async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()>;

    /// Runs one sync pass for the key carried by `sync_ctx`.
    async fn sync(
        &self,
        cancel: CancellationToken,
        sync_ctx: SyncContext,
    ) -> std::result::Result<(), SyncError>;
}
