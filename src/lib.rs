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

//! kube-operator-runtime - A work-queue driven controller runtime for Kubernetes operators
//!
//! This library provides the building blocks shared by operator controllers:
//! - A rate-limited, de-duplicating work queue
//! - Informer contracts and a `kube` watch backed informer
//! - The `Factory` builder and the `BaseController` reconciliation loop
//! - Operator conditions and the mapping from sync errors onto them
//! - A manager running several controllers with graceful shutdown

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod base_controller;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod controller_manager;
pub mod errors;
pub mod events;
pub mod factory;
pub mod informer;
pub mod kube_informer;
pub mod queue;
pub mod rate_limiter;
pub mod sync_context;
pub mod testing;

// Re-export commonly used types
pub use base_controller::BaseController;
pub use conditions::{handle_error_conditions, OperatorClient, OperatorCondition};
pub use config::ControllerManagerConfig;
pub use controller::{CancellationToken, Controller, ControllerError};
pub use controller_manager::ControllerManager;
pub use errors::{ConditionError, SyncError};
pub use events::{LoggingRecorder, Recorder};
pub use factory::Factory;
pub use informer::{DynObject, Informer, ResourceEventHandler, RuntimeObject};
pub use kube_informer::WatchInformer;
pub use queue::WorkQueue;
pub use sync_context::{SyncContext, DEFAULT_QUEUE_KEY};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
