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

//! Event recording.

use std::fmt;

/// Sink for human readable events emitted by controllers.
///
/// The runtime only calls into a recorder; the owning process decides where
/// events end up (Kubernetes `Event` objects, logs, a test buffer).
pub trait Recorder: Send + Sync {
    /// Records a normal event.
    fn event(&self, reason: &str, message: &str);

    /// Records a warning event.
    fn warning(&self, reason: &str, message: &str);
}

/// Recorder that writes events to the `tracing` log.
#[derive(Clone)]
pub struct LoggingRecorder {
    component: String,
}

impl LoggingRecorder {
    /// Creates a recorder attributing events to `component`.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl fmt::Debug for LoggingRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingRecorder")
            .field("component", &self.component)
            .finish()
    }
}

impl Recorder for LoggingRecorder {
    fn event(&self, reason: &str, message: &str) {
        tracing::info!(component = %self.component, reason = %reason, "{}", message);
    }

    fn warning(&self, reason: &str, message: &str) {
        tracing::warn!(component = %self.component, reason = %reason, "{}", message);
    }
}
