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

//! In-memory fakes for testing controllers built on this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;

use crate::conditions::{
    set_operator_condition, OperatorClient, OperatorClientError, OperatorCondition, OperatorStatus,
};
use crate::events::Recorder;
use crate::informer::{
    DeletedFinalStateUnknown, DeletedObject, DynObject, Informer, ResourceEventHandler,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Informer whose events are driven by the test.
///
/// Starts out synced; use [`FakeInformer::set_synced`] to simulate a cache
/// that has not caught up yet.
#[derive(Default)]
pub struct FakeInformer {
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
    unsynced: AtomicBool,
}

impl FakeInformer {
    /// Creates a synced informer with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an informer that reports not synced until told otherwise.
    pub fn unsynced() -> Self {
        let informer = Self::default();
        informer.set_synced(false);
        informer
    }

    /// Sets what [`Informer::has_synced`] returns.
    pub fn set_synced(&self, synced: bool) {
        self.unsynced.store(!synced, Ordering::SeqCst);
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivers an add event.
    pub fn add(&self, obj: DynObject) {
        for handler in self.handlers() {
            handler.on_add(obj.clone());
        }
    }

    /// Delivers an update event.
    pub fn update(&self, old: DynObject, new: DynObject) {
        for handler in self.handlers() {
            handler.on_update(old.clone(), new.clone());
        }
    }

    /// Delivers an observed delete.
    pub fn delete(&self, obj: DynObject) {
        for handler in self.handlers() {
            handler.on_delete(DeletedObject::Object(obj.clone()));
        }
    }

    /// Delivers a delete whose final state is unknown.
    pub fn delete_final_state_unknown(&self, tombstone: DeletedFinalStateUnknown) {
        for handler in self.handlers() {
            handler.on_delete(DeletedObject::Tombstone(tombstone.clone()));
        }
    }
}

impl Informer for FakeInformer {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        !self.unsynced.load(Ordering::SeqCst)
    }
}

/// Operator client keeping its status in memory.
#[derive(Default)]
pub struct FakeOperatorClient {
    status: Mutex<OperatorStatus>,
    update_error: Mutex<Option<String>>,
    updates: Mutex<usize>,
}

impl FakeOperatorClient {
    /// Creates a client with an empty status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client whose status starts with `conditions`.
    pub fn with_conditions(conditions: Vec<OperatorCondition>) -> Self {
        let client = Self::default();
        lock(&client.status).conditions = conditions;
        client
    }

    /// Makes every following status update fail with `message`.
    pub fn fail_updates_with(&self, message: impl Into<String>) {
        *lock(&self.update_error) = Some(message.into());
    }

    /// Returns the number of successful status updates.
    pub fn update_count(&self) -> usize {
        *lock(&self.updates)
    }

    /// Returns a snapshot of the current status.
    pub fn status(&self) -> OperatorStatus {
        lock(&self.status).clone()
    }
}

#[async_trait]
impl OperatorClient for FakeOperatorClient {
    async fn get_operator_status(&self) -> Result<OperatorStatus, OperatorClientError> {
        Ok(self.status())
    }

    async fn apply_operator_conditions(
        &self,
        conditions: Vec<OperatorCondition>,
    ) -> Result<OperatorStatus, OperatorClientError> {
        if let Some(message) = lock(&self.update_error).clone() {
            return Err(OperatorClientError::Other(anyhow::Error::msg(message)));
        }

        let mut status = lock(&self.status);
        for condition in conditions {
            set_operator_condition(&mut status.conditions, condition);
        }
        *lock(&self.updates) += 1;
        Ok(status.clone())
    }
}

/// Whether a recorded event was a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Recorded through [`Recorder::event`].
    Normal,
    /// Recorded through [`Recorder::warning`].
    Warning,
}

/// One event captured by [`InMemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Normal or warning.
    pub event_type: EventType,
    /// Short CamelCase reason.
    pub reason: String,
    /// Event text.
    pub message: String,
}

/// Recorder that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl InMemoryRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all events recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    fn record(&self, event_type: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

impl Recorder for InMemoryRecorder {
    fn event(&self, reason: &str, message: &str) {
        self.record(EventType::Normal, reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.record(EventType::Warning, reason, message);
    }
}
