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

//! Informer and event handler contracts consumed by the controller runtime.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Any Kubernetes object an informer can deliver.
///
/// Implemented for every statically typed [`kube::Resource`], which covers
/// all `k8s-openapi` types and `#[derive(CustomResource)]` kinds.
pub trait RuntimeObject: Any + Send + Sync + fmt::Debug {
    /// Returns the object's kind, e.g. `Namespace`.
    fn kind(&self) -> Cow<'_, str>;

    /// Returns the object's metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Upcast used to recover the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl<K> RuntimeObject for K
where
    K: kube::Resource<DynamicType = ()> + Any + Send + Sync + fmt::Debug,
{
    fn kind(&self) -> Cow<'_, str> {
        <K as kube::Resource>::kind(&())
    }

    fn meta(&self) -> &ObjectMeta {
        kube::Resource::meta(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn RuntimeObject {
    /// Returns the object as `K` if that is its concrete type.
    pub fn downcast_ref<K: RuntimeObject>(&self) -> Option<&K> {
        self.as_any().downcast_ref::<K>()
    }
}

/// Shared handle to an object delivered by an informer.
pub type DynObject = Arc<dyn RuntimeObject>;

/// Returns the `<namespace>/<name>` key of an object, or just `<name>` for
/// cluster-scoped objects.
pub fn meta_namespace_key(obj: &dyn RuntimeObject) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    }
}

/// Placeholder delivered on delete when the informer missed the actual
/// deletion (for example across a relist) and only knows the last state.
#[derive(Debug, Clone)]
pub struct DeletedFinalStateUnknown {
    /// Cache key of the deleted object.
    pub key: String,

    /// Last known state of the object. May be stale.
    pub obj: DynObject,
}

impl DeletedFinalStateUnknown {
    /// Wraps the last known state of `obj`.
    pub fn new(obj: DynObject) -> Self {
        Self {
            key: meta_namespace_key(obj.as_ref()),
            obj,
        }
    }
}

/// The payload of a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    /// The deletion was observed directly.
    Object(DynObject),

    /// The deletion was inferred; only the last known state is available.
    Tombstone(DeletedFinalStateUnknown),
}

impl DeletedObject {
    /// Returns the deleted object, unwrapping tombstones to their last known state.
    pub fn object(&self) -> &DynObject {
        match self {
            DeletedObject::Object(obj) => obj,
            DeletedObject::Tombstone(tombstone) => &tombstone.obj,
        }
    }

    /// Returns true if the deletion was inferred rather than observed.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, DeletedObject::Tombstone(_))
    }
}

/// Callbacks an informer invokes as the objects it watches change.
pub trait ResourceEventHandler: Send + Sync {
    /// Called when an object is first observed.
    fn on_add(&self, obj: DynObject);

    /// Called when an observed object changes.
    fn on_update(&self, old: DynObject, new: DynObject);

    /// Called when an object goes away.
    fn on_delete(&self, obj: DeletedObject);
}

/// Anything that watches objects, notifies handlers, and knows whether its
/// local cache has caught up with the cluster.
pub trait Informer: Send + Sync {
    /// Registers a handler for all future events.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>);

    /// Returns true once the initial list has been delivered.
    fn has_synced(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};

    fn config_map(namespace: &str, name: &str) -> DynObject {
        Arc::new(ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_meta_namespace_key() {
        assert_eq!(meta_namespace_key(config_map("ns", "cm").as_ref()), "ns/cm");

        let ns: DynObject = Arc::new(Namespace {
            metadata: ObjectMeta {
                name: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(meta_namespace_key(ns.as_ref()), "kube-system");
        assert_eq!(ns.kind(), "Namespace");
    }

    #[test]
    fn test_downcast() {
        let obj = config_map("ns", "cm");
        assert!(obj.downcast_ref::<ConfigMap>().is_some());
        assert!(obj.downcast_ref::<Namespace>().is_none());
    }

    #[test]
    fn test_tombstone_unwraps_to_last_state() {
        let obj = config_map("ns", "gone");
        let deleted = DeletedObject::Tombstone(DeletedFinalStateUnknown::new(obj.clone()));

        assert!(deleted.is_tombstone());
        assert!(Arc::ptr_eq(deleted.object(), &obj));
        match deleted {
            DeletedObject::Tombstone(t) => assert_eq!(t.key, "ns/gone"),
            DeletedObject::Object(_) => unreachable!(),
        }
    }
}
