//! In-process resource store
//!
//! Mirrors the API server behaviour the reconcilers rely on: resource
//! versions, generations, finalizer-gated deletion and owner-reference
//! garbage collection.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde_json::Value;

use super::{ObjectRef, ResourceStore};
use crate::error::{Error, Result};

type Key = (String, String, Option<String>, String);

fn key_of(r: &ObjectRef) -> Key {
    (
        r.gvk.group.clone(),
        r.gvk.kind.clone(),
        r.namespace.clone(),
        r.name.clone(),
    )
}

/// [`ResourceStore`] holding objects in memory
///
/// Every kind is namespaced unless registered with
/// [`MemoryStore::register_cluster_scoped`].
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    cluster_scoped: Mutex<HashSet<(String, String)>>,
    version: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat a kind as cluster-scoped
    pub fn register_cluster_scoped(&self, gvk: &GroupVersionKind) {
        self.cluster_scoped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((gvk.group.clone(), gvk.kind.clone()));
    }

    /// Number of successful writes since creation
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// All live objects of a kind, ordered by namespace and name
    pub fn list(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.lock()
            .iter()
            .filter(|((group, kind, _, _), _)| *group == gvk.group && *kind == gvk.kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Erase an object immediately, ignoring its finalizers
    pub fn force_delete(&self, key: &ObjectRef) -> bool {
        self.lock().remove(&key_of(key)).is_some()
    }

    /// Delete every object whose owners are all gone, until nothing changes.
    /// Returns the objects that were deleted or marked for deletion.
    pub fn collect_garbage(&self) -> Vec<ObjectRef> {
        let mut collected = Vec::new();
        loop {
            let mut objects = self.lock();
            let live: HashSet<String> = objects.values().filter_map(|o| o.uid()).collect();
            let orphans: Vec<Key> = objects
                .iter()
                .filter(|(_, o)| o.metadata.deletion_timestamp.is_none())
                .filter(|(_, o)| {
                    let owners = o.owner_references();
                    !owners.is_empty() && owners.iter().all(|r| !live.contains(&r.uid))
                })
                .map(|(k, _)| k.clone())
                .collect();
            if orphans.is_empty() {
                return collected;
            }

            for key in orphans {
                let Some(obj) = objects.get_mut(&key) else {
                    continue;
                };
                if let Ok(r) = ObjectRef::from_object(obj) {
                    collected.push(r);
                }
                if obj.finalizers().is_empty() {
                    objects.remove(&key);
                } else {
                    obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    obj.metadata.resource_version = Some(self.next_version());
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, DynamicObject>> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_version(stored: &DynamicObject, requested: Option<&str>, key: &ObjectRef) -> Result<()> {
        match requested {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_deref() => {
                Err(Error::Conflict(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Store an updated object, erasing it once a deletion has no finalizers left
    fn commit(&self, objects: &mut BTreeMap<Key, DynamicObject>, key: Key, mut obj: DynamicObject) -> DynamicObject {
        obj.metadata.resource_version = Some(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        if obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            objects.remove(&key);
        } else {
            objects.insert(key, obj.clone());
        }
        obj
    }
}

/// Generation after an update: bumped when anything besides metadata and
/// status changed
fn next_generation(stored: &DynamicObject, updated: &DynamicObject) -> Option<i64> {
    let content = |obj: &DynamicObject| {
        let mut data = obj.data.clone();
        if let Value::Object(fields) = &mut data {
            fields.remove("status");
        }
        data
    };
    let generation = stored.metadata.generation.unwrap_or(1);
    if content(stored) == content(updated) {
        Some(generation)
    } else {
        Some(generation + 1)
    }
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(existing) = target {
        for (k, v) in fields {
            if v.is_null() {
                existing.remove(k);
            } else {
                merge(existing.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ObjectRef) -> Result<Option<DynamicObject>> {
        Ok(self.lock().get(&key_of(key)).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::from_object(obj)?;
        let mut objects = self.lock();
        if objects.contains_key(&key_of(&key)) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }

        let mut created = obj.clone();
        let serial = self.version.load(Ordering::SeqCst) + 1;
        created.metadata.uid = Some(format!("uid-{}-{}", key.name, serial));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.deletion_timestamp = None;
        created.metadata.generation = Some(1);
        Ok(self.commit(&mut objects, key_of(&key), created))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::from_object(obj)?;
        let mut objects = self.lock();
        let stored = objects
            .get(&key_of(&key))
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Self::check_version(stored, obj.metadata.resource_version.as_deref(), &key)?;

        let mut replaced = obj.clone();
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        replaced.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        replaced.metadata.generation = next_generation(stored, &replaced);
        Ok(self.commit(&mut objects, key_of(&key), replaced))
    }

    async fn patch_merge(&self, key: &ObjectRef, patch: &Value) -> Result<DynamicObject> {
        let mut objects = self.lock();
        let stored = objects
            .get(&key_of(key))
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let requested = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        Self::check_version(stored, requested, key)?;

        let mut value = serde_json::to_value(stored)?;
        merge(&mut value, patch);
        let mut patched: DynamicObject = serde_json::from_value(value)?;
        patched.metadata.uid = stored.metadata.uid.clone();
        patched.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        patched.metadata.generation = next_generation(stored, &patched);
        Ok(self.commit(&mut objects, key_of(key), patched))
    }

    async fn delete(&self, key: &ObjectRef) -> Result<bool> {
        let mut objects = self.lock();
        let Some(stored) = objects.get(&key_of(key)) else {
            return Ok(false);
        };
        if stored.finalizers().is_empty() {
            objects.remove(&key_of(key));
            self.writes.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
        if stored.metadata.deletion_timestamp.is_none() {
            let mut marked = stored.clone();
            marked.metadata.deletion_timestamp = Some(Time(Utc::now()));
            self.commit(&mut objects, key_of(key), marked);
        }
        Ok(true)
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool> {
        let cluster_scoped = self.cluster_scoped.lock().unwrap_or_else(|e| e.into_inner());
        Ok(!cluster_scoped.contains(&(gvk.group.clone(), gvk.kind.clone())))
    }
}
