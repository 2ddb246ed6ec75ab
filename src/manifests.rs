//! Template output handling
//!
//! Decodes the multi-document stream produced by the template engine,
//! links the resulting objects to the instance that produced them and
//! writes them to the store.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{api_version, type_meta, ObjectRef, ResourceStore};

/// Outcome of [`create_or_update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
        }
    }
}

/// Decode a YAML document stream into objects, in order.
///
/// Empty documents (bare `---` separators) carry nothing and are skipped.
/// Every other document must be a mapping with a resolvable kind and a
/// name; the first one that is not fails the whole stream.
pub fn decode_manifests(stream: &[u8]) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_slice(stream).enumerate() {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if !value.is_mapping() {
            return Err(Error::malformed(format!(
                "document {} is not an object",
                index
            )));
        }

        let json = serde_json::to_value(&value)?;
        let obj: DynamicObject = serde_json::from_value(json)
            .map_err(|e| Error::malformed(format!("document {}: {}", index, e)))?;
        if obj.types.as_ref().map_or(true, |t| t.kind.is_empty() || t.api_version.is_empty()) {
            return Err(Error::malformed(format!(
                "document {} has unknown type: {:?}",
                index, obj
            )));
        }
        if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::malformed(format!(
                "document {} ({}) has no name",
                index,
                obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
            )));
        }
        objects.push(obj);
    }
    Ok(objects)
}

/// Owner reference marking `owner` as the controller of a derived object
pub fn controller_reference(
    owner: &DynamicObject,
    owner_gvk: &GroupVersionKind,
) -> Result<OwnerReference> {
    let uid = owner
        .uid()
        .ok_or_else(|| Error::validation(format!("owner '{}' has no uid", owner.name_any())))?;
    Ok(OwnerReference {
        api_version: api_version(owner_gvk),
        kind: owner_gvk.kind.clone(),
        name: owner.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Check that `owner` may control `obj` at all.
///
/// The garbage collector only resolves owner references within the
/// object's own namespace, and never from a cluster-scoped object to a
/// namespaced owner. Either would look like a deleted owner.
pub fn validate_owner_scope(owner: &DynamicObject, obj: &DynamicObject) -> Result<()> {
    let Some(owner_ns) = owner.namespace().filter(|ns| !ns.is_empty()) else {
        return Ok(());
    };
    match obj.namespace().filter(|ns| !ns.is_empty()) {
        None => Err(Error::validation(format!(
            "cluster-scoped object '{}' cannot be owned by '{}' in namespace '{}'",
            obj.name_any(),
            owner.name_any(),
            owner_ns
        ))),
        Some(ns) if ns != owner_ns => Err(Error::validation(format!(
            "object '{}' in namespace '{}' cannot be owned by '{}' in namespace '{}'",
            obj.name_any(),
            ns,
            owner.name_any(),
            owner_ns
        ))),
        Some(_) => Ok(()),
    }
}

/// Set `reference` as the controller owner of `obj`.
///
/// An existing reference to the same owner is refreshed in place; a
/// different controlling owner is an error.
pub fn set_controller_reference(obj: &mut DynamicObject, reference: OwnerReference) -> Result<()> {
    let object = obj.name_any();
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);

    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != reference.uid)
    {
        return Err(Error::AlreadyOwned {
            object,
            owner: format!("{} {}", other.kind, other.name),
        });
    }

    match refs.iter_mut().find(|r| r.uid == reference.uid) {
        Some(existing) => *existing = reference,
        None => refs.push(reference),
    }
    Ok(())
}

/// Create the object if absent, otherwise apply `mutate` to the stored copy
/// and write it back when that changed anything.
///
/// Like its controller-runtime namesake, `mutate` runs against the stored
/// object, not against `desired`: only the fields it sets are converged.
pub async fn create_or_update<F>(
    store: &dyn ResourceStore,
    desired: DynamicObject,
    mutate: F,
) -> Result<OperationResult>
where
    F: FnOnce(&mut DynamicObject) -> Result<()>,
{
    let key = ObjectRef::from_object(&desired)?;

    let Some(existing) = store.get(&key).await? else {
        let mut obj = desired;
        mutate(&mut obj)?;
        store.create(&obj).await?;
        debug!(object = %key, "Created object");
        return Ok(OperationResult::Created);
    };

    let mut obj = existing.clone();
    if obj.types.is_none() {
        obj.types = Some(type_meta(&key.gvk));
    }
    mutate(&mut obj)?;

    if serde_json::to_value(&obj)? == serde_json::to_value(&existing)? {
        return Ok(OperationResult::Unchanged);
    }

    store.replace(&obj).await?;
    debug!(object = %key, "Updated object");
    Ok(OperationResult::Updated)
}
