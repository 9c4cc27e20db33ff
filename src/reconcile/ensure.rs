// Copyright 2025 The EtcdProxy Controller Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::context::Context;
use crate::reconcile::{Error, ResourceNotOwnedSnafu};
use crate::types::v1alpha1::etcd_storage::{EtcdStorage, controller_of};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;

/// Creates the ConfigMap if it is absent, otherwise folds the desired
/// annotations, labels and data into the live object and updates it only
/// when that changed anything.
///
/// Annotations and labels merge key-wise so unrelated entries survive; data
/// is replaced wholesale. Reads go to the live API rather than the watch
/// cache to avoid stale reads during certificate rotation.
pub async fn ensure_config_map(ctx: &Context, desired: &corev1::ConfigMap) -> Result<(), Error> {
    let namespace = desired.metadata.namespace.as_deref().unwrap_or_default();
    let name = desired.metadata.name.as_deref().unwrap_or_default();

    let Some(existing) = ctx.kube.get_config_map(namespace, name).await? else {
        ctx.kube.create_config_map(desired).await?;
        return Ok(());
    };

    let mut merged = existing.clone();
    merge_metadata(&mut merged.metadata, &desired.metadata);
    merged.data = desired.data.clone();

    if config_maps_equal(&merged, &existing) {
        return Ok(());
    }

    ctx.kube.update_config_map(&merged).await?;
    Ok(())
}

/// Secret analog of [`ensure_config_map`].
pub async fn ensure_secret(ctx: &Context, desired: &corev1::Secret) -> Result<(), Error> {
    let namespace = desired.metadata.namespace.as_deref().unwrap_or_default();
    let name = desired.metadata.name.as_deref().unwrap_or_default();

    let Some(existing) = ctx.kube.get_secret(namespace, name).await? else {
        ctx.kube.create_secret(desired).await?;
        return Ok(());
    };

    let mut merged = existing.clone();
    merge_metadata(&mut merged.metadata, &desired.metadata);
    merged.data = desired.data.clone();
    if desired.type_.is_some() {
        merged.type_ = desired.type_.clone();
    }

    if secrets_equal(&merged, &existing) {
        return Ok(());
    }

    ctx.kube.update_secret(&merged).await?;
    Ok(())
}

/// The reclaim decision for a found resource. Returns `false` when the
/// EtcdStorage already controls the object. Stamps the controller reference
/// and returns `true` when the object has no controller at all; the caller
/// persists the change. A foreign controller reference fails instead of
/// being overwritten.
pub fn ensure_ownership<T>(etcdstorage: &EtcdStorage, object: &mut T) -> Result<bool, Error>
where
    T: Resource<DynamicType = ()>,
{
    if etcdstorage.controls(object.meta()) {
        return Ok(false);
    }

    if controller_of(object.meta()).is_some() {
        return ResourceNotOwnedSnafu {
            kind: T::plural(&()).to_string(),
            name: object.meta().name.clone().unwrap_or_default(),
        }
        .fail();
    }

    object
        .meta_mut()
        .owner_references
        .get_or_insert_default()
        .push(etcdstorage.new_owner_ref());
    Ok(true)
}

fn merge_metadata(target: &mut metav1::ObjectMeta, desired: &metav1::ObjectMeta) {
    if let Some(annotations) = &desired.annotations
        && !annotations.is_empty()
    {
        target
            .annotations
            .get_or_insert_default()
            .extend(annotations.clone());
    }

    if let Some(labels) = &desired.labels
        && !labels.is_empty()
    {
        target.labels.get_or_insert_default().extend(labels.clone());
    }
}

fn config_maps_equal(left: &corev1::ConfigMap, right: &corev1::ConfigMap) -> bool {
    left.metadata.annotations == right.metadata.annotations
        && left.metadata.labels == right.metadata.labels
        && left.data == right.data
        && left.binary_data == right.binary_data
}

fn secrets_equal(left: &corev1::Secret, right: &corev1::Secret) -> bool {
    left.metadata.annotations == right.metadata.annotations
        && left.metadata.labels == right.metadata.labels
        && left.data == right.data
        && left.type_ == right.type_
}
