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

pub mod certificate;
pub mod ensure;

use crate::context::{self, Context};
use crate::types::v1alpha1::etcd_storage::EtcdStorage;
use crate::types::v1alpha1::status::{Condition, ConditionStatus, ConditionType};
use crate::utils::certs;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Event reason used when an EtcdStorage is synced.
pub const SUCCESS_SYNCED: &str = "Synced";
/// Event reason used when adopting a found-but-unowned resource fails.
pub const ERR_RESOURCE_RECLAIMED: &str = "ErrResourceReclaimed";
/// Event reason used when deploying certificate artifacts fails.
pub const ERR_DEPLOYING_CERTIFICATES: &str = "ErrDeployingCertificates";
/// Event reason used for other failures to get, create, or update a resource.
pub const ERR_UNKNOWN: &str = "ErrUnknown";

const MESSAGE_RESOURCE_SYNCED: &str = "EtcdStorage synced successfully";
const DEPLOYED_REASON: &str = "Deployed";
const FAILED_DEPLOYING_REASON: &str = "FailedDeploying";

// Stands in for the informer resync interval: every key is revisited even
// without watch events.
const RESYNC_PERIOD: Duration = Duration::from_secs(600);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Certificates { source: certs::Error },

    #[snafu(display("configmaps \"{name}\" not found"))]
    ConfigMapNotFound { name: String },

    #[snafu(display("{kind} \"{name}\" already exists and is not managed by EtcdStorage"))]
    ResourceNotOwned { kind: String, name: String },

    #[snafu(display("certificate validity {validity:?} is below the 5 minute minimum"))]
    ValidityTooShort { validity: Duration },

    #[snafu(display("{}", join_error_messages(errors)))]
    Aggregate { errors: Vec<Error> },
}

fn join_error_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapses a list of independent failures into a single error, preserving
/// every cause. Returns `None` when the pass was clean.
pub(crate) fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
    match errors.len() {
        0 => None,
        1 => Some(errors.remove(0)),
        _ => Some(Error::Aggregate { errors }),
    }
}

/// Converges a single EtcdStorage: certificate material first, then the
/// etcd-proxy Deployment and Service, then the Deployed status condition.
///
/// Partial certificate failures do not stop the workload path; all failures
/// are collected and returned as one aggregate so the queue retries the key.
pub async fn reconcile_etcd_storage(
    etcdstorage: Arc<EtcdStorage>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    // The watch cache already resolved this object. A set deletion
    // timestamp means the garbage collector owns the remaining cleanup.
    if etcdstorage.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let mut errors = Vec::new();

    // Certificates converge before the workload so a freshly created or
    // restarted proxy picks up rotated material.
    let mut certificate_errors = Vec::new();
    if let Err(err) = certificate::ensure_client_certificates(&etcdstorage, &ctx).await {
        certificate_errors.push(err);
    }
    if let Err(err) = certificate::ensure_server_certificates(&etcdstorage, &ctx).await {
        certificate_errors.push(err);
    }
    if !certificate_errors.is_empty() {
        ctx.kube
            .publish_event(
                &etcdstorage,
                EventType::Warning,
                ERR_DEPLOYING_CERTIFICATES,
                &join_error_messages(&certificate_errors),
            )
            .await?;
        errors.append(&mut certificate_errors);
    }

    if let Err(err) = ensure_proxy_deployment(&etcdstorage, &ctx).await {
        errors.push(err);
    }
    if let Err(err) = ensure_proxy_service(&etcdstorage, &ctx).await {
        errors.push(err);
    }

    let desired_condition = if errors.is_empty() {
        Condition::new(
            ConditionType::Deployed,
            ConditionStatus::True,
            DEPLOYED_REASON,
            MESSAGE_RESOURCE_SYNCED,
        )
    } else {
        Condition::new(
            ConditionType::Deployed,
            ConditionStatus::False,
            FAILED_DEPLOYING_REASON,
            join_error_messages(&errors),
        )
    };
    update_deployed_condition(&etcdstorage, desired_condition, &ctx).await?;

    match aggregate(errors) {
        None => {
            ctx.kube
                .publish_event(
                    &etcdstorage,
                    EventType::Normal,
                    SUCCESS_SYNCED,
                    MESSAGE_RESOURCE_SYNCED,
                )
                .await?;
            Ok(Action::requeue(RESYNC_PERIOD))
        }
        Some(err) => Err(err),
    }
}

pub fn error_policy(_object: Arc<EtcdStorage>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!("{error}");
    Action::requeue(Duration::from_secs(5))
}

async fn ensure_proxy_deployment(etcdstorage: &EtcdStorage, ctx: &Context) -> Result<(), Error> {
    let namespace = &ctx.config.controller_namespace;
    let name = etcdstorage.deployment_name();

    let deployment = match ctx.kube.get_deployment(namespace, &name).await {
        Ok(deployment) => deployment,
        Err(err) => {
            ctx.kube
                .publish_event(
                    etcdstorage,
                    EventType::Warning,
                    ERR_UNKNOWN,
                    &err.to_string(),
                )
                .await?;
            return Err(err.into());
        }
    };

    match deployment {
        None => {
            if let Err(err) = ctx
                .kube
                .create_deployment(&etcdstorage.new_deployment(&ctx.config))
                .await
            {
                ctx.kube
                    .publish_event(
                        etcdstorage,
                        EventType::Warning,
                        ERR_UNKNOWN,
                        &err.to_string(),
                    )
                    .await?;
                return Err(err.into());
            }
        }
        Some(mut deployment) => {
            let adopted = match ensure::ensure_ownership(etcdstorage, &mut deployment) {
                Ok(adopted) => adopted,
                Err(err) => {
                    ctx.kube
                        .publish_event(
                            etcdstorage,
                            EventType::Warning,
                            ERR_RESOURCE_RECLAIMED,
                            &err.to_string(),
                        )
                        .await?;
                    return Err(err);
                }
            };
            if adopted && let Err(err) = ctx.kube.update_deployment(&deployment).await {
                ctx.kube
                    .publish_event(
                        etcdstorage,
                        EventType::Warning,
                        ERR_RESOURCE_RECLAIMED,
                        &err.to_string(),
                    )
                    .await?;
                return Err(err.into());
            }
        }
    }

    Ok(())
}

async fn ensure_proxy_service(etcdstorage: &EtcdStorage, ctx: &Context) -> Result<(), Error> {
    let namespace = &ctx.config.controller_namespace;
    let name = etcdstorage.service_name();

    let service = match ctx.kube.get_service(namespace, &name).await {
        Ok(service) => service,
        Err(err) => {
            ctx.kube
                .publish_event(
                    etcdstorage,
                    EventType::Warning,
                    ERR_UNKNOWN,
                    &err.to_string(),
                )
                .await?;
            return Err(err.into());
        }
    };

    match service {
        None => {
            if let Err(err) = ctx
                .kube
                .create_service(&etcdstorage.new_service(namespace))
                .await
            {
                ctx.kube
                    .publish_event(
                        etcdstorage,
                        EventType::Warning,
                        ERR_UNKNOWN,
                        &err.to_string(),
                    )
                    .await?;
                return Err(err.into());
            }
        }
        Some(mut service) => {
            let adopted = match ensure::ensure_ownership(etcdstorage, &mut service) {
                Ok(adopted) => adopted,
                Err(err) => {
                    ctx.kube
                        .publish_event(
                            etcdstorage,
                            EventType::Warning,
                            ERR_RESOURCE_RECLAIMED,
                            &err.to_string(),
                        )
                        .await?;
                    return Err(err);
                }
            };
            if adopted && let Err(err) = ctx.kube.update_service(&service).await {
                ctx.kube
                    .publish_event(
                        etcdstorage,
                        EventType::Warning,
                        ERR_RESOURCE_RECLAIMED,
                        &err.to_string(),
                    )
                    .await?;
                return Err(err.into());
            }
        }
    }

    Ok(())
}

// The Deployed condition is only written when it differs from the stored
// one, compared without transition times, so converged keys stay write-free.
async fn update_deployed_condition(
    etcdstorage: &EtcdStorage,
    condition: Condition,
    ctx: &Context,
) -> Result<(), Error> {
    let current = etcdstorage
        .status
        .as_ref()
        .and_then(|status| status.find_condition(condition.type_));
    if current.is_some_and(|existing| existing.equivalent(&condition)) {
        return Ok(());
    }

    let mut updated = etcdstorage.clone();
    updated.status.get_or_insert_default().set_condition(condition);
    ctx.kube.update_etcd_storage_status(&updated).await?;
    Ok(())
}
