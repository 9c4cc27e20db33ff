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

use crate::config::EtcdProxyControllerConfig;
use crate::context::Context;
use crate::reconcile::{error_policy, reconcile_etcd_storage};
use crate::types::v1alpha1::etcd_storage::EtcdStorage;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResourceExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

pub mod config;
pub mod context;
pub mod reconcile;
pub mod types;
pub mod utils;


// Fixed worker pool; the scheduler still serializes work per key.
const WORKER_COUNT: u16 = 2;

pub async fn run(config: EtcdProxyControllerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let client = match &config.kubeconfig_path {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let kube_config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            Client::try_from(kube_config)?
        }
        None => Client::try_default().await?,
    };

    let etcdstorages = Api::<EtcdStorage>::all(client.clone());
    let deployments =
        Api::<appsv1::Deployment>::namespaced(client.clone(), &config.controller_namespace);
    let services =
        Api::<corev1::Service>::namespaced(client.clone(), &config.controller_namespace);

    info!(
        "starting EtcdStorage controller in namespace {}",
        config.controller_namespace
    );

    let context = Context::new(client, config);
    Controller::new(etcdstorages, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(WORKER_COUNT))
        .shutdown_on_signal()
        .run(reconcile_etcd_storage, error_policy, Arc::new(context))
        .for_each(|result| async move {
            match result {
                Ok((etcdstorage, _)) => {
                    info!("reconciled successfully, object {:?}", etcdstorage.name)
                }
                Err(e) => warn!("reconcile failed: {}", e),
            }
        })
        .await;

    Ok(())
}

pub async fn crd(file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Pin<Box<dyn AsyncWrite + Send>> = if let Some(file) = file {
        Box::pin(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(file)
                .await?,
        )
    } else {
        Box::pin(tokio::io::stdout())
    };

    writer
        .write_all(serde_yaml_ng::to_string(&EtcdStorage::crd())?.as_bytes())
        .await?;

    Ok(())
}
