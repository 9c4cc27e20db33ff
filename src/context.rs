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
use crate::types::v1alpha1::etcd_storage::EtcdStorage;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::Snafu;
use snafu::futures::TryFutureExt;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("record event error: {}", source))]
    Record { source: kube::Error },

    #[snafu(transparent)]
    Serde { source: serde_json::Error },
}

/// The facade the reconciler uses to talk to the cluster: get, create and
/// update per owned kind, plus status and event publication. Keeping it an
/// explicit interface lets the reconciler run against an in-memory fake.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn update_etcd_storage_status(
        &self,
        etcdstorage: &EtcdStorage,
    ) -> Result<EtcdStorage, Error>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::Deployment>, Error>;
    async fn create_deployment(
        &self,
        deployment: &appsv1::Deployment,
    ) -> Result<appsv1::Deployment, Error>;
    async fn update_deployment(
        &self,
        deployment: &appsv1::Deployment,
    ) -> Result<appsv1::Deployment, Error>;

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Service>, Error>;
    async fn create_service(&self, service: &corev1::Service) -> Result<corev1::Service, Error>;
    async fn update_service(&self, service: &corev1::Service) -> Result<corev1::Service, Error>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::ConfigMap>, Error>;
    async fn create_config_map(
        &self,
        config_map: &corev1::ConfigMap,
    ) -> Result<corev1::ConfigMap, Error>;
    async fn update_config_map(
        &self,
        config_map: &corev1::ConfigMap,
    ) -> Result<corev1::ConfigMap, Error>;

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Secret>, Error>;
    async fn create_secret(&self, secret: &corev1::Secret) -> Result<corev1::Secret, Error>;
    async fn update_secret(&self, secret: &corev1::Secret) -> Result<corev1::Secret, Error>;

    async fn publish_event(
        &self,
        etcdstorage: &EtcdStorage,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) -> Result<(), Error>;
}

pub struct Context {
    pub kube: Arc<dyn KubeApi>,
    pub config: EtcdProxyControllerConfig,
}

impl Context {
    pub fn new(client: kube::Client, config: EtcdProxyControllerConfig) -> Self {
        Self {
            kube: Arc::new(ApiClient::new(client)),
            config,
        }
    }
}

/// [`KubeApi`] backed by a real cluster connection.
pub struct ApiClient {
    client: kube::Client,
    recorder: Recorder,
}

impl ApiClient {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "etcdproxy-controller".into(),
            instance: std::env::var("HOSTNAME").ok(),
        };

        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    async fn get<T>(&self, namespace: &str, name: &str) -> Result<Option<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(KubeSnafu).await
    }

    async fn create<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(
            self.client.clone(),
            &resource.namespace().unwrap_or_default(),
        );
        api.create(&PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }

    async fn update<T>(&self, resource: &T) -> Result<T, Error>
    where
        T: Clone + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(
            self.client.clone(),
            &resource.namespace().unwrap_or_default(),
        );
        api.replace(&resource.name_any(), &PostParams::default(), resource)
            .context(KubeSnafu)
            .await
    }
}

#[async_trait]
impl KubeApi for ApiClient {
    async fn update_etcd_storage_status(
        &self,
        etcdstorage: &EtcdStorage,
    ) -> Result<EtcdStorage, Error> {
        let api: Api<EtcdStorage> = Api::all(self.client.clone());
        let name = etcdstorage.name_any();

        let status_body = serde_json::to_vec(etcdstorage)?;
        if let Ok(updated) = api
            .replace_status(&name, &PostParams::default(), status_body)
            .await
        {
            return Ok(updated);
        }

        info!("status update failed due to conflict, retrieve the latest resource and retry.");

        let mut latest = api.get(&name).context(KubeSnafu).await?;
        latest.status = etcdstorage.status.clone();
        let status_body = serde_json::to_vec(&latest)?;

        api.replace_status(&name, &PostParams::default(), status_body)
            .context(KubeSnafu)
            .await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<appsv1::Deployment>, Error> {
        self.get(namespace, name).await
    }

    async fn create_deployment(
        &self,
        deployment: &appsv1::Deployment,
    ) -> Result<appsv1::Deployment, Error> {
        self.create(deployment).await
    }

    async fn update_deployment(
        &self,
        deployment: &appsv1::Deployment,
    ) -> Result<appsv1::Deployment, Error> {
        self.update(deployment).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Service>, Error> {
        self.get(namespace, name).await
    }

    async fn create_service(&self, service: &corev1::Service) -> Result<corev1::Service, Error> {
        self.create(service).await
    }

    async fn update_service(&self, service: &corev1::Service) -> Result<corev1::Service, Error> {
        self.update(service).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::ConfigMap>, Error> {
        self.get(namespace, name).await
    }

    async fn create_config_map(
        &self,
        config_map: &corev1::ConfigMap,
    ) -> Result<corev1::ConfigMap, Error> {
        self.create(config_map).await
    }

    async fn update_config_map(
        &self,
        config_map: &corev1::ConfigMap,
    ) -> Result<corev1::ConfigMap, Error> {
        self.update(config_map).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Secret>, Error> {
        self.get(namespace, name).await
    }

    async fn create_secret(&self, secret: &corev1::Secret) -> Result<corev1::Secret, Error> {
        self.create(secret).await
    }

    async fn update_secret(&self, secret: &corev1::Secret) -> Result<corev1::Secret, Error> {
        self.update(secret).await
    }

    async fn publish_event(
        &self,
        etcdstorage: &EtcdStorage,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) -> Result<(), Error> {
        self.recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.to_owned(),
                    note: Some(note.into()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &etcdstorage.object_ref(&()),
            )
            .context(RecordSnafu)
            .await
    }
}
