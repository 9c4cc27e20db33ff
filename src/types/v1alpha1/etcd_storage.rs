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

pub mod artifacts;
pub mod services;
pub mod workloads;

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, KubeSchema, Resource, ResourceExt};
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Name and namespace of a ConfigMap in a consumer namespace where the
/// serving CA trust bundle is published.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct CABundleDestination {
    pub name: String,
    pub namespace: String,
}

/// Name and namespace of a Secret in a consumer namespace where a client
/// certificate/key pair is published.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertificateDestination {
    pub name: String,
    pub namespace: String,
}

/// Validity period expressed as a duration string, e.g. "30m" or "720h".
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct CertificateValidity(#[serde(with = "humantime_serde")] pub std::time::Duration);

impl JsonSchema for CertificateValidity {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("CertificateValidity")
    }
    fn schema_id() -> Cow<'static, str> {
        Cow::Borrowed(concat!(module_path!(), "::", "CertificateValidity"))
    }
    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        json_schema! {
            {"type": "string"}
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "etcd.xmudrii.com",
    version = "v1alpha1",
    kind = "EtcdStorage",
    status = "crate::types::v1alpha1::status::Status",
    shortname = "es",
    plural = "etcdstorages",
    singular = "etcdstorage",
    printcolumn = r#"{"name":"Deployed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Deployed\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStorageSpec {
    /// ConfigMaps, usually in aggregated API server namespaces, where the
    /// serving CA bundle for verifying the etcd-proxy is published.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca_cert_config_maps: Vec<CABundleDestination>,

    /// Secrets, usually in aggregated API server namespaces, where client
    /// certificate/key pairs for authenticating to the etcd-proxy are
    /// published.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_cert_secrets: Vec<ClientCertificateDestination>,

    /// How long self-generated signing certificates are valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_certificate_validity: Option<CertificateValidity>,

    /// How long serving certificate/key pairs are valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_certificate_validity: Option<CertificateValidity>,

    /// How long client certificate/key pairs are valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_validity: Option<CertificateValidity>,
}

pub const SELECTOR_LABEL: &str = "apiserver";

impl EtcdStorage {
    pub fn name(&self) -> String {
        ResourceExt::name_any(self)
    }

    /// Name of the etcd-proxy Deployment in the controller namespace.
    pub fn deployment_name(&self) -> String {
        format!("etcd-{}", self.name())
    }

    /// Name of the Service exposing the etcd-proxy in the controller namespace.
    pub fn service_name(&self) -> String {
        format!("etcd-{}", self.name())
    }

    /// Name of the Secret holding the etcd-proxy serving certificate/key pair.
    pub fn server_cert_secret_name(&self) -> String {
        format!("{}-server-cert", self.name())
    }

    /// Name of the ConfigMap holding the client CA bundle the etcd-proxy
    /// trusts for incoming connections.
    pub fn ca_config_map_name(&self) -> String {
        format!("{}-ca-cert", self.name())
    }

    /// In-cluster DNS name of the etcd-proxy Service.
    pub fn service_url(&self, controller_namespace: &str) -> String {
        format!("{}.{}.svc", self.service_name(), controller_namespace)
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        [(SELECTOR_LABEL.to_owned(), self.name())].into_iter().collect()
    }

    /// a new controller owner reference for this EtcdStorage
    pub fn new_owner_ref(&self) -> metav1::OwnerReference {
        metav1::OwnerReference {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name(),
            uid: self.meta().uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Returns true if the object's controller reference points at this
    /// EtcdStorage.
    pub fn controls(&self, metadata: &metav1::ObjectMeta) -> bool {
        controller_of(metadata)
            .is_some_and(|owner| owner.uid == self.meta().uid.clone().unwrap_or_default())
    }
}

/// Returns the controller owner reference of an object, if any.
pub fn controller_of(metadata: &metav1::ObjectMeta) -> Option<&metav1::OwnerReference> {
    metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_test_etcd_storage;

    #[test]
    fn test_derived_object_names() {
        let es = create_test_etcd_storage();

        assert_eq!(es.deployment_name(), "etcd-es-test-1");
        assert_eq!(es.service_name(), "etcd-es-test-1");
        assert_eq!(es.server_cert_secret_name(), "es-test-1-server-cert");
        assert_eq!(es.ca_config_map_name(), "es-test-1-ca-cert");
        assert_eq!(
            es.service_url("kube-apiserver-storage"),
            "etcd-es-test-1.kube-apiserver-storage.svc"
        );
    }

    #[test]
    fn test_owner_ref_is_controller() {
        let es = create_test_etcd_storage();
        let owner_ref = es.new_owner_ref();

        assert_eq!(owner_ref.kind, "EtcdStorage");
        assert_eq!(owner_ref.api_version, "etcd.xmudrii.com/v1alpha1");
        assert_eq!(owner_ref.name, "es-test-1");
        assert_eq!(owner_ref.controller, Some(true));
    }

    #[test]
    fn test_controls_matches_by_uid() {
        let es = create_test_etcd_storage();
        let mut metadata = metav1::ObjectMeta {
            owner_references: Some(vec![es.new_owner_ref()]),
            ..Default::default()
        };
        assert!(es.controls(&metadata));

        metadata.owner_references = Some(vec![metav1::OwnerReference {
            uid: "someone-else".to_owned(),
            controller: Some(true),
            ..es.new_owner_ref()
        }]);
        assert!(!es.controls(&metadata));

        metadata.owner_references = None;
        assert!(!es.controls(&metadata));
    }

    #[test]
    fn test_certificate_validity_parses_duration_strings() {
        let spec: EtcdStorageSpec = k8s_openapi::serde_json::from_value(
            k8s_openapi::serde_json::json!({
                "caCertConfigMaps": [{"name": "etcd-serving-ca", "namespace": "k8s-sample-apiserver"}],
                "clientCertificateValidity": "30m"
            }),
        )
        .expect("deserializing spec");

        assert_eq!(
            spec.client_certificate_validity,
            Some(CertificateValidity(std::time::Duration::from_secs(30 * 60)))
        );
        assert_eq!(spec.ca_cert_config_maps[0].name, "etcd-serving-ca");
    }
}
