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

use super::{ClientCertificateDestination, EtcdStorage};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use std::collections::BTreeMap;

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

impl EtcdStorage {
    /// a new empty Secret shell for the etcd-proxy serving certificate/key
    /// pair, owned by this EtcdStorage
    pub fn new_server_cert_secret(&self, controller_namespace: &str) -> corev1::Secret {
        corev1::Secret {
            metadata: metav1::ObjectMeta {
                name: Some(self.server_cert_secret_name()),
                namespace: Some(controller_namespace.to_owned()),
                owner_references: Some(vec![self.new_owner_ref()]),
                annotations: Some(BTreeMap::new()),
                ..Default::default()
            },
            type_: Some(TLS_SECRET_TYPE.to_owned()),
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    /// a new empty ConfigMap shell for the client CA bundle the etcd-proxy
    /// trusts, owned by this EtcdStorage
    pub fn new_client_ca_config_map(&self, controller_namespace: &str) -> corev1::ConfigMap {
        corev1::ConfigMap {
            metadata: metav1::ObjectMeta {
                name: Some(self.ca_config_map_name()),
                namespace: Some(controller_namespace.to_owned()),
                owner_references: Some(vec![self.new_owner_ref()]),
                annotations: Some(BTreeMap::new()),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }
}

/// a new empty Secret shell for a consumer client certificate/key pair
///
/// Consumer-namespace objects never carry a controller reference; their
/// lifecycle belongs to the consumer.
pub fn new_client_cert_secret(destination: &ClientCertificateDestination) -> corev1::Secret {
    corev1::Secret {
        metadata: metav1::ObjectMeta {
            name: Some(destination.name.clone()),
            namespace: Some(destination.namespace.clone()),
            annotations: Some(BTreeMap::new()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_owned()),
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::create_test_etcd_storage;

    #[test]
    fn test_new_server_cert_secret_shell() {
        let es = create_test_etcd_storage();

        let secret = es.new_server_cert_secret("kube-apiserver-storage");

        assert_eq!(
            secret.metadata.name,
            Some("es-test-1-server-cert".to_string())
        );
        assert_eq!(secret.type_, Some("kubernetes.io/tls".to_string()));
        assert_eq!(
            secret.metadata.owner_references.as_ref().map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_new_client_ca_config_map_shell() {
        let es = create_test_etcd_storage();

        let config_map = es.new_client_ca_config_map("kube-apiserver-storage");

        assert_eq!(
            config_map.metadata.name,
            Some("es-test-1-ca-cert".to_string())
        );
        assert_eq!(
            config_map.metadata.owner_references.as_ref().map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_consumer_secret_shell_has_no_owner() {
        let destination = ClientCertificateDestination {
            name: "etcd-client-cert".to_string(),
            namespace: "k8s-sample-apiserver".to_string(),
        };

        let secret = new_client_cert_secret(&destination);

        assert_eq!(secret.metadata.name, Some("etcd-client-cert".to_string()));
        assert_eq!(
            secret.metadata.namespace,
            Some("k8s-sample-apiserver".to_string())
        );
        assert!(secret.metadata.owner_references.is_none());
        assert_eq!(secret.type_, Some("kubernetes.io/tls".to_string()));
    }
}
