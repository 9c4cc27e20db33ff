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

use super::EtcdStorage;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr;

impl EtcdStorage {
    /// a new Service exposing the etcd-proxy for this EtcdStorage
    pub fn new_service(&self, controller_namespace: &str) -> corev1::Service {
        corev1::Service {
            metadata: metav1::ObjectMeta {
                name: Some(self.service_name()),
                namespace: Some(controller_namespace.to_owned()),
                owner_references: Some(vec![self.new_owner_ref()]),
                labels: Some(self.selector_labels()),
                ..Default::default()
            },
            spec: Some(corev1::ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(self.selector_labels()),
                ports: Some(vec![corev1::ServicePort {
                    name: Some("etcd".to_owned()),
                    protocol: Some("TCP".to_owned()),
                    port: 2379,
                    target_port: Some(intstr::IntOrString::Int(2379)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::create_test_etcd_storage;

    #[test]
    fn test_new_service_structure() {
        let es = create_test_etcd_storage();

        let service = es.new_service("kube-apiserver-storage");

        assert_eq!(service.metadata.name, Some("etcd-es-test-1".to_string()));
        assert_eq!(
            service.metadata.namespace,
            Some("kube-apiserver-storage".to_string())
        );

        let owner_refs = service.metadata.owner_references.unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].controller, Some(true));

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));
        assert_eq!(
            spec.selector.unwrap().get("apiserver"),
            Some(&"es-test-1".to_string())
        );

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 2379);
        assert_eq!(
            ports[0].target_port,
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(2379))
        );
    }
}
