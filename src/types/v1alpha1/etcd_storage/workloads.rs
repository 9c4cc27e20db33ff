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
use crate::config::EtcdProxyControllerConfig;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

const CORE_ETCD_CA_MOUNT_PATH: &str = "/etc/coreetcd-certs/ca";
const CORE_ETCD_CLIENT_MOUNT_PATH: &str = "/etc/coreetcd-certs/client";
const PROXY_CA_MOUNT_PATH: &str = "/etc/etcdproxy-certs/ca";
const PROXY_SERVER_MOUNT_PATH: &str = "/etc/etcdproxy-certs/server";

impl EtcdStorage {
    /// a new etcd-proxy Deployment for this EtcdStorage
    ///
    /// The proxy prefixes every key with `/<name>/` inside the shared core
    /// etcd cluster, authenticates to the core etcd with the externally
    /// provisioned client pair, and serves the tenant over mutual TLS using
    /// the material the certificate lifecycle maintains.
    pub fn new_deployment(&self, config: &EtcdProxyControllerConfig) -> appsv1::Deployment {
        let labels = self.selector_labels();

        let args = vec![
            format!("--endpoints={}", config.core_etcd.urls.join(",")),
            format!("--namespace=/{}/", self.name()),
            "--listen-addr=0.0.0.0:2379".to_owned(),
            format!("--cacert={CORE_ETCD_CA_MOUNT_PATH}/ca.pem"),
            format!("--cert={CORE_ETCD_CLIENT_MOUNT_PATH}/client.pem"),
            format!("--key={CORE_ETCD_CLIENT_MOUNT_PATH}/client-key.pem"),
            format!("--trusted-ca-file={PROXY_CA_MOUNT_PATH}/client-ca.crt"),
            format!("--cert-file={PROXY_SERVER_MOUNT_PATH}/tls.crt"),
            format!("--key-file={PROXY_SERVER_MOUNT_PATH}/tls.key"),
        ];

        let volume_mounts = vec![
            corev1::VolumeMount {
                name: config.core_etcd.ca_config_map_name.clone(),
                mount_path: CORE_ETCD_CA_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
            corev1::VolumeMount {
                name: config.core_etcd.cert_secret_name.clone(),
                mount_path: CORE_ETCD_CLIENT_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
            corev1::VolumeMount {
                name: self.ca_config_map_name(),
                mount_path: PROXY_CA_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
            corev1::VolumeMount {
                name: self.server_cert_secret_name(),
                mount_path: PROXY_SERVER_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        let volumes = vec![
            corev1::Volume {
                name: config.core_etcd.ca_config_map_name.clone(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: config.core_etcd.ca_config_map_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            corev1::Volume {
                name: config.core_etcd.cert_secret_name.clone(),
                secret: Some(corev1::SecretVolumeSource {
                    secret_name: Some(config.core_etcd.cert_secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            corev1::Volume {
                name: self.ca_config_map_name(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: self.ca_config_map_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            corev1::Volume {
                name: self.server_cert_secret_name(),
                secret: Some(corev1::SecretVolumeSource {
                    secret_name: Some(self.server_cert_secret_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        appsv1::Deployment {
            metadata: metav1::ObjectMeta {
                name: Some(self.deployment_name()),
                namespace: Some(config.controller_namespace.clone()),
                owner_references: Some(vec![self.new_owner_ref()]),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(appsv1::DeploymentSpec {
                replicas: Some(1),
                selector: metav1::LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: corev1::PodTemplateSpec {
                    metadata: Some(metav1::ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(corev1::PodSpec {
                        containers: vec![corev1::Container {
                            name: "etcdproxy".to_owned(),
                            image: Some(config.proxy_image.clone()),
                            command: Some(vec![
                                "/usr/local/bin/etcd".to_owned(),
                                "grpc-proxy".to_owned(),
                                "start".to_owned(),
                            ]),
                            args: Some(args),
                            ports: Some(vec![corev1::ContainerPort {
                                name: Some("etcd".to_owned()),
                                container_port: 2379,
                                protocol: Some("TCP".to_owned()),
                                ..Default::default()
                            }]),
                            volume_mounts: Some(volume_mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{create_test_etcd_storage, test_config};

    #[test]
    fn test_new_deployment_structure() {
        let es = create_test_etcd_storage();
        let config = test_config();

        let deployment = es.new_deployment(&config);

        assert_eq!(deployment.metadata.name, Some("etcd-es-test-1".to_string()));
        assert_eq!(
            deployment.metadata.namespace,
            Some("kube-apiserver-storage".to_string())
        );

        let owner_refs = deployment.metadata.owner_references.unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "EtcdStorage");
        assert_eq!(owner_refs[0].controller, Some(true));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.unwrap().get("apiserver"),
            Some(&"es-test-1".to_string())
        );
    }

    #[test]
    fn test_new_deployment_proxy_arguments() {
        let es = create_test_etcd_storage();
        let config = test_config();

        let deployment = es.new_deployment(&config);
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];

        assert_eq!(container.name, "etcdproxy");
        assert_eq!(container.image, Some(config.proxy_image.clone()));
        assert_eq!(
            container.command,
            Some(vec![
                "/usr/local/bin/etcd".to_string(),
                "grpc-proxy".to_string(),
                "start".to_string(),
            ])
        );

        let args = container.args.as_ref().unwrap();
        assert!(args.contains(&"--endpoints=https://etcd-core:2379".to_string()));
        assert!(args.contains(&"--namespace=/es-test-1/".to_string()));
        assert!(args.contains(&"--listen-addr=0.0.0.0:2379".to_string()));
        assert!(args.contains(&"--trusted-ca-file=/etc/etcdproxy-certs/ca/client-ca.crt".to_string()));
        assert!(args.contains(&"--cert-file=/etc/etcdproxy-certs/server/tls.crt".to_string()));
        assert!(args.contains(&"--key-file=/etc/etcdproxy-certs/server/tls.key".to_string()));

        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container_port, 2379);
        assert_eq!(ports[0].name, Some("etcd".to_string()));
    }

    #[test]
    fn test_new_deployment_certificate_mounts() {
        let es = create_test_etcd_storage();
        let config = test_config();

        let deployment = es.new_deployment(&config);
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        let mount_paths: Vec<&str> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(
            mount_paths,
            vec![
                "/etc/coreetcd-certs/ca",
                "/etc/coreetcd-certs/client",
                "/etc/etcdproxy-certs/ca",
                "/etc/etcdproxy-certs/server",
            ]
        );

        let volumes = pod_spec.volumes.unwrap();
        assert_eq!(volumes.len(), 4);
        assert!(volumes.iter().any(|v| v.name == "es-test-1-ca-cert"));
        assert!(volumes.iter().any(|v| v.name == "es-test-1-server-cert"));
    }
}
