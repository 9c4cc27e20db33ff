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

use snafu::Snafu;

pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "kube-apiserver-storage";
pub const DEFAULT_CORE_ETCD_CA_CONFIG_MAP: &str = "etcd-coreserving-ca";
pub const DEFAULT_CORE_ETCD_CERT_SECRET: &str = "etcd-coreserving-cert";
pub const DEFAULT_PROXY_IMAGE: &str = "quay.io/coreos/etcd:v3.2.24";

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid controller configuration: {}", problems.join(", ")))]
    InvalidConfiguration { problems: Vec<String> },
}

/// Wiring between the CLI and the controller.
#[derive(Clone, Debug)]
pub struct EtcdProxyControllerConfig {
    /// Information needed to connect etcd-proxy pods to the core etcd.
    pub core_etcd: CoreEtcdConfig,

    /// Name of the namespace where the controller is deployed and where it
    /// places the resources it owns.
    pub controller_namespace: String,

    /// Image used for etcd-proxy Deployments.
    pub proxy_image: String,

    /// Path to a kubeconfig, used only when running out of cluster.
    pub kubeconfig_path: Option<String>,
}

/// Core etcd information used by the controller to wire up etcd-proxy pods.
#[derive(Clone, Debug)]
pub struct CoreEtcdConfig {
    /// Addresses of the core etcd cluster members.
    pub urls: Vec<String>,

    /// Name of the ConfigMap in the controller namespace holding the CA
    /// certificates of the core etcd.
    pub ca_config_map_name: String,

    /// Name of the Secret in the controller namespace holding the client
    /// certificate/key pair for the core etcd.
    pub cert_secret_name: String,
}

impl EtcdProxyControllerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = Vec::new();

        if self.core_etcd.urls.is_empty() || self.core_etcd.urls.iter().any(String::is_empty) {
            problems.push("core etcd url empty".to_owned());
        }
        if self.core_etcd.ca_config_map_name.is_empty() {
            problems.push("core etcd ca certificates configmap name empty".to_owned());
        }
        if self.core_etcd.cert_secret_name.is_empty() {
            problems.push("core etcd certificates secret name empty".to_owned());
        }
        if self.controller_namespace.is_empty() {
            problems.push("controller namespace name empty".to_owned());
        }
        if self.proxy_image.is_empty() {
            problems.push("etcd proxy image name empty".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            InvalidConfigurationSnafu { problems }.fail()
        }
    }
}

/// Resolves the controller namespace: an explicit flag wins, then the
/// in-cluster serviceaccount namespace file, then the default.
pub fn detect_controller_namespace(namespace: &str) -> String {
    if !namespace.is_empty() {
        return namespace.to_owned();
    }

    if let Ok(data) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        let namespace = data.trim();
        if !namespace.is_empty() {
            return namespace.to_owned();
        }
    }

    DEFAULT_CONTROLLER_NAMESPACE.to_owned()
}
