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

use clap::{Args, Parser, Subcommand};
use operator::config::{
    CoreEtcdConfig, DEFAULT_CORE_ETCD_CA_CONFIG_MAP, DEFAULT_CORE_ETCD_CERT_SECRET,
    DEFAULT_PROXY_IMAGE, EtcdProxyControllerConfig, detect_controller_namespace,
};

#[derive(Parser)]
#[command(name = "etcdproxy-op")]
#[command(about = "EtcdProxy Kubernetes controller CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Output the EtcdStorage CRD in YAML
    Crd {
        /// Optional output path. If not set, the output will be written to stdout.
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Run the controller
    Server(ServerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// The addresses of the core etcd servers.
    #[arg(short = 'u', long = "etcd-core-url", required = true)]
    etcd_core_urls: Vec<String>,

    /// The name of the ConfigMap where the core etcd CA is stored.
    #[arg(long, default_value = DEFAULT_CORE_ETCD_CA_CONFIG_MAP)]
    etcd_core_ca_configmap: String,

    /// The name of the Secret where the core etcd client certificates are stored.
    #[arg(long, default_value = DEFAULT_CORE_ETCD_CERT_SECRET)]
    etcd_core_certs_secret: String,

    /// Name of the namespace where the controller is deployed. Detected from
    /// the in-cluster serviceaccount when not set.
    #[arg(short, long, default_value = "")]
    namespace: String,

    /// Path to kubeconfig (required only if running out-cluster).
    #[arg(short, long)]
    kubeconfig: Option<String>,

    /// The image to be used for creating etcd proxy pods.
    #[arg(long, default_value = DEFAULT_PROXY_IMAGE)]
    etcd_proxy_image: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd { file } => operator::crd(file).await?,
        Commands::Server(args) => {
            let config = EtcdProxyControllerConfig {
                core_etcd: CoreEtcdConfig {
                    urls: args.etcd_core_urls,
                    ca_config_map_name: args.etcd_core_ca_configmap,
                    cert_secret_name: args.etcd_core_certs_secret,
                },
                controller_namespace: detect_controller_namespace(&args.namespace),
                proxy_image: args.etcd_proxy_image,
                kubeconfig_path: args.kubeconfig,
            };
            config.validate()?;

            operator::run(config).await?;
        }
    }

    Ok(())
}
