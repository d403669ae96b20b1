#[macro_use]
extern crate log;

use kind_provider_apis::{Cluster, NamespacedCluster, ProviderConfig};
use kube::{Api, Client};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use std::{sync::Arc, time::Duration};

mod cluster_controller;
use cluster_controller::*;
mod cluster_modifications;
mod errors;
mod external;
mod kind;
mod kind_config;
mod managed;
mod node_inspector;
mod prometheus_exporter;
mod provider_config_controller;
use provider_config_controller::*;
mod usage;
mod utils;

use external::Connector;
use kind::{DockerImageLookup, KindCli};
use usage::KubeUsageTracker;

/// The K8s field manager name.
const MANAGER: &'static str = "provider-kind";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_MAX_RECONCILE_RATE: u16 = 10;

#[derive(Clone)]
struct Configuration {
    client: Client,
    provider_configs: Api<ProviderConfig>,
    poll_interval: Duration,
    max_reconcile_rate: u16,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        let poll_interval = parse_poll_interval(env_var("POLL_INTERVAL"))?;
        let max_reconcile_rate = parse_max_reconcile_rate(env_var("MAX_RECONCILE_RATE"))?;
        info!(
            "Polling KIND clusters every {}, reconciling at most {} clusters at once",
            humantime::format_duration(poll_interval),
            max_reconcile_rate
        );
        Ok(Configuration {
            provider_configs: Api::all(client.clone()),
            client,
            poll_interval,
            max_reconcile_rate,
        })
    }
}

fn parse_poll_interval(value: Option<String>) -> anyhow::Result<Duration> {
    match value {
        Some(v) => Ok(humantime::parse_duration(v.as_str())
            .map_err(|e| anyhow::anyhow!("invalid POLL_INTERVAL {}: {}", v, e))?),
        None => Ok(DEFAULT_POLL_INTERVAL),
    }
}

fn parse_max_reconcile_rate(value: Option<String>) -> anyhow::Result<u16> {
    match value {
        Some(v) => match v.parse::<u16>() {
            Ok(0) | Err(_) => Err(anyhow::anyhow!(
                "invalid MAX_RECONCILE_RATE {}, expected a positive number",
                v
            )),
            Ok(rate) => Ok(rate),
        },
        None => Ok(DEFAULT_MAX_RECONCILE_RATE),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        warn!("failed to install rustls crypto provider: {:?}", e);
    }
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client.clone())?;
    let kind_binary = env_var("KIND_BINARY").unwrap_or_else(|| "kind".to_string());
    let docker_binary = env_var("DOCKER_BINARY").unwrap_or_else(|| "docker".to_string());
    let usage = Arc::new(KubeUsageTracker::new(client));
    let connector = Arc::new(Connector::new(
        usage.clone(),
        Arc::new(KindCli::new(kind_binary, docker_binary.clone())),
        Arc::new(DockerImageLookup::new(docker_binary)),
    ));
    let cluster_controller =
        ClusterController::<Cluster>::new(configuration.clone(), connector.clone(), usage.clone())
            .start();
    let namespaced_cluster_controller =
        ClusterController::<NamespacedCluster>::new(configuration.clone(), connector, usage)
            .start();
    let provider_config_controller = ProviderConfigController::new(configuration).start();
    info!("start controllers ...");
    tokio::select! {
       _ = cluster_controller => (),
       _ = namespaced_cluster_controller => (),
       _ = provider_config_controller => (),
       r = prometheus_metrics_exporter => r?,
    };
    Ok(())
}
