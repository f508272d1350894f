mod api;
mod cond;
mod config;
mod controller;
mod error;
mod gateway;
mod version;
mod workgroup;

use std::sync::Arc;

use crate::config::Config;
use crate::controller::{HealthModule, KubernetesCache, PodLogs, Reconciler, StatusCache};
use crate::error::{format_error_chain, AppError};
use crate::gateway::{GatewayClient, GatewayOpts};
use crate::workgroup::Group;

const EXIT_UNRECOVERABLE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("hyper", log::LevelFilter::Warn) // HTTP internals log every connection
        .filter_module("tower", log::LevelFilter::Warn)
        .filter_module("kube_client", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    if let Ok(info) = serde_json::to_string(&version::get_version()) {
        log::info!("starting deployer: {}", info);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e @ AppError::InvalidInput(_)) => {
            log::error!("{}", e);
            std::process::exit(EXIT_USAGE);
        }
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(EXIT_UNRECOVERABLE);
        }
    };

    // picks up in-cluster credentials or the local kubeconfig
    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            log::error!("failed to build Kubernetes client: {}", e);
            std::process::exit(EXIT_UNRECOVERABLE);
        }
    };

    let identifier = config.identifier();
    let cache = Arc::new(KubernetesCache::new(identifier.clone()));
    let status_cache = Arc::new(StatusCache::new());
    let pod_logs = Arc::new(PodLogs::new(client.clone()));

    let gateway = GatewayClient::new(
        GatewayOpts {
            addr: config.gateway_address.clone(),
            token: config.token.clone(),
            require_tls: config.require_tls,
        },
        cache.clone(),
        status_cache.clone(),
        pod_logs,
    );
    let gateway = match gateway {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(EXIT_UNRECOVERABLE);
        }
    };

    let health: Arc<dyn HealthModule> = gateway.clone();
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        cache.clone(),
        status_cache.clone(),
        health,
        identifier,
        config.grace_period,
    ));

    let mut group = Group::new();

    controller::watchers::register_watchers(&mut group, client, cache);

    {
        let reconciler = reconciler.clone();
        group.add(move |stop| async move { reconciler.start(stop).await });
    }

    {
        let gateway = gateway.clone();
        group.add(move |stop| async move { gateway.start(stop).await });
    }

    group.add(|stop| async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("received interrupt, shutting down");
            }
        }
        Ok(())
    });

    if let Err(e) = group.run().await {
        log::error!("{}", format_error_chain(&e));
        std::process::exit(EXIT_UNRECOVERABLE);
    }
}
