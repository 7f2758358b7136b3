mod config;
mod endpoint_filter;
mod headers;
mod lb;
mod metrics;
mod proxy;
mod realtime;
mod reload;
mod routing;
mod store;
mod traffic_log;
mod usage;

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use pingora::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    config::GatewayConfig, endpoint_filter::EndpointFilter, headers::HeaderFilter, lb::LbState,
    proxy::GatewayProxy, realtime::RealtimeHub, reload::spawn_config_watcher,
    routing::RoutingTable, store::ConfigStore, traffic_log::TrafficLog,
};

const REALTIME_CHANNEL_CAPACITY: usize = 256;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = env::var("CLP_GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_string());
    let config_path = PathBuf::from(config_path);
    let app_config = GatewayConfig::from_file(&config_path)?;
    init_tracing(&app_config.observability.log_level);

    let mut server =
        Server::new(Some(Opt::parse_args())).context("failed to initialize pingora server")?;
    tune_pingora_server(&mut server, &app_config);
    server.bootstrap();

    let runtime_config = Arc::new(ArcSwap::from_pointee(app_config.clone()));
    let bind_host = app_config.server.resolved_bind_host();
    let data_dir = app_config.data_dir();

    for endpoint in &app_config.services {
        let service_dir = data_dir.join("data");

        let config_store = Arc::new(ConfigStore::new(
            data_dir.join(format!("{}.json", endpoint.name)),
        ));
        let routing = Arc::new(RoutingTable::new(
            service_dir.join(format!("model_router_config_{}.json", endpoint.name)),
        ));
        let endpoint_filter = Arc::new(EndpointFilter::new(
            data_dir.join(format!("endpoint_filter_{}.json", endpoint.name)),
        ));
        let header_filter = Arc::new(HeaderFilter::new(
            data_dir.join(format!("header_filter_{}.json", endpoint.name)),
        ));
        let lb = Arc::new(LbState::new(
            service_dir.join(format!("lb_config_{}.json", endpoint.name)),
            endpoint.failure_threshold,
            endpoint.reset_cooldown_seconds,
        ));
        let traffic_log = Arc::new(TrafficLog::new(
            service_dir.join(format!("proxy_requests_{}.jsonl", endpoint.name)),
            app_config.server.traffic_log_limit,
        ));
        let hub = Arc::new(RealtimeHub::new(REALTIME_CHANNEL_CAPACITY));

        let gateway_proxy = GatewayProxy::new(
            endpoint,
            runtime_config.clone(),
            config_store,
            routing,
            endpoint_filter,
            header_filter,
            lb,
            traffic_log,
            hub,
        );

        let mut proxy_service = http_proxy_service(&server.configuration, gateway_proxy);
        proxy_service.add_tcp(&format!("{bind_host}:{}", endpoint.port));
        server.add_service(proxy_service);

        info!(
            service = %endpoint.name,
            listen = %format!("{bind_host}:{}", endpoint.port),
            lb_mode = ?endpoint.lb_mode,
            "service is starting"
        );
    }

    spawn_config_watcher(
        config_path.clone(),
        Duration::from_millis(app_config.server.config_reload_debounce_ms.max(50)),
        runtime_config,
    )
    .with_context(|| {
        format!(
            "failed to start config watcher for {}",
            config_path.to_string_lossy()
        )
    })?;

    if let Some(metrics_addr) = &app_config.observability.prometheus_listen {
        let mut metrics_service = pingora::services::listening::Service::prometheus_http_service();
        metrics_service.add_tcp(metrics_addr);
        server.add_service(metrics_service);
        info!(
            listen = metrics_addr,
            "prometheus metrics endpoint is enabled"
        );
    }

    info!(
        config = %config_path.to_string_lossy(),
        "clp-gateway is starting"
    );
    server.run_forever();
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

fn tune_pingora_server(server: &mut Server, app_config: &GatewayConfig) {
    if let Some(conf) = Arc::get_mut(&mut server.configuration) {
        if let Some(threads) = app_config.server.threads {
            conf.threads = threads;
        }
        if let Some(seconds) = app_config.server.grace_period_seconds {
            conf.grace_period_seconds = Some(seconds);
        }
        if let Some(seconds) = app_config.server.graceful_shutdown_timeout_seconds {
            conf.graceful_shutdown_timeout_seconds = Some(seconds);
        }
    }
}
