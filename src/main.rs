mod broadcast;
mod collectors;
mod config;
mod control;
mod http;
mod metrics;
mod protocol;
mod registry;
mod state;

use axum::serve;
use broadcast::Broadcaster;
use clap::Parser;
use collectors::aggregator::ProbeAggregator;
use collectors::shell::ShellHost;
use config::Config;
use metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "serverpulse")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --listen override");
            std::process::exit(1);
        }
    }

    info!(
        listen = %cfg.listen,
        process = %cfg.server.process_name,
        session = %cfg.server.session_name,
        port = cfg.server.port,
        "starting serverpulse"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let timeout = Duration::from_millis(cfg.probes.timeout_ms);
    let host = Arc::new(ShellHost::new(&cfg.server, timeout));
    let aggregator = match ProbeAggregator::new(
        host,
        cfg.probes.clone(),
        cfg.server.capacity,
        metrics.clone(),
    ) {
        Ok(aggregator) => aggregator,
        Err(err) => {
            error!(error = %err, "failed to build occupancy patterns");
            std::process::exit(1);
        }
    };
    let broadcaster = Broadcaster::new(
        aggregator,
        cfg.broadcast.clone(),
        cfg.control.clone(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let broadcaster = broadcaster.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, broadcaster, &cfg.http);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, %addr, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(%addr, "HTTP and WebSocket listener ready");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server failed");
            }
        })
    };

    let status_task = tokio::spawn(broadcaster.clone().run_status_loop(shutdown_rx.clone()));
    let privileged_task = tokio::spawn(broadcaster.clone().run_privileged_loop(shutdown_rx));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);
    broadcaster.shutdown().await;

    let _ = status_task.await;
    let _ = privileged_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
