//! Standalone runner for the embedded web server.
//!
//! Wires configuration, the listener, auto-configuration and NAT traversal
//! together the way a hosting desktop application would, serves a small
//! status document, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use portside::autoconfig::{AutoConfig, ExternalIpService, Heartbeat, HttpExternalIp};
use portside::clock::SystemClock;
use portside::config::loader::load_config_or_default;
use portside::config::watcher::ConfigWatcher;
use portside::config::ConfigStore;
use portside::listener::{
    ContentClassification, Http1Provider, HttpRequest as _, ListenerProvider, WebServer,
};
use portside::nat::{detect_lan_address, IgdRouter, NatManager};
use portside::observability;
use portside::response;

#[derive(Parser)]
#[command(version, about = "Self-hosted web server with automatic port forwarding")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "portside.toml")]
    config: PathBuf,

    /// Override the listener port, as an installer would.
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between heartbeat ticks.
    #[arg(long, default_value_t = 60)]
    heartbeat_secs: u64,
}

#[derive(Serialize)]
struct Status {
    online: bool,
    external_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    observability::logging::init("portside=debug");

    tracing::info!("portside v0.1.0 starting");

    let config = load_config_or_default(&args.config)?;
    let store = Arc::new(ConfigStore::new(config));
    let _watcher = if args.config.exists() {
        Some(ConfigWatcher::new(&args.config, Arc::clone(&store)).run()?)
    } else {
        None
    };

    let clock = Arc::new(SystemClock);
    let provider = Arc::new(Http1Provider::new());
    let server = WebServer::new(provider, clock.clone());
    server.set_network_address(detect_lan_address());

    // A minimal handler so the server answers something out of the box.
    {
        let status_server = Arc::downgrade(&server);
        server.events.request_received.subscribe(move |context| {
            if context.request.raw_url().split('?').next() == Some("/status") {
                if let Some(server) = status_server.upgrade() {
                    let status = Status {
                        online: server.is_online(),
                        external_address: server.external_address(),
                    };
                    response::send_json(context.response.as_mut(), &status, None, None)?;
                    context.set_classification(ContentClassification::Json);
                    context.set_handled(true);
                }
            }
            Ok(())
        });
        server.events.response_sent.subscribe(|sent| {
            tracing::info!(
                url = %sent.url_requested,
                status = sent.status.as_u16(),
                bytes = sent.bytes_sent,
                address = %sent.address,
                elapsed_ms = sent.elapsed.as_millis() as u64,
                "Response sent"
            );
            Ok(())
        });
        server.events.exception_caught.subscribe(|error| {
            tracing::error!(%error, "Server exception");
        });
    }

    let external_ip = Arc::new(ExternalIpService::new(Arc::new(HttpExternalIp::new(
        &store.snapshot().external_ip,
    )?)));
    let heartbeat = Arc::new(Heartbeat::new(Duration::from_secs(args.heartbeat_secs)));
    heartbeat.start();

    let autoconfig = AutoConfig::new(
        Arc::clone(&server),
        Arc::clone(&store),
        external_ip,
        Arc::clone(&heartbeat),
        clock,
        args.port,
    );
    autoconfig.initialise();

    let nat = Arc::new(NatManager::new(
        Arc::new(IgdRouter::new()),
        Arc::clone(&server),
        Arc::clone(&store),
    ));
    nat.state_changed.subscribe(|status| {
        tracing::info!(
            router_present = status.router_present,
            mapping_present = status.mapping_present,
            "NAT state"
        );
    });
    if let Err(error) = nat.initialise().await {
        tracing::warn!(%error, "NAT initialisation failed");
    }
    if let Err(error) = nat.put_server_onto_internet().await {
        tracing::warn!(%error, "Could not put server onto the Internet");
    }

    // Configuration changes drive the NAT manager as well.
    {
        let nat = Arc::clone(&nat);
        let mut changes = store.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) => nat.on_config_changed().await,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    server.set_online(true).await?;
    if let Some(address) = server.provider().bound_addr() {
        tracing::info!(%address, "Serving");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    nat.shutdown().await;
    autoconfig.shutdown().await;
    heartbeat.stop();

    tracing::info!("Shutdown complete");
    Ok(())
}
