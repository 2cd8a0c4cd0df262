//! Controller binary: wires the store, control loops and HTTP surfaces.
//!
//! Admission webhooks and the allocation endpoint serve on every replica;
//! control loops start only once the leader lease is held, and losing the
//! lease exits the process for the supervisor to restart.

use anyhow::{anyhow, Context};
use clap::Parser;
use fleetforge::allocator::{self, AllocationEngine, EngineConfig};
use fleetforge::config::Options;
use fleetforge::fleetautoscalers::FleetAutoscalerController;
use fleetforge::fleets::FleetController;
use fleetforge::gameservers::{
    GameServerController, HealthMonitor, NodeCounter, SidecarConfig,
};
use fleetforge::gameserversets::GameServerSetController;
use fleetforge::ports::PortAllocator;
use fleetforge::store::election::Elector;
use fleetforge::store::{gc, Store};
use fleetforge::webhooks;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let options = Options::parse();
    let (min_port, max_port) = options
        .resolved_port_range()
        .map_err(|e| anyhow!(e))
        .context("invalid configuration")?;
    info!(?options, "starting fleetforge controller");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = Store::new();
    tokio::spawn(gc::run(store.clone(), shutdown_rx.clone()));

    let counter = NodeCounter::start(store.clone(), shutdown_rx.clone());
    let health = HealthMonitor::new(store.clone());
    tokio::spawn(Arc::clone(&health).run(shutdown_rx.clone()));

    // Allocation and admission serve on every replica, leader or not.
    let engine = AllocationEngine::start(
        store.clone(),
        Arc::clone(&counter),
        EngineConfig {
            workers: options.allocation_workers,
            top_n: options.top_n_game_server_count,
            cluster_name: options.cluster_name.clone(),
            ..EngineConfig::default()
        },
        shutdown_rx.clone(),
    );
    let allocation_listener = tokio::net::TcpListener::bind(options.allocation_bind)
        .await
        .with_context(|| format!("binding allocation endpoint on {}", options.allocation_bind))?;
    tokio::spawn(async move {
        if let Err(e) =
            axum::serve(allocation_listener, allocator::service::router(engine)).await
        {
            error!(error = %e, "allocation endpoint failed");
        }
    });

    let cert = options.cert_dir.join("server.crt");
    let key = options.cert_dir.join("server.key");
    let webhook_bind = options.webhook_bind;
    if cert.exists() && key.exists() {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("loading webhook TLS material")?;
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(webhook_bind, tls)
                .serve(webhooks::router().into_make_service())
                .await
            {
                error!(error = %e, "webhook endpoint failed");
            }
        });
    } else {
        info!(cert_dir = %options.cert_dir.display(), "no TLS material, serving webhooks over plain HTTP");
        let listener = tokio::net::TcpListener::bind(webhook_bind)
            .await
            .with_context(|| format!("binding webhook endpoint on {webhook_bind}"))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, webhooks::router()).await {
                error!(error = %e, "webhook endpoint failed");
            }
        });
    }

    // Control loops run on the leader only.
    let identity = format!(
        "fleetforge-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    );
    let elector = Arc::new(Elector::new(
        store.clone(),
        identity,
        options.lease_duration(),
    ));
    elector
        .acquire(shutdown_rx.clone())
        .await
        .context("acquiring leader lease")?;

    // Replay cluster state into the process-wide singletons now that this
    // replica leads.
    let port_allocator = Arc::new(PortAllocator::new(min_port, max_port));
    port_allocator.sync(&store.nodes.snapshot(), &store.game_servers.snapshot());

    let sidecar = SidecarConfig {
        image: options.sidecar_image.clone(),
        cpu_request: options.sidecar_cpu_request.clone(),
        cpu_limit: options.sidecar_cpu_limit.clone(),
        always_pull: options.always_pull_sidecar,
    };
    let gs_controller = GameServerController::new(
        store.clone(),
        Arc::clone(&port_allocator),
        sidecar,
        shutdown_rx.clone(),
    );
    tokio::spawn(gs_controller.run(options.gameserver_workers, shutdown_rx.clone()));

    let set_controller =
        GameServerSetController::new(store.clone(), Arc::clone(&counter), shutdown_rx.clone());
    tokio::spawn(set_controller.run(1, shutdown_rx.clone()));

    let fleet_controller = FleetController::new(store.clone(), shutdown_rx.clone());
    tokio::spawn(fleet_controller.run(1, shutdown_rx.clone()));

    let autoscaler_controller =
        FleetAutoscalerController::new(store.clone(), options.autoscaler_sync_period());
    tokio::spawn(autoscaler_controller.run(shutdown_rx.clone()));

    info!("control loops running");

    let lease = {
        let elector = Arc::clone(&elector);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { elector.run(shutdown).await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
            // Give workers a moment to finish their current item.
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
        result = lease => {
            let _ = shutdown_tx.send(true);
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "leader lease lost");
                    Err(e.into())
                }
                Err(e) => Err(anyhow!("lease task panicked: {e}")),
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
