//! devicemux sidecar - iOS device reconciler
//!
//! This is the main entry point for the sidecar. It watches usbmuxd for
//! attached devices, keeps their `MobileDevice` resources up to date and
//! serves health endpoints.
//!
//! # HTTP Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /ready` - Readiness check
//!
//! The process exits non-zero when a reconciliation pass fails, so the pod
//! is restarted.

use std::sync::Arc;

use devicemux_muxer::MuxerClient;
use devicemux_sidecar::{
    health, listen_loop, DeveloperDiskProvisioner, DeviceHost, DirectoryDiskStore,
    DiskStoreChain, HttpDiskStore, KubeDeviceRepository, MuxerRecordStore, PairingProvisioner,
    PairingSettings, PairingTaskRegistry, Reconciler, SecretRecordStore, SidecarConfig,
    UsbmuxHost,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Wiring
// ============================================================================

fn disk_stores(config: &SidecarConfig) -> devicemux_sidecar::Result<DiskStoreChain> {
    let mut stores = DiskStoreChain::new();
    if let Some(dir) = &config.developer_disk_dir {
        stores = stores.with(Arc::new(DirectoryDiskStore::new(dir)));
    }
    if let Some(url) = &config.developer_disk_url {
        stores = stores.with(Arc::new(HttpDiskStore::new(url.as_str())?));
    }
    if stores.is_empty() {
        tracing::warn!("No developer disk store configured, images will not be mounted");
    }
    Ok(stores)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devicemux=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting devicemux sidecar");

    // Load configuration from environment
    let config = SidecarConfig::from_env()?;
    tracing::info!(
        pod = %config.pod_name,
        namespace = %config.namespace,
        muxer = %config.muxer,
        "Loaded sidecar configuration"
    );

    let client = kube::Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let muxer = MuxerClient::new(config.muxer.clone());
    let host: Arc<dyn DeviceHost> = Arc::new(UsbmuxHost::new(muxer.clone()));
    let registry = Arc::new(PairingTaskRegistry::new());

    let pairing = PairingProvisioner::new(
        Arc::clone(&host),
        Arc::new(MuxerRecordStore::new(muxer.clone())),
        Arc::new(SecretRecordStore::new(client.clone(), &config.namespace)),
        Arc::clone(&registry),
        PairingSettings::from(&config),
        cancel.clone(),
    );
    let disks = DeveloperDiskProvisioner::new(Arc::clone(&host), Arc::new(disk_stores(&config)?));
    let repository = Arc::new(KubeDeviceRepository::new(
        client,
        &config.namespace,
        &config.pod_name,
    ));
    let reconciler = Reconciler::new(config.pod_name.clone(), repository, host, pairing, disks);

    // Start the health server
    let app = health::router(reconciler.readiness());
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
    });

    // Subscribe to device events
    let (events_tx, events_rx) = mpsc::channel(1);
    let listener_task = tokio::spawn(listen_loop(
        muxer,
        events_tx,
        config.listen_retry_interval,
        cancel.clone(),
    ));
    tokio::spawn(shutdown_signal(cancel.clone()));
    tracing::info!("Started device event listener");

    let result = reconciler.run(events_rx, cancel.clone()).await;

    cancel.cancel();
    registry.abort_all();
    let _ = listener_task.await;
    if let Ok(Err(e)) = server.await {
        tracing::warn!(error = %e, "HTTP server failed");
    }

    result?;
    tracing::info!("devicemux sidecar stopped");
    Ok(())
}
