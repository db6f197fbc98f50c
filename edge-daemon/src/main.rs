//! NCB Edge provisioning daemon: loads settings and keys, wires the
//! subsystems together and supervises shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use edge_core::bluetooth::{AdapterControl, RfcommServer};
use edge_core::crypto::DeviceKeys;
use edge_core::settings::{SettingsStore, SETTINGS_FILE};
use edge_core::shell::ShellRunner;
use edge_core::supervisor::{HotspotCoordinator, SharedLinkState};
use edge_core::upstream::UpstreamPoller;
use edge_core::web::{self, AppState};
use edge_core::wifi::portal::PORTAL_PORT;
use edge_core::wifi::probe::IcmpProbe;
use edge_core::wifi::scan::SCAN_INTERVAL;
use edge_core::wifi::{ScanCache, WifiManager};

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// appsettings.json and Cert/ live next to the binary; fall back to the
/// working directory for development runs.
fn base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .filter(|d| d.join(SETTINGS_FILE).exists())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base = base_dir();
    let settings = Arc::new(
        SettingsStore::load(base.join(SETTINGS_FILE))
            .with_context(|| format!("loading settings from {}", base.display()))?,
    );
    let identity = settings.identity();
    tracing::info!(did = %identity.did, alias = %identity.alias(), "starting edge daemon");

    // a missing private key is fatal: nothing can be provisioned
    // trustworthily without it
    let keys = Arc::new(
        DeviceKeys::load(base.join("Cert"), &identity.did)
            .context("device private key is required at startup")?,
    );

    let runner = Arc::new(ShellRunner);
    let scan = Arc::new(ScanCache::new(runner.clone()));
    let wifi = Arc::new(WifiManager::new(
        runner.clone(),
        Arc::new(IcmpProbe::default()),
        scan.clone(),
        settings.clone(),
    ));

    // connection state of the upstream RPC channel, flipped by the
    // signalling task that owns that connection
    let link = Arc::new(SharedLinkState::default());
    let misses = Arc::new(AtomicU32::new(0));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(scan.clone().spawn_refresher(SCAN_INTERVAL, cancel.clone()));

    let adapter = Arc::new(AdapterControl::new(runner.clone(), identity.clone()));
    tasks.push(adapter.spawn_discoverability_watchdog(cancel.clone()));
    tasks.push(adapter.spawn_pairing_cleaner(cancel.clone()));

    let rfcomm = Arc::new(RfcommServer::new(
        wifi.clone(),
        keys.clone(),
        adapter,
        settings.clone(),
    ));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            // the adapter being permanently absent only costs the
            // bluetooth channel; the rest keeps running
            if let Err(e) = rfcomm.run(cancel).await {
                tracing::error!(error = %e, "rfcomm server exited");
            }
        }
    }));

    let coordinator = HotspotCoordinator::new(
        wifi.clone(),
        settings.clone(),
        link.clone(),
        misses.clone(),
    );
    tasks.push(tokio::spawn(coordinator.run(cancel.clone())));

    let poller = UpstreamPoller::new(
        wifi.clone(),
        keys,
        settings.clone(),
        runner,
        link,
        misses,
    );
    tasks.push(tokio::spawn(poller.run(cancel.clone())));

    let state = Arc::new(AppState { wifi });
    let addr = SocketAddr::from(([0, 0, 0, 0], PORTAL_PORT));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = web::serve(state, addr, cancel).await {
                tracing::error!(error = %e, "http server exited");
            }
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested, draining tasks");
    cancel.cancel();

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        tracing::warn!("shutdown budget exceeded, exiting with tasks pending");
    }

    tracing::info!("edge daemon stopped");
    Ok(())
}
