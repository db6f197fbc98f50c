//! Captive-portal hotspot coordinator.
//!
//! Watches the upstream RPC connection state (an external collaborator)
//! and the upstream poller's consecutive-miss counter. After enough
//! missed cycles with the link down, it raises the provisioning
//! hotspot; once the link is back, it lowers it again. A failed check
//! never breaks the next cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::settings::SettingsStore;
use crate::wifi::WifiManager;

/// Connection state of the upstream RPC channel, maintained elsewhere.
pub trait UpstreamLink: Send + Sync {
    fn is_established(&self) -> bool;
}

/// Plain shared flag implementation, flipped by the RPC task.
#[derive(Default)]
pub struct SharedLinkState(AtomicBool);

impl SharedLinkState {
    pub fn set_established(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

impl UpstreamLink for SharedLinkState {
    fn is_established(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct HotspotCoordinator {
    wifi: Arc<WifiManager>,
    settings: Arc<SettingsStore>,
    link: Arc<dyn UpstreamLink>,
    misses: Arc<AtomicU32>,
    initial_delay: Duration,
    interval: Duration,
    miss_threshold: u32,
}

impl HotspotCoordinator {
    pub fn new(
        wifi: Arc<WifiManager>,
        settings: Arc<SettingsStore>,
        link: Arc<dyn UpstreamLink>,
        misses: Arc<AtomicU32>,
    ) -> Self {
        Self {
            wifi,
            settings,
            link,
            misses,
            initial_delay: Duration::from_secs(90),
            interval: Duration::from_secs(90),
            miss_threshold: 12,
        }
    }

    pub fn with_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        // a previous run may have died with the AP profile still around
        self.wifi.cleanup_stale_hotspot().await;

        if !self.settings.allow_hotspot() {
            tracing::info!("hotspot disabled by configuration, coordinator exiting");
            return;
        }

        // give the saved client connection a chance first
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        loop {
            self.check_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        if self.wifi.status().hotspot_active {
            if let Err(e) = self.wifi.stop_hotspot().await {
                tracing::warn!(error = %e, "hotspot not stopped during shutdown");
            }
        }
        tracing::info!("hotspot coordinator stopped");
    }

    async fn check_once(&self) {
        let established = self.link.is_established();
        let misses = self.misses.load(Ordering::Acquire);
        let hotspot_active = self.wifi.status().hotspot_active;
        tracing::debug!(established, misses, hotspot_active, "coordinator check");

        if !established && misses > self.miss_threshold && !hotspot_active {
            tracing::info!(misses, "upstream silent too long, raising hotspot");
            if let Err(e) = self.wifi.start_hotspot(None, None).await {
                tracing::warn!(error = %e, "hotspot raise failed, will retry next cycle");
            }
        } else if established && hotspot_active {
            tracing::info!("upstream connection restored, lowering hotspot");
            if let Err(e) = self.wifi.stop_hotspot().await {
                tracing::warn!(error = %e, "hotspot lower failed, will retry next cycle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::script::ScriptedRunner;
    use crate::shell::CmdOutput;
    use crate::wifi::probe::StaticProbe;
    use crate::wifi::ScanCache;
    use std::io::Write;

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        wifi: Arc<WifiManager>,
        settings: Arc<SettingsStore>,
        link: Arc<SharedLinkState>,
        misses: Arc<AtomicU32>,
        _file: tempfile::NamedTempFile,
    }

    async fn fixture(allow_hotspot: bool) -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"SenderReceiverSet": {{"DID": "EDGE-00AB-CD12", "UID": "owner-7",
                "NCBUrl": "http://ncb.example.net", "NCBIP": "192.168.1.9",
                "AllowHotspot": {allow_hotspot}}}}}"#
        )
        .unwrap();
        let settings = Arc::new(SettingsStore::load(file.path()).unwrap());

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nmcli radio wifi", CmdOutput::ok("enabled\n"));
        runner.on(
            "connection show --active",
            CmdOutput::ok("NCBEdge_ABCD12:wlan0:activated\n"),
        );

        let scan = Arc::new(ScanCache::new(runner.clone()));
        let wifi = Arc::new(WifiManager::new(
            runner.clone(),
            Arc::new(StaticProbe::new(true)),
            scan,
            settings.clone(),
        ));
        Fixture {
            runner,
            wifi,
            settings,
            link: Arc::new(SharedLinkState::default()),
            misses: Arc::new(AtomicU32::new(0)),
            _file: file,
        }
    }

    fn coordinator(fx: &Fixture) -> HotspotCoordinator {
        HotspotCoordinator::new(
            fx.wifi.clone(),
            fx.settings.clone(),
            fx.link.clone(),
            fx.misses.clone(),
        )
        .with_timing(Duration::from_secs(90), Duration::from_secs(90))
    }

    #[tokio::test(start_paused = true)]
    async fn raises_then_lowers_with_upstream_state() {
        let fx = fixture(true).await;
        fx.misses.store(13, Ordering::Release);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(coordinator(&fx).run(cancel.clone()));

        // initial delay + first check
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(fx.wifi.status().hotspot_active, "hotspot raised after misses");
        let appended = fx.runner.count(" -A ");
        assert_eq!(appended, 5, "exactly the captive-portal rule set");

        // link restored: next cycle lowers the hotspot
        fx.link.set_established(true);
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!fx.wifi.status().hotspot_active, "hotspot lowered once established");
        assert!(fx.runner.count("iptables -t nat -F") >= 2, "teardown flushed nat");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_leaves_hotspot_down() {
        let fx = fixture(true).await;
        fx.misses.store(12, Ordering::Release); // threshold is strictly-greater

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(coordinator(&fx).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(!fx.wifi.status().hotspot_active);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_flag_exits_after_boot_cleanup() {
        let fx = fixture(false).await;
        fx.misses.store(100, Ordering::Release);

        let cancel = CancellationToken::new();
        coordinator(&fx).run(cancel).await;

        // boot cleanup ran, nothing was raised
        assert!(fx.runner.ran("nmcli connection delete 'NCBEdge_ABCD12'"));
        assert!(!fx.runner.ran("802-11-wireless.mode ap"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lowers_an_active_hotspot() {
        let fx = fixture(true).await;
        fx.misses.store(13, Ordering::Release);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(coordinator(&fx).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(fx.wifi.status().hotspot_active);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!fx.wifi.status().hotspot_active, "graceful stop on shutdown");
    }
}
