//! Wi-Fi state manager: the single writer of wireless state.
//!
//! Every mutation of the interface (joining a customer network,
//! raising or lowering the provisioning hotspot) runs under one async
//! mutex with a bounded acquisition timeout. The HTTP endpoints, the
//! RFCOMM server and the upstream poller all funnel through here.
//!
//! `stop_hotspot_locked` is the unlocked primitive used while an outer
//! operation already holds the mutex; the public `stop_hotspot`
//! acquires and delegates. No observer can see hotspot mode and client
//! mode active at the same time.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::identity::DeviceIdentity;
use crate::settings::SettingsStore;
use crate::shell::{sh_quote, CommandRunner};
use crate::wifi::portal::{CaptivePortal, PROVISION_URL};
use crate::wifi::probe::{self, ReachabilityProbe};
use crate::wifi::{ScanCache, IFACE_NAME};
use crate::{Error, Result};

pub const DEFAULT_HOTSPOT_PSK: &str = "12345678";

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_SETTLE: Duration = Duration::from_secs(3);
const HOTSPOT_SETTLE: Duration = Duration::from_secs(2);

/// Read-only snapshot published to HTTP handlers and supervisors.
#[derive(Debug, Clone, Default)]
pub struct WifiStatus {
    pub hotspot_active: bool,
    pub hotspot_ssid: Option<String>,
    pub hotspot_password: Option<String>,
    pub config_url: Option<String>,
}

#[derive(Debug, Default)]
struct WifiState {
    hotspot_active: bool,
    hotspot_ssid: Option<String>,
    hotspot_password: Option<String>,
}

pub struct WifiManager {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ReachabilityProbe>,
    scan: Arc<ScanCache>,
    settings: Arc<SettingsStore>,
    identity: DeviceIdentity,
    portal: CaptivePortal,
    state: Mutex<WifiState>,
    status_tx: watch::Sender<WifiStatus>,
    reconnect_tx: watch::Sender<u64>,
}

impl WifiManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ReachabilityProbe>,
        scan: Arc<ScanCache>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        let identity = settings.identity();
        let portal = CaptivePortal::new(runner.clone());
        let (status_tx, _) = watch::channel(WifiStatus::default());
        let (reconnect_tx, _) = watch::channel(0);
        Self {
            runner,
            probe,
            scan,
            settings,
            identity,
            portal,
            state: Mutex::new(WifiState::default()),
            status_tx,
            reconnect_tx,
        }
    }

    pub fn status(&self) -> WifiStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WifiStatus> {
        self.status_tx.subscribe()
    }

    /// Bumped after a verified connect; the upstream RPC task watches
    /// this to force an immediate reconnect against the new target.
    pub fn subscribe_reconnect(&self) -> watch::Receiver<u64> {
        self.reconnect_tx.subscribe()
    }

    pub fn scan_cache(&self) -> &ScanCache {
        &self.scan
    }

    async fn lock_state(&self) -> Result<MutexGuard<'_, WifiState>> {
        tokio::time::timeout(LOCK_TIMEOUT, self.state.lock())
            .await
            .map_err(|_| {
                Error::Unavailable("wireless interface is busy, retry shortly".into())
            })
    }

    /// Join `ssid` and verify the upstream at `ncbip` answers ICMP.
    /// On any failure after validation the hotspot is re-raised so the
    /// user keeps a provisioning channel.
    pub async fn connect_to_wifi(
        &self,
        ssid: &str,
        password: Option<&str>,
        ncbip: &str,
    ) -> Result<String> {
        let ncbip = ncbip.trim();
        let target = probe::parse_target(ncbip).ok_or_else(|| {
            Error::InvalidArgument(format!("'{ncbip}' is not a valid IPv4 address"))
        })?;
        if ssid.trim().is_empty() {
            return Err(Error::InvalidArgument("SSID must not be empty".into()));
        }

        let mut st = self.lock_state().await?;
        let was_hotspot = st.hotspot_active;
        if was_hotspot {
            self.stop_hotspot_locked(&mut st).await?;
        }

        // Validation phase: the interface has not been touched yet, so
        // a miss here only restores the hotspot if we just stopped it.
        if let Err(e) = self.validate_target(ssid).await {
            if was_hotspot {
                self.restore_hotspot(&mut st).await;
            }
            return Err(e);
        }

        match self.join_and_verify(ssid, password, target, ncbip).await {
            Ok(()) => {
                // NCBIP is on disk and in memory before the reconnect
                // signal fires, so a racing observer finds the new IP.
                self.reconnect_tx.send_modify(|n| *n += 1);
                self.publish(&st);
                tracing::info!(ssid, ncbip, "client connection verified");
                Ok(format!("connected to '{ssid}', upstream {ncbip} reachable"))
            }
            Err(e) => {
                tracing::warn!(ssid, error = %e, "connect failed, re-raising hotspot");
                self.restore_hotspot(&mut st).await;
                Err(e)
            }
        }
    }

    pub async fn start_hotspot(
        &self,
        ssid: Option<String>,
        password: Option<String>,
    ) -> Result<String> {
        let mut st = self.lock_state().await?;
        self.start_hotspot_locked(&mut st, ssid, password).await
    }

    pub async fn stop_hotspot(&self) -> Result<String> {
        let mut st = self.lock_state().await?;
        self.stop_hotspot_locked(&mut st).await
    }

    /// Boot-time cleanup: delete any AP profile an ungraceful shutdown
    /// left behind and flush stale portal rules.
    pub async fn cleanup_stale_hotspot(&self) {
        let ssid = self.identity.hotspot_ssid();
        let _ = self
            .runner
            .run(&format!("nmcli connection delete {}", sh_quote(&ssid)))
            .await;
        if let Err(e) = self.portal.teardown().await {
            tracing::warn!(error = %e, "stale portal cleanup failed");
        }
    }

    // ---- locked primitives ------------------------------------------------

    async fn start_hotspot_locked(
        &self,
        st: &mut WifiState,
        ssid: Option<String>,
        password: Option<String>,
    ) -> Result<String> {
        if st.hotspot_active {
            let name = st.hotspot_ssid.clone().unwrap_or_default();
            return Ok(format!("hotspot '{name}' already active"));
        }

        let ssid = ssid
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.identity.hotspot_ssid());
        let psk = match password {
            Some(p) if psk_length_ok(&p) => p,
            Some(_) => {
                tracing::warn!("hotspot password outside WPA-PSK bounds, using default");
                DEFAULT_HOTSPOT_PSK.to_string()
            }
            None => self
                .settings
                .hotspot_password()
                .filter(|p| psk_length_ok(p))
                .unwrap_or_else(|| DEFAULT_HOTSPOT_PSK.to_string()),
        };

        let q = sh_quote(&ssid);
        let _ = self
            .runner
            .run(&format!("nmcli device disconnect {IFACE_NAME}"))
            .await;
        let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;

        let add = format!(
            "nmcli connection add type wifi ifname {IFACE_NAME} con-name {q} autoconnect no \
             ssid {q} 802-11-wireless.mode ap 802-11-wireless.band bg ipv4.method shared \
             ipv6.method shared wifi-sec.key-mgmt wpa-psk wifi-sec.psk {}",
            sh_quote(&psk)
        );
        let added = self.runner.run(&add).await?;
        if !added.success {
            return Err(Error::host_tool(&added));
        }

        let up = self.runner.run(&format!("nmcli connection up {q}")).await?;
        if !up.success {
            let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;
            return Err(Error::host_tool(&up));
        }

        tokio::time::sleep(HOTSPOT_SETTLE).await;
        if !self.active_connection_is(&ssid).await? {
            let _ = self.runner.run(&format!("nmcli connection down {q}")).await;
            let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;
            return Err(Error::Unavailable(
                "hotspot profile did not reach the active-connection table".into(),
            ));
        }

        st.hotspot_active = true;
        st.hotspot_ssid = Some(ssid.clone());
        st.hotspot_password = Some(psk);
        self.publish(st);

        if let Err(e) = self.portal.install().await {
            // no partial state past the operation boundary: rules out,
            // profile down, flags cleared
            let _ = self.portal.teardown().await;
            let _ = self.runner.run(&format!("nmcli connection down {q}")).await;
            let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;
            st.hotspot_active = false;
            st.hotspot_ssid = None;
            st.hotspot_password = None;
            self.publish(st);
            return Err(e);
        }

        tracing::info!(ssid, "hotspot active");
        Ok(format!("hotspot '{ssid}' active"))
    }

    async fn stop_hotspot_locked(&self, st: &mut WifiState) -> Result<String> {
        if !st.hotspot_active {
            return Ok("hotspot not active".into());
        }
        let ssid = st
            .hotspot_ssid
            .clone()
            .unwrap_or_else(|| self.identity.hotspot_ssid());

        // Rules come out before the AP profile goes down so the closing
        // window never redirects real client traffic.
        let teardown = self.portal.teardown().await;

        let q = sh_quote(&ssid);
        let _ = self.runner.run(&format!("nmcli connection down {q}")).await;
        let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;

        st.hotspot_active = false;
        st.hotspot_ssid = None;
        st.hotspot_password = None;
        self.publish(st);
        teardown?;

        tracing::info!(ssid, "hotspot stopped");
        Ok(format!("hotspot '{ssid}' stopped"))
    }

    async fn restore_hotspot(&self, st: &mut WifiState) {
        if let Err(e) = self.start_hotspot_locked(st, None, None).await {
            tracing::error!(error = %e, "hotspot rollback failed, device may be unreachable");
        }
    }

    // ---- steps ------------------------------------------------------------

    async fn validate_target(&self, ssid: &str) -> Result<()> {
        if !self.radio_enabled().await? {
            return Err(Error::Unavailable("Wi-Fi radio is disabled".into()));
        }
        if !self.scan.is_available(ssid) {
            let nearby = self.scan.top_ssids(5);
            return Err(Error::Unavailable(format!(
                "SSID '{ssid}' not found in scan results (nearby: {})",
                nearby.join(", ")
            )));
        }
        Ok(())
    }

    async fn join_and_verify(
        &self,
        ssid: &str,
        password: Option<&str>,
        target: Ipv4Addr,
        ncbip: &str,
    ) -> Result<()> {
        let q = sh_quote(ssid);
        let password = password.filter(|p| !p.is_empty());

        // stale profile of the same name would shadow the new one
        let _ = self.runner.run(&format!("nmcli connection delete {q}")).await;

        let mut add = format!(
            "nmcli connection add type wifi ifname {IFACE_NAME} con-name {q} autoconnect yes ssid {q}"
        );
        if let Some(pw) = password {
            add.push_str(&format!(
                " wifi-sec.key-mgmt wpa-psk wifi-sec.psk {}",
                sh_quote(pw)
            ));
        }

        let added = self.runner.run(&add).await?;
        if added.success {
            let up = self.runner.run(&format!("nmcli connection up {q}")).await?;
            if !up.success {
                return Err(Error::host_tool(&up));
            }
        } else {
            // persistent profile refused; the one-shot path still gets
            // the interface associated for this session
            tracing::warn!(ssid, "profile install failed, using direct connect");
            let mut direct =
                format!("nmcli device wifi connect {q} ifname {IFACE_NAME}");
            if let Some(pw) = password {
                direct.push_str(&format!(" password {}", sh_quote(pw)));
            }
            let out = self.runner.run(&direct).await?;
            if !out.success {
                return Err(Error::host_tool(&out));
            }
        }

        tokio::time::sleep(CLIENT_SETTLE).await;

        if !self.radio_enabled().await? {
            return Err(Error::Unavailable("radio dropped during association".into()));
        }
        if !self.active_connection_is(ssid).await? {
            return Err(Error::Unavailable(format!(
                "'{ssid}' did not reach the active-connection table"
            )));
        }
        let iw = self.runner.run("iwgetid -r").await?;
        let current = iw.stdout.trim();
        if current != ssid {
            return Err(Error::Unavailable(format!(
                "interface reports SSID '{current}' instead of '{ssid}'"
            )));
        }

        if !self.probe.reachable(target).await {
            return Err(Error::Unreachable(format!("no ICMP reply from {target}")));
        }

        self.settings.set_ncb_ip(ncbip)?;
        Ok(())
    }

    async fn radio_enabled(&self) -> Result<bool> {
        let out = self.runner.run("nmcli radio wifi").await?;
        Ok(out.success && out.stdout.trim().starts_with("enabled"))
    }

    /// Second, independent check against `iwgetid`: the name must be in
    /// the active-connection table on our interface, activated.
    async fn active_connection_is(&self, name: &str) -> Result<bool> {
        let out = self
            .runner
            .run("nmcli -t -f NAME,DEVICE,STATE connection show --active")
            .await?;
        if !out.success {
            return Ok(false);
        }
        for line in out.stdout.lines() {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() >= 3
                && parts[0] == name
                && parts[1] == IFACE_NAME
                && parts[2] == "activated"
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn publish(&self, st: &WifiState) {
        self.status_tx.send_replace(WifiStatus {
            hotspot_active: st.hotspot_active,
            hotspot_ssid: st.hotspot_ssid.clone(),
            hotspot_password: st.hotspot_password.clone(),
            config_url: st.hotspot_active.then(|| PROVISION_URL.to_string()),
        });
    }
}

fn psk_length_ok(psk: &str) -> bool {
    (8..=63).contains(&psk.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::script::ScriptedRunner;
    use crate::shell::CmdOutput;
    use crate::wifi::probe::StaticProbe;
    use std::io::Write;

    const HOTSPOT_SSID: &str = "NCBEdge_ABCD12";

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        manager: Arc<WifiManager>,
        settings: Arc<SettingsStore>,
        _file: tempfile::NamedTempFile,
    }

    async fn fixture(probe_answer: bool) -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"SenderReceiverSet": {"DID": "EDGE-00AB-CD12", "UID": "owner-7",
                "NCBUrl": "http://ncb.example.net", "NCBIP": "192.168.1.9",
                "AllowHotspot": true}}"#,
        )
        .unwrap();
        let settings = Arc::new(SettingsStore::load(file.path()).unwrap());

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nmcli radio wifi", CmdOutput::ok("enabled\n"));
        runner.on(
            "device wifi list",
            CmdOutput::ok("HomeNet:82:WPA2:2437 MHz\nCafeWifi:54:WPA2:5180 MHz\n"),
        );

        let scan = Arc::new(ScanCache::new(runner.clone()));
        scan.refresh().await.unwrap();

        let manager = Arc::new(WifiManager::new(
            runner.clone(),
            Arc::new(StaticProbe::new(probe_answer)),
            scan,
            settings.clone(),
        ));
        Fixture {
            runner,
            manager,
            settings,
            _file: file,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_installs_profile_and_persists_target() {
        let fx = fixture(true).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok("HomeNet:wlan0:activated\n"),
        );
        fx.runner.on("iwgetid -r", CmdOutput::ok("HomeNet\n"));

        let mut reconnect = fx.manager.subscribe_reconnect();
        let msg = fx
            .manager
            .connect_to_wifi("HomeNet", Some("pw12345678"), "192.168.1.50")
            .await
            .unwrap();

        assert!(msg.contains("HomeNet"));
        assert!(fx.runner.ran("connection add type wifi"));
        assert!(fx.runner.ran("autoconnect yes"));
        assert!(fx.runner.ran("wifi-sec.psk 'pw12345678'"));
        assert_eq!(fx.settings.ncb_ip(), "192.168.1.50");
        assert!(reconnect.has_changed().unwrap());
        assert!(!fx.manager.status().hotspot_active);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ssid_fails_without_touching_the_interface() {
        let fx = fixture(true).await;

        let err = fx
            .manager
            .connect_to_wifi("Ghost", None, "192.168.1.50")
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("Ghost"));
        assert!(msg.contains("HomeNet"), "nearby SSIDs surface: {msg}");
        assert!(!fx.runner.ran("connection add"));
        assert!(!fx.runner.ran("connection delete"));
        assert!(!fx.manager.status().hotspot_active);
        assert_eq!(fx.settings.ncb_ip(), "192.168.1.9");
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_rolls_back_to_hotspot() {
        let fx = fixture(false).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok(format!("HomeNet:wlan0:activated\n{HOTSPOT_SSID}:wlan0:activated\n")),
        );
        fx.runner.on("iwgetid -r", CmdOutput::ok("HomeNet\n"));

        let err = fx
            .manager
            .connect_to_wifi("HomeNet", Some("pw12345678"), "192.168.1.50")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unreachable(_)));
        // the profile was created, then the hotspot came back
        assert!(fx.runner.ran("autoconnect yes"));
        assert!(fx.runner.ran("802-11-wireless.mode ap"));
        assert!(fx.manager.status().hotspot_active);
        assert_eq!(fx.settings.ncb_ip(), "192.168.1.9");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_ncbip_fails_before_any_host_call() {
        let fx = fixture(true).await;
        let err = fx
            .manager
            .connect_to_wifi("HomeNet", None, "999.4.5.6")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(fx.runner.history().iter().all(|l| !l.starts_with("nmcli connection")));
    }

    #[tokio::test(start_paused = true)]
    async fn start_hotspot_is_idempotent() {
        let fx = fixture(true).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok(format!("{HOTSPOT_SSID}:wlan0:activated\n")),
        );

        fx.manager.start_hotspot(None, None).await.unwrap();
        let adds = fx.runner.count("802-11-wireless.mode ap");
        let rules = fx.runner.count(" -A ");
        assert_eq!(adds, 1);
        assert_eq!(rules, 5);

        let msg = fx.manager.start_hotspot(None, None).await.unwrap();
        assert!(msg.contains("already active"));
        assert_eq!(fx.runner.count("802-11-wireless.mode ap"), adds);
        assert_eq!(fx.runner.count(" -A "), rules);

        let status = fx.manager.status();
        assert!(status.hotspot_active);
        assert_eq!(status.hotspot_ssid.as_deref(), Some(HOTSPOT_SSID));
        assert_eq!(status.hotspot_password.as_deref(), Some(DEFAULT_HOTSPOT_PSK));
        assert_eq!(status.config_url.as_deref(), Some(PROVISION_URL));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_hotspot_removes_rules_then_profile() {
        let fx = fixture(true).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok(format!("{HOTSPOT_SSID}:wlan0:activated\n")),
        );

        fx.manager.start_hotspot(None, None).await.unwrap();
        fx.manager.stop_hotspot().await.unwrap();

        assert!(!fx.manager.status().hotspot_active);
        // flush happened again on the way down
        assert!(fx.runner.count("iptables -t nat -F") >= 2);

        let history = fx.runner.history();
        let flush_down = history
            .iter()
            .rposition(|l| l == "iptables -t nat -F")
            .unwrap();
        let profile_down = history
            .iter()
            .rposition(|l| l.contains("connection down"))
            .unwrap();
        assert!(flush_down < profile_down, "rules removed before AP deactivation");

        // idempotent no-op afterwards
        let msg = fx.manager.stop_hotspot().await.unwrap();
        assert!(msg.contains("not active"));
    }

    #[tokio::test(start_paused = true)]
    async fn weak_psk_falls_back_to_default() {
        let fx = fixture(true).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok(format!("{HOTSPOT_SSID}:wlan0:activated\n")),
        );

        fx.manager
            .start_hotspot(None, Some("short".into()))
            .await
            .unwrap();
        assert!(fx.runner.ran(&format!("wifi-sec.psk '{DEFAULT_HOTSPOT_PSK}'")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_validation_restores_a_previously_active_hotspot() {
        let fx = fixture(true).await;
        fx.runner.on(
            "connection show --active",
            CmdOutput::ok(format!("{HOTSPOT_SSID}:wlan0:activated\n")),
        );

        fx.manager.start_hotspot(None, None).await.unwrap();
        let err = fx
            .manager
            .connect_to_wifi("Ghost", None, "192.168.1.50")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(fx.manager.status().hotspot_active);
        assert_eq!(fx.runner.count("802-11-wireless.mode ap"), 2);
    }
}
