//! Upstream-info poller.
//!
//! While the RPC link to the NCB is down, periodically ask the server
//! (over plain HTTP) which Wi-Fi and IP it expects this device on, and
//! re-bind when reality diverges. Also the sole writer of the
//! consecutive-miss counter the hotspot coordinator reads: one
//! increment per failed cycle with the link down, reset on success or
//! an established link.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::crypto::DeviceKeys;
use crate::settings::SettingsStore;
use crate::shell::CommandRunner;
use crate::supervisor::UpstreamLink;
use crate::wifi::WifiManager;
use crate::{Error, Result};

pub const POLL_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
struct NetInfoRequest {
    #[serde(rename = "DID")]
    did: String,
    #[serde(rename = "UID")]
    uid: String,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Sign")]
    sign: String,
}

#[derive(Debug, Deserialize)]
struct NetInfoEnvelope {
    #[serde(rename = "Success", default)]
    success: bool,
    #[serde(rename = "Data", default)]
    data: String,
}

/// Decrypted payload of a `GetNCBNetInfo` answer.
#[derive(Debug, Clone, Deserialize)]
pub struct NetInfo {
    #[serde(rename = "wifiName")]
    pub wifi_name: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
}

/// What a poll cycle decided to do, separated out so the comparison
/// logic is testable without HTTP.
#[derive(Debug, PartialEq, Eq)]
pub enum NetAction {
    /// Host SSID differs from the authoritative one: full re-bind.
    Connect,
    /// Same network, new upstream IP: persist without touching Wi-Fi.
    UpdateIp,
    Nothing,
}

pub fn decide(current_ssid: &str, stored_ip: &str, info: &NetInfo) -> NetAction {
    if current_ssid != info.wifi_name {
        NetAction::Connect
    } else if stored_ip != info.ip_address {
        NetAction::UpdateIp
    } else {
        NetAction::Nothing
    }
}

pub struct UpstreamPoller {
    wifi: Arc<WifiManager>,
    keys: Arc<DeviceKeys>,
    settings: Arc<SettingsStore>,
    runner: Arc<dyn CommandRunner>,
    link: Arc<dyn UpstreamLink>,
    misses: Arc<AtomicU32>,
    http: reqwest::Client,
    interval: Duration,
}

impl UpstreamPoller {
    pub fn new(
        wifi: Arc<WifiManager>,
        keys: Arc<DeviceKeys>,
        settings: Arc<SettingsStore>,
        runner: Arc<dyn CommandRunner>,
        link: Arc<dyn UpstreamLink>,
        misses: Arc<AtomicU32>,
    ) -> Self {
        Self {
            wifi,
            keys,
            settings,
            runner,
            link,
            misses,
            http: reqwest::Client::new(),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if self.link.is_established() {
                // an established link is the authoritative channel; no
                // polling, no misses
                self.misses.store(0, Ordering::Release);
            } else {
                match self.poll_once().await {
                    Ok(()) => {
                        self.misses.store(0, Ordering::Release);
                    }
                    Err(e) => {
                        let misses = self.misses.fetch_add(1, Ordering::AcqRel) + 1;
                        tracing::warn!(error = %e, misses, "upstream poll failed");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("upstream poller stopped");
    }

    /// One poll cycle: fetch, decrypt, compare, act.
    async fn poll_once(&self) -> Result<()> {
        let info = self.fetch_net_info().await?;
        let current = self.current_ssid().await?;
        let stored = self.settings.ncb_ip();

        match decide(&current, &stored, &info) {
            NetAction::Connect => {
                tracing::info!(
                    expected = %info.wifi_name,
                    actual = %current,
                    "host is on the wrong network, re-binding"
                );
                // no password: the stored profile supplies credentials
                self.wifi
                    .connect_to_wifi(&info.wifi_name, None, &info.ip_address)
                    .await?;
            }
            NetAction::UpdateIp => {
                tracing::info!(new_ip = %info.ip_address, "upstream moved, updating target");
                self.settings.set_ncb_ip(&info.ip_address)?;
            }
            NetAction::Nothing => {}
        }
        Ok(())
    }

    async fn fetch_net_info(&self) -> Result<NetInfo> {
        let s = self.settings.snapshot().sender_receiver;
        if s.ncb_url.trim().is_empty() {
            return Err(Error::Unavailable("no upstream URL configured".into()));
        }
        let time = crate::bluetooth::protocol::now();
        let body = NetInfoRequest {
            sign: self.keys.sign(&format!("{}{}", s.did, time))?,
            did: s.did,
            uid: s.uid,
            time,
        };
        let url = format!("{}/GetNCBNetInfo", s.ncb_url.trim_end_matches('/'));

        let envelope: NetInfoEnvelope = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        if !envelope.success || envelope.data.is_empty() {
            return Err(Error::Protocol("upstream returned no network info".into()));
        }
        let plain = self.keys.decrypt(&envelope.data)?;
        let info: NetInfo = serde_json::from_str(&plain)
            .map_err(|_| Error::Protocol("network info payload is not valid JSON".into()))?;
        if info.wifi_name.trim().is_empty() {
            return Err(Error::Protocol("network info carries no SSID".into()));
        }
        Ok(info)
    }

    async fn current_ssid(&self) -> Result<String> {
        let out = self.runner.run("iwgetid -r").await?;
        Ok(out.stdout.trim().to_string())
    }
}
