//! Bluetooth adapter control via the host CLIs.
//!
//! bluetoothctl and hciconfig do the heavy lifting; everything here
//! goes through the shell facade so the whole module is scriptable in
//! tests. Covers bring-up, the discoverability watchdog, SDP/BLE
//! advertisement (both best-effort) and pairing hygiene.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::identity::DeviceIdentity;
use crate::shell::CommandRunner;
use crate::{Error, Result};

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
pub const PAIRING_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const ADVERTISE_BUDGET: Duration = Duration::from_secs(15);

pub struct AdapterControl {
    runner: Arc<dyn CommandRunner>,
    identity: DeviceIdentity,
}

impl AdapterControl {
    pub fn new(runner: Arc<dyn CommandRunner>, identity: DeviceIdentity) -> Self {
        Self { runner, identity }
    }

    async fn ctl(&self, line: &str) -> Result<String> {
        let out = self.runner.run(line).await?;
        if !out.success {
            return Err(Error::host_tool(&out));
        }
        Ok(out.stdout)
    }

    /// One-time bring-up: power, discoverability, alias, and a clean
    /// pairing slate. The adapter being permanently absent surfaces
    /// here and takes only the RFCOMM task down with it.
    pub async fn bring_up(&self) -> Result<()> {
        self.ctl("hciconfig hci0 up").await?;
        self.ctl("bluetoothctl power on").await?;
        // zero timeout keeps the adapter discoverable until we say
        // otherwise, not for bluez's default three minutes
        let _ = self.runner.run("bluetoothctl discoverable-timeout 0").await;
        self.ctl("bluetoothctl discoverable on").await?;
        self.ctl("bluetoothctl pairable on").await?;
        let alias = self.identity.alias();
        self.ctl(&format!("bluetoothctl system-alias {alias}")).await?;
        let _ = self.runner.run("hciconfig hci0 piscan").await;

        // trust-on-first-use: no pairing outlives a provisioning session
        self.remove_paired_devices(true).await;

        self.register_sdp_record().await;
        tracing::info!(alias, "bluetooth adapter up and discoverable");
        Ok(())
    }

    /// SDP service record on channel 1 with the derived UUID. Fails
    /// quietly; sdptool is optional on modern images.
    async fn register_sdp_record(&self) {
        let uuid = self.identity.service_uuid();
        let ticks = chrono::Utc::now().timestamp_millis();
        let path = format!("/tmp/neuchar_sdp_record_{ticks}.xml");
        let record = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<record>\n  \
             <attribute id=\"0x0001\"><sequence><uuid value=\"{uuid}\"/></sequence></attribute>\n  \
             <attribute id=\"0x0004\"><sequence><sequence><uuid value=\"0x0100\"/></sequence>\
             <sequence><uuid value=\"0x0003\"/><uint8 value=\"1\"/></sequence></sequence></attribute>\n\
             </record>\n"
        );
        if let Err(e) = tokio::fs::write(&path, record).await {
            tracing::debug!(error = %e, "sdp record file not written");
        }
        match self.runner.run("sdptool add --channel=1 SP").await {
            Ok(out) if out.success => tracing::debug!(uuid, "sdp record registered"),
            Ok(out) => tracing::debug!(stderr = %out.stderr.trim(), "sdptool declined"),
            Err(e) => tracing::debug!(error = %e, "sdptool unavailable"),
        }
    }

    /// BLE advertising so modern phones see the device without a scan.
    /// Best-effort, bounded, and never in the bring-up path.
    pub fn spawn_ble_advertiser(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let attempt = async {
                let _ = this.runner.run("btmgmt power on").await;
                let _ = this.runner.run("btmgmt connectable on").await;
                let _ = this.runner.run("btmgmt advertising on").await;
            };
            if tokio::time::timeout(ADVERTISE_BUDGET, attempt).await.is_err() {
                tracing::debug!("ble advertising setup exceeded its budget");
            }
        })
    }

    /// External tools occasionally flip the adapter un-discoverable;
    /// re-assert the whole trio whenever that happens.
    pub fn spawn_discoverability_watchdog(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                }
                match this.is_discoverable().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("adapter lost discoverability, re-asserting");
                        let _ = this.runner.run("bluetoothctl power on").await;
                        let _ = this.runner.run("bluetoothctl discoverable on").await;
                        let _ = this.runner.run("bluetoothctl pairable on").await;
                    }
                    Err(e) => tracing::warn!(error = %e, "discoverability check failed"),
                }
            }
            tracing::debug!("discoverability watchdog stopped");
        })
    }

    pub async fn is_discoverable(&self) -> Result<bool> {
        let out = self.ctl("bluetoothctl show").await?;
        Ok(out.contains("Discoverable: yes"))
    }

    /// Periodic sweep removing pairings whose peer is gone, including
    /// their cached state under /var/lib/bluetooth.
    pub fn spawn_pairing_cleaner(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PAIRING_SWEEP_INTERVAL) => {}
                }
                this.remove_paired_devices(false).await;
            }
            tracing::debug!("pairing cleaner stopped");
        })
    }

    /// Remove known devices; with `include_connected` even live peers
    /// go (bring-up wipes everything).
    pub async fn remove_paired_devices(&self, include_connected: bool) {
        let devices = match self.ctl("bluetoothctl devices").await {
            Ok(out) => parse_device_list(&out),
            Err(e) => {
                tracing::debug!(error = %e, "device enumeration failed");
                return;
            }
        };
        if devices.is_empty() {
            return;
        }
        let adapter = self.adapter_address().await;
        for mac in devices {
            if !include_connected && self.is_connected(&mac).await {
                continue;
            }
            tracing::info!(peer = %mac, "removing stale pairing");
            let _ = self.runner.run(&format!("bluetoothctl remove {mac}")).await;
            if let Some(adapter) = &adapter {
                let _ = self
                    .runner
                    .run(&format!("rm -rf /var/lib/bluetooth/{adapter}/{mac}"))
                    .await;
            }
        }
    }

    async fn is_connected(&self, mac: &str) -> bool {
        match self.runner.run(&format!("bluetoothctl info {mac}")).await {
            Ok(out) => out.stdout.contains("Connected: yes"),
            Err(_) => false,
        }
    }

    async fn adapter_address(&self) -> Option<String> {
        let out = self.runner.run("hciconfig hci0").await.ok()?;
        parse_bd_address(&out.stdout)
    }

    /// Kick used when the RFCOMM channel is wedged: release the
    /// channel, bounce bluetoothd, then re-run bring-up.
    pub async fn forced_cleanup(&self) -> Result<()> {
        tracing::warn!("rfcomm channel busy, forcing bluetooth cleanup");
        let _ = self.runner.run("rfcomm release all").await;
        let _ = self.runner.run("systemctl restart bluetooth").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.bring_up().await
    }

    /// Short adapter summary for the debug dialect.
    pub async fn summary(&self) -> String {
        match self.ctl("bluetoothctl show").await {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| {
                    l.starts_with("Powered:")
                        || l.starts_with("Discoverable:")
                        || l.starts_with("Pairable:")
                        || l.starts_with("Alias:")
                })
                .collect::<Vec<_>>()
                .join(", "),
            Err(_) => "adapter unavailable".to_string(),
        }
    }
}

/// `bluetoothctl devices` lines: `Device XX:XX:XX:XX:XX:XX Some Name`.
fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("Device"), Some(mac)) if mac.len() == 17 => Some(mac.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// `hciconfig hci0` output carries `BD Address: XX:XX:XX:XX:XX:XX`.
fn parse_bd_address(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("BD Address: ")
            .and_then(|rest| rest.split_whitespace().next())
            .map(|s| s.to_string())
    })
}
