//! Background-refreshed cache of nearby Wi-Fi networks.
//!
//! A periodic task replaces the whole snapshot atomically; readers
//! clone an `Arc` and never see a half-written map. With the radio off
//! the snapshot is simply empty.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::shell::CommandRunner;
use crate::wifi::IFACE_NAME;
use crate::{Error, Result};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub ssid: String,
    /// Signal in dBm (negative; closer to zero is stronger).
    pub signal: i16,
    pub security: String,
    /// Channel frequency in MHz, 0 when the host did not report one.
    pub frequency: u32,
}

pub struct ScanCache {
    runner: Arc<dyn CommandRunner>,
    snapshot: RwLock<Arc<Vec<NetworkInfo>>>,
}

impl ScanCache {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// One refresh cycle: rescan, list, replace the snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let radio = self.runner.run("nmcli radio wifi").await?;
        if !radio.success || !radio.stdout.trim().starts_with("enabled") {
            self.publish(Vec::new());
            return Ok(());
        }

        // rescan may be rate-limited by the host; a refusal is fine, the
        // list below still returns the latest results it has.
        let _ = self
            .runner
            .run(&format!(
                "nmcli device wifi rescan ifname {IFACE_NAME}"
            ))
            .await;

        let list = self
            .runner
            .run(&format!(
                "nmcli -t -f SSID,SIGNAL,SECURITY,FREQ device wifi list ifname {IFACE_NAME}"
            ))
            .await?;
        if !list.success {
            return Err(Error::host_tool(&list));
        }

        self.publish(parse_wifi_list(&list.stdout));
        Ok(())
    }

    fn publish(&self, networks: Vec<NetworkInfo>) {
        *self.snapshot.write().unwrap() = Arc::new(networks);
    }

    pub fn all(&self) -> Arc<Vec<NetworkInfo>> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn is_available(&self, ssid: &str) -> bool {
        self.all().iter().any(|n| n.ssid == ssid)
    }

    pub fn info(&self, ssid: &str) -> Option<NetworkInfo> {
        self.all().iter().find(|n| n.ssid == ssid).cloned()
    }

    /// Strongest `n` SSIDs, for "did you mean" error messages.
    pub fn top_ssids(&self, n: usize) -> Vec<String> {
        self.all()
            .iter()
            .take(n)
            .map(|net| net.ssid.clone())
            .collect()
    }

    /// Long-lived refresher task. A failed cycle keeps the previous
    /// snapshot and logs; the next tick tries again.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "wifi scan refresh failed, keeping last snapshot");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("scan refresher stopped");
        })
    }
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY,FREQ device wifi list`.
/// SIGNAL is a 0..100 percentage; it is mapped back onto the dBm range
/// the percentage was derived from. Empty and placeholder SSIDs are
/// skipped, duplicates keep their strongest entry, and the result is
/// sorted strongest-first.
fn parse_wifi_list(output: &str) -> Vec<NetworkInfo> {
    let mut networks: Vec<NetworkInfo> = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        let ssid = parts.first().map(|s| s.to_string()).unwrap_or_default();
        if ssid.is_empty() || ssid == "\\x00" || ssid == "--" {
            continue;
        }
        let percent: i16 = parts
            .get(1)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let signal = percent.clamp(0, 100) / 2 - 100;
        let security = parts
            .get(2)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Open".to_string());
        let frequency = parts
            .get(3)
            .map(|s| {
                s.trim()
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
            })
            .and_then(|d| d.parse().ok())
            .unwrap_or(0);

        match networks.iter_mut().find(|n| n.ssid == ssid) {
            Some(existing) if existing.signal < signal => existing.signal = signal,
            Some(_) => {}
            None => networks.push(NetworkInfo {
                ssid,
                signal,
                security,
                frequency,
            }),
        }
    }
    networks.sort_by(|a, b| b.signal.cmp(&a.signal));
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::script::ScriptedRunner;
    use crate::shell::CmdOutput;

    const LIST: &str = "HomeNet:82:WPA2:2437 MHz\nCafeWifi:54:WPA1 WPA2:5180 MHz\n:90:WPA2:2412 MHz\nHomeNet:40:WPA2:5745 MHz\n\\x00:77:WPA2:2462 MHz\n";

    #[test]
    fn parses_terse_nmcli_output() {
        let nets = parse_wifi_list(LIST);
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].ssid, "HomeNet");
        assert_eq!(nets[0].signal, -59); // 82% -> dBm
        assert_eq!(nets[0].frequency, 2437);
        assert_eq!(nets[1].ssid, "CafeWifi");
        assert_eq!(nets[1].security, "WPA1 WPA2");
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nmcli radio wifi", CmdOutput::ok("enabled\n"));
        runner.on("device wifi list", CmdOutput::ok(LIST));

        let cache = ScanCache::new(runner);
        cache.refresh().await.unwrap();
        assert!(cache.is_available("HomeNet"));
        assert!(!cache.is_available("Ghost"));
        assert_eq!(cache.info("CafeWifi").unwrap().frequency, 5180);
        assert_eq!(cache.top_ssids(1), vec!["HomeNet".to_string()]);
    }

    #[tokio::test]
    async fn disabled_radio_yields_empty_snapshot() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nmcli radio wifi", CmdOutput::ok("disabled\n"));
        runner.on("device wifi list", CmdOutput::ok(LIST));

        let cache = ScanCache::new(runner);
        cache.refresh().await.unwrap();
        assert!(cache.all().is_empty());
        assert!(!cache.is_available("HomeNet"));
    }
}
