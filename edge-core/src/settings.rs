//! Persistent configuration: `appsettings.json` next to the binary.
//!
//! The file is owned by the wider application; this module only ever
//! rewrites `SenderReceiverSet.NCBIP` and must leave every other key
//! untouched, so writes go through a read-modify-write on the raw JSON
//! tree rather than a typed round-trip.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use tokio::sync::watch;

use crate::identity::DeviceIdentity;
use crate::{Error, Result};

pub const SETTINGS_FILE: &str = "appsettings.json";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderReceiverSet {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "UID", default)]
    pub uid: String,
    #[serde(rename = "NCBUrl", default)]
    pub ncb_url: String,
    #[serde(rename = "NCBIP", default)]
    pub ncb_ip: String,
    #[serde(rename = "AllowHotspot", default = "default_true")]
    pub allow_hotspot: bool,
    #[serde(rename = "HotspotPassword", default)]
    pub hotspot_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(rename = "SenderReceiverSet")]
    pub sender_receiver: SenderReceiverSet,
}

/// Shared settings store: the parsed snapshot plus a watch channel that
/// publishes the current NCBIP to in-process observers.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<AppSettings>,
    ncb_ip_tx: watch::Sender<String>,
}

impl SettingsStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Unavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let parsed: AppSettings = serde_json::from_str(&raw)?;
        if parsed.sender_receiver.did.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "settings file carries no device id".into(),
            ));
        }
        let (ncb_ip_tx, _) = watch::channel(parsed.sender_receiver.ncb_ip.clone());
        Ok(Self {
            path,
            current: RwLock::new(parsed),
            ncb_ip_tx,
        })
    }

    pub fn snapshot(&self) -> AppSettings {
        self.current.read().unwrap().clone()
    }

    pub fn identity(&self) -> DeviceIdentity {
        let s = self.current.read().unwrap();
        DeviceIdentity::new(&s.sender_receiver.did, &s.sender_receiver.uid)
    }

    pub fn ncb_ip(&self) -> String {
        self.current.read().unwrap().sender_receiver.ncb_ip.clone()
    }

    pub fn allow_hotspot(&self) -> bool {
        self.current.read().unwrap().sender_receiver.allow_hotspot
    }

    pub fn hotspot_password(&self) -> Option<String> {
        self.current
            .read()
            .unwrap()
            .sender_receiver
            .hotspot_password
            .clone()
    }

    /// Observers see the value that is already on disk; see
    /// [`set_ncb_ip`](Self::set_ncb_ip).
    pub fn subscribe_ncb_ip(&self) -> watch::Receiver<String> {
        self.ncb_ip_tx.subscribe()
    }

    /// Persist a new upstream IP. The file is written first, then the
    /// in-memory snapshot, then the watch channel, so anything woken by
    /// the channel reads the new value. Unrelated keys in the file are
    /// preserved verbatim.
    pub fn set_ncb_ip(&self, ip: &str) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path)?;
        let mut tree: serde_json::Value = serde_json::from_str(&raw)?;
        let set = tree
            .get_mut("SenderReceiverSet")
            .ok_or_else(|| Error::Protocol("settings file lost SenderReceiverSet".into()))?;
        set["NCBIP"] = serde_json::Value::String(ip.to_string());
        std::fs::write(&self.path, serde_json::to_string_pretty(&tree)?)?;

        self.current.write().unwrap().sender_receiver.ncb_ip = ip.to_string();
        let _ = self.ncb_ip_tx.send(ip.to_string());
        tracing::info!(ncb_ip = ip, "persisted upstream target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const SAMPLE: &str = r#"{
        "Logging": { "Level": "Information" },
        "SenderReceiverSet": {
            "DID": "EDGE-00AB-CD12",
            "UID": "owner-7",
            "NCBUrl": "http://ncb.example.net:8080",
            "NCBIP": "192.168.1.9",
            "AllowHotspot": true
        },
        "Unrelated": { "Keep": ["me", 2] }
    }"#;

    #[test]
    fn loads_typed_snapshot() {
        let f = settings_file(SAMPLE);
        let store = SettingsStore::load(f.path()).unwrap();
        let s = store.snapshot();
        assert_eq!(s.sender_receiver.did, "EDGE-00AB-CD12");
        assert_eq!(store.ncb_ip(), "192.168.1.9");
        assert!(store.allow_hotspot());
    }

    #[test]
    fn ncbip_rewrite_preserves_unrelated_keys() {
        let f = settings_file(SAMPLE);
        let store = SettingsStore::load(f.path()).unwrap();
        store.set_ncb_ip("192.168.1.50").unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(f.path()).unwrap()).unwrap();
        assert_eq!(written["SenderReceiverSet"]["NCBIP"], "192.168.1.50");
        assert_eq!(written["SenderReceiverSet"]["UID"], "owner-7");
        assert_eq!(written["Logging"]["Level"], "Information");
        assert_eq!(written["Unrelated"]["Keep"][1], 2);
        assert_eq!(store.ncb_ip(), "192.168.1.50");
    }

    #[test]
    fn watch_publishes_after_persist() {
        let f = settings_file(SAMPLE);
        let store = SettingsStore::load(f.path()).unwrap();
        let rx = store.subscribe_ncb_ip();
        store.set_ncb_ip("10.0.0.2").unwrap();
        assert_eq!(*rx.borrow(), "10.0.0.2");
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let f = settings_file(r#"{"SenderReceiverSet": {"DID": ""}}"#);
        assert!(SettingsStore::load(f.path()).is_err());
    }
}
