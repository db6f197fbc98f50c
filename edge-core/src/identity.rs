//! Device identity and the identifiers derived from it.
//!
//! The persistent device id seeds both the hotspot SSID and the
//! Bluetooth service UUID so two units in the same room never collide.

/// Base of the RFCOMM service UUID; the last eight hex digits are
/// derived from the device id.
pub const SERVICE_UUID_BASE: &str = "12345678-1234-5678-1234-56789abc";

/// Prefix of the provisioning hotspot SSID and the adapter alias.
pub const SSID_PREFIX: &str = "NCBEdge_";

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub did: String,
    pub uid: String,
}

impl DeviceIdentity {
    pub fn new(did: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            uid: uid.into(),
        }
    }

    /// `NCBEdge_` + last six alphanumeric characters of the device id,
    /// uppercased. Shorter ids use everything they have.
    pub fn hotspot_ssid(&self) -> String {
        let alnum: String = self
            .did
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let tail_start = alnum.len().saturating_sub(6);
        format!("{}{}", SSID_PREFIX, &alnum[tail_start..])
    }

    /// Bluetooth adapter alias shown to pairing peers.
    pub fn alias(&self) -> String {
        self.hotspot_ssid()
    }

    /// Service UUID advertised over SDP: the fixed base plus eight
    /// lowercase hex digits of a stable hash of the device id.
    pub fn service_uuid(&self) -> String {
        format!("{}{:08x}", SERVICE_UUID_BASE, fnv1a32(&self.did))
    }
}

/// FNV-1a, 32-bit. Stable across builds and platforms, which is the
/// whole point: the UUID must not change between firmware updates.
fn fnv1a32(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
