//! Wi-Fi subsystem: scan cache, reachability probe, captive-portal
//! rules and the mutex-guarded state manager.

pub mod manager;
pub mod portal;
pub mod probe;
pub mod scan;

pub use manager::{WifiManager, WifiStatus};
pub use scan::{NetworkInfo, ScanCache};

/// Wireless interface mediated by the manager.
pub const IFACE_NAME: &str = "wlan0";
