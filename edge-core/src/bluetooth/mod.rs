//! Bluetooth provisioning side-channel: adapter control, raw RFCOMM
//! sockets and the JSON request/response server.

pub mod adapter;
pub mod protocol;
pub mod server;
pub mod socket;

pub use adapter::AdapterControl;
pub use server::{RfcommServer, RFCOMM_CHANNEL};
