//! RFCOMM provisioning server.
//!
//! One client at a time: provisioning is rare and serial. The accept
//! loop owns the listening socket for the whole process lifetime; a
//! failing client session never takes the loop down with it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bluetooth::adapter::AdapterControl;
use crate::bluetooth::protocol::{
    self, Request, Response, WifiCredential, MSG_PROVISION_WIFI, MSG_READ_DEVICE_ID,
};
use crate::bluetooth::socket::{RfcommListener, RfcommStream};
use crate::crypto::DeviceKeys;
use crate::settings::SettingsStore;
use crate::wifi::WifiManager;
use crate::{Error, Result};

pub const RFCOMM_CHANNEL: u8 = 1;

/// 100 ms receive window between non-blocking polls.
const POLL_WINDOW: Duration = Duration::from_millis(100);
/// Polls without data before a terminator-less buffer is flushed.
const IDLE_FLUSH_POLLS: u32 = 3;
/// Single retry delay when the transport buffer is full.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct RfcommServer {
    wifi: Arc<WifiManager>,
    keys: Arc<DeviceKeys>,
    adapter: Arc<AdapterControl>,
    settings: Arc<SettingsStore>,
}

impl RfcommServer {
    pub fn new(
        wifi: Arc<WifiManager>,
        keys: Arc<DeviceKeys>,
        adapter: Arc<AdapterControl>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            wifi,
            keys,
            adapter,
            settings,
        }
    }

    /// Bring the adapter up, bind channel 1 and serve until cancelled.
    /// Returns an error only when the adapter is beyond recovery; the
    /// rest of the system keeps running without Bluetooth.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.adapter.bring_up().await?;
        self.adapter.spawn_ble_advertiser();

        let listener = Arc::new(self.bind_with_recovery().await?);
        tracing::info!(channel = RFCOMM_CHANNEL, "rfcomm server listening");

        // a cancelled token must unblock a pending accept
        let unblock = {
            let listener = listener.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                listener.shutdown();
            })
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match listener.accept().await {
                Ok(stream) => {
                    tracing::info!(peer = %stream.peer, "rfcomm client connected");
                    if let Err(e) = self.serve_client(&stream, &cancel).await {
                        tracing::warn!(peer = %stream.peer, error = %e, "client session ended");
                    } else {
                        tracing::info!(peer = %stream.peer, "rfcomm client disconnected");
                    }
                    // stream drops here; the listener stays
                }
                Err(e) if cancel.is_cancelled() => {
                    tracing::debug!(error = %e, "accept unblocked by shutdown");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        unblock.abort();
        tracing::info!("rfcomm server stopped");
        Ok(())
    }

    /// Bind channel 1; on "address in use" run the forced adapter
    /// cleanup once and retry.
    async fn bind_with_recovery(&self) -> Result<RfcommListener> {
        match RfcommListener::bind(RFCOMM_CHANNEL) {
            Ok(l) => Ok(l),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                self.adapter.forced_cleanup().await?;
                RfcommListener::bind(RFCOMM_CHANNEL).map_err(Error::Io)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Per-client loop: accumulate bytes in 100 ms windows, cut frames
    /// at line terminators (or a short idle for terminator-less peers),
    /// answer each frame.
    async fn serve_client(
        &self,
        stream: &RfcommStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let connected_at = std::time::Instant::now();
        let mut last_activity = connected_at;
        let mut acc: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        let mut idle_polls: u32 = 0;
        let mut last_sent: Option<String> = None;

        let done = |last: std::time::Instant| {
            tracing::debug!(
                session_secs = connected_at.elapsed().as_secs(),
                idle_secs = last.elapsed().as_secs(),
                "session closed"
            );
        };

        loop {
            if cancel.is_cancelled() {
                done(last_activity);
                return Ok(());
            }

            match stream.try_recv(&mut buf) {
                Ok(Some(n)) => {
                    acc.extend_from_slice(&buf[..n]);
                    idle_polls = 0;
                    last_activity = std::time::Instant::now();
                }
                Ok(None) => idle_polls += 1,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    done(last_activity);
                    return Ok(());
                }
                Err(e) => {
                    done(last_activity);
                    return Err(Error::Io(e));
                }
            }

            while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
                let frame: Vec<u8> = acc.drain(..=pos).collect();
                self.handle_frame(stream, &frame, &mut last_sent).await;
            }
            if !acc.is_empty() && idle_polls >= IDLE_FLUSH_POLLS {
                let frame = std::mem::take(&mut acc);
                self.handle_frame(stream, &frame, &mut last_sent).await;
            }

            tokio::time::sleep(POLL_WINDOW).await;
        }
    }

    async fn handle_frame(
        &self,
        stream: &RfcommStream,
        raw: &[u8],
        last_sent: &mut Option<String>,
    ) {
        let payload = protocol::decode_payload(raw);
        if payload.is_empty() {
            return;
        }
        // certain peer stacks echo our own frames back; drop them
        if last_sent.as_deref() == Some(payload.as_str()) {
            tracing::debug!("dropped echoed frame");
            return;
        }

        let reply = self.dispatch(&payload).await;
        match self.send_line(stream, &reply).await {
            Ok(()) => *last_sent = Some(reply),
            Err(e) => tracing::warn!(error = %e, "reply not delivered"),
        }
    }

    async fn send_line(&self, stream: &RfcommStream, line: &str) -> io::Result<()> {
        let framed = format!("{line}\n");
        match stream.send_all(framed.as_bytes()) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(SEND_RETRY_DELAY).await;
                stream.send_all(framed.as_bytes())
            }
            other => other,
        }
    }

    /// Route one decoded payload to the JSON protocol or the debug
    /// dialect. Always yields a reply line; never panics the session.
    pub async fn dispatch(&self, payload: &str) -> String {
        if protocol::looks_like_json(payload) {
            let response = match serde_json::from_str::<Request>(payload) {
                Ok(req) => self.handle_request(&req).await,
                Err(e) => {
                    tracing::debug!(error = %e, "unparseable envelope");
                    Response::malformed("malformed request envelope")
                }
            };
            serde_json::to_string(&response)
                .unwrap_or_else(|_| r#"{"Success":false,"Message":"internal error"}"#.into())
        } else {
            self.debug_dialect(payload).await
        }
    }

    async fn handle_request(&self, req: &Request) -> Response {
        tracing::debug!(
            msg_id = %req.msg_id,
            msg_type = req.msg_type,
            sent_at = %req.time,
            "rfcomm request"
        );
        match req.msg_type {
            MSG_READ_DEVICE_ID => {
                let did = self.keys.did().to_string();
                match self.keys.sign(&did) {
                    Ok(sign) => Response::success(req, did, Some(sign)),
                    Err(e) => Response::failure(req, e.to_string()),
                }
            }
            MSG_PROVISION_WIFI => self.handle_provision(req).await,
            other => {
                tracing::debug!(msg_type = other, "unsupported message type");
                Response::failure(req, "type not supported")
            }
        }
    }

    /// Decrypt, validate and hand the credential to the Wi-Fi manager.
    /// Every failure before the manager call leaves wireless state
    /// untouched.
    async fn handle_provision(&self, req: &Request) -> Response {
        let plain = match self.keys.decrypt(&req.data) {
            Ok(p) => p,
            Err(e) => return Response::failure(req, e.to_string()),
        };
        let cred: WifiCredential = match serde_json::from_str(&plain) {
            Ok(c) => c,
            Err(_) => return Response::failure(req, "credential payload is not valid JSON"),
        };

        tracing::info!(ssid = %cred.ssid, "bluetooth provisioning request");
        match self
            .wifi
            .connect_to_wifi(&cred.ssid, cred.password.as_deref(), &cred.ncbip)
            .await
        {
            Ok(_) => {
                let sign = self.keys.sign("SUCCESS").ok();
                Response::success(req, "SUCCESS", sign)
            }
            Err(e) => Response::failure(req, e.to_string()),
        }
    }

    async fn debug_dialect(&self, payload: &str) -> String {
        match payload.trim().to_ascii_uppercase().as_str() {
            "PING" => "PONG".into(),
            "TIME" => protocol::now(),
            "STATUS" => {
                let adapter = self.adapter.summary().await;
                let status = self.wifi.status();
                let hotspot = if status.hotspot_active {
                    format!("hotspot {} up", status.hotspot_ssid.unwrap_or_default())
                } else {
                    "hotspot down".into()
                };
                format!("{adapter}; {hotspot}; target {}", self.settings.ncb_ip())
            }
            "INFO" => {
                let identity = self.settings.identity();
                format!(
                    "DID={} alias={} uuid={}",
                    identity.did,
                    identity.alias(),
                    identity.service_uuid()
                )
            }
            "HELP" => "commands: PING STATUS TIME INFO HELP".into(),
            _ => format!("Echo: {payload}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::shell::script::ScriptedRunner;
    use crate::shell::CmdOutput;
    use crate::wifi::probe::StaticProbe;
    use crate::wifi::ScanCache;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;
    use std::io::Write;

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        server: Arc<RfcommServer>,
        public_pem: String,
        _file: tempfile::NamedTempFile,
    }

    async fn fixture(probe_answer: bool) -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"SenderReceiverSet": {"DID": "EDGE-00AB-CD12", "UID": "owner-7",
                "NCBUrl": "http://ncb.example.net", "NCBIP": "192.168.1.9"}}"#,
        )
        .unwrap();
        let settings = Arc::new(SettingsStore::load(file.path()).unwrap());

        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        let keys = Arc::new(DeviceKeys::from_pem("EDGE-00AB-CD12", &pem).unwrap());
        let public_pem = keys.public_key_pem().unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("nmcli radio wifi", CmdOutput::ok("enabled\n"));
        runner.on(
            "device wifi list",
            CmdOutput::ok("HomeNet:82:WPA2:2437 MHz\nCafeWifi:54:WPA2:5180 MHz\n"),
        );
        runner.on(
            "connection show --active",
            CmdOutput::ok("HomeNet:wlan0:activated\nNCBEdge_ABCD12:wlan0:activated\n"),
        );
        runner.on("iwgetid -r", CmdOutput::ok("HomeNet\n"));

        let scan = Arc::new(ScanCache::new(runner.clone()));
        scan.refresh().await.unwrap();

        let wifi = Arc::new(WifiManager::new(
            runner.clone(),
            Arc::new(StaticProbe::new(probe_answer)),
            scan,
            settings.clone(),
        ));
        let adapter = Arc::new(AdapterControl::new(
            runner.clone(),
            DeviceIdentity::new("EDGE-00AB-CD12", "owner-7"),
        ));
        let server = Arc::new(RfcommServer::new(wifi, keys, adapter, settings));
        Fixture {
            runner,
            server,
            public_pem,
            _file: file,
        }
    }

    fn provision_request(fx: &Fixture, ssid: &str, ncbip: &str) -> String {
        let cred = serde_json::json!({
            "SSID": ssid,
            "Password": "pw12345678",
            "NCBIP": ncbip,
        });
        let cipher = DeviceKeys::encrypt(&cred.to_string(), &fx.public_pem).unwrap();
        serde_json::json!({
            "MsgId": "m1",
            "Time": "2025-01-01T00:00:00",
            "Type": MSG_PROVISION_WIFI,
            "Data": cipher,
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn provision_round_trip_signs_success() {
        let fx = fixture(true).await;
        let reply = fx
            .server
            .dispatch(&provision_request(&fx, "HomeNet", "192.168.1.50"))
            .await;

        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["MsgId"], "m1");
        assert_eq!(v["Type"], MSG_PROVISION_WIFI);
        assert_eq!(v["Success"], true);
        assert_eq!(v["Data"], "SUCCESS");
        let sign = v["Sign"].as_str().unwrap();
        assert!(DeviceKeys::verify("SUCCESS", sign, &fx.public_pem).unwrap());
        assert!(fx.runner.ran("connection add type wifi"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_ciphertext_mutates_nothing() {
        let fx = fixture(true).await;
        let req = serde_json::json!({
            "MsgId": "m9",
            "Time": "2025-01-01T00:00:00",
            "Type": MSG_PROVISION_WIFI,
            "Data": "definitely-not-ciphertext",
        })
        .to_string();

        let reply = fx.server.dispatch(&req).await;
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["Success"], false);
        assert!(!fx.runner.ran("nmcli connection"));
        assert!(!fx.runner.ran("iptables"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ssid_reports_failure_with_nearby_networks() {
        let fx = fixture(true).await;
        let reply = fx
            .server
            .dispatch(&provision_request(&fx, "Ghost", "192.168.1.50"))
            .await;
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["Success"], false);
        let message = v["Message"].as_str().unwrap();
        assert!(message.contains("Ghost"));
        assert!(message.contains("HomeNet"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_device_id_is_signed() {
        let fx = fixture(true).await;
        let reply = fx
            .server
            .dispatch(r#"{"MsgId":"m2","Time":"t","Type":10000,"Data":""}"#)
            .await;
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["Success"], true);
        assert_eq!(v["Data"], "EDGE-00AB-CD12");
        let sign = v["Sign"].as_str().unwrap();
        assert!(DeviceKeys::verify("EDGE-00AB-CD12", sign, &fx.public_pem).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_type_is_rejected_politely() {
        let fx = fixture(true).await;
        let reply = fx
            .server
            .dispatch(r#"{"MsgId":"m3","Time":"t","Type":777,"Data":""}"#)
            .await;
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["Success"], false);
        assert_eq!(v["Message"], "type not supported");
    }

    #[tokio::test(start_paused = true)]
    async fn debug_dialect_answers() {
        let fx = fixture(true).await;
        assert_eq!(fx.server.dispatch("PING").await, "PONG");
        assert!(fx.server.dispatch("HELP").await.contains("PING"));
        assert_eq!(fx.server.dispatch("marco").await, "Echo: marco");

        let info = fx.server.dispatch("INFO").await;
        assert!(info.contains("EDGE-00AB-CD12"));
        assert!(info.contains("NCBEdge_ABCD12"));
    }
}
