//! Captive-portal redirection rules.
//!
//! One lifecycle bound to hotspot-active: iptables accept/redirect
//! rules towards the local provisioning port, plus a best-effort
//! dnsmasq answering every DNS name with the gateway address. Teardown
//! flushes both tables and kills the dnsmasq we started, honouring its
//! pidfile.

use std::sync::Arc;

use crate::shell::CommandRunner;
use crate::{Error, Result};

pub const GATEWAY_IP: &str = "10.42.0.1";
pub const PORTAL_PORT: u16 = 5000;
pub const PROVISION_URL: &str = "http://10.42.0.1:5000/provision";

pub const DNSMASQ_CONF: &str = "/tmp/dnsmasq-captive.conf";
pub const DNSMASQ_PID: &str = "/tmp/dnsmasq-captive.pid";

pub struct CaptivePortal {
    runner: Arc<dyn CommandRunner>,
}

impl CaptivePortal {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn rule(&self, line: &str) -> Result<()> {
        let out = self.runner.run(line).await?;
        if !out.success {
            return Err(Error::host_tool(&out));
        }
        Ok(())
    }

    /// Install the redirect rules, then try to raise dnsmasq. dnsmasq
    /// failing to start is tolerated; DHCP clients fall back to probing
    /// the gateway IP directly.
    pub async fn install(&self) -> Result<()> {
        self.rule("iptables -t nat -F").await?;
        self.rule("iptables -F").await?;

        self.rule(&format!(
            "iptables -A INPUT -p tcp --dport {PORTAL_PORT} -j ACCEPT"
        ))
        .await?;
        self.rule(&format!(
            "iptables -t nat -A PREROUTING -p tcp --dport 80 -j REDIRECT --to-port {PORTAL_PORT}"
        ))
        .await?;
        self.rule(&format!(
            "iptables -t nat -A PREROUTING -p tcp --dport 443 -j REDIRECT --to-port {PORTAL_PORT}"
        ))
        .await?;
        self.rule("iptables -A INPUT -p udp --dport 53 -j ACCEPT").await?;
        self.rule("iptables -A INPUT -p tcp --dport 53 -j ACCEPT").await?;

        if let Err(e) = self.start_dnsmasq().await {
            tracing::warn!(error = %e, "dnsmasq did not start; DNS hijack inactive");
        }
        tracing::info!("captive portal rules installed");
        Ok(())
    }

    async fn start_dnsmasq(&self) -> Result<()> {
        let conf = format!(
            "interface=lo,{iface}\nbind-dynamic\naddress=/#/{gw}\nno-resolv\nno-hosts\n",
            iface = crate::wifi::IFACE_NAME,
            gw = GATEWAY_IP,
        );
        tokio::fs::write(DNSMASQ_CONF, conf).await?;
        let out = self
            .runner
            .run(&format!(
                "dnsmasq --conf-file={DNSMASQ_CONF} --pid-file={DNSMASQ_PID}"
            ))
            .await?;
        if !out.success {
            return Err(Error::host_tool(&out));
        }
        Ok(())
    }

    /// Flush everything we might have installed and stop dnsmasq.
    /// Idempotent: missing pidfile and already-empty tables are fine.
    pub async fn teardown(&self) -> Result<()> {
        self.rule("iptables -t nat -F").await?;
        self.rule("iptables -F").await?;

        if let Ok(pid) = tokio::fs::read_to_string(DNSMASQ_PID).await {
            let pid = pid.trim().to_string();
            if !pid.is_empty() {
                let _ = self.runner.run(&format!("kill {pid}")).await;
            }
            let _ = tokio::fs::remove_file(DNSMASQ_PID).await;
        }
        let _ = tokio::fs::remove_file(DNSMASQ_CONF).await;
        tracing::info!("captive portal rules removed");
        Ok(())
    }
}
