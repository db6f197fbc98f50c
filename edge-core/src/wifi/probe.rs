//! ICMP reachability probe.
//!
//! Uses a library ICMP socket (surge-ping), not the ping CLI. Up to
//! `attempts` echoes, each with its own timeout, stopping at the first
//! reply.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn reachable(&self, addr: Ipv4Addr) -> bool;
}

pub struct IcmpProbe {
    pub attempts: u32,
    pub timeout: Duration,
    pub delay: Duration,
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self {
            attempts: 10,
            timeout: Duration::from_secs(2),
            delay: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for IcmpProbe {
    async fn reachable(&self, addr: Ipv4Addr) -> bool {
        let payload = [0u8; 16];
        for attempt in 1..=self.attempts {
            let echo = surge_ping::ping(IpAddr::V4(addr), &payload);
            match tokio::time::timeout(self.timeout, echo).await {
                Ok(Ok((_, rtt))) => {
                    tracing::debug!(%addr, ?rtt, attempt, "icmp echo answered");
                    return true;
                }
                Ok(Err(e)) => {
                    tracing::debug!(%addr, attempt, error = %e, "icmp echo failed")
                }
                Err(_) => tracing::debug!(%addr, attempt, "icmp echo timed out"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        tracing::warn!(%addr, attempts = self.attempts, "target unreachable");
        false
    }
}

/// Strict IPv4 parse; anything else means the caller fails fast.
pub fn parse_target(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse().ok()
}

/// Fixed-answer probe for tests.
pub struct StaticProbe {
    pub answer: bool,
    pub calls: std::sync::atomic::AtomicU32,
}

impl StaticProbe {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn reachable(&self, _addr: Ipv4Addr) -> bool {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.answer
    }
}
