//! Network stack configuration.
//!
//! The surrounding device layer owns address assignment and CLI parsing and
//! hands the stack a `StackConfig`, either built in code or deserialized.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{NetError, Result};
use crate::relay::isn::IsnPolicy;
use crate::wire::MAX_TCP_PAYLOAD;

/// Default guest MAC address (locally administered)
pub const DEFAULT_GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Default MAC address the stack answers with
pub const DEFAULT_HOST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Default host (gateway) address as seen by the guest
pub const DEFAULT_HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 33, 1);

/// Size of the virtio_net_hdr structure (12 bytes for v1)
pub const DEFAULT_VNET_HDR_LEN: usize = 12;

const DEFAULT_POOL_CAPACITY: usize = 64;
const DEFAULT_TCP_WINDOW: u16 = 14600;
const DEFAULT_TCP_MSS: usize = 1460;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const MAX_VNET_HDR_LEN: usize = 64;

/// Configuration for a [`NetStack`](crate::stack::NetStack).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// MAC address of the guest NIC
    #[serde(deserialize_with = "deserialize_mac")]
    pub guest_mac: [u8; 6],
    /// MAC address the stack presents to the guest
    #[serde(deserialize_with = "deserialize_mac")]
    pub host_mac: [u8; 6],
    /// IPv4 address the stack answers ARP for
    pub host_ip: Ipv4Addr,
    /// Number of frame buffers in the pool
    pub pool_capacity: usize,
    /// Length of the vendor transport header ahead of each frame
    pub vnet_hdr_len: usize,
    /// Receive window advertised to the guest
    pub tcp_window: u16,
    /// Largest TCP payload sent to the guest in one segment
    pub tcp_mss: usize,
    /// Initial sequence number policy for relayed TCP connections
    pub isn: IsnPolicy,
    /// How often blocked relay threads check for shutdown, in milliseconds
    pub poll_interval_ms: u64,
    /// Timeout for outbound host TCP connects, in milliseconds
    pub connect_timeout_ms: u64,
    /// Drop a relayed connection whose SYN-ACK the guest never acknowledges
    pub handshake_timeout_ms: u64,
    /// Close UDP flows idle for this long; `None` keeps them until teardown
    pub udp_idle_timeout_ms: Option<u64>,
    /// Drop guest packets with bad IP/ICMP/UDP/TCP checksums
    pub verify_checksums: bool,
    /// Relay traffic addressed to `host_ip` to 127.0.0.1 instead
    pub host_loopback: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            guest_mac: DEFAULT_GUEST_MAC,
            host_mac: DEFAULT_HOST_MAC,
            host_ip: DEFAULT_HOST_IP,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            vnet_hdr_len: DEFAULT_VNET_HDR_LEN,
            tcp_window: DEFAULT_TCP_WINDOW,
            tcp_mss: DEFAULT_TCP_MSS,
            isn: IsnPolicy::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            udp_idle_timeout_ms: None,
            verify_checksums: true,
            host_loopback: true,
        }
    }
}

impl StackConfig {
    pub fn new(guest_mac: [u8; 6], host_mac: [u8; 6], host_ip: Ipv4Addr) -> Self {
        Self {
            guest_mac,
            host_mac,
            host_ip,
            ..Default::default()
        }
    }

    pub fn with_host_ip(mut self, host_ip: Ipv4Addr) -> Self {
        self.host_ip = host_ip;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_vnet_hdr_len(mut self, len: usize) -> Self {
        self.vnet_hdr_len = len;
        self
    }

    pub fn with_tcp_mss(mut self, mss: usize) -> Self {
        self.tcp_mss = mss;
        self
    }

    pub fn with_tcp_window(mut self, window: u16) -> Self {
        self.tcp_window = window;
        self
    }

    pub fn with_isn(mut self, isn: IsnPolicy) -> Self {
        self.isn = isn;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_host_loopback(mut self, enabled: bool) -> Self {
        self.host_loopback = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        self.udp_idle_timeout_ms.map(Duration::from_millis)
    }

    /// Check settings the stack cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(NetError::InvalidConfig(
                "pool_capacity must be at least 1".to_string(),
            ));
        }
        if self.tcp_mss == 0 || self.tcp_mss > MAX_TCP_PAYLOAD {
            return Err(NetError::InvalidConfig(format!(
                "tcp_mss must be between 1 and {MAX_TCP_PAYLOAD}, got {}",
                self.tcp_mss
            )));
        }
        if self.vnet_hdr_len > MAX_VNET_HDR_LEN {
            return Err(NetError::InvalidConfig(format!(
                "vnet_hdr_len must be at most {MAX_VNET_HDR_LEN}, got {}",
                self.vnet_hdr_len
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(NetError::InvalidConfig(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(NetError::InvalidConfig(
                "connect and handshake timeouts must be non-zero".to_string(),
            ));
        }
        if self.guest_mac[0] & 0x01 != 0 {
            return Err(NetError::InvalidConfig(
                "guest_mac must be a unicast address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse MAC address from string
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(NetError::InvalidMac(s.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(NetError::InvalidMac(s.to_string()));
        }
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| NetError::InvalidMac(s.to_string()))?;
    }
    Ok(mac)
}

fn deserialize_mac<'de, D>(deserializer: D) -> std::result::Result<[u8; 6], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_mac(&s).map_err(serde::de::Error::custom)
}
