//! Test harness for user-mode stack integration tests
//!
//! Plays the virtio side of the NIC: frames are pushed through
//! `guest_transmit` with a zeroed vendor header and collected again with
//! `guest_receive_timeout`.

#![allow(dead_code)]

pub mod packets;

use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::time::{Duration, Instant};

use mvirt_usernet::config::{DEFAULT_GUEST_MAC, DEFAULT_HOST_IP, DEFAULT_HOST_MAC};
use mvirt_usernet::{IsnPolicy, NetStack, StackConfig};

pub const GUEST_MAC: [u8; 6] = DEFAULT_GUEST_MAC;
pub const HOST_MAC: [u8; 6] = DEFAULT_HOST_MAC;
pub const HOST_IP: Ipv4Addr = DEFAULT_HOST_IP;
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 33, 15);

/// ISN used by tests that check sequence numbers
pub const TEST_ISN: u32 = 10_000_000;

/// Default wait for a guest-bound frame
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Config with a fixed ISN and a short poll interval so teardown is quick
pub fn test_config() -> StackConfig {
    StackConfig::default()
        .with_isn(IsnPolicy::Fixed(TEST_ISN))
        .with_poll_interval(Duration::from_millis(20))
        .with_connect_timeout(Duration::from_secs(2))
}

/// Guest end of a `NetStack`
pub struct TestGuest {
    stack: NetStack,
    vnet_hdr_len: usize,
}

impl TestGuest {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: StackConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let vnet_hdr_len = config.vnet_hdr_len;
        let stack = NetStack::new(config).expect("Failed to start network stack");
        Self {
            stack,
            vnet_hdr_len,
        }
    }

    pub fn stack(&self) -> &NetStack {
        &self.stack
    }

    /// Transmit one Ethernet frame as the guest would, vendor header in its own slice
    pub fn send(&self, frame: &[u8]) -> mvirt_usernet::Result<()> {
        let hdr = vec![0u8; self.vnet_hdr_len];
        self.stack
            .guest_transmit(&[IoSlice::new(&hdr), IoSlice::new(frame)])
    }

    /// Wait for the next guest-bound frame, vendor header stripped
    pub fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; self.vnet_hdr_len + 65536];
        let n = self
            .stack
            .guest_receive_timeout(&mut [IoSliceMut::new(&mut buf)], timeout)
            .expect("guest receive failed")?;
        assert!(
            buf[..self.vnet_hdr_len].iter().all(|&b| b == 0),
            "vendor header must be zeroed"
        );
        Some(buf[self.vnet_hdr_len..n].to_vec())
    }

    /// Wait for a frame the parser accepts, discarding anything else
    pub fn recv_map<T>(&self, timeout: Duration, parse: impl Fn(&[u8]) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            let frame = self.recv(left)?;
            if let Some(parsed) = parse(&frame) {
                return Some(parsed);
            }
        }
    }

    /// Check that nothing reaches the guest within `wait`
    pub fn assert_silent(&self, wait: Duration) {
        if let Some(frame) = self.recv(wait) {
            panic!("unexpected frame for guest: {:02x?}", frame);
        }
    }

    /// Poll until `cond` holds or the timeout passes
    pub fn wait_for(&self, timeout: Duration, cond: impl Fn(&NetStack) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond(&self.stack) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond(&self.stack)
    }
}

/// UDP socket on loopback, as a host-side server
pub fn udp_server() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind UDP server");
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .expect("set read timeout");
    let port = socket.local_addr().expect("local addr").port();
    (socket, port)
}

/// TCP listener on loopback, as a host-side server
pub fn tcp_server() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind TCP server");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

/// Guest-visible address of a loopback service reached through the host IP
pub fn host_service(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(HOST_IP, port)
}

pub fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(a) => panic!("expected IPv4 address, got {a}"),
    }
}
