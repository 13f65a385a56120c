//! UDP relay: one connected host socket per guest 4-tuple.
//!
//! Guest datagrams are sent on the flow's socket from the dispatcher. A
//! single multiplexer thread waits on every flow socket through epoll and
//! turns each host datagram into a guest-bound frame, reading it straight
//! into the payload area of a pool buffer.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, error, info, trace, warn};

use super::{FlowKey, host_target};
use crate::config::StackConfig;
use crate::dataplane::GuestTx;
use crate::dataplane::tx::UDP_PAYLOAD_OFFSET;
use crate::error::{NetError, Result};
use crate::wire::MAX_UDP_PAYLOAD;

const MAX_EVENTS: usize = 64;

struct UdpFlow {
    key: FlowKey,
    socket: UdpSocket,
    token: u64,
    /// Milliseconds since the relay epoch of the last datagram either way
    last_active: AtomicU64,
}

#[derive(Default)]
struct UdpFlows {
    flows: HashMap<FlowKey, Arc<UdpFlow>>,
    tokens: HashMap<u64, FlowKey>,
}

/// Registry of guest UDP flows and their host sockets.
pub struct UdpRelay {
    flows: Mutex<UdpFlows>,
    epoll: Epoll,
    tx: Arc<GuestTx>,
    next_token: AtomicU64,
    epoch: Instant,
    host_ip: Ipv4Addr,
    host_loopback: bool,
    poll_interval: Duration,
    idle_timeout: Option<Duration>,
}

impl UdpRelay {
    pub fn new(config: &StackConfig, tx: Arc<GuestTx>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            flows: Mutex::new(UdpFlows::default()),
            epoll,
            tx,
            next_token: AtomicU64::new(1),
            epoch: Instant::now(),
            host_ip: config.host_ip,
            host_loopback: config.host_loopback,
            poll_interval: config.poll_interval(),
            idle_timeout: config.udp_idle_timeout(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UdpFlows> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Forward one guest datagram, opening a host socket for a new flow.
    pub fn send(&self, key: FlowKey, payload: &[u8]) -> Result<()> {
        let flow = self.flow_for(key)?;
        flow.last_active.store(self.now_ms(), Ordering::Relaxed);

        match flow.socket.send(payload) {
            Ok(sent) => {
                trace!(flow = %key, len = sent, "UDP guest -> host");
                Ok(())
            }
            Err(e) => {
                warn!(flow = %key, error = %e, "UDP send to host failed");
                Err(e.into())
            }
        }
    }

    fn flow_for(&self, key: FlowKey) -> Result<Arc<UdpFlow>> {
        let mut flows = self.lock();
        if let Some(flow) = flows.flows.get(&key) {
            return Ok(Arc::clone(flow));
        }

        let target = host_target(key.remote(), self.host_ip, self.host_loopback);
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(target)?;
        socket.set_nonblocking(true)?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.epoll
            .add(&socket, EpollEvent::new(EpollFlags::EPOLLIN, token))?;

        info!(
            flow = %key,
            target = %target,
            local = ?socket.local_addr().ok(),
            "UDP flow opened"
        );

        let flow = Arc::new(UdpFlow {
            key,
            socket,
            token,
            last_active: AtomicU64::new(self.now_ms()),
        });
        flows.flows.insert(key, Arc::clone(&flow));
        flows.tokens.insert(token, key);
        Ok(flow)
    }

    pub fn flow_count(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn has_flow(&self, key: &FlowKey) -> bool {
        self.lock().flows.contains_key(key)
    }

    /// Multiplexer loop; returns once `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) {
        let timeout = EpollTimeout::from(
            u16::try_from(self.poll_interval.as_millis()).unwrap_or(u16::MAX),
        );
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        debug!("UDP multiplexer started");
        while !shutdown.load(Ordering::Acquire) {
            let ready = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "UDP multiplexer epoll_wait failed");
                    break;
                }
            };

            for event in &events[..ready] {
                if let Err(e) = self.drain(event.data()) {
                    if matches!(e, NetError::ShuttingDown) {
                        debug!("UDP multiplexer stopping");
                        return;
                    }
                    debug!(error = %e, "UDP receive dropped");
                }
            }

            self.evict_idle();
        }
        debug!("UDP multiplexer stopped");
    }

    /// Move every pending datagram of one flow to the guest.
    fn drain(&self, token: u64) -> Result<()> {
        let flow = {
            let flows = self.lock();
            let Some(key) = flows.tokens.get(&token) else {
                return Ok(());
            };
            match flows.flows.get(key) {
                Some(flow) => Arc::clone(flow),
                None => return Ok(()),
            }
        };

        loop {
            let mut buf = self.tx.acquire()?;
            let area =
                &mut buf.frame_mut()[UDP_PAYLOAD_OFFSET..UDP_PAYLOAD_OFFSET + MAX_UDP_PAYLOAD];
            let len = match flow.socket.recv(area) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            flow.last_active.store(self.now_ms(), Ordering::Relaxed);
            trace!(flow = %flow.key, len, "UDP host -> guest");
            self.tx
                .publish_udp(buf, flow.key.remote(), flow.key.guest(), len);
        }
    }

    fn evict_idle(&self) {
        let Some(idle) = self.idle_timeout else {
            return;
        };
        let now = self.now_ms();
        let limit = idle.as_millis() as u64;

        let mut flows = self.lock();
        let expired: Vec<FlowKey> = flows
            .flows
            .values()
            .filter(|f| now.saturating_sub(f.last_active.load(Ordering::Relaxed)) >= limit)
            .map(|f| f.key)
            .collect();

        for key in expired {
            if let Some(flow) = flows.flows.remove(&key) {
                flows.tokens.remove(&flow.token);
                if let Err(e) = self.epoll.delete(&flow.socket) {
                    warn!(flow = %key, error = %e, "Failed to deregister UDP socket");
                }
                info!(flow = %key, "UDP flow evicted after idle timeout");
            }
        }
    }

    /// Drop every flow and close its host socket.
    pub fn close_all(&self) {
        let mut flows = self.lock();
        for (key, flow) in flows.flows.drain() {
            if let Err(e) = self.epoll.delete(&flow.socket) {
                debug!(flow = %key, error = %e, "Failed to deregister UDP socket");
            }
            debug!(flow = %key, "UDP flow closed");
        }
        flows.tokens.clear();
    }
}
