//! Process-wide network stack state and the device-facing entry points.
//!
//! A [`NetStack`] is created once when the NIC is attached. The virtio
//! layer calls [`NetStack::guest_transmit`] for every frame the guest sends
//! and [`NetStack::guest_receive`] (or a non-blocking variant) to collect
//! frames for the guest's receive queue. Both work on scatter/gather
//! vectors that include the vendor transport header.

use std::borrow::Cow;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::StackConfig;
use crate::dataplane::{Dispatcher, GuestTx, Layer2};
use crate::error::{NetError, Result};
use crate::pool::{BufferPool, PoolBuffer, PoolCounts};
use crate::relay::{FlowKey, TcpRelay, TcpState, UdpRelay};
use crate::wire::ethernet::format_mac;

/// The user-mode network stack of one guest NIC.
pub struct NetStack {
    config: StackConfig,
    pool: Arc<BufferPool>,
    dispatcher: Dispatcher,
    udp: Arc<UdpRelay>,
    tcp: Arc<TcpRelay>,
    shutdown: Arc<AtomicBool>,
    udp_thread: Mutex<Option<JoinHandle<()>>>,
}

impl NetStack {
    /// Allocate the buffer pool and registries and start the UDP multiplexer.
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;

        let pool = BufferPool::new(config.pool_capacity, config.vnet_hdr_len)?;
        let tx = Arc::new(GuestTx::new(
            Arc::clone(&pool),
            Layer2 {
                guest_mac: config.guest_mac,
                host_mac: config.host_mac,
            },
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let udp = Arc::new(UdpRelay::new(&config, Arc::clone(&tx))?);
        let tcp = Arc::new(TcpRelay::new(
            &config,
            Arc::clone(&tx),
            Arc::clone(&shutdown),
        ));
        let dispatcher = Dispatcher::new(&config, tx, Arc::clone(&udp), Arc::clone(&tcp));

        let udp_thread = {
            let udp = Arc::clone(&udp);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("usernet-udp".to_string())
                .spawn(move || udp.run(&shutdown))?
        };

        info!(
            guest_mac = %format_mac(&config.guest_mac),
            host_mac = %format_mac(&config.host_mac),
            host_ip = %config.host_ip,
            pool_capacity = config.pool_capacity,
            isn = ?config.isn,
            "User-mode network stack started"
        );

        Ok(Self {
            config,
            pool,
            dispatcher,
            udp,
            tcp,
            shutdown,
            udp_thread: Mutex::new(Some(udp_thread)),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Process one guest-transmitted frame, vendor header included.
    ///
    /// Frames that are malformed or not handled are dropped and the reason
    /// is returned; the stack itself keeps running.
    pub fn guest_transmit(&self, iov: &[IoSlice<'_>]) -> Result<()> {
        if self.is_shut_down() {
            return Err(NetError::ShuttingDown);
        }

        let frame = gather(iov, self.config.vnet_hdr_len)?;
        self.dispatcher.dispatch(&frame).inspect_err(|e| {
            debug!(error = %e, len = frame.len(), "Dropped guest frame");
        })
    }

    /// Block until a frame is ready for the guest and copy it into `iov`.
    ///
    /// Returns the number of bytes written (vendor header + frame).
    pub fn guest_receive(&self, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let buf = self.pool.acquire_used()?;
        deliver(buf, iov)
    }

    /// Copy a pending frame into `iov` if there is one.
    pub fn try_guest_receive(&self, iov: &mut [IoSliceMut<'_>]) -> Result<Option<usize>> {
        match self.pool.try_acquire_used()? {
            Some(buf) => deliver(buf, iov).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`guest_receive`](Self::guest_receive) but gives up after `timeout`.
    pub fn guest_receive_timeout(
        &self,
        iov: &mut [IoSliceMut<'_>],
        timeout: Duration,
    ) -> Result<Option<usize>> {
        match self.pool.acquire_used_timeout(timeout)? {
            Some(buf) => deliver(buf, iov).map(Some),
            None => Ok(None),
        }
    }

    /// Stop all relay threads and close every host socket.
    ///
    /// Blocked receive and relay calls return [`NetError::ShuttingDown`].
    /// Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down user-mode network stack");

        self.pool.close();
        self.tcp.shutdown();

        let handle = self
            .udp_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("UDP multiplexer thread panicked");
            }
        }
        self.udp.close_all();

        debug!("User-mode network stack stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.counts()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp.flow_count()
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn tcp_connection_state(&self, key: &FlowKey) -> Option<TcpState> {
        self.tcp.connection_state(key)
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Strip `skip` leading bytes and return the rest as one contiguous frame.
///
/// Borrows when the frame lies within a single slice.
fn gather<'a>(iov: &'a [IoSlice<'_>], skip: usize) -> Result<Cow<'a, [u8]>> {
    let total: usize = iov.iter().map(|s| s.len()).sum();
    if total < skip {
        return Err(NetError::Truncated {
            needed: skip,
            actual: total,
        });
    }

    let mut skip = skip;
    let mut parts: Vec<&'a [u8]> = Vec::with_capacity(iov.len());
    for slice in iov {
        let bytes: &'a [u8] = slice;
        if skip >= bytes.len() {
            skip -= bytes.len();
            continue;
        }
        parts.push(&bytes[skip..]);
        skip = 0;
    }

    Ok(match parts.as_slice() {
        [] => Cow::Borrowed(&[]),
        [single] => Cow::Borrowed(*single),
        many => Cow::Owned(many.concat()),
    })
}

/// Copy a USED buffer into a guest vector. The buffer returns to FREE.
fn deliver(buf: PoolBuffer, iov: &mut [IoSliceMut<'_>]) -> Result<usize> {
    let packet = buf.packet();
    let available: usize = iov.iter().map(|s| s.len()).sum();
    if available < packet.len() {
        warn!(
            needed = packet.len(),
            available, "Guest receive buffer too small, frame dropped"
        );
        return Err(NetError::RxBufferTooSmall {
            needed: packet.len(),
            available,
        });
    }

    let mut copied = 0;
    for dst in iov.iter_mut() {
        if copied == packet.len() {
            break;
        }
        let n = dst.len().min(packet.len() - copied);
        dst[..n].copy_from_slice(&packet[copied..copied + n]);
        copied += n;
    }
    Ok(copied)
}
