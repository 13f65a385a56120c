//! TCP relay: a guest-visible TCP endpoint on top of a host `TcpStream`.
//!
//! A guest SYN opens an outbound host connection and answers with a
//! synthesized SYN-ACK. Each connection then gets two threads: a reader
//! that turns host data into guest segments, and a writer that drains a
//! bounded queue of in-order guest payload into the host socket. The
//! dispatcher only ever queues, so a host peer that stops reading stalls
//! its own connection and nothing else. Guest data that does not fit in the
//! queue is not acknowledged and the guest retransmits it later.
//!
//! Sequence numbers (server side = the stack, guest side = the VM):
//! - `seq_server`: next sequence number the stack sends
//! - `ack_server`: next sequence number expected from the guest
//! - `guest_acked`: highest acknowledgment received from the guest
//!
//! Each connection's sequence state sits behind its own mutex. Threads that
//! send a segment claim the pool buffer first and only then take that lock,
//! so no thread ever waits on the pool while holding it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, info, trace, warn};

use super::isn::IsnGenerator;
use super::{FlowKey, host_target};
use crate::config::StackConfig;
use crate::dataplane::{GuestTx, TcpSegment};
use crate::error::{NetError, Result};
use crate::wire::{TcpFlags, TcpPacket};

/// Host read size; reads are split into MSS-sized segments
const READ_CHUNK: usize = 64 * 1024;

/// Guest segments waiting for the host writer before new data is refused
pub const HOST_WRITE_QUEUE: usize = 64;

/// Guest-visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN-ACK sent, waiting for the guest's ACK
    SynReceived,
    Established,
    /// Guest sent FIN; host-to-guest data still flows
    GuestClosed,
    /// Host reached EOF and a FIN went to the guest
    HostClosed,
    Closed,
}

/// `a < b` in sequence space
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Socket timeouts that only mean "check the shutdown flag and retry"
fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Work for a connection's host writer
#[derive(Debug)]
enum HostWrite {
    Data(Vec<u8>),
    /// Guest FIN: half-close the host socket once queued data is written
    Fin,
}

#[derive(Debug)]
struct SeqState {
    seq_server: u32,
    ack_server: u32,
    guest_acked: u32,
    guest_window: u16,
    read_done: bool,
    write_done: bool,
    /// The writer has delivered the guest FIN to the host
    host_flushed: bool,
    torn_down: bool,
    state: TcpState,
}

/// One relayed connection.
pub struct TcpConnection {
    key: FlowKey,
    stream: TcpStream,
    isn_server: u32,
    isn_guest: u32,
    seq: Mutex<SeqState>,
    /// Signalled when the guest acknowledges data or the state changes
    cond: Condvar,
    host_tx: Sender<HostWrite>,
}

impl TcpConnection {
    fn new(
        key: FlowKey,
        stream: TcpStream,
        isn_server: u32,
        isn_guest: u32,
        window: u16,
    ) -> (Self, Receiver<HostWrite>) {
        let (host_tx, host_rx) = bounded(HOST_WRITE_QUEUE);
        let conn = Self {
            key,
            stream,
            isn_server,
            isn_guest,
            seq: Mutex::new(SeqState {
                seq_server: isn_server.wrapping_add(1),
                ack_server: isn_guest.wrapping_add(1),
                guest_acked: isn_server,
                guest_window: window,
                read_done: false,
                write_done: false,
                host_flushed: false,
                torn_down: false,
                state: TcpState::SynReceived,
            }),
            cond: Condvar::new(),
            host_tx,
        };
        (conn, host_rx)
    }

    fn lock(&self) -> MutexGuard<'_, SeqState> {
        self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.lock().state
    }

    fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// Queue work for the host writer without blocking.
    fn queue_host_write(&self, work: HostWrite) -> bool {
        self.host_tx.try_send(work).is_ok()
    }

    /// Record that the guest FIN reached the host; returns whether the
    /// read side is finished too.
    fn mark_flushed(&self) -> bool {
        let mut st = self.lock();
        st.host_flushed = true;
        st.read_done
    }

    /// Apply the acknowledgment and window of a guest segment.
    fn on_ack(&self, ack: u32, window: u16) {
        let mut st = self.lock();
        if seq_lt(st.guest_acked, ack) && seq_le(ack, st.seq_server) {
            st.guest_acked = ack;
        }
        st.guest_window = window;
        if st.state == TcpState::SynReceived && ack == self.isn_server.wrapping_add(1) {
            st.state = TcpState::Established;
            debug!(flow = %self.key, "TCP connection established");
        }
        drop(st);
        self.cond.notify_all();
    }
}

/// Registry of relayed TCP connections.
pub struct TcpRelay {
    conns: Mutex<HashMap<FlowKey, Arc<TcpConnection>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    tx: Arc<GuestTx>,
    isn: IsnGenerator,
    stopping: Arc<AtomicBool>,
    host_ip: Ipv4Addr,
    host_loopback: bool,
    mss: usize,
    window: u16,
    poll_interval: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpRelay {
    pub fn new(config: &StackConfig, tx: Arc<GuestTx>, stopping: Arc<AtomicBool>) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            tx,
            isn: IsnGenerator::new(config.isn),
            stopping,
            host_ip: config.host_ip,
            host_loopback: config.host_loopback,
            mss: config.tcp_mss,
            window: config.tcp_window,
            poll_interval: config.poll_interval(),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FlowKey, Arc<TcpConnection>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &FlowKey) -> Option<Arc<TcpConnection>> {
        self.lock().get(key).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn connection_state(&self, key: &FlowKey) -> Option<TcpState> {
        self.lookup(key).map(|c| c.state())
    }

    fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn segment(&self, conn: &TcpConnection, seq: u32, ack: u32, flags: TcpFlags) -> TcpSegment {
        TcpSegment {
            from: conn.key.remote(),
            to: conn.key.guest(),
            seq,
            ack,
            flags,
            window: self.window,
        }
    }

    /// Handle one guest TCP segment.
    pub fn handle_segment(self: &Arc<Self>, tcp: &TcpPacket<&[u8]>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(NetError::ShuttingDown);
        }

        let ip = tcp.ip();
        let key = FlowKey::new(
            SocketAddrV4::new(ip.src_addr(), tcp.src_port()),
            SocketAddrV4::new(ip.dst_addr(), tcp.dst_port()),
        );
        let flags = tcp.flags();

        trace!(
            flow = %key,
            seq = tcp.seq(),
            ack = tcp.ack(),
            flags = flags.bits(),
            len = tcp.payload_len(),
            "Guest TCP segment"
        );

        match self.lookup(&key) {
            Some(conn) => self.on_segment(&conn, tcp),
            None if flags.contains(TcpFlags::SYN)
                && !flags.contains(TcpFlags::ACK)
                && !flags.contains(TcpFlags::RST) =>
            {
                self.open(key, tcp.seq(), tcp.window())
            }
            None if tcp.payload_len() > 0 => Err(NetError::NoRelay),
            None => {
                trace!(flow = %key, "Segment for unknown connection ignored");
                Ok(())
            }
        }
    }

    fn open(self: &Arc<Self>, key: FlowKey, isn_guest: u32, window: u16) -> Result<()> {
        let target = host_target(key.remote(), self.host_ip, self.host_loopback);
        let stream = match TcpStream::connect_timeout(&SocketAddr::V4(target), self.connect_timeout)
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(flow = %key, target = %target, error = %e, "Host TCP connect failed");
                return Err(e.into());
            }
        };
        stream.set_read_timeout(Some(self.poll_interval))?;
        stream.set_write_timeout(Some(self.poll_interval))?;
        stream.set_nodelay(true)?;

        let isn_server = self.isn.next_isn();
        let (conn, host_queue) = TcpConnection::new(key, stream, isn_server, isn_guest, window);
        let conn = Arc::new(conn);

        {
            let mut conns = self.lock();
            if let Some(existing) = conns.get(&key).cloned() {
                // A concurrent SYN won; answer for that connection instead
                drop(conns);
                return self.send_syn_ack(&existing);
            }
            conns.insert(key, Arc::clone(&conn));
        }

        info!(flow = %key, target = %target, isn = isn_server, "TCP connection opened");

        if let Err(e) = self.spawn_relay(&conn, host_queue) {
            self.teardown(&conn, "relay thread spawn failed");
            return Err(e);
        }
        self.send_syn_ack(&conn)
    }

    fn spawn_relay(
        self: &Arc<Self>,
        conn: &Arc<TcpConnection>,
        host_queue: Receiver<HostWrite>,
    ) -> Result<()> {
        let port = conn.key.guest_port;
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.retain(|h| !h.is_finished());

        let (relay, reader_conn) = (Arc::clone(self), Arc::clone(conn));
        threads.push(
            thread::Builder::new()
                .name(format!("tcp-read-{port}"))
                .spawn(move || relay.run_host_reader(&reader_conn))?,
        );

        let (relay, writer_conn) = (Arc::clone(self), Arc::clone(conn));
        threads.push(
            thread::Builder::new()
                .name(format!("tcp-write-{port}"))
                .spawn(move || relay.run_host_writer(&writer_conn, host_queue))?,
        );
        Ok(())
    }

    fn send_syn_ack(&self, conn: &TcpConnection) -> Result<()> {
        let buf = self.tx.acquire()?;
        let seg = self.segment(
            conn,
            conn.isn_server,
            conn.isn_guest.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
        );
        self.tx.publish_tcp(buf, &seg, &[]);
        Ok(())
    }

    fn send_ack(&self, conn: &TcpConnection) -> Result<()> {
        let buf = self.tx.acquire()?;
        let seg = {
            let st = conn.lock();
            self.segment(conn, st.seq_server, st.ack_server, TcpFlags::ACK)
        };
        self.tx.publish_tcp(buf, &seg, &[]);
        Ok(())
    }

    fn on_segment(&self, conn: &Arc<TcpConnection>, tcp: &TcpPacket<&[u8]>) -> Result<()> {
        let flags = tcp.flags();

        if flags.contains(TcpFlags::RST) {
            self.teardown(conn, "guest reset");
            return Ok(());
        }

        if flags.contains(TcpFlags::SYN) {
            if conn.state() == TcpState::SynReceived && tcp.seq() == conn.isn_guest {
                debug!(flow = %conn.key, "Retransmitted SYN, resending SYN-ACK");
                return self.send_syn_ack(conn);
            }
            trace!(flow = %conn.key, "Unexpected SYN ignored");
            return Ok(());
        }

        if flags.contains(TcpFlags::ACK) {
            conn.on_ack(tcp.ack(), tcp.window());
        }

        let payload = tcp.payload();
        let fin = flags.contains(TcpFlags::FIN);
        if payload.is_empty() && !fin {
            return Ok(());
        }

        let fin_accepted = {
            let mut st = conn.lock();
            if st.state == TcpState::SynReceived || st.write_done || tcp.seq() != st.ack_server {
                trace!(
                    flow = %conn.key,
                    seq = tcp.seq(),
                    expected = st.ack_server,
                    "Guest data not in sequence, re-acknowledging"
                );
                false
            } else if !payload.is_empty()
                && !conn.queue_host_write(HostWrite::Data(payload.to_vec()))
            {
                debug!(
                    flow = %conn.key,
                    len = payload.len(),
                    "Host write queue full, leaving segment unacknowledged"
                );
                false
            } else {
                st.ack_server = st.ack_server.wrapping_add(payload.len() as u32);
                let fin_accepted = fin && conn.queue_host_write(HostWrite::Fin);
                if fin_accepted {
                    st.ack_server = st.ack_server.wrapping_add(1);
                    st.write_done = true;
                    st.state = if st.read_done {
                        TcpState::Closed
                    } else {
                        TcpState::GuestClosed
                    };
                }
                fin_accepted
            }
        };

        if fin_accepted {
            debug!(flow = %conn.key, "Guest closed its side");
        }
        self.send_ack(conn)
    }

    /// Reader thread body: host socket to guest.
    fn run_host_reader(&self, conn: &Arc<TcpConnection>) {
        if !self.wait_established(conn) {
            trace!(flow = %conn.key, "Host reader exiting before handshake completed");
            return;
        }

        let mut scratch = vec![0u8; READ_CHUNK];
        loop {
            if self.is_shutting_down() || conn.state() == TcpState::Closed {
                break;
            }
            match (&conn.stream).read(&mut scratch) {
                Ok(0) => {
                    self.host_eof(conn);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = self.send_to_guest(conn, &scratch[..n]) {
                        debug!(flow = %conn.key, error = %e, "Host reader stopping");
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    debug!(flow = %conn.key, error = %e, "Host read failed");
                    self.host_eof(conn);
                    break;
                }
            }
        }
        trace!(flow = %conn.key, "Host reader exited");
    }

    /// Writer thread body: queued guest payload to the host socket.
    fn run_host_writer(&self, conn: &Arc<TcpConnection>, queue: Receiver<HostWrite>) {
        while !self.is_shutting_down() && !conn.is_torn_down() {
            let work = match queue.recv_timeout(self.poll_interval) {
                Ok(work) => work,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match work {
                HostWrite::Data(data) => {
                    if let Err(e) = self.write_host(conn, &data) {
                        if !self.is_shutting_down() && !conn.is_torn_down() {
                            warn!(flow = %conn.key, error = %e, "Write to host failed");
                            self.teardown(conn, "host write failed");
                        }
                        break;
                    }
                    trace!(flow = %conn.key, len = data.len(), "TCP guest -> host");
                }
                HostWrite::Fin => {
                    if let Err(e) = conn.stream.shutdown(Shutdown::Write) {
                        debug!(flow = %conn.key, error = %e, "Host half-close failed");
                    }
                    if conn.mark_flushed() {
                        self.teardown(conn, "both sides closed");
                    }
                    break;
                }
            }
        }
        trace!(flow = %conn.key, "Host writer exited");
    }

    /// Write all of `data`, checking for teardown between timed-out writes.
    fn write_host(&self, conn: &TcpConnection, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            if self.is_shutting_down() || conn.is_torn_down() {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }
            match (&conn.stream).write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Wait for the guest to complete the handshake.
    ///
    /// A guest that never acknowledges the SYN-ACK within the handshake
    /// timeout gets the connection torn down.
    fn wait_established(&self, conn: &TcpConnection) -> bool {
        let deadline = Instant::now() + self.handshake_timeout;
        let mut st = conn.lock();
        loop {
            let state = st.state;
            match state {
                TcpState::SynReceived if self.is_shutting_down() => return false,
                TcpState::SynReceived => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(st);
                        debug!(flow = %conn.key, "Guest never acknowledged the SYN-ACK");
                        self.teardown(conn, "handshake timed out");
                        return false;
                    }
                    st = conn
                        .cond
                        .wait_timeout(st, self.poll_interval.min(deadline - now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                TcpState::Closed => return false,
                _ => return true,
            }
        }
    }

    /// Block until the guest window has room; returns the free window.
    fn wait_window(&self, conn: &TcpConnection) -> Result<usize> {
        let mut st = conn.lock();
        loop {
            if self.is_shutting_down() {
                return Err(NetError::ShuttingDown);
            }
            if st.read_done || st.state == TcpState::Closed {
                return Err(NetError::NoRelay);
            }
            let in_flight = st.seq_server.wrapping_sub(st.guest_acked) as usize;
            let window = usize::from(st.guest_window);
            if in_flight < window {
                return Ok(window - in_flight);
            }
            st = conn
                .cond
                .wait_timeout(st, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Emit `data` to the guest in MSS-sized segments within its window.
    fn send_to_guest(&self, conn: &TcpConnection, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let room = self.wait_window(conn)?;
            let len = room.min(self.mss).min(data.len() - offset);

            let buf = self.tx.acquire()?;
            let seg = {
                let mut st = conn.lock();
                if st.state == TcpState::Closed {
                    return Err(NetError::NoRelay);
                }
                let seq = st.seq_server;
                st.seq_server = seq.wrapping_add(len as u32);
                self.segment(conn, seq, st.ack_server, TcpFlags::ACK | TcpFlags::PSH)
            };
            self.tx.publish_tcp(buf, &seg, &data[offset..offset + len]);
            trace!(flow = %conn.key, seq = seg.seq, len, "TCP host -> guest");
            offset += len;
        }
        Ok(())
    }

    /// Host side reached EOF: send FIN and mark the read side done.
    fn host_eof(&self, conn: &TcpConnection) {
        let Ok(buf) = self.tx.acquire() else {
            return;
        };
        let (seg, finished) = {
            let mut st = conn.lock();
            if st.read_done {
                return;
            }
            let seq = st.seq_server;
            st.seq_server = seq.wrapping_add(1);
            st.read_done = true;
            st.state = if st.write_done {
                TcpState::Closed
            } else {
                TcpState::HostClosed
            };
            (
                self.segment(conn, seq, st.ack_server, TcpFlags::FIN | TcpFlags::ACK),
                st.host_flushed,
            )
        };
        self.tx.publish_tcp(buf, &seg, &[]);
        debug!(flow = %conn.key, "Host closed its side");

        if finished {
            self.teardown(conn, "both sides closed");
        }
    }

    /// Close the host socket and drop the connection from the registry.
    fn teardown(&self, conn: &TcpConnection, reason: &str) {
        {
            let mut st = conn.lock();
            st.state = TcpState::Closed;
            st.read_done = true;
            st.write_done = true;
            st.torn_down = true;
        }
        conn.cond.notify_all();
        if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
            debug!(flow = %conn.key, error = %e, "Host socket shutdown failed");
        }

        let removed = {
            let mut conns = self.lock();
            match conns.get(&conn.key) {
                Some(c) if std::ptr::eq(Arc::as_ptr(c), conn) => conns.remove(&conn.key).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(flow = %conn.key, reason, "TCP connection closed");
        }
    }

    /// Tear down every connection and join the relay threads.
    ///
    /// The shared shutdown flag must already be set.
    pub fn shutdown(&self) {
        let conns: Vec<_> = self.lock().values().cloned().collect();
        for conn in &conns {
            self.teardown(conn, "stack shutdown");
        }

        let handles =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                error!("TCP relay thread panicked");
            }
        }
    }
}
