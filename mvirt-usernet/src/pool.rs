//! Fixed-capacity frame buffer pool shared by the guest datapath and relays.
//!
//! Every slot holds a zeroed vendor transport header followed by room for
//! one Ethernet frame. Slots cycle FREE -> IN-USE -> USED -> IN-USE -> FREE
//! and are never allocated after construction. Exhaustion blocks callers.
//!
//! Slot indices travel through two bounded channels (free and used), each
//! sized to the pool so a send never blocks. A slot that is checked out as a
//! [`PoolBuffer`] is in neither. A `PoolBuffer` that is dropped without
//! being published goes back to the free queue, so error paths cannot leak
//! slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::wire::MAX_FRAME_LEN;

/// Lifecycle state of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufStatus {
    Free,
    InUse,
    Used,
}

/// Snapshot of how many slots are in each state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub free: usize,
    pub in_use: usize,
    pub used: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.in_use + self.used
    }
}

struct Slot {
    status: BufStatus,
    /// Storage, absent while the slot is checked out
    data: Option<Box<[u8]>>,
    /// Ethernet frame length of a USED slot
    frame_len: usize,
}

/// Bounded pool of frame buffers.
pub struct BufferPool {
    slots: Vec<Mutex<Slot>>,
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    used_tx: Sender<u32>,
    used_rx: Receiver<u32>,
    /// Dropped by `close`, which disconnects `shutdown_rx` for every waiter
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
    capacity: usize,
    vnet_hdr_len: usize,
}

impl BufferPool {
    /// Allocate `capacity` slots, each `vnet_hdr_len + MAX_FRAME_LEN` bytes.
    pub fn new(capacity: usize, vnet_hdr_len: usize) -> Result<Arc<Self>> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(NetError::InvalidConfig(format!(
                "pool capacity out of range: {capacity}"
            )));
        }

        let slot_len = vnet_hdr_len + MAX_FRAME_LEN;
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    status: BufStatus::Free,
                    data: Some(vec![0u8; slot_len].into_boxed_slice()),
                    frame_len: 0,
                })
            })
            .collect();

        let (free_tx, free_rx) = bounded(capacity);
        let (used_tx, used_rx) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        for id in 0..capacity as u32 {
            // The queue holds exactly `capacity` ids, so this cannot fail
            let _ = free_tx.try_send(id);
        }

        info!(
            buffer_count = capacity,
            buffer_size_kb = slot_len / 1024,
            "Buffer pool created"
        );

        Ok(Arc::new(Self {
            slots,
            free_tx,
            free_rx,
            used_tx,
            used_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
            capacity,
            vnet_hdr_len,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn vnet_hdr_len(&self) -> usize {
        self.vnet_hdr_len
    }

    fn slot(&self, id: u32) -> MutexGuard<'_, Slot> {
        self.slots[id as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `rx` yields a slot id or the pool is closed.
    fn recv_id(&self, rx: &Receiver<u32>) -> Result<u32> {
        if self.is_closed() {
            return Err(NetError::ShuttingDown);
        }
        select! {
            recv(rx) -> id => id.map_err(|_| NetError::ShuttingDown),
            recv(self.shutdown_rx) -> _ => Err(NetError::ShuttingDown),
        }
    }

    fn recv_id_timeout(&self, rx: &Receiver<u32>, timeout: Duration) -> Result<Option<u32>> {
        if self.is_closed() {
            return Err(NetError::ShuttingDown);
        }
        select! {
            recv(rx) -> id => id.map(Some).map_err(|_| NetError::ShuttingDown),
            recv(self.shutdown_rx) -> _ => Err(NetError::ShuttingDown),
            default(timeout) => Ok(None),
        }
    }

    /// Queue `id` after its slot has been updated.
    fn enqueue(&self, tx: &Sender<u32>, id: u32) {
        // Each queue is as large as the pool and an id is queued at most once
        if let Err(e) = tx.try_send(id) {
            warn!(buffer_id = id, error = %e, "Buffer queue rejected slot");
        }
    }

    fn checkout(self: &Arc<Self>, id: u32) -> PoolBuffer {
        let (data, frame_len) = {
            let mut slot = self.slot(id);
            slot.status = BufStatus::InUse;
            // Queued slots always hold their storage
            let data = slot.data.take().unwrap_or_default();
            (data, std::mem::take(&mut slot.frame_len))
        };
        PoolBuffer {
            pool: Arc::clone(self),
            id,
            data: Some(data),
            frame_len,
        }
    }

    /// Block until a FREE slot exists and claim it.
    pub fn acquire_free(self: &Arc<Self>) -> Result<PoolBuffer> {
        let id = self.recv_id(&self.free_rx)?;
        Ok(self.checkout(id))
    }

    /// Queue a filled buffer for delivery to the guest.
    pub fn publish_used(&self, mut buf: PoolBuffer) {
        let Some(data) = buf.data.take() else {
            return;
        };
        {
            let mut slot = self.slot(buf.id);
            slot.status = BufStatus::Used;
            slot.data = Some(data);
            slot.frame_len = buf.frame_len;
        }
        self.enqueue(&self.used_tx, buf.id);
    }

    /// Block until a USED slot exists and take it for consumption.
    ///
    /// The slot returns to FREE when the returned buffer is dropped or
    /// passed to [`release_free`](Self::release_free).
    pub fn acquire_used(self: &Arc<Self>) -> Result<PoolBuffer> {
        let id = self.recv_id(&self.used_rx)?;
        Ok(self.checkout(id))
    }

    /// Like [`acquire_used`](Self::acquire_used) but gives up after `timeout`.
    pub fn acquire_used_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<PoolBuffer>> {
        Ok(self
            .recv_id_timeout(&self.used_rx, timeout)?
            .map(|id| self.checkout(id)))
    }

    /// Take the oldest USED slot if there is one.
    pub fn try_acquire_used(self: &Arc<Self>) -> Result<Option<PoolBuffer>> {
        if self.is_closed() {
            return Err(NetError::ShuttingDown);
        }
        match self.used_rx.try_recv() {
            Ok(id) => Ok(Some(self.checkout(id))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(NetError::ShuttingDown),
        }
    }

    /// Return a claimed buffer to FREE without publishing it.
    pub fn release_free(&self, buf: PoolBuffer) {
        drop(buf);
    }

    fn give_back(&self, id: u32, data: Box<[u8]>) {
        {
            let mut slot = self.slot(id);
            slot.status = BufStatus::Free;
            slot.data = Some(data);
            slot.frame_len = 0;
        }
        self.enqueue(&self.free_tx, id);
    }

    /// Wake every blocked caller with [`NetError::ShuttingDown`].
    ///
    /// Buffers already checked out stay valid and still return on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(
            self.shutdown_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        debug!("Buffer pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in &self.slots {
            match slot.lock().unwrap_or_else(PoisonError::into_inner).status {
                BufStatus::Free => counts.free += 1,
                BufStatus::InUse => counts.in_use += 1,
                BufStatus::Used => counts.used += 1,
            }
        }
        counts
    }

    pub fn status(&self, id: u32) -> Option<BufStatus> {
        self.slots
            .get(id as usize)
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).status)
    }
}

/// A slot checked out of the pool.
///
/// Returns to FREE when dropped unless handed to
/// [`BufferPool::publish_used`].
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    id: u32,
    data: Option<Box<[u8]>>,
    frame_len: usize,
}

impl PoolBuffer {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// The whole Ethernet region, for building a frame in place
    pub fn frame_mut(&mut self) -> &mut [u8] {
        let hdr = self.pool.vnet_hdr_len;
        match self.data.as_deref_mut() {
            Some(data) => &mut data[hdr..],
            None => &mut [],
        }
    }

    /// The Ethernet frame written so far
    pub fn frame(&self) -> &[u8] {
        let hdr = self.pool.vnet_hdr_len;
        &self.bytes()[hdr..hdr + self.frame_len]
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn set_frame_len(&mut self, len: usize) {
        self.frame_len = len.min(MAX_FRAME_LEN);
    }

    /// Vendor header plus Ethernet frame, as handed to the guest
    pub fn packet(&self) -> &[u8] {
        &self.bytes()[..self.pool.vnet_hdr_len + self.frame_len]
    }

    pub fn packet_len(&self) -> usize {
        self.pool.vnet_hdr_len + self.frame_len
    }

    /// Mark the frame complete and queue it for the guest.
    pub fn publish(self) {
        let pool = Arc::clone(&self.pool);
        pool.publish_used(self);
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(self.id, data);
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("id", &self.id)
            .field("frame_len", &self.frame_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    fn fill(buf: &mut PoolBuffer, byte: u8, len: usize) {
        buf.frame_mut()[..len].fill(byte);
        buf.set_frame_len(len);
    }

    #[test]
    fn test_lifecycle_counts() {
        let pool = BufferPool::new(4, 12).unwrap();
        assert_eq!(
            pool.counts(),
            PoolCounts {
                free: 4,
                in_use: 0,
                used: 0
            }
        );

        let mut buf = pool.acquire_free().unwrap();
        let id = buf.id();
        assert_eq!(pool.status(id), Some(BufStatus::InUse));
        fill(&mut buf, 0xab, 60);
        buf.publish();
        assert_eq!(pool.status(id), Some(BufStatus::Used));
        assert_eq!(pool.counts().used, 1);

        let got = pool.try_acquire_used().unwrap().unwrap();
        assert_eq!(got.id(), id);
        assert_eq!(got.frame_len(), 60);
        assert_eq!(got.packet_len(), 72);
        assert!(got.packet()[..12].iter().all(|&b| b == 0));
        assert!(got.frame().iter().all(|&b| b == 0xab));
        pool.release_free(got);

        assert_eq!(pool.status(id), Some(BufStatus::Free));
        assert_eq!(pool.counts().free, 4);
    }

    #[test]
    fn test_dropped_buffer_returns_to_free() {
        let pool = BufferPool::new(2, 0).unwrap();
        {
            let _a = pool.acquire_free().unwrap();
            let _b = pool.acquire_free().unwrap();
            assert_eq!(pool.counts().in_use, 2);
        }
        assert_eq!(pool.counts().free, 2);
    }

    #[test]
    fn test_used_queue_is_fifo() {
        let pool = BufferPool::new(3, 0).unwrap();
        for byte in 1..=3u8 {
            let mut buf = pool.acquire_free().unwrap();
            fill(&mut buf, byte, usize::from(byte));
            buf.publish();
        }
        for byte in 1..=3u8 {
            let buf = pool.try_acquire_used().unwrap().unwrap();
            assert_eq!(buf.frame(), vec![byte; usize::from(byte)].as_slice());
        }
        assert!(pool.try_acquire_used().unwrap().is_none());
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = BufferPool::new(1, 0).unwrap();
        let held = pool.acquire_free().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_free().map(|b| b.id()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_acquire_used_timeout_expires() {
        let pool = BufferPool::new(1, 0).unwrap();
        let start = Instant::now();
        let got = pool.acquire_used_timeout(Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let pool = BufferPool::new(1, 0).unwrap();
        let _held = pool.acquire_free().unwrap();

        let free_waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_free().map(|_| ()))
        };
        let used_waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_used().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();

        assert!(matches!(
            free_waiter.join().unwrap(),
            Err(NetError::ShuttingDown)
        ));
        assert!(matches!(
            used_waiter.join().unwrap(),
            Err(NetError::ShuttingDown)
        ));
        assert!(pool.is_closed());
    }

    #[test]
    fn test_concurrent_ids_unique_and_counts_conserved() {
        for capacity in [1usize, 2, 7] {
            let pool = BufferPool::new(capacity, 12).unwrap();
            let held: Arc<Mutex<HashSet<u32>>> = Arc::default();
            let done = Arc::new(AtomicBool::new(false));
            let consumed = Arc::new(AtomicUsize::new(0));
            const PER_PRODUCER: usize = 200;
            const PRODUCERS: usize = 3;

            let producers: Vec<_> = (0..PRODUCERS)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    let held = Arc::clone(&held);
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            let mut buf = pool.acquire_free().unwrap();
                            assert!(held.lock().unwrap().insert(buf.id()));
                            let counts = pool.counts();
                            assert_eq!(counts.total(), capacity);
                            fill(&mut buf, i as u8, 1);
                            held.lock().unwrap().remove(&buf.id());
                            if i % 5 == 0 {
                                pool.release_free(buf);
                            } else {
                                buf.publish();
                            }
                        }
                    })
                })
                .collect();

            let consumer = {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                let done = Arc::clone(&done);
                let consumed = Arc::clone(&consumed);
                thread::spawn(move || {
                    loop {
                        match pool.acquire_used_timeout(Duration::from_millis(10)).unwrap() {
                            Some(buf) => {
                                assert!(held.lock().unwrap().insert(buf.id()));
                                assert_eq!(pool.counts().total(), capacity);
                                held.lock().unwrap().remove(&buf.id());
                                consumed.fetch_add(1, Ordering::Relaxed);
                            }
                            None if done.load(Ordering::Acquire) => break,
                            None => {}
                        }
                    }
                })
            };

            for p in producers {
                p.join().unwrap();
            }
            done.store(true, Ordering::Release);
            consumer.join().unwrap();

            let published = PRODUCERS * (PER_PRODUCER - PER_PRODUCER / 5);
            assert_eq!(consumed.load(Ordering::Relaxed), published);
            assert_eq!(
                pool.counts(),
                PoolCounts {
                    free: capacity,
                    in_use: 0,
                    used: 0
                }
            );
        }
    }
}
