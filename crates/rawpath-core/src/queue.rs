//! Per-queue state and statistics.

use crate::backend::{ChecksumOffloads, HwQueue, QueueId, TxDescriptor};
use crate::buffer_pool::FramePool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Queue statistics for performance monitoring.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Packets received and parsed
    rx_packets: AtomicU64,
    /// Bytes received
    rx_bytes: AtomicU64,
    /// Packets handed to the TX ring
    tx_packets: AtomicU64,
    /// Bytes handed to the TX ring
    tx_bytes: AtomicU64,
    /// TX completions returned to the pool
    tx_completions: AtomicU64,
    /// Frames dropped by the parser
    parse_drops: AtomicU64,
    /// Frames with no matching socket
    no_socket_drops: AtomicU64,
    /// Iterations where the TX ring was full
    tx_ring_full: AtomicU64,
    /// Allocations that found the pool empty
    pool_exhausted: AtomicU64,
    /// TX kicks
    wakeups: AtomicU64,
}

impl QueueStats {
    /// Create new statistics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record received packets
    pub fn record_rx(&self, count: u64, bytes: u64) {
        self.rx_packets.fetch_add(count, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record transmitted packets
    pub fn record_tx(&self, count: u64, bytes: u64) {
        self.tx_packets.fetch_add(count, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record TX completions
    pub fn record_completions(&self, count: u64) {
        self.tx_completions.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a frame the parser rejected
    pub fn record_parse_drop(&self) {
        self.parse_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet nobody was listening for
    pub fn record_no_socket(&self) {
        self.no_socket_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record TX ring full event
    pub fn record_tx_ring_full(&self) {
        self.tx_ring_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an empty pool
    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record TX kick
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_completions: self.tx_completions.load(Ordering::Relaxed),
            parse_drops: self.parse_drops.load(Ordering::Relaxed),
            no_socket_drops: self.no_socket_drops.load(Ordering::Relaxed),
            tx_ring_full: self.tx_ring_full.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic copy of [`QueueStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Packets received and parsed
    pub rx_packets: u64,
    /// Bytes received
    pub rx_bytes: u64,
    /// Packets transmitted
    pub tx_packets: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
    /// TX completions
    pub tx_completions: u64,
    /// Parser drops
    pub parse_drops: u64,
    /// Drops with no socket
    pub no_socket_drops: u64,
    /// TX ring full events
    pub tx_ring_full: u64,
    /// Pool exhaustion events
    pub pool_exhausted: u64,
    /// TX kicks
    pub wakeups: u64,
}

impl QueueStatsSnapshot {
    /// Fraction of received frames that were dropped.
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.parse_drops + self.no_socket_drops;
        let total = self.rx_packets + self.parse_drops;
        if total > 0 {
            dropped as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Accumulate another snapshot.
    pub fn merge(&mut self, other: &Self) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_completions += other.tx_completions;
        self.parse_drops += other.parse_drops;
        self.no_socket_drops += other.no_socket_drops;
        self.tx_ring_full += other.tx_ring_full;
        self.pool_exhausted += other.pool_exhausted;
        self.wakeups += other.wakeups;
    }
}

/// One datapath queue: its pools, TX backlog and health.
#[derive(Debug)]
pub struct Queue {
    id: QueueId,
    hw: HwQueue,
    partition_index: u16,
    pub(crate) rx_pool: Arc<FramePool>,
    pub(crate) tx_pool: Arc<FramePool>,
    tx_pending: Mutex<Vec<TxDescriptor>>,
    errored: AtomicBool,
    offloads: ChecksumOffloads,
    stats: QueueStats,
}

impl Queue {
    pub(crate) fn new(
        id: QueueId,
        hw: HwQueue,
        partition_index: u16,
        frame_size: usize,
        rx_count: usize,
        tx_count: usize,
        offloads: ChecksumOffloads,
    ) -> Self {
        Self {
            id,
            hw,
            partition_index,
            rx_pool: FramePool::new(id, frame_size, rx_count),
            tx_pool: FramePool::new(id, frame_size, tx_count),
            tx_pending: Mutex::new(Vec::new()),
            errored: AtomicBool::new(false),
            offloads,
            stats: QueueStats::new(),
        }
    }

    /// Queue id.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Hardware queue this queue is bound to.
    pub fn hw(&self) -> HwQueue {
        self.hw
    }

    /// Partition that services the queue.
    pub fn partition_index(&self) -> u16 {
        self.partition_index
    }

    /// Checksums offloaded to the NIC.
    pub fn offloads(&self) -> ChecksumOffloads {
        self.offloads
    }

    /// RX frame pool.
    pub fn rx_pool(&self) -> &Arc<FramePool> {
        &self.rx_pool
    }

    /// TX frame pool.
    pub fn tx_pool(&self) -> &Arc<FramePool> {
        &self.tx_pool
    }

    /// Statistics.
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Whether the backend has reported an error on this queue.
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Relaxed)
    }

    /// Mark the queue errored. Returns `true` the first time.
    pub(crate) fn mark_errored(&self) -> bool {
        !self.errored.swap(true, Ordering::Relaxed)
    }

    /// Append a framed packet to the TX backlog.
    pub(crate) fn push_pending(&self, descriptor: TxDescriptor) {
        self.tx_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(descriptor);
    }

    /// Move the TX backlog into `out`.
    pub(crate) fn take_pending(&self, out: &mut Vec<TxDescriptor>) -> usize {
        let mut pending = self.tx_pending.lock().unwrap_or_else(PoisonError::into_inner);
        let count = pending.len();
        out.append(&mut pending);
        count
    }

    /// Packets waiting to be moved to the partition.
    pub fn pending_len(&self) -> usize {
        self.tx_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
