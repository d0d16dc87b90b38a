//! Software NIC built from descriptor rings.
//!
//! [`LoopbackBackend`] implements [`RawBackend`] without hardware. Each queue
//! has the four AF_XDP rings (fill, RX, TX, completion) as [`SoftRing`]s.
//! Frames enter through [`LoopbackBackend::inject`], which consumes a buffer
//! from the fill ring exactly like a NIC would, and leave through the TX
//! ring, after which they are either captured for inspection or delivered to
//! a connected peer backend.
//!
//! ```text
//!   inject ──▶ fill ring buffer ──▶ RX ring ──▶ datapath
//!   datapath ──▶ TX ring ──▶ (poke) ──▶ captured / peer.inject
//!                               └──────▶ completion ring ──▶ datapath
//! ```
//!
//! Binding with [`BindFlags::need_wakeup`] makes transmission wait for
//! [`RawBackend::poke_tx`]; otherwise frames go out during `tx_submit`.

use crate::ring::SoftRing;
use crossbeam_queue::SegQueue;
use rawpath_core::backend::{
    BindFlags, ChecksumOffloads, HwQueue, NotifyDirection, NotifyOutcome, QueueId, RawBackend,
    RxDescriptor, SteeringRule, TxDescriptor,
};
use rawpath_core::buffer_pool::Frame;
use rawpath_core::error::BackendError;
use rawpath_core::frame::parse_ethernet;
use rawpath_core::partition::PartitionWaker;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Loopback backend configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Interface index reported in the queue layout
    pub interface_index: u32,
    /// Number of queues
    pub queue_count: u32,
    /// Slots per ring (power of 2)
    pub ring_size: u32,
    /// Checksums reported as offloaded
    pub offloads: ChecksumOffloads,
    /// Drop injected frames that no installed steering rule matches
    pub enforce_rules: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            interface_index: 1,
            queue_count: 1,
            ring_size: 256,
            offloads: ChecksumOffloads::default(),
            enforce_rules: false,
        }
    }
}

impl LoopbackConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.queue_count == 0 {
            return Err(BackendError::Unsupported("loopback needs at least one queue"));
        }

        if !self.ring_size.is_power_of_two() {
            return Err(BackendError::Unsupported("ring size must be a power of 2"));
        }

        Ok(())
    }
}

/// Loopback statistics
#[derive(Debug, Default)]
pub struct LoopbackStats {
    /// Frames placed on an RX ring
    rx_frames: AtomicU64,
    /// Frames dropped at injection
    rx_dropped: AtomicU64,
    /// Injections that found the fill ring empty
    fill_ring_empty: AtomicU64,
    /// Frames consumed from TX rings
    tx_frames: AtomicU64,
    /// Bytes consumed from TX rings
    tx_bytes: AtomicU64,
    /// TX kicks
    pokes: AtomicU64,
}

impl LoopbackStats {
    fn record_rx(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fill_ring_empty(&self) {
        self.fill_ring_empty.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tx(&self, bytes: u64) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_poke(&self) {
        self.pokes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> LoopbackStatsSnapshot {
        LoopbackStatsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            fill_ring_empty: self.fill_ring_empty.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            pokes: self.pokes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LoopbackStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStatsSnapshot {
    /// Frames placed on an RX ring
    pub rx_frames: u64,
    /// Frames dropped at injection
    pub rx_dropped: u64,
    /// Injections that found the fill ring empty
    pub fill_ring_empty: u64,
    /// Frames consumed from TX rings
    pub tx_frames: u64,
    /// Bytes consumed from TX rings
    pub tx_bytes: u64,
    /// TX kicks
    pub pokes: u64,
}

/// A frame that left through a TX ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmittedFrame {
    /// Queue it was sent on
    pub queue: QueueId,
    /// Ethernet frame bytes
    pub bytes: Vec<u8>,
}

struct Rings {
    fill: SoftRing<Frame>,
    rx: SoftRing<RxDescriptor>,
    tx: SoftRing<TxDescriptor>,
    completion: SoftRing<Frame>,
    rx_waker: Option<Arc<PartitionWaker>>,
    tx_waker: Option<Arc<PartitionWaker>>,
}

struct LoopbackQueue {
    hw: HwQueue,
    bound: AtomicBool,
    need_wakeup: AtomicBool,
    rings: Mutex<Rings>,
}

impl LoopbackQueue {
    fn rings(&self) -> std::sync::MutexGuard<'_, Rings> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Software [`RawBackend`].
pub struct LoopbackBackend {
    config: LoopbackConfig,
    queues: Vec<LoopbackQueue>,
    rules: Mutex<Vec<SteeringRule>>,
    captured: SegQueue<TransmittedFrame>,
    peer: Mutex<Option<Weak<LoopbackBackend>>>,
    stats: LoopbackStats,
}

impl LoopbackBackend {
    /// Create a backend with `config.queue_count` queues.
    pub fn new(config: LoopbackConfig) -> Result<Arc<Self>, BackendError> {
        config.validate()?;
        let queues = (0..config.queue_count)
            .map(|hw_queue| LoopbackQueue {
                hw: HwQueue {
                    interface_index: config.interface_index,
                    hw_queue,
                },
                bound: AtomicBool::new(false),
                need_wakeup: AtomicBool::new(false),
                rings: Mutex::new(Rings {
                    fill: SoftRing::new(config.ring_size),
                    rx: SoftRing::new(config.ring_size),
                    tx: SoftRing::new(config.ring_size),
                    completion: SoftRing::new(config.ring_size),
                    rx_waker: None,
                    tx_waker: None,
                }),
            })
            .collect();
        tracing::debug!(
            queues = config.queue_count,
            ring_size = config.ring_size,
            "Loopback backend created"
        );
        Ok(Arc::new(Self {
            config,
            queues,
            rules: Mutex::new(Vec::new()),
            captured: SegQueue::new(),
            peer: Mutex::new(None),
            stats: LoopbackStats::default(),
        }))
    }

    /// Wire two backends back to back: whatever one transmits, the other
    /// receives on the queue with the same index (modulo its queue count).
    pub fn connect_peers(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(b));
        *b.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(a));
    }

    /// Statistics.
    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    /// Rules currently installed.
    pub fn rules(&self) -> Vec<SteeringRule> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames transmitted so far with no peer attached. Clears the capture.
    pub fn take_transmitted(&self) -> Vec<TransmittedFrame> {
        std::iter::from_fn(|| self.captured.pop()).collect()
    }

    /// Receive `bytes` on `queue` as if they arrived from the wire.
    ///
    /// Returns `false` if the frame was dropped: unknown or unbound queue, no
    /// fill buffer posted, frame larger than the buffer, or no matching
    /// steering rule when rules are enforced.
    pub fn inject(&self, queue: QueueId, bytes: &[u8]) -> bool {
        let Some(q) = self.queue(queue).filter(|q| q.bound.load(Ordering::Acquire)) else {
            self.stats.record_rx_dropped();
            return false;
        };
        if self.config.enforce_rules && !self.is_steered(bytes) {
            tracing::trace!(queue = queue.0, "No steering rule, frame dropped");
            self.stats.record_rx_dropped();
            return false;
        }

        let waker = {
            let mut rings = q.rings();
            if rings.rx.available() == 0 {
                self.stats.record_rx_dropped();
                return false;
            }
            let Some(mut frame) = rings.fill.pop() else {
                self.stats.record_fill_ring_empty();
                self.stats.record_rx_dropped();
                return false;
            };
            if bytes.len() > frame.capacity() {
                // Put the buffer back; the ring had room for it a moment ago.
                let _ = rings.fill.push(frame);
                self.stats.record_rx_dropped();
                return false;
            }
            frame.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
            let descriptor = RxDescriptor {
                frame,
                offset: 0,
                len: bytes.len(),
            };
            if let Err(descriptor) = rings.rx.push(descriptor) {
                let _ = rings.fill.push(descriptor.frame);
                self.stats.record_rx_dropped();
                return false;
            }
            rings.rx_waker.take()
        };

        self.stats.record_rx();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Frames posted to `queue`'s fill ring.
    pub fn fill_level(&self, queue: QueueId) -> usize {
        self.queue(queue)
            .map(|q| q.rings().fill.ready() as usize)
            .unwrap_or(0)
    }

    fn queue(&self, queue: QueueId) -> Option<&LoopbackQueue> {
        self.queues.get(queue.0 as usize)
    }

    fn bound_queue(&self, queue: QueueId) -> Result<&LoopbackQueue, BackendError> {
        let q = self
            .queue(queue)
            .ok_or(BackendError::UnknownQueue(queue.0))?;
        if !q.bound.load(Ordering::Acquire) {
            return Err(BackendError::RingError {
                queue: queue.0,
                reason: "queue not bound".to_string(),
            });
        }
        Ok(q)
    }

    fn is_steered(&self, bytes: &[u8]) -> bool {
        let Ok(parsed) = parse_ethernet(bytes) else {
            return false;
        };
        let port = parsed.route.local_address.port();
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|rule| rule.port() == port)
    }

    /// Drain the TX ring into the completion ring and deliver the bytes.
    fn transmit(&self, queue: QueueId, q: &LoopbackQueue) {
        let (sent, waker) = {
            let mut rings = q.rings();
            let mut sent = Vec::new();
            while !rings.tx.is_empty() && rings.completion.available() > 0 {
                let Some(descriptor) = rings.tx.pop() else {
                    break;
                };
                let TxDescriptor { frame, offset, len } = descriptor;
                let bytes = frame
                    .as_slice()
                    .get(offset..offset + len)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                self.stats.record_tx(bytes.len() as u64);
                let _ = rings.completion.push(frame);
                sent.push(bytes);
            }
            let waker = if sent.is_empty() {
                None
            } else {
                rings.tx_waker.take()
            };
            (sent, waker)
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        if sent.is_empty() {
            return;
        }

        let peer = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match peer {
            Some(peer) => {
                let target = QueueId(queue.0 % peer.config.queue_count);
                for bytes in sent {
                    if !peer.inject(target, &bytes) {
                        tracing::trace!(queue = target.0, "Peer dropped frame");
                    }
                }
            }
            None => {
                for bytes in sent {
                    self.captured.push(TransmittedFrame { queue, bytes });
                }
            }
        }
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl RawBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn queue_layout(&self) -> Vec<HwQueue> {
        self.queues.iter().map(|q| q.hw).collect()
    }

    fn bind(&self, queue: QueueId, hw: HwQueue, flags: BindFlags) -> Result<(), BackendError> {
        let q = self.queue(queue).ok_or(BackendError::UnknownQueue(queue.0))?;
        if q.hw != hw {
            return Err(BackendError::BindFailed {
                queue: queue.0,
                reason: format!("no hardware queue {} on interface {}", hw.hw_queue, hw.interface_index),
            });
        }
        q.need_wakeup.store(flags.need_wakeup, Ordering::Release);
        q.bound.store(true, Ordering::Release);
        tracing::debug!(queue = queue.0, need_wakeup = flags.need_wakeup, "Loopback queue bound");
        Ok(())
    }

    fn install_rule(&self, rule: &SteeringRule) -> Result<(), BackendError> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule.clone());
        Ok(())
    }

    fn remove_rule(&self, rule: &SteeringRule) -> Result<(), BackendError> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        match rules.iter().position(|r| r == rule) {
            Some(i) => {
                rules.swap_remove(i);
                Ok(())
            }
            None => Err(BackendError::Unsupported("rule not installed")),
        }
    }

    fn fill_ring_space(&self, queue: QueueId) -> usize {
        self.bound_queue(queue)
            .map(|q| q.rings().fill.available() as usize)
            .unwrap_or(0)
    }

    fn fill_submit(&self, queue: QueueId, frames: &mut Vec<Frame>) -> Result<(), BackendError> {
        let q = self.bound_queue(queue)?;
        let mut rings = q.rings();
        let count = frames.len().min(rings.fill.available() as usize);
        if let Some(foreign) = frames[..count].iter().find(|f| f.origin() != queue) {
            return Err(BackendError::RingError {
                queue: queue.0,
                reason: format!("frame from {} posted to {queue}", foreign.origin()),
            });
        }
        for frame in frames.drain(..count) {
            let _ = rings.fill.push(frame);
        }
        Ok(())
    }

    fn rx_reserve(
        &self,
        queue: QueueId,
        max: usize,
        out: &mut Vec<RxDescriptor>,
    ) -> Result<usize, BackendError> {
        let q = self.bound_queue(queue)?;
        let mut rings = q.rings();
        let count = max.min(rings.rx.ready() as usize) as u32;
        if count == 0 {
            return Ok(0);
        }
        let Some(idx) = rings.rx.peek(count) else {
            return Ok(0);
        };
        for i in 0..count {
            if let Some(descriptor) = rings.rx.take(idx.wrapping_add(i)) {
                out.push(descriptor);
            }
        }
        Ok(count as usize)
    }

    fn rx_release(&self, queue: QueueId, count: usize) {
        if let Some(q) = self.queue(queue) {
            q.rings().rx.release(count as u32);
        }
    }

    fn tx_reserve(&self, queue: QueueId, max: usize) -> usize {
        self.bound_queue(queue)
            .map(|q| max.min(q.rings().tx.available() as usize))
            .unwrap_or(0)
    }

    fn tx_submit(
        &self,
        queue: QueueId,
        descriptors: &mut Vec<TxDescriptor>,
    ) -> Result<(), BackendError> {
        let q = self.bound_queue(queue)?;
        {
            let mut rings = q.rings();
            let count = descriptors.len().min(rings.tx.available() as usize);
            for descriptor in descriptors.drain(..count) {
                let _ = rings.tx.push(descriptor);
            }
        }
        if !q.need_wakeup.load(Ordering::Acquire) {
            self.transmit(queue, q);
        }
        Ok(())
    }

    fn tx_completions_reserve(
        &self,
        queue: QueueId,
        max: usize,
        out: &mut Vec<Frame>,
    ) -> Result<usize, BackendError> {
        let q = self.bound_queue(queue)?;
        let mut rings = q.rings();
        let count = max.min(rings.completion.ready() as usize) as u32;
        if count == 0 {
            return Ok(0);
        }
        let Some(idx) = rings.completion.peek(count) else {
            return Ok(0);
        };
        for i in 0..count {
            if let Some(frame) = rings.completion.take(idx.wrapping_add(i)) {
                out.push(frame);
            }
        }
        Ok(count as usize)
    }

    fn tx_completions_release(&self, queue: QueueId, count: usize) {
        if let Some(q) = self.queue(queue) {
            q.rings().completion.release(count as u32);
        }
    }

    fn needs_wakeup(&self, queue: QueueId) -> bool {
        self.queue(queue).is_some_and(|q| {
            q.need_wakeup.load(Ordering::Acquire) && !q.rings().tx.is_empty()
        })
    }

    fn poke_tx(&self, queue: QueueId) -> Result<(), BackendError> {
        let q = self.bound_queue(queue)?;
        self.stats.record_poke();
        self.transmit(queue, q);
        Ok(())
    }

    fn notify_async(
        &self,
        queue: QueueId,
        direction: NotifyDirection,
        waker: Arc<PartitionWaker>,
    ) -> Result<NotifyOutcome, BackendError> {
        let q = self.bound_queue(queue)?;
        let mut rings = q.rings();
        let outcome = match direction {
            NotifyDirection::Rx if !rings.rx.is_empty() => NotifyOutcome::Immediate,
            NotifyDirection::Tx if !rings.completion.is_empty() => NotifyOutcome::Immediate,
            NotifyDirection::Rx => {
                rings.rx_waker = Some(waker);
                NotifyOutcome::Pending
            }
            NotifyDirection::Tx => {
                rings.tx_waker = Some(waker);
                NotifyOutcome::Pending
            }
        };
        Ok(outcome)
    }

    fn offloads(&self, _queue: QueueId) -> ChecksumOffloads {
        self.config.offloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawpath_core::buffer_pool::FramePool;

    fn bound(config: LoopbackConfig) -> Arc<LoopbackBackend> {
        let backend = LoopbackBackend::new(config).unwrap();
        for (i, hw) in backend.queue_layout().into_iter().enumerate() {
            backend
                .bind(QueueId(i as u32), hw, BindFlags::default())
                .unwrap();
        }
        backend
    }

    fn post(backend: &LoopbackBackend, pool: &FramePool, count: usize) {
        let mut frames: Vec<Frame> = (0..count).map_while(|_| pool.acquire()).collect();
        backend.fill_submit(pool.queue(), &mut frames).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(LoopbackConfig::default().validate().is_ok());
        let bad = LoopbackConfig {
            ring_size: 100,
            ..LoopbackConfig::default()
        };
        assert!(LoopbackBackend::new(bad).is_err());
        let none = LoopbackConfig {
            queue_count: 0,
            ..LoopbackConfig::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn test_layout_and_bind() {
        let backend = LoopbackBackend::new(LoopbackConfig {
            interface_index: 7,
            queue_count: 2,
            ..LoopbackConfig::default()
        })
        .unwrap();
        let layout = backend.queue_layout();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[1].interface_index, 7);
        assert_eq!(layout[1].hw_queue, 1);

        assert!(backend.bind(QueueId(5), layout[0], BindFlags::default()).is_err());
        assert!(backend.bind(QueueId(0), layout[1], BindFlags::default()).is_err());
        assert_eq!(backend.fill_ring_space(QueueId(0)), 0, "unbound queue has no space");
        backend.bind(QueueId(0), layout[0], BindFlags::default()).unwrap();
        assert_eq!(backend.fill_ring_space(QueueId(0)), 256);
    }

    #[test]
    fn test_inject_needs_fill_buffer() {
        let backend = bound(LoopbackConfig::default());
        assert!(!backend.inject(QueueId(0), &[0u8; 60]));
        assert_eq!(backend.stats().snapshot().fill_ring_empty, 1);

        let pool = FramePool::new(QueueId(0), 2048, 4);
        post(&backend, &pool, 1);
        assert!(backend.inject(QueueId(0), &[0xAB; 60]));

        let mut out = Vec::new();
        assert_eq!(backend.rx_reserve(QueueId(0), 8, &mut out).unwrap(), 1);
        backend.rx_release(QueueId(0), 1);
        let descriptor = out.pop().unwrap();
        assert_eq!(descriptor.len, 60);
        assert_eq!(descriptor.frame.as_slice()[0], 0xAB);
        assert_eq!(descriptor.frame.origin(), QueueId(0));
        pool.release(descriptor.frame);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_inject_oversized_keeps_buffer() {
        let backend = bound(LoopbackConfig::default());
        let pool = FramePool::new(QueueId(0), 128, 1);
        post(&backend, &pool, 1);
        assert!(!backend.inject(QueueId(0), &[0u8; 200]));
        assert_eq!(backend.fill_level(QueueId(0)), 1);
    }

    #[test]
    fn test_fill_submit_rejects_foreign_frame() {
        let backend = bound(LoopbackConfig {
            queue_count: 2,
            ..LoopbackConfig::default()
        });
        let own = FramePool::new(QueueId(0), 256, 1);
        let foreign = FramePool::new(QueueId(1), 256, 1);
        let mut frames = vec![own.acquire().unwrap(), foreign.acquire().unwrap()];
        assert!(backend.fill_submit(QueueId(0), &mut frames).is_err());

        // A rejected batch stays with the caller so every frame can go home.
        assert_eq!(frames.len(), 2);
        assert_eq!(backend.fill_level(QueueId(0)), 0);
        for frame in frames {
            match frame.origin() {
                QueueId(0) => own.release(frame),
                _ => foreign.release(frame),
            }
        }
        assert_eq!(own.available(), 1);
        assert_eq!(foreign.available(), 1);
    }

    #[test]
    fn test_tx_capture_and_completion() {
        let backend = bound(LoopbackConfig::default());
        let pool = FramePool::new(QueueId(0), 256, 2);
        let mut frame = pool.acquire().unwrap();
        frame.as_mut_slice()[10..14].copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(backend.tx_reserve(QueueId(0), 8), 8);
        let mut batch = vec![TxDescriptor {
            frame,
            offset: 10,
            len: 4,
        }];
        backend.tx_submit(QueueId(0), &mut batch).unwrap();
        assert!(batch.is_empty());

        let sent = backend.take_transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes, vec![1, 2, 3, 4]);

        let mut done = Vec::new();
        assert_eq!(
            backend
                .tx_completions_reserve(QueueId(0), 8, &mut done)
                .unwrap(),
            1
        );
        backend.tx_completions_release(QueueId(0), 1);
        pool.release(done.pop().unwrap());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_need_wakeup_defers_transmit() {
        let backend = LoopbackBackend::new(LoopbackConfig::default()).unwrap();
        let hw = backend.queue_layout()[0];
        backend
            .bind(
                QueueId(0),
                hw,
                BindFlags {
                    need_wakeup: true,
                    ..BindFlags::default()
                },
            )
            .unwrap();
        let pool = FramePool::new(QueueId(0), 256, 1);
        let mut batch = vec![TxDescriptor {
            frame: pool.acquire().unwrap(),
            offset: 0,
            len: 60,
        }];
        backend.tx_submit(QueueId(0), &mut batch).unwrap();
        assert!(backend.needs_wakeup(QueueId(0)));
        assert!(backend.take_transmitted().is_empty());

        backend.poke_tx(QueueId(0)).unwrap();
        assert!(!backend.needs_wakeup(QueueId(0)));
        assert_eq!(backend.take_transmitted().len(), 1);
        assert_eq!(backend.stats().snapshot().pokes, 1);
    }

    #[test]
    fn test_notify_rx_wakes_on_inject() {
        let backend = bound(LoopbackConfig::default());
        let pool = FramePool::new(QueueId(0), 256, 1);
        post(&backend, &pool, 1);

        let waker = PartitionWaker::new();
        let outcome = backend
            .notify_async(QueueId(0), NotifyDirection::Rx, Arc::clone(&waker))
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Pending);
        assert!(!waker.is_ready());

        assert!(backend.inject(QueueId(0), &[0u8; 60]));
        assert!(waker.is_ready());

        let again = backend
            .notify_async(QueueId(0), NotifyDirection::Rx, PartitionWaker::new())
            .unwrap();
        assert_eq!(again, NotifyOutcome::Immediate);
    }

    #[test]
    fn test_peers_exchange_frames() {
        let a = bound(LoopbackConfig::default());
        let b = bound(LoopbackConfig::default());
        LoopbackBackend::connect_peers(&a, &b);

        let b_pool = FramePool::new(QueueId(0), 256, 1);
        post(&b, &b_pool, 1);

        let a_pool = FramePool::new(QueueId(0), 256, 1);
        let mut frame = a_pool.acquire().unwrap();
        frame.as_mut_slice()[..3].copy_from_slice(b"abc");
        let mut batch = vec![TxDescriptor {
            frame,
            offset: 0,
            len: 3,
        }];
        a.tx_submit(QueueId(0), &mut batch).unwrap();
        assert!(a.take_transmitted().is_empty());

        let mut out = Vec::new();
        assert_eq!(b.rx_reserve(QueueId(0), 4, &mut out).unwrap(), 1);
        assert_eq!(&out[0].frame.as_slice()[..3], b"abc");
    }

    #[test]
    fn test_rules_enforced() {
        let backend = bound(LoopbackConfig {
            enforce_rules: true,
            ..LoopbackConfig::default()
        });
        let pool = FramePool::new(QueueId(0), 256, 2);
        post(&backend, &pool, 2);

        assert!(!backend.inject(QueueId(0), &[0u8; 60]), "unparseable frame");

        let rule = SteeringRule::UdpDst { port: 443 };
        backend.install_rule(&rule).unwrap();
        assert_eq!(backend.rules(), vec![rule.clone()]);
        backend.remove_rule(&rule).unwrap();
        assert!(backend.remove_rule(&rule).is_err());
        assert!(backend.rules().is_empty());
    }
}
