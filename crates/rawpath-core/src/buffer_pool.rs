//! Per-queue frame pools and the packet handles built on them.
//!
//! Every queue owns one RX pool and one TX pool. A pool pre-allocates all of
//! its frames at creation and recycles them through a lock-free
//! `crossbeam_queue::ArrayQueue`; nothing is allocated on the packet path.
//!
//! # Pool affinity
//!
//! Each [`Frame`] is stamped with the queue id of the pool that created it.
//! [`FramePool::release`] asserts the stamp, so a frame can never migrate into
//! another queue's pool. [`RxPacket`] and [`TxPacket`] hold an `Arc` to their
//! origin pool and give the frame back on drop.
//!
//! # Exhaustion
//!
//! Unlike a general-purpose buffer pool there is no fallback allocation: an
//! empty pool returns `None` and the caller treats that as backpressure.
//!
//! # Example
//!
//! ```
//! use rawpath_core::backend::QueueId;
//! use rawpath_core::buffer_pool::FramePool;
//!
//! let pool = FramePool::new(QueueId(0), 2048, 4);
//! let frame = pool.acquire().unwrap();
//! assert_eq!(pool.available(), 3);
//! pool.release(frame);
//! assert_eq!(pool.available(), 4);
//! ```

use crate::backend::QueueId;
use crate::frame::{HeaderOptions, ParsedFrame, PacketType, WriteError, write_headers};
use crate::route::Route;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;

/// A fixed-size packet buffer owned by exactly one queue's pool.
pub struct Frame {
    data: Box<[u8]>,
    origin: QueueId,
}

impl Frame {
    /// Queue whose pool this frame belongs to.
    pub fn origin(&self) -> QueueId {
        self.origin
    }

    /// Buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The whole buffer, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("origin", &self.origin)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// A lock-free pool of pre-allocated frames for one queue.
pub struct FramePool {
    queue: QueueId,
    frames: ArrayQueue<Frame>,
    frame_size: usize,
}

impl FramePool {
    /// Create a pool of `count` frames of `frame_size` bytes.
    ///
    /// All frames are allocated here; create pools once at startup.
    pub fn new(queue: QueueId, frame_size: usize, count: usize) -> Arc<Self> {
        let frames = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let frame = Frame {
                data: vec![0u8; frame_size].into_boxed_slice(),
                origin: queue,
            };
            let _ = frames.push(frame);
        }
        Arc::new(Self {
            queue,
            frames,
            frame_size,
        })
    }

    /// Queue this pool belongs to.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Size of every frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Total frames owned by the pool.
    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Frames currently available.
    pub fn available(&self) -> usize {
        self.frames.len()
    }

    /// Take a frame, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Return a frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame was allocated by another queue's pool. That is a
    /// datapath bug, never a consequence of network input.
    pub fn release(&self, frame: Frame) {
        assert_eq!(
            frame.origin, self.queue,
            "frame from queue {} returned to pool of queue {}",
            frame.origin.0, self.queue.0
        );
        if self.frames.push(frame).is_err() {
            tracing::error!(queue = self.queue.0, "frame pool overflow, frame leaked");
        }
    }

    /// Allocate a TX packet with `backfill` bytes reserved for headers and
    /// room for `max_payload` bytes after them.
    pub fn alloc_tx(self: &Arc<Self>, backfill: usize, max_payload: usize) -> Option<TxPacket> {
        if backfill + max_payload > self.frame_size {
            return None;
        }
        let frame = self.acquire()?;
        Some(TxPacket {
            frame: Some(frame),
            pool: Arc::clone(self),
            backfill,
            start: backfill,
            len: max_payload,
            max_payload,
            framed: false,
            ecn: 0,
            dscp: 0,
        })
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("queue", &self.queue)
            .field("frame_size", &self.frame_size)
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A received frame, parsed and ready for the protocol engine.
///
/// Dropping the packet returns its frame to the RX pool of the queue it
/// arrived on.
pub struct RxPacket {
    frame: Option<Frame>,
    pool: Arc<FramePool>,
    offset: usize,
    len: usize,
    parsed: ParsedFrame,
    partition_index: u16,
}

impl RxPacket {
    pub(crate) fn new(
        frame: Frame,
        pool: Arc<FramePool>,
        offset: usize,
        len: usize,
        parsed: ParsedFrame,
        partition_index: u16,
    ) -> Self {
        Self {
            frame: Some(frame),
            pool,
            offset,
            len,
            parsed,
            partition_index,
        }
    }

    fn data(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => &frame.as_slice()[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    /// Route as seen from the local side.
    pub fn route(&self) -> &Route {
        &self.parsed.route
    }

    /// Mutable route, for the protocol engine to adopt into its path.
    pub fn route_mut(&mut self) -> &mut Route {
        &mut self.parsed.route
    }

    /// Transport classification.
    pub fn packet_type(&self) -> PacketType {
        self.parsed.packet_type
    }

    /// ECN bits from the IP header.
    pub fn ecn(&self) -> u8 {
        self.parsed.ecn
    }

    /// Full parse result.
    pub fn parsed(&self) -> &ParsedFrame {
        &self.parsed
    }

    /// Transport payload.
    pub fn payload(&self) -> &[u8] {
        let data = self.data();
        data.get(self.parsed.payload.clone()).unwrap_or(&[])
    }

    /// The complete Ethernet frame.
    pub fn frame_bytes(&self) -> &[u8] {
        self.data()
    }

    /// Partition that received the packet.
    pub fn partition_index(&self) -> u16 {
        self.partition_index
    }

    /// Queue the packet arrived on.
    pub fn queue(&self) -> QueueId {
        self.pool.queue()
    }
}

impl Drop for RxPacket {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.release(frame);
        }
    }
}

impl fmt::Debug for RxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPacket")
            .field("queue", &self.pool.queue())
            .field("type", &self.parsed.packet_type)
            .field("local", &self.parsed.route.local_address)
            .field("remote", &self.parsed.route.remote_address)
            .field("payload_len", &self.parsed.payload.len())
            .finish()
    }
}

/// An outbound packet with header backfill in front of its payload.
///
/// Dropping an unsent packet returns its frame to the TX pool.
pub struct TxPacket {
    frame: Option<Frame>,
    pool: Arc<FramePool>,
    backfill: usize,
    start: usize,
    len: usize,
    max_payload: usize,
    framed: bool,
    /// ECN codepoint written into the IP header
    pub ecn: u8,
    /// DSCP value written into the IP header
    pub dscp: u8,
}

impl TxPacket {
    /// Queue this packet will be sent on.
    pub fn queue(&self) -> QueueId {
        self.pool.queue()
    }

    /// Largest payload this packet can carry.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Current payload length.
    pub fn payload_len(&self) -> usize {
        if self.framed {
            self.start + self.len - self.backfill
        } else {
            self.len
        }
    }

    /// Set the payload length (clamped to [`Self::max_payload`]).
    pub fn set_payload_len(&mut self, len: usize) {
        if !self.framed {
            self.len = len.min(self.max_payload);
        }
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => &frame.as_slice()[self.backfill..self.backfill + self.payload_len()],
            None => &[],
        }
    }

    /// The payload region, mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = self.backfill..self.backfill + self.payload_len();
        match &mut self.frame {
            Some(frame) => &mut frame.as_mut_slice()[range],
            None => &mut [],
        }
    }

    /// Copy `data` into the payload and set the length.
    pub fn fill_payload(&mut self, data: &[u8]) {
        self.set_payload_len(data.len());
        let n = self.payload_len();
        self.payload_mut()[..n].copy_from_slice(&data[..n]);
    }

    /// Whether headers have been written.
    pub fn is_framed(&self) -> bool {
        self.framed
    }

    /// Prepend headers for `route` into the backfill.
    ///
    /// # Errors
    ///
    /// See [`write_headers`].
    pub fn write_headers(&mut self, route: &Route, options: &HeaderOptions) -> Result<(), WriteError> {
        let payload_len = self.payload_len();
        let backfill = self.backfill;
        let Some(frame) = self.frame.as_mut() else {
            return Ok(());
        };
        let start = write_headers(route, frame.as_mut_slice(), backfill, payload_len, options)?;
        self.start = start;
        self.len = backfill + payload_len - start;
        self.framed = true;
        Ok(())
    }

    /// The framed bytes (headers + payload) once written.
    pub fn frame_bytes(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => &frame.as_slice()[self.start..self.start + self.len],
            None => &[],
        }
    }

    /// Hand the frame to the backend.
    pub(crate) fn into_descriptor(mut self) -> Option<crate::backend::TxDescriptor> {
        let frame = self.frame.take()?;
        Some(crate::backend::TxDescriptor {
            frame,
            offset: self.start,
            len: self.len,
        })
    }
}

impl Drop for TxPacket {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.release(frame);
        }
    }
}

impl fmt::Debug for TxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPacket")
            .field("queue", &self.pool.queue())
            .field("payload_len", &self.payload_len())
            .field("framed", &self.framed)
            .finish()
    }
}
