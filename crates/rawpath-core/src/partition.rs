//! Worker partitions.
//!
//! A partition is one OS thread that owns a disjoint set of queues and
//! services them in a hybrid loop: it polls while there is work and, once
//! nothing has happened for `polling_idle_timeout_us`, arms backend
//! notifications on every queue and parks until woken.
//!
//! ```text
//!  ┌───────────────── execute ─────────────────┐
//!  │ for each queue:                           │
//!  │   RX ring ─▶ parse ─▶ demux ─▶ callback   │
//!  │   pool ─▶ fill ring                       │
//!  │   completion ring ─▶ pool                 │
//!  │   pending ─▶ partition list ─▶ TX ring    │
//!  │ idle long enough? arm + park              │
//!  └───────────────────────────────────────────┘
//! ```

use crate::backend::{NotifyDirection, NotifyOutcome, QueueId, RxDescriptor, TxDescriptor};
use crate::buffer_pool::{Frame, RxPacket};
use crate::datapath::Shared;
use crate::error::BackendError;
use crate::frame::parse_ethernet;
use crate::queue::Queue;
use crate::route::RouteState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Wakes a parked partition thread.
///
/// Backends receive one through [`crate::backend::RawBackend::notify_async`]
/// and call [`PartitionWaker::wake`] when the armed ring becomes ready.
#[derive(Debug, Default)]
pub struct PartitionWaker {
    ready: AtomicBool,
    thread: OnceLock<Thread>,
}

impl PartitionWaker {
    /// New waker not yet attached to a thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal the partition. Safe to call from any thread, any number of
    /// times.
    pub fn wake(&self) {
        self.ready.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Whether a wake is pending.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn attach(&self) {
        let _ = self.thread.set(thread::current());
    }

    fn wait(&self) {
        while !self.ready.swap(false, Ordering::AcqRel) {
            thread::park();
        }
    }

    fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

/// Handle to a running partition thread.
#[derive(Debug)]
pub(crate) struct PartitionHandle {
    pub(crate) index: u16,
    pub(crate) waker: Arc<PartitionWaker>,
    pub(crate) thread: JoinHandle<()>,
}

/// Per-queue state private to the partition.
struct QueueContext {
    queue: Arc<Queue>,
    tx_partition: Vec<TxDescriptor>,
}

pub(crate) struct Partition {
    index: u16,
    cpu: Option<usize>,
    shared: Arc<Shared>,
    waker: Arc<PartitionWaker>,
    queues: Vec<QueueContext>,
    rx_scratch: Vec<RxDescriptor>,
    completion_scratch: Vec<Frame>,
    last_work: Instant,
}

impl Partition {
    pub(crate) fn new(
        index: u16,
        cpu: Option<usize>,
        shared: Arc<Shared>,
        waker: Arc<PartitionWaker>,
        queues: Vec<Arc<Queue>>,
    ) -> Self {
        Self {
            index,
            cpu,
            shared,
            waker,
            queues: queues
                .into_iter()
                .map(|queue| QueueContext {
                    queue,
                    tx_partition: Vec::new(),
                })
                .collect(),
            rx_scratch: Vec::new(),
            completion_scratch: Vec::new(),
            last_work: Instant::now(),
        }
    }

    /// Start the partition on its own thread.
    pub(crate) fn spawn(self) -> std::io::Result<PartitionHandle> {
        let index = self.index;
        let waker = Arc::clone(&self.waker);
        let thread = thread::Builder::new()
            .name(format!("rawpath-partition-{index}"))
            .spawn(move || self.run())?;
        Ok(PartitionHandle {
            index,
            waker,
            thread,
        })
    }

    fn run(mut self) {
        self.waker.attach();
        if let Some(cpu) = self.cpu {
            match pin_to_cpu(cpu) {
                Ok(()) => tracing::debug!(partition = self.index, cpu, "Partition pinned"),
                Err(e) => tracing::warn!(partition = self.index, cpu, error = %e, "CPU pinning failed"),
            }
        }
        tracing::debug!(
            partition = self.index,
            queues = self.queues.len(),
            "Partition started"
        );

        while self.execute() {}

        self.drain();
        tracing::debug!(partition = self.index, "Partition stopped");
    }

    /// One iteration of the poll loop. Returns `false` when the datapath
    /// stops.
    pub(crate) fn execute(&mut self) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }

        let mut did_work = false;
        for i in 0..self.queues.len() {
            did_work |= self.service_queue(i);
        }

        let now = Instant::now();
        if did_work {
            self.last_work = now;
            return true;
        }

        let timeout =
            Duration::from_micros(self.shared.polling_idle_timeout_us.load(Ordering::Relaxed));
        if now.duration_since(self.last_work) < timeout {
            return true;
        }

        self.waker.clear();
        if self.arm_notifications() {
            self.last_work = Instant::now();
            return true;
        }
        if self.shared.running.load(Ordering::Acquire) {
            self.waker.wait();
        }
        self.last_work = Instant::now();
        true
    }

    /// Returns `true` if any queue already has work.
    fn arm_notifications(&self) -> bool {
        let backend = &self.shared.backend;
        let mut immediate = false;
        for ctx in &self.queues {
            let id = ctx.queue.id();
            for direction in [NotifyDirection::Rx, NotifyDirection::Tx] {
                match backend.notify_async(id, direction, Arc::clone(&self.waker)) {
                    Ok(NotifyOutcome::Immediate) => immediate = true,
                    Ok(NotifyOutcome::Pending) => {}
                    Err(e) => {
                        report_error(&ctx.queue, "notify", &e);
                        immediate = true;
                    }
                }
            }
        }
        immediate || ctx_has_pending(&self.queues)
    }

    fn service_queue(&mut self, i: usize) -> bool {
        let received = self.receive(i);
        let refilled = self.refill(i);
        let completed = self.complete(i);
        let submitted = self.transmit(i);
        received > 0 || refilled > 0 || completed > 0 || submitted > 0
    }

    fn receive(&mut self, i: usize) -> usize {
        let queue = Arc::clone(&self.queues[i].queue);
        let id = queue.id();
        let backend = &self.shared.backend;

        self.rx_scratch.clear();
        let count =
            match backend.rx_reserve(id, self.shared.config.rx_batch_size, &mut self.rx_scratch) {
                Ok(count) => count,
                Err(e) => {
                    report_error(&queue, "rx_reserve", &e);
                    return 0;
                }
            };
        if count == 0 {
            return 0;
        }

        let mut packets = Vec::with_capacity(count);
        for descriptor in self.rx_scratch.drain(..) {
            if let Some(packet) = build_rx_packet(&queue, self.index, descriptor) {
                packets.push(packet);
            }
        }
        backend.rx_release(id, count);

        if !packets.is_empty() {
            self.shared.on_packets_received(packets);
        }
        count
    }

    fn refill(&mut self, i: usize) -> usize {
        let queue = &self.queues[i].queue;
        let id = queue.id();
        let backend = &self.shared.backend;

        let space = backend.fill_ring_space(id).min(queue.rx_pool.available());
        if space == 0 {
            return 0;
        }
        let mut frames: Vec<Frame> = (0..space).map_while(|_| queue.rx_pool.acquire()).collect();
        let offered = frames.len();
        if let Err(e) = backend.fill_submit(id, &mut frames) {
            report_error(queue, "fill_submit", &e);
        }
        let refilled = offered - frames.len();
        for frame in frames {
            queue.rx_pool.release(frame);
        }
        refilled
    }

    fn complete(&mut self, i: usize) -> usize {
        let queue = &self.queues[i].queue;
        let id = queue.id();
        let backend = &self.shared.backend;

        self.completion_scratch.clear();
        let count = match backend.tx_completions_reserve(
            id,
            queue.tx_pool.capacity(),
            &mut self.completion_scratch,
        ) {
            Ok(count) => count,
            Err(e) => {
                report_error(queue, "tx_completions_reserve", &e);
                return 0;
            }
        };
        for frame in self.completion_scratch.drain(..) {
            queue.tx_pool.release(frame);
        }
        if count > 0 {
            backend.tx_completions_release(id, count);
            queue.stats().record_completions(count as u64);
        }
        count
    }

    fn transmit(&mut self, i: usize) -> usize {
        let ctx = &mut self.queues[i];
        let queue = &ctx.queue;
        let id = queue.id();
        let backend = &self.shared.backend;

        queue.take_pending(&mut ctx.tx_partition);
        if ctx.tx_partition.is_empty() {
            return 0;
        }

        let slots = backend
            .tx_reserve(id, ctx.tx_partition.len())
            .min(ctx.tx_partition.len());
        if slots < ctx.tx_partition.len() {
            queue.stats().record_tx_ring_full();
        }
        if slots == 0 {
            return 0;
        }

        let mut batch: Vec<TxDescriptor> = ctx.tx_partition.drain(..slots).collect();
        let offered_bytes: usize = batch.iter().map(|d| d.len).sum();
        let result = backend.tx_submit(id, &mut batch);
        let submitted = slots - batch.len();
        let sent_bytes = offered_bytes - batch.iter().map(|d| d.len).sum::<usize>();
        if let Err(e) = result {
            report_error(queue, "tx_submit", &e);
            for descriptor in batch {
                queue.tx_pool.release(descriptor.frame);
            }
        } else if !batch.is_empty() {
            // Partial accept: the rest goes back to the head of the list.
            batch.append(&mut ctx.tx_partition);
            ctx.tx_partition = batch;
        }

        if submitted > 0 {
            queue.stats().record_tx(submitted as u64, sent_bytes as u64);
            if backend.needs_wakeup(id) || self.shared.config.tx_always_poke {
                queue.stats().record_wakeup();
                if let Err(e) = backend.poke_tx(id) {
                    report_error(queue, "poke_tx", &e);
                }
            }
        }
        submitted
    }

    /// Return partition-private TX frames to their pool on exit.
    fn drain(&mut self) {
        for ctx in &mut self.queues {
            queue_drain(&ctx.queue, &mut ctx.tx_partition);
        }
    }
}

fn queue_drain(queue: &Queue, list: &mut Vec<TxDescriptor>) {
    queue.take_pending(list);
    for descriptor in list.drain(..) {
        queue.tx_pool.release(descriptor.frame);
    }
}

fn ctx_has_pending(queues: &[QueueContext]) -> bool {
    queues
        .iter()
        .any(|ctx| !ctx.tx_partition.is_empty() || ctx.queue.pending_len() > 0)
}

fn build_rx_packet(queue: &Arc<Queue>, partition: u16, descriptor: RxDescriptor) -> Option<RxPacket> {
    let RxDescriptor { frame, offset, len } = descriptor;
    let parsed = frame
        .as_slice()
        .get(offset..offset.saturating_add(len))
        .map(parse_ethernet);

    match parsed {
        Some(Ok(mut parsed)) => {
            parsed.route.state = RouteState::Resolved;
            parsed.route.queue = Some(queue.id());
            queue.stats().record_rx(1, len as u64);
            Some(RxPacket::new(
                frame,
                Arc::clone(&queue.rx_pool),
                offset,
                len,
                parsed,
                partition,
            ))
        }
        Some(Err(e)) => {
            if !e.is_noise() {
                queue.stats().record_parse_drop();
            }
            tracing::trace!(queue = queue.id().0, error = %e, "Dropping frame");
            queue.rx_pool.release(frame);
            None
        }
        None => {
            queue.stats().record_parse_drop();
            tracing::trace!(queue = queue.id().0, offset, len, "Descriptor outside frame");
            queue.rx_pool.release(frame);
            None
        }
    }
}

fn report_error(queue: &Queue, operation: &'static str, error: &BackendError) {
    if queue.mark_errored() {
        tracing::warn!(
            queue = queue.id().0,
            operation,
            error = %error,
            "Backend error, queue continues best effort"
        );
    } else {
        tracing::trace!(queue = queue.id().0, operation, error = %error, "Backend error");
    }
}

/// Queue ids assigned round-robin to `partitions` partitions.
pub(crate) fn assign_queues(queue_count: usize, partitions: usize) -> Vec<Vec<QueueId>> {
    let partitions = partitions.max(1);
    let mut assignment = vec![Vec::new(); partitions.min(queue_count.max(1))];
    let len = assignment.len();
    for q in 0..queue_count {
        assignment[q % len].push(QueueId(q as u32));
    }
    assignment
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is its empty set. CPU_SET
    // bounds-checks against the set size and sched_setaffinity only reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "CPU affinity requires Linux",
    ))
}
