//! The raw datapath.
//!
//! [`RawDatapath`] owns everything that lives for the lifetime of the
//! datapath: the backend, the per-queue pools, the socket pool, the route
//! resolver and the partition threads. The protocol engine creates sockets,
//! resolves routes and sends through it; received packets come back through
//! the [`ReceiveHandler`] on partition threads.
//!
//! ```text
//!   protocol engine
//!     │ socket_create / send_alloc / send_enqueue / resolve_route
//!     ▼
//!   RawDatapath ──▶ SocketPool    RouteResolver ──▶ NetworkStack
//!     │                 ▲
//!     ▼                 │ demux
//!   Queue[n] ◀──▶ Partition threads ◀──▶ RawBackend rings
//! ```

mod rx;
mod tcp;

use crate::backend::{QueueId, RawBackend};
use crate::buffer_pool::{RxPacket, TxPacket};
use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::frame::{HeaderOptions, TcpFlags, calculate_header_backfill};
use crate::netstack::NetworkStack;
use crate::partition::{Partition, PartitionHandle, PartitionWaker, assign_queues};
use crate::queue::{Queue, QueueStatsSnapshot};
use crate::resolver::{QueueAssigner, ResolveStatus, RouteCallback, RouteCompletion, RouteResolver};
use crate::route::Route;
use crate::socket::{MAX_CIBIR_ID_LENGTH, PortReservation, RawSocket, SocketConfig, unspecified_like};
use crate::socket_pool::SocketPool;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// How long [`RawDatapath::socket_close`] waits for in-flight receives.
pub const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made to find a free ephemeral port without OS reservation.
const EPHEMERAL_PORT_ATTEMPTS: usize = 16;

/// Receives chains of packets demultiplexed to a socket.
///
/// Called on partition threads. Packets return to their pool when dropped.
pub type ReceiveHandler = Box<dyn Fn(&Arc<RawSocket>, Vec<RxPacket>) + Send + Sync + 'static>;

/// State shared between the datapath handle and its partitions.
pub(crate) struct Shared {
    pub(crate) config: DatapathConfig,
    pub(crate) backend: Arc<dyn RawBackend>,
    pub(crate) queues: Vec<Arc<Queue>>,
    pub(crate) wakers: Vec<Arc<PartitionWaker>>,
    pub(crate) sockets: SocketPool,
    receive: ReceiveHandler,
    pub(crate) running: AtomicBool,
    pub(crate) polling_idle_timeout_us: AtomicU64,
}

impl Shared {
    pub(crate) fn queue(&self, id: QueueId) -> Option<&Arc<Queue>> {
        self.queues.get(id.0 as usize)
    }

    /// Allocate a TX packet on the route's queue with backfill for the
    /// socket's framing.
    pub(crate) fn alloc(
        &self,
        socket: &RawSocket,
        route: &Route,
        max_payload: usize,
        ecn: u8,
    ) -> Option<TxPacket> {
        let Some(queue) = route.queue.and_then(|id| self.queue(id)) else {
            tracing::debug!(
                socket = socket.id(),
                remote = %route.remote_address,
                "Send allocation on unresolved route"
            );
            return None;
        };
        let is_ipv6 = route.remote_address.ip().to_canonical().is_ipv6();
        let backfill = calculate_header_backfill(is_ipv6, socket.use_tcp());
        if backfill + max_payload > queue.tx_pool().frame_size() {
            tracing::debug!(
                socket = socket.id(),
                max_payload,
                frame_size = queue.tx_pool().frame_size(),
                "Send allocation larger than a frame"
            );
            return None;
        }
        match queue.tx_pool().alloc_tx(backfill, max_payload) {
            Some(mut packet) => {
                packet.ecn = ecn;
                Some(packet)
            }
            None => {
                queue.stats().record_pool_exhausted();
                tracing::trace!(queue = queue.id().0, "TX pool exhausted");
                None
            }
        }
    }

    /// Write headers for `route` into `packet` and queue it for transmit.
    pub(crate) fn frame_and_enqueue(
        &self,
        socket: &RawSocket,
        route: &Route,
        mut packet: TxPacket,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
    ) -> Result<()> {
        self.frame(socket, route, &mut packet, seq, ack, flags)?;
        self.enqueue(packet);
        Ok(())
    }

    /// Write headers for `route` into `packet`.
    pub(crate) fn frame(
        &self,
        socket: &RawSocket,
        route: &Route,
        packet: &mut TxPacket,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
    ) -> Result<()> {
        let offloads = self
            .queue(packet.queue())
            .map(|queue| queue.offloads())
            .unwrap_or_default();
        let options = HeaderOptions {
            use_tcp: socket.use_tcp(),
            ecn: packet.ecn,
            dscp: packet.dscp,
            flow_label: socket.flow_label(),
            skip_l3_checksum: self.config.skip_checksum.l3 || offloads.l3,
            skip_l4_checksum: self.config.skip_checksum.l4 || offloads.l4,
            seq,
            ack,
            flags,
        };
        packet.write_headers(route, &options)?;
        Ok(())
    }

    /// Hand a framed packet to its queue's partition.
    pub(crate) fn enqueue(&self, packet: TxPacket) {
        if !packet.is_framed() {
            tracing::debug!(queue = packet.queue().0, "Dropping unframed packet");
            return;
        }
        let Some(queue) = self.queue(packet.queue()) else {
            return;
        };
        let Some(descriptor) = packet.into_descriptor() else {
            return;
        };
        queue.push_pending(descriptor);
        if let Some(waker) = self.wakers.get(usize::from(queue.partition_index())) {
            waker.wake();
        }
    }
}

/// Kernel-bypass datapath.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use rawpath_core::{DatapathConfig, RawBackend, RawDatapath, NetworkStack, SocketConfig};
/// # fn demo(backend: Arc<dyn RawBackend>, stack: Arc<dyn NetworkStack>) -> rawpath_core::Result<()> {
/// let datapath = RawDatapath::new(
///     DatapathConfig::default(),
///     backend,
///     stack,
///     |socket, packets| {
///         for packet in packets {
///             println!("{} bytes for socket {}", packet.payload().len(), socket.id());
///         }
///     },
/// )?;
/// datapath.start()?;
///
/// let socket = datapath.socket_create(SocketConfig {
///     local_address: Some("0.0.0.0:4433".parse().unwrap()),
///     ..SocketConfig::default()
/// })?;
/// datapath.socket_close(&socket);
/// datapath.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct RawDatapath {
    shared: Arc<Shared>,
    stack: Arc<dyn NetworkStack>,
    resolver: RouteResolver,
    assignment: Vec<Vec<QueueId>>,
    partitions: Mutex<Vec<PartitionHandle>>,
    shut_down: AtomicBool,
}

impl RawDatapath {
    /// Bind every backend queue and prepare partitions.
    ///
    /// Partitions do not run until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Invalid configuration, a backend with no queues, a queue that fails
    /// to bind, or an OS stack that cannot list its interfaces.
    pub fn new<F>(
        config: DatapathConfig,
        backend: Arc<dyn RawBackend>,
        stack: Arc<dyn NetworkStack>,
        receive: F,
    ) -> Result<Self>
    where
        F: Fn(&Arc<RawSocket>, Vec<RxPacket>) + Send + Sync + 'static,
    {
        config.validate()?;

        let layout = backend.queue_layout();
        if layout.is_empty() {
            return Err(DatapathError::NotFound(format!(
                "backend {} exposes no queues",
                backend.name()
            )));
        }

        let assignment = assign_queues(layout.len(), config.partition_count);
        let mut partition_of = vec![0u16; layout.len()];
        for (partition, ids) in assignment.iter().enumerate() {
            for id in ids {
                partition_of[id.0 as usize] = partition as u16;
            }
        }

        let mut queues = Vec::with_capacity(layout.len());
        for (i, hw) in layout.into_iter().enumerate() {
            let id = QueueId(i as u32);
            backend.bind(id, hw, config.bind_flags)?;
            let offloads = backend.offloads(id);
            tracing::debug!(
                queue = id.0,
                interface = hw.interface_index,
                hw_queue = hw.hw_queue,
                partition = partition_of[i],
                l3_offload = offloads.l3,
                l4_offload = offloads.l4,
                "Queue bound"
            );
            queues.push(Arc::new(Queue::new(
                id,
                hw,
                partition_of[i],
                config.max_frame_size,
                config.rx_buffer_count,
                config.tx_buffer_count,
                offloads,
            )));
        }

        let interfaces: HashMap<_, _> = stack
            .interfaces()?
            .into_iter()
            .map(|interface| (interface.index, interface.mac))
            .collect();
        let assigner = QueueAssigner::new(queues.iter().map(|q| (q.hw().interface_index, q.id())));
        let resolver = RouteResolver::new(Arc::clone(&stack), interfaces, assigner)?;

        let wakers = (0..assignment.len()).map(|_| PartitionWaker::new()).collect();
        let shared = Arc::new(Shared {
            polling_idle_timeout_us: AtomicU64::new(config.polling_idle_timeout_us),
            config,
            backend,
            queues,
            wakers,
            sockets: SocketPool::new(),
            receive: Box::new(receive),
            running: AtomicBool::new(false),
        });

        tracing::info!(
            backend = shared.backend.name(),
            queues = shared.queues.len(),
            partitions = assignment.len(),
            "Raw datapath initialized"
        );

        Ok(Self {
            shared,
            stack,
            resolver,
            assignment,
            partitions: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the partition threads.
    ///
    /// # Errors
    ///
    /// [`DatapathError::InvalidState`] if already running,
    /// [`DatapathError::ShuttingDown`] after [`Self::shutdown`], or the
    /// thread spawn error.
    pub fn start(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DatapathError::ShuttingDown);
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DatapathError::InvalidState(
                "datapath already running".to_string(),
            ));
        }

        let cpus = num_cpus::get().max(1);
        let mut handles = Vec::with_capacity(self.assignment.len());
        for (index, ids) in self.assignment.iter().enumerate() {
            let queues = ids
                .iter()
                .filter_map(|id| self.shared.queue(*id).cloned())
                .collect();
            let cpu = self.shared.config.cpu_affinity.then_some(index % cpus);
            let partition = Partition::new(
                index as u16,
                cpu,
                Arc::clone(&self.shared),
                Arc::clone(&self.shared.wakers[index]),
                queues,
            );
            match partition.spawn() {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shared.running.store(false, Ordering::Release);
                    stop_partitions(handles);
                    return Err(e.into());
                }
            }
        }

        *self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;
        tracing::info!(partitions = self.assignment.len(), "Raw datapath started");
        Ok(())
    }

    /// Stop partitions and the resolver. Idempotent.
    ///
    /// Pending route resolutions complete with failure. Packets still queued
    /// for transmit are returned to their pools.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        let handles = std::mem::take(
            &mut *self
                .partitions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for waker in &self.shared.wakers {
            waker.wake();
        }
        stop_partitions(handles);
        self.resolver.shutdown();
        tracing::info!(sockets = self.shared.sockets.len(), "Raw datapath stopped");
    }

    /// Whether partitions are running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Create a socket.
    ///
    /// A socket with a remote address is connected; anything else is a
    /// wildcard listener matching every remote on its port. Port 0 picks a
    /// port. NIC steering rules are installed before returning.
    ///
    /// # Errors
    ///
    /// [`DatapathError::InvalidParameter`] for an unspecified remote or an
    /// oversized CIBIR id, [`DatapathError::AddressInUse`] when the address
    /// conflicts with an existing socket or OS port, and backend errors
    /// from rule installation.
    pub fn socket_create(&self, config: SocketConfig) -> Result<Arc<RawSocket>> {
        if let Some(cibir) = &config.cibir {
            if cibir.id.is_empty() || cibir.id.len() > MAX_CIBIR_ID_LENGTH {
                return Err(DatapathError::InvalidParameter(format!(
                    "CIBIR id must be 1..={MAX_CIBIR_ID_LENGTH} bytes, got {}",
                    cibir.id.len()
                )));
            }
        }
        if let Some(remote) = config.remote_address {
            if remote.ip().is_unspecified() || remote.port() == 0 {
                return Err(DatapathError::InvalidParameter(format!(
                    "remote address {remote} is a wildcard"
                )));
            }
        }

        let mut local = config
            .local_address
            .unwrap_or_else(|| SocketAddr::new(unspecified_like(config.remote_address.as_ref()), 0));

        let socket = if self.shared.config.reserve_os_ports {
            // CIBIR sockets share the port with other CIBIR ids.
            let (reservation, assigned) = PortReservation::reserve(
                local,
                config.remote_address,
                config.use_tcp,
                config.cibir.is_some(),
            )
            .map_err(|e| reservation_error(e, local))?;
            if config.remote_address.is_some() && local.ip().is_unspecified() {
                local.set_ip(assigned.ip());
            }
            local.set_port(assigned.port());
            let socket = Arc::new(RawSocket::new(
                local,
                config.remote_address,
                config.use_tcp,
                config.cibir.clone(),
                config.context,
                Some(reservation),
            ));
            self.shared.sockets.try_add(Arc::clone(&socket))?;
            socket
        } else {
            if let Some(remote) = config.remote_address {
                if local.ip().is_unspecified() {
                    let best = self.stack.best_route(remote.ip().to_canonical(), None)?;
                    local.set_ip(best.local_ip);
                }
            }
            self.add_without_reservation(local, &config)?
        };

        if let Err(e) = self.install_rules(&socket) {
            self.shared.sockets.remove(&socket);
            return Err(e);
        }

        tracing::debug!(
            socket = socket.id(),
            local = %socket.local_address(),
            remote = ?socket.remote_address(),
            tcp = socket.use_tcp(),
            "Socket created"
        );
        Ok(socket)
    }

    fn add_without_reservation(
        &self,
        local: SocketAddr,
        config: &SocketConfig,
    ) -> Result<Arc<RawSocket>> {
        let build = |local: SocketAddr| {
            Arc::new(RawSocket::new(
                local,
                config.remote_address,
                config.use_tcp,
                config.cibir.clone(),
                config.context,
                None,
            ))
        };

        if local.port() != 0 {
            let socket = build(local);
            self.shared.sockets.try_add(Arc::clone(&socket))?;
            return Ok(socket);
        }

        for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
            let port = self
                .shared
                .sockets
                .ephemeral_port()
                .ok_or(DatapathError::AddressInUse(local))?;
            let socket = build(SocketAddr::new(local.ip(), port));
            match self.shared.sockets.try_add(Arc::clone(&socket)) {
                Ok(()) => return Ok(socket),
                Err(DatapathError::AddressInUse(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DatapathError::AddressInUse(local))
    }

    fn install_rules(&self, socket: &RawSocket) -> Result<()> {
        let rules = socket.steering_rules();
        for (i, rule) in rules.iter().enumerate() {
            if let Err(e) = self.shared.backend.install_rule(rule) {
                tracing::warn!(socket = socket.id(), ?rule, error = %e, "Rule install failed");
                for installed in &rules[..i] {
                    let _ = self.shared.backend.remove_rule(installed);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Close a socket.
    ///
    /// Removes it from the pool and the NIC, waits for in-flight receive
    /// callbacks, frees a send paused on the TCP handshake and sends the
    /// cached RST. Closing a socket twice is a no-op.
    pub fn socket_close(&self, socket: &Arc<RawSocket>) {
        if !self.shared.sockets.remove(socket) {
            return;
        }
        for rule in socket.steering_rules() {
            if let Err(e) = self.shared.backend.remove_rule(&rule) {
                tracing::warn!(socket = socket.id(), ?rule, error = %e, "Rule removal failed");
            }
        }
        socket.rundown.release_and_wait(SOCKET_CLOSE_TIMEOUT);

        drop(
            socket
                .paused_send
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let rst = socket
            .cached_rst
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rst) = rst {
            tracing::debug!(socket = socket.id(), "Sending cached RST");
            self.shared.enqueue(rst);
        }
        tracing::debug!(socket = socket.id(), "Socket closed");
    }

    /// Allocate a packet for `route` with room for `max_payload` bytes.
    ///
    /// Returns `None` when the route has no queue, the payload cannot fit
    /// a frame, or the queue's TX pool is exhausted.
    pub fn send_alloc(
        &self,
        socket: &RawSocket,
        route: &Route,
        max_payload: usize,
        ecn: u8,
    ) -> Option<TxPacket> {
        self.shared.alloc(socket, route, max_payload, ecn)
    }

    /// Frame `packet` for `route` and queue it on the route's partition.
    ///
    /// On a connected TCP-disguise socket whose route has not synchronized
    /// its sequence space, the packet is held until the handshake completes
    /// and a SYN goes out instead.
    ///
    /// # Errors
    ///
    /// [`DatapathError::InvalidParameter`] for an unresolved route and
    /// [`DatapathError::Framing`] when headers do not fit. The packet is
    /// freed in both cases.
    pub fn send_enqueue(&self, socket: &RawSocket, route: &Route, packet: TxPacket) -> Result<()> {
        if !route.is_resolved() {
            return Err(DatapathError::InvalidParameter(format!(
                "route to {} is not resolved",
                route.remote_address
            )));
        }

        if socket.use_tcp() && socket.is_connected() && !route.tcp_state.syncd {
            let previous = socket
                .paused_send
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(packet);
            drop(previous);
            self.shared.send_syn(socket, route);
            return Ok(());
        }

        let flags = if socket.use_tcp() {
            TcpFlags::from_bits(TcpFlags::ACK)
        } else {
            TcpFlags::empty()
        };
        tracing::trace!(
            socket = socket.id(),
            len = packet.payload_len(),
            remote = %route.remote_address,
            "Send"
        );
        self.shared.frame_and_enqueue(
            socket,
            route,
            packet,
            route.tcp_state.sequence_number,
            route.tcp_state.ack_number,
            flags,
        )
    }

    /// Return an unsent packet to its pool.
    pub fn send_free(&self, packet: TxPacket) {
        drop(packet);
    }

    /// Resolve `route` for `socket`.
    ///
    /// A route without a remote address inherits the connected socket's
    /// remote, and local port 0 takes the socket's port. See
    /// [`RouteResolver::resolve`] for the callback contract.
    pub fn resolve_route(
        &self,
        socket: &RawSocket,
        route: &mut Route,
        path_id: u8,
        callback: RouteCallback,
    ) -> ResolveStatus {
        prepare_route(socket, route);
        self.resolver.resolve(route, path_id, callback)
    }

    /// Resolve `route` and wait for the outcome.
    pub async fn resolve_route_async(
        &self,
        socket: &RawSocket,
        route: &mut Route,
        path_id: u8,
    ) -> RouteCompletion {
        prepare_route(socket, route);
        self.resolver.resolve_async(route, path_id).await
    }

    /// Adopt the queue and TCP sequence space of a received packet's route.
    pub fn update_route(&self, dst: &mut Route, src: &Route) {
        crate::route::update_route(dst, src);
    }

    /// Change how long partitions poll before parking.
    pub fn update_polling_idle_timeout(&self, micros: u64) {
        self.shared
            .polling_idle_timeout_us
            .store(micros, Ordering::Relaxed);
        for waker in &self.shared.wakers {
            waker.wake();
        }
        tracing::debug!(micros, "Polling idle timeout updated");
    }

    /// Current polling idle timeout in microseconds.
    pub fn polling_idle_timeout_us(&self) -> u64 {
        self.shared.polling_idle_timeout_us.load(Ordering::Relaxed)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DatapathConfig {
        &self.shared.config
    }

    /// Queues, indexed by [`QueueId`].
    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.shared.queues
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.assignment.len()
    }

    /// Sockets currently open.
    pub fn sockets(&self) -> Vec<Arc<RawSocket>> {
        self.shared.sockets.sockets()
    }

    /// Per-queue statistics.
    pub fn queue_stats(&self) -> Vec<(QueueId, QueueStatsSnapshot)> {
        self.shared
            .queues
            .iter()
            .map(|queue| (queue.id(), queue.stats().snapshot()))
            .collect()
    }

    /// Statistics summed over every queue.
    pub fn stats(&self) -> QueueStatsSnapshot {
        let mut total = QueueStatsSnapshot::default();
        for queue in &self.shared.queues {
            total.merge(&queue.stats().snapshot());
        }
        total
    }
}

impl Drop for RawDatapath {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RawDatapath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDatapath")
            .field("backend", &self.shared.backend.name())
            .field("queues", &self.shared.queues.len())
            .field("partitions", &self.assignment.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn prepare_route(socket: &RawSocket, route: &mut Route) {
    if let Some(remote) = socket.remote_address() {
        if route.remote_address.ip().is_unspecified() {
            route.remote_address = remote;
        }
    }
    if route.local_address.port() == 0 {
        route.local_address.set_port(socket.local_address().port());
    }
    if route.local_address.ip().is_unspecified() && !socket.local_address().ip().is_unspecified() {
        route.local_address.set_ip(socket.local_address().ip());
    }
}

fn reservation_error(error: io::Error, local: SocketAddr) -> DatapathError {
    if error.kind() == io::ErrorKind::AddrInUse {
        DatapathError::AddressInUse(local)
    } else {
        DatapathError::Io(error)
    }
}

fn stop_partitions(handles: Vec<PartitionHandle>) {
    for handle in &handles {
        handle.waker.wake();
    }
    for handle in handles {
        if handle.thread.join().is_err() {
            tracing::error!(partition = handle.index, "Partition thread panicked");
        }
    }
}
