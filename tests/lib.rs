//! Shared harness for the integration tests.
//!
//! A [`Node`] is one datapath running over a [`LoopbackBackend`] with a
//! [`StaticNetworkStack`] that knows a single peer. Two nodes can be wired
//! back to back, or a node can run alone with its transmissions captured.

use rawpath_core::frame::{HeaderOptions, calculate_header_backfill, write_headers};
use rawpath_core::{
    DatapathConfig, MacAddress, NeighborState, PacketType, QueueId, RawDatapath, Route,
};
use rawpath_transport::{LoopbackBackend, LoopbackConfig, StaticNetworkStack, TransmittedFrame};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// MAC of the node at 10.0.0.1
pub const SERVER_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
/// MAC of the node at 10.0.0.2
pub const CLIENT_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

/// How long tests wait for asynchronous effects.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Offset of the TCP header in an IPv4 frame
const TCP_OFFSET: usize = 14 + 20;

/// What the receive handler saw.
#[derive(Debug, Clone)]
pub struct Received {
    /// Socket the packet was delivered to
    pub socket: u32,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Route parsed from the packet
    pub route: Route,
    /// Transport classification
    pub packet_type: PacketType,
}

/// A running datapath and its surroundings.
pub struct Node {
    /// The datapath
    pub datapath: RawDatapath,
    /// Its backend
    pub backend: Arc<LoopbackBackend>,
    /// Its network stack
    pub stack: Arc<StaticNetworkStack>,
    /// Packets delivered to sockets
    pub received: mpsc::Receiver<Received>,
}

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small configuration suitable for tests.
pub fn test_config() -> DatapathConfig {
    DatapathConfig {
        partition_count: 1,
        rx_buffer_count: 128,
        tx_buffer_count: 128,
        polling_idle_timeout_us: 200,
        reserve_os_ports: false,
        ..DatapathConfig::default()
    }
}

impl Node {
    /// Start a node at `ip` that knows `peer_ip` is reachable at `peer_mac`.
    pub fn start(
        ip: &str,
        mac: MacAddress,
        peer_ip: &str,
        peer_mac: MacAddress,
        config: DatapathConfig,
        queue_count: u32,
    ) -> Self {
        init_tracing();
        let ip: IpAddr = ip.parse().unwrap();
        let backend = LoopbackBackend::new(LoopbackConfig {
            queue_count,
            ..LoopbackConfig::default()
        })
        .unwrap();
        let stack = Arc::new(StaticNetworkStack::single_interface(1, mac, queue_count, ip));
        stack.add_neighbor(peer_ip.parse().unwrap(), 1, peer_mac, NeighborState::Reachable);

        let (tx, received) = mpsc::channel();
        let datapath = RawDatapath::new(
            config,
            backend.clone(),
            stack.clone(),
            move |socket, packets| {
                for packet in packets {
                    let _ = tx.send(Received {
                        socket: socket.id(),
                        payload: packet.payload().to_vec(),
                        route: packet.route().clone(),
                        packet_type: packet.packet_type(),
                    });
                }
            },
        )
        .unwrap();
        datapath.start().unwrap();

        let node = Self {
            datapath,
            backend,
            stack,
            received,
        };
        for q in 0..queue_count {
            node.wait_for_fill(QueueId(q));
        }
        node
    }

    /// The node at 10.0.0.1.
    pub fn server() -> Self {
        Self::start("10.0.0.1", SERVER_MAC, "10.0.0.2", CLIENT_MAC, test_config(), 1)
    }

    /// The node at 10.0.0.2.
    pub fn client() -> Self {
        Self::start("10.0.0.2", CLIENT_MAC, "10.0.0.1", SERVER_MAC, test_config(), 1)
    }

    /// Wait until the partition has posted receive buffers on `queue`.
    pub fn wait_for_fill(&self, queue: QueueId) {
        assert!(
            wait_until(|| self.backend.fill_level(queue) > 0),
            "queue {queue} never posted receive buffers"
        );
    }

    /// Next delivered packet.
    pub fn recv(&self) -> Received {
        self.received
            .recv_timeout(TIMEOUT)
            .expect("no packet delivered")
    }

    /// Wait for `count` captured transmissions.
    pub fn transmitted(&self, count: usize) -> Vec<TransmittedFrame> {
        let mut frames = Vec::new();
        let deadline = Instant::now() + TIMEOUT;
        while frames.len() < count && Instant::now() < deadline {
            frames.extend(self.backend.take_transmitted());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(frames.len(), count, "unexpected number of transmissions");
        frames
    }
}

/// Server and client wired back to back.
pub fn connected_pair() -> (Node, Node) {
    let server = Node::server();
    let client = Node::client();
    LoopbackBackend::connect_peers(&server.backend, &client.backend);
    (server, client)
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Build a frame as sent by `src` to `dst`.
pub fn build_frame(
    src: &str,
    src_mac: MacAddress,
    dst: &str,
    dst_mac: MacAddress,
    payload: &[u8],
    options: &HeaderOptions,
) -> Vec<u8> {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();
    let mut route = Route::new(src, dst);
    route.local_link_layer_address = src_mac;
    route.next_hop_link_layer_address = dst_mac;

    let backfill = calculate_header_backfill(dst.is_ipv6(), options.use_tcp);
    let mut buf = vec![0u8; backfill + payload.len()];
    buf[backfill..].copy_from_slice(payload);
    let start = write_headers(&route, &mut buf, backfill, payload.len(), options).unwrap();
    buf.split_off(start)
}

/// TCP fields of an IPv4 frame: (flags, seq, ack).
pub fn tcp_fields(frame: &[u8]) -> (u8, u32, u32) {
    let tcp = &frame[TCP_OFFSET..];
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let ack = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);
    (tcp[13], seq, ack)
}

/// TCP payload of an IPv4 frame.
pub fn tcp_payload(frame: &[u8]) -> &[u8] {
    let header_len = usize::from(frame[TCP_OFFSET + 12] >> 4) * 4;
    &frame[TCP_OFFSET + header_len..]
}
