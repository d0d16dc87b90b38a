//! TCP disguise handshake tests.
//!
//! Each test runs one datapath with its transmissions captured, injects
//! hand-built segments and checks the control replies on the wire.

use rawpath_core::frame::HeaderOptions;
use rawpath_core::{
    MacAddress, PacketType, QueueId, ResolveStatus, Route, SocketConfig, TcpFlags,
};
use rawpath_integration_tests::{
    CLIENT_MAC, Node, SERVER_MAC, build_frame, tcp_fields, tcp_payload, wait_until,
};

const SYN: u8 = TcpFlags::SYN;
const ACK: u8 = TcpFlags::ACK;
const FIN: u8 = TcpFlags::FIN;
const RST: u8 = TcpFlags::RST;

#[allow(clippy::too_many_arguments)]
fn segment(
    src: &str,
    src_mac: MacAddress,
    dst: &str,
    dst_mac: MacAddress,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    build_frame(
        src,
        src_mac,
        dst,
        dst_mac,
        payload,
        &HeaderOptions {
            use_tcp: true,
            flags: TcpFlags::from_bits(flags),
            seq,
            ack,
            ..HeaderOptions::default()
        },
    )
}

fn tcp_listener(node: &Node) {
    node.datapath
        .socket_create(SocketConfig {
            local_address: Some("0.0.0.0:443".parse().unwrap()),
            use_tcp: true,
            ..SocketConfig::default()
        })
        .unwrap();
}

#[test]
fn test_syn_answered_with_syn_ack() {
    let server = Node::server();
    tcp_listener(&server);

    let syn = segment(
        "10.0.0.2:50000",
        CLIENT_MAC,
        "10.0.0.1:443",
        SERVER_MAC,
        SYN,
        0x1234_5678,
        0,
        &[],
    );
    assert!(server.backend.inject(QueueId(0), &syn));

    let sent = server.transmitted(1);
    let frame = &sent[0].bytes;
    assert_eq!(&frame[0..6], &CLIENT_MAC.0, "reply goes back to the sender");
    let (flags, seq, ack) = tcp_fields(frame);
    assert_eq!(flags, SYN | ACK);
    assert_eq!(seq, 0);
    assert_eq!(ack, 0x1234_5679);
    assert!(server.received.try_recv().is_err(), "control segments are not delivered");
}

#[test]
fn test_syn_sequence_wraps() {
    let server = Node::server();
    tcp_listener(&server);

    let syn = segment(
        "10.0.0.2:50000",
        CLIENT_MAC,
        "10.0.0.1:443",
        SERVER_MAC,
        SYN,
        u32::MAX,
        0,
        &[],
    );
    assert!(server.backend.inject(QueueId(0), &syn));
    let (_, _, ack) = tcp_fields(&server.transmitted(1)[0].bytes);
    assert_eq!(ack, 0);
}

#[test]
fn test_fin_answered_with_fin_ack() {
    let server = Node::server();
    tcp_listener(&server);

    let fin = segment(
        "10.0.0.2:50000",
        CLIENT_MAC,
        "10.0.0.1:443",
        SERVER_MAC,
        FIN | ACK,
        9,
        77,
        &[],
    );
    assert!(server.backend.inject(QueueId(0), &fin));
    let (flags, seq, ack) = tcp_fields(&server.transmitted(1)[0].bytes);
    assert_eq!(flags, FIN | ACK);
    assert_eq!(seq, 77);
    assert_eq!(ack, 10);
}

#[test]
fn test_tcp_data_delivered() {
    let server = Node::server();
    tcp_listener(&server);

    let data = segment(
        "10.0.0.2:50000",
        CLIENT_MAC,
        "10.0.0.1:443",
        SERVER_MAC,
        ACK,
        500,
        600,
        b"quic",
    );
    assert!(server.backend.inject(QueueId(0), &data));
    let received = server.recv();
    assert_eq!(received.packet_type, PacketType::Tcp);
    assert_eq!(received.payload, b"quic");
    assert_eq!(received.route.tcp_state.sequence_number, 500);
    assert_eq!(received.route.tcp_state.ack_number, 600);
}

#[test]
fn test_paused_send_released_by_handshake() {
    let client = Node::client();
    let socket = client
        .datapath
        .socket_create(SocketConfig {
            local_address: Some("10.0.0.2:50000".parse().unwrap()),
            remote_address: Some("10.0.0.1:443".parse().unwrap()),
            use_tcp: true,
            ..SocketConfig::default()
        })
        .unwrap();
    let mut route = Route::new(
        "10.0.0.2:50000".parse().unwrap(),
        "10.0.0.1:443".parse().unwrap(),
    );
    assert_eq!(
        client
            .datapath
            .resolve_route(&socket, &mut route, 0, Box::new(|_| {})),
        ResolveStatus::Completed
    );
    let isn = route.tcp_state.sequence_number;

    let mut packet = client.datapath.send_alloc(&socket, &route, 1200, 0).unwrap();
    packet.fill_payload(b"hello");
    client.datapath.send_enqueue(&socket, &route, packet).unwrap();

    // Only the SYN goes out; the data waits for the handshake.
    let sent = client.transmitted(1);
    let (flags, seq, ack) = tcp_fields(&sent[0].bytes);
    assert_eq!(flags, SYN);
    assert_eq!(seq, isn);
    assert_eq!(ack, 0);

    let syn_ack = segment(
        "10.0.0.1:443",
        SERVER_MAC,
        "10.0.0.2:50000",
        CLIENT_MAC,
        SYN | ACK,
        7000,
        isn.wrapping_add(1),
        &[],
    );
    assert!(client.backend.inject(QueueId(0), &syn_ack));

    let sent = client.transmitted(2);
    let (flags, seq, ack) = tcp_fields(&sent[0].bytes);
    assert_eq!(flags, ACK);
    assert_eq!(seq, isn.wrapping_add(1));
    assert_eq!(ack, 7001);

    let (flags, seq, ack) = tcp_fields(&sent[1].bytes);
    assert_eq!(flags, ACK);
    assert_eq!(seq, isn.wrapping_add(2));
    assert_eq!(ack, 7001);
    assert_eq!(tcp_payload(&sent[1].bytes), b"hello");

    // Closing sends the RST prepared during the handshake.
    client.datapath.socket_close(&socket);
    let sent = client.transmitted(1);
    let (flags, seq, ack) = tcp_fields(&sent[0].bytes);
    assert_eq!(flags, RST | ACK);
    assert_eq!(seq, isn.wrapping_add(1));
    assert_eq!(ack, 7001);
}

#[test]
fn test_close_without_handshake_frees_paused_send() {
    let client = Node::client();
    let socket = client
        .datapath
        .socket_create(SocketConfig {
            remote_address: Some("10.0.0.1:443".parse().unwrap()),
            use_tcp: true,
            ..SocketConfig::default()
        })
        .unwrap();
    let mut route = Route::new(socket.local_address(), "10.0.0.1:443".parse().unwrap());
    client
        .datapath
        .resolve_route(&socket, &mut route, 0, Box::new(|_| {}));

    let packet = client.datapath.send_alloc(&socket, &route, 100, 0).unwrap();
    client.datapath.send_enqueue(&socket, &route, packet).unwrap();
    assert_eq!(tcp_fields(&client.transmitted(1)[0].bytes).0, SYN);

    client.datapath.socket_close(&socket);
    let pool = client.datapath.queues()[0].tx_pool();
    assert!(wait_until(|| pool.available() == pool.capacity()));
    assert!(client.backend.take_transmitted().is_empty(), "no RST without handshake");
}

#[test]
fn test_synced_route_sends_data_directly() {
    let client = Node::client();
    let socket = client
        .datapath
        .socket_create(SocketConfig {
            local_address: Some("10.0.0.2:50000".parse().unwrap()),
            remote_address: Some("10.0.0.1:443".parse().unwrap()),
            use_tcp: true,
            ..SocketConfig::default()
        })
        .unwrap();
    let mut route = Route::new(
        "10.0.0.2:50000".parse().unwrap(),
        "10.0.0.1:443".parse().unwrap(),
    );
    client
        .datapath
        .resolve_route(&socket, &mut route, 0, Box::new(|_| {}));

    let mut received = Route::default();
    received.queue = Some(QueueId(0));
    received.tcp_state.sequence_number = 9000;
    received.tcp_state.ack_number = 4000;
    client.datapath.update_route(&mut route, &received);
    assert!(route.tcp_state.syncd);

    let mut packet = client.datapath.send_alloc(&socket, &route, 100, 0).unwrap();
    packet.fill_payload(b"data");
    client.datapath.send_enqueue(&socket, &route, packet).unwrap();

    let sent = client.transmitted(1);
    let (flags, seq, ack) = tcp_fields(&sent[0].bytes);
    assert_eq!(flags, ACK);
    assert_eq!(seq, 4001);
    assert_eq!(ack, 8999);
    assert_eq!(tcp_payload(&sent[0].bytes), b"data");
}
