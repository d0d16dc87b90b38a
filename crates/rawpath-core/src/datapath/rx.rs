//! Receive demultiplexing.

use super::Shared;
use crate::buffer_pool::RxPacket;
use crate::frame::PacketType;

impl Shared {
    /// Deliver a batch of parsed packets to their sockets.
    ///
    /// Consecutive data packets for the same socket are handed over as one
    /// chain. TCP handshake and teardown segments are answered here and
    /// never reach the receive handler. Anything without a socket is
    /// dropped.
    pub(crate) fn on_packets_received(&self, packets: Vec<RxPacket>) {
        let mut packets = packets.into_iter().peekable();
        while let Some(packet) = packets.next() {
            let packet_type = packet.packet_type();
            let socket = if packet_type >= PacketType::Udp {
                let route = packet.route();
                self.sockets
                    .find(&route.local_address, &route.remote_address)
            } else {
                None
            };

            let Some(socket) = socket else {
                if let Some(queue) = self.queue(packet.queue()) {
                    queue.stats().record_no_socket();
                }
                tracing::trace!(
                    local = %packet.route().local_address,
                    remote = %packet.route().remote_address,
                    packet_type = ?packet_type,
                    "No socket for packet"
                );
                continue;
            };

            match packet_type {
                PacketType::Udp | PacketType::Tcp => {
                    let socket_type = if socket.use_tcp() {
                        PacketType::Tcp
                    } else {
                        PacketType::Udp
                    };
                    if packet_type != socket_type {
                        tracing::trace!(
                            socket = socket.id(),
                            packet_type = ?packet_type,
                            "Transport does not match socket"
                        );
                        continue;
                    }

                    let mut chain = vec![packet];
                    while let Some(next) = packets.next_if(|next| {
                        next.packet_type() == socket_type
                            && socket.matches(
                                &next.route().local_address,
                                &next.route().remote_address,
                            )
                    }) {
                        chain.push(next);
                    }
                    tracing::trace!(socket = socket.id(), packets = chain.len(), "Recv");
                    (self.receive)(socket.socket(), chain);
                }
                PacketType::TcpSyn | PacketType::TcpSynAck if socket.use_tcp() => {
                    self.ack_syn(&socket, &packet);
                }
                PacketType::TcpFin if socket.use_tcp() => {
                    self.ack_fin(&socket, &packet);
                }
                _ => {}
            }
        }
    }
}
