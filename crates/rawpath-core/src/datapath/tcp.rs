//! TCP disguise control segments.
//!
//! The datapath fakes just enough of a TCP handshake for middleboxes to
//! accept QUIC framed as TCP. Replies are built on the route of the segment
//! being answered and carry no payload.
//!
//! | received        | reply    | seq          | ack          |
//! |-----------------|----------|--------------|--------------|
//! | SYN             | SYN\|ACK | their ack    | their seq+1  |
//! | SYN\|ACK        | ACK      | their ack    | their seq+1  |
//! | FIN             | FIN\|ACK | their ack    | their seq+1  |
//! | (local send)    | SYN      | route seq    | 0            |

use super::Shared;
use crate::buffer_pool::RxPacket;
use crate::frame::{PacketType, TcpFlags};
use crate::route::Route;
use crate::socket::RawSocket;
use std::sync::PoisonError;

impl Shared {
    /// Answer a SYN or SYN-ACK, then release a send that was waiting for the
    /// handshake.
    ///
    /// Releasing the paused send also prepares the RST that
    /// [`super::RawDatapath::socket_close`] sends later.
    pub(crate) fn ack_syn(&self, socket: &RawSocket, packet: &RxPacket) {
        let route = packet.route();
        let parsed = packet.parsed();
        let flags = if packet.packet_type() == PacketType::TcpSyn {
            TcpFlags::from_bits(TcpFlags::SYN | TcpFlags::ACK)
        } else {
            TcpFlags::from_bits(TcpFlags::ACK)
        };
        let their_seq = parsed.tcp_seq;
        let their_ack = parsed.tcp_ack;

        self.send_control(socket, route, their_ack, their_seq.wrapping_add(1), flags);

        let paused = socket
            .paused_send
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(paused) = paused else {
            return;
        };

        tracing::debug!(socket = socket.id(), remote = %route.remote_address, "Handshake done, releasing paused send");
        if let Err(e) = self.frame_and_enqueue(
            socket,
            route,
            paused,
            their_ack.wrapping_add(1),
            their_seq.wrapping_add(1),
            TcpFlags::from_bits(TcpFlags::ACK),
        ) {
            tracing::debug!(socket = socket.id(), error = %e, "Paused send dropped");
        }

        let Some(mut rst) = self.alloc(socket, route, 0, 0) else {
            return;
        };
        let flags = TcpFlags::from_bits(TcpFlags::RST | TcpFlags::ACK);
        match self.frame(socket, route, &mut rst, their_ack, their_seq.wrapping_add(1), flags) {
            Ok(()) => {
                let previous = socket
                    .cached_rst
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(rst);
                drop(previous);
            }
            Err(e) => tracing::debug!(socket = socket.id(), error = %e, "RST framing failed"),
        }
    }

    /// Answer a FIN.
    pub(crate) fn ack_fin(&self, socket: &RawSocket, packet: &RxPacket) {
        let parsed = packet.parsed();
        self.send_control(
            socket,
            packet.route(),
            parsed.tcp_ack,
            parsed.tcp_seq.wrapping_add(1),
            TcpFlags::from_bits(TcpFlags::FIN | TcpFlags::ACK),
        );
    }

    /// Open the handshake on `route`.
    pub(crate) fn send_syn(&self, socket: &RawSocket, route: &Route) {
        self.send_control(
            socket,
            route,
            route.tcp_state.sequence_number,
            0,
            TcpFlags::from_bits(TcpFlags::SYN),
        );
    }

    fn send_control(&self, socket: &RawSocket, route: &Route, seq: u32, ack: u32, flags: TcpFlags) {
        let Some(packet) = self.alloc(socket, route, 0, 0) else {
            tracing::debug!(socket = socket.id(), flags = flags.bits(), "No buffer for TCP control");
            return;
        };
        tracing::trace!(
            socket = socket.id(),
            flags = flags.bits(),
            seq,
            ack,
            remote = %route.remote_address,
            "Send TCP control"
        );
        if let Err(e) = self.frame_and_enqueue(socket, route, packet, seq, ack, flags) {
            tracing::debug!(socket = socket.id(), error = %e, "TCP control framing failed");
        }
    }
}
