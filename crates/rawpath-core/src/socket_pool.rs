//! Socket demultiplexing table.
//!
//! Sockets are indexed by local port. Lookups take the shared lock, inserts
//! and removals the exclusive one. A successful [`SocketPool::find`] returns
//! a [`SocketRef`] holding the socket's rundown, so a socket being closed is
//! never handed to the receive path.

use crate::error::{DatapathError, Result};
use crate::hash_index::AddressHashIndex;
use crate::socket::RawSocket;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// First port of the IANA dynamic range.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// A socket found by [`SocketPool::find`]. Releases the rundown on drop.
#[derive(Debug)]
pub struct SocketRef {
    socket: Arc<RawSocket>,
}

impl SocketRef {
    /// The owning handle.
    pub fn socket(&self) -> &Arc<RawSocket> {
        &self.socket
    }
}

impl Deref for SocketRef {
    type Target = RawSocket;

    fn deref(&self) -> &RawSocket {
        &self.socket
    }
}

impl Drop for SocketRef {
    fn drop(&mut self) {
        self.socket.rundown.release();
    }
}

/// Sockets keyed by local port.
#[derive(Debug)]
pub struct SocketPool {
    sockets: RwLock<AddressHashIndex<Arc<RawSocket>>>,
    next_ephemeral: AtomicU16,
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self {
            sockets: RwLock::new(AddressHashIndex::new()),
            next_ephemeral: AtomicU16::new(EPHEMERAL_PORT_START),
        }
    }

    /// Insert `socket` unless it conflicts with one already present.
    ///
    /// # Errors
    ///
    /// [`DatapathError::AddressInUse`] when a wildcard socket already owns
    /// the port, or a connected socket already owns the same 4-tuple.
    pub fn try_add(&self, socket: Arc<RawSocket>) -> Result<()> {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        let port = socket.local_address().port();
        if sockets
            .matches(u64::from(port))
            .any(|(_, existing)| existing.conflicts_with(&socket))
        {
            return Err(DatapathError::AddressInUse(socket.local_address()));
        }
        sockets.insert(socket, u64::from(port));
        Ok(())
    }

    /// Remove `socket` and release its OS port reservation.
    ///
    /// Returns `false` if the socket was not in the pool.
    pub fn remove(&self, socket: &Arc<RawSocket>) -> bool {
        let removed = {
            let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
            let port = socket.local_address().port();
            let id = sockets
                .matches(u64::from(port))
                .find(|(_, existing)| Arc::ptr_eq(existing, socket))
                .map(|(id, _)| id);
            id.and_then(|id| sockets.remove(id)).is_some()
        };
        socket.release_reservation();
        removed
    }

    /// Socket that should receive a frame addressed `remote -> local`.
    ///
    /// A connected socket matching the full tuple wins over a wildcard on
    /// the same port. Returns `None` if nothing matches or the match is
    /// being closed.
    pub fn find(&self, local: &SocketAddr, remote: &SocketAddr) -> Option<SocketRef> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        let mut wildcard = None;
        let mut found = None;
        for (_, socket) in sockets.matches(u64::from(local.port())) {
            if !socket.matches(local, remote) {
                continue;
            }
            if socket.is_connected() {
                found = Some(socket);
                break;
            }
            if wildcard.is_none() {
                wildcard = Some(socket);
            }
        }
        let socket = found.or(wildcard)?;
        if !socket.rundown.acquire() {
            return None;
        }
        Some(SocketRef {
            socket: Arc::clone(socket),
        })
    }

    /// Whether any socket is bound to `port`.
    pub fn is_port_in_use(&self, port: u16) -> bool {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        sockets.lookup(u64::from(port)).is_some()
    }

    /// Next ephemeral port with no socket bound, or `None` when the whole
    /// dynamic range is taken.
    pub fn ephemeral_port(&self) -> Option<u16> {
        let range = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..range {
            let port = self
                .next_ephemeral
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |port| {
                    Some(if port == u16::MAX {
                        EPHEMERAL_PORT_START
                    } else {
                        port + 1
                    })
                })
                .unwrap_or(EPHEMERAL_PORT_START);
            if !self.is_port_in_use(port) {
                return Some(port);
            }
        }
        None
    }

    /// Number of sockets.
    pub fn len(&self) -> usize {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all sockets.
    pub fn sockets(&self) -> Vec<Arc<RawSocket>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enumerate()
            .map(|(_, socket)| Arc::clone(socket))
            .collect()
    }
}
