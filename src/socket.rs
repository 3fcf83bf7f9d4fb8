//! The bounded capability a [`Connection`](crate::Connection) uses to reach
//! the socket it does not own.
//!
//! Per `spec.md` §9 ("Cyclic Socket↔Connection references"), a `Connection`
//! never holds a strong reference back to its owning
//! [`Multiplexer`](crate::Multiplexer). Instead it holds a [`SocketHandle`]:
//! an id, a destination address, and a channel sender that feeds the
//! multiplexer's single outbound task. That task is the only writer of the
//! UDP socket, satisfying the "only the Multiplexer may write to the
//! socket" rule in §5.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::id::ConnectionId;
use crate::packet::Packet;

/// A serialised packet queued for transmission by the multiplexer's
/// outbound task, along with enough context to emit a `Sent` event once
/// it's actually written to the socket.
#[derive(Debug)]
pub(crate) struct OutboundDatagram {
    pub(crate) connection: ConnectionId,
    pub(crate) target: SocketAddr,
    pub(crate) packet: Packet,
    pub(crate) bytes: Vec<u8>,
}

/// A cheap, cloneable capability to enqueue outbound datagrams for one
/// remote endpoint. Holding a [`SocketHandle`] does not keep the
/// multiplexer alive; once the owning multiplexer drops its receiver, sends
/// through a handle silently fail.
#[derive(Debug, Clone)]
pub(crate) struct SocketHandle {
    id: ConnectionId,
    target: SocketAddr,
    sender: mpsc::UnboundedSender<OutboundDatagram>,
}

impl SocketHandle {
    pub(crate) fn new(
        id: ConnectionId,
        target: SocketAddr,
        sender: mpsc::UnboundedSender<OutboundDatagram>,
    ) -> Self {
        Self { id, target, sender }
    }

    /// Queue `packet`'s wire bytes for transmission. Returns `false` if the
    /// multiplexer has shut down and the datagram could not be queued.
    pub(crate) fn enqueue(&self, packet: Packet, bytes: Vec<u8>) -> bool {
        self.sender
            .send(OutboundDatagram {
                connection: self.id,
                target: self.target,
                packet,
                bytes,
            })
            .is_ok()
    }
}
