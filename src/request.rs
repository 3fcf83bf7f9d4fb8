//! The in-flight request bookkeeping described in `spec.md` §3:
//! [`PendingRequest`] and the [`Response`] it ultimately resolves with.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::id::ConnectionId;
use crate::packet::Packet;
use crate::Error;

/// A packet that has been (or is about to be) sent, tracking the attempt
/// count and creation time needed by the retry/timeout scheduler.
#[derive(Debug, Clone)]
pub(crate) struct OutboundPacket {
    packet: Packet,
    created_at: Instant,
    sent_count: u32,
}

impl OutboundPacket {
    pub(crate) fn new(packet: Packet) -> Self {
        Self {
            packet,
            created_at: Instant::now(),
            sent_count: 0,
        }
    }

    pub(crate) fn packet(&self) -> &Packet {
        &self.packet
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn sent_count(&self) -> u32 {
        self.sent_count
    }

    /// Serialise the packet, recording the attempt. Each call increments
    /// `sent_count`, matching "each successful serialize increments
    /// sent_count" in `spec.md` §4.2.
    pub(crate) fn serialise(&mut self) -> Result<Vec<u8>, Error> {
        let buf = self.packet.serialise()?;
        self.sent_count += 1;
        Ok(buf)
    }
}

/// What a completed request yields: see `spec.md` §3.
#[derive(Debug, Clone)]
pub struct Response {
    /// The original command string, if this was a command request.
    pub command: Option<String>,
    /// The reassembled reply payload text, if any.
    pub data: Option<String>,
    /// The packet that was sent.
    pub sent: Packet,
    /// The packet that completed this request, if one was received (a
    /// request failed purely by local timeout has no received packet).
    pub received: Option<Packet>,
    /// The number of bytes transmitted on the wire.
    pub bytes: usize,
    /// The connection this response was received on.
    pub connection: ConnectionId,
}

/// A request awaiting a reply: the sent packet, bytes transmitted, and a
/// one-shot completion slot.
pub(crate) struct PendingRequest {
    outbound: OutboundPacket,
    bytes: usize,
    completion: Option<oneshot::Sender<Result<Response, Error>>>,
}

impl PendingRequest {
    pub(crate) fn new(
        outbound: OutboundPacket,
        bytes: usize,
        completion: oneshot::Sender<Result<Response, Error>>,
    ) -> Self {
        Self {
            outbound,
            bytes,
            completion: Some(completion),
        }
    }

    pub(crate) fn outbound(&self) -> &OutboundPacket {
        &self.outbound
    }

    pub(crate) fn outbound_mut(&mut self) -> &mut OutboundPacket {
        &mut self.outbound
    }

    pub(crate) fn set_bytes(&mut self, bytes: usize) {
        self.bytes = bytes;
    }

    /// Resolve this request, consuming the completion slot. A no-op if the
    /// request was already completed (defensive against double-completion
    /// races between the receive path and the timeout scheduler).
    pub(crate) fn complete(&mut self, result: Result<Response, Error>) {
        if let Some(tx) = self.completion.take() {
            // The receiver may already have been dropped if the caller lost
            // interest; that's not this crate's problem to report.
            let _ = tx.send(result);
        }
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}
