use std::net::IpAddr;

use thiserror::Error;

use crate::ConnectionId;

/// Error types returned by this crate.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Error {
    /// A send or registration was attempted against a [`Connection`] that is
    /// not currently connected.
    ///
    /// [`Connection`]: crate::Connection
    #[error("not connected")]
    NoConnection,

    /// [`Multiplexer::connection`] was called with a `connection_id` that is
    /// already registered.
    ///
    /// [`Multiplexer::connection`]: crate::Multiplexer::connection
    #[error("connection already exists")]
    ConnectionExists,

    /// An inbound datagram was received from a remote address that does not
    /// match any registered [`Connection`].
    ///
    /// [`Connection`]: crate::Connection
    #[error("unknown connection {0} ({1}:{2})")]
    UnknownConnection(ConnectionId, IpAddr, u16),

    /// A [`Connection`] replied to a command with the literal text `Unknown
    /// command`.
    ///
    /// [`Connection`]: crate::Connection
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The payload byte 1 (the packet type) did not match any of `Login`,
    /// `Command` or `Message`.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// The server rejected the configured password. This is a terminal
    /// condition for the session; see §1 non-goals.
    #[error("invalid password")]
    InvalidPassword,

    /// The packet failed the structural checks in [`Packet::from_buffer`]
    /// but did not match a more specific error kind below.
    ///
    /// [`Packet::from_buffer`]: crate::Packet::from_buffer
    #[error("invalid packet")]
    InvalidPacket,

    /// A decoded sequence number was out of the valid `0..=255` range for
    /// this transport (should be unreachable given the wire format is a
    /// single byte, retained for parity with the source protocol's error
    /// taxonomy).
    #[error("invalid sequence number {0}")]
    InvalidSequence(u16),

    /// The six-byte header or payload failed a structural or checksum
    /// check. The message matches the kind of failure observed (missing
    /// `BE` text, checksum mismatch, missing `0xFF` flag, ...).
    #[error("packet error: {0}")]
    PacketError(String),

    /// A sequence number was about to be reused for a second in-flight
    /// Command request (invariant 1 in §3).
    #[error("sequence number overflow, too many in-flight requests")]
    PacketOverflow,

    /// No packet has been received from the server within the configured
    /// `serverTimeout` deadline. Terminal for the session unless
    /// `reconnect` is enabled.
    #[error("server timed out")]
    ServerTimeout,

    /// The connection was torn down by an explicit call to `disconnect`
    /// rather than a protocol failure.
    #[error("server disconnected")]
    ServerDisconnect,

    /// A pending request exhausted its retry budget (`sent_count` reached
    /// `packetTimeoutThresholded`) without a matching reply.
    #[error("max retries exceeded")]
    MaxRetries,

    /// [`Packet::serialise`] was called on a Login Request with no password
    /// set.
    ///
    /// [`Packet::serialise`]: crate::Packet::serialise
    #[error("no password set")]
    NoPassword,

    /// [`Packet::serialise`] was called on a Command Request with no
    /// command text set.
    ///
    /// [`Packet::serialise`]: crate::Packet::serialise
    #[error("no command set")]
    NoCommand,
}
