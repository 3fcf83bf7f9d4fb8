//! Configuration surfaces for [`Connection`](crate::Connection) and
//! [`Multiplexer`](crate::Multiplexer), matching the defaults table in
//! `spec.md` §6.
//!
//! The config-file reader (`rconpassword`/`rconport`/`rconip`/`maxping`)
//! described in the same section is an external collaborator and is not
//! implemented by this crate — these structs are built programmatically by
//! the embedding application.

use std::net::IpAddr;
use std::time::Duration;

/// Per-connection tunables, frozen at [`Connection`](crate::Connection)
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Reconnect automatically, but only after a `ServerTimeout`
    /// disconnect. Default `true`.
    pub reconnect: bool,

    /// Delay before a reconnect attempt. Default 500ms.
    pub reconnect_timeout: Duration,

    /// Enable the periodic empty-command keep-alive ping. Default `true`.
    pub keep_alive: bool,

    /// Keep-alive ping cadence. Default 15s.
    pub keep_alive_interval: Duration,

    /// Enable the retry/liveness timeout scheduler. Default `true`.
    pub timeout: bool,

    /// Timeout scheduler tick cadence. Default 1s.
    pub timeout_interval: Duration,

    /// Deadline since the last inbound packet before the connection is
    /// considered dead. Default 30s.
    pub server_timeout: Duration,

    /// Per-attempt retry interval multiplier: a pending request is resent
    /// once `sent_count * packet_timeout` has elapsed since it was first
    /// sent. Default 1s.
    pub packet_timeout: Duration,

    /// Number of send attempts a pending request may reach before it fails
    /// with `ServerTimeout`. Default 5.
    pub packet_timeout_thresholded: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_timeout: Duration::from_millis(500),
            keep_alive: true,
            keep_alive_interval: Duration::from_millis(15_000),
            timeout: true,
            timeout_interval: Duration::from_millis(1_000),
            server_timeout: Duration::from_millis(30_000),
            packet_timeout: Duration::from_millis(1_000),
            packet_timeout_thresholded: 5,
        }
    }
}

/// Identifies a remote RCon endpoint to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionDetails {
    /// The remote server's IP address.
    pub ip: IpAddr,
    /// The remote server's RCon port.
    pub port: u16,
}

impl ConnectionDetails {
    /// Construct a new set of connection details.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// Configuration for the [`Multiplexer`](crate::Multiplexer)'s local UDP
/// socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerOptions {
    /// The local address to bind to. Default `0.0.0.0`.
    pub ip: IpAddr,
    /// The local port to bind to. Default `2310`.
    pub port: u16,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([0, 0, 0, 0]),
            port: 2310,
        }
    }
}
