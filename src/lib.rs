#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::todo,
    clippy::unimplemented,
    clippy::use_self,
    clippy::doc_markdown,
    clippy::print_stdout,
    missing_debug_implementations,
    unused_crate_dependencies,
    unreachable_pub,
    missing_docs
)]

mod errors;
pub use errors::Error;

mod id;
pub use id::ConnectionId;

mod crc;

mod packet;
pub use packet::Packet;

mod config;
pub use config::{ConnectionDetails, ConnectionOptions, MultiplexerOptions};

mod events;
pub use events::{ConnectionEvent, MultiplexerEvent};

mod request;
pub use request::Response;

mod socket;

mod connection;
pub use connection::Connection;

mod multiplexer;
pub use multiplexer::Multiplexer;

// Unused crate lint workaround for dev dependencies that are only exercised
// by benches/tests.
#[cfg(test)]
use criterion as _;
#[cfg(test)]
use proptest as _;
#[cfg(test)]
use tracing_subscriber as _;
