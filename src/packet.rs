//! The BattlEye packet codec: framing, the `0xFF` sentinel, and the
//! type-specific payload layouts described in `spec.md` §4.2 and §6.

use std::io::Write;

use crate::crc;
use crate::Error;

const HEADER_LEN: usize = 6;
const MIN_PACKET_LEN: usize = 9;

const SENTINEL: u8 = 0xFF;

const TYPE_LOGIN: u8 = 0;
const TYPE_COMMAND: u8 = 1;
const TYPE_MESSAGE: u8 = 2;

/// A single decoded or soon-to-be-serialised BattlEye packet.
///
/// Unlike the source protocol's dynamically typed attribute bag, each wire
/// shape is its own variant, so constructing one outside its well-formed
/// range is a compile error rather than a runtime one. Serialisation is
/// defined only for the variants that are ever legally sent by a client:
/// [`Packet::LoginRequest`], [`Packet::CommandRequest`] and
/// [`Packet::MessageAck`] (the "Message-Reply ack").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Sent once per session to authenticate. `password` is `None` only
    /// transiently, while a caller is still building the packet; it is
    /// always set before `connect` hands it to the multiplexer.
    LoginRequest {
        /// The configured RCon password.
        password: Option<String>,
    },

    /// Decoded from an inbound login response. `login` is `true` iff the
    /// server accepted the password.
    LoginReply {
        /// Whether the login attempt succeeded.
        login: bool,
    },

    /// A command invocation. `sequence` starts `None` and is filled in by
    /// the [`Multiplexer`](crate::Multiplexer) immediately before
    /// transmission if unset.
    CommandRequest {
        /// The 1-byte sequence identifying this request's reply.
        sequence: Option<u8>,
        /// The command text.
        command: Option<String>,
    },

    /// A (non-fragmented) reply to a [`Packet::CommandRequest`].
    CommandReply {
        /// The sequence number this reply answers.
        sequence: u8,
        /// The reply text, decoded as UTF-8 (lossily — the protocol does
        /// not guarantee valid UTF-8 and this crate does not treat
        /// malformed text as a transport error).
        data: String,
    },

    /// One fragment of a multipart command reply.
    CommandFragment {
        /// The sequence number this fragment belongs to.
        sequence: u8,
        /// The total number of fragments in the group.
        total: u8,
        /// This fragment's position within the group.
        index: u8,
        /// This fragment's raw payload bytes.
        part: Vec<u8>,
    },

    /// An asynchronous message from the server (e.g. a chat line or admin
    /// broadcast), requiring an ack.
    MessageIndication {
        /// The sequence number to echo back in the ack.
        sequence: u8,
        /// The message text.
        message: String,
    },

    /// The ack a client sends in response to a [`Packet::MessageIndication`].
    MessageAck {
        /// The sequence number being acked.
        sequence: u8,
    },
}

impl Packet {
    /// Decode a single packet from a UDP datagram payload.
    ///
    /// `buf` must be the entire received datagram. Returns an error for any
    /// structural violation described in `spec.md` §4.2 (short buffer, bad
    /// header text, checksum mismatch, missing sentinel, unknown type).
    pub fn from_buffer(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < MIN_PACKET_LEN {
            return Err(Error::PacketError("packet too short".to_string()));
        }

        if &buf[0..2] != b"BE" {
            return Err(Error::PacketError("Invalid header text".to_string()));
        }

        let header_crc = [buf[2], buf[3], buf[4], buf[5]];
        let payload = &buf[HEADER_LEN..];
        if !crc::verify(header_crc, payload) {
            return Err(Error::PacketError(
                "checksum verification failed".to_string(),
            ));
        }

        if payload[0] != SENTINEL {
            return Err(Error::PacketError("missing 0xFF flag".to_string()));
        }

        let packet_type = payload[1];
        match packet_type {
            TYPE_LOGIN => {
                let login = payload[2] == 1;
                Ok(Packet::LoginReply { login })
            }
            TYPE_COMMAND => {
                let sequence = payload[2];
                if payload.len() > 4 && payload[3] == 0x00 {
                    if payload.len() < 6 {
                        return Err(Error::PacketError(
                            "truncated multipart fragment".to_string(),
                        ));
                    }
                    let total = payload[4];
                    let index = payload[5];
                    let part = payload[6..].to_vec();
                    Ok(Packet::CommandFragment {
                        sequence,
                        total,
                        index,
                        part,
                    })
                } else {
                    let data = String::from_utf8_lossy(&payload[3..]).into_owned();
                    Ok(Packet::CommandReply { sequence, data })
                }
            }
            TYPE_MESSAGE => {
                let sequence = payload[2];
                let message = String::from_utf8_lossy(&payload[3..]).into_owned();
                Ok(Packet::MessageIndication { sequence, message })
            }
            other => Err(Error::UnknownPacketType(other)),
        }
    }

    /// Serialise this packet to its wire representation.
    ///
    /// Only [`Packet::LoginRequest`], [`Packet::CommandRequest`] and
    /// [`Packet::MessageAck`] can be serialised; any other variant, or a
    /// request missing its mandatory field, is an error.
    pub fn serialise(&self) -> Result<Vec<u8>, Error> {
        let payload = self.serialise_payload()?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.write_all(b"BE").expect("writing to a Vec cannot fail");
        buf.write_all(&crc::write_header_crc(crc::checksum(&payload)))
            .expect("writing to a Vec cannot fail");
        buf.write_all(&payload).expect("writing to a Vec cannot fail");

        Ok(buf)
    }

    fn serialise_payload(&self) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();
        payload.push(SENTINEL);

        match self {
            Packet::LoginRequest { password } => {
                let password = password.as_ref().ok_or(Error::NoPassword)?;
                payload.push(TYPE_LOGIN);
                payload.extend_from_slice(password.as_bytes());
            }
            Packet::CommandRequest { sequence, command } => {
                let sequence = sequence.ok_or(Error::NoCommand)?;
                let command = command.as_ref().ok_or(Error::NoCommand)?;
                payload.push(TYPE_COMMAND);
                payload.push(sequence);
                payload.extend_from_slice(command.as_bytes());
            }
            Packet::MessageAck { sequence } => {
                payload.push(TYPE_MESSAGE);
                payload.push(*sequence);
            }
            _ => {
                return Err(Error::InvalidPacket);
            }
        }

        Ok(payload)
    }

    /// The sequence number carried by this packet, if any. `LoginRequest`
    /// and `LoginReply` have no sequence.
    pub fn sequence(&self) -> Option<u8> {
        match self {
            Packet::LoginRequest { .. } | Packet::LoginReply { .. } => None,
            Packet::CommandRequest { sequence, .. } => *sequence,
            Packet::CommandReply { sequence, .. }
            | Packet::CommandFragment { sequence, .. }
            | Packet::MessageIndication { sequence, .. }
            | Packet::MessageAck { sequence } => Some(*sequence),
        }
    }

    /// Assign a sequence number to a [`Packet::CommandRequest`] that does
    /// not yet have one. A no-op for any other variant or if a sequence is
    /// already set.
    pub(crate) fn assign_sequence(&mut self, seq: u8) {
        if let Packet::CommandRequest { sequence, .. } = self {
            if sequence.is_none() {
                *sequence = Some(seq);
            }
        }
    }

    /// `true` for a [`Packet::CommandFragment`].
    pub fn is_split(&self) -> bool {
        matches!(self, Packet::CommandFragment { .. })
    }
}
