use std::fmt;
use std::net::IpAddr;

use md5::{Digest, Md5};

/// A stable identifier for a [`Connection`], derived from its remote
/// address.
///
/// `id = MD5(ip + ":" + port)`, rendered as 32 lowercase hex characters. The
/// value is opaque — it is used only as a map key and for display in error
/// messages, never as a security boundary (MD5's cryptographic weaknesses
/// are irrelevant here).
///
/// [`Connection`]: crate::Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; 16]);

impl ConnectionId {
    /// Derive the [`ConnectionId`] for the given remote `ip:port`.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let mut hasher = Md5::new();
        hasher.update(ip.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(port.to_string().as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        Self(digest)
    }

    /// Render this id as a 32 character lowercase hex string.
    pub fn to_hex(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_for_same_address() {
        let a = ConnectionId::new("127.0.0.1".parse().unwrap(), 2302);
        let b = ConnectionId::new("127.0.0.1".parse().unwrap(), 2302);
        assert_eq!(a, b);
    }

    #[test]
    fn test_differs_by_port() {
        let a = ConnectionId::new("127.0.0.1".parse().unwrap(), 2302);
        let b = ConnectionId::new("127.0.0.1".parse().unwrap(), 2303);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_is_32_chars() {
        let id = ConnectionId::new("10.0.0.5".parse().unwrap(), 9999);
        assert_eq!(id.to_hex().len(), 32);
        assert!(id.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
