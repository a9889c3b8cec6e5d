//! Wire Protocol
//!
//! Fixed-layout structures exchanged on raw-frame transports. All integers
//! are little-endian.
//!
//! ```text
//! handshake            [auth key 16][ipv4 4 | prefix 1][ipv6 16 | prefix 1]   38 bytes
//! client frame header  [auth key 16][length u32]                              20 bytes
//! server frame header  [version u8][length u32]                                5 bytes
//! ```
//!
//! Every frame header is followed by exactly `length` bytes of encoded payload.

mod codec;
mod io;

pub use codec::ServerFrameCodec;
pub use io::read_full;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::packet::addr_key;

/// Version byte carried in every server frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of an auth key in bytes
pub const AUTH_KEY_LEN: usize = 16;

/// Shared-secret identity carried by every client frame
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

impl AuthKey {
    /// Derive the auth key from the pre-shared key string
    pub fn derive(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; AUTH_KEY_LEN];
        bytes.copy_from_slice(&digest[..AUTH_KEY_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.0
    }

    /// Fail with `AuthFailed` unless `other` is the same key
    pub fn verify(&self, other: &AuthKey) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(Error::AuthFailed)
        }
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only a short fingerprint ever reaches the logs
        write!(f, "AuthKey({}..)", hex::encode(&self.0[..4]))
    }
}

/// IPv4 address with prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub const SIZE: usize = 5;

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.addr.octets());
        bytes[4] = self.prefix;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        if bytes[4] > 32 {
            return Err(Error::MalformedHandshake(format!(
                "IPv4 prefix length {} out of range",
                bytes[4]
            )));
        }
        Ok(Self {
            addr: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            prefix: bytes[4],
        })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// IPv6 address with prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Cidr {
    pub addr: Ipv6Addr,
    pub prefix: u8,
}

impl Ipv6Cidr {
    pub const SIZE: usize = 17;

    pub fn new(addr: Ipv6Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..16].copy_from_slice(&self.addr.octets());
        bytes[16] = self.prefix;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        if bytes[16] > 128 {
            return Err(Error::MalformedHandshake(format!(
                "IPv6 prefix length {} out of range",
                bytes[16]
            )));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[0..16]);
        Ok(Self {
            addr: Ipv6Addr::from(octets),
            prefix: bytes[16],
        })
    }
}

impl std::fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// First message of a raw-frame session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandshake {
    pub key: AuthKey,
    pub ipv4: Ipv4Cidr,
    pub ipv6: Ipv6Cidr,
}

impl ClientHandshake {
    /// Handshake size in bytes
    pub const SIZE: usize = AUTH_KEY_LEN + Ipv4Cidr::SIZE + Ipv6Cidr::SIZE;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..16].copy_from_slice(self.key.as_bytes());
        bytes[16..21].copy_from_slice(&self.ipv4.to_bytes());
        bytes[21..38].copy_from_slice(&self.ipv6.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        let mut key = [0u8; AUTH_KEY_LEN];
        key.copy_from_slice(&bytes[0..16]);
        let mut v4 = [0u8; Ipv4Cidr::SIZE];
        v4.copy_from_slice(&bytes[16..21]);
        let mut v6 = [0u8; Ipv6Cidr::SIZE];
        v6.copy_from_slice(&bytes[21..38]);

        Ok(Self {
            key: AuthKey::from_bytes(key),
            ipv4: Ipv4Cidr::from_bytes(&v4)?,
            ipv6: Ipv6Cidr::from_bytes(&v6)?,
        })
    }

    /// Peer cache keys this session should be reachable under.
    ///
    /// Unspecified addresses mean the client has no address of that family.
    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if !self.ipv4.addr.is_unspecified() {
            keys.push(addr_key(&IpAddr::V4(self.ipv4.addr)));
        }
        if !self.ipv6.addr.is_unspecified() {
            keys.push(addr_key(&IpAddr::V6(self.ipv6.addr)));
        }
        keys
    }
}

/// Header of a frame sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFrameHeader {
    pub key: AuthKey,
    pub length: u32,
}

impl ClientFrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = AUTH_KEY_LEN + 4;

    pub fn new(key: AuthKey, payload: &[u8]) -> Self {
        Self {
            key,
            length: payload.len() as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..16].copy_from_slice(self.key.as_bytes());
        bytes[16..20].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut key = [0u8; AUTH_KEY_LEN];
        key.copy_from_slice(&bytes[0..16]);
        Self {
            key: AuthKey::from_bytes(key),
            length: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        }
    }

    /// Authenticate the header, then bound its declared length.
    ///
    /// Returns the payload length to read.
    pub fn validate(&self, expected: &AuthKey, max_length: usize) -> Result<usize> {
        expected.verify(&self.key)?;
        let length = self.length as usize;
        if length > max_length {
            return Err(Error::FrameTooLarge {
                declared: length,
                max: max_length,
            });
        }
        Ok(length)
    }
}

/// Header of a frame sent by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFrameHeader {
    pub version: u8,
    pub length: u32,
}

impl ServerFrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 5;

    pub fn new(payload: &[u8]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            length: payload.len() as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.version;
        bytes[1..5].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            version: bytes[0],
            length: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(key: &str) -> ClientHandshake {
        ClientHandshake {
            key: AuthKey::derive(key),
            ipv4: Ipv4Cidr::new("10.0.0.2".parse().unwrap(), 32),
            ipv6: Ipv6Cidr::new("fd00::2".parse().unwrap(), 128),
        }
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(ClientHandshake::SIZE, 38);
        assert_eq!(ClientFrameHeader::SIZE, 20);
        assert_eq!(ServerFrameHeader::SIZE, 5);
    }

    #[test]
    fn test_auth_key_is_deterministic() {
        assert_eq!(AuthKey::derive("secret"), AuthKey::derive("secret"));
        assert_ne!(AuthKey::derive("secret"), AuthKey::derive("Secret"));
        assert!(AuthKey::derive("a").verify(&AuthKey::derive("b")).is_err());
    }

    #[test]
    fn test_handshake_layout() {
        let hs = handshake("secret");
        let bytes = hs.to_bytes();

        assert_eq!(&bytes[0..16], AuthKey::derive("secret").as_bytes());
        assert_eq!(&bytes[16..21], &[10, 0, 0, 2, 32]);
        assert_eq!(bytes[37], 128);
        assert_eq!(ClientHandshake::from_bytes(&bytes).unwrap(), hs);
        assert_eq!(hs.cache_keys(), vec!["10.0.0.2".to_string(), "fd00::2".to_string()]);
    }

    #[test]
    fn test_handshake_bad_prefix_is_malformed() {
        let mut bytes = handshake("secret").to_bytes();
        bytes[20] = 33;
        assert!(matches!(
            ClientHandshake::from_bytes(&bytes),
            Err(Error::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_unspecified_family_not_registered() {
        let mut hs = handshake("secret");
        hs.ipv6 = Ipv6Cidr::new(Ipv6Addr::UNSPECIFIED, 0);
        assert_eq!(hs.cache_keys(), vec!["10.0.0.2".to_string()]);
    }

    #[test]
    fn test_client_header_checks_key_before_length() {
        let key = AuthKey::derive("secret");
        let forged = ClientFrameHeader {
            key: AuthKey::derive("wrong"),
            length: u32::MAX,
        };
        assert!(matches!(forged.validate(&key, 65535), Err(Error::AuthFailed)));

        let oversized = ClientFrameHeader { key, length: 70000 };
        assert!(matches!(
            oversized.validate(&key, 65535),
            Err(Error::FrameTooLarge { declared: 70000, max: 65535 })
        ));

        let header = ClientFrameHeader::new(key, &[0u8; 1400]);
        let parsed = ClientFrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed.validate(&key, 65535).unwrap(), 1400);
    }

    #[test]
    fn test_server_header_layout() {
        let header = ServerFrameHeader::new(&[0u8; 300]);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [PROTOCOL_VERSION, 0x2c, 0x01, 0x00, 0x00]);
        assert_eq!(ServerFrameHeader::from_bytes(&bytes), header);
    }
}
