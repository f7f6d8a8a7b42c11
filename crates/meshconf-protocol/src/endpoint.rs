//! Participant addresses.
//!
//! An [`Endpoint`] is where a participant listens for invitations and
//! reconnections. Textual forms:
//!
//! - `127.0.0.1:11235`
//! - `[::1]:11235` or `::1:11235` (the last colon separates the port)
//! - `file:///tmp/alice.sock` for local sockets

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire;
use crate::{DEFAULT_LISTEN_ADDR, DEFAULT_LISTEN_PORT};

const LOCAL_SCHEME: &str = "file://";

const FAMILY_V4: u8 = 1;
const FAMILY_V6: u8 = 2;
const FAMILY_LOCAL: u8 = 3;

/// Address of a participant: IPv4, IPv6 or a local socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Local(PathBuf),
}

impl Endpoint {
    /// Builds an IP endpoint from a bare address and a port.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidAddress`] if `address` is not an IPv4
    /// or IPv6 literal.
    pub fn new(address: &str, port: u16) -> ProtocolResult<Self> {
        let ip: IpAddr = address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ProtocolError::invalid_address(format!("'{address}' is not an IP address")))?;
        Ok(Self::from(SocketAddr::new(ip, port)))
    }

    /// Builds a local socket endpoint.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// Socket address for IP endpoints, `None` for local sockets.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(addr) => Some(SocketAddr::V4(*addr)),
            Self::V6(addr) => Some(SocketAddr::V6(*addr)),
            Self::Local(_) => None,
        }
    }

    /// Socket path for local endpoints, `None` for IP endpoints.
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            Self::V4(addr) => {
                buf.put_u8(FAMILY_V4);
                buf.put_u16_le(addr.port());
                buf.put_slice(&addr.ip().octets());
            }
            Self::V6(addr) => {
                buf.put_u8(FAMILY_V6);
                buf.put_u16_le(addr.port());
                buf.put_slice(&addr.ip().octets());
            }
            Self::Local(path) => {
                let bytes = path.as_os_str().as_bytes();
                let len = u16::try_from(bytes.len()).map_err(|_| {
                    ProtocolError::invalid_address(format!(
                        "socket path is {} bytes long",
                        bytes.len()
                    ))
                })?;
                buf.put_u8(FAMILY_LOCAL);
                buf.put_u16_le(len);
                buf.put_slice(bytes);
            }
        }
        Ok(())
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> ProtocolResult<Self> {
        match wire::get_u8(buf, "endpoint family")? {
            FAMILY_V4 => {
                let port = wire::get_u16(buf, "endpoint port")?;
                let octets: [u8; 4] = wire::get_slice(buf, 4, "IPv4 address")?
                    .try_into()
                    .map_err(|_| ProtocolError::malformed("IPv4 address"))?;
                Ok(Self::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            FAMILY_V6 => {
                let port = wire::get_u16(buf, "endpoint port")?;
                let octets: [u8; 16] = wire::get_slice(buf, 16, "IPv6 address")?
                    .try_into()
                    .map_err(|_| ProtocolError::malformed("IPv6 address"))?;
                Ok(Self::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
            }
            FAMILY_LOCAL => {
                let len = usize::from(wire::get_u16(buf, "socket path length")?);
                let bytes = wire::get_slice(buf, len, "socket path")?;
                if bytes.is_empty() {
                    return Err(ProtocolError::malformed("empty socket path"));
                }
                Ok(Self::Local(PathBuf::from(std::ffi::OsStr::from_bytes(bytes))))
            }
            other => Err(ProtocolError::malformed(format!(
                "unknown endpoint family {other}"
            ))),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::V4(SocketAddrV4::new(
            DEFAULT_LISTEN_ADDR.parse().unwrap_or(Ipv4Addr::LOCALHOST),
            DEFAULT_LISTEN_PORT,
        ))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4(v4),
            SocketAddr::V6(v6) => Self::V6(v6),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix(LOCAL_SCHEME) {
            if path.is_empty() {
                return Err(ProtocolError::invalid_address("empty socket path"));
            }
            return Ok(Self::local(path));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::from(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::invalid_address(format!("'{s}' has no port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::invalid_address(format!("'{port}' is not a port")))?;
        Self::new(host, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr) => write!(f, "{addr}"),
            Self::V6(addr) => write!(f, "[{}]:{}", addr.ip(), addr.port()),
            Self::Local(path) => write!(f, "{LOCAL_SCHEME}{}", path.display()),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_roundtrip(ep: &Endpoint) -> Endpoint {
        let mut buf = BytesMut::new();
        ep.encode(&mut buf).unwrap();
        let mut slice: &[u8] = &buf;
        let decoded = Endpoint::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        decoded
    }

    #[test]
    fn parse_ipv4() {
        let ep: Endpoint = "127.0.0.1:11235".parse().unwrap();
        assert_eq!(ep, Endpoint::default());
        insta::assert_snapshot!(ep, @"127.0.0.1:11235");
    }

    #[test]
    fn parse_ipv6_forms() {
        let bracketed: Endpoint = "[::1]:4000".parse().unwrap();
        let bare: Endpoint = "::1:4000".parse().unwrap();
        assert_eq!(bracketed, bare);
        insta::assert_snapshot!(bare, @"[::1]:4000");
    }

    #[test]
    fn parse_local() {
        let ep: Endpoint = "file:///tmp/a.sock".parse().unwrap();
        assert_eq!(ep.local_path(), Some(Path::new("/tmp/a.sock")));
        assert!(ep.is_local());
        insta::assert_snapshot!(ep, @"file:///tmp/a.sock");
    }

    #[test]
    fn parse_errors() {
        for bad in ["", "file://", "localhost", "1.2.3.4", "1.2.3.4:http", "host:80", "1.2.3.4:70000"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(ProtocolError::InvalidAddress(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn new_from_parts() {
        assert_eq!(
            Endpoint::new("10.0.0.2", 99).unwrap().to_string(),
            "10.0.0.2:99"
        );
        assert_eq!(Endpoint::new("[fe80::1]", 5).unwrap().to_string(), "[fe80::1]:5");
        assert!(Endpoint::new("example.org", 1).is_err());
    }

    #[test]
    fn wire_layout_ipv4() {
        let mut buf = BytesMut::new();
        Endpoint::new("1.2.3.4", 0x0102).unwrap().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 0x02, 0x01, 1, 2, 3, 4]);
    }

    #[test]
    fn wire_every_family() {
        for text in ["192.168.1.9:1", "[2001:db8::7]:65535", "file:///run/user/1000/m.sock"] {
            let ep: Endpoint = text.parse().unwrap();
            assert_eq!(wire_roundtrip(&ep), ep);
        }
    }

    #[test]
    fn decode_rejects_unknown_family() {
        let mut slice: &[u8] = &[9, 0, 0];
        assert!(Endpoint::decode(&mut slice).is_err());
    }

    #[test]
    fn serde_as_string() {
        let ep: Endpoint = "file:///tmp/b.sock".parse().unwrap();
        let json = serde_json::to_string(&ep).unwrap();
        assert_eq!(json, "\"file:///tmp/b.sock\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep);
    }
}
