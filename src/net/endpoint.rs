//! Network endpoint types.
//!
//! Listen and connect addresses arrive as zmq-style URL strings
//! (`tcp://host:port`, with `*` standing for all interfaces); [`Endpoint`]
//! is their resolved form and the only address type the sockets accept.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use super::NetError;

/// A network endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`] that provides a stable API across
/// the socket roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a new IPv4 endpoint.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// Creates an endpoint bound to all interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Parses a `tcp://host:port` address string.
    ///
    /// The scheme is optional; `*` as the host binds all interfaces and
    /// hostnames are resolved through the system resolver (first result
    /// wins).
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Addr`] for a non-tcp scheme, a missing or
    /// unparsable port, or a hostname that does not resolve.
    pub fn parse(addr: &str) -> Result<Self, NetError> {
        let bad = || NetError::Addr(addr.to_string());

        let rest = match addr.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(bad()),
            None => addr,
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;

        if host == "*" {
            return Ok(Self::any(port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::new(ip, port));
        }
        let mut resolved = (host, port).to_socket_addrs().map_err(|_| bad())?;
        resolved.next().map(Self).ok_or_else(bad)
    }

    /// Returns the address as a `tcp://ip:port` URL string.
    #[must_use]
    pub fn to_url(&self) -> String {
        format!("tcp://{}", self.0)
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self(SocketAddr::V4(addr))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_new_v4() {
        let ep = Endpoint::new_v4(192, 168, 1, 100, 8080);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn endpoint_any() {
        let ep = Endpoint::any(9000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn parse_full_url() {
        let ep = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(ep, Endpoint::localhost(5555));
    }

    #[test]
    fn parse_wildcard_host() {
        let ep = Endpoint::parse("tcp://*:6124").unwrap();
        assert_eq!(ep, Endpoint::any(6124));
    }

    #[test]
    fn parse_bare_addr() {
        let ep = Endpoint::parse("10.0.0.1:5000").unwrap();
        assert_eq!(ep.as_socket_addr(), "10.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn parse_rejects_scheme_and_garbage() {
        assert!(Endpoint::parse("udp://1.2.3.4:1").is_err());
        assert!(Endpoint::parse("tcp://1.2.3.4").is_err());
        assert!(Endpoint::parse("tcp://1.2.3.4:notaport").is_err());
    }

    #[test]
    fn url_roundtrip() {
        let ep = Endpoint::new_v4(127, 0, 0, 1, 8080);
        assert_eq!(ep.to_url(), "tcp://127.0.0.1:8080");
        assert_eq!(Endpoint::parse(&ep.to_url()).unwrap(), ep);
    }
}
