use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identifies the inbound client a request is accounted to.
///
/// The identifier is supplied by whatever sits in front of the mediation
/// layer: an authentication layer can insert the user identity as a request
/// extension, otherwise the connection address is used.
///
/// # Examples
///
/// ```
/// use gambit_lib::ClientId;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let id = ClientId::from(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
/// assert_eq!(id.as_str(), "10.0.0.7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Identifier used when a request carries no usable client information
    pub const UNKNOWN: &'static str = "unknown";

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the identifier as an owned String
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// The identifier used for requests without client information
    #[must_use]
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        ClientId(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        ClientId(id.to_string())
    }
}

impl From<IpAddr> for ClientId {
    fn from(ip: IpAddr) -> Self {
        ClientId(ip.to_string())
    }
}

/// Only the IP is used, so that reconnecting from another port does not
/// yield a fresh bucket.
impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        ClientId::from(addr.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_client_id_from_socket_addr_ignores_port() {
        let a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        let b = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        assert_eq!(ClientId::from(a), ClientId::from(b));
        assert_eq!(ClientId::from(a).as_str(), "127.0.0.1");
    }

    #[test]
    fn test_client_id_is_case_sensitive() {
        assert_ne!(ClientId::from("Magnus"), ClientId::from("magnus"));
    }

    #[test]
    fn test_client_id_display() {
        let id = ClientId::from(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(format!("{id}"), "::1");
        assert_eq!(ClientId::unknown().as_str(), "unknown");
    }
}
