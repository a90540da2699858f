//! Client key generation and handling.

use std::fmt;
use std::net::IpAddr;

/// Prefix separating IP-address keys from logical client keys.
pub const IP_KEY_PREFIX: &str = "ip:";

/// A key that uniquely identifies the owner of rate limit state.
///
/// Logical clients (users, API keys) and IP addresses live in separate
/// namespaces: an IP key always carries the `ip:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    /// Key for a logical client.
    pub fn client(client_id: &str) -> Self {
        Self(client_id.to_string())
    }

    /// Key for an IP address.
    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("{}{}", IP_KEY_PREFIX, addr))
    }

    /// Whether this key tracks an IP address.
    pub fn is_ip(&self) -> bool {
        self.0.starts_with(IP_KEY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
