pub mod conntrack;

use std::net::IpAddr;

use serde::Serialize;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Transport protocol of a connection, as reported by the flow monitor.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Tcp,
    Udp,
}

impl ConnectionType {
    /// Map an IP protocol number onto a connection type. Anything other than
    /// TCP or UDP is not representable.
    pub fn from_proto(number: u8) -> Option<Self> {
        match number {
            IPPROTO_TCP => Some(Self::Tcp),
            IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A connection as observed by the flow monitor: one directional 5-tuple.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    pub source: IpAddr,
    pub sport: u16,
    pub dest: IpAddr,
    pub dport: u16,
    pub conn_type: ConnectionType,
}

impl ConnTuple {
    pub fn new(
        source: IpAddr,
        sport: u16,
        dest: IpAddr,
        dport: u16,
        conn_type: ConnectionType,
    ) -> Self {
        Self {
            source,
            sport,
            dest,
            dport,
            conn_type,
        }
    }
}

/// The reply-side address pair a connection was translated to.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
pub struct IpTranslation {
    pub repl_src_ip: IpAddr,
    pub repl_dst_ip: IpAddr,
    pub repl_src_port: u16,
    pub repl_dst_port: u16,
}

/// Normalize an address into the cache's representation.
///
/// IPv4-mapped IPv6 (`::ffff:x.x.x.x`) collapses to plain IPv4 so that both
/// spellings hash to the same key.
pub fn normalize_addr(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
