// NAT classification and key/translation formatting.
//
// A conntrack entry whose reply tuple is the exact mirror of its origin tuple
// was never translated. Anything else carries NAT, and is stored under both
// tuples so the flow monitor can find it from either side of the translation.

use std::net::IpAddr;

use serde::Serialize;

use crate::model::conntrack::{Con, IpTuple};
use crate::model::{ConnTuple, ConnectionType, IpTranslation, normalize_addr};

/// Cache key: one directional view of a connection.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug, Serialize)]
pub struct ConnKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub transport: ConnectionType,
}

impl ConnKey {
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        transport: ConnectionType,
    ) -> Self {
        Self {
            src_ip: normalize_addr(src_ip),
            src_port,
            dst_ip: normalize_addr(dst_ip),
            dst_port,
            transport,
        }
    }

    /// Key for a connection exactly as the flow monitor observed it.
    pub fn from_conn(c: &ConnTuple) -> Self {
        Self::new(c.source, c.sport, c.dest, c.dport, c.conn_type)
    }

    /// Key for the same connection as seen from the far end.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            transport: self.transport,
        }
    }
}

/// Whether a conntrack entry represents an actual address or port translation.
///
/// Entries missing either tuple or any port are never NAT.
pub fn is_nat(c: &Con) -> bool {
    let (Some(origin), Some(reply)) = (c.origin.as_ref(), c.reply.as_ref()) else {
        return false;
    };
    let (Some(o), Some(r)) = (origin.endpoints(), reply.endpoints()) else {
        return false;
    };
    let (o_src, o_sport, o_dst, o_dport) = o;
    let (r_src, r_sport, r_dst, r_dport) = r;

    normalize_addr(o_src) != normalize_addr(r_dst)
        || normalize_addr(o_dst) != normalize_addr(r_src)
        || o_sport != r_dport
        || o_dport != r_sport
}

/// Build the cache key for a kernel tuple. Returns `None` for protocols other
/// than TCP and UDP, or when the tuple is incomplete.
pub fn format_key(tuple: &IpTuple) -> Option<ConnKey> {
    let (src, sport, dst, dport) = tuple.endpoints()?;
    let transport = ConnectionType::from_proto(tuple.proto?.number?)?;
    Some(ConnKey::new(src, sport, dst, dport, transport))
}

/// Build the translation stored for the opposite tuple. The tuple's own
/// source and destination become the reply-side values.
pub fn format_translation(tuple: &IpTuple) -> Option<IpTranslation> {
    let (src, sport, dst, dport) = tuple.endpoints()?;
    Some(IpTranslation {
        repl_src_ip: normalize_addr(src),
        repl_dst_ip: normalize_addr(dst),
        repl_src_port: sport,
        repl_dst_port: dport,
    })
}

/// The key a stored translation points back at: the mirror entry inserted
/// when the connection was registered.
pub fn translation_to_key(transport: ConnectionType, t: &IpTranslation) -> ConnKey {
    ConnKey::new(
        t.repl_src_ip,
        t.repl_src_port,
        t.repl_dst_ip,
        t.repl_dst_port,
        transport,
    )
}
