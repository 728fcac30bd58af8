use std::fmt;
use std::net::IpAddr;

/// Protocol-specific part of a conntrack tuple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtoTuple {
    pub number: Option<u8>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// One direction of a kernel conntrack entry. Every field is optional because
/// the kernel omits attributes it has no value for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpTuple {
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub proto: Option<ProtoTuple>,
}

impl IpTuple {
    pub fn new(src: IpAddr, sport: u16, dst: IpAddr, dport: u16, proto: u8) -> Self {
        Self {
            src: Some(src),
            dst: Some(dst),
            proto: Some(ProtoTuple {
                number: Some(proto),
                src_port: Some(sport),
                dst_port: Some(dport),
            }),
        }
    }

    /// Addresses and ports, if all four are present.
    pub fn endpoints(&self) -> Option<(IpAddr, u16, IpAddr, u16)> {
        let proto = self.proto.as_ref()?;
        Some((self.src?, proto.src_port?, self.dst?, proto.dst_port?))
    }
}

/// A decoded conntrack entry: the original request tuple and the tuple the
/// kernel expects replies on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Con {
    pub origin: Option<IpTuple>,
    pub reply: Option<IpTuple>,
}

impl Con {
    pub fn new(origin: IpTuple, reply: IpTuple) -> Self {
        Self {
            origin: Some(origin),
            reply: Some(reply),
        }
    }
}

impl fmt::Display for IpTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = self.proto.unwrap_or_default();
        write!(
            f,
            "src={} dst={} sport={} dport={} proto={}",
            fmt_opt(self.src),
            fmt_opt(self.dst),
            fmt_opt(proto.src_port),
            fmt_opt(proto.dst_port),
            fmt_opt(proto.number),
        )
    }
}

impl fmt::Display for Con {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "origin=[{}] reply=[{}]",
            fmt_opt(self.origin),
            fmt_opt(self.reply)
        )
    }
}

fn fmt_opt<T: fmt::Display>(v: Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}
