// Kernel connection-tracking event sources.
//
// The cache only needs a one-shot dump per address family, a live update
// stream, a stop hook and a stats snapshot. Sources decode their own wire
// format and hand over batches of `Con` records.

pub mod proc;

use std::collections::HashMap;

use crossbeam_channel::Receiver;

use crate::model::conntrack::Con;

pub use proc::ProcConntrack;

/// Records decoded from one kernel message or table read.
pub type Batch = Vec<Con>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Inet, AddressFamily::Inet6];

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Inet => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
        }
    }
}

pub trait EventSource: Send + Sync {
    /// Existing conntrack entries of one address family. The channel closes
    /// after the last batch.
    fn dump_table(&self, family: AddressFamily) -> Receiver<Batch>;

    /// Live create/update entries. The channel closes once the source stops.
    fn events(&self) -> Receiver<Batch>;

    /// Release the source's resources. Safe to call more than once.
    fn stop(&self);

    /// Source-side telemetry, merged into the cache's own stats.
    fn stats(&self) -> HashMap<String, i64>;
}
