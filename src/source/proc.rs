// Linux conntrack source backed by /proc/net/nf_conntrack.
//
// 1. Discover one table per observed network namespace
// 2. dump_table(): read every table once, filtered by address family
// 3. events(): poll every table on an interval and re-emit all entries,
//    throttled to the configured record rate
//
// Each line looks like:
//   ipv4 2 tcp 6 431999 ESTABLISHED src=10.0.0.5 dst=8.8.8.8 sport=4000 dport=443
//     src=8.8.8.8 dst=1.2.3.4 sport=443 dport=5000 [ASSURED] mark=0 zone=0 use=2
// The first address group is the origin tuple, the second the reply tuple.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, after, bounded, select};
use parking_lot::Mutex;

use crate::error::NatcacheError;
use crate::model::conntrack::{Con, IpTuple, ProtoTuple};
use crate::source::{AddressFamily, Batch, EventSource};

/// Records per batch handed to consumers.
const BATCH_SIZE: usize = 128;

/// Capacity of the live event channel, in batches.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Default, Debug)]
struct SourceCounters {
    polls: AtomicI64,
    records: AtomicI64,
    parse_errors: AtomicI64,
    read_errors: AtomicI64,
    throttled: AtomicI64,
}

pub struct ProcConntrack {
    tables: Arc<Vec<PathBuf>>,
    counters: Arc<SourceCounters>,
    events_rx: Receiver<Batch>,
    done: Mutex<Option<Sender<()>>>,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProcConntrack {
    /// Open the conntrack table(s) under `proc_root` and start polling.
    ///
    /// `target_rate_limit` caps live records emitted per second. With
    /// `listen_all_namespaces`, every distinct network namespace visible in
    /// `proc_root` is read.
    pub fn new(
        proc_root: &Path,
        target_rate_limit: usize,
        listen_all_namespaces: bool,
        poll_interval: Duration,
    ) -> Result<Self, NatcacheError> {
        let tables: Vec<PathBuf> = discover_tables(proc_root, listen_all_namespaces)
            .into_iter()
            .filter(|p| fs::File::open(p).is_ok())
            .collect();
        if tables.is_empty() {
            return Err(NatcacheError::EventSource(format!(
                "no readable nf_conntrack table under {}",
                proc_root.display()
            )));
        }
        log::info!(
            "conntrack: reading {} table(s) under {}",
            tables.len(),
            proc_root.display()
        );

        let tables = Arc::new(tables);
        let counters = Arc::new(SourceCounters::default());
        let (events_tx, events_rx) = bounded::<Batch>(EVENT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = bounded::<()>(0);

        let poller = Poller {
            tables: Arc::clone(&tables),
            counters: Arc::clone(&counters),
            rate_limit: target_rate_limit.max(1),
            interval: poll_interval,
            tx: events_tx,
            done: done_rx,
        };
        let handle = thread::Builder::new()
            .name("natcache-poll".into())
            .spawn(move || poller.run())
            .map_err(|e| NatcacheError::Fatal(format!("spawn conntrack poller: {e}")))?;

        Ok(Self {
            tables,
            counters,
            events_rx,
            done: Mutex::new(Some(done_tx)),
            poller: Mutex::new(Some(handle)),
        })
    }

    /// Conntrack tables this source reads.
    pub fn tables(&self) -> &[PathBuf] {
        &self.tables
    }
}

impl EventSource for ProcConntrack {
    fn dump_table(&self, family: AddressFamily) -> Receiver<Batch> {
        let (tx, rx) = bounded::<Batch>(EVENT_CHANNEL_CAPACITY);
        let tables = Arc::clone(&self.tables);
        let counters = Arc::clone(&self.counters);

        let spawned = thread::Builder::new()
            .name("natcache-dump".into())
            .spawn(move || {
                for path in tables.iter() {
                    let cons = match read_table(path, Some(family), &counters) {
                        Ok(cons) => cons,
                        Err(e) => {
                            counters.read_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("conntrack dump of {} failed: {e}", path.display());
                            continue;
                        }
                    };
                    for chunk in cons.chunks(BATCH_SIZE) {
                        if tx.send(chunk.to_vec()).is_err() {
                            return;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            dump_unavailable(&self.counters, &e);
        }
        rx
    }

    fn events(&self) -> Receiver<Batch> {
        self.events_rx.clone()
    }

    fn stop(&self) {
        drop(self.done.lock().take());
        if let Some(h) = self.poller.lock().take() {
            let _ = h.join();
            log::info!("conntrack: poller stopped");
        }
    }

    fn stats(&self) -> HashMap<String, i64> {
        let c = &self.counters;
        HashMap::from([
            ("polls_total".to_string(), c.polls.load(Ordering::Relaxed)),
            ("records_total".to_string(), c.records.load(Ordering::Relaxed)),
            ("parse_errors".to_string(), c.parse_errors.load(Ordering::Relaxed)),
            ("read_errors".to_string(), c.read_errors.load(Ordering::Relaxed)),
            ("throttled_total".to_string(), c.throttled.load(Ordering::Relaxed)),
            ("namespaces".to_string(), self.tables.len() as i64),
        ])
    }
}

impl Drop for ProcConntrack {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    tables: Arc<Vec<PathBuf>>,
    counters: Arc<SourceCounters>,
    rate_limit: usize,
    interval: Duration,
    tx: Sender<Batch>,
    done: Receiver<()>,
}

impl Poller {
    /// Poll loop. Returns when `done` disconnects or nobody listens anymore;
    /// dropping `tx` then closes the event stream.
    fn run(self) {
        let ticker = crossbeam_channel::tick(self.interval);
        let mut window_start = Instant::now();
        let mut emitted_in_window = 0usize;

        loop {
            let stopped = select! {
                recv(ticker) -> _ => false,
                recv(self.done) -> _ => true,
            };
            if stopped {
                return;
            }
            self.counters.polls.fetch_add(1, Ordering::Relaxed);

            for path in self.tables.iter() {
                let cons = match read_table(path, None, &self.counters) {
                    Ok(cons) => cons,
                    Err(e) => {
                        self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("conntrack read of {} failed: {e}", path.display());
                        continue;
                    }
                };

                let mut rest = cons.as_slice();
                while !rest.is_empty() {
                    if window_start.elapsed() >= Duration::from_secs(1) {
                        window_start = Instant::now();
                        emitted_in_window = 0;
                    }
                    let budget = self.rate_limit - emitted_in_window;
                    if budget == 0 {
                        // Out of budget: wait for the next one-second window.
                        self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                        let wait = Duration::from_secs(1).saturating_sub(window_start.elapsed());
                        let stopped = select! {
                            recv(after(wait)) -> _ => false,
                            recv(self.done) -> _ => true,
                        };
                        if stopped {
                            return;
                        }
                        continue;
                    }

                    let n = rest.len().min(budget).min(BATCH_SIZE);
                    let (batch, tail) = rest.split_at(n);
                    let delivered = select! {
                        send(self.tx, batch.to_vec()) -> res => res.is_ok(),
                        recv(self.done) -> _ => false,
                    };
                    if !delivered {
                        return;
                    }
                    emitted_in_window += n;
                    rest = tail;
                }
            }
        }
    }
}

/// The dump thread could not start; the returned stream is already closed.
fn dump_unavailable(counters: &SourceCounters, e: &std::io::Error) {
    counters.read_errors.fetch_add(1, Ordering::Relaxed);
    log::warn!("conntrack: could not spawn dump thread: {e}");
}

/// Locate the nf_conntrack tables to read.
///
/// With `all_namespaces`, one table per distinct `ns/net` link found among
/// the numeric entries of `proc_root`, lowest pid first. Falls back to the
/// root table when no namespace could be resolved.
pub fn discover_tables(proc_root: &Path, all_namespaces: bool) -> Vec<PathBuf> {
    let root_table = proc_root.join("net").join("nf_conntrack");
    if !all_namespaces {
        return vec![root_table];
    }

    let mut pids: Vec<u32> = match fs::read_dir(proc_root) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect(),
        Err(e) => {
            log::warn!("conntrack: cannot list {}: {e}", proc_root.display());
            Vec::new()
        }
    };
    pids.sort_unstable();

    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for pid in pids {
        let pid_dir = proc_root.join(pid.to_string());
        let Ok(ns) = fs::read_link(pid_dir.join("ns").join("net")) else {
            continue;
        };
        if seen.insert(ns) {
            tables.push(pid_dir.join("net").join("nf_conntrack"));
        }
    }

    if tables.is_empty() {
        tables.push(root_table);
    }
    tables
}

/// Read and decode one table. Unparseable lines are counted and skipped.
fn read_table(
    path: &Path,
    family: Option<AddressFamily>,
    counters: &SourceCounters,
) -> Result<Vec<Con>, NatcacheError> {
    let content = fs::read_to_string(path).map_err(NatcacheError::Io)?;
    let mut cons = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_conntrack_line(line) {
            Some((fam, con)) => {
                if family.is_none_or(|f| f.as_raw() == fam) {
                    cons.push(con);
                }
            }
            None => {
                counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("conntrack: skipping malformed line: {line}");
            }
        }
    }

    counters
        .records
        .fetch_add(cons.len() as i64, Ordering::Relaxed);
    Ok(cons)
}

/// Parse one nf_conntrack line into its address family and record.
///
/// Returns `None` if the header is malformed, an address does not parse, or
/// fewer than two tuples are present. Entries without ports (ICMP and
/// friends) still parse; they just carry no port fields.
pub fn parse_conntrack_line(line: &str) -> Option<(i32, Con)> {
    let mut fields = line.split_whitespace();
    let _l3_name = fields.next()?;
    let family: i32 = fields.next()?.parse().ok()?;
    let _l4_name = fields.next()?;
    let proto: u8 = fields.next()?.parse().ok()?;

    let mut tuples = [IpTuple::default(); 2];
    let mut current: Option<usize> = None;

    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        if key == "src" {
            let next = current.map_or(0, |i| i + 1);
            if next >= tuples.len() {
                break;
            }
            current = Some(next);
        }
        let Some(i) = current else {
            continue;
        };
        let tuple = &mut tuples[i];
        match key {
            "src" => tuple.src = Some(value.parse::<IpAddr>().ok()?),
            "dst" => tuple.dst = Some(value.parse::<IpAddr>().ok()?),
            "sport" => {
                tuple.proto.get_or_insert_with(ProtoTuple::default).src_port =
                    Some(value.parse().ok()?)
            }
            "dport" => {
                tuple.proto.get_or_insert_with(ProtoTuple::default).dst_port =
                    Some(value.parse().ok()?)
            }
            _ => {}
        }
    }

    if current != Some(1) {
        return None;
    }
    for tuple in &mut tuples {
        tuple.proto.get_or_insert_with(ProtoTuple::default).number = Some(proto);
    }

    let [origin, reply] = tuples;
    Some((family, Con::new(origin, reply)))
}
