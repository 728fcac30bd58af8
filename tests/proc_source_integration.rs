//! /proc conntrack source integration tests.
//!
//! Each test builds a fake proc tree in a temporary directory, so no kernel
//! conntrack module or root privileges are needed.
//! Run with: `cargo test --test proc_source_integration`

use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use natcache::error::NatcacheError;
use natcache::model::{ConnTuple, ConnectionType};
use natcache::source::proc::discover_tables;
use natcache::source::{AddressFamily, EventSource, ProcConntrack};
use natcache::{Config, Conntracker};

const TCP_SNAT: &str = "ipv4     2 tcp      6 431999 ESTABLISHED src=10.0.0.5 dst=8.8.8.8 sport=4000 dport=443 src=8.8.8.8 dst=1.2.3.4 sport=443 dport=5000 [ASSURED] mark=0 zone=0 use=2";
const TCP_PLAIN: &str = "ipv4     2 tcp      6 300 ESTABLISHED src=10.0.0.5 dst=10.0.0.9 sport=4100 dport=22 src=10.0.0.9 dst=10.0.0.5 sport=22 dport=4100 [ASSURED] mark=0 zone=0 use=2";
const UDP_DNAT_V6: &str = "ipv6     10 udp      17 25 src=2001:db8::10 dst=2001:db8::80 sport=50000 dport=53 src=fd00::53 dst=2001:db8::10 sport=5353 dport=50000 mark=0 zone=0 use=2";
const ICMP: &str = "ipv4     2 icmp     1 29 src=10.0.0.5 dst=8.8.8.8 type=8 code=0 id=7 src=8.8.8.8 dst=1.2.3.4 type=0 code=0 id=7 mark=0 zone=0 use=2";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Temporary proc tree, removed on drop.
struct FakeProc {
    root: PathBuf,
}

impl FakeProc {
    fn new() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let root = std::env::temp_dir().join(format!(
            "natcache-proc-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn write_table(&self, dir: &Path, lines: &[&str]) -> PathBuf {
        let net = dir.join("net");
        fs::create_dir_all(&net).unwrap();
        let path = net.join("nf_conntrack");
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn root_table(&self, lines: &[&str]) -> PathBuf {
        self.write_table(&self.root, lines)
    }

    /// Add `<root>/<pid>` whose `ns/net` link points at `ns`.
    fn add_pid(&self, pid: u32, ns: &str, lines: &[&str]) -> PathBuf {
        let dir = self.root.join(pid.to_string());
        fs::create_dir_all(dir.join("ns")).unwrap();
        symlink(ns, dir.join("ns").join("net")).unwrap();
        self.write_table(&dir, lines)
    }
}

impl Drop for FakeProc {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn config(proc: &FakeProc) -> Config {
    Config {
        proc_root: proc.root.clone(),
        poll_interval: Duration::from_millis(50),
        init_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[test]
fn missing_table_is_an_error() {
    let proc = FakeProc::new();
    let result = ProcConntrack::new(&proc.root, 500, false, Duration::from_secs(1));
    assert!(matches!(result, Err(NatcacheError::EventSource(_))));

    let result = Conntracker::new(config(&proc));
    assert!(matches!(result, Err(NatcacheError::EventSource(_))));
}

#[test]
fn dump_filters_by_family() {
    let proc = FakeProc::new();
    let table = proc.root_table(&[TCP_SNAT, "garbage line", UDP_DNAT_V6]);
    let source = ProcConntrack::new(&proc.root, 500, false, Duration::from_secs(60)).unwrap();
    assert_eq!(source.tables(), vec![table].as_slice());

    let v4: Vec<_> = source.dump_table(AddressFamily::Inet).iter().flatten().collect();
    let v6: Vec<_> = source.dump_table(AddressFamily::Inet6).iter().flatten().collect();
    assert_eq!(v4.len(), 1);
    assert_eq!(v6.len(), 1);

    let stats = source.stats();
    assert_eq!(stats["parse_errors"], 2);
    assert_eq!(stats["namespaces"], 1);
    source.stop();
}

#[test]
fn stop_closes_event_stream() {
    let proc = FakeProc::new();
    proc.root_table(&[TCP_SNAT]);
    let source = ProcConntrack::new(&proc.root, 500, false, Duration::from_millis(20)).unwrap();
    let events = source.events();

    source.stop();
    source.stop();
    // Drain whatever was polled before the stop; then the channel is closed.
    let deadline = Instant::now() + Duration::from_secs(2);
    while events.recv_deadline(deadline).is_ok() {}
    assert!(events.is_empty());
}

#[test]
fn rate_limit_throttles_polls() {
    let proc = FakeProc::new();
    let lines: Vec<String> = (0..20)
        .map(|i| {
            format!(
                "ipv4 2 tcp 6 300 ESTABLISHED src=10.0.0.5 dst=8.8.8.8 sport={} dport=443 src=8.8.8.8 dst=1.2.3.4 sport=443 dport={} mark=0 use=1",
                4000 + i,
                5000 + i
            )
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    proc.root_table(&refs);

    let source = ProcConntrack::new(&proc.root, 5, false, Duration::from_millis(10)).unwrap();
    let events = source.events();
    let start = Instant::now();
    let mut received = 0;
    while received < 20 {
        received += events.recv_timeout(Duration::from_secs(5)).unwrap().len();
    }
    // 20 records at 5 per second need at least three window rollovers.
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(source.stats()["throttled_total"] > 0);
    source.stop();
}

// ---------------------------------------------------------------------------
// Namespace discovery
// ---------------------------------------------------------------------------

#[test]
fn discovery_keeps_one_table_per_namespace() {
    let proc = FakeProc::new();
    proc.root_table(&[]);
    let t100 = proc.add_pid(100, "net:[4026531992]", &[TCP_SNAT]);
    proc.add_pid(200, "net:[4026531992]", &[TCP_SNAT]);
    let t300 = proc.add_pid(300, "net:[4026532500]", &[UDP_DNAT_V6]);
    fs::create_dir_all(proc.root.join("self")).unwrap();
    fs::create_dir_all(proc.root.join("400")).unwrap();

    assert_eq!(discover_tables(&proc.root, true), vec![t100, t300]);
    assert_eq!(
        discover_tables(&proc.root, false),
        vec![proc.root.join("net").join("nf_conntrack")]
    );
}

#[test]
fn all_namespaces_loads_every_table() {
    let proc = FakeProc::new();
    let t1 = proc.add_pid(1, "net:[1]", &[TCP_SNAT]);
    let t57 = proc.add_pid(57, "net:[2]", &[UDP_DNAT_V6]);

    let source = ProcConntrack::new(&proc.root, 500, true, Duration::from_secs(60)).unwrap();
    assert_eq!(source.tables(), vec![t1, t57].as_slice());
    source.stop();

    let ct = Conntracker::new(Config {
        listen_all_namespaces: true,
        ..config(&proc)
    })
    .unwrap();
    assert_eq!(ct.len(), 4);
    assert_eq!(ct.get_stats()["namespaces"], 2);
    ct.close();
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[test]
fn cache_loads_nat_entries_from_table() {
    let proc = FakeProc::new();
    proc.root_table(&[TCP_SNAT, TCP_PLAIN, UDP_DNAT_V6, ICMP]);

    let ct = Conntracker::new(config(&proc)).unwrap();
    // The plain entry is not NAT and the ICMP entry has no ports.
    assert_eq!(ct.len(), 4);

    let t = ct
        .get_translation_for_conn(&ConnTuple::new(
            v4(10, 0, 0, 5),
            4000,
            v4(8, 8, 8, 8),
            443,
            ConnectionType::Tcp,
        ))
        .unwrap();
    assert_eq!(t.repl_dst_ip, v4(1, 2, 3, 4));
    assert_eq!(t.repl_dst_port, 5000);

    let client = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10));
    let vip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x80));
    let backend = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x53));
    let t = ct
        .get_translation_for_conn(&ConnTuple::new(client, 50000, vip, 53, ConnectionType::Udp))
        .unwrap();
    assert_eq!(t.repl_src_ip, backend);
    assert_eq!(t.repl_src_port, 5353);

    assert!(
        ct.get_translation_for_conn(&ConnTuple::new(
            v4(10, 0, 0, 5),
            4100,
            v4(10, 0, 0, 9),
            22,
            ConnectionType::Tcp,
        ))
        .is_none()
    );
    ct.close();
}

#[test]
fn poller_picks_up_new_connections() {
    let proc = FakeProc::new();
    let table = proc.root_table(&[TCP_SNAT]);
    let ct = Conntracker::new(config(&proc)).unwrap();
    assert_eq!(ct.len(), 2);

    let mut f = fs::OpenOptions::new().append(true).open(&table).unwrap();
    writeln!(f, "{UDP_DNAT_V6}").unwrap();
    drop(f);

    assert!(wait_until(|| ct.len() == 4));
    let stats = ct.get_stats();
    assert!(stats["polls_total"] > 0);
    assert!(stats["registers_total"] > 0);
    ct.close();
}
