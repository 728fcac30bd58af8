// User-space mirror of the kernel's NAT translations.
//
// Startup: open the event source, load its dump for every address family,
// then run two background threads for the life of the cache:
//   - ingestion: applies live conntrack create/update events
//   - compactor: periodically shrinks the table's backing storage
// Lookups and deletions come from the flow monitor on any thread.

pub mod nat;
pub mod state;
pub mod stats;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use parking_lot::Mutex;

use crate::error::NatcacheError;
use crate::loglimit::LogLimit;
use crate::model::conntrack::Con;
use crate::model::{ConnTuple, IpTranslation};
use crate::source::{AddressFamily, Batch, EventSource, ProcConntrack, proc};

use self::nat::{ConnKey, is_nat};
use self::state::TranslationState;
use self::stats::ConntrackStats;

pub const INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Cache configuration. Everything besides the table bound and the timers is
/// forwarded to the event source untouched.
#[derive(Debug, Clone)]
pub struct Config {
    pub proc_root: PathBuf,
    pub max_state_size: usize,
    pub target_rate_limit: usize,
    pub listen_all_namespaces: bool,
    pub poll_interval: Duration,
    pub init_timeout: Duration,
    pub compact_interval: Duration,
    pub exceeded_size_log_limit: usize,
    pub exceeded_size_log_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            max_state_size: 65_536,
            target_rate_limit: 500,
            listen_all_namespaces: false,
            poll_interval: proc::DEFAULT_POLL_INTERVAL,
            init_timeout: INITIALIZATION_TIMEOUT,
            compact_interval: COMPACT_INTERVAL,
            exceeded_size_log_limit: 10,
            exceeded_size_log_interval: Duration::from_secs(600),
        }
    }
}

/// Shared between the owner handle and the background threads.
struct Inner {
    state: TranslationState,
    stats: ConntrackStats,
    source: Box<dyn EventSource>,
    exceeded_size_log_limit: LogLimit,
    log_limit_burst: usize,
    log_limit_interval: Duration,
}

struct Workers {
    compact_done: Sender<()>,
    ingest: thread::JoinHandle<()>,
    compactor: thread::JoinHandle<()>,
}

/// NAT translation cache fed by kernel conntrack events.
pub struct Conntracker {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
}

impl Conntracker {
    /// Build a cache over the `/proc` conntrack tables described by `config`.
    pub fn new(config: Config) -> Result<Self, NatcacheError> {
        Self::with_source(config, |cfg| {
            let source = ProcConntrack::new(
                &cfg.proc_root,
                cfg.target_rate_limit,
                cfg.listen_all_namespaces,
                cfg.poll_interval,
            )?;
            Ok(Box::new(source) as Box<dyn EventSource>)
        })
    }

    /// Build a cache over an arbitrary event source.
    ///
    /// `open` runs on a separate thread together with the dump load. If the
    /// whole sequence does not finish within `config.init_timeout`, this
    /// returns `InitTimeout`; the abandoned attempt is told to give up and
    /// stops whatever source it already opened.
    pub fn with_source<F>(config: Config, open: F) -> Result<Self, NatcacheError>
    where
        F: FnOnce(&Config) -> Result<Box<dyn EventSource>, NatcacheError> + Send + 'static,
    {
        let timeout = config.init_timeout;
        let (result_tx, result_rx) = bounded::<Result<Conntracker, NatcacheError>>(1);
        // Never sent on; dropping the sender cancels the attempt.
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        thread::Builder::new()
            .name("natcache-init".into())
            .spawn(move || {
                let result = Self::new_once(config, open, &cancel_rx);
                // A late result is dropped here, which closes it.
                let _ = result_tx.send(result);
            })
            .map_err(|e| NatcacheError::Fatal(format!("spawn conntrack initializer: {e}")))?;

        match result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                drop(cancel_tx);
                Err(NatcacheError::InitTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(NatcacheError::Fatal(
                "conntrack initializer exited without a result".to_string(),
            )),
        }
    }

    fn new_once<F>(config: Config, open: F, cancel: &Receiver<()>) -> Result<Self, NatcacheError>
    where
        F: FnOnce(&Config) -> Result<Box<dyn EventSource>, NatcacheError>,
    {
        let source = open(&config)?;
        let exceeded_size_log_limit = match LogLimit::new(
            config.exceeded_size_log_limit,
            config.exceeded_size_log_interval,
        ) {
            Ok(l) => l,
            Err(e) => {
                source.stop();
                return Err(e);
            }
        };

        let inner = Arc::new(Inner {
            state: TranslationState::new(config.max_state_size),
            stats: ConntrackStats::default(),
            source,
            exceeded_size_log_limit,
            log_limit_burst: config.exceeded_size_log_limit,
            log_limit_interval: config.exceeded_size_log_interval,
        });

        for family in AddressFamily::ALL {
            let dump = inner.source.dump_table(family);
            if !inner.load_initial_state(&dump, cancel) {
                inner.shutdown_source();
                return Err(NatcacheError::InitTimeout(config.init_timeout));
            }
        }

        let workers = match spawn_workers(&inner, config.compact_interval) {
            Ok(w) => w,
            Err(e) => {
                inner.shutdown_source();
                return Err(e);
            }
        };

        log::info!(
            "initialized conntrack with target_rate_limit={} messages/sec, {} entries loaded",
            config.target_rate_limit,
            inner.state.len()
        );

        Ok(Self {
            inner,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Translation for a connection exactly as the flow monitor observed it.
    pub fn get_translation_for_conn(&self, c: &ConnTuple) -> Option<IpTranslation> {
        let started = Instant::now();
        let result = self.inner.state.get(&ConnKey::from_conn(c));
        self.inner.stats.record_get(started);
        result
    }

    /// Drop the cached translation of a finished connection, from whichever
    /// side it was observed. Unknown connections are ignored.
    pub fn delete_translation(&self, c: &ConnTuple) {
        let started = Instant::now();
        if self.inner.state.delete(c) {
            self.inner.stats.record_unregister();
        }
        self.inner.stats.record_unregister_time(started);
    }

    /// Point-in-time telemetry, merged with the event source's own counters.
    pub fn get_stats(&self) -> HashMap<String, i64> {
        let mut m = self.inner.stats.snapshot(self.inner.state.len());
        m.extend(self.inner.source.stats());
        m
    }

    pub fn len(&self) -> usize {
        self.inner.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.is_empty()
    }

    /// Copy of every cached key and translation.
    pub fn entries(&self) -> Vec<(ConnKey, IpTranslation)> {
        self.inner.state.entries()
    }

    /// Stop the event source and background threads. Later calls do nothing.
    pub fn close(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };
        self.inner.source.stop();
        drop(workers.compact_done);
        let _ = workers.compactor.join();
        let _ = workers.ingest.join();
        self.inner.exceeded_size_log_limit.close();
    }
}

impl Drop for Conntracker {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Load one dump sequence. Returns false if the load was cancelled.
    fn load_initial_state(&self, dump: &Receiver<Batch>, cancel: &Receiver<()>) -> bool {
        loop {
            let next = select! {
                recv(dump) -> batch => Some(batch.ok()),
                recv(cancel) -> _ => None,
            };
            match next {
                Some(Some(batch)) => {
                    for c in batch.iter().filter(|c| is_nat(c)) {
                        log::trace!("{c}");
                        self.insert(c);
                    }
                }
                Some(None) => return true,
                None => return false,
            }
        }
    }

    /// Apply one live conntrack event.
    fn register(&self, c: &Con) {
        // don't bother storing if the connection is not NAT
        if !is_nat(c) {
            self.stats.record_register_dropped();
            return;
        }

        let started = Instant::now();
        log::trace!("{c}");
        self.insert(c);
        self.stats.record_register(started);
    }

    fn insert(&self, c: &Con) {
        let outcome = self.state.register(c, || self.log_exceeded_size());
        for _ in 0..outcome.dropped {
            self.stats.record_register_dropped();
        }
    }

    fn log_exceeded_size(&self) {
        if self.exceeded_size_log_limit.should_log() {
            log::warn!(
                "exceeded maximum conntrack state size: {} entries. You may need to increase --max-state-size (will log first {} times, and then once every {:?})",
                self.state.max_size(),
                self.log_limit_burst,
                self.log_limit_interval
            );
        }
    }

    fn shutdown_source(&self) {
        self.source.stop();
        self.exceeded_size_log_limit.close();
    }
}

fn spawn_workers(inner: &Arc<Inner>, compact_interval: Duration) -> Result<Workers, NatcacheError> {
    let events = inner.source.events();
    let ingest_inner = Arc::clone(inner);
    let ingest = thread::Builder::new()
        .name("natcache-ingest".into())
        .spawn(move || ingest_loop(&ingest_inner, &events))
        .map_err(|e| NatcacheError::Fatal(format!("spawn conntrack ingest thread: {e}")))?;

    let (compact_done, done_rx) = bounded::<()>(0);
    let compact_inner = Arc::clone(inner);
    let compactor = thread::Builder::new()
        .name("natcache-compact".into())
        .spawn(move || compact_loop(&compact_inner, compact_interval, &done_rx))
        .map_err(|e| NatcacheError::Fatal(format!("spawn conntrack compactor: {e}")))?;

    Ok(Workers {
        compact_done,
        ingest,
        compactor,
    })
}

/// Ingestion thread: runs until the event source closes its stream.
fn ingest_loop(inner: &Inner, events: &Receiver<Batch>) {
    for batch in events.iter() {
        for c in &batch {
            inner.register(c);
        }
    }
}

/// Compactor thread: runs until `done` disconnects.
fn compact_loop(inner: &Inner, interval: Duration, done: &Receiver<()>) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        let stopped = select! {
            recv(ticker) -> _ => false,
            recv(done) -> _ => true,
        };
        if stopped {
            return;
        }
        inner.state.compact();
    }
}
