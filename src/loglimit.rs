use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;

use crate::error::NatcacheError;

/// Rate limiter for repetitive log lines.
///
/// Allows the first `limit` messages, then at most one per `interval`.
pub struct LogLimit {
    count: Arc<AtomicI64>,
    limit: i64,
    done: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogLimit {
    pub fn new(limit: usize, interval: Duration) -> Result<Self, NatcacheError> {
        let limit = limit.max(1) as i64;
        let count = Arc::new(AtomicI64::new(0));
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let c = Arc::clone(&count);
        let handle = thread::Builder::new()
            .name("natcache-loglimit".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    let stopped = select! {
                        recv(ticker) -> _ => false,
                        recv(done_rx) -> _ => true,
                    };
                    if stopped {
                        return;
                    }
                    // Past the burst: re-arm exactly one message.
                    if c.load(Ordering::Relaxed) >= limit {
                        c.store(limit - 1, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| NatcacheError::Fatal(format!("spawn log limiter: {e}")))?;

        Ok(Self {
            count,
            limit,
            done: Mutex::new(Some(done_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the caller should emit its log line now.
    pub fn should_log(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) < self.limit
    }

    /// Stop the re-arm timer. Further calls only succeed while still inside
    /// the initial burst.
    pub fn close(&self) {
        drop(self.done.lock().take());
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}

impl Drop for LogLimit {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_silent() {
        let limit = LogLimit::new(3, Duration::from_secs(3600)).unwrap();
        assert!(limit.should_log());
        assert!(limit.should_log());
        assert!(limit.should_log());
        assert!(!limit.should_log());
        assert!(!limit.should_log());
        limit.close();
    }

    #[test]
    fn rearms_once_per_interval() {
        let limit = LogLimit::new(1, Duration::from_millis(20)).unwrap();
        assert!(limit.should_log());
        assert!(!limit.should_log());

        thread::sleep(Duration::from_millis(100));
        assert!(limit.should_log());
        limit.close();
    }

    #[test]
    fn close_is_idempotent() {
        let limit = LogLimit::new(2, Duration::from_millis(10)).unwrap();
        limit.close();
        limit.close();
        assert!(limit.should_log());
    }
}
