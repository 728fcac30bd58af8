use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Cache telemetry. Each counter is updated independently; a snapshot may
/// pair a count with a latency sum that is one sample ahead or behind.
#[derive(Default, Debug)]
pub struct ConntrackStats {
    gets: AtomicI64,
    get_time_total: AtomicI64,
    registers: AtomicI64,
    registers_dropped: AtomicI64,
    registers_total_time: AtomicI64,
    unregisters: AtomicI64,
    unregisters_total_time: AtomicI64,
}

impl ConntrackStats {
    pub fn record_get(&self, started: Instant) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.get_time_total
            .fetch_add(elapsed_nanos(started), Ordering::Relaxed);
    }

    pub fn record_register(&self, started: Instant) {
        self.registers.fetch_add(1, Ordering::Relaxed);
        self.registers_total_time
            .fetch_add(elapsed_nanos(started), Ordering::Relaxed);
    }

    pub fn record_register_dropped(&self) {
        self.registers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unregister(&self) {
        self.unregisters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unregister_time(&self, started: Instant) {
        self.unregisters_total_time
            .fetch_add(elapsed_nanos(started), Ordering::Relaxed);
    }

    pub fn gets(&self) -> i64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn registers(&self) -> i64 {
        self.registers.load(Ordering::Relaxed)
    }

    pub fn registers_dropped(&self) -> i64 {
        self.registers_dropped.load(Ordering::Relaxed)
    }

    pub fn unregisters(&self) -> i64 {
        self.unregisters.load(Ordering::Relaxed)
    }

    /// Build the named metrics map. A family is only reported once its count
    /// is nonzero, so per-operation averages never divide by zero.
    pub fn snapshot(&self, state_size: usize) -> HashMap<String, i64> {
        let mut m = HashMap::new();
        m.insert("state_size".to_string(), state_size as i64);

        let gets = self.gets();
        if gets != 0 {
            m.insert("gets_total".to_string(), gets);
            m.insert(
                "nanoseconds_per_get".to_string(),
                self.get_time_total.load(Ordering::Relaxed) / gets,
            );
        }

        let registers = self.registers();
        if registers != 0 {
            m.insert("registers_total".to_string(), registers);
            m.insert(
                "nanoseconds_per_register".to_string(),
                self.registers_total_time.load(Ordering::Relaxed) / registers,
            );
        }

        // Dump loads refuse entries without registering anything live.
        let dropped = self.registers_dropped();
        if dropped != 0 {
            m.insert("registers_dropped".to_string(), dropped);
        }

        let unregisters = self.unregisters();
        if unregisters != 0 {
            m.insert("unregisters_total".to_string(), unregisters);
            m.insert(
                "nanoseconds_per_unregister".to_string(),
                self.unregisters_total_time.load(Ordering::Relaxed) / unregisters,
            );
        }

        m
    }
}

fn elapsed_nanos(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_only_has_size() {
        let stats = ConntrackStats::default();
        let m = stats.snapshot(7);
        assert_eq!(m.len(), 1);
        assert_eq!(m["state_size"], 7);
    }

    #[test]
    fn families_appear_once_counted() {
        let stats = ConntrackStats::default();
        stats.record_get(Instant::now());
        stats.record_get(Instant::now());
        let m = stats.snapshot(0);
        assert_eq!(m["gets_total"], 2);
        assert!(m.contains_key("nanoseconds_per_get"));
        assert!(!m.contains_key("registers_total"));
        assert!(!m.contains_key("unregisters_total"));

        stats.record_register(Instant::now());
        stats.record_register_dropped();
        stats.record_unregister();
        stats.record_unregister_time(Instant::now());
        let m = stats.snapshot(0);
        assert_eq!(m["registers_total"], 1);
        assert_eq!(m["registers_dropped"], 1);
        assert!(m["nanoseconds_per_register"] >= 0);
        assert_eq!(m["unregisters_total"], 1);
        assert!(m["nanoseconds_per_unregister"] >= 0);
    }

    #[test]
    fn drops_are_reported_without_registrations() {
        let stats = ConntrackStats::default();
        stats.record_register_dropped();
        stats.record_register_dropped();
        let m = stats.snapshot(5);
        assert_eq!(m["registers_dropped"], 2);
        assert!(!m.contains_key("registers_total"));
        assert!(!m.contains_key("nanoseconds_per_register"));
    }

    #[test]
    fn unregister_time_without_hit_is_not_reported() {
        let stats = ConntrackStats::default();
        stats.record_unregister_time(Instant::now());
        assert!(!stats.snapshot(0).contains_key("unregisters_total"));
    }
}
