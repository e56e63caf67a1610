use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    // Writes
    pub events_stored_total: AtomicU64,
    pub chunk_tables_created_total: AtomicU64,

    // Reads
    pub queries_total: AtomicU64,
    pub chunk_statements_total: AtomicU64,
    pub chunks_pruned_total: AtomicU64,
    pub query_millis_total: AtomicU64,
    pub slow_queries_total: AtomicU64,

    // Errors
    pub operation_errors_total: AtomicU64,
    pub timeouts_total: AtomicU64,

    // Archive
    pub archive_entries_total: AtomicU64,
    pub restored_events_total: AtomicU64,

    // Routing
    pub shard_rebuilds_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_query_duration(&self, elapsed: Duration) {
        Self::add(&self.queries_total, 1);
        Self::add(&self.query_millis_total, elapsed.as_millis() as u64);
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            ("eventide_events_stored_total", &self.events_stored_total),
            (
                "eventide_chunk_tables_created_total",
                &self.chunk_tables_created_total,
            ),
            ("eventide_queries_total", &self.queries_total),
            (
                "eventide_chunk_statements_total",
                &self.chunk_statements_total,
            ),
            ("eventide_chunks_pruned_total", &self.chunks_pruned_total),
            ("eventide_query_millis_total", &self.query_millis_total),
            ("eventide_slow_queries_total", &self.slow_queries_total),
            (
                "eventide_operation_errors_total",
                &self.operation_errors_total,
            ),
            ("eventide_timeouts_total", &self.timeouts_total),
            ("eventide_archive_entries_total", &self.archive_entries_total),
            ("eventide_restored_events_total", &self.restored_events_total),
            ("eventide_shard_rebuilds_total", &self.shard_rebuilds_total),
        ];
        let mut s = String::new();
        for (name, counter) in counters {
            let _ = writeln!(
                s,
                "# TYPE {name} counter\n{name} {}",
                counter.load(Ordering::Relaxed)
            );
        }
        s
    }
}
