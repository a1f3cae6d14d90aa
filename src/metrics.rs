//! Ambient metrics (§7/§8 counters). Prometheus export is out of scope, but
//! the pipeline always carries a live counters block; this one just isn't
//! wired to an HTTP exporter.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct Snapshot {
    pub n_missed: u64,
    pub n_match: u64,
    pub n_missing_data: u64,
    pub n_timed_out: u64,
    pub n_too_old: u64,
    pub n_dma_errors: u64,
    pub n_sent: u64,
}

#[derive(Default)]
struct Inner {
    snapshot: Snapshot,
}

/// Shared counters block, cloneable via `Arc` the way the matcher, PV
/// monitors, and control plane all need to contribute to the same block.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    inner: Arc<Mutex<Inner>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot
    }

    pub fn incr_missed(&self, n: u64) {
        self.inner.lock().snapshot.n_missed += n;
    }

    pub fn incr_match(&self, n: u64) {
        self.inner.lock().snapshot.n_match += n;
    }

    pub fn incr_missing_data(&self, n: u64) {
        self.inner.lock().snapshot.n_missing_data += n;
    }

    pub fn incr_timed_out(&self, n: u64) {
        self.inner.lock().snapshot.n_timed_out += n;
    }

    pub fn incr_too_old(&self, n: u64) {
        self.inner.lock().snapshot.n_too_old += n;
    }

    pub fn incr_dma_errors(&self, n: u64) {
        self.inner.lock().snapshot.n_dma_errors += n;
    }

    pub fn incr_sent(&self, n: u64) {
        self.inner.lock().snapshot.n_sent += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_clones() {
        let m = PipelineMetrics::new();
        let m2 = m.clone();
        m.incr_match(3);
        m2.incr_match(2);
        assert_eq!(m.snapshot().n_match, 5);
    }
}
