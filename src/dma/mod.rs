//! DMA Reader (C2): drains a batch of DMA completions, decodes a per-event
//! timing header, allocates a pebble, and hands a fresh `EventDatagram` to
//! the caller. The kernel PGP/DMA ring itself is an external collaborator
//! (§1 scope) — `DmaSource` is the trait boundary a real driver binding
//! would implement; `SimDmaSource` is the synthetic stand-in used by the
//! demo binary and tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::model::{DatagramHeader, EventDatagram, Service};
use crate::pool::BufferPool;
use crate::time::Timestamp;

/// One decoded completion off the DMA ring, before pebble allocation.
#[derive(Debug, Clone)]
pub struct DmaCompletion {
    pub event_counter: u64,
    pub timestamp: Timestamp,
    pub pulse_id: u64,
    pub service: Service,
    /// Zero length or an error flag from the driver; skipped, counted, and
    /// never yields a pebble (§4.2).
    pub broken: bool,
}

/// External collaborator boundary: a real binding reads the kernel ring via
/// `dmaReadBulkIndex`; this trait captures just the batch-read contract the
/// matcher's reader needs.
pub trait DmaSource: Send {
    /// Returns up to `max` completions. An empty result means the ring had
    /// nothing ready — the reader must not block waiting for more; it
    /// returns `None` upward so the worker can run its timeout housekeeping.
    fn read_batch(&mut self, max: usize) -> Vec<DmaCompletion>;
}

const DEFAULT_MAX_RET_CNT: usize = 100;

/// Reads completions in batches, decodes timing headers, and allocates a
/// pebble from `BufferPool` per good completion.
pub struct DmaReader<S> {
    source: S,
    batch: VecDeque<DmaCompletion>,
    max_ret_cnt: usize,
    n_broken: u64,
    n_dma_errors: u64,
    n_read: u64,
}

impl<S: DmaSource> DmaReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            batch: VecDeque::new(),
            max_ret_cnt: DEFAULT_MAX_RET_CNT,
            n_broken: 0,
            n_dma_errors: 0,
            n_read: 0,
        }
    }

    pub fn with_max_ret_cnt(mut self, max_ret_cnt: usize) -> Self {
        self.max_ret_cnt = max_ret_cnt;
        self
    }

    pub fn n_broken(&self) -> u64 {
        self.n_broken
    }

    pub fn n_dma_errors(&self) -> u64 {
        self.n_dma_errors
    }

    pub fn n_read(&self) -> u64 {
        self.n_read
    }

    /// Pulls the next usable completion, allocating a pebble for it.
    /// Returns `None` if the ring is currently empty, or if every
    /// completion in the refilled batch was broken or hit pool exhaustion —
    /// never blocks.
    pub fn next(&mut self, pool: &BufferPool) -> Option<(u32, EventDatagram)> {
        if self.batch.is_empty() {
            let more = self.source.read_batch(self.max_ret_cnt);
            if more.is_empty() {
                return None;
            }
            self.n_read += more.len() as u64;
            self.batch.extend(more);
        }

        while let Some(completion) = self.batch.pop_front() {
            if completion.broken {
                self.n_broken += 1;
                continue;
            }
            match pool.allocate() {
                Ok(pebble_index) => {
                    let header = DatagramHeader {
                        time: completion.timestamp,
                        pulse_id: completion.pulse_id,
                        environment: 0,
                        service: completion.service,
                        source: 0,
                    };
                    return Some((pebble_index, EventDatagram::new(header)));
                }
                Err(_) => {
                    self.n_dma_errors += 1;
                    continue;
                }
            }
        }
        None
    }
}

/// Synthetic DMA source generating periodic `L1Accept` completions at a
/// fixed interval, by timed release rather than busy-polling.
pub struct SimDmaSource {
    interval: Duration,
    next_release: Instant,
    event_counter: u64,
    source_id: u32,
}

impl SimDmaSource {
    pub fn new(interval: Duration, source_id: u32) -> Self {
        Self {
            interval,
            next_release: Instant::now(),
            event_counter: 0,
            source_id,
        }
    }

    fn epics_now() -> Timestamp {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::new(now.as_secs() as u32, now.subsec_nanos())
    }
}

impl DmaSource for SimDmaSource {
    fn read_batch(&mut self, max: usize) -> Vec<DmaCompletion> {
        let now = Instant::now();
        if now < self.next_release {
            return Vec::new();
        }
        self.next_release = now + self.interval;
        let mut out = Vec::with_capacity(1.min(max));
        out.push(DmaCompletion {
            event_counter: self.event_counter,
            timestamp: Self::epics_now(),
            pulse_id: self.event_counter,
            service: Service::L1Accept,
            broken: false,
        });
        self.event_counter = self.event_counter.wrapping_add(1);
        let _ = self.source_id;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSource(VecDeque<Vec<DmaCompletion>>);

    impl DmaSource for ScriptedSource {
        fn read_batch(&mut self, _max: usize) -> Vec<DmaCompletion> {
            self.0.pop_front().unwrap_or_default()
        }
    }

    fn completion(counter: u64, broken: bool) -> DmaCompletion {
        DmaCompletion {
            event_counter: counter,
            timestamp: Timestamp::new(10, counter as u32),
            pulse_id: counter,
            service: Service::L1Accept,
            broken,
        }
    }

    #[test]
    fn skips_broken_completions() {
        let pool = BufferPool::new(4, 64);
        let mut reader = DmaReader::new(ScriptedSource(VecDeque::from(vec![vec![
            completion(0, true),
            completion(1, false),
        ]])));
        let (idx, dgram) = reader.next(&pool).expect("should yield the good completion");
        assert_eq!(idx, 0);
        assert_eq!(dgram.header.pulse_id, 1);
        assert_eq!(reader.n_broken(), 1);
    }

    #[test]
    fn empty_ring_never_blocks() {
        let pool = BufferPool::new(4, 64);
        let mut reader = DmaReader::new(ScriptedSource(VecDeque::new()));
        assert!(reader.next(&pool).is_none());
    }

    #[test]
    fn pool_exhaustion_is_counted_not_fatal() {
        let pool = BufferPool::new(1, 64);
        pool.allocate().unwrap(); // exhaust the only buffer
        let mut reader = DmaReader::new(ScriptedSource(VecDeque::from(vec![vec![completion(0, false)]])));
        assert!(reader.next(&pool).is_none());
        assert_eq!(reader.n_dma_errors(), 1);
    }
}
