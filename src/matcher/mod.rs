//! Matcher / Worker (C4): the single matcher thread. Pulls detector events
//! off the DMA reader, pairs each against every subscribed PV under the
//! three-way timestamp comparison, emits completed records downstream, and
//! drives the timeout watermark when the ring goes idle (§4.4).

use std::time::Duration;

use crate::container::{ContainerBuilder, NamesLookup, map_element_type};
use crate::contributor::{Contributor, ContributorAdapter, TriggerPrimitive};
use crate::dma::{DmaReader, DmaSource};
use crate::metrics::PipelineMetrics;
use crate::model::{Damage, EventDatagram, PendingEvent, Remaining, Service};
use crate::pool::BufferPool;
use crate::pv::PvMonitor;
use crate::time::{self, MatchDegree, Timestamp};

pub const DEFAULT_TIMEOUT_MS: u64 = 1500;

/// Per-run counters the control plane and CLI surface as metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatcherStats {
    pub n_match: u64,
    pub n_missing_data: u64,
    pub n_timed_out: u64,
    pub n_too_old: u64,
    pub n_sent: u64,
}

/// The matcher's single-threaded worker loop plus its owned pending-event
/// queue. Constructed once per `configure` transition, torn down on
/// `unconfigure`.
pub struct Matcher<S, C, T, N> {
    reader: DmaReader<S>,
    pool: BufferPool,
    pv_monitors: Vec<std::sync::Arc<PvMonitor>>,
    pending: std::collections::VecDeque<(PendingEvent, EventDatagram)>,
    adapter: ContributorAdapter<C, T>,
    names: N,
    degree: MatchDegree,
    timeout: Duration,
    running: bool,
    stats: MatcherStats,
    metrics: PipelineMetrics,
}

impl<S: DmaSource, C: Contributor, T: TriggerPrimitive, N: NamesLookup> Matcher<S, C, T, N> {
    pub fn new(
        reader: DmaReader<S>,
        pool: BufferPool,
        pv_monitors: Vec<std::sync::Arc<PvMonitor>>,
        adapter: ContributorAdapter<C, T>,
        names: N,
        degree: MatchDegree,
        timeout: Duration,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            reader,
            pool,
            pv_monitors,
            pending: std::collections::VecDeque::new(),
            adapter,
            names,
            degree,
            timeout,
            running: false,
            stats: MatcherStats::default(),
            metrics,
        }
    }

    pub fn stats(&self) -> MatcherStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One iteration of the loop body described in §4.4. `now` stands in
    /// for the wall clock used to compute the timeout watermark; callers in
    /// production code pass `Timestamp` derived from `SystemTime::now()`,
    /// tests pass a controlled value.
    pub fn tick(&mut self, now: Timestamp) {
        match self.reader.next(&self.pool) {
            Some((pebble_index, datagram)) => {
                let n_pvs = self.pv_monitors.len();
                let remaining = if datagram.header.service == Service::L1Accept {
                    Remaining::all(n_pvs)
                } else {
                    Remaining::none()
                };
                let pending = PendingEvent {
                    pebble_index,
                    remaining,
                    service: datagram.header.service,
                    time: datagram.header.time,
                };
                self.pending.push_back((pending, datagram));
                self.match_up();
            }
            None => {
                self.match_up();
                let watermark = now.checked_sub_millis(self.timeout.as_millis() as u64);
                self.run_timeout(watermark);
            }
        }
    }

    /// §4.4 step 2: drains the pending queue while its head is fully
    /// reconciled, stopping at the first event still awaiting a PV.
    fn match_up(&mut self) {
        loop {
            let head_service = match self.pending.front() {
                Some((pending, _)) => pending.service,
                None => break,
            };

            if head_service == Service::L1Accept {
                if !self.try_match_head() {
                    break;
                }
            } else {
                self.dispatch_transition();
            }
        }
    }

    /// Attempts to reconcile every still-pending PV against the head event.
    /// Returns `true` if the head was fully reconciled and dispatched.
    fn try_match_head(&mut self) -> bool {
        let (mut pending, mut datagram) = self.pending.pop_front().expect("checked non-empty");

        let ids: Vec<u32> = pending.remaining.iter().collect();
        for id in ids {
            let monitor = &self.pv_monitors[id as usize];
            let head = match monitor.peek() {
                Some(d) => d,
                None => continue, // leave the bit set
            };

            match time::compare(self.degree, pending.time, head.time) {
                time::Comparison::Equal => {
                    let pv = monitor.pop_consume().expect("just peeked");
                    let params = monitor.params().expect("armed before producing a PV datagram");
                    let record = ContainerBuilder::write(
                        &mut self.names,
                        id,
                        map_element_type(params.element_type),
                        pv.shape,
                        params.rank,
                        &pv.payload,
                    );
                    datagram.payload.0.extend_from_slice(&record);
                    pending.remaining.clear_bit(id);
                    self.stats.n_match += 1;
                    self.metrics.incr_match(1);
                }
                time::Comparison::EventOlder => {
                    datagram.damage.increase(Damage::MISSING_DATA);
                    pending.remaining.clear_bit(id);
                    self.stats.n_missing_data += 1;
                    self.metrics.incr_missing_data(1);
                    // leave the PV queued for a later event
                }
                time::Comparison::EventNewer => {
                    // discard the stale PV, keep the bit set, try the next PV id
                    let _ = monitor.pop_consume();
                    self.stats.n_too_old += 1;
                    self.metrics.incr_too_old(1);
                }
            }
        }

        if pending.remaining.is_empty() {
            self.dispatch(pending, datagram);
            true
        } else {
            self.pending.push_front((pending, datagram));
            false
        }
    }

    fn dispatch_transition(&mut self) {
        let (pending, mut datagram) = self.pending.pop_front().expect("checked non-empty");
        match pending.service {
            Service::Enable => self.running = true,
            Service::Disable => self.running = false,
            _ => {}
        }
        if pending.service != Service::SlowUpdate {
            // real pairing with a separate transition-pool datagram happens
            // in contributor::send_transition; here we just forward.
        }
        datagram.header.service = pending.service;
        self.dispatch(pending, datagram);
    }

    fn dispatch(&mut self, pending: PendingEvent, mut datagram: EventDatagram) {
        self.check_over_size(&datagram);
        self.adapter.send(pending.pebble_index, &mut datagram);
        self.stats.n_sent += 1;
        self.metrics.incr_sent(1);
        self.pool.free(pending.pebble_index);
    }

    /// §4.4c: a datagram too large for its arena's buffer is a
    /// configuration bug, not a recoverable runtime condition.
    fn check_over_size(&self, datagram: &EventDatagram) {
        let limit = self.pool.buffer_size();
        assert!(
            datagram.total_size() <= limit,
            "datagram of {} bytes exceeds pebble buffer size {limit}",
            datagram.total_size()
        );
    }

    /// §4.4 step 3: idle-branch timeout housekeeping. Drops stale PV
    /// entries and, if the pending queue's head is an L1Accept older than
    /// the watermark, damages and dispatches it.
    fn run_timeout(&mut self, watermark: Timestamp) {
        for monitor in &self.pv_monitors {
            while monitor.timeout(watermark).is_some() {}
        }

        if let Some((pending, _)) = self.pending.front() {
            if pending.service == Service::L1Accept && pending.time < watermark {
                let (pending, mut datagram) = self.pending.pop_front().expect("checked non-empty");
                datagram.damage.increase(Damage::TIMED_OUT);
                self.stats.n_timed_out += 1;
                self.metrics.incr_timed_out(1);
                self.dispatch(pending, datagram);
            }
        }

        self.adapter.tick_timeout();
    }
}

impl<S: DmaSource, N: NamesLookup> Matcher<S, crate::contributor::RecordingContributor, crate::contributor::NoopTrigger, N> {
    /// Test/demo accessors into the in-memory contributor's send log.
    pub fn contributor_sent_len(&self) -> usize {
        self.adapter.contributor().sent.len()
    }

    pub fn contributor_sent(&self) -> &[(u32, EventDatagram)] {
        &self.adapter.contributor().sent
    }
}
