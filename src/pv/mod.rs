//! PV Monitor (C3): one instance per configured process variable. Owns a
//! per-PV freelist/queue pair and an `NotReady -> Armed -> Ready` state
//! machine (§4.3), plus the work-queue pump that decouples the transport's
//! callback thread from the body of `updated()` (grounded in
//! `original_source/psdaq/psdaq/epicstools/MonTracker.hh`'s `WorkQueue`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::model::{PvDatagram, MAX_RANK};
use crate::pool::BoundedQueue;
use crate::time::Timestamp;

/// `xtype[]`-equivalent mapping from a PV's wire element type to the shape
/// the container builder (C7) declares (§ SUPPLEMENTED FEATURES).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvElementType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
}

/// Parameters discovered by the first successful `updated()` probe.
#[derive(Debug, Clone, Copy)]
pub struct PvParams {
    pub element_type: PvElementType,
    pub n_elements: u32,
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvState {
    NotReady,
    Armed,
    Ready,
}

/// `{alias, message}` sent over the async error/warn side-channel (§6).
#[derive(Debug, Clone)]
pub struct AsyncNotice {
    pub alias: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetParamsError {
    /// The 3-second bounded wait elapsed before the monitor reached `Armed`.
    TimedOut,
}

/// One configured PV. `id` is the bit position in the matcher's `Remaining`
/// mask, assigned monotonically starting at 0 when the PV is connected.
pub struct PvMonitor {
    pub id: u32,
    pub alias: String,
    pub pv_name: String,
    buffer_size: usize,
    first_dim_override: u32,
    state: Mutex<PvState>,
    armed_cond: Condvar,
    params: Mutex<Option<PvParams>>,
    freelist: BoundedQueue<()>,
    pv_queue: BoundedQueue<PvDatagram>,
    n_missed: AtomicU64,
    notice_tx: Sender<AsyncNotice>,
}

impl PvMonitor {
    pub fn new(
        id: u32,
        alias: impl Into<String>,
        pv_name: impl Into<String>,
        capacity: usize,
        buffer_size: usize,
        first_dim_override: u32,
        notice_tx: Sender<AsyncNotice>,
    ) -> Self {
        let freelist = BoundedQueue::new(capacity);
        for _ in 0..capacity {
            freelist.push(()).expect("freelist sized to capacity");
        }
        Self {
            id,
            alias: alias.into(),
            pv_name: pv_name.into(),
            buffer_size,
            first_dim_override,
            state: Mutex::new(PvState::NotReady),
            armed_cond: Condvar::new(),
            params: Mutex::new(None),
            freelist,
            pv_queue: BoundedQueue::new(capacity),
            n_missed: AtomicU64::new(0),
            notice_tx,
        }
    }

    pub fn state(&self) -> PvState {
        *self.state.lock()
    }

    pub fn n_missed(&self) -> u64 {
        self.n_missed.load(Ordering::Relaxed)
    }

    /// Parameters probed by the first successful `updated()` call, if any.
    pub fn params(&self) -> Option<PvParams> {
        *self.params.lock()
    }

    /// Opens the queues for traffic; called by the control plane's
    /// `configure` handler.
    pub fn startup(&self) {
        self.freelist.startup();
        self.pv_queue.startup();
    }

    /// Shuts down the freelist and queue (`Ready -> NotReady`), unblocking
    /// any thread parked in `get_params`.
    pub fn shutdown(&self) {
        self.freelist.shutdown();
        self.pv_queue.shutdown();
        *self.state.lock() = PvState::NotReady;
        self.armed_cond.notify_all();
    }

    /// Blocks up to `timeout` for the monitor to reach `Armed`, then
    /// completes the `Armed -> Ready` transition and returns the probed
    /// parameters (§4.3).
    pub fn get_params(&self, timeout: Duration) -> Result<PvParams, GetParamsError> {
        let mut state = self.state.lock();
        if *state == PvState::NotReady {
            let result = self.armed_cond.wait_for(&mut state, timeout);
            if result.timed_out() && *state == PvState::NotReady {
                return Err(GetParamsError::TimedOut);
            }
        }
        if *state == PvState::Armed {
            *state = PvState::Ready;
        }
        drop(state);
        self.params.lock().ok_or(GetParamsError::TimedOut)
    }

    /// Runs on the PV work-queue thread (never the transport callback
    /// thread). `probe` discovers `(type, nElements, rank)` the first time
    /// it's called successfully; `now` is the EPICS timestamp the transport
    /// stamped the update with; `raw_payload` is the wire payload.
    pub fn updated(
        &self,
        now: Timestamp,
        raw_payload: &[u8],
        probe: impl FnOnce() -> Option<PvParams>,
    ) {
        if self.state() == PvState::Ready {
            self.push_update(now, raw_payload);
            return;
        }

        // NotReady or Armed: probe parameters and possibly promote.
        if self.params.lock().is_none() {
            match probe() {
                Some(p) => {
                    *self.params.lock() = Some(p);
                    let mut state = self.state.lock();
                    if *state == PvState::NotReady {
                        *state = PvState::Armed;
                    }
                    drop(state);
                    self.armed_cond.notify_all();
                }
                None => {
                    let _ = self.notice_tx.try_send(AsyncNotice {
                        alias: self.alias.clone(),
                        message: format!("failed to query parameters for {}", self.pv_name),
                    });
                }
            }
        }
    }

    fn push_update(&self, now: Timestamp, raw_payload: &[u8]) {
        if self.freelist.pop().is_none() {
            self.n_missed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let truncated = raw_payload.len() > self.buffer_size;
        let copy_len = raw_payload.len().min(self.buffer_size);
        let mut shape = [0u32; MAX_RANK];
        let total = copy_len as u32;
        if self.first_dim_override != 0 {
            shape[0] = self.first_dim_override;
            shape[1] = total / self.first_dim_override.max(1);
        } else {
            shape[0] = total;
        }
        let datagram = PvDatagram {
            time: now,
            pv_index: self.id,
            shape,
            payload: raw_payload[..copy_len].to_vec(),
            truncated,
        };
        if self.pv_queue.push(datagram).is_err() {
            // Queue closed or, despite the freelist token, momentarily full —
            // return the token and count the drop like a missed update.
            let _ = self.freelist.push(());
            self.n_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Transport reported a disconnect. Doesn't change the match state
    /// machine — the monitor simply stops producing until reconnect.
    pub fn on_disconnect(&self) {
        let _ = self.notice_tx.try_send(AsyncNotice {
            alias: self.alias.clone(),
            message: format!("{} disconnected", self.pv_name),
        });
    }

    /// Peeks the queue head without consuming it (matcher's `matchUp` step).
    pub fn peek(&self) -> Option<PvDatagram> {
        self.pv_queue.peek_cloned()
    }

    /// Consumes the queue head, returning its slot to the freelist.
    pub fn pop_consume(&self) -> Option<PvDatagram> {
        let datagram = self.pv_queue.pop()?;
        let _ = self.freelist.push(());
        Some(datagram)
    }

    /// Drops the queue head if it's at or older than `watermark`, returning
    /// its slot to the freelist. The head is the oldest by construction
    /// (per-PV monotonic delivery).
    pub fn timeout(&self, watermark: Timestamp) -> Option<PvDatagram> {
        let should_pop = self.pv_queue.peek_with(|d| d.time <= watermark).unwrap_or(false);
        if should_pop {
            self.pop_consume()
        } else {
            None
        }
    }
}

/// One job handed from a transport callback to the PV work-queue thread.
pub struct RawUpdate {
    pub time: Timestamp,
    pub payload: Vec<u8>,
}

/// Decouples transport callbacks (which must stay short) from the body of
/// `updated()`, mirroring `MonTracker::WorkQueue`. The transport thread
/// calls `submit`; a single pump thread drains jobs and invokes `updated`.
pub struct PvWorkQueue {
    tx: Sender<RawUpdate>,
    handle: Option<JoinHandle<()>>,
}

impl PvWorkQueue {
    pub fn spawn(
        monitor: std::sync::Arc<PvMonitor>,
        probe: impl Fn() -> Option<PvParams> + Send + 'static,
    ) -> Self {
        let (tx, rx): (Sender<RawUpdate>, Receiver<RawUpdate>) = crossbeam_channel::bounded(256);
        let handle = std::thread::Builder::new()
            .name(format!("pv-workq-{}", monitor.id))
            .spawn(move || {
                for job in rx.iter() {
                    monitor.updated(job.time, &job.payload, &probe);
                }
            })
            .expect("spawning PV work-queue thread");
        Self { tx, handle: Some(handle) }
    }

    /// Called from the transport's callback thread; never blocks for long.
    pub fn submit(&self, job: RawUpdate) -> bool {
        self.tx.try_send(job).is_ok()
    }
}

impl Drop for PvWorkQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_monitor(capacity: usize) -> (PvMonitor, Receiver<AsyncNotice>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let monitor = PvMonitor::new(0, "sig", "XPP:GON:01", capacity, 64, 0, tx);
        monitor.startup();
        (monitor, rx)
    }

    fn params() -> Option<PvParams> {
        Some(PvParams { element_type: PvElementType::Double, n_elements: 1, rank: 0 })
    }

    #[test]
    fn first_update_arms_then_ready_via_get_params() {
        let (monitor, _rx) = new_monitor(4);
        assert_eq!(monitor.state(), PvState::NotReady);
        monitor.updated(Timestamp::new(1, 0), b"x", params);
        assert_eq!(monitor.state(), PvState::Armed);
        let p = monitor.get_params(Duration::from_millis(100)).unwrap();
        assert_eq!(p.n_elements, 1);
        assert_eq!(monitor.state(), PvState::Ready);
    }

    #[test]
    fn get_params_times_out_without_any_update() {
        let (monitor, _rx) = new_monitor(4);
        let err = monitor.get_params(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, GetParamsError::TimedOut);
    }

    #[test]
    fn ready_update_enqueues_and_truncates_oversize_payload() {
        let (monitor, _rx) = new_monitor(4);
        monitor.updated(Timestamp::new(1, 0), b"x", params);
        monitor.get_params(Duration::from_millis(100)).unwrap();
        let big = vec![7u8; 100];
        monitor.updated(Timestamp::new(2, 0), &big, params);
        let d = monitor.peek().unwrap();
        assert!(d.truncated);
        assert_eq!(d.payload.len(), 64);
    }

    #[test]
    fn freelist_exhaustion_counts_missed_not_panic() {
        let (monitor, _rx) = new_monitor(1);
        monitor.updated(Timestamp::new(1, 0), b"x", params);
        monitor.get_params(Duration::from_millis(100)).unwrap();
        monitor.updated(Timestamp::new(2, 0), b"a", params);
        monitor.updated(Timestamp::new(3, 0), b"b", params);
        assert_eq!(monitor.n_missed(), 1);
    }

    #[test]
    fn timeout_pops_only_when_head_at_or_before_watermark() {
        let (monitor, _rx) = new_monitor(4);
        monitor.updated(Timestamp::new(1, 0), b"x", params);
        monitor.get_params(Duration::from_millis(100)).unwrap();
        monitor.updated(Timestamp::new(10, 0), b"a", params);
        assert!(monitor.timeout(Timestamp::new(5, 0)).is_none());
        assert!(monitor.timeout(Timestamp::new(10, 0)).is_some());
    }

    #[test]
    fn disconnect_emits_async_notice_without_changing_state() {
        let (monitor, rx) = new_monitor(4);
        monitor.updated(Timestamp::new(1, 0), b"x", params);
        monitor.get_params(Duration::from_millis(100)).unwrap();
        monitor.on_disconnect();
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.alias, "sig");
        assert_eq!(monitor.state(), PvState::Ready);
    }
}
