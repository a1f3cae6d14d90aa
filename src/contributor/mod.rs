//! Contributor Adapter (C5): hands a completed datagram to the downstream
//! event-builder. The event-builder itself is an external collaborator
//! (§1 scope) — `Contributor` is the trait boundary; `RecordingContributor`
//! is the in-memory stand-in used by the demo binary and tests.

use crate::model::EventDatagram;

/// Optional trigger-primitive plug-in invoked on an L1Accept's source XTC
/// to produce a small result XTC appended to the downstream slot (§4.5).
pub trait TriggerPrimitive: Send {
    fn evaluate(&mut self, datagram: &EventDatagram) -> Vec<u8>;
}

/// `sendToTeb`'s target: the single point of backpressure downstream. The
/// adapter does not buffer — a `Contributor` implementation that can't keep
/// up must apply its own backpressure (e.g. by blocking `send_to_teb`).
pub trait Contributor {
    fn send_to_teb(&mut self, pebble_index: u32, datagram: &EventDatagram);

    /// Called once per idle-branch iteration so the downstream contributor
    /// can age out its own per-event state.
    fn tick_timeout(&mut self) {}
}

/// Adapter wiring a `Contributor` to an optional trigger-primitive plug-in,
/// matching `sendToTeb`'s "copy header, optionally run trigger primitive,
/// hand off slot" sequence.
pub struct ContributorAdapter<C, T> {
    contributor: C,
    trigger: Option<T>,
}

impl<C: Contributor, T: TriggerPrimitive> ContributorAdapter<C, T> {
    pub fn new(contributor: C, trigger: Option<T>) -> Self {
        Self { contributor, trigger }
    }

    pub fn send(&mut self, pebble_index: u32, datagram: &mut EventDatagram) {
        if datagram.header.service == crate::model::Service::L1Accept {
            if let Some(trigger) = self.trigger.as_mut() {
                let result = trigger.evaluate(datagram);
                datagram.payload.0.extend_from_slice(&result);
            }
        }
        self.contributor.send_to_teb(pebble_index, datagram);
    }

    pub fn tick_timeout(&mut self) {
        self.contributor.tick_timeout();
    }

    pub fn contributor(&self) -> &C {
        &self.contributor
    }
}

/// Stand-in for "no trigger primitive configured" at call sites that still
/// need to name a concrete `T` for `ContributorAdapter<C, T>`.
pub struct NoopTrigger;

impl TriggerPrimitive for NoopTrigger {
    fn evaluate(&mut self, _datagram: &EventDatagram) -> Vec<u8> {
        Vec::new()
    }
}

/// In-memory `Contributor` used by tests and the demo binary: records every
/// handed-off datagram in admission order.
#[derive(Default)]
pub struct RecordingContributor {
    pub sent: Vec<(u32, EventDatagram)>,
    pub timeout_ticks: u64,
}

impl Contributor for RecordingContributor {
    fn send_to_teb(&mut self, pebble_index: u32, datagram: &EventDatagram) {
        self.sent.push((pebble_index, datagram.clone()));
    }

    fn tick_timeout(&mut self) {
        self.timeout_ticks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatagramHeader, Service};
    use crate::time::Timestamp;

    struct DoublingTrigger;
    impl TriggerPrimitive for DoublingTrigger {
        fn evaluate(&mut self, datagram: &EventDatagram) -> Vec<u8> {
            datagram.payload.0.iter().map(|b| b.wrapping_mul(2)).collect()
        }
    }

    fn header() -> DatagramHeader {
        DatagramHeader { time: Timestamp::new(1, 0), pulse_id: 0, environment: 0, service: Service::L1Accept, source: 0 }
    }

    #[test]
    fn trigger_primitive_result_is_appended() {
        let mut adapter = ContributorAdapter::new(RecordingContributor::default(), Some(DoublingTrigger));
        let mut datagram = EventDatagram::new(header());
        datagram.payload.0 = vec![1, 2, 3];
        adapter.send(0, &mut datagram);
        assert_eq!(datagram.payload.0, vec![1, 2, 3, 2, 4, 6]);
    }

    #[test]
    fn no_trigger_primitive_passes_through() {
        let mut adapter = ContributorAdapter::<_, DoublingTrigger>::new(RecordingContributor::default(), None);
        let mut datagram = EventDatagram::new(header());
        datagram.payload.0 = vec![9];
        adapter.send(0, &mut datagram);
        assert_eq!(datagram.payload.0, vec![9]);
    }
}
