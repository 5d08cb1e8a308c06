//! # Listener protocol
//!
//! One listener per configured metric. A listener contributes instructions
//! at four points of a method rewrite:
//!
//! - `on_prepare`: once, ahead of every `on_enter`, for state that must be
//!   in place before the protected region opens
//! - `on_enter`: once, before any original instruction
//! - `on_exit`: before every normal return, and once on the exceptional
//!   unwind path
//! - `on_finalize`: after the body is laid out, to ask for a protected
//!   region when the listener must observe thrown exceptions
//!
//! | kind      | prepare          | enter                      | exit                           |
//! |-----------|------------------|----------------------------|--------------------------------|
//! | Counter   | nothing          | `counterInc(name, labels)` | nothing                        |
//! | Gauge     | nothing          | `gaugeInc` or `gaugeDec`   | nothing                        |
//! | Histogram | labels to a local| start time to a local      | `recordTime(name, labels, dt)` |

use weaver_unit::{Insn, TypeDesc, ValueKind};

use crate::config::{GaugeOp, Metric, MetricKind};
use crate::labels::{emit_label_array, Binding};
use crate::reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    NormalReturn,
    Exception,
}

/// What the method being rewritten looks like to a listener.
#[derive(Debug, Clone, Copy)]
pub struct MethodShape<'a> {
    pub params: &'a [TypeDesc],
    pub is_static: bool,
}

/// Requests collected by `on_finalize`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProtectionPlan {
    requested_by: Vec<String>,
}

impl ProtectionPlan {
    pub fn request(&mut self, metric: &str) {
        self.requested_by.push(metric.to_string());
    }

    pub fn is_required(&self) -> bool {
        !self.requested_by.is_empty()
    }

    pub fn requested_by(&self) -> &[String] {
        &self.requested_by
    }
}

/// Hands out fresh local slots above everything the original body uses.
#[derive(Debug, Clone, Copy)]
pub struct SlotAllocator {
    next: u16,
}

impl SlotAllocator {
    pub fn new(first_free: u16) -> Self {
        Self { next: first_free }
    }

    /// `None` once the slot space is used up.
    pub fn allocate(&mut self) -> Option<u16> {
        let slot = self.next;
        self.next = self.next.checked_add(1)?;
        Some(slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    Counter,
    Gauge(GaugeOp),
    Histogram {
        /// Holds the `nanoTime` reading taken on entry.
        start_slot: u16,
        /// Holds the label array built on entry.
        labels_slot: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub metric: String,
    pub bindings: Vec<Binding>,
    pub kind: ListenerKind,
}

impl Listener {
    /// `None` when `slots` cannot provide the locals this kind needs.
    pub fn new(metric: &Metric, bindings: Vec<Binding>, slots: &mut SlotAllocator) -> Option<Self> {
        let kind = match metric.kind {
            MetricKind::Counter => ListenerKind::Counter,
            MetricKind::Gauge => ListenerKind::Gauge(metric.gauge_op),
            MetricKind::Histogram => ListenerKind::Histogram {
                start_slot: slots.allocate()?,
                labels_slot: slots.allocate()?,
            },
        };
        Some(Self {
            metric: metric.name.clone(),
            bindings,
            kind,
        })
    }

    /// Whether exits on the exceptional path must reach this listener.
    pub fn needs_protection(&self) -> bool {
        matches!(self.kind, ListenerKind::Histogram { .. })
    }

    pub fn on_prepare(&self, shape: MethodShape<'_>, out: &mut Vec<Insn>) {
        if let ListenerKind::Histogram { labels_slot, .. } = &self.kind {
            emit_label_array(&self.bindings, shape.params, shape.is_static, out);
            out.push(Insn::Store(ValueKind::Ref, *labels_slot));
        }
    }

    pub fn on_enter(&self, shape: MethodShape<'_>, out: &mut Vec<Insn>) {
        match &self.kind {
            ListenerKind::Counter => self.report(reporter::COUNTER_INC, shape, out),
            ListenerKind::Gauge(GaugeOp::Increment) => self.report(reporter::GAUGE_INC, shape, out),
            ListenerKind::Gauge(GaugeOp::Decrement) => self.report(reporter::GAUGE_DEC, shape, out),
            ListenerKind::Histogram { start_slot, .. } => {
                out.push(Insn::InvokeStatic(reporter::nano_time()));
                out.push(Insn::Store(ValueKind::Long, *start_slot));
            }
        }
    }

    /// Instructions for one exit. They leave the operand stack as they
    /// found it, so they can run above a pending return value or exception.
    pub fn on_exit(&self, _signal: ExitSignal, _shape: MethodShape<'_>, out: &mut Vec<Insn>) {
        if let ListenerKind::Histogram {
            start_slot,
            labels_slot,
        } = &self.kind
        {
            out.push(Insn::PushStr(self.metric.clone()));
            out.push(Insn::Load(ValueKind::Ref, *labels_slot));
            out.push(Insn::InvokeStatic(reporter::nano_time()));
            out.push(Insn::Load(ValueKind::Long, *start_slot));
            out.push(Insn::LSub);
            out.push(Insn::InvokeStatic(reporter::reporter_call(reporter::RECORD_TIME)));
        }
    }

    pub fn on_finalize(&self, plan: &mut ProtectionPlan) {
        if self.needs_protection() {
            plan.request(&self.metric);
        }
    }

    fn report(&self, method: &str, shape: MethodShape<'_>, out: &mut Vec<Insn>) {
        out.push(Insn::PushStr(self.metric.clone()));
        emit_label_array(&self.bindings, shape.params, shape.is_static, out);
        out.push(Insn::InvokeStatic(reporter::reporter_call(method)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: MethodShape<'static> = MethodShape {
        params: &[],
        is_static: true,
    };

    fn enter(listener: &Listener) -> Vec<Insn> {
        let mut out = Vec::new();
        listener.on_enter(SHAPE, &mut out);
        out
    }

    fn exit(listener: &Listener, signal: ExitSignal) -> Vec<Insn> {
        let mut out = Vec::new();
        listener.on_exit(signal, SHAPE, &mut out);
        out
    }

    #[test]
    fn test_counter_enter_only() {
        let mut slots = SlotAllocator::new(0);
        let l = Listener::new(&Metric::counter("calls_total"), vec![], &mut slots).unwrap();
        assert_eq!(
            enter(&l),
            vec![
                Insn::PushStr("calls_total".into()),
                Insn::PushNull,
                Insn::InvokeStatic(reporter::reporter_call(reporter::COUNTER_INC)),
            ]
        );
        assert!(exit(&l, ExitSignal::NormalReturn).is_empty());
        let mut plan = ProtectionPlan::default();
        l.on_finalize(&mut plan);
        assert!(!plan.is_required());
    }

    #[test]
    fn test_gauge_operation_routes() {
        let mut slots = SlotAllocator::new(0);
        let dec = Listener::new(&Metric::gauge("g", GaugeOp::Decrement), vec![], &mut slots).unwrap();
        assert!(enter(&dec).contains(&Insn::InvokeStatic(reporter::reporter_call(
            reporter::GAUGE_DEC
        ))));
        let inc = Listener::new(&Metric::gauge("g", GaugeOp::Increment), vec![], &mut slots).unwrap();
        assert!(enter(&inc).contains(&Insn::InvokeStatic(reporter::reporter_call(
            reporter::GAUGE_INC
        ))));
    }

    #[test]
    fn test_histogram_allocates_slots_and_requests_protection() {
        let mut slots = SlotAllocator::new(3);
        let l = Listener::new(&Metric::histogram("latency"), vec![], &mut slots).unwrap();
        assert_eq!(
            l.kind,
            ListenerKind::Histogram {
                start_slot: 3,
                labels_slot: 4
            }
        );
        assert_eq!(slots.allocate(), Some(5));

        let entry = enter(&l);
        assert_eq!(entry.last(), Some(&Insn::Store(ValueKind::Long, 3)));
        let mut prepared = Vec::new();
        l.on_prepare(SHAPE, &mut prepared);
        assert_eq!(
            prepared,
            vec![Insn::PushNull, Insn::Store(ValueKind::Ref, 4)]
        );

        let normal = exit(&l, ExitSignal::NormalReturn);
        assert_eq!(normal, exit(&l, ExitSignal::Exception));
        assert!(normal.contains(&Insn::LSub));

        let mut plan = ProtectionPlan::default();
        l.on_finalize(&mut plan);
        assert_eq!(plan.requested_by(), ["latency".to_string()]);
    }

    #[test]
    fn test_counter_and_gauge_prepare_nothing() {
        let mut slots = SlotAllocator::new(0);
        let l = Listener::new(&Metric::counter("c"), vec![], &mut slots).unwrap();
        let mut out = Vec::new();
        l.on_prepare(SHAPE, &mut out);
        assert!(out.is_empty());
        assert!(!l.needs_protection());
    }

    #[test]
    fn test_histogram_without_free_slots() {
        let mut slots = SlotAllocator::new(u16::MAX - 1);
        assert!(Listener::new(&Metric::histogram("h"), vec![], &mut slots).is_none());
        let mut slots = SlotAllocator::new(u16::MAX);
        assert_eq!(slots.allocate(), None);
    }
}
