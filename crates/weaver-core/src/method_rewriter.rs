//! # Method rewriting
//!
//! Lays out an instrumented body:
//!
//! ```text
//!     <prepare actions of every listener>
//!     <enter actions of protected listeners>
//! S0: <enter actions of the other listeners, in declared order>
//!     <original code up to the first return>
//! E0: <exit actions, normal>
//!     return
//! S1: <original code up to the next return>
//!     ...
//! H:  <exit actions, exception>
//!     throw
//! ```
//!
//! When a listener asks for protection, every `[Si, Ei)` range is covered by
//! one catch-all handler `H`, appended after the original handlers so those
//! keep precedence. The spliced exit sequences sit outside the ranges, so an
//! exception raised while reporting a normal exit is never reported again.
//!
//! Max stack, max locals and frames are left stale here; the class rewriter
//! recomputes them once all methods are done.

use tracing::{debug, trace};
use weaver_spi::MetricRegister;
use weaver_unit::{Code, Handler, Insn, Label, Method, MethodDescriptor, TypeDesc};

use crate::config::Metric;
use crate::errors::TransformError;
use crate::labels::LabelBinder;
use crate::listener::{ExitSignal, Listener, MethodShape, ProtectionPlan, SlotAllocator};
use crate::reporter::register_metrics;

pub struct MethodRewriter<'a> {
    unit: &'a str,
    register: &'a dyn MetricRegister,
}

impl<'a> MethodRewriter<'a> {
    pub fn new(unit: &'a str, register: &'a dyn MetricRegister) -> Self {
        Self { unit, register }
    }

    /// Check that `metrics` can be applied to `method` without changing
    /// anything or registering instruments.
    pub fn check(&self, method: &Method, metrics: &[Metric]) -> Result<(), TransformError> {
        self.plan(method, metrics).map(|_| ())
    }

    /// Instrument `method` with `metrics`. Returns whether the body changed.
    pub fn rewrite(&self, method: &mut Method, metrics: &[Metric]) -> Result<bool, TransformError> {
        let Some(plan) = self.plan(method, metrics)? else {
            return Ok(false);
        };
        let Some(code) = method.code.as_mut() else {
            return Ok(false);
        };

        register_metrics(self.register, metrics)?;

        let shape = MethodShape {
            params: &plan.desc.params,
            is_static: method.access.is_static(),
        };
        splice(code, &plan.listeners, shape);
        debug!(
            unit = self.unit,
            method = %plan.method_id,
            listeners = plan.listeners.len(),
            "instrumented method"
        );
        Ok(true)
    }

    /// Bind labels and allocate listener slots. `None` when there is
    /// nothing to instrument.
    fn plan(&self, method: &Method, metrics: &[Metric]) -> Result<Option<MethodPlan>, TransformError> {
        if metrics.is_empty() {
            return Ok(None);
        }
        let Some(code) = method.code.as_ref() else {
            return Ok(None);
        };
        let method_id = format!("{}{}", method.name, method.descriptor);
        let desc = MethodDescriptor::parse(&method.descriptor).map_err(|e| {
            TransformError::Descriptor {
                unit: self.unit.to_string(),
                method: method_id.clone(),
                message: e.to_string(),
            }
        })?;

        let binder = LabelBinder::new(&desc.params);
        let mut bindings = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let plan = binder
                .binding_plan(&metric.labels)
                .map_err(|source| TransformError::Label {
                    unit: self.unit.to_string(),
                    method: method_id.clone(),
                    metric: metric.name.clone(),
                    source,
                })?;
            bindings.push(plan);
        }

        let too_many_locals = || TransformError::TooManyLocals {
            unit: self.unit.to_string(),
            method: method_id.clone(),
        };
        let first_free = first_free_slot(code, &desc.params, method.access.is_static())
            .ok_or_else(too_many_locals)?;
        let mut slots = SlotAllocator::new(first_free);
        let listeners = metrics
            .iter()
            .zip(bindings)
            .map(|(metric, bindings)| Listener::new(metric, bindings, &mut slots))
            .collect::<Option<Vec<Listener>>>()
            .ok_or_else(too_many_locals)?;

        Ok(Some(MethodPlan {
            method_id,
            desc,
            listeners,
        }))
    }
}

struct MethodPlan {
    method_id: String,
    desc: MethodDescriptor,
    listeners: Vec<Listener>,
}

/// First local slot not used by the parameters or the original body, or
/// `None` when that is past the addressable range.
fn first_free_slot(code: &Code, params: &[TypeDesc], is_static: bool) -> Option<u16> {
    let params_end = params.len() + usize::from(!is_static);
    let body_end = code
        .insns
        .iter()
        .filter_map(|insn| match insn {
            Insn::Load(_, slot) | Insn::Store(_, slot) => Some(usize::from(*slot) + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let end = params_end.max(body_end).max(usize::from(code.max_locals));
    u16::try_from(end).ok()
}

struct Labels {
    next: u32,
}

impl Labels {
    fn fresh(&mut self) -> Label {
        let l = Label(self.next);
        self.next += 1;
        l
    }
}

fn exit_actions(listeners: &[Listener], signal: ExitSignal, shape: MethodShape<'_>) -> Vec<Insn> {
    let mut out = Vec::new();
    for listener in listeners {
        listener.on_exit(signal, shape, &mut out);
    }
    out
}

fn splice(code: &mut Code, listeners: &[Listener], shape: MethodShape<'_>) {
    let mut labels = Labels {
        next: code.next_free_label(),
    };

    let mut plan = ProtectionPlan::default();
    for listener in listeners {
        listener.on_finalize(&mut plan);
    }
    let protect = plan.is_required();
    let normal_exit = exit_actions(listeners, ExitSignal::NormalReturn, shape);

    let original = std::mem::take(&mut code.insns);
    let mut insns = Vec::with_capacity(original.len() + 16);
    for listener in listeners {
        listener.on_prepare(shape, &mut insns);
    }
    // Protected listeners start first, so the entry actions of the others
    // run inside the protected region.
    for listener in listeners.iter().filter(|l| l.needs_protection()) {
        listener.on_enter(shape, &mut insns);
    }

    // Open protected segments as (start, whether it covers a real insn).
    let mut segments: Vec<(Label, Label)> = Vec::new();
    let mut open: Option<(Label, bool)> = None;
    if protect {
        let start = labels.fresh();
        insns.push(Insn::Label(start));
        open = Some((start, false));
    }

    for listener in listeners.iter().filter(|l| !l.needs_protection()) {
        let before = insns.len();
        listener.on_enter(shape, &mut insns);
        if let Some((_, covered)) = open.as_mut() {
            *covered |= insns.len() > before;
        }
    }

    for insn in original {
        if insn.is_return() {
            if let Some((start, covered)) = open.take() {
                if covered {
                    let end = labels.fresh();
                    insns.push(Insn::Label(end));
                    segments.push((start, end));
                }
            }
            insns.extend(normal_exit.iter().cloned());
            insns.push(insn);
            if protect {
                let start = labels.fresh();
                insns.push(Insn::Label(start));
                open = Some((start, false));
            }
            continue;
        }
        if let Some((_, covered)) = open.as_mut() {
            *covered |= !insn.is_label();
        }
        insns.push(insn);
    }

    if let Some((start, true)) = open.take() {
        let end = labels.fresh();
        insns.push(Insn::Label(end));
        segments.push((start, end));
    }

    if protect && !segments.is_empty() {
        let handler = labels.fresh();
        insns.push(Insn::Label(handler));
        insns.extend(exit_actions(listeners, ExitSignal::Exception, shape));
        insns.push(Insn::Throw);
        for (start, end) in &segments {
            code.handlers.push(Handler {
                start: *start,
                end: *end,
                handler,
                catch_type: None,
            });
        }
        trace!(
            segments = segments.len(),
            requested_by = ?plan.requested_by(),
            "protected method body"
        );
    }

    code.insns = insns;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GaugeOp;
    use crate::reporter;
    use weaver_spi::InMemoryRegister;
    use weaver_unit::builder::CodeBuilder;
    use weaver_unit::{access, AccessFlags, ValueKind};

    fn method(flags: u16, descriptor: &str, code: CodeBuilder) -> Method {
        Method {
            access: AccessFlags(flags),
            name: "m".into(),
            descriptor: descriptor.into(),
            code: Some(code.build()),
        }
    }

    fn returns_one() -> CodeBuilder {
        let mut code = CodeBuilder::new();
        code.emit(Insn::PushInt(1)).emit(Insn::Return(Some(ValueKind::Int)));
        code
    }

    #[test]
    fn test_no_metrics_passes_through() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        let before = m.clone();
        assert!(!MethodRewriter::new("app/Foo", &reg).rewrite(&mut m, &[]).unwrap());
        assert_eq!(m, before);
        assert_eq!(reg.instrument_count(), 0);
    }

    #[test]
    fn test_counter_enter_precedes_body() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[Metric::counter("calls_total")])
            .unwrap();
        let code = m.code.unwrap();
        assert_eq!(code.insns[0], Insn::PushStr("calls_total".into()));
        assert_eq!(
            code.insns[2],
            Insn::InvokeStatic(reporter::reporter_call(reporter::COUNTER_INC))
        );
        assert_eq!(code.insns[3], Insn::PushInt(1));
        assert!(code.handlers.is_empty());
        assert_eq!(reg.instrument_count(), 1);
    }

    #[test]
    fn test_invalid_label_aborts() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        let metric = Metric::counter("c").with_label("a:$0").unwrap();
        let err = MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[metric])
            .unwrap_err();
        assert!(matches!(err, TransformError::Label { .. }));
        // Nothing is registered for a refused rewrite.
        assert_eq!(reg.instrument_count(), 0);
    }

    #[test]
    fn test_histogram_exit_before_every_return() {
        let reg = InMemoryRegister::new();
        let mut code = CodeBuilder::new();
        let other = code.label();
        code.emit(Insn::Load(ValueKind::Int, 0))
            .emit(Insn::IfEq(other))
            .emit(Insn::PushInt(1))
            .emit(Insn::Return(Some(ValueKind::Int)))
            .mark(other)
            .emit(Insn::PushInt(2))
            .emit(Insn::Return(Some(ValueKind::Int)));
        let mut m = method(access::STATIC, "(I)I", code);
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[Metric::histogram("latency")])
            .unwrap();
        let code = m.code.unwrap();

        let record = Insn::InvokeStatic(reporter::reporter_call(reporter::RECORD_TIME));
        // Two returns plus the handler.
        assert_eq!(code.insns.iter().filter(|i| **i == record).count(), 3);
        for (i, insn) in code.insns.iter().enumerate() {
            if insn.is_return() {
                assert_eq!(code.insns[i - 1], record);
            }
        }
        assert_eq!(code.insns.last(), Some(&Insn::Throw));
        assert_eq!(code.handlers.len(), 2);
        assert!(code.handlers.iter().all(|h| h.catch_type.is_none()));
        assert_eq!(code.handlers[0].handler, code.handlers[1].handler);
    }

    #[test]
    fn test_exit_sequences_outside_protected_ranges() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[Metric::histogram("latency")])
            .unwrap();
        let code = m.code.unwrap();
        let pos = code.label_positions();
        let record = Insn::InvokeStatic(reporter::reporter_call(reporter::RECORD_TIME));
        let record_at: Vec<usize> = code
            .insns
            .iter()
            .enumerate()
            .filter(|(_, i)| **i == record)
            .map(|(n, _)| n)
            .collect();
        for h in &code.handlers {
            let (s, e) = (pos[&h.start], pos[&h.end]);
            assert!(record_at.iter().all(|r| *r < s || *r >= e));
        }
    }

    #[test]
    fn test_histogram_slots_above_body_locals() {
        let reg = InMemoryRegister::new();
        let mut code = CodeBuilder::new();
        code.emit(Insn::PushLong(5))
            .emit(Insn::Store(ValueKind::Long, 4))
            .emit(Insn::Return(None));
        let mut m = method(access::PUBLIC, "(I)V", code);
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[Metric::histogram("h")])
            .unwrap();
        let code = m.code.unwrap();
        assert!(code.insns.contains(&Insn::Store(ValueKind::Long, 5)));
        assert!(code.insns.contains(&Insn::Store(ValueKind::Ref, 6)));
    }

    #[test]
    fn test_enter_actions_in_declared_order() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(
                &mut m,
                &[
                    Metric::gauge("second", GaugeOp::Decrement),
                    Metric::counter("first"),
                ],
            )
            .unwrap();
        let code = m.code.unwrap();
        assert_eq!(code.insns[0], Insn::PushStr("second".into()));
        assert_eq!(code.insns[3], Insn::PushStr("first".into()));
    }

    #[test]
    fn test_later_entry_actions_are_protected() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "()I", returns_one());
        MethodRewriter::new("app/Foo", &reg)
            .rewrite(
                &mut m,
                &[Metric::histogram("latency"), Metric::counter("calls")],
            )
            .unwrap();
        let code = m.code.unwrap();
        let pos = code.label_positions();
        let inc = Insn::InvokeStatic(reporter::reporter_call(reporter::COUNTER_INC));
        let inc_at = code.insns.iter().position(|i| *i == inc).unwrap();
        let clock_at = code
            .insns
            .iter()
            .position(|i| *i == Insn::Store(ValueKind::Long, 0))
            .unwrap();
        assert!(clock_at < inc_at);
        assert!(code
            .handlers
            .iter()
            .any(|h| pos[&h.start] <= inc_at && inc_at < pos[&h.end]));
    }

    #[test]
    fn test_histogram_labels_evaluated_before_clock() {
        let reg = InMemoryRegister::new();
        let mut m = method(access::STATIC, "(I)I", returns_one());
        let metric = Metric::histogram("latency").with_label("n:$0").unwrap();
        MethodRewriter::new("app/Foo", &reg).rewrite(&mut m, &[metric]).unwrap();
        let code = m.code.unwrap();
        let labels_at = code
            .insns
            .iter()
            .position(|i| *i == Insn::Store(ValueKind::Ref, 2))
            .unwrap();
        let clock_at = code
            .insns
            .iter()
            .position(|i| *i == Insn::Store(ValueKind::Long, 1))
            .unwrap();
        assert!(labels_at < clock_at);
    }

    #[test]
    fn test_check_registers_nothing() {
        let reg = InMemoryRegister::new();
        let m = method(access::STATIC, "()I", returns_one());
        let rewriter = MethodRewriter::new("app/Foo", &reg);
        rewriter.check(&m, &[Metric::counter("c")]).unwrap();
        let bad = Metric::counter("c").with_label("a:$0").unwrap();
        assert!(matches!(
            rewriter.check(&m, &[bad]),
            Err(TransformError::Label { .. })
        ));
        assert_eq!(reg.instrument_count(), 0);
    }

    #[test]
    fn test_exhausted_locals_refused() {
        let reg = InMemoryRegister::new();
        let mut code = CodeBuilder::new();
        code.emit(Insn::PushInt(1))
            .emit(Insn::Store(ValueKind::Int, u16::MAX - 1))
            .emit(Insn::Return(None));
        let mut m = method(access::STATIC, "()V", code);
        let err = MethodRewriter::new("app/Foo", &reg)
            .rewrite(&mut m, &[Metric::histogram("h")])
            .unwrap_err();
        assert!(matches!(err, TransformError::TooManyLocals { .. }));
        assert_eq!(reg.instrument_count(), 0);
    }
}
