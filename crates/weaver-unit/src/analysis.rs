//! # Frame analysis and structural verification
//!
//! A forward data-flow pass over a method body that computes, for every
//! reachable instruction, the verification types of the locals and of the
//! operand stack. From that it derives:
//!
//! - `max_stack` / `max_locals`
//! - a [`Frame`] at each branch target and handler entry
//!
//! and rejects bodies that a loader would refuse: stack underflow, category
//! mismatches, inconsistent stack shapes at join points, returns that
//! disagree with the descriptor, or control falling off the end of the code.
//!
//! Where two paths join with different reference types the analysis needs a
//! common supertype. That question is delegated to a [`TypeHierarchy`] so the
//! caller decides how much of the world it is willing to look at.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::trace;

use crate::descriptor::{MethodDescriptor, TypeDesc};
use crate::format::{Code, Frame, Method, UnitFile, VType, ROOT_TYPE, STRING_TYPE, THROWABLE_TYPE};
use crate::insn::{Insn, Label, ValueKind};

// =============================================================================
// TypeHierarchy
// =============================================================================

/// Answers "what is a common supertype of these two reference types?".
pub trait TypeHierarchy {
    fn common_ancestor(&self, a: &str, b: &str) -> String;
}

/// Hierarchy that knows nothing: distinct types always join at the root.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootHierarchy;

impl TypeHierarchy for RootHierarchy {
    fn common_ancestor(&self, a: &str, b: &str) -> String {
        if a == b {
            a.to_string()
        } else {
            ROOT_TYPE.to_string()
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    /// `owner.name(descriptor)`
    pub method: String,
    /// Instruction index, when the failure is tied to one.
    pub at: Option<usize>,
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at {
            Some(i) => write!(f, "verify error in {} at insn {}: {}", self.method, i, self.message),
            None => write!(f, "verify error in {}: {}", self.method, self.message),
        }
    }
}

impl std::error::Error for VerifyError {}

// =============================================================================
// Analysis
// =============================================================================

/// Result of analysing one method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAnalysis {
    pub max_stack: u16,
    pub max_locals: u16,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<VType>,
    stack: Vec<VType>,
}

struct Analyzer<'a> {
    method_id: String,
    code: &'a Code,
    ret: Option<ValueKind>,
    hierarchy: &'a dyn TypeHierarchy,
    labels: HashMap<Label, usize>,
    /// (start index, end index, handler index, caught type)
    handlers: Vec<(usize, usize, usize, String)>,
    states: Vec<Option<State>>,
    max_stack: usize,
    max_locals: usize,
}

/// Compute max stack, max locals and frames for `method` of unit `owner`.
pub fn analyze_method(
    owner: &str,
    method: &Method,
    hierarchy: &dyn TypeHierarchy,
) -> Result<FrameAnalysis, VerifyError> {
    let method_id = format!("{}.{}{}", owner, method.name, method.descriptor);
    let err = |message: String| VerifyError {
        method: method_id.clone(),
        at: None,
        message,
    };
    let code = method
        .code
        .as_ref()
        .ok_or_else(|| err("method has no code".to_string()))?;
    let desc = MethodDescriptor::parse(&method.descriptor).map_err(|e| err(e.to_string()))?;

    let mut initial = Vec::new();
    if !method.access.is_static() {
        initial.push(VType::Ref(owner.to_string()));
    }
    initial.extend(desc.params.iter().map(TypeDesc::vtype));

    let labels = code.label_positions();
    let mut handlers = Vec::with_capacity(code.handlers.len());
    for h in &code.handlers {
        let find = |l: Label| {
            labels
                .get(&l)
                .copied()
                .ok_or_else(|| err(format!("handler references unplaced label {}", l)))
        };
        let caught = h
            .catch_type
            .clone()
            .unwrap_or_else(|| THROWABLE_TYPE.to_string());
        handlers.push((find(h.start)?, find(h.end)?, find(h.handler)?, caught));
    }

    let max_local_ref = code
        .insns
        .iter()
        .filter_map(|i| match i {
            Insn::Load(_, slot) | Insn::Store(_, slot) => Some(*slot as usize + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let mut analyzer = Analyzer {
        method_id: method_id.clone(),
        code,
        ret: desc.return_kind(),
        hierarchy,
        labels,
        handlers,
        states: vec![None; code.insns.len()],
        max_stack: 0,
        max_locals: initial.len().max(max_local_ref),
    };
    analyzer.run(State {
        locals: initial,
        stack: Vec::new(),
    })?;
    analyzer.finish()
}

impl<'a> Analyzer<'a> {
    fn error(&self, at: usize, message: impl Into<String>) -> VerifyError {
        VerifyError {
            method: self.method_id.clone(),
            at: Some(at),
            message: message.into(),
        }
    }

    fn label_index(&self, at: usize, label: Label) -> Result<usize, VerifyError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| self.error(at, format!("jump to unplaced label {}", label)))
    }

    fn run(&mut self, entry: State) -> Result<(), VerifyError> {
        if self.code.insns.is_empty() {
            return Err(self.error(0, "empty code"));
        }
        let mut queue = VecDeque::new();
        let mut queued = HashSet::new();
        self.merge_into(0, 0, entry, &mut queue, &mut queued)?;

        while let Some(i) = queue.pop_front() {
            queued.remove(&i);
            let before = match &self.states[i] {
                Some(s) => s.clone(),
                None => continue,
            };
            trace!(insn = i, stack = before.stack.len(), "analyzing");

            for (start, end, handler, caught) in self.handlers.clone() {
                if start <= i && i < end {
                    let state = State {
                        locals: before.locals.clone(),
                        stack: vec![VType::Ref(caught)],
                    };
                    self.merge_into(i, handler, state, &mut queue, &mut queued)?;
                }
            }

            let code = self.code;
            let insn = &code.insns[i];
            let after = self.transfer(i, insn, before)?;
            self.max_stack = self.max_stack.max(after.stack.len());

            if let Insn::Store(..) = insn {
                for (start, end, handler, caught) in self.handlers.clone() {
                    if start <= i && i < end {
                        let state = State {
                            locals: after.locals.clone(),
                            stack: vec![VType::Ref(caught)],
                        };
                        self.merge_into(i, handler, state, &mut queue, &mut queued)?;
                    }
                }
            }

            if let Some(target) = insn.branch_target() {
                let t = self.label_index(i, target)?;
                self.merge_into(i, t, after.clone(), &mut queue, &mut queued)?;
            }
            if insn.falls_through() {
                if i + 1 >= self.code.insns.len() {
                    return Err(self.error(i, "control falls off the end of the code"));
                }
                self.merge_into(i, i + 1, after, &mut queue, &mut queued)?;
            }
        }
        Ok(())
    }

    fn merge_into(
        &mut self,
        from: usize,
        target: usize,
        incoming: State,
        queue: &mut VecDeque<usize>,
        queued: &mut HashSet<usize>,
    ) -> Result<(), VerifyError> {
        self.max_stack = self.max_stack.max(incoming.stack.len());
        let merged = match &self.states[target] {
            None => incoming,
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return Err(self.error(
                        from,
                        format!(
                            "stack height mismatch at join: {} vs {}",
                            existing.stack.len(),
                            incoming.stack.len()
                        ),
                    ));
                }
                let mut stack = Vec::with_capacity(existing.stack.len());
                for (a, b) in existing.stack.iter().zip(&incoming.stack) {
                    let m = self.merge_vtype(a, b);
                    if m == VType::Top {
                        return Err(self.error(
                            from,
                            format!("incompatible stack types at join: {} vs {}", a, b),
                        ));
                    }
                    stack.push(m);
                }
                let len = existing.locals.len().max(incoming.locals.len());
                let locals = (0..len)
                    .map(|i| {
                        match (existing.locals.get(i), incoming.locals.get(i)) {
                            (Some(a), Some(b)) => self.merge_vtype(a, b),
                            _ => VType::Top,
                        }
                    })
                    .collect();
                let merged = State { locals, stack };
                if &merged == existing {
                    return Ok(());
                }
                merged
            }
        };
        self.states[target] = Some(merged);
        if queued.insert(target) {
            queue.push_back(target);
        }
        Ok(())
    }

    fn merge_vtype(&self, a: &VType, b: &VType) -> VType {
        match (a, b) {
            _ if a == b => a.clone(),
            (VType::Null, VType::Ref(x)) | (VType::Ref(x), VType::Null) => VType::Ref(x.clone()),
            (VType::Ref(x), VType::Ref(y)) => {
                if x.starts_with('[') || y.starts_with('[') {
                    VType::Ref(ROOT_TYPE.to_string())
                } else {
                    VType::Ref(self.hierarchy.common_ancestor(x, y))
                }
            }
            _ => VType::Top,
        }
    }

    fn pop(&self, at: usize, state: &mut State) -> Result<VType, VerifyError> {
        state
            .stack
            .pop()
            .ok_or_else(|| self.error(at, "operand stack underflow"))
    }

    fn pop_kind(&self, at: usize, state: &mut State, kind: ValueKind) -> Result<VType, VerifyError> {
        let v = self.pop(at, state)?;
        let ok = match kind {
            ValueKind::Int => v == VType::Int,
            ValueKind::Long => v == VType::Long,
            ValueKind::Ref => v.is_reference(),
        };
        if !ok {
            return Err(self.error(at, format!("expected {:?} on stack, found {}", kind, v)));
        }
        Ok(v)
    }

    fn pop_desc(&self, at: usize, state: &mut State, desc: &str) -> Result<(), VerifyError> {
        let ty = TypeDesc::parse(desc).map_err(|e| self.error(at, e.to_string()))?;
        self.pop_kind(at, state, ty.kind()).map(|_| ())
    }

    fn push_desc(&self, at: usize, state: &mut State, desc: &str) -> Result<(), VerifyError> {
        let ty = TypeDesc::parse(desc).map_err(|e| self.error(at, e.to_string()))?;
        state.stack.push(ty.vtype());
        Ok(())
    }

    fn transfer(&mut self, at: usize, insn: &Insn, mut s: State) -> Result<State, VerifyError> {
        match insn {
            Insn::Label(_) | Insn::Nop | Insn::Goto(_) => {}
            Insn::PushNull => s.stack.push(VType::Null),
            Insn::PushInt(_) => s.stack.push(VType::Int),
            Insn::PushLong(_) => s.stack.push(VType::Long),
            Insn::PushStr(_) => s.stack.push(VType::Ref(STRING_TYPE.to_string())),
            Insn::Load(kind, slot) => {
                let v = s.locals.get(*slot as usize).cloned().unwrap_or(VType::Top);
                let ok = match kind {
                    ValueKind::Int => v == VType::Int,
                    ValueKind::Long => v == VType::Long,
                    ValueKind::Ref => v.is_reference(),
                };
                if !ok {
                    return Err(self.error(at, format!("load {:?} from local {} holding {}", kind, slot, v)));
                }
                s.stack.push(v);
            }
            Insn::Store(kind, slot) => {
                let v = self.pop_kind(at, &mut s, *kind)?;
                let slot = *slot as usize;
                if s.locals.len() <= slot {
                    s.locals.resize(slot + 1, VType::Top);
                }
                s.locals[slot] = v;
                self.max_locals = self.max_locals.max(slot + 1);
            }
            Insn::Pop => {
                self.pop(at, &mut s)?;
            }
            Insn::Dup => {
                let v = self.pop(at, &mut s)?;
                s.stack.push(v.clone());
                s.stack.push(v);
            }
            Insn::Swap => {
                let a = self.pop(at, &mut s)?;
                let b = self.pop(at, &mut s)?;
                s.stack.push(a);
                s.stack.push(b);
            }
            Insn::IAdd | Insn::ISub => {
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                s.stack.push(VType::Int);
            }
            Insn::LAdd | Insn::LSub => {
                self.pop_kind(at, &mut s, ValueKind::Long)?;
                self.pop_kind(at, &mut s, ValueKind::Long)?;
                s.stack.push(VType::Long);
            }
            Insn::IfEq(_) | Insn::IfNe(_) => {
                self.pop_kind(at, &mut s, ValueKind::Int)?;
            }
            Insn::IfNull(_) | Insn::IfNonNull(_) => {
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
            }
            Insn::IfICmpLt(_) => {
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                self.pop_kind(at, &mut s, ValueKind::Int)?;
            }
            Insn::New(class) => s.stack.push(VType::Ref(class.clone())),
            Insn::GetField(m) => {
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
                self.push_desc(at, &mut s, &m.descriptor)?;
            }
            Insn::PutField(m) => {
                self.pop_desc(at, &mut s, &m.descriptor)?;
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
            }
            Insn::GetStatic(m) => self.push_desc(at, &mut s, &m.descriptor)?,
            Insn::PutStatic(m) => self.pop_desc(at, &mut s, &m.descriptor)?,
            Insn::NewArray(elem) => {
                TypeDesc::parse(elem).map_err(|e| self.error(at, e.to_string()))?;
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                s.stack.push(VType::Ref(format!("[{}", elem)));
            }
            Insn::ArrayLength => {
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
                s.stack.push(VType::Int);
            }
            Insn::ArrayLoad => {
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                let array = self.pop_kind(at, &mut s, ValueKind::Ref)?;
                let elem = match &array {
                    VType::Null => VType::Null,
                    VType::Ref(d) if d.starts_with('[') => TypeDesc::parse(&d[1..])
                        .map_err(|e| self.error(at, e.to_string()))?
                        .vtype(),
                    other => return Err(self.error(at, format!("aaload on non-array {}", other))),
                };
                if !elem.is_reference() {
                    return Err(self.error(at, "aaload on primitive array"));
                }
                s.stack.push(elem);
            }
            Insn::ArrayStore => {
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
                self.pop_kind(at, &mut s, ValueKind::Int)?;
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
            }
            Insn::InvokeStatic(m) | Insn::InvokeVirtual(m) => {
                let desc = MethodDescriptor::parse(&m.descriptor)
                    .map_err(|e| self.error(at, e.to_string()))?;
                for p in desc.params.iter().rev() {
                    self.pop_kind(at, &mut s, p.kind())?;
                }
                if matches!(insn, Insn::InvokeVirtual(_)) {
                    self.pop_kind(at, &mut s, ValueKind::Ref)?;
                }
                if let Some(r) = &desc.ret {
                    s.stack.push(r.vtype());
                }
            }
            Insn::Return(kind) => {
                if *kind != self.ret {
                    return Err(self.error(
                        at,
                        format!("return kind {:?} does not match descriptor {:?}", kind, self.ret),
                    ));
                }
                if let Some(k) = kind {
                    self.pop_kind(at, &mut s, *k)?;
                }
            }
            Insn::Throw => {
                self.pop_kind(at, &mut s, ValueKind::Ref)?;
            }
        }
        Ok(s)
    }

    fn finish(self) -> Result<FrameAnalysis, VerifyError> {
        let insns = &self.code.insns;
        // Adjacent labels share a byte offset, so frames are keyed by the
        // first real instruction at or after each label.
        let effective = |idx: usize| (idx..insns.len()).find(|&j| !insns[j].is_label());

        let mut keyed: Vec<(usize, usize, Label)> = insns
            .iter()
            .filter_map(Insn::branch_target)
            .chain(self.code.handlers.iter().map(|h| h.handler))
            .filter_map(|label| {
                let idx = *self.labels.get(&label)?;
                Some((effective(idx)?, idx, label))
            })
            .collect();
        keyed.sort();
        keyed.dedup_by_key(|(eff, _, _)| *eff);

        let mut frames = Vec::new();
        for (eff, _, label) in keyed {
            // Unreachable targets get no frame.
            let Some(state) = &self.states[eff] else {
                continue;
            };
            let mut locals = state.locals.clone();
            while locals.last() == Some(&VType::Top) {
                locals.pop();
            }
            frames.push(Frame {
                label,
                locals,
                stack: state.stack.clone(),
            });
        }

        let to_u16 = |v: usize, what: &str| {
            u16::try_from(v).map_err(|_| VerifyError {
                method: self.method_id.clone(),
                at: None,
                message: format!("{} {} exceeds limit", what, v),
            })
        };
        Ok(FrameAnalysis {
            max_stack: to_u16(self.max_stack, "max stack")?,
            max_locals: to_u16(self.max_locals, "max locals")?,
            frames,
        })
    }
}

// =============================================================================
// Unit-level entry points
// =============================================================================

/// Recompute maxs and frames of every method body in `unit`.
pub fn finalize_unit(unit: &mut UnitFile, hierarchy: &dyn TypeHierarchy) -> Result<(), VerifyError> {
    let owner = unit.header.name.clone();
    for method in &mut unit.methods {
        if method.code.is_none() {
            continue;
        }
        let analysis = analyze_method(&owner, method, hierarchy)?;
        if let Some(code) = method.code.as_mut() {
            code.max_stack = analysis.max_stack;
            code.max_locals = analysis.max_locals;
            code.frames = analysis.frames;
        }
    }
    Ok(())
}

/// Check every method body and that its stored maxs and frames are exactly
/// what analysis computes.
pub fn verify_unit(unit: &UnitFile, hierarchy: &dyn TypeHierarchy) -> Result<(), VerifyError> {
    for method in &unit.methods {
        let Some(code) = &method.code else {
            continue;
        };
        let analysis = analyze_method(&unit.header.name, method, hierarchy)?;
        let mismatch = |message: String| VerifyError {
            method: format!("{}.{}{}", unit.header.name, method.name, method.descriptor),
            at: None,
            message,
        };
        if code.max_stack < analysis.max_stack {
            return Err(mismatch(format!(
                "declared max stack {} below required {}",
                code.max_stack, analysis.max_stack
            )));
        }
        if code.max_locals < analysis.max_locals {
            return Err(mismatch(format!(
                "declared max locals {} below required {}",
                code.max_locals, analysis.max_locals
            )));
        }
        if code.frames != analysis.frames {
            return Err(mismatch("stored frames differ from computed frames".to_string()));
        }
    }
    Ok(())
}
