//! # Interpreter
//!
//! Executes decoded units straight from the IR. Control flow works on
//! instruction indices; labels are resolved per invocation. Exceptions are
//! heap objects: a thrown reference unwinds frame by frame until a handler
//! whose catch type is an ancestor of the object's class covers the
//! throwing instruction.
//!
//! There is no garbage collection and no threading. The VM exists to run
//! rewritten units and observe what they report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};
use weaver_spi::MetricRegister;
use weaver_unit::{
    Code, Insn, Label, MemberRef, Method, MethodDescriptor, UnitFile, ROOT_TYPE, STATIC_INIT,
};

use crate::core_units::{INDEX_OUT_OF_BOUNDS, MESSAGE_FIELD, NULL_POINTER, RUNTIME_EXCEPTION};
use crate::errors::VmError;
use crate::heap::{Heap, ObjRef, Object, Value};
use crate::loader::UnitLoader;
use crate::natives;

pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;
pub const MAX_CALL_DEPTH: usize = 256;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Return(Option<Value>),
    Throw(ObjRef),
}

enum Control {
    Next,
    Jump(Label),
    Return(Option<Value>),
    Throw(ObjRef),
}

pub struct Vm {
    loader: Arc<UnitLoader>,
    register: Arc<dyn MetricRegister>,
    heap: Heap,
    statics: HashMap<(String, String), Value>,
    initialized: HashSet<String>,
    started: Instant,
    steps: u64,
    step_limit: u64,
    depth: usize,
}

impl Vm {
    pub fn new(loader: Arc<UnitLoader>, register: Arc<dyn MetricRegister>) -> Self {
        Self {
            loader,
            register,
            heap: Heap::default(),
            statics: HashMap::new(),
            initialized: HashSet::new(),
            started: Instant::now(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            depth: 0,
        }
    }

    /// Instructions one top-level invocation may execute.
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn loader(&self) -> &Arc<UnitLoader> {
        &self.loader
    }

    pub fn register(&self) -> &Arc<dyn MetricRegister> {
        &self.register
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Monotonic nanoseconds since the VM was created.
    pub fn elapsed_nanos(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    // =========================================================================
    // Host API
    // =========================================================================

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::Ref(self.heap.alloc(Object::Str(s.to_string())))
    }

    pub fn new_array(&mut self, elem: &str, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.alloc(Object::Array {
            elem: elem.to_string(),
            items,
        }))
    }

    pub fn string_value(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(r) => self.heap.string(r),
            _ => None,
        }
    }

    /// Allocate an instance of `class`, running its static initializer first
    /// if this is the first use.
    pub fn new_instance(&mut self, class: &str) -> Result<Value, VmError> {
        if let Some(thrown) = self.ensure_initialized(class)? {
            return Err(self.uncaught(thrown));
        }
        Ok(Value::Ref(self.alloc_instance(class)))
    }

    pub fn set_field(&mut self, object: Value, name: &str, value: Value) -> Result<(), VmError> {
        match object {
            Value::Ref(r) => match self.heap.get_mut(r) {
                Some(Object::Instance { fields, .. }) => {
                    fields.insert(name.to_string(), value);
                    Ok(())
                }
                _ => Err(host_error(format!("object {} has no fields", r))),
            },
            other => Err(host_error(format!("cannot set field {} on {:?}", name, other))),
        }
    }

    /// The stored value of field `name`, if it was ever written.
    pub fn get_field(&self, object: Value, name: &str) -> Option<Value> {
        match object {
            Value::Ref(r) => match self.heap.get(r)? {
                Object::Instance { fields, .. } => fields.get(name).copied(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Run a static method. An exception that escapes becomes
    /// [`VmError::Uncaught`].
    pub fn invoke_static(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        self.steps = 0;
        let flow = self.call_static(owner, name, descriptor, args.to_vec())?;
        self.finish(flow)
    }

    /// Run an instance method on `receiver`, dispatching on its class.
    pub fn invoke_virtual(
        &mut self,
        receiver: Value,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        self.steps = 0;
        let Value::Ref(r) = receiver else {
            return Err(host_error(format!("cannot invoke {} on {:?}", name, receiver)));
        };
        let flow = self.call_virtual(r, name, descriptor, args.to_vec())?;
        self.finish(flow)
    }

    pub fn class_of(&self, value: Value) -> Option<String> {
        match value {
            Value::Ref(r) => self.heap.get(r).map(Object::class_name),
            _ => None,
        }
    }

    /// Whether `class` is `target` or has it as an ancestor.
    pub fn is_instance_of(&self, class: &str, target: &str) -> bool {
        if class == target || target == ROOT_TYPE {
            return true;
        }
        if class.starts_with('[') {
            return false;
        }
        let Ok(unit) = self.loader.load(class) else {
            return false;
        };
        unit.header
            .interfaces
            .iter()
            .any(|iface| self.is_instance_of(iface, target))
            || unit
                .header
                .super_name
                .as_deref()
                .is_some_and(|s| self.is_instance_of(s, target))
    }

    fn finish(&self, flow: Flow) -> Result<Option<Value>, VmError> {
        match flow {
            Flow::Return(value) => Ok(value),
            Flow::Throw(thrown) => Err(self.uncaught(thrown)),
        }
    }

    fn uncaught(&self, thrown: ObjRef) -> VmError {
        let class = self
            .class_of(Value::Ref(thrown))
            .unwrap_or_else(|| "?".to_string());
        let message = self
            .get_field(Value::Ref(thrown), MESSAGE_FIELD)
            .and_then(|m| self.string_value(m))
            .map(str::to_string);
        VmError::Uncaught { class, message }
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    pub(crate) fn alloc_instance(&mut self, class: &str) -> ObjRef {
        self.heap.alloc(Object::Instance {
            class: class.to_string(),
            fields: HashMap::new(),
        })
    }

    pub(crate) fn alloc_string(&mut self, s: String) -> ObjRef {
        self.heap.alloc(Object::Str(s))
    }

    /// Run `<clinit>` of `class` and its ancestors once. Returns the thrown
    /// object if an initializer threw.
    fn ensure_initialized(&mut self, class: &str) -> Result<Option<ObjRef>, VmError> {
        if self.initialized.contains(class) {
            return Ok(None);
        }
        let unit = self.loader.load(class)?;
        self.initialized.insert(class.to_string());
        if let Some(super_name) = &unit.header.super_name {
            if let Some(thrown) = self.ensure_initialized(super_name)? {
                return Ok(Some(thrown));
            }
        }
        if let Some(init) = unit.find_method(STATIC_INIT, "()V") {
            if init.code.is_some() {
                debug!(unit = class, "running static initializer");
                if let Flow::Throw(thrown) = self.execute(&unit, init, Vec::new())? {
                    return Ok(Some(thrown));
                }
            }
        }
        Ok(None)
    }

    /// Find `name descriptor` on `class` or its superclasses.
    pub(crate) fn resolve_method(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(Arc<UnitFile>, usize), VmError> {
        let mut current = Some(class.to_string());
        while let Some(c) = current {
            let unit = self.loader.load(&c)?;
            if let Some(index) = unit
                .methods
                .iter()
                .position(|m| m.name == name && m.descriptor == descriptor)
            {
                return Ok((unit, index));
            }
            current = unit.header.super_name.clone();
        }
        Err(VmError::MethodNotFound {
            owner: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub(crate) fn call_static(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Flow, VmError> {
        if let Some(thrown) = self.ensure_initialized(owner)? {
            return Ok(Flow::Throw(thrown));
        }
        let (unit, index) = self.resolve_method(owner, name, descriptor)?;
        self.invoke_resolved(&unit, index, args)
    }

    pub(crate) fn call_virtual(
        &mut self,
        receiver: ObjRef,
        name: &str,
        descriptor: &str,
        mut args: Vec<Value>,
    ) -> Result<Flow, VmError> {
        let class = self
            .heap
            .get(receiver)
            .map(Object::class_name)
            .ok_or_else(|| host_error(format!("dangling reference {}", receiver)))?;
        let start = if class.starts_with('[') {
            ROOT_TYPE
        } else {
            class.as_str()
        };
        let (unit, index) = self.resolve_method(start, name, descriptor)?;
        args.insert(0, Value::Ref(receiver));
        self.invoke_resolved(&unit, index, args)
    }

    fn invoke_resolved(
        &mut self,
        unit: &UnitFile,
        index: usize,
        args: Vec<Value>,
    ) -> Result<Flow, VmError> {
        let method = &unit.methods[index];
        trace!(unit = %unit.header.name, method = %method.name, "invoke");
        if method.access.is_native() {
            let native = natives::lookup(&unit.header.name, &method.name, &method.descriptor)
                .ok_or_else(|| missing(&unit.header.name, method))?;
            return native(self, &args);
        }
        self.execute(unit, method, args)
    }

    fn execute(&mut self, unit: &UnitFile, method: &Method, args: Vec<Value>) -> Result<Flow, VmError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepth {
                limit: MAX_CALL_DEPTH,
            });
        }
        let code = method
            .code
            .as_ref()
            .ok_or_else(|| missing(&unit.header.name, method))?;
        let qualified = format!("{}.{}{}", unit.header.name, method.name, method.descriptor);
        self.depth += 1;
        let result = self.run(&qualified, code, args);
        self.depth -= 1;
        result
    }

    fn run(&mut self, method: &str, code: &Code, mut locals: Vec<Value>) -> Result<Flow, VmError> {
        let labels = code.label_positions();
        let needed = usize::from(code.max_locals).max(locals.len());
        locals.resize(needed, Value::Null);
        let mut stack: Vec<Value> = Vec::with_capacity(usize::from(code.max_stack));
        let mut pc = 0usize;

        loop {
            let insn = code
                .insns
                .get(pc)
                .ok_or_else(|| malformed(method, "fell off the end of the code"))?;
            match self.step(method, insn, &mut locals, &mut stack)? {
                Control::Next => pc += 1,
                Control::Jump(label) => pc = position(&labels, label, method)?,
                Control::Return(value) => return Ok(Flow::Return(value)),
                Control::Throw(thrown) => match self.find_handler(method, code, &labels, pc, thrown)? {
                    Some(target) => {
                        stack.clear();
                        stack.push(Value::Ref(thrown));
                        pc = target;
                    }
                    None => return Ok(Flow::Throw(thrown)),
                },
            }
        }
    }

    fn find_handler(
        &self,
        method: &str,
        code: &Code,
        labels: &HashMap<Label, usize>,
        pc: usize,
        thrown: ObjRef,
    ) -> Result<Option<usize>, VmError> {
        let class = self
            .class_of(Value::Ref(thrown))
            .ok_or_else(|| malformed(method, "thrown reference is dangling"))?;
        for handler in &code.handlers {
            let start = position(labels, handler.start, method)?;
            let end = position(labels, handler.end, method)?;
            if pc < start || pc >= end {
                continue;
            }
            let catches = match &handler.catch_type {
                None => true,
                Some(catch_type) => self.is_instance_of(&class, catch_type),
            };
            if catches {
                return position(labels, handler.handler, method).map(Some);
            }
        }
        Ok(None)
    }

    /// Allocate a built-in exception carrying `message` and throw it.
    fn throw_new(&mut self, class: &str, message: &str) -> Control {
        let text = self.alloc_string(message.to_string());
        let thrown = self.heap.alloc(Object::Instance {
            class: class.to_string(),
            fields: HashMap::from([(MESSAGE_FIELD.to_string(), Value::Ref(text))]),
        });
        Control::Throw(thrown)
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn step(
        &mut self,
        method: &str,
        insn: &Insn,
        locals: &mut Vec<Value>,
        stack: &mut Vec<Value>,
    ) -> Result<Control, VmError> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(VmError::StepLimit {
                limit: self.step_limit,
            });
        }

        match insn {
            Insn::Label(_) | Insn::Nop => {}
            Insn::PushNull => stack.push(Value::Null),
            Insn::PushInt(v) => stack.push(Value::Int(*v)),
            Insn::PushLong(v) => stack.push(Value::Long(*v)),
            Insn::PushStr(s) => {
                let r = self.alloc_string(s.clone());
                stack.push(Value::Ref(r));
            }
            Insn::Load(_, slot) => {
                let value = locals
                    .get(usize::from(*slot))
                    .copied()
                    .ok_or_else(|| malformed(method, format!("no local {}", slot)))?;
                stack.push(value);
            }
            Insn::Store(_, slot) => {
                let value = pop(stack, method)?;
                let slot = usize::from(*slot);
                if slot >= locals.len() {
                    locals.resize(slot + 1, Value::Null);
                }
                locals[slot] = value;
            }
            Insn::Pop => {
                pop(stack, method)?;
            }
            Insn::Dup => {
                let top = *stack
                    .last()
                    .ok_or_else(|| malformed(method, "dup on empty stack"))?;
                stack.push(top);
            }
            Insn::Swap => {
                let a = pop(stack, method)?;
                let b = pop(stack, method)?;
                stack.push(a);
                stack.push(b);
            }
            Insn::IAdd | Insn::ISub => {
                let b = pop_int(stack, method)?;
                let a = pop_int(stack, method)?;
                let r = if matches!(insn, Insn::IAdd) {
                    a.wrapping_add(b)
                } else {
                    a.wrapping_sub(b)
                };
                stack.push(Value::Int(r));
            }
            Insn::LAdd | Insn::LSub => {
                let b = pop_long(stack, method)?;
                let a = pop_long(stack, method)?;
                let r = if matches!(insn, Insn::LAdd) {
                    a.wrapping_add(b)
                } else {
                    a.wrapping_sub(b)
                };
                stack.push(Value::Long(r));
            }
            Insn::Goto(l) => return Ok(Control::Jump(*l)),
            Insn::IfEq(l) => {
                if pop_int(stack, method)? == 0 {
                    return Ok(Control::Jump(*l));
                }
            }
            Insn::IfNe(l) => {
                if pop_int(stack, method)? != 0 {
                    return Ok(Control::Jump(*l));
                }
            }
            Insn::IfNull(l) => {
                if pop_ref(stack, method)?.is_none() {
                    return Ok(Control::Jump(*l));
                }
            }
            Insn::IfNonNull(l) => {
                if pop_ref(stack, method)?.is_some() {
                    return Ok(Control::Jump(*l));
                }
            }
            Insn::IfICmpLt(l) => {
                let b = pop_int(stack, method)?;
                let a = pop_int(stack, method)?;
                if a < b {
                    return Ok(Control::Jump(*l));
                }
            }
            Insn::New(class) => {
                if let Some(thrown) = self.ensure_initialized(class)? {
                    return Ok(Control::Throw(thrown));
                }
                let r = self.alloc_instance(class);
                stack.push(Value::Ref(r));
            }
            Insn::GetField(field) => {
                let Some(r) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, &format!("read of {}", field.name)));
                };
                let value = match self.heap.get(r) {
                    Some(Object::Instance { fields, .. }) => fields
                        .get(&field.name)
                        .copied()
                        .unwrap_or_else(|| Value::default_for(&field.descriptor)),
                    _ => return Err(malformed(method, format!("getfield {} on non-instance", field))),
                };
                stack.push(value);
            }
            Insn::PutField(field) => {
                let value = pop(stack, method)?;
                let Some(r) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, &format!("write of {}", field.name)));
                };
                match self.heap.get_mut(r) {
                    Some(Object::Instance { fields, .. }) => {
                        fields.insert(field.name.clone(), value);
                    }
                    _ => return Err(malformed(method, format!("putfield {} on non-instance", field))),
                }
            }
            Insn::GetStatic(field) => {
                if let Some(thrown) = self.ensure_initialized(&field.owner)? {
                    return Ok(Control::Throw(thrown));
                }
                let value = self
                    .statics
                    .get(&static_key(field))
                    .copied()
                    .unwrap_or_else(|| Value::default_for(&field.descriptor));
                stack.push(value);
            }
            Insn::PutStatic(field) => {
                if let Some(thrown) = self.ensure_initialized(&field.owner)? {
                    return Ok(Control::Throw(thrown));
                }
                let value = pop(stack, method)?;
                self.statics.insert(static_key(field), value);
            }
            Insn::NewArray(elem) => {
                let len = pop_int(stack, method)?;
                let Ok(len) = usize::try_from(len) else {
                    return Ok(self.throw_new(RUNTIME_EXCEPTION, &format!("negative array size {}", len)));
                };
                let r = self.heap.alloc(Object::Array {
                    elem: elem.clone(),
                    items: vec![Value::default_for(elem); len],
                });
                stack.push(Value::Ref(r));
            }
            Insn::ArrayLength => {
                let Some(r) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, "length of null array"));
                };
                let len = match self.heap.get(r) {
                    Some(Object::Array { items, .. }) => items.len(),
                    _ => return Err(malformed(method, "arraylength on non-array")),
                };
                stack.push(Value::Int(i32::try_from(len).unwrap_or(i32::MAX)));
            }
            Insn::ArrayLoad => {
                let index = pop_int(stack, method)?;
                let Some(r) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, "load from null array"));
                };
                let items = match self.heap.get(r) {
                    Some(Object::Array { items, .. }) => items,
                    _ => return Err(malformed(method, "aaload on non-array")),
                };
                match usize::try_from(index).ok().and_then(|i| items.get(i)) {
                    Some(value) => stack.push(*value),
                    None => {
                        let message = format!("index {} of length {}", index, items.len());
                        return Ok(self.throw_new(INDEX_OUT_OF_BOUNDS, &message));
                    }
                }
            }
            Insn::ArrayStore => {
                let value = pop(stack, method)?;
                let index = pop_int(stack, method)?;
                let Some(r) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, "store into null array"));
                };
                let items = match self.heap.get_mut(r) {
                    Some(Object::Array { items, .. }) => items,
                    _ => return Err(malformed(method, "aastore on non-array")),
                };
                let len = items.len();
                match usize::try_from(index).ok().and_then(|i| items.get_mut(i)) {
                    Some(slot) => *slot = value,
                    None => {
                        let message = format!("index {} of length {}", index, len);
                        return Ok(self.throw_new(INDEX_OUT_OF_BOUNDS, &message));
                    }
                }
            }
            Insn::InvokeStatic(target) => {
                let args = pop_args(stack, target, method)?;
                let flow = self.call_static(&target.owner, &target.name, &target.descriptor, args)?;
                return Ok(resume(flow, stack));
            }
            Insn::InvokeVirtual(target) => {
                let args = pop_args(stack, target, method)?;
                let Some(receiver) = pop_ref(stack, method)? else {
                    return Ok(self.throw_new(NULL_POINTER, &format!("invoke {} on null", target.name)));
                };
                let flow = self.call_virtual(receiver, &target.name, &target.descriptor, args)?;
                return Ok(resume(flow, stack));
            }
            Insn::Return(kind) => {
                let value = match kind {
                    Some(_) => Some(pop(stack, method)?),
                    None => None,
                };
                return Ok(Control::Return(value));
            }
            Insn::Throw => {
                return Ok(match pop_ref(stack, method)? {
                    Some(thrown) => Control::Throw(thrown),
                    None => self.throw_new(NULL_POINTER, "throw of null"),
                });
            }
        }
        Ok(Control::Next)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("heap", &self.heap.len())
            .field("initialized", &self.initialized.len())
            .field("steps", &self.steps)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn resume(flow: Flow, stack: &mut Vec<Value>) -> Control {
    match flow {
        Flow::Return(Some(value)) => {
            stack.push(value);
            Control::Next
        }
        Flow::Return(None) => Control::Next,
        Flow::Throw(thrown) => Control::Throw(thrown),
    }
}

fn static_key(field: &MemberRef) -> (String, String) {
    (field.owner.clone(), field.name.clone())
}

fn position(labels: &HashMap<Label, usize>, label: Label, method: &str) -> Result<usize, VmError> {
    labels
        .get(&label)
        .copied()
        .ok_or_else(|| malformed(method, format!("unknown label {}", label)))
}

fn pop_args(stack: &mut Vec<Value>, target: &MemberRef, method: &str) -> Result<Vec<Value>, VmError> {
    let descriptor = MethodDescriptor::parse(&target.descriptor)
        .map_err(|e| malformed(method, format!("{}: {}", target, e)))?;
    let count = descriptor.params.len();
    if stack.len() < count {
        return Err(malformed(method, format!("stack underflow calling {}", target)));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn pop(stack: &mut Vec<Value>, method: &str) -> Result<Value, VmError> {
    stack.pop().ok_or_else(|| malformed(method, "stack underflow"))
}

fn pop_int(stack: &mut Vec<Value>, method: &str) -> Result<i32, VmError> {
    let value = pop(stack, method)?;
    value
        .as_int()
        .ok_or_else(|| malformed(method, format!("expected int, found {:?}", value)))
}

fn pop_long(stack: &mut Vec<Value>, method: &str) -> Result<i64, VmError> {
    let value = pop(stack, method)?;
    value
        .as_long()
        .ok_or_else(|| malformed(method, format!("expected long, found {:?}", value)))
}

fn pop_ref(stack: &mut Vec<Value>, method: &str) -> Result<Option<ObjRef>, VmError> {
    let value = pop(stack, method)?;
    value
        .as_object()
        .ok_or_else(|| malformed(method, format!("expected reference, found {:?}", value)))
}

pub(crate) fn malformed(method: &str, message: impl Into<String>) -> VmError {
    VmError::Malformed {
        method: method.to_string(),
        message: message.into(),
    }
}

fn host_error(message: String) -> VmError {
    malformed("<host>", message)
}

fn missing(owner: &str, method: &Method) -> VmError {
    VmError::MethodNotFound {
        owner: owner.to_string(),
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_spi::InMemoryRegister;
    use weaver_unit::analysis::RootHierarchy;
    use weaver_unit::builder::{CodeBuilder, UnitBuilder};
    use weaver_unit::{access, ValueKind};

    const STATIC: u16 = access::PUBLIC | access::STATIC;

    fn vm_with(units: Vec<UnitBuilder>) -> Vm {
        let loader = UnitLoader::new().unwrap();
        for unit in units {
            loader.add_bytes(unit.to_bytes(&RootHierarchy).unwrap()).unwrap();
        }
        Vm::new(Arc::new(loader), Arc::new(InMemoryRegister::new()))
    }

    #[test]
    fn test_arithmetic_and_branches() {
        // max(a, b)
        let mut code = CodeBuilder::new();
        let second = code.label();
        code.emit_all([
            Insn::Load(ValueKind::Int, 0),
            Insn::Load(ValueKind::Int, 1),
            Insn::IfICmpLt(second),
            Insn::Load(ValueKind::Int, 0),
            Insn::Return(Some(ValueKind::Int)),
        ])
        .mark(second)
        .emit_all([Insn::Load(ValueKind::Int, 1), Insn::Return(Some(ValueKind::Int))]);
        let mut vm = vm_with(vec![UnitBuilder::new("app/Math").method(STATIC, "max", "(II)I", code)]);

        let max = |vm: &mut Vm, a, b| vm.invoke_static("app/Math", "max", "(II)I", &[Value::Int(a), Value::Int(b)]);
        assert_eq!(max(&mut vm, 3, 9).unwrap(), Some(Value::Int(9)));
        assert_eq!(max(&mut vm, 7, 2).unwrap(), Some(Value::Int(7)));
    }

    #[test]
    fn test_static_init_runs_once() {
        let mut clinit = CodeBuilder::new();
        clinit.emit_all([
            Insn::GetStatic(MemberRef::new("app/Boot", "count", "I")),
            Insn::PushInt(1),
            Insn::IAdd,
            Insn::PutStatic(MemberRef::new("app/Boot", "count", "I")),
            Insn::Return(None),
        ]);
        let mut read = CodeBuilder::new();
        read.emit_all([
            Insn::GetStatic(MemberRef::new("app/Boot", "count", "I")),
            Insn::Return(Some(ValueKind::Int)),
        ]);
        let mut vm = vm_with(vec![UnitBuilder::new("app/Boot")
            .field(access::STATIC, "count", "I")
            .method(access::STATIC, STATIC_INIT, "()V", clinit)
            .method(STATIC, "read", "()I", read)]);

        for _ in 0..3 {
            assert_eq!(
                vm.invoke_static("app/Boot", "read", "()I", &[]).unwrap(),
                Some(Value::Int(1))
            );
        }
    }

    #[test]
    fn test_handler_catches_by_ancestry() {
        // try { throw new NullPointerException } catch (RuntimeException) { return 1 }
        let mut code = CodeBuilder::new();
        let (start, end, handler) = (code.label(), code.label(), code.label());
        code.handler(start, end, handler, Some(RUNTIME_EXCEPTION))
            .mark(start)
            .emit_all([Insn::New(NULL_POINTER.into()), Insn::Throw])
            .mark(end)
            .mark(handler)
            .emit_all([Insn::Pop, Insn::PushInt(1), Insn::Return(Some(ValueKind::Int))]);
        let mut vm = vm_with(vec![UnitBuilder::new("app/Try").method(STATIC, "run", "()I", code)]);
        assert_eq!(
            vm.invoke_static("app/Try", "run", "()I", &[]).unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_uncaught_carries_message() {
        let mut code = CodeBuilder::new();
        code.emit_all([
            Insn::PushInt(0),
            Insn::NewArray("Lcore/Object;".into()),
            Insn::PushInt(4),
            Insn::ArrayLoad,
            Insn::Return(Some(ValueKind::Ref)),
        ]);
        let mut vm = vm_with(vec![UnitBuilder::new("app/Oob").method(
            STATIC,
            "run",
            "()Lcore/Object;",
            code,
        )]);
        match vm.invoke_static("app/Oob", "run", "()Lcore/Object;", &[]).unwrap_err() {
            VmError::Uncaught { class, message } => {
                assert_eq!(class, INDEX_OUT_OF_BOUNDS);
                assert_eq!(message.as_deref(), Some("index 4 of length 0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_virtual_dispatch_uses_runtime_class() {
        let mut base = CodeBuilder::new();
        base.emit_all([Insn::PushInt(1), Insn::Return(Some(ValueKind::Int))]);
        let mut derived = CodeBuilder::new();
        derived.emit_all([Insn::PushInt(2), Insn::Return(Some(ValueKind::Int))]);
        let mut vm = vm_with(vec![
            UnitBuilder::new("app/Base").method(access::PUBLIC, "id", "()I", base),
            UnitBuilder::new("app/Derived")
                .extends("app/Base")
                .method(access::PUBLIC, "id", "()I", derived),
            UnitBuilder::new("app/Plain").extends("app/Base"),
        ]);
        let d = vm.new_instance("app/Derived").unwrap();
        let p = vm.new_instance("app/Plain").unwrap();
        assert_eq!(vm.invoke_virtual(d, "id", "()I", &[]).unwrap(), Some(Value::Int(2)));
        assert_eq!(vm.invoke_virtual(p, "id", "()I", &[]).unwrap(), Some(Value::Int(1)));
        assert!(vm.is_instance_of("app/Derived", "app/Base"));
        assert!(!vm.is_instance_of("app/Base", "app/Derived"));
    }

    #[test]
    fn test_step_limit_stops_loops() {
        let mut code = CodeBuilder::new();
        let top = code.label();
        code.mark(top).emit(Insn::Goto(top));
        let mut vm = vm_with(vec![UnitBuilder::new("app/Spin").method(STATIC, "run", "()V", code)])
            .with_step_limit(1_000);
        assert!(matches!(
            vm.invoke_static("app/Spin", "run", "()V", &[]),
            Err(VmError::StepLimit { limit: 1_000 })
        ));
    }

    #[test]
    fn test_missing_method() {
        let mut vm = vm_with(vec![]);
        assert!(matches!(
            vm.invoke_static(ROOT_TYPE, "nope", "()V", &[]),
            Err(VmError::MethodNotFound { .. })
        ));
    }
}
