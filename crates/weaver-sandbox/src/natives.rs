//! # Native methods
//!
//! Bodies of the `native` declarations in the built-in units. These are the
//! runtime side of the call sites the rewriter injects:
//!
//! - `weaver/Reporter.*` forwards to the VM's [`MetricRegister`](weaver_spi::MetricRegister)
//! - `core/System.nanoTime` reads a monotonic clock
//! - `core/String.valueOf` renders ints, longs, bools and objects
//! - `weaver/Properties.nested` follows a dotted field path

use weaver_core::reporter;
use weaver_spi::MetricRegister;
use weaver_unit::STRING_TYPE;

use crate::errors::VmError;
use crate::heap::{Object, Value};
use crate::vm::{malformed, Flow, Vm};

pub(crate) type NativeFn = fn(&mut Vm, &[Value]) -> Result<Flow, VmError>;

const TO_STRING: &str = "toString";
const TO_STRING_DESC: &str = "()Lcore/String;";

pub(crate) fn lookup(owner: &str, name: &str, descriptor: &str) -> Option<NativeFn> {
    let native: NativeFn = match (owner, name, descriptor) {
        (reporter::REPORTER, reporter::COUNTER_INC, reporter::REPORT_DESC) => counter_inc,
        (reporter::REPORTER, reporter::GAUGE_INC, reporter::REPORT_DESC) => gauge_inc,
        (reporter::REPORTER, reporter::GAUGE_DEC, reporter::REPORT_DESC) => gauge_dec,
        (reporter::REPORTER, reporter::RECORD_TIME, reporter::RECORD_TIME_DESC) => record_time,
        (reporter::SYSTEM, reporter::NANO_TIME, reporter::NANO_TIME_DESC) => nano_time,
        (reporter::STRING, reporter::VALUE_OF, reporter::VALUE_OF_INT) => value_of_int,
        (reporter::STRING, reporter::VALUE_OF, reporter::VALUE_OF_LONG) => value_of_long,
        (reporter::STRING, reporter::VALUE_OF, reporter::VALUE_OF_BOOL) => value_of_bool,
        (reporter::STRING, reporter::VALUE_OF, reporter::VALUE_OF_OBJECT) => value_of_object,
        (reporter::PROPERTIES, reporter::NESTED, reporter::NESTED_DESC) => nested,
        _ => return None,
    };
    Some(native)
}

fn arg(args: &[Value], index: usize, native: &str) -> Result<Value, VmError> {
    args.get(index)
        .copied()
        .ok_or_else(|| malformed(native, format!("missing argument {}", index)))
}

fn string_result(vm: &mut Vm, s: String) -> Result<Flow, VmError> {
    Ok(Flow::Return(Some(Value::Ref(vm.alloc_string(s)))))
}

// =============================================================================
// Reporter
// =============================================================================

/// Metric name and label values of a reporter call. A null label array
/// means no labels; a null element renders as `"null"`.
fn report_args(vm: &Vm, args: &[Value], native: &str) -> Result<(String, Vec<String>), VmError> {
    let name = vm
        .string_value(arg(args, 0, native)?)
        .ok_or_else(|| malformed(native, "metric name is not a string"))?
        .to_string();

    let labels = match arg(args, 1, native)? {
        Value::Null => Vec::new(),
        Value::Ref(r) => match vm.heap().get(r) {
            Some(Object::Array { items, .. }) => items
                .iter()
                .map(|item| match item {
                    Value::Null => Ok("null".to_string()),
                    other => vm
                        .string_value(*other)
                        .map(str::to_string)
                        .ok_or_else(|| malformed(native, "label value is not a string")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(malformed(native, "label values are not an array")),
        },
        other => return Err(malformed(native, format!("label values are {:?}", other))),
    };
    Ok((name, labels))
}

fn counter_inc(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let (name, labels) = report_args(vm, args, "weaver/Reporter.counterInc")?;
    vm.register().counter_inc(&name, &labels);
    Ok(Flow::Return(None))
}

fn gauge_inc(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let (name, labels) = report_args(vm, args, "weaver/Reporter.gaugeInc")?;
    vm.register().gauge_inc(&name, &labels);
    Ok(Flow::Return(None))
}

fn gauge_dec(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let (name, labels) = report_args(vm, args, "weaver/Reporter.gaugeDec")?;
    vm.register().gauge_dec(&name, &labels);
    Ok(Flow::Return(None))
}

fn record_time(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    const NATIVE: &str = "weaver/Reporter.recordTime";
    let (name, labels) = report_args(vm, args, NATIVE)?;
    let elapsed = arg(args, 2, NATIVE)?
        .as_long()
        .ok_or_else(|| malformed(NATIVE, "elapsed time is not a long"))?;
    vm.register()
        .record_time(&name, &labels, u64::try_from(elapsed).unwrap_or(0));
    Ok(Flow::Return(None))
}

// =============================================================================
// System / String
// =============================================================================

fn nano_time(vm: &mut Vm, _args: &[Value]) -> Result<Flow, VmError> {
    Ok(Flow::Return(Some(Value::Long(vm.elapsed_nanos()))))
}

fn value_of_int(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let v = arg(args, 0, "core/String.valueOf(I)")?;
    string_result(vm, render_primitive(v))
}

fn value_of_long(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let v = arg(args, 0, "core/String.valueOf(J)")?;
    string_result(vm, render_primitive(v))
}

fn value_of_bool(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let b = arg(args, 0, "core/String.valueOf(Z)")?.as_int().unwrap_or(0) != 0;
    string_result(vm, b.to_string())
}

fn value_of_object(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    let v = arg(args, 0, "core/String.valueOf(Object)")?;
    display(vm, v)
}

fn render_primitive(value: Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Null => "null".to_string(),
        Value::Ref(r) => format!("@{:x}", r),
    }
}

/// String form of any value. Instances whose class declares `toString`
/// are asked for it.
fn display(vm: &mut Vm, value: Value) -> Result<Flow, VmError> {
    let Value::Ref(r) = value else {
        return string_result(vm, render_primitive(value));
    };
    let class = match vm.heap().get(r) {
        Some(Object::Str(_)) => return Ok(Flow::Return(Some(value))),
        Some(object) => object.class_name(),
        None => return Err(malformed("core/String.valueOf", "dangling reference")),
    };
    if !class.starts_with('[') {
        match vm.resolve_method(&class, TO_STRING, TO_STRING_DESC) {
            Ok(_) => return vm.call_virtual(r, TO_STRING, TO_STRING_DESC, Vec::new()),
            Err(VmError::MethodNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    string_result(vm, format!("{}@{:x}", class, r))
}

// =============================================================================
// Properties
// =============================================================================

/// Follow `path` (dot-separated field names) from `target`. When a step
/// cannot be taken the target itself is returned. Primitive leaves are
/// returned as strings.
fn nested(vm: &mut Vm, args: &[Value]) -> Result<Flow, VmError> {
    const NATIVE: &str = "weaver/Properties.nested";
    let target = arg(args, 0, NATIVE)?;
    let Some(path) = vm.string_value(arg(args, 1, NATIVE)?).map(str::to_string) else {
        return Ok(Flow::Return(Some(target)));
    };

    let mut current = target;
    let mut leaf_descriptor = String::new();
    for segment in path.split('.') {
        match field_of(vm, current, segment) {
            Some((value, descriptor)) => {
                current = value;
                leaf_descriptor = descriptor;
            }
            None => return Ok(Flow::Return(Some(target))),
        }
    }

    match (current, leaf_descriptor.as_bytes().first()) {
        (Value::Int(v), Some(b'Z')) => string_result(vm, (v != 0).to_string()),
        (Value::Int(_) | Value::Long(_), _) => string_result(vm, render_primitive(current)),
        _ => Ok(Flow::Return(Some(current))),
    }
}

/// Value and declared descriptor of field `name` on the instance `value`.
/// Fields that were declared but never written read as their zero value.
fn field_of(vm: &Vm, value: Value, name: &str) -> Option<(Value, String)> {
    let Value::Ref(r) = value else {
        return None;
    };
    let Object::Instance { class, fields } = vm.heap().get(r)? else {
        return None;
    };
    let descriptor = declared_field(vm, class, name);
    match (fields.get(name), descriptor) {
        (Some(v), Some(d)) => Some((*v, d)),
        (Some(v), None) => Some((*v, String::new())),
        (None, Some(d)) => Some((Value::default_for(&d), d)),
        (None, None) => None,
    }
}

fn declared_field(vm: &Vm, class: &str, name: &str) -> Option<String> {
    let mut current = Some(class.to_string());
    while let Some(c) = current {
        if c == STRING_TYPE {
            return None;
        }
        let unit = vm.loader().load(&c).ok()?;
        if let Some(field) = unit.find_field(name) {
            return Some(field.descriptor.clone());
        }
        current = unit.header.super_name.clone();
    }
    None
}
