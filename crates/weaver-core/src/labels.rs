//! # Label binding
//!
//! Each label is `<name>:<valueExpr>`. The value expression is either a
//! literal or refers to a method argument:
//!
//! | expression        | binding                                         |
//! |-------------------|-------------------------------------------------|
//! | `GET`             | the literal string `GET`                        |
//! | `$1`              | string form of argument 1                       |
//! | `$0.owner.name`   | property `owner.name` of argument 0, as string  |
//!
//! Argument indices count declared parameters only; the receiver of an
//! instance method is not an argument. Array arguments cannot be bound.

use weaver_unit::{Insn, TypeDesc, ValueKind};

use crate::config::LabelSpec;
use crate::errors::LabelError;
use crate::reporter;

/// Where a label's runtime value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Literal(String),
    ArgumentToString(usize),
    /// Resolved at the call site; falls back to the argument itself when the
    /// path cannot be followed.
    NestedProperty { index: usize, path: String },
}

/// Parse the syntax of one value expression without checking it against a
/// method.
pub fn parse_expr(expr: &str) -> Result<Binding, LabelError> {
    let Some(rest) = expr.strip_prefix('$') else {
        return Ok(Binding::Literal(expr.to_string()));
    };
    let bad = || LabelError::BadExpression {
        expr: expr.to_string(),
    };
    let (digits, path) = match rest.split_once('.') {
        Some((d, p)) => (d, Some(p)),
        None => (rest, None),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let index: usize = digits.parse().map_err(|_| bad())?;
    match path {
        None => Ok(Binding::ArgumentToString(index)),
        Some(path) => {
            if !path.split('.').all(is_identifier) {
                return Err(bad());
            }
            Ok(Binding::NestedProperty {
                index,
                path: path.to_string(),
            })
        }
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Checks label expressions against a method's declared parameters and
/// turns them into bindings.
pub struct LabelBinder<'a> {
    params: &'a [TypeDesc],
}

impl<'a> LabelBinder<'a> {
    pub fn new(params: &'a [TypeDesc]) -> Self {
        Self { params }
    }

    pub fn validate(&self, labels: &[LabelSpec]) -> bool {
        self.check(labels).is_ok()
    }

    pub fn check(&self, labels: &[LabelSpec]) -> Result<(), LabelError> {
        self.binding_plan(labels).map(|_| ())
    }

    /// Bindings in label order.
    pub fn binding_plan(&self, labels: &[LabelSpec]) -> Result<Vec<Binding>, LabelError> {
        labels
            .iter()
            .map(|label| self.bind(&label.value_expr))
            .collect()
    }

    fn bind(&self, expr: &str) -> Result<Binding, LabelError> {
        let binding = parse_expr(expr)?;
        let index = match &binding {
            Binding::Literal(_) => return Ok(binding),
            Binding::ArgumentToString(i) => *i,
            Binding::NestedProperty { index, .. } => *index,
        };
        let param = self
            .params
            .get(index)
            .ok_or_else(|| LabelError::IndexOutOfRange {
                expr: expr.to_string(),
                index,
                arity: self.params.len(),
            })?;
        if param.is_array() {
            return Err(LabelError::ArrayArgument {
                expr: expr.to_string(),
                index,
            });
        }
        Ok(binding)
    }
}

// =============================================================================
// Code emission
// =============================================================================

/// Local slot holding argument `index`. The method rewriter refuses
/// methods whose parameters do not all fit in the slot range, so the
/// saturation never applies to emitted code.
pub fn argument_slot(index: usize, is_static: bool) -> u16 {
    u16::try_from(index + usize::from(!is_static)).unwrap_or(u16::MAX)
}

/// Instructions leaving the string value of `binding` on the stack.
pub fn emit_binding(binding: &Binding, params: &[TypeDesc], is_static: bool, out: &mut Vec<Insn>) {
    match binding {
        Binding::Literal(s) => out.push(Insn::PushStr(s.clone())),
        Binding::ArgumentToString(index) => emit_argument(*index, params, is_static, out),
        Binding::NestedProperty { index, path } => {
            let Some(TypeDesc::Object(_)) = params.get(*index) else {
                // Primitives have no properties.
                emit_argument(*index, params, is_static, out);
                return;
            };
            out.push(Insn::Load(ValueKind::Ref, argument_slot(*index, is_static)));
            out.push(Insn::PushStr(path.clone()));
            out.push(Insn::InvokeStatic(reporter::nested_property()));
            out.push(Insn::InvokeStatic(reporter::value_of(reporter::VALUE_OF_OBJECT)));
        }
    }
}

fn emit_argument(index: usize, params: &[TypeDesc], is_static: bool, out: &mut Vec<Insn>) {
    let slot = argument_slot(index, is_static);
    let (kind, value_of) = match params.get(index) {
        Some(TypeDesc::Bool) => (ValueKind::Int, reporter::VALUE_OF_BOOL),
        Some(TypeDesc::Int) => (ValueKind::Int, reporter::VALUE_OF_INT),
        Some(TypeDesc::Long) => (ValueKind::Long, reporter::VALUE_OF_LONG),
        _ => (ValueKind::Ref, reporter::VALUE_OF_OBJECT),
    };
    out.push(Insn::Load(kind, slot));
    out.push(Insn::InvokeStatic(reporter::value_of(value_of)));
}

/// Instructions leaving the label value array on the stack, or null when the
/// metric has no labels.
pub fn emit_label_array(
    bindings: &[Binding],
    params: &[TypeDesc],
    is_static: bool,
    out: &mut Vec<Insn>,
) {
    if bindings.is_empty() {
        out.push(Insn::PushNull);
        return;
    }
    out.push(Insn::PushInt(bindings.len() as i32));
    out.push(Insn::NewArray(reporter::LABEL_ARRAY_ELEM.to_string()));
    for (i, binding) in bindings.iter().enumerate() {
        out.push(Insn::Dup);
        out.push(Insn::PushInt(i as i32));
        emit_binding(binding, params, is_static, out);
        out.push(Insn::ArrayStore);
    }
}
