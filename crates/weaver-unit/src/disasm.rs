//! Text listings of units, used for debug dumps and the `disasm` command.

use std::fmt::Write;

use crate::format::{UnitFile, VType};

pub fn disassemble(unit: &UnitFile) -> String {
    let mut out = String::new();
    let h = &unit.header;
    let _ = write!(out, "unit {} [{}]", h.name, h.access);
    if let Some(s) = &h.super_name {
        let _ = write!(out, " extends {}", s);
    }
    if !h.interfaces.is_empty() {
        let _ = write!(out, " implements {}", h.interfaces.join(", "));
    }
    out.push('\n');

    for field in &unit.fields {
        let _ = writeln!(out, "  field {} {} [{}]", field.name, field.descriptor, field.access);
    }

    for method in &unit.methods {
        let _ = writeln!(
            out,
            "\n  method {}{} [{}]",
            method.name, method.descriptor, method.access
        );
        let Some(code) = &method.code else {
            continue;
        };
        let _ = writeln!(
            out,
            "    max_stack={} max_locals={}",
            code.max_stack, code.max_locals
        );
        for insn in &code.insns {
            if insn.is_label() {
                let _ = writeln!(out, "   {}", insn);
            } else {
                let _ = writeln!(out, "      {}", insn);
            }
        }
        for handler in &code.handlers {
            let _ = writeln!(
                out,
                "    try {} .. {} -> {} catch {}",
                handler.start,
                handler.end,
                handler.handler,
                handler.catch_type.as_deref().unwrap_or("*")
            );
        }
        for frame in &code.frames {
            let _ = writeln!(
                out,
                "    frame {} locals=[{}] stack=[{}]",
                frame.label,
                join(&frame.locals),
                join(&frame.stack)
            );
        }
    }
    out
}

fn join(types: &[VType]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
