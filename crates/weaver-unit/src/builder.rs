//! Programmatic assembly of units.
//!
//! Used by tests and tools to produce well-formed unit bytes without writing
//! offsets by hand: labels are allocated by the [`CodeBuilder`], and maxs and
//! frames are filled in by [`finalize_unit`] when the unit is serialized.

use anyhow::Result;

use crate::analysis::{finalize_unit, TypeHierarchy};
use crate::codec::encode_unit;
use crate::format::{
    access, AccessFlags, Code, Field, Handler, Method, UnitFile, UnitHeader, ROOT_TYPE,
};
use crate::insn::{Insn, Label};

#[derive(Debug, Default)]
pub struct CodeBuilder {
    insns: Vec<Insn>,
    handlers: Vec<Handler>,
    next_label: u32,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a label; place it with [`CodeBuilder::mark`].
    pub fn label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.insns.push(Insn::Label(label));
        self
    }

    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.insns.push(insn);
        self
    }

    pub fn emit_all(&mut self, insns: impl IntoIterator<Item = Insn>) -> &mut Self {
        self.insns.extend(insns);
        self
    }

    pub fn handler(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> &mut Self {
        self.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    pub fn build(self) -> Code {
        Code {
            max_stack: 0,
            max_locals: 0,
            insns: self.insns,
            handlers: self.handlers,
            frames: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct UnitBuilder {
    unit: UnitFile,
}

impl UnitBuilder {
    /// A public class extending the root type.
    pub fn new(name: &str) -> Self {
        Self {
            unit: UnitFile {
                header: UnitHeader {
                    access: AccessFlags(access::PUBLIC),
                    name: name.to_string(),
                    super_name: Some(ROOT_TYPE.to_string()),
                    interfaces: Vec::new(),
                },
                fields: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    pub fn interface(name: &str) -> Self {
        let mut b = Self::new(name);
        b.unit.header.access = AccessFlags(access::PUBLIC | access::INTERFACE | access::ABSTRACT);
        b
    }

    pub fn access(mut self, flags: u16) -> Self {
        self.unit.header.access = AccessFlags(flags);
        self
    }

    pub fn extends(mut self, super_name: &str) -> Self {
        self.unit.header.super_name = Some(super_name.to_string());
        self
    }

    /// For the root type itself.
    pub fn no_super(mut self) -> Self {
        self.unit.header.super_name = None;
        self
    }

    pub fn implements(mut self, iface: &str) -> Self {
        self.unit.header.interfaces.push(iface.to_string());
        self
    }

    pub fn field(mut self, flags: u16, name: &str, descriptor: &str) -> Self {
        self.unit.fields.push(Field {
            access: AccessFlags(flags),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
        self
    }

    pub fn method(mut self, flags: u16, name: &str, descriptor: &str, code: CodeBuilder) -> Self {
        self.unit.methods.push(Method {
            access: AccessFlags(flags),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Some(code.build()),
        });
        self
    }

    /// A method without a body (abstract or native).
    pub fn declare(mut self, flags: u16, name: &str, descriptor: &str) -> Self {
        self.unit.methods.push(Method {
            access: AccessFlags(flags),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
        });
        self
    }

    pub fn build(self) -> UnitFile {
        self.unit
    }

    /// Finalize frames against `hierarchy` and encode.
    pub fn to_bytes(self, hierarchy: &dyn TypeHierarchy) -> Result<Vec<u8>> {
        let mut unit = self.unit;
        finalize_unit(&mut unit, hierarchy)?;
        encode_unit(&unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{verify_unit, RootHierarchy};
    use crate::codec::decode_unit;
    use crate::insn::ValueKind;

    #[test]
    fn test_built_unit_decodes_and_verifies() {
        let mut code = CodeBuilder::new();
        let (start, end, handler) = (code.label(), code.label(), code.label());
        code.mark(start)
            .emit(Insn::Load(ValueKind::Int, 0))
            .emit(Insn::Return(Some(ValueKind::Int)))
            .mark(end)
            .mark(handler)
            .emit(Insn::Throw)
            .handler(start, end, handler, None);

        let bytes = UnitBuilder::new("app/Echo")
            .method(access::PUBLIC | access::STATIC, "echo", "(I)I", code)
            .to_bytes(&RootHierarchy)
            .unwrap();
        let unit = decode_unit(&bytes).unwrap();
        verify_unit(&unit, &RootHierarchy).unwrap();

        let code = unit.methods[0].code.as_ref().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        assert_eq!(code.handlers.len(), 1);
        assert_eq!(code.frames.len(), 1);
    }

    #[test]
    fn test_interface_builder_flags() {
        let unit = UnitBuilder::interface("app/Named")
            .declare(access::PUBLIC | access::ABSTRACT, "name", "()Lcore/String;")
            .build();
        assert!(unit.is_interface());
        assert!(unit.methods[0].code.is_none());
    }
}
