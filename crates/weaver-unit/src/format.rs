//! In-memory model of a unit file.

use std::fmt;

use crate::insn::{Insn, Label};

/// File magic: ASCII "WEAV".
pub const UNIT_MAGIC: u32 = 0x5745_4156;

/// Current format version.
pub const UNIT_VERSION: u16 = 1;

/// Root of the type hierarchy; assignable from every reference type.
pub const ROOT_TYPE: &str = "core/Object";

pub const STRING_TYPE: &str = "core/String";

/// Implicit catch type of handlers without an explicit one.
pub const THROWABLE_TYPE: &str = "core/Throwable";

/// Name of the one-time unit initializer.
pub const STATIC_INIT: &str = "<clinit>";

pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
}

/// Access and property flags of a unit, field or method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AccessFlags(pub u16);

impl AccessFlags {
    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn is_static(self) -> bool {
        self.contains(access::STATIC)
    }

    pub fn is_interface(self) -> bool {
        self.contains(access::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.contains(access::ABSTRACT)
    }

    pub fn is_native(self) -> bool {
        self.contains(access::NATIVE)
    }

    pub fn is_synthetic(self) -> bool {
        self.contains(access::SYNTHETIC)
    }
}

impl fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 8] = [
            (access::PUBLIC, "public"),
            (access::PRIVATE, "private"),
            (access::STATIC, "static"),
            (access::FINAL, "final"),
            (access::NATIVE, "native"),
            (access::INTERFACE, "interface"),
            (access::ABSTRACT, "abstract"),
            (access::SYNTHETIC, "synthetic"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(" "))
    }
}

// =============================================================================
// Header
// =============================================================================

/// The leading part of a unit file: identity and direct supertypes.
///
/// This is everything the ancestor resolver needs, and it can be read without
/// decoding fields or method bodies (see [`crate::codec::read_header`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHeader {
    pub access: AccessFlags,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

impl UnitHeader {
    pub fn is_interface(&self) -> bool {
        self.access.is_interface()
    }
}

// =============================================================================
// Unit
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub header: UnitHeader,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

impl UnitFile {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn is_interface(&self) -> bool {
        self.header.is_interface()
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_static_init(&self) -> bool {
        self.methods
            .iter()
            .any(|m| m.name == STATIC_INIT && m.access.is_static())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub access: AccessFlags,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub access: AccessFlags,
    pub name: String,
    pub descriptor: String,
    /// Absent for abstract and native methods.
    pub code: Option<Code>,
}

// =============================================================================
// Code
// =============================================================================

/// A method body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Insn>,
    /// Exception table. Earlier entries take precedence.
    pub handlers: Vec<Handler>,
    /// Stack-map frames at branch targets and handler entries.
    pub frames: Vec<Frame>,
}

impl Code {
    /// A label id not used anywhere in this body.
    pub fn next_free_label(&self) -> u32 {
        let from_insns = self.insns.iter().filter_map(|insn| match insn {
            Insn::Label(l) => Some(l.0),
            other => other.branch_target().map(|l| l.0),
        });
        let from_handlers = self
            .handlers
            .iter()
            .flat_map(|h| [h.start.0, h.end.0, h.handler.0]);
        from_insns
            .chain(from_handlers)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    /// Index of each label's pseudo-instruction.
    pub fn label_positions(&self) -> std::collections::HashMap<Label, usize> {
        self.insns
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| match insn {
                Insn::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect()
    }
}

/// One exception-table entry: `[start, end)` is protected by `handler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything.
    pub catch_type: Option<String>,
}

/// Verification type of a local slot or stack entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Int,
    Long,
    Null,
    Ref(String),
}

impl VType {
    pub fn is_reference(&self) -> bool {
        matches!(self, VType::Ref(_) | VType::Null)
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VType::Top => write!(f, "top"),
            VType::Int => write!(f, "int"),
            VType::Long => write!(f, "long"),
            VType::Null => write!(f, "null"),
            VType::Ref(name) => write!(f, "{}", name),
        }
    }
}

/// Types of locals and stack at a labelled position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: Label,
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}
