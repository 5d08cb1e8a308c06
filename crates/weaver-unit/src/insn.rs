//! Instruction IR.
//!
//! Code is decoded into a flat list of [`Insn`] where every branch target,
//! handler boundary and frame position is a [`Label`] pseudo-instruction.
//! Rewriters splice instructions freely; byte offsets are only resolved again
//! when the unit is encoded.

use std::fmt;

/// A position marker inside a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Computational category of a stack value or local slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Ref,
}

impl ValueKind {
    fn prefix(self) -> char {
        match self {
            ValueKind::Int => 'i',
            ValueKind::Long => 'l',
            ValueKind::Ref => 'a',
        }
    }
}

/// Symbolic reference to a field or method of another unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// A single stack-machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Pseudo-instruction marking a position; encodes to nothing.
    Label(Label),
    Nop,
    PushNull,
    PushInt(i32),
    PushLong(i64),
    PushStr(String),
    Load(ValueKind, u16),
    Store(ValueKind, u16),
    Pop,
    Dup,
    Swap,
    IAdd,
    ISub,
    LAdd,
    LSub,
    Goto(Label),
    IfEq(Label),
    IfNe(Label),
    IfNull(Label),
    IfNonNull(Label),
    IfICmpLt(Label),
    New(String),
    GetField(MemberRef),
    PutField(MemberRef),
    GetStatic(MemberRef),
    PutStatic(MemberRef),
    /// Operand is the element descriptor.
    NewArray(String),
    ArrayLength,
    ArrayLoad,
    ArrayStore,
    InvokeStatic(MemberRef),
    InvokeVirtual(MemberRef),
    Return(Option<ValueKind>),
    Throw,
}

impl Insn {
    /// Branch destination, if this instruction can jump.
    pub fn branch_target(&self) -> Option<Label> {
        match self {
            Insn::Goto(l)
            | Insn::IfEq(l)
            | Insn::IfNe(l)
            | Insn::IfNull(l)
            | Insn::IfNonNull(l)
            | Insn::IfICmpLt(l) => Some(*l),
            _ => None,
        }
    }

    /// Whether control can continue to the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Insn::Goto(_) | Insn::Return(_) | Insn::Throw)
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Insn::Return(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Insn::Label(_))
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(l) => write!(f, "{}:", l),
            Insn::Nop => write!(f, "nop"),
            Insn::PushNull => write!(f, "aconst_null"),
            Insn::PushInt(v) => write!(f, "iconst {}", v),
            Insn::PushLong(v) => write!(f, "lconst {}", v),
            Insn::PushStr(s) => write!(f, "sconst {:?}", s),
            Insn::Load(k, slot) => write!(f, "{}load {}", k.prefix(), slot),
            Insn::Store(k, slot) => write!(f, "{}store {}", k.prefix(), slot),
            Insn::Pop => write!(f, "pop"),
            Insn::Dup => write!(f, "dup"),
            Insn::Swap => write!(f, "swap"),
            Insn::IAdd => write!(f, "iadd"),
            Insn::ISub => write!(f, "isub"),
            Insn::LAdd => write!(f, "ladd"),
            Insn::LSub => write!(f, "lsub"),
            Insn::Goto(l) => write!(f, "goto {}", l),
            Insn::IfEq(l) => write!(f, "ifeq {}", l),
            Insn::IfNe(l) => write!(f, "ifne {}", l),
            Insn::IfNull(l) => write!(f, "ifnull {}", l),
            Insn::IfNonNull(l) => write!(f, "ifnonnull {}", l),
            Insn::IfICmpLt(l) => write!(f, "if_icmplt {}", l),
            Insn::New(c) => write!(f, "new {}", c),
            Insn::GetField(m) => write!(f, "getfield {}", m),
            Insn::PutField(m) => write!(f, "putfield {}", m),
            Insn::GetStatic(m) => write!(f, "getstatic {}", m),
            Insn::PutStatic(m) => write!(f, "putstatic {}", m),
            Insn::NewArray(d) => write!(f, "newarray {}", d),
            Insn::ArrayLength => write!(f, "arraylength"),
            Insn::ArrayLoad => write!(f, "aaload"),
            Insn::ArrayStore => write!(f, "aastore"),
            Insn::InvokeStatic(m) => write!(f, "invokestatic {}", m),
            Insn::InvokeVirtual(m) => write!(f, "invokevirtual {}", m),
            Insn::Return(None) => write!(f, "return"),
            Insn::Return(Some(k)) => write!(f, "{}return", k.prefix()),
            Insn::Throw => write!(f, "throw"),
        }
    }
}

// =============================================================================
// Opcodes
// =============================================================================

pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST: u8 = 0x02;
    pub const LCONST: u8 = 0x03;
    pub const SCONST: u8 = 0x04;
    pub const ILOAD: u8 = 0x10;
    pub const LLOAD: u8 = 0x11;
    pub const ALOAD: u8 = 0x12;
    pub const ISTORE: u8 = 0x13;
    pub const LSTORE: u8 = 0x14;
    pub const ASTORE: u8 = 0x15;
    pub const POP: u8 = 0x20;
    pub const DUP: u8 = 0x21;
    pub const SWAP: u8 = 0x22;
    pub const IADD: u8 = 0x30;
    pub const ISUB: u8 = 0x31;
    pub const LADD: u8 = 0x32;
    pub const LSUB: u8 = 0x33;
    pub const GOTO: u8 = 0x40;
    pub const IFEQ: u8 = 0x41;
    pub const IFNE: u8 = 0x42;
    pub const IFNULL: u8 = 0x43;
    pub const IFNONNULL: u8 = 0x44;
    pub const IF_ICMPLT: u8 = 0x45;
    pub const NEW: u8 = 0x50;
    pub const GETFIELD: u8 = 0x51;
    pub const PUTFIELD: u8 = 0x52;
    pub const GETSTATIC: u8 = 0x53;
    pub const PUTSTATIC: u8 = 0x54;
    pub const NEWARRAY: u8 = 0x58;
    pub const ARRAYLENGTH: u8 = 0x59;
    pub const AALOAD: u8 = 0x5A;
    pub const AASTORE: u8 = 0x5B;
    pub const INVOKESTATIC: u8 = 0x60;
    pub const INVOKEVIRTUAL: u8 = 0x61;
    pub const RETURN: u8 = 0x70;
    pub const IRETURN: u8 = 0x71;
    pub const LRETURN: u8 = 0x72;
    pub const ARETURN: u8 = 0x73;
    pub const THROW: u8 = 0x74;
}
