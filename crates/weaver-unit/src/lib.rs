//! Weaver Unit
//!
//! Binary format and in-memory representation of compiled program units.
//!
//! A *unit* is a class-like module: a name, a superclass, implemented
//! interfaces, fields, and methods whose bodies are stack-machine code.
//! This crate owns everything about that representation so the rewriting
//! engine in `weaver-core` can work on a decoded IR instead of raw bytes.
//!
//! # Core Modules
//!
//! - [`format`]: `UnitFile`, `Method`, `Code`, access flags, well-known type names
//! - [`insn`]: the instruction IR (`Insn`, `Label`, `MemberRef`)
//! - [`descriptor`]: type and method descriptor parsing
//! - [`codec`]: byte-level encoding/decoding, including header-only reads
//! - [`analysis`]: frame computation and the structural verifier
//! - [`builder`]: programmatic unit assembly
//! - [`disasm`]: human-readable listings for debugging
//!
//! # Example
//!
//! ```ignore
//! use weaver_unit::{analysis::RootHierarchy, builder::{CodeBuilder, UnitBuilder}, insn::Insn};
//!
//! let mut code = CodeBuilder::new();
//! code.emit(Insn::Return(None));
//! let bytes = UnitBuilder::new("app/Foo")
//!     .method(access::PUBLIC, "bar", "()V", code)
//!     .to_bytes(&RootHierarchy)?;
//! ```

pub mod analysis;
pub mod builder;
pub mod codec;
pub mod descriptor;
pub mod disasm;
pub mod format;
pub mod insn;

pub use analysis::{finalize_unit, verify_unit, RootHierarchy, TypeHierarchy, VerifyError};
pub use codec::{decode_unit, encode_unit, read_header};
pub use descriptor::{MethodDescriptor, TypeDesc};
pub use format::{
    access, AccessFlags, Code, Field, Frame, Handler, Method, UnitFile, UnitHeader, VType,
    ROOT_TYPE, STATIC_INIT, STRING_TYPE, THROWABLE_TYPE,
};
pub use insn::{Insn, Label, MemberRef, ValueKind};
