//! Weaver Sandbox
//!
//! A small execution environment for units, used to run instrumented code
//! and observe the metrics it reports.
//!
//! - [`loader`]: `UnitLoader`, raw bytes by name plus a transformer hook
//! - [`vm`]: the interpreter
//! - `natives`: runtime bodies of the reporter, clock, string and property call sites
//! - [`core_units`]: the built-in units every loader starts with
//!
//! # Example
//!
//! ```ignore
//! let loader = Arc::new(UnitLoader::new()?);
//! loader.add_transformer(Arc::new(dispatcher));
//! loader.add_bytes(app_bytes)?;
//! let mut vm = Vm::new(loader, register);
//! vm.invoke_static("app/Main", "run", "()V", &[])?;
//! ```

pub mod core_units;
pub mod errors;
pub mod heap;
pub mod loader;
mod natives;
pub mod vm;

pub use errors::VmError;
pub use heap::{ObjRef, Object, Value};
pub use loader::UnitLoader;
pub use vm::Vm;
