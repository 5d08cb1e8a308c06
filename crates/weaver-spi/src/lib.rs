//! Metrics registration SPI.
//!
//! Rewritten code never talks to a metrics library directly. It calls a small
//! set of reporter entry points, which land on a [`MetricRegister`]. Backends
//! implement that trait and are constructed through a
//! [`MetricRegisterFactory`]; the process-wide instance is held by
//! [`MetricsProvider`].
//!
//! - [`register`]: the `MetricRegister` trait and instrument kinds
//! - [`provider`]: factory trait and the lazily-built process singleton
//! - [`memory`]: `InMemoryRegister`, the default backend and test double

pub mod memory;
pub mod provider;
pub mod register;

pub use memory::{InMemoryFactory, InMemoryRegister, InstrumentSnapshot};
pub use provider::{BackendSettings, MetricRegisterFactory, MetricsProvider};
pub use register::{InstrumentKind, MetricRegister};
