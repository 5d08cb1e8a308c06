//! metrics-weaver
//!
//! Load-time metrics instrumentation for compiled program units.
//!
//! - [`weaver_unit`]: unit format, instruction IR, codec and verifier
//! - [`weaver_core`]: configuration, rewriting and dispatch
//! - [`weaver_spi`]: the metric register SPI and in-memory backend
//! - [`weaver_prometheus`]: the prometheus backend
//! - [`weaver_sandbox`]: loader and interpreter for running instrumented units
//! - [`transform`] / [`run`]: the directory-level operations behind the `weaver` CLI

pub mod run;
pub mod transform;

pub use weaver_core;
pub use weaver_prometheus;
pub use weaver_sandbox;
pub use weaver_spi;
pub use weaver_unit;

pub use weaver_core::{ConfigIndex, TransformDispatcher, UnitTransformer};
pub use weaver_spi::{MetricRegister, MetricsProvider};
