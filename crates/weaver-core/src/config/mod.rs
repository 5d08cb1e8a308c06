//! Configuration: the YAML document, method keys, and the lookup index.

pub mod args;
pub mod document;
pub mod index;
pub mod key;
pub mod metric;

pub use args::AgentArgs;
pub use document::{ConfigDocument, DebugSettings, MetricEntry};
pub use index::ConfigIndex;
pub use key::MethodKey;
pub use metric::{GaugeOp, LabelSpec, Metric, MetricKind};
