//! Weaver Core
//!
//! Load-time metrics instrumentation. Given a YAML configuration that maps
//! methods to metrics, the engine rewrites unit bytes as they are loaded so
//! that each configured method reports a counter increment, a gauge change,
//! or its own duration, without the method's source knowing about metrics.
//!
//! # Core Modules
//!
//! - [`config`]: configuration document, `MethodKey`, `ConfigIndex`, `AgentArgs`
//! - [`ancestor`]: header-only common-supertype resolution
//! - [`labels`]: label expressions and their bytecode
//! - [`listener`]: per-metric entry/exit instrumentation
//! - [`method_rewriter`] / [`class_rewriter`]: body and unit rewriting
//! - [`dispatcher`]: the loader-facing entry point and debug dumps
//! - [`reporter`]: the runtime call sites rewritten code invokes
//! - [`agent`]: bootstrap from an argument string
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use weaver_core::{ConfigIndex, TransformDispatcher, UnitTransformer, NoResources};
//! use weaver_spi::InMemoryRegister;
//!
//! let config = ConfigIndex::from_yaml_str(yaml)?;
//! let dispatcher = TransformDispatcher::new(Arc::new(config), Arc::new(InMemoryRegister::new()));
//! let bytes = dispatcher.transform("app/Foo", &original, &NoResources)?;
//! ```

pub mod agent;
pub mod ancestor;
pub mod class_rewriter;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod labels;
pub mod listener;
pub mod method_rewriter;
pub mod reporter;

pub use ancestor::{AncestorResolver, DescriptorCache, NoResources, ResourceSource, TypeDescriptor};
pub use class_rewriter::{ClassRewriter, RewriteSummary};
pub use config::{AgentArgs, ConfigIndex, GaugeOp, LabelSpec, MethodKey, Metric, MetricKind};
pub use dispatcher::{TransformDispatcher, UnitTransformer};
pub use errors::{ConfigError, LabelError, TransformError};
pub use labels::{Binding, LabelBinder};
pub use listener::{ExitSignal, Listener, ListenerKind};
pub use method_rewriter::MethodRewriter;
