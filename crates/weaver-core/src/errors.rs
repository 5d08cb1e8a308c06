//! Error types at the public boundary of the rewriting engine.

use std::path::PathBuf;

use weaver_unit::VerifyError;

/// Errors raised while loading or indexing the configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io {
        path: PathBuf,
        message: String,
    },

    /// The document is not valid YAML or does not match the expected shape.
    /// Unknown metric kinds land here.
    Parse { message: String },

    /// A method key is not `<unit>.<method>(<signature>)`.
    MalformedKey {
        key: String,
        reason: String,
    },

    /// A gauge `method` override other than increment or decrement.
    UnknownGaugeMethod {
        metric: String,
        method: String,
    },

    /// A label is not `<name>:<valueExpr>`.
    MalformedLabel {
        metric: String,
        label: String,
        reason: String,
    },

    /// Two keys name the same method once imports are applied.
    DuplicateKey { key: String },

    /// Two imports share the same short name.
    AmbiguousImport {
        short_name: String,
        first: String,
        second: String,
    },

    /// Bad agent argument string.
    BadArgument { argument: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "cannot read config {}: {}", path.display(), message)
            }
            ConfigError::Parse { message } => write!(f, "invalid config: {}", message),
            ConfigError::MalformedKey { key, reason } => {
                write!(f, "malformed method key \"{}\": {}", key, reason)
            }
            ConfigError::UnknownGaugeMethod { metric, method } => write!(
                f,
                "metric {}: unknown gauge method \"{}\" (expected increment or decrement)",
                metric, method
            ),
            ConfigError::MalformedLabel {
                metric,
                label,
                reason,
            } => write!(f, "metric {}: malformed label \"{}\": {}", metric, label, reason),
            ConfigError::DuplicateKey { key } => {
                write!(f, "duplicate method key {} after applying imports", key)
            }
            ConfigError::AmbiguousImport {
                short_name,
                first,
                second,
            } => write!(
                f,
                "imports {} and {} share the short name {}",
                first, second, short_name
            ),
            ConfigError::BadArgument { argument } => {
                write!(f, "bad agent argument \"{}\"", argument)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A label value expression that cannot be bound to the method's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    /// Starts with `$` but is not `$<index>` or `$<index>.<path>`.
    BadExpression { expr: String },

    IndexOutOfRange {
        expr: String,
        index: usize,
        arity: usize,
    },

    /// Array arguments have no useful string form.
    ArrayArgument { expr: String, index: usize },
}

impl std::fmt::Display for LabelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelError::BadExpression { expr } => {
                write!(f, "label expression \"{}\" is not $<index>[.<path>]", expr)
            }
            LabelError::IndexOutOfRange { expr, index, arity } => write!(
                f,
                "label expression \"{}\" refers to argument {} but the method takes {}",
                expr, index, arity
            ),
            LabelError::ArrayArgument { expr, index } => write!(
                f,
                "label expression \"{}\" refers to argument {}, which is an array",
                expr, index
            ),
        }
    }
}

impl std::error::Error for LabelError {}

/// Failure to rewrite one unit. The unit must not be loaded with partial
/// instrumentation, so these are returned to the loader.
#[derive(Debug)]
pub enum TransformError {
    /// The input bytes are not a valid unit.
    Decode { unit: String, message: String },

    /// A configured label cannot be bound for this method.
    Label {
        unit: String,
        method: String,
        metric: String,
        source: LabelError,
    },

    /// The metrics backend refused to register an instrument.
    Register { metric: String, message: String },

    /// A method descriptor in the unit could not be parsed.
    Descriptor {
        unit: String,
        method: String,
        message: String,
    },

    /// Instrumentation needs more local slots than a method can address.
    TooManyLocals { unit: String, method: String },

    /// The rewritten code failed frame analysis.
    Verify(VerifyError),

    /// The rewritten unit could not be serialized.
    Encode { unit: String, message: String },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Decode { unit, message } => {
                write!(f, "cannot decode unit {}: {}", unit, message)
            }
            TransformError::Label {
                unit,
                method,
                metric,
                source,
            } => write!(
                f,
                "unit {} method {}: labels of metric {} are invalid: {}",
                unit, method, metric, source
            ),
            TransformError::Register { metric, message } => {
                write!(f, "cannot register metric {}: {}", metric, message)
            }
            TransformError::Descriptor {
                unit,
                method,
                message,
            } => write!(f, "unit {} method {}: {}", unit, method, message),
            TransformError::TooManyLocals { unit, method } => write!(
                f,
                "unit {} method {}: instrumentation locals exceed {} slots",
                unit,
                method,
                u16::MAX
            ),
            TransformError::Verify(e) => write!(f, "rewritten code does not verify: {}", e),
            TransformError::Encode { unit, message } => {
                write!(f, "cannot encode unit {}: {}", unit, message)
            }
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransformError::Label { source, .. } => Some(source),
            TransformError::Verify(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VerifyError> for TransformError {
    fn from(e: VerifyError) -> Self {
        TransformError::Verify(e)
    }
}
