//! Sandbox error types.

use std::fmt;

use weaver_core::TransformError;

#[derive(Debug)]
pub enum VmError {
    /// No bytes were added for this unit.
    UnitNotFound { name: String },

    /// The unit bytes could not be decoded.
    Load { unit: String, message: String },

    /// A registered transformer refused the unit.
    Transform(TransformError),

    MethodNotFound {
        owner: String,
        name: String,
        descriptor: String,
    },

    /// The code did something a verified unit never does.
    Malformed { method: String, message: String },

    /// An exception escaped the outermost invocation.
    Uncaught {
        class: String,
        message: Option<String>,
    },

    StepLimit { limit: u64 },

    CallDepth { limit: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::UnitNotFound { name } => write!(f, "unit not found: {}", name),
            VmError::Load { unit, message } => write!(f, "cannot load {}: {}", unit, message),
            VmError::Transform(e) => write!(f, "{}", e),
            VmError::MethodNotFound {
                owner,
                name,
                descriptor,
            } => write!(f, "no method {}.{}{}", owner, name, descriptor),
            VmError::Malformed { method, message } => {
                write!(f, "malformed code in {}: {}", method, message)
            }
            VmError::Uncaught { class, message } => match message {
                Some(m) => write!(f, "uncaught {}: {}", class, m),
                None => write!(f, "uncaught {}", class),
            },
            VmError::StepLimit { limit } => write!(f, "step limit of {} exceeded", limit),
            VmError::CallDepth { limit } => write!(f, "call depth of {} exceeded", limit),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Transform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransformError> for VmError {
    fn from(e: TransformError) -> Self {
        VmError::Transform(e)
    }
}

impl VmError {
    pub fn is_uncaught(&self) -> bool {
        matches!(self, VmError::Uncaught { .. })
    }
}
