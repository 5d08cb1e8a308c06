use std::fmt;

use weaver_unit::MethodDescriptor;

use crate::errors::ConfigError;

/// Identifies one method: `(unit, method, signature)`.
///
/// Written in configuration as `<unit>.<method>(<signature>)`. The unit name
/// is everything before the last `.` preceding the signature, so dotted unit
/// names parse; they are normalized to `/`-separated internal names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    pub unit: String,
    pub method: String,
    pub signature: String,
}

impl MethodKey {
    pub fn new(
        unit: impl Into<String>,
        method: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            method: method.into(),
            signature: signature.into(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let key = key.trim();
        let paren = key
            .find('(')
            .ok_or_else(|| malformed("missing \"(\" starting the signature"))?;
        let (head, signature) = key.split_at(paren);
        let dot = head
            .rfind('.')
            .ok_or_else(|| malformed("missing \".\" between unit and method"))?;
        let (unit, method) = (&head[..dot], &head[dot + 1..]);
        if unit.is_empty() {
            return Err(malformed("empty unit name"));
        }
        if method.is_empty() {
            return Err(malformed("empty method name"));
        }

        let descriptor =
            MethodDescriptor::parse(signature).map_err(|e| malformed(&e.to_string()))?;
        let signature = descriptor
            .map_names(&|name| name.contains('.').then(|| name.replace('.', "/")))
            .to_string();

        Ok(Self::new(unit.replace('.', "/"), method, signature))
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.unit, self.method, self.signature)
    }
}
