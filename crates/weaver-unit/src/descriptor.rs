//! Type and method descriptors.
//!
//! Grammar: `Z` bool, `I` int, `J` long, `L<name>;` reference, `[<elem>`
//! array; method descriptors are `(<params>)<ret>` where `<ret>` may be `V`.

use anyhow::{anyhow, bail, Result};
use std::fmt;

use crate::format::VType;
use crate::insn::ValueKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Bool,
    Int,
    Long,
    Object(String),
    Array(Box<TypeDesc>),
}

impl TypeDesc {
    pub fn parse(s: &str) -> Result<TypeDesc> {
        let (ty, rest) = parse_one(s)?;
        if !rest.is_empty() {
            bail!("trailing characters in type descriptor {:?}", s);
        }
        Ok(ty)
    }

    pub fn object(name: impl Into<String>) -> TypeDesc {
        TypeDesc::Object(name.into())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            TypeDesc::Bool | TypeDesc::Int => ValueKind::Int,
            TypeDesc::Long => ValueKind::Long,
            TypeDesc::Object(_) | TypeDesc::Array(_) => ValueKind::Ref,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, TypeDesc::Array(_))
    }

    /// Verification type of a value of this type.
    pub fn vtype(&self) -> VType {
        match self {
            TypeDesc::Bool | TypeDesc::Int => VType::Int,
            TypeDesc::Long => VType::Long,
            TypeDesc::Object(name) => VType::Ref(name.clone()),
            array @ TypeDesc::Array(_) => VType::Ref(array.to_string()),
        }
    }

    /// Apply `rename` to every object name, including array elements.
    pub fn map_names(&self, rename: &impl Fn(&str) -> Option<String>) -> TypeDesc {
        match self {
            TypeDesc::Object(name) => {
                TypeDesc::Object(rename(name).unwrap_or_else(|| name.clone()))
            }
            TypeDesc::Array(elem) => TypeDesc::Array(Box::new(elem.map_names(rename))),
            other => other.clone(),
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Bool => write!(f, "Z"),
            TypeDesc::Int => write!(f, "I"),
            TypeDesc::Long => write!(f, "J"),
            TypeDesc::Object(name) => write!(f, "L{};", name),
            TypeDesc::Array(elem) => write!(f, "[{}", elem),
        }
    }
}

fn parse_one(s: &str) -> Result<(TypeDesc, &str)> {
    let mut chars = s.chars();
    let head = chars
        .next()
        .ok_or_else(|| anyhow!("empty type descriptor"))?;
    let rest = chars.as_str();
    match head {
        'Z' => Ok((TypeDesc::Bool, rest)),
        'I' => Ok((TypeDesc::Int, rest)),
        'J' => Ok((TypeDesc::Long, rest)),
        'L' => {
            let end = rest
                .find(';')
                .ok_or_else(|| anyhow!("unterminated object type in {:?}", s))?;
            let name = &rest[..end];
            if name.is_empty() {
                bail!("empty object type name in {:?}", s);
            }
            Ok((TypeDesc::Object(name.to_string()), &rest[end + 1..]))
        }
        '[' => {
            let (elem, rest) = parse_one(rest)?;
            Ok((TypeDesc::Array(Box::new(elem)), rest))
        }
        other => Err(anyhow!("unknown type code {:?} in {:?}", other, s)),
    }
}

// =============================================================================
// Method descriptors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<TypeDesc>,
    /// `None` for `V`.
    pub ret: Option<TypeDesc>,
}

impl MethodDescriptor {
    pub fn parse(s: &str) -> Result<MethodDescriptor> {
        let body = s
            .strip_prefix('(')
            .ok_or_else(|| anyhow!("method descriptor must start with '(': {:?}", s))?;
        let close = body
            .find(')')
            .ok_or_else(|| anyhow!("method descriptor missing ')': {:?}", s))?;
        let mut params_str = &body[..close];
        let ret_str = &body[close + 1..];

        let mut params = Vec::new();
        while !params_str.is_empty() {
            let (ty, rest) = parse_one(params_str)?;
            params.push(ty);
            params_str = rest;
        }

        let ret = match ret_str {
            "V" => None,
            "" => bail!("method descriptor missing return type: {:?}", s),
            other => Some(TypeDesc::parse(other)?),
        };
        Ok(MethodDescriptor { params, ret })
    }

    pub fn return_kind(&self) -> Option<ValueKind> {
        self.ret.as_ref().map(TypeDesc::kind)
    }

    pub fn map_names(&self, rename: &impl Fn(&str) -> Option<String>) -> MethodDescriptor {
        MethodDescriptor {
            params: self.params.iter().map(|p| p.map_names(rename)).collect(),
            ret: self.ret.as_ref().map(|r| r.map_names(rename)),
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p)?;
        }
        write!(f, ")")?;
        match &self.ret {
            Some(r) => write!(f, "{}", r),
            None => write!(f, "V"),
        }
    }
}
