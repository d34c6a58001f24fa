//! Value types and their byte layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pointer width of every supported image target.
pub const POINTER_BYTES: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Type {
    Void,
    Int(u32),
    Half,
    Float,
    Double,
    Ptr,
    Vector { elem: Box<Type>, len: u32 },
    Array { elem: Box<Type>, len: u64 },
    Struct(Vec<Type>),
}

impl Type {
    #[must_use]
    pub fn i8() -> Self {
        Type::Int(8)
    }

    #[must_use]
    pub fn i32() -> Self {
        Type::Int(32)
    }

    #[must_use]
    pub fn i64() -> Self {
        Type::Int(64)
    }

    #[must_use]
    pub fn vector(elem: Type, len: u32) -> Self {
        Type::Vector {
            elem: Box::new(elem),
            len,
        }
    }

    #[must_use]
    pub fn array(elem: Type, len: u64) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len,
        }
    }

    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector { .. })
    }

    #[must_use]
    pub fn is_half(&self) -> bool {
        matches!(self, Type::Half)
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    #[must_use]
    pub fn is_floating(&self) -> bool {
        match self {
            Type::Half | Type::Float | Type::Double => true,
            Type::Vector { elem, .. } => elem.is_floating(),
            _ => false,
        }
    }

    /// Size in bytes with natural alignment between struct fields.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(bits) => u64::from(bits.div_ceil(8)),
            Type::Half => 2,
            Type::Float => 4,
            Type::Double | Type::Ptr => POINTER_BYTES,
            Type::Vector { elem, len } => elem.size() * u64::from(*len),
            Type::Array { elem, len } => elem.size() * len,
            Type::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_to(offset, field.align()) + field.size();
                }
                align_to(offset, self.align())
            }
        }
    }

    #[must_use]
    pub fn align(&self) -> u64 {
        match self {
            Type::Void => 1,
            Type::Vector { .. } => self.size().clamp(1, 64).next_power_of_two(),
            Type::Array { elem, .. } => elem.align(),
            Type::Struct(fields) => fields.iter().map(Type::align).max().unwrap_or(1),
            other => other.size().max(1).next_power_of_two(),
        }
    }

    /// Byte offset of element `index` inside an aggregate of this type.
    #[must_use]
    pub fn element_offset(&self, index: usize) -> Option<u64> {
        match self {
            Type::Array { elem, len } if (index as u64) < *len => Some(elem.size() * index as u64),
            Type::Vector { elem, len } if index < *len as usize => {
                Some(elem.size() * index as u64)
            }
            Type::Struct(fields) if index < fields.len() => {
                let mut offset = 0;
                for (position, field) in fields.iter().enumerate() {
                    offset = align_to(offset, field.align());
                    if position == index {
                        return Some(offset);
                    }
                    offset += field.size();
                }
                None
            }
            _ => None,
        }
    }
}

pub(crate) fn align_to(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Half => f.write_str("half"),
            Type::Float => f.write_str("float"),
            Type::Double => f.write_str("double"),
            Type::Ptr => f.write_str("ptr"),
            Type::Vector { elem, len } => write!(f, "<{len} x {elem}>"),
            Type::Array { elem, len } => write!(f, "[{len} x {elem}]"),
            Type::Struct(fields) => {
                f.write_str("{ ")?;
                for (index, field) in fields.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str(" }")
            }
        }
    }
}

/// Signature of a function or of an indirect call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub ret: Type,
    pub params: Vec<Type>,
    #[serde(default)]
    pub variadic: bool,
}

impl FunctionType {
    #[must_use]
    pub fn new(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret,
            params,
            variadic: false,
        }
    }

    /// `void ()`.
    #[must_use]
    pub fn void() -> Self {
        Self::new(Type::Void, Vec::new())
    }

    /// True when the return type or any parameter is a vector.
    #[must_use]
    pub fn is_vector(&self) -> bool {
        self.ret.is_vector() || self.params.iter().any(Type::is_vector)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                f.write_str(", ")?;
            }
            f.write_str("...")?;
        }
        f.write_str(")")
    }
}
