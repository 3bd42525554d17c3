//! Type definitions for FFI interoperability
//!
//! `Value` is the managed side of a native argument or return value;
//! `lower` turns a layout into the libffi type that describes it natively.

use crate::descriptor::Carrier;
use crate::error::LinkError;
use crate::layout::{MemoryLayout, ScalarKind};
use crate::memory::MemorySegment;
use libffi::middle::Type;

/// Managed value crossing the native boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Byte(i8),
    /// UTF-16 code unit
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Address(usize),
    /// Struct or union by value, or an address with a known extent
    Segment(MemorySegment),
}

impl Value {
    /// Carrier of the value; `None` for `Void`
    pub fn carrier(&self) -> Option<Carrier> {
        Some(match self {
            Self::Void => return None,
            Self::Bool(_) => Carrier::Bool,
            Self::Byte(_) => Carrier::Byte,
            Self::Char(_) => Carrier::Char,
            Self::Short(_) => Carrier::Short,
            Self::Int(_) => Carrier::Int,
            Self::Long(_) => Carrier::Long,
            Self::Float(_) => Carrier::Float,
            Self::Double(_) => Carrier::Double,
            Self::Address(_) => Carrier::Address,
            Self::Segment(_) => Carrier::Segment,
        })
    }

    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        self.carrier().map_or("void", Carrier::name)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Address of an `Address` or `Segment` value
    pub fn as_address(&self) -> Option<usize> {
        match self {
            Self::Address(a) => Some(*a),
            Self::Segment(s) => Some(s.address()),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&MemorySegment> {
        match self {
            Self::Segment(s) => Some(s),
            _ => None,
        }
    }
}

/// libffi type of a scalar
pub(crate) fn scalar_type(kind: ScalarKind) -> Type {
    match kind {
        ScalarKind::Bool => Type::u8(),
        ScalarKind::Byte => Type::i8(),
        ScalarKind::Char => Type::u16(),
        ScalarKind::Short => Type::i16(),
        ScalarKind::Int => Type::i32(),
        ScalarKind::Long => Type::i64(),
        ScalarKind::Float => Type::f32(),
        ScalarKind::Double => Type::f64(),
        ScalarKind::Address => Type::pointer(),
    }
}

/// libffi type of a validated layout
///
/// Padding becomes runs of `u8`. A union is represented by its most
/// strictly aligned member, topped up with bytes to the union's size.
pub(crate) fn lower(layout: &MemoryLayout) -> Result<Type, LinkError> {
    match layout {
        MemoryLayout::Value(v) => Ok(scalar_type(v.kind())),
        MemoryLayout::Padding(p) => Ok(byte_run(p.byte_size())),
        MemoryLayout::Struct(g) => {
            let mut fields = Vec::with_capacity(g.members().len());
            for member in g.members() {
                match member {
                    MemoryLayout::Padding(p) => {
                        fields.extend((0..p.byte_size()).map(|_| Type::u8()));
                    }
                    other => fields.push(lower(other)?),
                }
            }
            non_empty(layout, fields)
        }
        MemoryLayout::Union(g) => {
            let representative = g
                .members()
                .iter()
                .filter(|m| !m.is_padding())
                .max_by_key(|m| (m.byte_alignment(), m.byte_size()));
            let Some(representative) = representative else {
                return Err(empty_group(layout));
            };
            let mut fields = vec![lower(representative)?];
            let tail = g.byte_size() - representative.byte_size();
            fields.extend((0..tail).map(|_| Type::u8()));
            non_empty(layout, fields)
        }
        MemoryLayout::Sequence(s) => {
            let element = lower(s.element_layout())?;
            let fields: Vec<_> = (0..s.element_count()).map(|_| element.clone()).collect();
            non_empty(layout, fields)
        }
    }
}

fn byte_run(count: u64) -> Type {
    Type::structure((0..count).map(|_| Type::u8()).collect::<Vec<_>>())
}

fn non_empty(layout: &MemoryLayout, fields: Vec<Type>) -> Result<Type, LinkError> {
    if fields.is_empty() {
        return Err(empty_group(layout));
    }
    Ok(Type::structure(fields))
}

fn empty_group(layout: &MemoryLayout) -> LinkError {
    LinkError::Unsupported {
        reason: format!("zero-sized aggregate {} cannot be passed by value", layout),
    }
}
