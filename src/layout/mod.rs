//! Memory layouts - binary shape of values crossing the native boundary
//!
//! Design: Immutable tree, sizes and alignments computed at construction.
//!
//! Variants:
//! - `Value` - scalar (integers, floats, addresses)
//! - `Padding` - bytes that carry no value
//! - `Struct` - members laid out back to back
//! - `Union` - members overlapping at offset 0
//! - `Sequence` - repeated element
//!
//! Construction never checks member offsets. A struct whose members do not
//! line up is representable; rejecting it is the linker's validator's job.

use crate::error::LayoutError;
use core::fmt;


/// Size in bytes of a native address on this platform
pub const ADDRESS_SIZE: u64 = core::mem::size_of::<usize>() as u64;

/// Byte order of a scalar layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Byte order of the running platform
    #[inline]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::BigEndian
        } else {
            Self::LittleEndian
        }
    }
}

/// Scalar carried by a value layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ScalarKind {
    Bool,
    Byte,
    /// UTF-16 code unit
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Address,
}

impl ScalarKind {
    /// Size of scalar in bytes
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            Self::Bool | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Address => ADDRESS_SIZE,
        }
    }

    /// Check if scalar is floating point
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Check if scalar is integral (booleans and code units included)
    #[inline]
    pub const fn is_integral(self) -> bool {
        !self.is_float() && !matches!(self, Self::Address)
    }

    const fn descriptor_char(self) -> char {
        match self {
            Self::Bool => 'z',
            Self::Byte => 'b',
            Self::Char => 'c',
            Self::Short => 's',
            Self::Int => 'i',
            Self::Long => 'j',
            Self::Float => 'f',
            Self::Double => 'd',
            Self::Address => 'a',
        }
    }
}

/// Scalar layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueLayout {
    kind: ScalarKind,
    byte_alignment: u64,
    order: ByteOrder,
    name: Option<String>,
    target: Option<Box<MemoryLayout>>,
}

impl ValueLayout {
    pub const BOOL: Self = Self::of(ScalarKind::Bool);
    pub const BYTE: Self = Self::of(ScalarKind::Byte);
    pub const CHAR: Self = Self::of(ScalarKind::Char);
    pub const SHORT: Self = Self::of(ScalarKind::Short);
    pub const INT: Self = Self::of(ScalarKind::Int);
    pub const LONG: Self = Self::of(ScalarKind::Long);
    pub const FLOAT: Self = Self::of(ScalarKind::Float);
    pub const DOUBLE: Self = Self::of(ScalarKind::Double);
    pub const ADDRESS: Self = Self::of(ScalarKind::Address);

    /// Naturally aligned, native-order layout for a scalar
    #[inline]
    pub const fn of(kind: ScalarKind) -> Self {
        Self {
            kind,
            byte_alignment: kind.size(),
            order: ByteOrder::native(),
            name: None,
            target: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.kind.size()
    }

    #[inline]
    pub fn byte_alignment(&self) -> u64 {
        self.byte_alignment
    }

    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Pointee layout of an address layout
    pub fn target_layout(&self) -> Option<&MemoryLayout> {
        self.target.as_deref()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn without_name(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Scalars may be under-aligned (packed data); the linker rejects those later
    pub fn with_byte_alignment(mut self, alignment: u64) -> Result<Self, LayoutError> {
        check_alignment(alignment)?;
        self.byte_alignment = alignment;
        Ok(self)
    }

    pub fn with_target_layout(mut self, target: MemoryLayout) -> Result<Self, LayoutError> {
        if self.kind != ScalarKind::Address {
            return Err(LayoutError::NotAnAddress {
                layout: self.to_string(),
            });
        }
        self.target = Some(Box::new(target));
        Ok(self)
    }

    pub fn without_target_layout(mut self) -> Self {
        self.target = None;
        self
    }

    /// Rebuild the target layout through `f`, if there is one
    pub(crate) fn map_target(mut self, f: impl FnOnce(&MemoryLayout) -> MemoryLayout) -> Self {
        if let Some(target) = self.target.take() {
            self.target = Some(Box::new(f(&target)));
        }
        self
    }

    #[inline]
    pub fn has_natural_alignment(&self) -> bool {
        self.byte_alignment == self.kind.size()
    }
}

impl fmt::Display for ValueLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_natural_alignment() {
            write!(f, "{}%", self.byte_alignment)?;
        }
        let c = self.kind.descriptor_char();
        let c = match self.order {
            ByteOrder::LittleEndian => c,
            ByteOrder::BigEndian => c.to_ascii_uppercase(),
        };
        write!(f, "{}{}", c, self.byte_size())?;
        if let Some(target) = &self.target {
            write!(f, ":{}", target)?;
        }
        write_name(f, self.name.as_deref())
    }
}

/// Bytes that carry no value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaddingLayout {
    byte_size: u64,
    name: Option<String>,
}

impl PaddingLayout {
    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for PaddingLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.byte_size)?;
        write_name(f, self.name.as_deref())
    }
}

/// Members of a struct or union
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupLayout {
    members: Vec<MemoryLayout>,
    byte_size: u64,
    byte_alignment: u64,
    name: Option<String>,
}

impl GroupLayout {
    pub fn members(&self) -> &[MemoryLayout] {
        &self.members
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    #[inline]
    pub fn byte_alignment(&self) -> u64 {
        self.byte_alignment
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Maximum member alignment
    pub fn natural_alignment(&self) -> u64 {
        max_alignment(&self.members)
    }

    /// Rebuild with new members, keeping size, alignment and name
    pub(crate) fn map_members(&self, f: impl FnMut(&MemoryLayout) -> MemoryLayout) -> Self {
        Self {
            members: self.members.iter().map(f).collect(),
            byte_size: self.byte_size,
            byte_alignment: self.byte_alignment,
            name: self.name.clone(),
        }
    }
}

/// Element repeated `count` times
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceLayout {
    count: u64,
    element: Box<MemoryLayout>,
    byte_alignment: u64,
    name: Option<String>,
}

impl SequenceLayout {
    #[inline]
    pub fn element_count(&self) -> u64 {
        self.count
    }

    pub fn element_layout(&self) -> &MemoryLayout {
        &self.element
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        // Checked at construction
        self.count * self.element.byte_size()
    }

    #[inline]
    pub fn byte_alignment(&self) -> u64 {
        self.byte_alignment
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn map_element(&self, f: impl FnOnce(&MemoryLayout) -> MemoryLayout) -> Self {
        Self {
            count: self.count,
            element: Box::new(f(&self.element)),
            byte_alignment: self.byte_alignment,
            name: self.name.clone(),
        }
    }
}

/// Layout descriptor tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLayout {
    Value(ValueLayout),
    Padding(PaddingLayout),
    Struct(GroupLayout),
    Union(GroupLayout),
    Sequence(SequenceLayout),
}

impl MemoryLayout {
    /// Struct of members placed back to back
    pub fn struct_layout<I>(members: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        let members: Vec<_> = members.into_iter().collect();
        let byte_size = members.iter().try_fold(0u64, |acc, m| {
            acc.checked_add(m.byte_size())
                .ok_or(LayoutError::Overflow { what: "struct size" })
        })?;
        Ok(Self::Struct(GroupLayout {
            byte_alignment: max_alignment(&members),
            byte_size,
            members,
            name: None,
        }))
    }

    /// Union of members overlapping at offset 0
    pub fn union_layout<I>(members: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        let members: Vec<_> = members.into_iter().collect();
        let byte_size = members.iter().map(MemoryLayout::byte_size).max().unwrap_or(0);
        Ok(Self::Union(GroupLayout {
            byte_alignment: max_alignment(&members),
            byte_size,
            members,
            name: None,
        }))
    }

    pub fn sequence_layout(count: u64, element: MemoryLayout) -> Result<Self, LayoutError> {
        count
            .checked_mul(element.byte_size())
            .ok_or(LayoutError::Overflow { what: "sequence size" })?;
        Ok(Self::Sequence(SequenceLayout {
            count,
            byte_alignment: element.byte_alignment(),
            element: Box::new(element),
            name: None,
        }))
    }

    pub fn padding(byte_size: u64) -> Result<Self, LayoutError> {
        if byte_size == 0 {
            return Err(LayoutError::EmptyPadding);
        }
        Ok(Self::Padding(PaddingLayout {
            byte_size,
            name: None,
        }))
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            Self::Value(v) => v.byte_size(),
            Self::Padding(p) => p.byte_size,
            Self::Struct(g) | Self::Union(g) => g.byte_size,
            Self::Sequence(s) => s.byte_size(),
        }
    }

    pub fn byte_alignment(&self) -> u64 {
        match self {
            Self::Value(v) => v.byte_alignment,
            Self::Padding(_) => 1,
            Self::Struct(g) | Self::Union(g) => g.byte_alignment,
            Self::Sequence(s) => s.byte_alignment,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Value(v) => v.name(),
            Self::Padding(p) => p.name(),
            Self::Struct(g) | Self::Union(g) => g.name(),
            Self::Sequence(s) => s.name(),
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.set_name(Some(name.into()))
    }

    pub fn without_name(self) -> Self {
        self.set_name(None)
    }

    fn set_name(mut self, name: Option<String>) -> Self {
        match &mut self {
            Self::Value(v) => v.name = name,
            Self::Padding(p) => p.name = name,
            Self::Struct(g) | Self::Union(g) => g.name = name,
            Self::Sequence(s) => s.name = name,
        }
        self
    }

    /// Override alignment
    ///
    /// Groups and sequences cannot go below their natural alignment.
    pub fn with_byte_alignment(mut self, alignment: u64) -> Result<Self, LayoutError> {
        check_alignment(alignment)?;
        match &mut self {
            Self::Value(v) => v.byte_alignment = alignment,
            Self::Padding(_) => {
                if alignment != 1 {
                    return Err(LayoutError::AlignmentBelowNatural {
                        alignment,
                        natural: 1,
                    });
                }
            }
            Self::Struct(g) | Self::Union(g) => {
                let natural = g.natural_alignment();
                if alignment < natural {
                    return Err(LayoutError::AlignmentBelowNatural { alignment, natural });
                }
                g.byte_alignment = alignment;
            }
            Self::Sequence(s) => {
                let natural = s.element.byte_alignment();
                if alignment < natural {
                    return Err(LayoutError::AlignmentBelowNatural { alignment, natural });
                }
                s.byte_alignment = alignment;
            }
        }
        Ok(self)
    }

    /// Check if alignment is the one the layout would get with no override
    pub fn has_natural_alignment(&self) -> bool {
        match self {
            Self::Value(v) => v.has_natural_alignment(),
            Self::Padding(_) => true,
            Self::Struct(g) | Self::Union(g) => g.byte_alignment == g.natural_alignment(),
            Self::Sequence(s) => s.byte_alignment == s.element.byte_alignment(),
        }
    }

    #[inline]
    pub fn is_padding(&self) -> bool {
        matches!(self, Self::Padding(_))
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        matches!(self, Self::Struct(_) | Self::Union(_))
    }

    pub fn as_value(&self) -> Option<&ValueLayout> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ValueLayout> for MemoryLayout {
    #[inline]
    fn from(value: ValueLayout) -> Self {
        Self::Value(value)
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => v.fmt(f),
            Self::Padding(p) => p.fmt(f),
            Self::Struct(g) => write_group(f, g, ""),
            Self::Union(g) => write_group(f, g, "|"),
            Self::Sequence(s) => {
                if !self.has_natural_alignment() {
                    write!(f, "{}%", s.byte_alignment)?;
                }
                write!(f, "[{}:{}]", s.count, s.element)?;
                write_name(f, s.name.as_deref())
            }
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, group: &GroupLayout, separator: &str) -> fmt::Result {
    if group.byte_alignment != group.natural_alignment() {
        write!(f, "{}%", group.byte_alignment)?;
    }
    f.write_str("[")?;
    for (i, member) in group.members.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{}", member)?;
    }
    f.write_str("]")?;
    write_name(f, group.name.as_deref())
}

fn write_name(f: &mut fmt::Formatter<'_>, name: Option<&str>) -> fmt::Result {
    match name {
        Some(name) => write!(f, "({})", name),
        None => Ok(()),
    }
}

fn max_alignment(members: &[MemoryLayout]) -> u64 {
    members
        .iter()
        .map(MemoryLayout::byte_alignment)
        .max()
        .unwrap_or(1)
}

fn check_alignment(alignment: u64) -> Result<(), LayoutError> {
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(LayoutError::InvalidAlignment { alignment })
    }
}

/// Round `offset` up to a multiple of `alignment` (a power of two)
#[inline]
pub const fn align_up(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}
