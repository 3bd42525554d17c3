//! Function descriptors - argument and return layouts of a native function
//!
//! A descriptor also determines the managed calling shape (`MethodType`)
//! that downcall handles accept and upcall targets must expose.

use crate::error::LayoutError;
use crate::layout::{MemoryLayout, ScalarKind};
use core::fmt;

/// Managed representation of one argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Address,
    /// Struct or union passed by value, held in a memory segment
    Segment,
}

impl Carrier {
    /// Carrier for a layout; padding has none
    pub fn of(layout: &MemoryLayout) -> Option<Self> {
        match layout {
            MemoryLayout::Value(v) => Some(v.kind().into()),
            MemoryLayout::Struct(_) | MemoryLayout::Union(_) | MemoryLayout::Sequence(_) => {
                Some(Self::Segment)
            }
            MemoryLayout::Padding(_) => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Address => "address",
            Self::Segment => "segment",
        }
    }
}

impl From<ScalarKind> for Carrier {
    fn from(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Self::Bool,
            ScalarKind::Byte => Self::Byte,
            ScalarKind::Char => Self::Char,
            ScalarKind::Short => Self::Short,
            ScalarKind::Int => Self::Int,
            ScalarKind::Long => Self::Long,
            ScalarKind::Float => Self::Float,
            ScalarKind::Double => Self::Double,
            ScalarKind::Address => Self::Address,
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Managed calling shape: parameter carriers and optional return carrier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodType {
    params: Vec<Carrier>,
    ret: Option<Carrier>,
}

impl MethodType {
    pub fn new(params: impl Into<Vec<Carrier>>, ret: Option<Carrier>) -> Self {
        Self {
            params: params.into(),
            ret,
        }
    }

    pub fn params(&self) -> &[Carrier] {
        &self.params
    }

    pub fn return_carrier(&self) -> Option<Carrier> {
        self.ret
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", p)?;
        }
        match self.ret {
            Some(ret) => write!(f, "){}", ret),
            None => f.write_str(")void"),
        }
    }
}

/// Signature of a native function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionDescriptor {
    ret: Option<MemoryLayout>,
    args: Vec<MemoryLayout>,
}

impl FunctionDescriptor {
    /// Descriptor with a return value
    pub fn of<I>(ret: MemoryLayout, args: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        check_not_padding(&ret)?;
        Self::build(Some(ret), args)
    }

    /// Descriptor with no return value
    pub fn of_void<I>(args: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        Self::build(None, args)
    }

    fn build<I>(ret: Option<MemoryLayout>, args: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        let args: Vec<_> = args.into_iter().collect();
        args.iter().try_for_each(check_not_padding)?;
        Ok(Self { ret, args })
    }

    pub fn return_layout(&self) -> Option<&MemoryLayout> {
        self.ret.as_ref()
    }

    pub fn argument_layouts(&self) -> &[MemoryLayout] {
        &self.args
    }

    pub fn append_argument_layouts<I>(&self, extra: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = MemoryLayout>,
    {
        let args = self.args.iter().cloned().chain(extra);
        Self::build(self.ret.clone(), args)
    }

    pub fn change_return_layout(&self, ret: MemoryLayout) -> Result<Self, LayoutError> {
        Self::of(ret, self.args.iter().cloned())
    }

    pub fn drop_return_layout(&self) -> Self {
        Self {
            ret: None,
            args: self.args.clone(),
        }
    }

    /// Rebuild every layout through `f`
    pub(crate) fn map_layouts(&self, mut f: impl FnMut(&MemoryLayout) -> MemoryLayout) -> Self {
        Self {
            ret: self.ret.as_ref().map(&mut f),
            args: self.args.iter().map(f).collect(),
        }
    }

    /// Calling shape inferred from the layouts
    pub fn to_method_type(&self) -> MethodType {
        MethodType {
            params: self.args.iter().filter_map(Carrier::of).collect(),
            ret: self.ret.as_ref().and_then(Carrier::of),
        }
    }

    /// Check if the return value needs caller-provided storage
    pub fn returns_group(&self) -> bool {
        self.ret.as_ref().map_or(false, MemoryLayout::is_group)
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for arg in &self.args {
            write!(f, "{}", arg)?;
        }
        f.write_str(")")?;
        match &self.ret {
            Some(ret) => write!(f, "{}", ret),
            None => f.write_str("v"),
        }
    }
}

fn check_not_padding(layout: &MemoryLayout) -> Result<(), LayoutError> {
    if layout.is_padding() {
        Err(LayoutError::PaddingInSignature {
            layout: layout.to_string(),
        })
    } else {
        Ok(())
    }
}
