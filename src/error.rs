//! Error taxonomy for linkage requests
//!
//! Every failure is reported synchronously to the immediate caller and is
//! never retried internally. Layout problems carry the rendered layouts
//! involved so a report can be diagnosed without re-running the request.

use core::fmt;

/// Failure while constructing a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Size or element-count arithmetic overflowed
    Overflow { what: &'static str },
    /// Alignment must be a non-zero power of two
    InvalidAlignment { alignment: u64 },
    /// Group alignment below the maximum member alignment
    AlignmentBelowNatural { alignment: u64, natural: u64 },
    /// Padding layouts need a positive size
    EmptyPadding,
    /// Target layouts only decorate address layouts
    NotAnAddress { layout: String },
    /// Padding cannot be an argument or return layout
    PaddingInSignature { layout: String },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { what } => write!(f, "Layout {} overflows", what),
            Self::InvalidAlignment { alignment } => {
                write!(f, "Invalid alignment: {} is not a power of two", alignment)
            }
            Self::AlignmentBelowNatural { alignment, natural } => write!(
                f,
                "Invalid alignment constraint: {} is below the natural alignment {}",
                alignment, natural
            ),
            Self::EmptyPadding => write!(f, "Padding layout must have a positive size"),
            Self::NotAnAddress { layout } => {
                write!(f, "Layout '{}' is not an address layout", layout)
            }
            Self::PaddingInSignature { layout } => {
                write!(f, "Unsupported padding layout in function descriptor: {}", layout)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// Structural defect found by the layout validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutViolation {
    /// Scalar shape outside the platform's canonical layouts
    Unsupported { layout: String },
    /// A raw sequence cannot be an argument or return value
    TopLevelSequence { layout: String },
    /// Alignment differs from the layout's natural alignment
    UnnaturalAlignment { layout: String },
    /// Struct member not at the alignment-rounded end of its predecessor
    UnexpectedOffset {
        parent: String,
        member: String,
        index: usize,
        found: u64,
        expected: u64,
    },
    /// Two padding layouts in a row
    ConsecutivePadding {
        parent: String,
        padding: String,
        preceding: String,
    },
    /// Non-empty struct made only of padding
    OnlyPadding { layout: String },
    /// Group size disagrees with its aligned contents
    UnexpectedSize { layout: String, found: u64, expected: u64 },
    /// More than one padding member in a union
    MultiplePadding { parent: String },
    /// Union padding not larger than every other member
    SuperfluousPadding { parent: String, padding: String },
    /// Sequence whose element is padding
    PaddingSequence { parent: String, element: String },
    /// Platform-specific struct member rule
    StructMember {
        member: String,
        offset: u64,
        reason: &'static str,
    },
}

impl fmt::Display for LayoutViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { layout } => write!(f, "Unsupported layout: {}", layout),
            Self::TopLevelSequence { layout } => {
                write!(f, "Unsupported layout: {} (sequence as argument or return)", layout)
            }
            Self::UnnaturalAlignment { layout } => {
                write!(f, "Layout alignment must be natural alignment: {}", layout)
            }
            Self::UnexpectedOffset {
                parent,
                member,
                index,
                found,
                expected,
            } => write!(
                f,
                "Member layout '{}' (#{}), of '{}' found at unexpected offset: {} != {}",
                member, index, parent, found, expected
            ),
            Self::ConsecutivePadding {
                parent,
                padding,
                preceding,
            } => write!(
                f,
                "The padding layout {} was preceded by another padding layout {} in {}",
                padding, preceding, parent
            ),
            Self::OnlyPadding { layout } => {
                write!(f, "Layout '{}' is non-empty and only has padding layouts", layout)
            }
            Self::UnexpectedSize {
                layout,
                found,
                expected,
            } => write!(
                f,
                "Layout '{}' has unexpected size: {} != {}",
                layout, found, expected
            ),
            Self::MultiplePadding { parent } => write!(f, "More than one padding in {}", parent),
            Self::SuperfluousPadding { parent, padding } => {
                write!(f, "Superfluous padding {} in {}", padding, parent)
            }
            Self::PaddingSequence { parent, element } => write!(
                f,
                "Member layout '{}', of '{}' not supported because a sequence of a padding layout is not allowed",
                element, parent
            ),
            Self::StructMember {
                member,
                offset,
                reason,
            } => write!(f, "Struct member {} at offset {} {}", member, offset, reason),
        }
    }
}

impl std::error::Error for LayoutViolation {}

/// Failure touching native memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The owning scope has ended
    ScopeClosed,
    /// Access from a thread other than a confined scope's owner
    WrongThread,
    /// Access outside the segment bounds
    OutOfBounds { offset: u64, length: u64, size: u64 },
    /// The allocator returned no memory
    AllocationFailed { size: u64, alignment: u64 },
    /// `close` called on a scope that already ended
    AlreadyClosed,
    /// The global scope cannot be closed
    NotCloseable,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeClosed => write!(f, "Already closed"),
            Self::WrongThread => write!(f, "Attempted access outside owning thread"),
            Self::OutOfBounds {
                offset,
                length,
                size,
            } => write!(
                f,
                "Out of bound access on segment of size {}: offset {} length {}",
                size, offset, length
            ),
            Self::AllocationFailed { size, alignment } => write!(
                f,
                "Failed to allocate {} bytes aligned to {}",
                size, alignment
            ),
            Self::AlreadyClosed => write!(f, "Scope already closed"),
            Self::NotCloseable => write!(f, "The global arena cannot be closed"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Failure while invoking a downcall handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    ArgCountMismatch { expected: usize, got: usize },
    ArgumentType {
        index: usize,
        expected: String,
        found: String,
    },
    /// Segment argument smaller than its layout
    SegmentTooSmall { index: usize, size: u64, required: u64 },
    /// Unbound handle called without a usable target address
    NullTarget,
    /// Group return without a segment allocator
    MissingAllocator,
    /// Capturing handle called without a capture segment
    MissingCaptureState,
    /// Capture segment too small or misaligned
    InvalidCaptureState { reason: String },
    Memory(MemoryError),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArgCountMismatch { expected, got } => {
                write!(f, "Expected {} arguments, got {}", expected, got)
            }
            Self::ArgumentType {
                index,
                expected,
                found,
            } => write!(
                f,
                "Argument {} has wrong type: expected {}, found {}",
                index, expected, found
            ),
            Self::SegmentTooSmall {
                index,
                size,
                required,
            } => write!(
                f,
                "Segment argument {} has size {}, layout requires {}",
                index, size, required
            ),
            Self::NullTarget => write!(f, "Symbol is NULL"),
            Self::MissingAllocator => {
                write!(f, "Handle returns a struct by value and needs a segment allocator")
            }
            Self::MissingCaptureState => {
                write!(f, "Handle captures call state and needs a capture segment")
            }
            Self::InvalidCaptureState { reason } => write!(f, "Invalid capture segment: {}", reason),
            Self::Memory(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for InvokeError {}

impl From<MemoryError> for InvokeError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

/// Failure of a linkage request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Caller is not allowed to link native code at all
    NativeAccessDenied {
        caller: String,
        operation: &'static str,
    },
    /// A required input was null (C API)
    NullInput { what: &'static str },
    InvalidLayout(LayoutViolation),
    Layout(LayoutError),
    UnsupportedVariadicArgument { index: usize, layout: String },
    InvalidOption { reason: String },
    /// Upcall target shape differs from the descriptor
    SignatureMismatch { expected: String, found: String },
    /// Upcall target can fail, and failures cannot cross native frames
    TargetMayFail { method_type: String },
    /// The native backend refused the signature
    Unsupported { reason: String },
    Invocation(InvokeError),
    Memory(MemoryError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeAccessDenied { caller, operation } => write!(
                f,
                "Illegal native access: {} called from {}",
                operation, caller
            ),
            Self::NullInput { what } => write!(f, "Null input: {}", what),
            Self::InvalidLayout(violation) => write!(f, "{}", violation),
            Self::Layout(err) => write!(f, "{}", err),
            Self::UnsupportedVariadicArgument { index, layout } => write!(
                f,
                "Invalid variadic argument layout: {} at index {}",
                layout, index
            ),
            Self::InvalidOption { reason } => write!(f, "Invalid linker option: {}", reason),
            Self::SignatureMismatch { expected, found } => write!(
                f,
                "Wrong target type: expected {}, found {}",
                expected, found
            ),
            Self::TargetMayFail { method_type } => write!(
                f,
                "Target {} may return an error, which cannot cross native frames",
                method_type
            ),
            Self::Unsupported { reason } => write!(f, "Unsupported by native backend: {}", reason),
            Self::Invocation(err) => write!(f, "{}", err),
            Self::Memory(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidLayout(err) => Some(err),
            Self::Layout(err) => Some(err),
            Self::Invocation(err) => Some(err),
            Self::Memory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LayoutViolation> for LinkError {
    fn from(err: LayoutViolation) -> Self {
        Self::InvalidLayout(err)
    }
}

impl From<LayoutError> for LinkError {
    fn from(err: LayoutError) -> Self {
        Self::Layout(err)
    }
}

impl From<InvokeError> for LinkError {
    fn from(err: InvokeError) -> Self {
        Self::Invocation(err)
    }
}

impl From<MemoryError> for LinkError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}
