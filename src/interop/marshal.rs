//! Type marshaling - managed values ↔ native argument storage
//!
//! Design: Scalars go through one 8-byte word each; aggregates are passed
//! as pointers into the caller's segment and libffi copies them by value.
//! Narrow integer returns travel through a register-wide cell.

use super::types::Value;
use crate::error::{InvokeError, MemoryError};
use crate::layout::{MemoryLayout, ScalarKind};
use crate::memory::{MemorySegment, SegmentAllocator};
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr;

/// Native storage for one argument
pub(crate) enum ArgSlot {
    /// Scalar stored at the start of a word
    Word(u64),
    /// Aggregate bytes owned by a live segment
    Memory(*mut u8),
}

impl ArgSlot {
    /// Pointer libffi reads the argument from
    #[inline]
    pub(crate) fn as_arg_ptr(&mut self) -> *mut c_void {
        match self {
            Self::Word(w) => w as *mut u64 as *mut c_void,
            Self::Memory(p) => *p as *mut c_void,
        }
    }
}

/// Word whose leading bytes hold `value` in native representation
#[inline]
fn word_of<T: Copy>(value: T) -> u64 {
    debug_assert!(size_of::<T>() <= size_of::<u64>());
    let mut word = 0u64;
    unsafe { ptr::write_unaligned(&mut word as *mut u64 as *mut T, value) };
    word
}

fn mismatch(index: usize, layout: &MemoryLayout, value: &Value) -> InvokeError {
    InvokeError::ArgumentType {
        index,
        expected: layout.to_string(),
        found: value.type_name().to_string(),
    }
}

/// Marshal one managed argument for a native call
pub(crate) fn encode_arg(
    index: usize,
    layout: &MemoryLayout,
    value: &Value,
) -> Result<ArgSlot, InvokeError> {
    let slot = match (layout, value) {
        (MemoryLayout::Value(v), value) => ArgSlot::Word(match (v.kind(), value) {
            (ScalarKind::Bool, Value::Bool(b)) => word_of(*b as u8),
            (ScalarKind::Byte, Value::Byte(x)) => word_of(*x),
            (ScalarKind::Char, Value::Char(x)) => word_of(*x),
            (ScalarKind::Short, Value::Short(x)) => word_of(*x),
            (ScalarKind::Int, Value::Int(x)) => word_of(*x),
            (ScalarKind::Long, Value::Long(x)) => word_of(*x),
            (ScalarKind::Float, Value::Float(x)) => word_of(*x),
            (ScalarKind::Double, Value::Double(x)) => word_of(*x),
            (ScalarKind::Address, Value::Address(a)) => word_of(*a),
            (ScalarKind::Address, Value::Segment(s)) => {
                if !s.is_alive() {
                    return Err(MemoryError::ScopeClosed.into());
                }
                word_of(s.address())
            }
            _ => return Err(mismatch(index, layout, value)),
        }),
        (group, Value::Segment(segment)) if !group.is_padding() => {
            let required = group.byte_size();
            if segment.byte_size() < required {
                return Err(InvokeError::SegmentTooSmall {
                    index,
                    size: segment.byte_size(),
                    required,
                });
            }
            ArgSlot::Memory(segment.as_ptr()?)
        }
        _ => return Err(mismatch(index, layout, value)),
    };
    Ok(slot)
}

/// Return cell, large and aligned enough for any scalar return
#[repr(C, align(16))]
pub(crate) struct ReturnCell([u8; 16]);

impl ReturnCell {
    #[inline]
    pub(crate) fn new() -> Self {
        Self([0; 16])
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.0.as_mut_ptr() as *mut c_void
    }

    #[inline]
    fn read<T: Copy>(&self) -> T {
        unsafe { ptr::read(self.0.as_ptr() as *const T) }
    }
}

/// Integral returns narrower than a register are widened by the callee
#[inline]
fn is_widened(kind: ScalarKind) -> bool {
    kind.is_integral() && kind.size() < size_of::<usize>() as u64
}

/// Read a scalar return value out of the return cell
pub(crate) fn decode_return(kind: ScalarKind, cell: &ReturnCell) -> Value {
    if is_widened(kind) {
        let wide: usize = cell.read();
        return match kind {
            ScalarKind::Bool => Value::Bool(wide as u8 != 0),
            ScalarKind::Byte => Value::Byte(wide as i8),
            ScalarKind::Char => Value::Char(wide as u16),
            ScalarKind::Short => Value::Short(wide as i16),
            ScalarKind::Int => Value::Int(wide as i32),
            _ => Value::Long(wide as i64),
        };
    }
    match kind {
        ScalarKind::Bool => Value::Bool(cell.read::<u8>() != 0),
        ScalarKind::Byte => Value::Byte(cell.read()),
        ScalarKind::Char => Value::Char(cell.read()),
        ScalarKind::Short => Value::Short(cell.read()),
        ScalarKind::Int => Value::Int(cell.read()),
        ScalarKind::Long => Value::Long(cell.read()),
        ScalarKind::Float => Value::Float(cell.read()),
        ScalarKind::Double => Value::Double(cell.read()),
        ScalarKind::Address => Value::Address(cell.read()),
    }
}

/// Read an upcall argument that libffi handed over as a pointer
///
/// # Safety
/// `arg` must point to a value of `layout`'s native type.
pub(crate) unsafe fn decode_arg(
    layout: &MemoryLayout,
    arg: *const c_void,
    scratch: &dyn SegmentAllocator,
) -> Result<Value, InvokeError> {
    let value = match layout {
        MemoryLayout::Value(v) => match v.kind() {
            ScalarKind::Bool => Value::Bool(ptr::read_unaligned(arg as *const u8) != 0),
            ScalarKind::Byte => Value::Byte(ptr::read_unaligned(arg as *const i8)),
            ScalarKind::Char => Value::Char(ptr::read_unaligned(arg as *const u16)),
            ScalarKind::Short => Value::Short(ptr::read_unaligned(arg as *const i16)),
            ScalarKind::Int => Value::Int(ptr::read_unaligned(arg as *const i32)),
            ScalarKind::Long => Value::Long(ptr::read_unaligned(arg as *const i64)),
            ScalarKind::Float => Value::Float(ptr::read_unaligned(arg as *const f32)),
            ScalarKind::Double => Value::Double(ptr::read_unaligned(arg as *const f64)),
            ScalarKind::Address => Value::Address(ptr::read_unaligned(arg as *const usize)),
        },
        group => {
            // Native frame owns the bytes; the target gets its own copy
            let copy = scratch.allocate_layout(group)?;
            {
                let (_lease, to) = copy.leased(0, group.byte_size())?;
                ptr::copy_nonoverlapping(arg as *const u8, to, group.byte_size() as usize);
            }
            Value::Segment(copy)
        }
    };
    Ok(value)
}

/// Write an upcall's result where libffi expects it
///
/// # Safety
/// `ret` must be libffi's return buffer for a function returning `layout`.
pub(crate) unsafe fn encode_return(
    layout: &MemoryLayout,
    value: &Value,
    ret: *mut c_void,
) -> Result<(), InvokeError> {
    let bad = || InvokeError::ArgumentType {
        index: usize::MAX,
        expected: layout.to_string(),
        found: value.type_name().to_string(),
    };
    match layout {
        MemoryLayout::Value(v) if is_widened(v.kind()) => {
            let wide = match (v.kind(), value) {
                (ScalarKind::Bool, Value::Bool(b)) => *b as usize,
                (ScalarKind::Byte, Value::Byte(x)) => *x as isize as usize,
                (ScalarKind::Char, Value::Char(x)) => *x as usize,
                (ScalarKind::Short, Value::Short(x)) => *x as isize as usize,
                (ScalarKind::Int, Value::Int(x)) => *x as isize as usize,
                _ => return Err(bad()),
            };
            ptr::write_unaligned(ret as *mut usize, wide);
        }
        MemoryLayout::Value(v) => match (v.kind(), value) {
            (ScalarKind::Int, Value::Int(x)) => ptr::write_unaligned(ret as *mut i32, *x),
            (ScalarKind::Long, Value::Long(x)) => ptr::write_unaligned(ret as *mut i64, *x),
            (ScalarKind::Float, Value::Float(x)) => ptr::write_unaligned(ret as *mut f32, *x),
            (ScalarKind::Double, Value::Double(x)) => ptr::write_unaligned(ret as *mut f64, *x),
            (ScalarKind::Address, Value::Address(a)) => ptr::write_unaligned(ret as *mut usize, *a),
            (ScalarKind::Address, Value::Segment(s)) => {
                ptr::write_unaligned(ret as *mut usize, s.address())
            }
            _ => return Err(bad()),
        },
        group => {
            let Value::Segment(segment) = value else {
                return Err(bad());
            };
            let size = group.byte_size();
            if segment.byte_size() < size {
                return Err(InvokeError::SegmentTooSmall {
                    index: usize::MAX,
                    size: segment.byte_size(),
                    required: size,
                });
            }
            let (_lease, from) = segment.leased(0, size)?;
            ptr::copy_nonoverlapping(from as *const u8, ret as *mut u8, size as usize);
        }
    }
    Ok(())
}

/// Materialize a by-value struct return in caller-provided storage
pub(crate) fn group_return_storage(
    layout: &MemoryLayout,
    allocator: &dyn SegmentAllocator,
) -> Result<MemorySegment, InvokeError> {
    Ok(allocator.allocate_layout(layout)?)
}
