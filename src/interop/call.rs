//! Dynamic function calling through libffi call interfaces
//!
//! A `CallInterface` is prepared once per linkage request and shared by
//! every handle and stub minted from it.

use super::abi::CallingSequence;
use super::capture::{CapturedState, StateSnapshot};
use super::marshal::{self, ArgSlot, ReturnCell};
use super::types::{lower, Value};
use crate::descriptor::{FunctionDescriptor, MethodType};
use crate::error::{InvokeError, LinkError};
use crate::layout::MemoryLayout;
use crate::logging;
use crate::memory::MemorySegment;
use core::ffi::{c_uint, c_void};
use libffi::middle::Type;
use libffi::raw;
use smallvec::SmallVec;
use std::cell::Cell;

thread_local! {
    static IN_CRITICAL: Cell<bool> = Cell::new(false);
}

/// Check if the current thread is inside a critical downcall
#[inline]
pub(crate) fn in_critical() -> bool {
    IN_CRITICAL.with(Cell::get)
}

/// Prepared libffi call interface
pub(crate) struct CallInterface {
    cif: Box<raw::ffi_cif>,
    // The cif points into these; they must outlive it and never move
    arg_types: Vec<*mut raw::ffi_type>,
    _args: Vec<Type>,
    _ret: Type,
}

// Safety: the cif and the types it points to are never mutated after
// `prepare`, and libffi only reads them during calls and closure dispatch.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare a call interface
    ///
    /// With `fixed_args`, only that many leading arguments are named and the
    /// rest are passed with the platform's variadic rules.
    pub(crate) fn prepare(
        descriptor: &FunctionDescriptor,
        fixed_args: Option<usize>,
    ) -> Result<Self, LinkError> {
        let ret = match descriptor.return_layout() {
            Some(layout) => lower(layout)?,
            None => Type::void(),
        };
        let args = descriptor
            .argument_layouts()
            .iter()
            .map(lower)
            .collect::<Result<Vec<_>, _>>()?;
        let mut arg_types: Vec<*mut raw::ffi_type> = args.iter().map(Type::as_raw_ptr).collect();

        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { core::mem::zeroed() });
        let total = arg_types.len() as c_uint;
        let status = unsafe {
            match fixed_args {
                Some(fixed) => raw::ffi_prep_cif_var(
                    &mut *cif,
                    raw::ffi_abi_FFI_DEFAULT_ABI,
                    fixed as c_uint,
                    total,
                    ret.as_raw_ptr(),
                    arg_types.as_mut_ptr(),
                ),
                None => raw::ffi_prep_cif(
                    &mut *cif,
                    raw::ffi_abi_FFI_DEFAULT_ABI,
                    total,
                    ret.as_raw_ptr(),
                    arg_types.as_mut_ptr(),
                ),
            }
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(LinkError::Unsupported {
                reason: format!("ffi_prep_cif failed ({:?}) for {}", status, descriptor),
            });
        }

        // libffi sizes aggregates during preparation; they must agree with the layouts
        let layouts = descriptor
            .return_layout()
            .into_iter()
            .zip(core::iter::once(ret.as_raw_ptr()))
            .chain(descriptor.argument_layouts().iter().zip(arg_types.iter().copied()));
        for (layout, ty) in layouts {
            let native = unsafe { (*ty).size } as u64;
            if native != layout.byte_size() {
                return Err(LinkError::Unsupported {
                    reason: format!(
                        "native size of {} is {}, layout declares {}",
                        layout,
                        native,
                        layout.byte_size()
                    ),
                });
            }
        }

        Ok(Self {
            cif,
            arg_types,
            _args: args,
            _ret: ret,
        })
    }

    #[inline]
    pub(crate) fn as_raw_ptr(&self) -> *mut raw::ffi_cif {
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }

    #[inline]
    pub(crate) fn arg_count(&self) -> usize {
        self.arg_types.len()
    }
}

/// Invocable bridge produced by an ABI strategy
pub struct NativeInvoker {
    interface: CallInterface,
    descriptor: FunctionDescriptor,
    method_type: MethodType,
    sequence: CallingSequence,
    captures: Vec<CapturedState>,
    critical: bool,
}

impl NativeInvoker {
    pub(crate) fn new(
        interface: CallInterface,
        descriptor: FunctionDescriptor,
        method_type: MethodType,
        sequence: CallingSequence,
        captures: Vec<CapturedState>,
        critical: bool,
    ) -> Self {
        Self {
            interface,
            descriptor,
            method_type,
            sequence,
            captures,
            critical,
        }
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn method_type(&self) -> &MethodType {
        &self.method_type
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    pub fn captured_states(&self) -> &[CapturedState] {
        &self.captures
    }

    /// Call `target` with `args`
    ///
    /// # Safety
    /// `target` must be a native function whose signature matches the
    /// descriptor, and it must be safe to call with the given arguments.
    pub(crate) unsafe fn invoke(
        &self,
        target: usize,
        args: &[Value],
        ret_segment: Option<&MemorySegment>,
        capture: Option<&MemorySegment>,
    ) -> Result<Value, InvokeError> {
        let layouts = self.descriptor.argument_layouts();
        if args.len() != layouts.len() {
            return Err(InvokeError::ArgCountMismatch {
                expected: layouts.len(),
                got: args.len(),
            });
        }
        debug_assert_eq!(layouts.len(), self.interface.arg_count());

        let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::with_capacity(args.len());
        for (index, (layout, value)) in layouts.iter().zip(args).enumerate() {
            slots.push(marshal::encode_arg(index, layout, value)?);
        }
        // Slots are in place now; pointers into them stay valid for the call
        let mut arg_ptrs: SmallVec<[*mut c_void; 8]> =
            slots.iter_mut().map(ArgSlot::as_arg_ptr).collect();

        let mut cell = ReturnCell::new();
        let ret_ptr = match (self.descriptor.return_layout(), ret_segment) {
            (Some(layout), Some(segment)) if layout.is_group() => segment.as_ptr()? as *mut c_void,
            (Some(layout), None) if layout.is_group() => return Err(InvokeError::MissingAllocator),
            _ => cell.as_mut_ptr(),
        };

        if !self.critical {
            logging::log_native_call(target, args.len(), &self.sequence);
        }

        let fun: unsafe extern "C" fn() = core::mem::transmute(target);
        IN_CRITICAL.with(|c| c.set(self.critical));
        raw::ffi_call(
            self.interface.as_raw_ptr(),
            Some(fun),
            ret_ptr,
            arg_ptrs.as_mut_ptr(),
        );
        let snapshot = StateSnapshot::take(&self.captures);
        IN_CRITICAL.with(|c| c.set(false));

        if let Some(segment) = capture {
            snapshot.write_to(segment)?;
        }

        Ok(match self.descriptor.return_layout() {
            None => Value::Void,
            Some(MemoryLayout::Value(v)) => marshal::decode_return(v.kind(), &cell),
            Some(_) => match ret_segment {
                Some(segment) => Value::Segment(segment.clone()),
                None => return Err(InvokeError::MissingAllocator),
            },
        })
    }
}

impl std::fmt::Debug for NativeInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeInvoker")
            .field("descriptor", &self.descriptor.to_string())
            .field("sequence", &self.sequence.to_string())
            .field("captures", &self.captures)
            .field("critical", &self.critical)
            .finish()
    }
}
