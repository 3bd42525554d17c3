//! C FFI - Public C API for the linker
//!
//! Design: Opaque pointers in, `LinkStatus` codes out.
//! 1. A null linker pointer means the process-wide native linker
//! 2. The native access check runs first, then null-input checks
//! 3. Failure details are kept per thread for `typthon_link_last_error`
//! 4. Panics never cross the boundary
//!
//! Layouts, descriptors, options and arenas are built here too and handed
//! out as boxed opaque pointers, each with its own `_free`. Arguments and
//! results travel the way libffi passes them: one pointer per value.

use crate::descriptor::FunctionDescriptor;
use crate::error::{InvokeError, LinkError, MemoryError};
use crate::interop::marshal::{self, ArgSlot, ReturnCell};
use crate::interop::{UpcallStubFactory, UpcallTarget, Value};
use crate::layout::{MemoryLayout, ValueLayout};
use crate::linker::{native_linker, CallContext, DowncallHandle, LinkOption, Linker};
use crate::memory::{Arena, MemorySegment, SegmentAllocator};
use core::ffi::{c_char, c_void};
use core::ptr;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;

/// Result code of every C entry point
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Ok = 0,
    NullInput = 1,
    AccessDenied = 2,
    InvalidLayout = 3,
    UnsupportedVariadicArgument = 4,
    InvalidOption = 5,
    SignatureMismatch = 6,
    Unsupported = 7,
    Invocation = 8,
    Memory = 9,
    Panic = 10,
}

impl From<&LinkError> for LinkStatus {
    fn from(err: &LinkError) -> Self {
        match err {
            LinkError::NativeAccessDenied { .. } => Self::AccessDenied,
            LinkError::NullInput { .. } => Self::NullInput,
            LinkError::InvalidLayout(_) | LinkError::Layout(_) => Self::InvalidLayout,
            LinkError::UnsupportedVariadicArgument { .. } => Self::UnsupportedVariadicArgument,
            LinkError::InvalidOption { .. } => Self::InvalidOption,
            LinkError::SignatureMismatch { .. } | LinkError::TargetMayFail { .. } => {
                Self::SignatureMismatch
            }
            LinkError::Unsupported { .. } => Self::Unsupported,
            LinkError::Invocation(_) => Self::Invocation,
            LinkError::Memory(_) => Self::Memory,
        }
    }
}

/// Native upcall target
///
/// `args` holds one pointer per argument; `ret` points to storage for the
/// result and is null for a void upcall.
pub type UpcallCallback =
    unsafe extern "C" fn(args: *const *mut c_void, ret: *mut c_void, user_data: *mut c_void);

thread_local! {
    static LAST_ERROR: RefCell<Option<(LinkStatus, String)>> = RefCell::new(None);

    /// Backs the latest struct result of a C upcall on this thread
    static UPCALL_RETURNS: RefCell<Option<Arena>> = RefCell::new(None);
}

fn report(result: std::thread::Result<Result<(), LinkError>>) -> i32 {
    let (status, message) = match result {
        Ok(Ok(())) => {
            LAST_ERROR.with(|e| e.borrow_mut().take());
            return LinkStatus::Ok as i32;
        }
        Ok(Err(err)) => (LinkStatus::from(&err), err.to_string()),
        Err(_) => (LinkStatus::Panic, "panic in linker".to_string()),
    };
    LAST_ERROR.with(|e| *e.borrow_mut() = Some((status, message)));
    status as i32
}

/// Run `make` and box its result into `out`
unsafe fn build<T>(out: *mut *mut T, make: impl FnOnce() -> Result<T, LinkError>) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        if out.is_null() {
            return Err(LinkError::NullInput { what: "out" });
        }
        *out = Box::into_raw(Box::new(make()?));
        Ok(())
    })))
}

unsafe fn free_boxed<T>(item: *mut T) {
    if !item.is_null() {
        drop(Box::from_raw(item));
    }
}

/// Resolve a caller's linker pointer
///
/// # Safety
/// A non-null `linker` must come from this library and still be alive.
unsafe fn linker_ref<'a>(linker: *const Linker) -> &'a Linker {
    if linker.is_null() {
        native_linker()
    } else {
        &*linker
    }
}

/// Copies of the items of a C pointer array; null is only valid with a zero count
unsafe fn cloned_array<T: Clone>(
    items: *const *const T,
    count: usize,
    what: &'static str,
) -> Result<Vec<T>, LinkError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if items.is_null() {
        return Err(LinkError::NullInput { what });
    }
    core::slice::from_raw_parts(items, count)
        .iter()
        .map(|item| item.as_ref().cloned().ok_or(LinkError::NullInput { what }))
        .collect()
}

/// Process-wide native linker
#[no_mangle]
pub extern "C" fn typthon_link_native_linker() -> *const Linker {
    native_linker() as *const Linker
}

// ---------------------------------------------------------------------------
// Layouts and descriptors
// ---------------------------------------------------------------------------

/// Canonical layout of a C type name such as `"int"` or `"size_t"`
///
/// # Safety
/// `name` must be a NUL-terminated string; `out` receives a layout released
/// with `typthon_link_layout_free`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_canonical(
    linker: *const Linker,
    name: *const c_char,
    out: *mut *mut MemoryLayout,
) -> i32 {
    build(out, || {
        if name.is_null() {
            return Err(LinkError::NullInput { what: "name" });
        }
        let name = CStr::from_ptr(name).to_string_lossy();
        linker_ref(linker)
            .canonical_layouts()
            .get(&name)
            .cloned()
            .map(MemoryLayout::from)
            .ok_or_else(|| LinkError::Unsupported {
                reason: format!("no canonical layout for '{}'", name),
            })
    })
}

/// # Safety
/// `out` receives a layout released with `typthon_link_layout_free`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_padding(
    byte_size: u64,
    out: *mut *mut MemoryLayout,
) -> i32 {
    build(out, || Ok(MemoryLayout::padding(byte_size)?))
}

/// Struct of `members` in order; padding must be spelled out
///
/// # Safety
/// `members` must hold `count` layout pointers from this library.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_struct(
    members: *const *const MemoryLayout,
    count: usize,
    out: *mut *mut MemoryLayout,
) -> i32 {
    build(out, || {
        Ok(MemoryLayout::struct_layout(cloned_array(members, count, "members")?)?)
    })
}

/// # Safety
/// `members` must hold `count` layout pointers from this library.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_union(
    members: *const *const MemoryLayout,
    count: usize,
    out: *mut *mut MemoryLayout,
) -> i32 {
    build(out, || {
        Ok(MemoryLayout::union_layout(cloned_array(members, count, "members")?)?)
    })
}

/// # Safety
/// `element` must be a layout from this library.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_sequence(
    element_count: u64,
    element: *const MemoryLayout,
    out: *mut *mut MemoryLayout,
) -> i32 {
    build(out, || {
        let element = element
            .as_ref()
            .ok_or(LinkError::NullInput { what: "element" })?;
        Ok(MemoryLayout::sequence_layout(element_count, element.clone())?)
    })
}

/// # Safety
/// `layout` must come from a layout constructor and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_layout_free(layout: *mut MemoryLayout) {
    free_boxed(layout)
}

/// Descriptor with a null `ret` for a void function
///
/// # Safety
/// `args` must hold `count` layout pointers from this library; `out`
/// receives a descriptor released with `typthon_link_descriptor_free`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_descriptor_new(
    ret: *const MemoryLayout,
    args: *const *const MemoryLayout,
    count: usize,
    out: *mut *mut FunctionDescriptor,
) -> i32 {
    build(out, || {
        let args = cloned_array(args, count, "args")?;
        Ok(match ret.as_ref() {
            Some(ret) => FunctionDescriptor::of(ret.clone(), args)?,
            None => FunctionDescriptor::of_void(args)?,
        })
    })
}

/// # Safety
/// `descriptor` must come from `typthon_link_descriptor_new` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_descriptor_free(descriptor: *mut FunctionDescriptor) {
    free_boxed(descriptor)
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn typthon_link_option_first_variadic_arg(index: usize) -> *mut LinkOption {
    Box::into_raw(Box::new(LinkOption::first_variadic_arg(index)))
}

#[no_mangle]
pub extern "C" fn typthon_link_option_critical(allow_heap_access: bool) -> *mut LinkOption {
    Box::into_raw(Box::new(LinkOption::critical(allow_heap_access)))
}

/// Capture the named thread-local states after each call
///
/// # Safety
/// `names` must hold `count` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_option_capture_call_state(
    names: *const *const c_char,
    count: usize,
    out: *mut *mut LinkOption,
) -> i32 {
    build(out, || {
        let names: &[*const c_char] = match (names.is_null(), count) {
            (_, 0) => &[],
            (true, _) => return Err(LinkError::NullInput { what: "names" }),
            (false, n) => core::slice::from_raw_parts(names, n),
        };
        let names = names
            .iter()
            .map(|&name| {
                if name.is_null() {
                    return Err(LinkError::NullInput { what: "names" });
                }
                CStr::from_ptr(name).to_str().map_err(|_| LinkError::InvalidOption {
                    reason: "capture state name is not UTF-8".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        LinkOption::capture_call_state(names)
    })
}

/// # Safety
/// `option` must come from an option constructor and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_option_free(option: *mut LinkOption) {
    free_boxed(option)
}

// ---------------------------------------------------------------------------
// Arenas
// ---------------------------------------------------------------------------

/// Arena usable from any thread; stubs minted into it live until it closes
#[no_mangle]
pub extern "C" fn typthon_link_arena_new() -> *mut Arena {
    Box::into_raw(Box::new(Arena::new()))
}

/// # Safety
/// `arena` must come from `typthon_link_arena_new` and still be alive.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_arena_close(arena: *const Arena) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        let arena = arena.as_ref().ok_or(LinkError::NullInput { what: "arena" })?;
        Ok(arena.close()?)
    })))
}

/// Release an arena, closing it if still open
///
/// # Safety
/// `arena` must come from `typthon_link_arena_new` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_arena_free(arena: *mut Arena) {
    free_boxed(arena)
}

// ---------------------------------------------------------------------------
// Downcalls
// ---------------------------------------------------------------------------

/// Link a downcall; a null `symbol` yields an unbound handle
///
/// # Safety
/// Non-null pointers must be valid for their types; `out` receives a handle
/// owned by the caller, released with `typthon_link_handle_free`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_downcall(
    linker: *const Linker,
    symbol: *const c_void,
    descriptor: *const FunctionDescriptor,
    options: *const *const LinkOption,
    option_count: usize,
    out: *mut *mut DowncallHandle,
) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        let linker = linker_ref(linker);
        linker.check_access(Location::caller(), "downcallHandle")?;

        let descriptor = descriptor
            .as_ref()
            .ok_or(LinkError::NullInput { what: "descriptor" })?;
        let options = cloned_array(options, option_count, "options")?;
        if out.is_null() {
            return Err(LinkError::NullInput { what: "out" });
        }

        let mut handle = linker.downcall_inner(descriptor, &options)?;
        if !symbol.is_null() {
            handle = handle.bind(symbol as *const ())?;
        }
        *out = Box::into_raw(Box::new(handle));
        Ok(())
    })))
}

/// Release a handle from `typthon_link_downcall`
///
/// # Safety
/// `handle` must come from `typthon_link_downcall` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_handle_free(handle: *mut DowncallHandle) {
    free_boxed(handle)
}

/// Call through a handle
///
/// `args` holds one pointer per argument, led by a pointer to the target
/// address when the handle is unbound. `ret` receives the result and may be
/// null for a void function. `capture_state` points to memory shaped like
/// the capture layout when the handle captures call state.
///
/// # Safety
/// The handle's target must match its descriptor, every argument pointer
/// must point to a value of its layout, and `ret` must have room for the
/// return layout.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_invoke(
    handle: *const DowncallHandle,
    args: *const *const c_void,
    ret: *mut c_void,
    capture_state: *mut c_void,
) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        let handle = handle.as_ref().ok_or(LinkError::NullInput { what: "handle" })?;
        let descriptor = handle.descriptor();
        if ret.is_null() && descriptor.return_layout().is_some() {
            return Err(LinkError::NullInput { what: "ret" });
        }

        let leading = usize::from(!handle.is_bound());
        let count = leading + descriptor.argument_layouts().len();
        if args.is_null() && count > 0 {
            return Err(LinkError::NullInput { what: "args" });
        }

        // Struct arguments and results live here for the duration of the call
        let scratch = Arena::confined();
        let target_layout = MemoryLayout::from(ValueLayout::ADDRESS);
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let layout = match i.checked_sub(leading) {
                Some(index) => &descriptor.argument_layouts()[index],
                None => &target_layout,
            };
            let arg = *args.add(i);
            if arg.is_null() {
                return Err(LinkError::NullInput { what: "args" });
            }
            values.push(marshal::decode_arg(layout, arg, &scratch)?);
        }

        let capture = match handle.artifact().capture_layout() {
            Some(layout) if !capture_state.is_null() => {
                Some(MemorySegment::of_address(capture_state as usize).reinterpret(layout.byte_size()))
            }
            _ => None,
        };
        let mut ctx = CallContext::new().with_allocator(&scratch);
        if let Some(segment) = &capture {
            ctx = ctx.with_capture_state(segment);
        }

        let result = handle.invoke_with(&ctx, &values)?;
        write_result(&result, ret)?;
        Ok(())
    })))
}

/// Store a call result in native representation
unsafe fn write_result(value: &Value, ret: *mut c_void) -> Result<(), MemoryError> {
    let ret = ret as *mut u8;
    match value {
        Value::Void => {}
        Value::Bool(b) => ptr::write_unaligned(ret, *b as u8),
        Value::Byte(x) => ptr::write_unaligned(ret as *mut i8, *x),
        Value::Char(x) => ptr::write_unaligned(ret as *mut u16, *x),
        Value::Short(x) => ptr::write_unaligned(ret as *mut i16, *x),
        Value::Int(x) => ptr::write_unaligned(ret as *mut i32, *x),
        Value::Long(x) => ptr::write_unaligned(ret as *mut i64, *x),
        Value::Float(x) => ptr::write_unaligned(ret as *mut f32, *x),
        Value::Double(x) => ptr::write_unaligned(ret as *mut f64, *x),
        Value::Address(a) => ptr::write_unaligned(ret as *mut usize, *a),
        Value::Segment(segment) => {
            let bytes = segment.to_vec()?;
            ptr::copy_nonoverlapping(bytes.as_ptr(), ret, bytes.len());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Upcalls
// ---------------------------------------------------------------------------

/// Link an upcall stub factory
///
/// # Safety
/// Non-null pointers must be valid for their types; `out` receives a
/// factory released with `typthon_link_upcall_factory_free`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_upcall_factory(
    linker: *const Linker,
    descriptor: *const FunctionDescriptor,
    options: *const *const LinkOption,
    option_count: usize,
    out: *mut *const UpcallStubFactory,
) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        let linker = linker_ref(linker);
        linker.check_access(Location::caller(), "upcallStub")?;

        let descriptor = descriptor
            .as_ref()
            .ok_or(LinkError::NullInput { what: "descriptor" })?;
        let options = cloned_array(options, option_count, "options")?;
        if out.is_null() {
            return Err(LinkError::NullInput { what: "out" });
        }

        let factory = linker.upcall_inner(descriptor, &options, None)?;
        *out = Arc::into_raw(factory);
        Ok(())
    })))
}

/// Release a factory from `typthon_link_upcall_factory`
///
/// Stubs already minted stay callable until their arenas close.
///
/// # Safety
/// `factory` must come from `typthon_link_upcall_factory` and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_upcall_factory_free(factory: *const UpcallStubFactory) {
    if !factory.is_null() {
        drop(Arc::from_raw(factory));
    }
}

/// Mint a native entry point that forwards to `callback`
///
/// `out` receives the entry point, valid until `arena` closes.
///
/// # Safety
/// `factory` and `arena` must come from this library; `callback` must be
/// safe to call from any thread with `user_data`.
#[no_mangle]
pub unsafe extern "C" fn typthon_link_make_stub(
    factory: *const UpcallStubFactory,
    callback: Option<UpcallCallback>,
    user_data: *mut c_void,
    arena: *const Arena,
    out: *mut *const c_void,
) -> i32 {
    report(panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), LinkError> {
        let factory = factory
            .as_ref()
            .ok_or(LinkError::NullInput { what: "factory" })?;
        let callback = callback.ok_or(LinkError::NullInput { what: "callback" })?;
        let arena = arena.as_ref().ok_or(LinkError::NullInput { what: "arena" })?;
        if out.is_null() {
            return Err(LinkError::NullInput { what: "out" });
        }

        let target = callback_target(factory.descriptor(), callback, user_data as usize);
        let stub = factory.make_stub(target, arena)?;
        *out = stub.address() as *const c_void;
        Ok(())
    })))
}

fn callback_target(
    descriptor: &FunctionDescriptor,
    callback: UpcallCallback,
    user_data: usize,
) -> UpcallTarget {
    let descriptor = descriptor.clone();
    UpcallTarget::new(descriptor.to_method_type(), move |args| {
        // A failure surfaces as a mistyped result, which the stub reports before aborting
        unsafe { forward(&descriptor, callback, user_data, args) }.unwrap_or(Value::Void)
    })
}

/// Hand managed upcall arguments to a C callback and read back its result
unsafe fn forward(
    descriptor: &FunctionDescriptor,
    callback: UpcallCallback,
    user_data: usize,
    args: &[Value],
) -> Result<Value, InvokeError> {
    let mut slots: SmallVec<[ArgSlot; 8]> = SmallVec::with_capacity(args.len());
    for (index, (layout, value)) in descriptor.argument_layouts().iter().zip(args).enumerate() {
        slots.push(marshal::encode_arg(index, layout, value)?);
    }
    let arg_ptrs: SmallVec<[*mut c_void; 8]> = slots.iter_mut().map(ArgSlot::as_arg_ptr).collect();
    let user_data = user_data as *mut c_void;

    match descriptor.return_layout() {
        None => {
            callback(arg_ptrs.as_ptr(), ptr::null_mut(), user_data);
            Ok(Value::Void)
        }
        Some(layout) if layout.is_group() => {
            let arena = Arena::confined();
            let segment = arena.allocate_layout(layout)?;
            callback(arg_ptrs.as_ptr(), segment.as_ptr()? as *mut c_void, user_data);
            // Kept until the next struct-returning upcall on this thread
            UPCALL_RETURNS.with(|r| *r.borrow_mut() = Some(arena));
            Ok(Value::Segment(segment))
        }
        Some(layout) => {
            let mut cell = ReturnCell::new();
            callback(arg_ptrs.as_ptr(), cell.as_mut_ptr(), user_data);
            marshal::decode_arg(layout, cell.as_mut_ptr() as *const c_void, Arena::global())
        }
    }
}
