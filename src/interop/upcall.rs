//! Upcall stubs - native entry points that call back into managed code
//!
//! Design: one libffi closure per live stub. The closure's user data is a
//! reference-counted `StubState` that is never released, so a stub whose
//! arena closed still lands in `upcall_entry`, which reports the misuse and
//! aborts instead of jumping into freed memory. Retired closures go back to
//! their factory and are rebound by the next `make_stub`, so the closures a
//! factory owns never outnumber its peak of live stubs.

use super::abi::CallingSequence;
use super::call::{in_critical, CallInterface};
use super::marshal;
use super::types::Value;
use crate::descriptor::{FunctionDescriptor, MethodType};
use crate::error::{InvokeError, LinkError, MemoryError};
use crate::logging;
use crate::memory::{Arena, MemorySegment};
use core::ffi::c_void;
use libffi::raw;
use parking_lot::{Mutex, RwLock};
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Infallible = dyn Fn(&[Value]) -> Value + Send + Sync;
type Fallible = dyn Fn(&[Value]) -> Result<Value, Box<dyn Error + Send + Sync>> + Send + Sync;

#[derive(Clone)]
enum Body {
    Infallible(Arc<Infallible>),
    Fallible(Arc<Fallible>),
}

/// Managed callable that native code may invoke through a stub
#[derive(Clone)]
pub struct UpcallTarget {
    method_type: MethodType,
    body: Body,
}

impl UpcallTarget {
    /// Target that always produces a value
    pub fn new<F>(method_type: MethodType, body: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            method_type,
            body: Body::Infallible(Arc::new(body)),
        }
    }

    /// Target that may report an error
    ///
    /// Errors cannot travel through native frames, so linking rejects these.
    pub fn fallible<F>(method_type: MethodType, body: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        Self {
            method_type,
            body: Body::Fallible(Arc::new(body)),
        }
    }

    pub fn method_type(&self) -> &MethodType {
        &self.method_type
    }

    /// Check if the target can escape with an error
    #[inline]
    pub fn may_fail(&self) -> bool {
        matches!(self.body, Body::Fallible(_))
    }

    fn call(&self, args: &[Value]) -> Result<Value, Box<dyn Error + Send + Sync>> {
        match &self.body {
            Body::Infallible(f) => Ok(f(args)),
            Body::Fallible(f) => f(args),
        }
    }
}

impl std::fmt::Debug for UpcallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcallTarget")
            .field("method_type", &self.method_type.to_string())
            .field("may_fail", &self.may_fail())
            .finish()
    }
}

/// Closure whose arena closed, kept for reuse
struct RetiredStub {
    code: usize,
    state: Arc<StubState>,
}

/// Reusable marshaling code for one upcall signature
pub struct UpcallStubFactory {
    interface: Arc<CallInterface>,
    descriptor: FunctionDescriptor,
    sequence: CallingSequence,
    retired: Arc<Mutex<Vec<RetiredStub>>>,
}

impl UpcallStubFactory {
    pub(crate) fn new(
        interface: CallInterface,
        descriptor: FunctionDescriptor,
        sequence: CallingSequence,
    ) -> Self {
        Self {
            interface: Arc::new(interface),
            descriptor,
            sequence,
            retired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    /// Mint a native entry point bound to `target`, valid until `arena` closes
    ///
    /// Each stub takes one libffi closure. The closure is never freed: once
    /// the arena closes it returns to this factory and a later stub may reuse
    /// its address, so a stale entry point reaches whichever target currently
    /// holds it, or aborts if none does.
    pub fn make_stub(&self, target: UpcallTarget, arena: &Arena) -> Result<MemorySegment, LinkError> {
        arena.scope().check_access()?;

        let recycled = self.retired.lock().pop();
        let (code, state) = match recycled {
            Some(RetiredStub { code, state }) => {
                state.rebind(target, arena.id());
                (code, state)
            }
            None => self.allocate_closure(target, arena.id())?,
        };

        let pool = self.retired.clone();
        let retired = state.clone();
        arena.register_cleanup(move || {
            retired.retire();
            pool.lock().push(RetiredStub {
                code,
                state: retired,
            });
        });

        logging::log_stub_minted(code, arena.id(), &self.descriptor);
        Ok(MemorySegment::scoped(code, 0, arena.scope().clone()))
    }

    /// Number of closures waiting to be rebound
    pub fn retired_stubs(&self) -> usize {
        self.retired.lock().len()
    }

    fn allocate_closure(
        &self,
        target: UpcallTarget,
        scope_id: u64,
    ) -> Result<(usize, Arc<StubState>), LinkError> {
        let state = Arc::new(StubState {
            interface: self.interface.clone(),
            descriptor: self.descriptor.clone(),
            target: RwLock::new(Some(target)),
            alive: AtomicBool::new(true),
            scope_id: AtomicU64::new(scope_id),
        });

        let mut code: *mut c_void = core::ptr::null_mut();
        let closure = unsafe {
            raw::ffi_closure_alloc(core::mem::size_of::<raw::ffi_closure>(), &mut code)
        } as *mut raw::ffi_closure;
        if closure.is_null() {
            return Err(MemoryError::AllocationFailed {
                size: core::mem::size_of::<raw::ffi_closure>() as u64,
                alignment: core::mem::align_of::<raw::ffi_closure>() as u64,
            }
            .into());
        }

        let user_data = Arc::into_raw(state.clone()) as *mut c_void;
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                self.interface.as_raw_ptr(),
                Some(upcall_entry),
                user_data,
                code,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            unsafe {
                raw::ffi_closure_free(closure as *mut c_void);
                drop(Arc::from_raw(user_data as *const StubState));
            }
            return Err(LinkError::Unsupported {
                reason: format!("ffi_prep_closure_loc failed ({:?}) for {}", status, self.descriptor),
            });
        }
        Ok((code as usize, state))
    }
}

impl std::fmt::Debug for UpcallStubFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcallStubFactory")
            .field("descriptor", &self.descriptor.to_string())
            .field("sequence", &self.sequence.to_string())
            .field("retired", &self.retired_stubs())
            .finish()
    }
}

/// Per-stub state reachable from the native entry point
struct StubState {
    interface: Arc<CallInterface>,
    descriptor: FunctionDescriptor,
    target: RwLock<Option<UpcallTarget>>,
    alive: AtomicBool,
    scope_id: AtomicU64,
}

impl StubState {
    fn retire(&self) {
        self.alive.store(false, Ordering::Release);
        self.target.write().take();
    }

    fn rebind(&self, target: UpcallTarget, scope_id: u64) {
        *self.target.write() = Some(target);
        self.scope_id.store(scope_id, Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);
    }

    fn scope_id(&self) -> u64 {
        self.scope_id.load(Ordering::Relaxed)
    }

    /// Unmarshal native arguments, run the target, marshal the result
    unsafe fn dispatch(&self, ret: *mut c_void, args: *mut *mut c_void) -> Result<(), String> {
        let target = self
            .target
            .read()
            .clone()
            .ok_or_else(|| "upcall stub has been retired".to_string())?;

        // Struct arguments are copied into memory that lives for this call only
        let scratch = Arena::confined();
        let layouts = self.descriptor.argument_layouts();
        let mut values = Vec::with_capacity(layouts.len());
        for (i, layout) in layouts.iter().enumerate() {
            let arg = *args.add(i) as *const c_void;
            let value = marshal::decode_arg(layout, arg, &scratch).map_err(|e| e.to_string())?;
            values.push(value);
        }

        let result = target.call(&values).map_err(|e| e.to_string())?;

        match self.descriptor.return_layout() {
            Some(layout) => marshal::encode_return(layout, &result, ret).map_err(|e| match e {
                InvokeError::ArgumentType { expected, found, .. } => {
                    format!("upcall target returned {}, expected {}", found, expected)
                }
                other => other.to_string(),
            })?,
            None => {
                if result != Value::Void {
                    return Err(format!("upcall target returned {} from a void upcall", result.type_name()));
                }
            }
        }
        Ok(())
    }
}

unsafe extern "C" fn upcall_entry(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let state = &*(user_data as *const StubState);

    if in_critical() {
        fatal(state.scope_id(), "upcall made from a critical downcall");
    }
    if !state.alive.load(Ordering::Acquire) {
        fatal(state.scope_id(), "upcall stub invoked after its arena was closed");
    }

    match panic::catch_unwind(AssertUnwindSafe(|| state.dispatch(ret, args))) {
        Ok(Ok(())) => {}
        Ok(Err(message)) => fatal(state.scope_id(), &message),
        Err(_) => fatal(state.scope_id(), "upcall target panicked"),
    }
}

/// Native frames cannot be unwound; report and abort
fn fatal(scope_id: u64, message: &str) -> ! {
    logging::log_upcall_fatal(scope_id, message);
    eprintln!("typthon-link: fatal error in upcall: {}", message);
    std::process::abort()
}
