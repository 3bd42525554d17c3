//! Interoperability - native calls and callbacks
//!
//! Design: libffi performs the machine-level marshaling; this module owns
//! the ABI strategies, value conversion and stub lifetimes around it.
//!
//! Architecture:
//! - `types.rs` - Managed values and layout → libffi type lowering
//! - `marshal.rs` - Argument/return conversions
//! - `call.rs` - Call interfaces and downcall invocation
//! - `upcall.rs` - Upcall targets, stub factories and the native entry point
//! - `capture.rs` - errno / GetLastError capture
//! - `abi.rs` - Calling convention classification (System V, Win64, ARM, ...)
//! - `platform.rs` - Platform strategy selection and canonical layouts

mod abi;
mod call;
mod capture;
pub(crate) mod marshal;
mod platform;
mod types;
mod upcall;

pub use abi::{ArgumentBinding, ArgumentLocation, CallingConvention, CallingSequence, RegisterAllocator};
pub use call::NativeInvoker;
pub use capture::{capture_state_layout, CapturedState};
pub use platform::{AbiDispatch, CanonicalLayouts, PlatformLinker};
pub use types::Value;
pub use upcall::{UpcallStubFactory, UpcallTarget};

pub(crate) use capture::check_capture_segment;
pub(crate) use marshal::group_return_storage;
