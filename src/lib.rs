//! Typthon Link - native function linkage
//!
//! Turns C-style function descriptors into callable downcall handles and
//! native-callable upcall stubs. Every request is validated against the
//! platform's layout rules, normalized, and cached so equal shapes share
//! one linkage artifact.
//!
//! Architecture:
//! - `layout` - Memory layouts (scalars, padding, structs, unions, sequences)
//! - `descriptor` - Function descriptors and their carrier signatures
//! - `memory` - Arenas and bounded native segments
//! - `interop` - ABI classification, libffi calls, upcall stubs, platforms
//! - `linker` - The linkage engine and its cache
//! - `access` - Native access policy
//! - `config` - `.typthon-link.toml` configuration
//! - `logging` - Structured tracing
//! - `ffi` - C API

pub mod access;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod ffi;
pub mod interop;
pub mod layout;
pub mod linker;
pub mod logging;
pub mod memory;

// Re-export core types
pub use access::AccessMode;
pub use config::LinkerConfig;
pub use descriptor::{Carrier, FunctionDescriptor, MethodType};
pub use error::{InvokeError, LayoutError, LayoutViolation, LinkError, MemoryError};
pub use interop::{AbiDispatch, CapturedState, PlatformLinker, UpcallStubFactory, UpcallTarget, Value};
pub use layout::{GroupLayout, MemoryLayout, PaddingLayout, SequenceLayout, ValueLayout};
pub use linker::{native_linker, CallContext, DowncallHandle, LinkOption, Linker};
pub use memory::{Arena, MemorySegment, SegmentAllocator};

/// Initialize logging from the environment
#[no_mangle]
pub extern "C" fn typthon_link_init() {
    logging::init();
}
