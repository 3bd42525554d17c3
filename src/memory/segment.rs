//! Memory segments - bounded, scope-checked views of native memory

use super::{Lease, ScopeState};
use crate::error::MemoryError;
use core::fmt;
use core::ptr;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// Plain scalar that can be read from or written to a segment
pub trait Primitive: Copy + sealed::Sealed {}

macro_rules! primitives {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Primitive for $ty {}
        )*
    };
}

primitives!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, usize);

/// Contiguous region of native memory
///
/// Segments without a scope (from `of_address`) are always alive and have
/// no meaningful bounds beyond their declared size.
#[derive(Clone)]
pub struct MemorySegment {
    address: usize,
    byte_size: u64,
    scope: Option<Arc<ScopeState>>,
}

impl MemorySegment {
    /// Zero-length segment at address 0
    pub const NULL: Self = Self {
        address: 0,
        byte_size: 0,
        scope: None,
    };

    /// Zero-length segment for a raw address (e.g. a returned pointer)
    #[inline]
    pub const fn of_address(address: usize) -> Self {
        Self {
            address,
            byte_size: 0,
            scope: None,
        }
    }

    pub(crate) fn scoped(address: usize, byte_size: u64, scope: Arc<ScopeState>) -> Self {
        Self {
            address,
            byte_size,
            scope: Some(scope),
        }
    }

    /// Same memory with a different size
    ///
    /// # Safety
    /// `byte_size` bytes starting at the segment's address must be valid
    /// for as long as the segment's scope is alive.
    pub unsafe fn reinterpret(&self, byte_size: u64) -> Self {
        Self {
            address: self.address,
            byte_size,
            scope: self.scope.clone(),
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Check if the owning scope is still open
    pub fn is_alive(&self) -> bool {
        self.scope.as_ref().map_or(true, |s| s.is_alive())
    }

    /// Id of the owning arena, if any
    pub fn scope_id(&self) -> Option<u64> {
        self.scope.as_ref().map(|s| s.id())
    }

    /// Check liveness, thread and bounds; return a pointer to `offset`
    ///
    /// The pointer is valid while the returned lease is held.
    pub(crate) fn leased(
        &self,
        offset: u64,
        length: u64,
    ) -> Result<(Option<Lease<'_>>, *mut u8), MemoryError> {
        let lease = match &self.scope {
            Some(scope) => Some(scope.acquire()?),
            None => None,
        };
        let in_bounds = offset
            .checked_add(length)
            .map_or(false, |end| end <= self.byte_size);
        if !in_bounds {
            return Err(MemoryError::OutOfBounds {
                offset,
                length,
                size: self.byte_size,
            });
        }
        Ok((lease, (self.address + offset as usize) as *mut u8))
    }

    /// Pointer to the first byte, after a liveness check
    ///
    /// The pointer is not covered by a lease: a shared arena may be closed
    /// from another thread while it is in use.
    pub fn as_ptr(&self) -> Result<*mut u8, MemoryError> {
        self.leased(0, 0).map(|(_, p)| p)
    }

    /// Read a scalar at `offset` (unaligned)
    pub fn get<T: Primitive>(&self, offset: u64) -> Result<T, MemoryError> {
        let (_lease, p) = self.leased(offset, core::mem::size_of::<T>() as u64)?;
        Ok(unsafe { ptr::read_unaligned(p as *const T) })
    }

    /// Write a scalar at `offset` (unaligned)
    pub fn set<T: Primitive>(&self, offset: u64, value: T) -> Result<(), MemoryError> {
        let (_lease, p) = self.leased(offset, core::mem::size_of::<T>() as u64)?;
        unsafe { ptr::write_unaligned(p as *mut T, value) };
        Ok(())
    }

    /// Copy `bytes` into the segment at `offset`
    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let (_lease, p) = self.leased(offset, bytes.len() as u64)?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
        Ok(())
    }

    /// Copy all of `src` to the start of this segment
    pub fn copy_from(&self, src: &MemorySegment) -> Result<(), MemoryError> {
        // Staged through a buffer so each side takes its lease on its own
        let bytes = src.to_vec()?;
        self.write_bytes(0, &bytes)
    }

    pub fn fill(&self, value: u8) -> Result<(), MemoryError> {
        let (_lease, p) = self.leased(0, self.byte_size)?;
        unsafe { ptr::write_bytes(p, value, self.byte_size as usize) };
        Ok(())
    }

    /// Copy the segment's contents out
    pub fn to_vec(&self) -> Result<Vec<u8>, MemoryError> {
        let (_lease, p) = self.leased(0, self.byte_size)?;
        let mut out = vec![0u8; self.byte_size as usize];
        unsafe { ptr::copy_nonoverlapping(p as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(out)
    }
}

impl PartialEq for MemorySegment {
    fn eq(&self, other: &Self) -> bool {
        let same_scope = match (&self.scope, &other.scope) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.address == other.address && self.byte_size == other.byte_size && same_scope
    }
}

impl Eq for MemorySegment {}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("address", &format_args!("{:#x}", self.address))
            .field("byte_size", &self.byte_size)
            .field("scope", &self.scope_id())
            .finish()
    }
}
