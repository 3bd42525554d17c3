//! Native memory - arenas, segments and allocators
//!
//! Design: Every segment is tied to the scope of the arena that produced it.
//! Closing the arena frees its blocks and runs registered cleanups (upcall
//! stubs use this to retire themselves); segments of a closed arena refuse
//! all access afterwards. Accessors hold a lease on the scope while they
//! touch memory, so a concurrent close never frees a block under them.
//!
//! Architecture:
//! - `arena.rs` - Arena scopes (confined, shared, global)
//! - `segment.rs` - Bounds- and liveness-checked views of native memory

mod arena;
mod segment;

#[cfg(test)]
mod tests;

pub use arena::Arena;
pub use segment::{MemorySegment, Primitive};

pub(crate) use arena::{Lease, ScopeState};

use crate::error::MemoryError;
use crate::layout::MemoryLayout;

/// Source of native memory for values the linker has to materialize
pub trait SegmentAllocator {
    /// Allocate zeroed memory of the given size and alignment
    fn allocate(&self, byte_size: u64, byte_alignment: u64) -> Result<MemorySegment, MemoryError>;

    /// Allocate memory shaped for `layout`
    fn allocate_layout(&self, layout: &MemoryLayout) -> Result<MemorySegment, MemoryError> {
        self.allocate(layout.byte_size(), layout.byte_alignment())
    }
}
