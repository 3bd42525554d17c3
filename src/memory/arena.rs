//! Arena scopes - own native blocks until closed
//!
//! Blocks come from the global allocator, zero-filled, and are released in
//! bulk when the arena closes. Shared arenas may be used and closed from any
//! thread; confined arenas only from the thread that created them.
//!
//! Every access to a block holds a read lease on the scope. `close` takes the
//! write side before ending the scope, so it waits for accesses in flight and
//! no new one can start afterwards.

use super::{MemorySegment, SegmentAllocator};
use crate::error::MemoryError;
use crate::logging;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: Lazy<Arena> = Lazy::new(|| Arena::with_scope(None, false));

type Cleanup = Box<dyn FnOnce() + Send>;

/// Shared hold on a live scope; its blocks stay allocated while it exists
pub(crate) type Lease<'a> = RwLockReadGuard<'a, ()>;

/// Lifetime shared by an arena and every segment it hands out
pub(crate) struct ScopeState {
    id: u64,
    alive: AtomicBool,
    owner: Option<ThreadId>,
    closeable: bool,
    access: RwLock<()>,
    blocks: Mutex<Vec<(usize, Layout)>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl ScopeState {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn check_owner(&self) -> Result<(), MemoryError> {
        match self.owner {
            Some(owner) if owner != thread::current().id() => Err(MemoryError::WrongThread),
            _ => Ok(()),
        }
    }

    /// Check that memory of this scope may be touched from the current thread
    pub(crate) fn check_access(&self) -> Result<(), MemoryError> {
        self.check_owner()?;
        if !self.is_alive() {
            return Err(MemoryError::ScopeClosed);
        }
        Ok(())
    }

    /// Hold the scope open for the duration of a raw access
    pub(crate) fn acquire(&self) -> Result<Lease<'_>, MemoryError> {
        self.check_owner()?;
        let lease = self.access.read();
        if !self.is_alive() {
            return Err(MemoryError::ScopeClosed);
        }
        Ok(lease)
    }
}

/// Memory scope that frees everything it allocated when closed
pub struct Arena {
    scope: Arc<ScopeState>,
}

impl Arena {
    /// Arena usable and closeable from any thread; closes on drop
    pub fn new() -> Self {
        Self::with_scope(None, true)
    }

    /// Arena bound to the current thread; closes on drop
    pub fn confined() -> Self {
        Self::with_scope(Some(thread::current().id()), true)
    }

    /// Process-wide arena that is never closed
    pub fn global() -> &'static Arena {
        &GLOBAL
    }

    fn with_scope(owner: Option<ThreadId>, closeable: bool) -> Self {
        Self {
            scope: Arc::new(ScopeState {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                alive: AtomicBool::new(true),
                owner,
                closeable,
                access: RwLock::new(()),
                blocks: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.scope.is_alive()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.scope.id
    }

    /// End the scope: run cleanups, then free every block
    ///
    /// Blocks until accesses in flight on other threads finish.
    pub fn close(&self) -> Result<(), MemoryError> {
        if !self.scope.closeable {
            return Err(MemoryError::NotCloseable);
        }
        self.scope.check_owner()?;
        self.release()
    }

    fn release(&self) -> Result<(), MemoryError> {
        let exclusive = self.scope.access.write();
        if self
            .scope
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MemoryError::AlreadyClosed);
        }
        // Leases check liveness after acquiring, so none can start from here on
        drop(exclusive);

        let cleanups = std::mem::take(&mut *self.scope.cleanups.lock());
        let cleanup_count = cleanups.len();
        for cleanup in cleanups {
            cleanup();
        }

        let blocks = std::mem::take(&mut *self.scope.blocks.lock());
        let block_count = blocks.len();
        for (address, layout) in blocks {
            unsafe { dealloc(address as *mut u8, layout) };
        }

        logging::log_scope_closed(self.scope.id, block_count, cleanup_count);
        Ok(())
    }

    /// Run `action` when the arena closes
    ///
    /// Runs immediately if the arena already closed.
    pub(crate) fn register_cleanup(&self, action: impl FnOnce() + Send + 'static) {
        let mut cleanups = self.scope.cleanups.lock();
        if self.scope.is_alive() {
            cleanups.push(Box::new(action));
        } else {
            drop(cleanups);
            action();
        }
    }

    pub(crate) fn scope(&self) -> &Arc<ScopeState> {
        &self.scope
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentAllocator for Arena {
    fn allocate(&self, byte_size: u64, byte_alignment: u64) -> Result<MemorySegment, MemoryError> {
        self.scope.check_access()?;
        let failed = MemoryError::AllocationFailed {
            size: byte_size,
            alignment: byte_alignment,
        };
        let size = usize::try_from(byte_size).map_err(|_| failed.clone())?;
        let align = usize::try_from(byte_alignment).map_err(|_| failed.clone())?;
        let layout = Layout::from_size_align(size, align).map_err(|_| failed.clone())?;

        if size == 0 {
            // Zero-sized blocks need no backing, only a well-aligned address
            return Ok(MemorySegment::scoped(align, 0, self.scope.clone()));
        }

        let address = unsafe { alloc_zeroed(layout) };
        if address.is_null() {
            return Err(failed);
        }

        let mut blocks = self.scope.blocks.lock();
        if !self.scope.is_alive() {
            // Lost a race with close
            unsafe { dealloc(address, layout) };
            return Err(MemoryError::ScopeClosed);
        }
        blocks.push((address as usize, layout));
        drop(blocks);

        logging::log_allocation(byte_size, address as usize);
        Ok(MemorySegment::scoped(address as usize, byte_size, self.scope.clone()))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Dropped on a foreign thread: the owner is gone, release anyway
        if self.scope.closeable && self.scope.is_alive() {
            let _ = self.release();
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.scope.id)
            .field("alive", &self.scope.is_alive())
            .field("confined", &self.scope.owner.is_some())
            .finish()
    }
}
