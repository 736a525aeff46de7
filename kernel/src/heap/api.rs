//! Allocator and capability contracts.
//!
//! The heap and its collaborators are wired together through these
//! traits: the heap receives a chunk allocator, a mutex factory and a
//! thread-local factory at creation time, and itself implements the
//! mutable-allocator contract everything else consumes. Static trait
//! dispatch replaces the object-system plumbing of older designs;
//! notification sinks are plain single-slot hooks.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::status::{DidAlloc, MmResult, Zeroing};

/// The mutable-allocator contract.
///
/// Pointer-based like the hardware-facing rest of this crate. The
/// degenerate `realloc` rules are part of the contract: a null pointer
/// reallocates as a fresh allocation, and a zero size frees the block
/// and returns null.
///
/// # Safety
///
/// Implementations must return blocks that stay valid until freed, and
/// must answer `did_alloc` strictly by region membership so that
/// multiple allocators can be told apart.
pub unsafe trait Allocator {
    /// Allocate `size` bytes; null on exhaustion.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Resize `ptr` to `size` bytes, in place when possible.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of this allocator.
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// Release a block. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of this allocator.
    unsafe fn free(&self, ptr: *mut u8);

    /// Usable size of a live block; `usize::MAX` if the pointer is not
    /// this allocator's.
    fn size(&self, ptr: *mut u8) -> usize;

    /// Whether this allocator owns `ptr`.
    fn did_alloc(&self, ptr: *mut u8) -> DidAlloc;

    /// Advisory: return whatever memory can cheaply be returned.
    fn heap_minimize(&self);
}

/// Source of power-of-two chunks for the production heap.
pub trait ChunkAllocator {
    /// Allocate `size` bytes aligned to `align` (both multiples of the
    /// chunk size). The `Zeroing` payload reports whether the memory
    /// is known to be zero-filled.
    fn alloc_chunk(&self, size: usize, align: usize) -> MmResult<(NonNull<u8>, Zeroing)>;

    /// The region is unused; the provider may unmap or decommit it.
    /// Returns whether the memory will read back zeroed if reused.
    fn purge_unused(&self, ptr: NonNull<u8>, size: usize) -> MmResult<Zeroing>;
}

/// A simple non-reentrant blocking lock.
pub trait RawMutex: Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// Creates mutexes for the heap's internal locking.
pub trait MutexFactory {
    fn create_mutex(&self) -> MmResult<&'static dyn RawMutex>;
}

/// RAII guard over a [`RawMutex`].
pub struct MutexGuard<'a> {
    mutex: &'a dyn RawMutex,
}

impl<'a> MutexGuard<'a> {
    pub fn lock(mutex: &'a dyn RawMutex) -> MutexGuard<'a> {
        mutex.lock();
        MutexGuard { mutex }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A thread-local slot holding one machine word.
pub trait TlsSlot: Sync {
    fn get(&self) -> usize;
    fn set(&self, value: usize);
    /// Register a destructor run with the slot's value when the owning
    /// thread exits.
    fn set_cleanup(&self, cleanup: fn(usize));
}

/// Creates thread-local slots.
pub trait TlsFactory {
    fn create_slot(&self, initial: usize) -> MmResult<&'static dyn TlsSlot>;
}

/// Debug output sink (the heap's diagnostics stream).
pub trait SequentialStream: Sync {
    /// Write as much of `buf` as possible; returns bytes accepted.
    fn write(&self, buf: &[u8]) -> usize;
}

/// Interception hooks around every top-level heap call (single slot).
pub trait MallocSpy: Sync {
    fn pre_alloc(&self, size: usize) -> usize {
        size
    }
    fn post_alloc(&self, _ptr: *mut u8) {}
    fn pre_realloc(&self, _ptr: *mut u8, size: usize) -> usize {
        size
    }
    fn post_realloc(&self, _ptr: *mut u8) {}
    fn pre_free(&self, _ptr: *mut u8) {}
    fn post_free(&self) {}
}

bitflags! {
    /// Heap-creation behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Pad small regions with canary red zones.
        const REDZONE = 0x0000_0001;
        /// Fill allocations/frees with junk patterns.
        const JUNKFILL = 0x0000_0002;
        /// Zero every allocation.
        const ZEROFILL = 0x0000_0004;
        /// Disable the thread cache.
        const NO_TCACHE = 0x0000_0008;
        /// Enable the per-arena profiling accumulator.
        const PROFILE = 0x0000_0010;
    }
}

/// Default chunk size exponent: 4 MiB chunks.
pub const STD_CHUNK_BITS: u32 = 22;

// ---------------------------------------------------------------------------
// Kernel-side capability implementations
// ---------------------------------------------------------------------------

/// A mutex factory dealing spinlocks out of a fixed static pool. The
/// heap needs a handful of locks for its lifetime; pre-scheduling
/// kernels have no dynamic mutex storage to offer.
pub struct SpinMutexFactory {
    pool: &'static [PoolMutex],
    next: core::sync::atomic::AtomicUsize,
}

pub struct PoolMutex {
    locked: core::sync::atomic::AtomicBool,
}

impl PoolMutex {
    pub const fn new() -> PoolMutex {
        PoolMutex {
            locked: core::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl RawMutex for PoolMutex {
    fn lock(&self) {
        use core::sync::atomic::Ordering;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.locked
            .store(false, core::sync::atomic::Ordering::Release);
    }
}

impl SpinMutexFactory {
    pub const fn new(pool: &'static [PoolMutex]) -> SpinMutexFactory {
        SpinMutexFactory {
            pool,
            next: core::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl MutexFactory for SpinMutexFactory {
    fn create_mutex(&self) -> MmResult<&'static dyn RawMutex> {
        let ndx = self
            .next
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        match self.pool.get(ndx) {
            Some(m) => Ok(m),
            None => Err(crate::status::MmError::OutOfMemory),
        }
    }
}

/// Thread-local factory for a kernel without threads yet: every "slot"
/// is one shared word. The cleanup hook is retained but never fires
/// until a scheduler exists to end threads.
pub struct SharedSlotFactory {
    pool: &'static [SharedSlot],
    next: core::sync::atomic::AtomicUsize,
}

pub struct SharedSlot {
    value: core::sync::atomic::AtomicUsize,
    cleanup: core::sync::atomic::AtomicUsize,
}

impl SharedSlot {
    pub const fn new() -> SharedSlot {
        SharedSlot {
            value: core::sync::atomic::AtomicUsize::new(0),
            cleanup: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// The registered destructor, for whatever eventually ends
    /// "threads" in this kernel.
    pub fn cleanup_fn(&self) -> Option<fn(usize)> {
        let raw = self.cleanup.load(core::sync::atomic::Ordering::Relaxed);
        if raw == 0 {
            None
        } else {
            // SAFETY: only `set_cleanup` stores here, always from a
            // real fn pointer.
            Some(unsafe { core::mem::transmute::<usize, fn(usize)>(raw) })
        }
    }
}

impl TlsSlot for SharedSlot {
    fn get(&self) -> usize {
        self.value.load(core::sync::atomic::Ordering::Relaxed)
    }
    fn set(&self, value: usize) {
        self.value.store(value, core::sync::atomic::Ordering::Relaxed);
    }
    fn set_cleanup(&self, cleanup: fn(usize)) {
        self.cleanup
            .store(cleanup as usize, core::sync::atomic::Ordering::Relaxed);
    }
}

impl SharedSlotFactory {
    pub const fn new(pool: &'static [SharedSlot]) -> SharedSlotFactory {
        SharedSlotFactory {
            pool,
            next: core::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl TlsFactory for SharedSlotFactory {
    fn create_slot(&self, initial: usize) -> MmResult<&'static dyn TlsSlot> {
        let ndx = self
            .next
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        match self.pool.get(ndx) {
            Some(slot) => {
                slot.set(initial);
                Ok(slot)
            }
            None => Err(crate::status::MmError::OutOfMemory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_factory_deals_distinct_mutexes() {
        static POOL: [PoolMutex; 2] = [PoolMutex::new(), PoolMutex::new()];
        let factory = SpinMutexFactory::new(&POOL);
        let a = factory.create_mutex().unwrap();
        let b = factory.create_mutex().unwrap();
        assert!(!core::ptr::eq(
            a as *const dyn RawMutex as *const u8,
            b as *const dyn RawMutex as *const u8
        ));
        assert!(factory.create_mutex().is_err());

        a.lock();
        a.unlock();
        let _guard = MutexGuard::lock(b);
    }

    #[test]
    fn shared_slot_round_trip() {
        static SLOTS: [SharedSlot; 1] = [SharedSlot::new()];
        let factory = SharedSlotFactory::new(&SLOTS);
        let slot = factory.create_slot(7).unwrap();
        assert_eq!(slot.get(), 7);
        slot.set(99);
        assert_eq!(slot.get(), 99);
    }
}
