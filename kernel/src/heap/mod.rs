//! The production kernel heap.
//!
//! A multi-arena, size-classed allocator layered as: chunk layer over
//! an injected chunk-allocator capability → per-heap base bump
//! allocator → extent-tree chunk bookkeeping → arena with bins and
//! runs → thread caches, plus a radix tree for O(1) chunk-base lookup.
//! Small requests come from size-classed regions inside runs, large
//! requests from whole page runs, and anything of at least a chunk
//! bypasses the arena entirely.
//!
//! A heap is created inside caller-provided raw storage with injected
//! capabilities ([`heap_create`]), and serves the mutable-allocator
//! contract of [`api::Allocator`]. Two single-slot notification points
//! exist: a malloc spy intercepting every top-level call and a debug
//! stream for diagnostics.

pub mod api;
pub mod arena;
pub mod base;
pub mod bitmap;
pub mod chunk;
pub mod extent;
pub mod rtree;
pub mod size_classes;
pub mod tcache;

use core::cell::UnsafeCell;
use core::ptr;

use api::{
    Allocator, ChunkAllocator, HeapFlags, MallocSpy, MutexFactory, RawMutex, SequentialStream,
    TlsFactory, TlsSlot,
};
use arena::{bin_info_init, Arena, ArenaChunkHeader, BinInfo, LG_PAGE, PAGE};
use base::BaseState;
use extent::{AddrAdapter, SizeAddrAdapter};
use rtree::MemRtree;
use size_classes::{size2bin, NBINS, SMALL_MAXCLASS};
use tcache::TCACHE_MAXCLASS;

use crate::collections::rbtree::RbTree;
use crate::status::{DidAlloc, MmError, MmResult};

/// Junk patterns (allocation / free).
const JUNK_ALLOC: u8 = 0xA5;
const JUNK_FREE: u8 = 0x5A;
/// Red-zone canary byte.
const REDZONE_BYTE: u8 = 0xA5;

/// Opaque storage a heap is built inside. Sized generously; creation
/// verifies the fit at runtime.
#[repr(C, align(64))]
pub struct RawHeapData {
    _opaque: [usize; 2048],
}

impl RawHeapData {
    pub const fn new() -> RawHeapData {
        RawHeapData { _opaque: [0; 2048] }
    }
}

struct ChunkTrees {
    by_size_addr: RbTree<SizeAddrAdapter>,
    by_addr: RbTree<AddrAdapter>,
}

/// The heap object. Lives inside a [`RawHeapData`] for its entire
/// life; all internal state is behind its own locks, so the public
/// surface takes `&self`.
pub struct Heap {
    flags: HeapFlags,
    chunk_bits: u32,
    chunk_size: usize,
    chunk_npages: usize,
    map_bias: usize,
    arena_maxclass: usize,

    chunk_source: &'static dyn ChunkAllocator,
    free_raw: Option<unsafe fn(*mut RawHeapData)>,

    base_mtx: &'static dyn RawMutex,
    base: UnsafeCell<BaseState>,

    chunks_mtx: &'static dyn RawMutex,
    chunks: UnsafeCell<ChunkTrees>,

    huge_mtx: &'static dyn RawMutex,
    huge: UnsafeCell<RbTree<AddrAdapter>>,

    rtree_mtx: &'static dyn RawMutex,
    rtree: UnsafeCell<MemRtree>,

    arena_mtx: &'static dyn RawMutex,
    arena: UnsafeCell<Arena>,

    bin_info: [BinInfo; NBINS],

    tcache_slot: &'static dyn TlsSlot,
    tcache_enabled_slot: &'static dyn TlsSlot,

    spy: spin::Mutex<Option<&'static dyn MallocSpy>>,
    dbg: spin::Mutex<Option<&'static dyn SequentialStream>>,
}

// SAFETY: every mutable field is protected by one of the heap's own
// locks (or is a thread-local slot); the raw storage never moves.
unsafe impl Sync for Heap {}
unsafe impl Send for Heap {}

/// Build a heap inside `raw` with the given behavior flags, chunk size
/// exponent and injected capabilities.
pub fn heap_create(
    raw: &'static mut RawHeapData,
    free_raw: Option<unsafe fn(*mut RawHeapData)>,
    flags: HeapFlags,
    chunk_bits: u32,
    chunk_source: &'static dyn ChunkAllocator,
    mutex_factory: &'static dyn MutexFactory,
    tls_factory: &'static dyn TlsFactory,
) -> MmResult<&'static Heap> {
    if core::mem::size_of::<Heap>() > core::mem::size_of::<RawHeapData>() {
        return Err(MmError::InvalidArg); // raw storage too small
    }
    if chunk_bits < LG_PAGE as u32 + 1 || chunk_bits >= usize::BITS {
        return Err(MmError::InvalidArg);
    }
    let chunk_size = 1usize << chunk_bits;
    let chunk_npages = chunk_size >> LG_PAGE;

    // The map bias depends on its own size; a few fixpoint rounds
    // settle it.
    let mut map_bias = 0usize;
    for _ in 0..3 {
        let header = core::mem::size_of::<ArenaChunkHeader>()
            + (chunk_npages - map_bias) * arena::chunk_map_size();
        map_bias = (header + PAGE - 1) >> LG_PAGE;
    }
    debug_assert!(map_bias > 0 && map_bias < chunk_npages);
    let arena_maxclass = chunk_size - (map_bias << LG_PAGE);

    let heap = Heap {
        flags,
        chunk_bits,
        chunk_size,
        chunk_npages,
        map_bias,
        arena_maxclass,
        chunk_source,
        free_raw,
        base_mtx: mutex_factory.create_mutex()?,
        base: UnsafeCell::new(BaseState::new()),
        chunks_mtx: mutex_factory.create_mutex()?,
        chunks: UnsafeCell::new(ChunkTrees {
            by_size_addr: RbTree::new(),
            by_addr: RbTree::new(),
        }),
        huge_mtx: mutex_factory.create_mutex()?,
        huge: UnsafeCell::new(RbTree::new()),
        rtree_mtx: mutex_factory.create_mutex()?,
        rtree: UnsafeCell::new(MemRtree::empty()),
        arena_mtx: mutex_factory.create_mutex()?,
        arena: UnsafeCell::new(Arena::new()),
        bin_info: bin_info_init(flags.contains(HeapFlags::REDZONE), arena_maxclass),
        tcache_slot: tls_factory.create_slot(0)?,
        tcache_enabled_slot: tls_factory.create_slot(0)?,
        spy: spin::Mutex::new(None),
        dbg: spin::Mutex::new(None),
    };

    let slot = raw as *mut RawHeapData as *mut Heap;
    unsafe { ptr::write(slot, heap) };
    let heap = unsafe { &*slot };

    // The chunk registry covers the address bits above the chunk
    // shift.
    if !heap.rtree_new(usize::BITS - chunk_bits) {
        return Err(MmError::OutOfMemory);
    }
    log::info!(
        "heap online: {} KiB chunks, {} map pages, arena max {} bytes",
        chunk_size >> 10,
        map_bias,
        arena_maxclass
    );
    Ok(heap)
}

impl Heap {
    // -- Notification slots -----------------------------------------------

    /// Install (or clear) the malloc spy. Single slot.
    pub fn set_malloc_spy(&self, spy: Option<&'static dyn MallocSpy>) {
        *self.spy.lock() = spy;
    }

    /// Install (or clear) the debug output stream. Single slot.
    pub fn set_debug_stream(&self, stream: Option<&'static dyn SequentialStream>) {
        *self.dbg.lock() = stream;
    }

    fn spy(&self) -> Option<&'static dyn MallocSpy> {
        *self.spy.lock()
    }

    fn dbg_write(&self, message: &str) {
        if let Some(stream) = *self.dbg.lock() {
            stream.write(message.as_bytes());
        }
    }

    // -- Internal dispatch ------------------------------------------------

    fn alloc_internal(&self, size: usize, zero: bool) -> *mut u8 {
        if size <= SMALL_MAXCLASS {
            let tcache = self.tcache_get(true);
            if !tcache.is_null() {
                unsafe { self.tcache_alloc_small(tcache, size, zero) }
            } else {
                self.arena_malloc_small(size, zero)
            }
        } else if size <= self.arena_maxclass {
            if size <= TCACHE_MAXCLASS {
                let tcache = self.tcache_get(true);
                if !tcache.is_null() {
                    return unsafe { self.tcache_alloc_large(tcache, size, zero) };
                }
            }
            self.arena_malloc_large(size, zero)
        } else {
            self.huge_alloc(size, zero)
        }
    }

    unsafe fn free_internal(&self, ptr_in: *mut u8) {
        let chunk = self.chunk_base(ptr_in);
        if chunk == ptr_in {
            // Only oversize allocations are chunk-aligned.
            self.huge_dalloc(ptr_in);
            return;
        }
        let (large, class) = self.arena_ptr_class(ptr_in);
        if large {
            if class <= TCACHE_MAXCLASS {
                let tcache = self.tcache_get(false);
                if !tcache.is_null() {
                    self.tcache_dalloc_large(tcache, ptr_in, class);
                    return;
                }
            }
            self.arena_dalloc(ptr_in);
        } else {
            let tcache = self.tcache_get(false);
            if !tcache.is_null() {
                self.tcache_dalloc_small(tcache, ptr_in, class);
            } else {
                self.arena_dalloc(ptr_in);
            }
        }
    }

    fn usable_size(&self, ptr_in: *mut u8) -> Option<usize> {
        if ptr_in.is_null() {
            return None;
        }
        let chunk = self.chunk_base(ptr_in);
        if chunk == ptr_in {
            return self.huge_salloc(ptr_in);
        }
        if self.rtree_get(chunk as usize).is_null() {
            return None;
        }
        Some(self.arena_salloc(ptr_in))
    }

    fn write_redzones(&self, region: *mut u8, bin_ndx: usize) {
        let info = &self.bin_info[bin_ndx];
        if info.redzone_size == 0 {
            return;
        }
        unsafe {
            ptr::write_bytes(region.sub(info.redzone_size), REDZONE_BYTE, info.redzone_size);
            ptr::write_bytes(region.add(info.reg_size), REDZONE_BYTE, info.redzone_size);
        }
    }

    fn check_redzones(&self, region: *mut u8, bin_ndx: usize) {
        let info = &self.bin_info[bin_ndx];
        if info.redzone_size == 0 {
            return;
        }
        unsafe {
            let before = core::slice::from_raw_parts(
                region.sub(info.redzone_size),
                info.redzone_size,
            );
            let after =
                core::slice::from_raw_parts(region.add(info.reg_size), info.redzone_size);
            if before.iter().chain(after.iter()).any(|&b| b != REDZONE_BYTE) {
                self.dbg_write("heap: red zone corrupted\n");
                log::error!("red zone corrupted around {region:p}");
            }
        }
    }

    /// Current (small, large) allocated byte counts.
    pub fn allocated(&self) -> (usize, usize) {
        self.arena_allocated()
    }

    /// The chunk-size exponent this heap was created with.
    pub fn chunk_bits(&self) -> u32 {
        self.chunk_bits
    }

    /// Release the heap's raw storage through the creation-time
    /// callback.
    ///
    /// # Safety
    ///
    /// No reference to the heap or memory it served may be used
    /// afterwards.
    pub unsafe fn destroy(&self) {
        self.tcache_flush_current();
        if let Some(free_raw) = self.free_raw {
            free_raw(self as *const Heap as *mut Heap as *mut RawHeapData);
        }
    }
}

unsafe impl Allocator for Heap {
    fn alloc(&self, size: usize) -> *mut u8 {
        let spy = self.spy();
        let mut size = size.max(1);
        if let Some(spy) = spy {
            size = spy.pre_alloc(size).max(1);
        }
        let zero = self.flags.contains(HeapFlags::ZEROFILL);
        let region = self.alloc_internal(size, zero);
        if !region.is_null() {
            if self.flags.contains(HeapFlags::JUNKFILL) && !zero {
                if let Some(usable) = self.usable_size(region) {
                    unsafe { ptr::write_bytes(region, JUNK_ALLOC, usable) };
                }
            }
            if self.flags.contains(HeapFlags::REDZONE) {
                if let Some(bin_ndx) = size2bin(size) {
                    self.write_redzones(region, bin_ndx);
                }
            }
            if self.flags.contains(HeapFlags::PROFILE) && self.arena_prof_accum(size) {
                log::trace!("heap profile interval crossed");
            }
        }
        if let Some(spy) = spy {
            spy.post_alloc(region);
        }
        region
    }

    unsafe fn realloc(&self, ptr_in: *mut u8, size: usize) -> *mut u8 {
        if ptr_in.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(ptr_in);
            return ptr::null_mut();
        }
        let spy = self.spy();
        let mut size = size;
        if let Some(spy) = spy {
            size = spy.pre_realloc(ptr_in, size).max(1);
        }

        let Some(old_usable) = self.usable_size(ptr_in) else {
            return ptr::null_mut(); // not our pointer
        };

        // In-place when the size class does not change.
        let same_class = if size <= SMALL_MAXCLASS {
            old_usable <= SMALL_MAXCLASS && size2bin(size) == size2bin(old_usable)
        } else if size <= self.arena_maxclass {
            old_usable > SMALL_MAXCLASS
                && (size + PAGE - 1) & !(PAGE - 1) == old_usable
        } else {
            self.chunk_ceiling(size) == old_usable && old_usable > self.arena_maxclass
        };
        let out = if same_class {
            ptr_in
        } else {
            let fresh = self.alloc_internal(size, self.flags.contains(HeapFlags::ZEROFILL));
            if fresh.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(ptr_in, fresh, old_usable.min(size));
            self.free_internal(ptr_in);
            fresh
        };
        if let Some(spy) = spy {
            spy.post_realloc(out);
        }
        out
    }

    unsafe fn free(&self, ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }
        let spy = self.spy();
        if let Some(spy) = spy {
            spy.pre_free(ptr_in);
        }
        if self.flags.contains(HeapFlags::REDZONE)
            && self.chunk_base(ptr_in) != ptr_in
        {
            let (large, class) = self.arena_ptr_class(ptr_in);
            if !large {
                self.check_redzones(ptr_in, class);
            }
        }
        if self.flags.contains(HeapFlags::JUNKFILL) {
            if let Some(usable) = self.usable_size(ptr_in) {
                ptr::write_bytes(ptr_in, JUNK_FREE, usable);
            }
        }
        self.free_internal(ptr_in);
        if let Some(spy) = spy {
            spy.post_free();
        }
    }

    fn size(&self, ptr_in: *mut u8) -> usize {
        self.usable_size(ptr_in).unwrap_or(usize::MAX)
    }

    fn did_alloc(&self, ptr_in: *mut u8) -> DidAlloc {
        if ptr_in.is_null() {
            return DidAlloc::Unknown;
        }
        if self.rtree_get(self.chunk_base(ptr_in) as usize).is_null() {
            DidAlloc::No
        } else {
            DidAlloc::Yes
        }
    }

    fn heap_minimize(&self) {
        self.tcache_flush_current();
        self.arena_purge();
    }
}

#[cfg(test)]
mod tests {
    use super::api::{PoolMutex, SharedSlot, SpinMutexFactory, SharedSlotFactory, STD_CHUNK_BITS};
    use super::*;
    use crate::status::{MmResult, Zeroing};
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Host-side chunk source over the system allocator.
    struct HostChunkSource {
        outstanding: AtomicUsize,
    }

    impl HostChunkSource {
        const fn new() -> HostChunkSource {
            HostChunkSource {
                outstanding: AtomicUsize::new(0),
            }
        }
    }

    impl ChunkAllocator for HostChunkSource {
        fn alloc_chunk(&self, size: usize, align: usize) -> MmResult<(NonNull<u8>, Zeroing)> {
            let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { std::alloc::alloc(layout) };
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            NonNull::new(ptr)
                .map(|p| (p, Zeroing::NonZeroed))
                .ok_or(MmError::OutOfMemory)
        }

        fn purge_unused(&self, _ptr: NonNull<u8>, _size: usize) -> MmResult<Zeroing> {
            // Recycled chunks stay mapped; nothing to decommit on the
            // host either.
            Ok(Zeroing::NonZeroed)
        }
    }

    fn make_heap(flags: HeapFlags) -> &'static Heap {
        let raw: &'static mut RawHeapData = Box::leak(Box::new(RawHeapData::new()));
        let source: &'static HostChunkSource = Box::leak(Box::new(HostChunkSource::new()));
        let mutexes: &'static [PoolMutex] =
            Box::leak((0..16).map(|_| PoolMutex::new()).collect::<Vec<_>>().into());
        let factory: &'static SpinMutexFactory =
            Box::leak(Box::new(SpinMutexFactory::new(mutexes)));
        let slots: &'static [SharedSlot] =
            Box::leak((0..4).map(|_| SharedSlot::new()).collect::<Vec<_>>().into());
        let tls: &'static SharedSlotFactory =
            Box::leak(Box::new(SharedSlotFactory::new(slots)));
        heap_create(raw, None, flags, STD_CHUNK_BITS, source, factory, tls).expect("heap")
    }

    #[test]
    fn small_allocations_round_trip() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let p1 = heap.alloc(40);
        let p2 = heap.alloc(40);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(heap.size(p1), 40); // 40 is exactly a class size
        unsafe {
            core::ptr::write_bytes(p1, 0xCD, 40);
            heap.free(p1);
            heap.free(p2);
        }
        assert_eq!(heap.allocated(), (0, 0));
    }

    #[test]
    fn freed_small_slot_is_reused_lifo_lowest() {
        // The literal heap scenario: with red zones off and the cache
        // off, the freed region is the next one handed out.
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let p1 = heap.alloc(40);
        let p2 = heap.alloc(40);
        unsafe { heap.free(p1) };
        let p3 = heap.alloc(40);
        assert_eq!(p3, p1);
        assert_eq!(heap.did_alloc(p2), DidAlloc::Yes);
        assert_eq!(
            heap.did_alloc(0xDEAD_BEEFusize as *mut u8),
            DidAlloc::No
        );
    }

    #[test]
    fn large_allocations_are_page_runs() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let p = heap.alloc(5 * 4096 - 100);
        assert!(!p.is_null());
        assert_eq!(p as usize & 0xFFF, 0);
        assert_eq!(heap.size(p), 5 * 4096);
        unsafe { heap.free(p) };
        assert_eq!(heap.allocated(), (0, 0));
    }

    #[test]
    fn oversize_allocations_bypass_the_arena() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let big = heap.alloc(5 << 20); // bigger than one 4 MiB chunk
        assert!(!big.is_null());
        assert_eq!(heap.chunk_base(big), big);
        assert_eq!(heap.size(big), heap.chunk_ceiling(5 << 20));
        assert_eq!(heap.did_alloc(big), DidAlloc::Yes);
        unsafe { heap.free(big) };
        assert_eq!(heap.did_alloc(big), DidAlloc::No);
    }

    #[test]
    fn small_free_restores_bitmap_state() {
        // Allocate and free a region; the next allocation of the same
        // class must land at the identical spot, which only happens if
        // the bitmap and page map returned to their prior state.
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let probe = heap.alloc(96);
        unsafe { heap.free(probe) };
        for _ in 0..4 {
            let p = heap.alloc(96);
            assert_eq!(p, probe);
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn realloc_contract() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        // Null in: allocation.
        let p = unsafe { heap.realloc(ptr::null_mut(), 100) };
        assert!(!p.is_null());
        // Same class: in place.
        let q = unsafe { heap.realloc(p, 112) };
        assert_eq!(q, p);
        // Class change: moves and preserves contents.
        unsafe { core::ptr::write_bytes(q, 0x3C, 112) };
        let r = unsafe { heap.realloc(q, 4000) };
        assert_ne!(r, q);
        unsafe {
            assert_eq!(*r, 0x3C);
            assert_eq!(*r.add(111), 0x3C);
        }
        // Zero size: free.
        let end = unsafe { heap.realloc(r, 0) };
        assert!(end.is_null());
        assert_eq!(heap.allocated(), (0, 0));
    }

    #[test]
    fn zero_fill_flag_zeroes_everything() {
        let heap = make_heap(HeapFlags::ZEROFILL | HeapFlags::NO_TCACHE);
        for &size in &[24usize, 1024, 8192] {
            let p = heap.alloc(size);
            let all_zero =
                unsafe { core::slice::from_raw_parts(p, size) }.iter().all(|&b| b == 0);
            assert!(all_zero, "size {size}");
            // Dirty it and free; a fresh allocation must be zero
            // again even though the region is recycled.
            unsafe {
                core::ptr::write_bytes(p, 0xFF, size);
                heap.free(p);
            }
            let p2 = heap.alloc(size);
            let all_zero =
                unsafe { core::slice::from_raw_parts(p2, size) }.iter().all(|&b| b == 0);
            assert!(all_zero, "recycled size {size}");
            unsafe { heap.free(p2) };
        }
    }

    #[test]
    fn junk_fill_marks_allocations() {
        let heap = make_heap(HeapFlags::JUNKFILL | HeapFlags::NO_TCACHE);
        let p = heap.alloc(64);
        let junked = unsafe { core::slice::from_raw_parts(p, 64) }
            .iter()
            .all(|&b| b == JUNK_ALLOC);
        assert!(junked);
        unsafe { heap.free(p) };
    }

    #[test]
    fn redzones_survive_normal_use() {
        let heap = make_heap(HeapFlags::REDZONE | HeapFlags::NO_TCACHE);
        let p = heap.alloc(48);
        unsafe {
            core::ptr::write_bytes(p, 0x11, 48);
            heap.free(p);
        }
        let q = heap.alloc(48);
        assert_eq!(q, p);
        unsafe { heap.free(q) };
    }

    #[test]
    fn thread_cache_serves_and_flushes() {
        let heap = make_heap(HeapFlags::empty());
        // Prime the cache.
        let p1 = heap.alloc(40);
        unsafe { heap.free(p1) };
        // The cached region comes straight back.
        let p2 = heap.alloc(40);
        assert_eq!(p2, p1);
        unsafe { heap.free(p2) };
        // Flush drains the magazines back to the arena.
        heap.tcache_flush_current();
        assert_eq!(heap.allocated(), (0, 0));
    }

    #[test]
    fn tcache_disable_falls_back_to_arena() {
        let heap = make_heap(HeapFlags::empty());
        heap.tcache_set_enabled(false);
        let p = heap.alloc(40);
        unsafe { heap.free(p) };
        assert_eq!(heap.allocated(), (0, 0));
        heap.tcache_set_enabled(true);
    }

    #[test]
    fn chunk_recycling_reuses_released_chunks() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let big = heap.alloc(heap.chunk_size);
        let base = big;
        unsafe { heap.free(big) };
        // The freed chunk sits in the extent trees; an identical
        // request must come back out of them.
        let again = heap.alloc(heap.chunk_size);
        assert_eq!(again, base);
        unsafe { heap.free(again) };
    }

    #[test]
    fn malloc_spy_sees_calls() {
        struct CountingSpy {
            allocs: AtomicUsize,
            frees: AtomicUsize,
        }
        impl MallocSpy for CountingSpy {
            fn pre_alloc(&self, size: usize) -> usize {
                self.allocs.fetch_add(1, Ordering::Relaxed);
                size
            }
            fn pre_free(&self, _ptr: *mut u8) {
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
        }
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let spy: &'static CountingSpy = Box::leak(Box::new(CountingSpy {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }));
        heap.set_malloc_spy(Some(spy));
        let p = heap.alloc(100);
        unsafe { heap.free(p) };
        heap.set_malloc_spy(None);
        assert_eq!(spy.allocs.load(Ordering::Relaxed), 1);
        assert_eq!(spy.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn debug_stream_receives_diagnostics() {
        struct Sink {
            bytes: AtomicUsize,
        }
        impl SequentialStream for Sink {
            fn write(&self, buf: &[u8]) -> usize {
                self.bytes.fetch_add(buf.len(), Ordering::Relaxed);
                buf.len()
            }
        }
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let sink: &'static Sink = Box::leak(Box::new(Sink {
            bytes: AtomicUsize::new(0),
        }));
        heap.set_debug_stream(Some(sink));
        heap.dbg_write("hello\n");
        assert_eq!(sink.bytes.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn heap_minimize_is_safe_anytime() {
        let heap = make_heap(HeapFlags::empty());
        let p = heap.alloc(10000);
        heap.heap_minimize();
        unsafe { heap.free(p) };
        heap.heap_minimize();
        assert_eq!(heap.allocated(), (0, 0));
    }

    #[test]
    fn size_of_foreign_pointer_is_max() {
        let heap = make_heap(HeapFlags::NO_TCACHE);
        let mut local = 0u64;
        assert_eq!(heap.size(&mut local as *mut u64 as *mut u8), usize::MAX);
        assert_eq!(heap.size(ptr::null_mut()), usize::MAX);
    }
}
