//! Arena layer: runs, bins and per-page chunk maps.
//!
//! An arena chunk starts with a header and a map entry per usable
//! page; the first pages of the chunk are consumed by that header (the
//! map bias). Pages are grouped into runs: a large allocation is one
//! run handed straight to the caller, while a small run is subdivided
//! into equal regions of one size class and tracked by an inverted
//! bitmap in its header.
//!
//! Map-bit encoding per page (low bits):
//!
//! ```text
//! unallocated: | run size | bin:0xFF | D | U | 0 | 0 |
//! large:       | run size | bin:0xFF | D | U | 1 | 1 |
//! small:       | ndx in run << 12 | bin | 0 | U | 0 | 1 |
//! ```
//!
//! where D = dirty, U = unzeroed. Run size appears on the first and
//! last page of an unallocated run so both coalescing directions can
//! find the run head without scanning.

use core::cmp::Ordering;
use core::ptr;

use super::api::MutexGuard;
use super::bitmap::{self, BitmapInfo};
use super::size_classes::{bin2size, size2bin, SIZE_CLASSES, NBINS};
use super::Heap;
use crate::collections::rbtree::{RbAdapter, RbNode, RbTree};

pub(super) const LG_PAGE: usize = 12;
pub(super) const PAGE: usize = 1 << LG_PAGE;
const PAGE_MASK: usize = PAGE - 1;

// Map bits.
pub(super) const CHUNK_MAP_ALLOCATED: usize = 0x1;
pub(super) const CHUNK_MAP_LARGE: usize = 0x2;
pub(super) const CHUNK_MAP_UNZEROED: usize = 0x4;
pub(super) const CHUNK_MAP_DIRTY: usize = 0x8;
const CHUNK_MAP_BININD_SHIFT: usize = 4;
const CHUNK_MAP_BININD_MASK: usize = 0xFF << CHUNK_MAP_BININD_SHIFT;
pub(super) const BININD_INVALID: usize = 0xFF;
const CHUNK_MAP_SIZE_MASK: usize = !(PAGE_MASK);

// Run-overhead tuning, binary fixed point.
const RUN_BFP: usize = 12;
const RUN_MAX_OVRHD: usize = 0x3D;
const RUN_MAX_OVRHD_RELAX: usize = 0x1800;
pub(super) const LG_RUN_MAXREGS: usize = 11;
pub(super) const RUN_MAXREGS: usize = 1 << LG_RUN_MAXREGS;
const REDZONE_MINSIZE: usize = 16;

/// One map element: the page's encoding word plus the tree hook used
/// while the page heads an unallocated run (runs-avail tree) or a
/// nonfull small run (its bin's tree) — never both at once.
#[repr(C)]
pub(super) struct ChunkMap {
    link: RbNode,
    pub(super) bits: usize,
}

/// Arena chunk header; the page map follows immediately.
#[repr(C)]
pub(super) struct ArenaChunkHeader {
    next: *mut ArenaChunkHeader,
    ndirty: usize,
}

/// Bytes per page-map element (the chunk-header sizing needs it).
pub(super) const fn chunk_map_size() -> usize {
    core::mem::size_of::<ChunkMap>()
}

/// Header of a small run; the region bitmap sits at the bin's bitmap
/// offset and region 0 at its region-0 offset.
#[repr(C)]
pub(super) struct ArenaRun {
    bin_ndx: u32,
    nfree: u32,
}

/// Per-bin geometry, computed once at heap creation.
#[derive(Debug, Clone, Copy)]
pub struct BinInfo {
    pub reg_size: usize,
    pub redzone_size: usize,
    pub reg_interval: usize,
    pub run_size: usize,
    pub nregs: u32,
    pub bitmap_info: BitmapInfo,
    pub bitmap_offset: usize,
    pub reg0_offset: usize,
}

pub(super) struct ArenaBin {
    runcur: *mut ArenaRun,
    runs: RbTree<RunAdapter>,
    pub(super) nmalloc: u64,
    pub(super) ndalloc: u64,
}

impl ArenaBin {
    const fn new() -> ArenaBin {
        ArenaBin {
            runcur: ptr::null_mut(),
            runs: RbTree::new(),
            nmalloc: 0,
            ndalloc: 0,
        }
    }
}

pub(super) struct Arena {
    chunks: *mut ArenaChunkHeader,
    spare: *mut ArenaChunkHeader,
    runs_avail: RbTree<AvailAdapter>,
    bins: [ArenaBin; NBINS],
    nactive_pages: usize,
    ndirty_pages: usize,
    pub(super) prof_accum: u64,
    pub(super) allocated_small: usize,
    pub(super) allocated_large: usize,
}

impl Arena {
    pub(super) const fn new() -> Arena {
        const BIN: ArenaBin = ArenaBin::new();
        Arena {
            chunks: ptr::null_mut(),
            spare: ptr::null_mut(),
            runs_avail: RbTree::new(),
            bins: [BIN; NBINS],
            nactive_pages: 0,
            ndirty_pages: 0,
            prof_accum: 0,
            allocated_small: 0,
            allocated_large: 0,
        }
    }
}

/// Unallocated runs, best-fit by (size, mapelm address).
pub(super) struct AvailAdapter;

unsafe impl RbAdapter for AvailAdapter {
    type Item = ChunkMap;
    type Key = (usize, usize);

    unsafe fn node_of(item: *mut ChunkMap) -> *mut RbNode {
        ptr::addr_of_mut!((*item).link)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut ChunkMap {
        (node as *mut u8).sub(core::mem::offset_of!(ChunkMap, link)) as *mut ChunkMap
    }
    unsafe fn key_of(item: *const ChunkMap) -> (usize, usize) {
        ((*item).bits & CHUNK_MAP_SIZE_MASK, item as usize)
    }
    fn compare(probe: &(usize, usize), item: &(usize, usize)) -> Ordering {
        probe.0.cmp(&item.0).then(probe.1.cmp(&item.1))
    }
}

/// Nonfull small runs of one bin, by mapelm address.
pub(super) struct RunAdapter;

unsafe impl RbAdapter for RunAdapter {
    type Item = ChunkMap;
    type Key = usize;

    unsafe fn node_of(item: *mut ChunkMap) -> *mut RbNode {
        ptr::addr_of_mut!((*item).link)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut ChunkMap {
        (node as *mut u8).sub(core::mem::offset_of!(ChunkMap, link)) as *mut ChunkMap
    }
    unsafe fn key_of(item: *const ChunkMap) -> usize {
        item as usize
    }
    fn compare(probe: &usize, item: &usize) -> Ordering {
        probe.cmp(item)
    }
}

// ---------------------------------------------------------------------------
// Bin geometry
// ---------------------------------------------------------------------------

const fn usize_ceiling(size: usize) -> usize {
    let align = core::mem::size_of::<usize>();
    (size + align - 1) & !(align - 1)
}

/// Compute a bin's run size: start from one page and grow while the
/// header-plus-padding overhead fraction stays above the tunable
/// ceiling, the relaxation ceiling allows it, and the region count is
/// below the hardware cap.
fn run_size_calc(info: &mut BinInfo, min_run: usize, redzone: bool, max_run: usize) -> usize {
    debug_assert!(min_run >= PAGE);
    debug_assert!(min_run <= max_run);

    let pad;
    if redzone {
        // Red-zone size follows the region's natural alignment.
        let align_min = 1usize << info.reg_size.trailing_zeros();
        if align_min <= REDZONE_MINSIZE {
            info.redzone_size = REDZONE_MINSIZE;
            pad = 0;
        } else {
            info.redzone_size = align_min >> 1;
            pad = info.redzone_size;
        }
    } else {
        info.redzone_size = 0;
        pad = 0;
    }
    info.reg_interval = info.reg_size + (info.redzone_size << 1);

    struct Trial {
        run_size: usize,
        nregs: usize,
        header: usize,
        bitmap_offset: usize,
        reg0_back: usize,
    }

    let fit = |run_size: usize| -> Trial {
        let mut nregs =
            (run_size - core::mem::size_of::<ArenaRun>() - pad) / info.reg_interval + 1;
        if nregs > RUN_MAXREGS {
            nregs = RUN_MAXREGS + 1;
        }
        loop {
            nregs -= 1;
            let mut header = usize_ceiling(core::mem::size_of::<ArenaRun>());
            let bitmap_offset = header;
            header += bitmap::bitmap_size(nregs);
            let reg0_back = run_size - nregs * info.reg_interval - pad;
            if header <= reg0_back {
                return Trial {
                    run_size,
                    nregs,
                    header,
                    bitmap_offset,
                    reg0_back,
                };
            }
        }
    };

    let mut good = fit(min_run);
    loop {
        let try_size = good.run_size + PAGE;
        if try_size > max_run {
            break;
        }
        let trial = fit(try_size);
        let keep_growing = RUN_MAX_OVRHD * (info.reg_interval << 3) > RUN_MAX_OVRHD_RELAX
            && (trial.reg0_back << RUN_BFP) > RUN_MAX_OVRHD * trial.run_size
            && trial.nregs < RUN_MAXREGS;
        if !keep_growing {
            break;
        }
        good = trial;
    }
    debug_assert!(good.header <= good.reg0_back);

    info.run_size = good.run_size;
    info.nregs = good.nregs as u32;
    info.bitmap_offset = good.bitmap_offset;
    info.reg0_offset = good.reg0_back + info.redzone_size;
    debug_assert_eq!(
        info.reg0_offset - info.redzone_size + good.nregs * info.reg_interval + pad,
        info.run_size
    );
    info.run_size
}

/// Build the per-bin geometry table.
pub(super) fn bin_info_init(redzone: bool, max_run: usize) -> [BinInfo; NBINS] {
    let mut table = [BinInfo {
        reg_size: 0,
        redzone_size: 0,
        reg_interval: 0,
        run_size: 0,
        nregs: 0,
        bitmap_info: BitmapInfo::new(1),
        bitmap_offset: 0,
        reg0_offset: 0,
    }; NBINS];

    let mut prev_run = PAGE;
    for class in SIZE_CLASSES {
        let info = &mut table[class.bin];
        info.reg_size = class.size;
        prev_run = run_size_calc(info, prev_run, redzone, max_run);
        info.bitmap_info = BitmapInfo::new(info.nregs as usize);
    }
    table
}

// ---------------------------------------------------------------------------
// Map access
// ---------------------------------------------------------------------------

impl Heap {
    pub(super) unsafe fn chunk_map_ptr(
        &self,
        chunk: *mut ArenaChunkHeader,
        page: usize,
    ) -> *mut ChunkMap {
        debug_assert!(page >= self.map_bias && page < self.chunk_npages);
        let maps =
            (chunk as *mut u8).add(core::mem::size_of::<ArenaChunkHeader>()) as *mut ChunkMap;
        maps.add(page - self.map_bias)
    }

    unsafe fn mapelm_to_page(&self, chunk: *mut ArenaChunkHeader, mapelm: *mut ChunkMap) -> usize {
        let maps =
            (chunk as *mut u8).add(core::mem::size_of::<ArenaChunkHeader>()) as *mut ChunkMap;
        mapelm.offset_from(maps) as usize + self.map_bias
    }

    unsafe fn run_addr(&self, chunk: *mut ArenaChunkHeader, page: usize) -> *mut u8 {
        (chunk as *mut u8).add(page << LG_PAGE)
    }

    // -- Chunk management under the arena lock ----------------------------

    unsafe fn arena_chunk_alloc_locked(&self, arena: &mut Arena) -> *mut ArenaChunkHeader {
        let usable_size = (self.chunk_npages - self.map_bias) << LG_PAGE;

        if !arena.spare.is_null() {
            // The spare kept its map (and its dirty pages); its one
            // big run just needs to rejoin the runs-avail tree.
            let chunk = arena.spare;
            arena.spare = ptr::null_mut();
            (*chunk).next = arena.chunks;
            arena.chunks = chunk;
            arena.ndirty_pages += (*chunk).ndirty;
            arena.runs_avail.insert(self.chunk_map_ptr(chunk, self.map_bias));
            return chunk;
        }

        let mut zeroed = false;
        let chunk =
            self.chunk_alloc(self.chunk_size, self.chunk_size, false, &mut zeroed)
                as *mut ArenaChunkHeader;
        if chunk.is_null() {
            return ptr::null_mut();
        }
        (*chunk).next = arena.chunks;
        (*chunk).ndirty = 0;
        arena.chunks = chunk;

        let unzeroed = if zeroed { 0 } else { CHUNK_MAP_UNZEROED };
        for page in self.map_bias..self.chunk_npages {
            let bits = if page == self.map_bias || page == self.chunk_npages - 1 {
                usable_size | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT) | unzeroed
            } else {
                (BININD_INVALID << CHUNK_MAP_BININD_SHIFT) | unzeroed
            };
            ptr::write(
                self.chunk_map_ptr(chunk, page),
                ChunkMap {
                    link: RbNode::new(),
                    bits,
                },
            );
        }
        arena.runs_avail.insert(self.chunk_map_ptr(chunk, self.map_bias));
        chunk
    }

    unsafe fn arena_chunk_retire_locked(&self, arena: &mut Arena, chunk: *mut ArenaChunkHeader) {
        // Unlink from the resident list. The chunk keeps its own
        // dirty count while it sits as the spare.
        let mut cursor = &mut arena.chunks;
        while !(*cursor).is_null() {
            if *cursor == chunk {
                *cursor = (*chunk).next;
                break;
            }
            cursor = &mut (**cursor).next;
        }
        arena.ndirty_pages -= (*chunk).ndirty;

        if arena.spare.is_null() {
            arena.spare = chunk;
        } else {
            // Keep the newest chunk warm and retire the older spare.
            let old = core::mem::replace(&mut arena.spare, chunk);
            self.chunk_dealloc(old as *mut u8, self.chunk_size, true);
        }
    }

    // -- Runs -------------------------------------------------------------

    /// Carve a run of `size` bytes out of the arena. Returns the run
    /// address, or null when no chunk can be found.
    unsafe fn arena_run_alloc_locked(
        &self,
        arena: &mut Arena,
        size: usize,
        large: bool,
        bin_ndx: usize,
        zero: bool,
    ) -> *mut u8 {
        debug_assert!(size & PAGE_MASK == 0);
        debug_assert!(size <= self.arena_maxclass);

        let mut mapelm = arena.runs_avail.ceiling(&(size, 0));
        if mapelm.is_null() {
            if self.arena_chunk_alloc_locked(arena).is_null() {
                return ptr::null_mut();
            }
            mapelm = arena.runs_avail.ceiling(&(size, 0));
            debug_assert!(!mapelm.is_null());
        }

        let chunk = self.chunk_base(mapelm as *mut u8) as *mut ArenaChunkHeader;
        let run_page = self.mapelm_to_page(chunk, mapelm);
        let total = (*mapelm).bits & CHUNK_MAP_SIZE_MASK;
        let need_pages = size >> LG_PAGE;
        debug_assert!(total >= size);

        let key = ((*mapelm).bits & CHUNK_MAP_SIZE_MASK, mapelm as usize);
        arena.runs_avail.delete(&key);

        // Give back the remainder as a smaller unallocated run.
        let remainder = total - size;
        if remainder > 0 {
            let rem_page = run_page + need_pages;
            let rem_head = self.chunk_map_ptr(chunk, rem_page);
            (*rem_head).bits = remainder
                | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
                | ((*rem_head).bits & (CHUNK_MAP_UNZEROED | CHUNK_MAP_DIRTY));
            let rem_last = self.chunk_map_ptr(chunk, rem_page + (remainder >> LG_PAGE) - 1);
            (*rem_last).bits = remainder
                | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
                | ((*rem_last).bits & (CHUNK_MAP_UNZEROED | CHUNK_MAP_DIRTY));
            arena.runs_avail.insert(rem_head);
        }

        // Stamp the allocated pages.
        for i in 0..need_pages {
            let m = self.chunk_map_ptr(chunk, run_page + i);
            let old = (*m).bits;
            if old & CHUNK_MAP_DIRTY != 0 {
                (*chunk).ndirty -= 1;
                arena.ndirty_pages -= 1;
            }
            let unzeroed = old & CHUNK_MAP_UNZEROED;
            (*m).bits = if large {
                let size_bits = if i == 0 { size } else { 0 };
                size_bits
                    | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
                    | unzeroed
                    | CHUNK_MAP_LARGE
                    | CHUNK_MAP_ALLOCATED
            } else {
                (i << LG_PAGE)
                    | (bin_ndx << CHUNK_MAP_BININD_SHIFT)
                    | unzeroed
                    | CHUNK_MAP_ALLOCATED
            };
        }
        arena.nactive_pages += need_pages;

        let run = self.run_addr(chunk, run_page);
        if zero {
            ptr::write_bytes(run, 0, size);
            for i in 0..need_pages {
                (*self.chunk_map_ptr(chunk, run_page + i)).bits &= !CHUNK_MAP_UNZEROED;
            }
        }
        run
    }

    /// Return a run's pages to the unallocated state, coalescing with
    /// free neighbors.
    unsafe fn arena_run_dalloc_locked(&self, arena: &mut Arena, run: *mut u8, size: usize) {
        let chunk = self.chunk_base(run) as *mut ArenaChunkHeader;
        let mut run_page = (run as usize - chunk as usize) >> LG_PAGE;
        let mut total = size;
        let need_pages = size >> LG_PAGE;
        arena.nactive_pages -= need_pages;

        // Freed pages are dirty (their contents are stale) and no
        // longer known zeroed.
        for i in 0..need_pages {
            let m = self.chunk_map_ptr(chunk, run_page + i);
            (*m).bits = (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
                | CHUNK_MAP_DIRTY
                | CHUNK_MAP_UNZEROED;
            (*chunk).ndirty += 1;
            arena.ndirty_pages += 1;
        }

        // Coalesce forward.
        let next_page = run_page + need_pages;
        if next_page < self.chunk_npages {
            let next = self.chunk_map_ptr(chunk, next_page);
            if (*next).bits & CHUNK_MAP_ALLOCATED == 0 {
                let next_size = (*next).bits & CHUNK_MAP_SIZE_MASK;
                let key = (next_size, next as usize);
                arena.runs_avail.delete(&key);
                total += next_size;
            }
        }
        // Coalesce backward.
        if run_page > self.map_bias {
            let prev_last = self.chunk_map_ptr(chunk, run_page - 1);
            if (*prev_last).bits & CHUNK_MAP_ALLOCATED == 0 {
                let prev_size = (*prev_last).bits & CHUNK_MAP_SIZE_MASK;
                let prev_page = run_page - (prev_size >> LG_PAGE);
                let prev_head = self.chunk_map_ptr(chunk, prev_page);
                let key = ((*prev_head).bits & CHUNK_MAP_SIZE_MASK, prev_head as usize);
                arena.runs_avail.delete(&key);
                run_page = prev_page;
                total += prev_size;
            }
        }

        // Stamp the merged run's head and tail sizes and park it.
        let head = self.chunk_map_ptr(chunk, run_page);
        (*head).bits = total
            | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
            | ((*head).bits & (CHUNK_MAP_UNZEROED | CHUNK_MAP_DIRTY));
        let tail = self.chunk_map_ptr(chunk, run_page + (total >> LG_PAGE) - 1);
        (*tail).bits = total
            | (BININD_INVALID << CHUNK_MAP_BININD_SHIFT)
            | ((*tail).bits & (CHUNK_MAP_UNZEROED | CHUNK_MAP_DIRTY));
        arena.runs_avail.insert(head);

        // A fully free chunk retires (one spare is kept warm).
        let usable_size = (self.chunk_npages - self.map_bias) << LG_PAGE;
        if total == usable_size {
            let key = (total, head as usize);
            arena.runs_avail.delete(&key);
            self.arena_chunk_retire_locked(arena, chunk);
        }
    }

    // -- Small allocation -------------------------------------------------

    unsafe fn arena_bin_nonfull_run_get(
        &self,
        arena: &mut Arena,
        bin_ndx: usize,
    ) -> *mut ArenaRun {
        // Lowest-address nonfull run first.
        let mapelm = arena.bins[bin_ndx].runs.find_min();
        if !mapelm.is_null() {
            let key = mapelm as usize;
            arena.bins[bin_ndx].runs.delete(&key);
            let chunk = self.chunk_base(mapelm as *mut u8) as *mut ArenaChunkHeader;
            let page = self.mapelm_to_page(chunk, mapelm);
            return self.run_addr(chunk, page) as *mut ArenaRun;
        }

        // Carve a fresh run for this bin.
        let info = &self.bin_info[bin_ndx];
        let run =
            self.arena_run_alloc_locked(arena, info.run_size, false, bin_ndx, false);
        if run.is_null() {
            return ptr::null_mut();
        }
        let header = run as *mut ArenaRun;
        (*header).bin_ndx = bin_ndx as u32;
        (*header).nfree = info.nregs;
        bitmap::init(run.add(info.bitmap_offset) as *mut u32, &info.bitmap_info);
        header
    }

    pub(super) fn arena_malloc_small(&self, size: usize, zero: bool) -> *mut u8 {
        let bin_ndx = match size2bin(size) {
            Some(b) => b,
            None => return ptr::null_mut(),
        };
        let info = self.bin_info[bin_ndx];

        let region = {
            let _guard = MutexGuard::lock(self.arena_mtx);
            unsafe {
                let arena = &mut *self.arena.get();
                let mut run = arena.bins[bin_ndx].runcur;
                if run.is_null() || (*run).nfree == 0 {
                    run = self.arena_bin_nonfull_run_get(arena, bin_ndx);
                    arena.bins[bin_ndx].runcur = run;
                }
                if run.is_null() {
                    return ptr::null_mut();
                }

                let base = run as *mut u8;
                let bitmap = base.add(info.bitmap_offset) as *mut u32;
                let reg_ndx = bitmap::set_first_unset(bitmap, &info.bitmap_info);
                (*run).nfree -= 1;
                if (*run).nfree == 0 {
                    // Full runs are untracked until a free revives
                    // them.
                    arena.bins[bin_ndx].runcur = ptr::null_mut();
                }
                arena.bins[bin_ndx].nmalloc += 1;
                arena.allocated_small += info.reg_size;
                base.add(info.reg0_offset + reg_ndx * info.reg_interval)
            }
        };
        if zero {
            unsafe { ptr::write_bytes(region, 0, info.reg_size) };
        }
        region
    }

    pub(super) unsafe fn arena_dalloc_small(
        &self,
        arena: &mut Arena,
        chunk: *mut ArenaChunkHeader,
        ptr_in: *mut u8,
        page: usize,
    ) {
        let mapbits = (*self.chunk_map_ptr(chunk, page)).bits;
        let run_page = page - (mapbits >> LG_PAGE);
        let run = self.run_addr(chunk, run_page) as *mut ArenaRun;
        let bin_ndx = (mapbits & CHUNK_MAP_BININD_MASK) >> CHUNK_MAP_BININD_SHIFT;
        debug_assert!(bin_ndx < NBINS);
        debug_assert_eq!((*run).bin_ndx as usize, bin_ndx);
        let info = &self.bin_info[bin_ndx];

        let base = run as *mut u8;
        let reg0 = base.add(info.reg0_offset);
        debug_assert!(ptr_in >= reg0);
        let reg_ndx = (ptr_in.offset_from(reg0) as usize) / info.reg_interval;
        debug_assert!(reg_ndx < info.nregs as usize);

        bitmap::unset(
            base.add(info.bitmap_offset) as *mut u32,
            &info.bitmap_info,
            reg_ndx,
        );
        (*run).nfree += 1;
        arena.bins[bin_ndx].ndalloc += 1;
        arena.allocated_small -= info.reg_size;

        let run_head = self.chunk_map_ptr(chunk, run_page);
        if (*run).nfree == 1 && run != arena.bins[bin_ndx].runcur {
            // Full → nonfull: the run becomes allocatable again.
            arena.bins[bin_ndx].runs.insert(run_head);
        } else if (*run).nfree == info.nregs {
            // Nonfull → empty: give the pages back.
            if run == arena.bins[bin_ndx].runcur {
                arena.bins[bin_ndx].runcur = ptr::null_mut();
            } else {
                let key = run_head as usize;
                arena.bins[bin_ndx].runs.delete(&key);
            }
            self.arena_run_dalloc_locked(arena, base, info.run_size);
        }
    }

    // -- Large allocation -------------------------------------------------

    pub(super) fn arena_malloc_large(&self, size: usize, zero: bool) -> *mut u8 {
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &mut *self.arena.get();
            let run = self.arena_run_alloc_locked(arena, size, true, BININD_INVALID, zero);
            if !run.is_null() {
                arena.allocated_large += size;
            }
            run
        }
    }

    pub(super) unsafe fn arena_dalloc_large(
        &self,
        arena: &mut Arena,
        chunk: *mut ArenaChunkHeader,
        page: usize,
    ) {
        let mapbits = (*self.chunk_map_ptr(chunk, page)).bits;
        debug_assert!(mapbits & CHUNK_MAP_LARGE != 0);
        let size = mapbits & CHUNK_MAP_SIZE_MASK;
        debug_assert!(size > 0, "free of a large-run interior pointer");
        arena.allocated_large -= size;
        self.arena_run_dalloc_locked(arena, self.run_addr(chunk, page), size);
    }

    // -- Entry points -----------------------------------------------------

    /// Free an arena pointer (small region or large run).
    pub(super) fn arena_dalloc(&self, ptr_in: *mut u8) {
        let chunk = self.chunk_base(ptr_in) as *mut ArenaChunkHeader;
        let page = (ptr_in as usize - chunk as usize) >> LG_PAGE;
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &mut *self.arena.get();
            let mapbits = (*self.chunk_map_ptr(chunk, page)).bits;
            debug_assert!(mapbits & CHUNK_MAP_ALLOCATED != 0, "double or wild free");
            if mapbits & CHUNK_MAP_LARGE != 0 {
                self.arena_dalloc_large(arena, chunk, page);
            } else {
                self.arena_dalloc_small(arena, chunk, ptr_in, page);
            }
        }
    }

    /// Classify an arena pointer: `(true, run size)` for a large run,
    /// `(false, bin index)` for a small region.
    pub(super) fn arena_ptr_class(&self, ptr_in: *mut u8) -> (bool, usize) {
        let chunk = self.chunk_base(ptr_in) as *mut ArenaChunkHeader;
        let page = (ptr_in as usize - chunk as usize) >> LG_PAGE;
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let mapbits = (*self.chunk_map_ptr(chunk, page)).bits;
            debug_assert!(mapbits & CHUNK_MAP_ALLOCATED != 0);
            if mapbits & CHUNK_MAP_LARGE != 0 {
                (true, mapbits & CHUNK_MAP_SIZE_MASK)
            } else {
                (
                    false,
                    (mapbits & CHUNK_MAP_BININD_MASK) >> CHUNK_MAP_BININD_SHIFT,
                )
            }
        }
    }

    /// Usable size of an arena pointer.
    pub(super) fn arena_salloc(&self, ptr_in: *mut u8) -> usize {
        let chunk = self.chunk_base(ptr_in) as *mut ArenaChunkHeader;
        let page = (ptr_in as usize - chunk as usize) >> LG_PAGE;
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let mapbits = (*self.chunk_map_ptr(chunk, page)).bits;
            debug_assert!(mapbits & CHUNK_MAP_ALLOCATED != 0);
            if mapbits & CHUNK_MAP_LARGE != 0 {
                mapbits & CHUNK_MAP_SIZE_MASK
            } else {
                let bin_ndx = (mapbits & CHUNK_MAP_BININD_MASK) >> CHUNK_MAP_BININD_SHIFT;
                bin2size(bin_ndx)
            }
        }
    }

    /// Fill a thread-cache magazine with regions of one bin, lowest
    /// addresses first. Returns how many were provided.
    pub(super) fn arena_tcache_fill_small(
        &self,
        bin_ndx: usize,
        out: &mut [*mut u8],
    ) -> usize {
        let info = self.bin_info[bin_ndx];
        let _guard = MutexGuard::lock(self.arena_mtx);
        let mut filled = 0;
        unsafe {
            let arena = &mut *self.arena.get();
            while filled < out.len() {
                let mut run = arena.bins[bin_ndx].runcur;
                if run.is_null() || (*run).nfree == 0 {
                    run = self.arena_bin_nonfull_run_get(arena, bin_ndx);
                    arena.bins[bin_ndx].runcur = run;
                }
                if run.is_null() {
                    break;
                }
                let base = run as *mut u8;
                let bitmap = base.add(info.bitmap_offset) as *mut u32;
                let reg_ndx = bitmap::set_first_unset(bitmap, &info.bitmap_info);
                (*run).nfree -= 1;
                if (*run).nfree == 0 {
                    arena.bins[bin_ndx].runcur = ptr::null_mut();
                }
                out[filled] = base.add(info.reg0_offset + reg_ndx * info.reg_interval);
                filled += 1;
            }
            arena.bins[bin_ndx].nmalloc += filled as u64;
            arena.allocated_small += filled * info.reg_size;
        }
        filled
    }

    /// Purge dirty, unallocated pages back through the chunk
    /// capability and clear their dirty bits.
    pub(super) fn arena_purge(&self) {
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &mut *self.arena.get();
            let mut chunk = arena.chunks;
            while !chunk.is_null() {
                if (*chunk).ndirty > 0 {
                    let mut page = self.map_bias;
                    while page < self.chunk_npages {
                        let m = self.chunk_map_ptr(chunk, page);
                        let bits = (*m).bits;
                        if bits & CHUNK_MAP_ALLOCATED == 0 && bits & CHUNK_MAP_DIRTY != 0 {
                            let run_size = bits & CHUNK_MAP_SIZE_MASK;
                            let npages = run_size >> LG_PAGE;
                            let addr = self.run_addr(chunk, page);
                            let unzeroed = match self.chunk_source.purge_unused(
                                ptr::NonNull::new_unchecked(addr),
                                run_size,
                            ) {
                                Ok(crate::status::Zeroing::Zeroed) => 0,
                                _ => CHUNK_MAP_UNZEROED,
                            };
                            for i in 0..npages {
                                let pm = self.chunk_map_ptr(chunk, page + i);
                                if (*pm).bits & CHUNK_MAP_DIRTY != 0 {
                                    (*chunk).ndirty -= 1;
                                    arena.ndirty_pages -= 1;
                                }
                                (*pm).bits = ((*pm).bits
                                    & !(CHUNK_MAP_DIRTY | CHUNK_MAP_UNZEROED))
                                    | unzeroed;
                            }
                            page += npages;
                        } else {
                            let run = bits & CHUNK_MAP_SIZE_MASK;
                            page += if bits & CHUNK_MAP_ALLOCATED == 0 && run > 0 {
                                run >> LG_PAGE
                            } else {
                                1
                            };
                        }
                    }
                }
                chunk = (*chunk).next;
            }
        }
    }

    /// Add to the profiling accumulator; true when it crossed the
    /// sampling interval and was wrapped.
    pub(super) fn arena_prof_accum(&self, bytes: usize) -> bool {
        const PROF_INTERVAL: u64 = 1 << 20;
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &mut *self.arena.get();
            arena.prof_accum += bytes as u64;
            if arena.prof_accum >= PROF_INTERVAL {
                arena.prof_accum %= PROF_INTERVAL;
                return true;
            }
        }
        false
    }

    /// (allocated_small, allocated_large) snapshot.
    pub(super) fn arena_allocated(&self) -> (usize, usize) {
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &*self.arena.get();
            (arena.allocated_small, arena.allocated_large)
        }
    }

    /// (active, dirty) page counts across the arena's chunks.
    pub fn page_stats(&self) -> (usize, usize) {
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let arena = &*self.arena.get();
            (arena.nactive_pages, arena.ndirty_pages)
        }
    }

    /// Lifetime (allocations, frees) counters of one bin.
    pub fn bin_stats(&self, bin_ndx: usize) -> (u64, u64) {
        let _guard = MutexGuard::lock(self.arena_mtx);
        unsafe {
            let bin = &(*self.arena.get()).bins[bin_ndx];
            (bin.nmalloc, bin.ndalloc)
        }
    }
}
