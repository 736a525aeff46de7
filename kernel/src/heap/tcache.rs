//! Thread caches.
//!
//! A per-thread array of magazines, one per size class (small classes
//! plus the large classes up to 32 KiB), so the common allocation path
//! touches no arena mutex at all. Every cached alloc or free ticks an
//! event counter; when it reaches the GC increment one bin gets half
//! its magazine flushed back to the arena, round-robin.
//!
//! The thread-local slot holds either a cache pointer or a small state
//! sentinel: 0 = never created, disabled, purgatory (being torn down),
//! or reincarnated (used again during teardown). Until a scheduler
//! exists the kernel's thread-local factory degenerates to one shared
//! slot, which is exactly one cache for the whole kernel.

use core::ptr;

use super::arena::LG_PAGE;
use super::size_classes::{size2bin, NBINS, SMALL_MAXCLASS};
use super::Heap;

pub(super) const TCACHE_NSLOTS_SMALL_MAX: usize = 200;
pub(super) const TCACHE_NSLOTS_LARGE: usize = 20;
pub(super) const TCACHE_GC_INCR: u32 = 8192;
/// Largest size class served from the cache (32 KiB).
pub(super) const TCACHE_MAXCLASS: usize = 1 << 15;
/// Cached bins: all small classes plus the page-multiple large
/// classes up to `TCACHE_MAXCLASS`.
pub(super) const NHBINS: usize = NBINS + (TCACHE_MAXCLASS >> LG_PAGE);

// Thread-slot sentinels; anything above is a real cache pointer.
const TCACHE_STATE_DISABLED: usize = 1;
const TCACHE_STATE_PURGATORY: usize = 2;
const TCACHE_STATE_REINCARNATED: usize = 3;
const TCACHE_STATE_MAX: usize = 3;

// Enable-slot values.
const TCACHE_ENABLE_DEFAULT: usize = 0;
const TCACHE_ENABLED: usize = 1;
const TCACHE_DISABLED: usize = 2;

#[repr(C)]
pub(super) struct TCacheBin {
    ncached: u32,
    ncached_max: u32,
    /// Stack of cached regions; grows upward, top is the hot end.
    avail: *mut *mut u8,
}

#[repr(C)]
pub(super) struct TCache {
    /// Owning heap, for the thread-exit destructor.
    heap: *const Heap,
    events: u32,
    next_gc_bin: usize,
    bins: [TCacheBin; NHBINS],
}

fn large_bin_index(size: usize) -> usize {
    debug_assert!(size > SMALL_MAXCLASS && size <= TCACHE_MAXCLASS);
    NBINS + (size >> LG_PAGE) - 1
}

fn thread_exit_cleanup(value: usize) {
    if value > TCACHE_STATE_MAX {
        let tcache = value as *mut TCache;
        unsafe { (*(*tcache).heap).tcache_destroy(tcache) };
    }
}

impl Heap {
    fn tcache_bin_cap(&self, bin_ndx: usize) -> usize {
        if bin_ndx < NBINS {
            (2 * self.bin_info[bin_ndx].nregs as usize).min(TCACHE_NSLOTS_SMALL_MAX)
        } else {
            TCACHE_NSLOTS_LARGE
        }
    }

    /// Is caching enabled for the current thread? First use latches
    /// the heap-level default into the thread's enable slot.
    pub(super) fn tcache_enabled(&self) -> bool {
        let state = self.tcache_enabled_slot.get();
        match state {
            TCACHE_ENABLE_DEFAULT => {
                let enabled = !self
                    .flags
                    .contains(super::api::HeapFlags::NO_TCACHE);
                self.tcache_enabled_slot.set(if enabled {
                    TCACHE_ENABLED
                } else {
                    TCACHE_DISABLED
                });
                enabled
            }
            TCACHE_ENABLED => true,
            _ => false,
        }
    }

    /// Enable or disable caching for the current thread, flushing the
    /// live cache on disable.
    pub fn tcache_set_enabled(&self, enabled: bool) {
        self.tcache_enabled_slot
            .set(if enabled { TCACHE_ENABLED } else { TCACHE_DISABLED });
        if !enabled {
            let value = self.tcache_slot.get();
            if value > TCACHE_STATE_MAX {
                self.tcache_slot.set(TCACHE_STATE_DISABLED);
                unsafe { self.tcache_destroy(value as *mut TCache) };
            } else if value == 0 {
                self.tcache_slot.set(TCACHE_STATE_DISABLED);
            }
        } else if self.tcache_slot.get() == TCACHE_STATE_DISABLED {
            self.tcache_slot.set(0);
        }
    }

    /// The current thread's cache, creating it when asked and allowed.
    pub(super) fn tcache_get(&self, create: bool) -> *mut TCache {
        let value = self.tcache_slot.get();
        if value > TCACHE_STATE_MAX {
            return value as *mut TCache;
        }
        if !create {
            return ptr::null_mut();
        }
        match value {
            0 => {
                if self.tcache_enabled() {
                    self.tcache_create()
                } else {
                    ptr::null_mut()
                }
            }
            TCACHE_STATE_PURGATORY => {
                // Allocation during teardown: remember that the thread
                // came back so the destructor runs once more.
                self.tcache_slot.set(TCACHE_STATE_REINCARNATED);
                ptr::null_mut()
            }
            _ => ptr::null_mut(),
        }
    }

    fn tcache_create(&self) -> *mut TCache {
        // One allocation holds the header and every magazine stack.
        let mut slots = 0;
        for bin_ndx in 0..NHBINS {
            slots += self.tcache_bin_cap(bin_ndx);
        }
        let size = core::mem::size_of::<TCache>() + slots * core::mem::size_of::<*mut u8>();

        // Allocate straight from the arena; routing through the public
        // path would recurse into cache creation.
        let raw = if size <= SMALL_MAXCLASS {
            self.arena_malloc_small(size, true)
        } else {
            self.arena_malloc_large(size, true)
        };
        if raw.is_null() {
            return ptr::null_mut();
        }

        let tcache = raw as *mut TCache;
        unsafe {
            (*tcache).heap = self;
            (*tcache).events = 0;
            (*tcache).next_gc_bin = 0;
            let mut stack = raw.add(core::mem::size_of::<TCache>()) as *mut *mut u8;
            for bin_ndx in 0..NHBINS {
                let cap = self.tcache_bin_cap(bin_ndx);
                (*tcache).bins[bin_ndx] = TCacheBin {
                    ncached: 0,
                    ncached_max: cap as u32,
                    avail: stack,
                };
                stack = stack.add(cap);
            }
        }
        self.tcache_slot.set(tcache as usize);
        self.tcache_slot.set_cleanup(thread_exit_cleanup);
        tcache
    }

    /// Count an event; at the GC increment, flush half of one bin's
    /// magazine and advance the rotor.
    unsafe fn tcache_event(&self, tcache: *mut TCache) {
        (*tcache).events += 1;
        if (*tcache).events < TCACHE_GC_INCR {
            return;
        }
        (*tcache).events = 0;
        let bin_ndx = (*tcache).next_gc_bin;
        (*tcache).next_gc_bin = (bin_ndx + 1) % NHBINS;
        let tbin = &mut (*tcache).bins[bin_ndx];
        let keep = (tbin.ncached / 2) as usize;
        self.tcache_bin_flush(tbin, keep);
    }

    /// Flush a magazine down to `keep` entries, oldest first.
    unsafe fn tcache_bin_flush(&self, tbin: &mut TCacheBin, keep: usize) {
        let ncached = tbin.ncached as usize;
        if ncached <= keep {
            return;
        }
        let drop_count = ncached - keep;
        for i in 0..drop_count {
            self.arena_dalloc(*tbin.avail.add(i));
        }
        // Slide the survivors down to the bottom of the stack.
        for i in 0..keep {
            *tbin.avail.add(i) = *tbin.avail.add(drop_count + i);
        }
        tbin.ncached = keep as u32;
    }

    /// Small allocation through the cache.
    pub(super) unsafe fn tcache_alloc_small(
        &self,
        tcache: *mut TCache,
        size: usize,
        zero: bool,
    ) -> *mut u8 {
        let bin_ndx = match size2bin(size) {
            Some(b) => b,
            None => return ptr::null_mut(),
        };
        let tbin = &mut (*tcache).bins[bin_ndx];
        let region = if tbin.ncached > 0 {
            tbin.ncached -= 1;
            *tbin.avail.add(tbin.ncached as usize)
        } else {
            // Refill half a magazine in one arena visit.
            let want = (tbin.ncached_max as usize / 2).max(1);
            let out = core::slice::from_raw_parts_mut(tbin.avail, want);
            let filled = self.arena_tcache_fill_small(bin_ndx, out);
            if filled == 0 {
                return ptr::null_mut();
            }
            tbin.ncached = (filled - 1) as u32;
            *tbin.avail.add(filled - 1)
        };
        if zero {
            ptr::write_bytes(region, 0, self.bin_info[bin_ndx].reg_size);
        }
        self.tcache_event(tcache);
        region
    }

    /// Large allocation through the cache (page multiples ≤ 32 KiB).
    pub(super) unsafe fn tcache_alloc_large(
        &self,
        tcache: *mut TCache,
        size: usize,
        zero: bool,
    ) -> *mut u8 {
        let size = (size + (1 << LG_PAGE) - 1) & !((1 << LG_PAGE) - 1);
        let bin_ndx = large_bin_index(size);
        let tbin = &mut (*tcache).bins[bin_ndx];
        let region = if tbin.ncached > 0 {
            tbin.ncached -= 1;
            let r = *tbin.avail.add(tbin.ncached as usize);
            if zero {
                ptr::write_bytes(r, 0, size);
            }
            r
        } else {
            // Large magazines refill one at a time.
            let r = self.arena_malloc_large(size, zero);
            if r.is_null() {
                return ptr::null_mut();
            }
            r
        };
        self.tcache_event(tcache);
        region
    }

    /// Small free through the cache.
    pub(super) unsafe fn tcache_dalloc_small(
        &self,
        tcache: *mut TCache,
        ptr_in: *mut u8,
        bin_ndx: usize,
    ) {
        let tbin = &mut (*tcache).bins[bin_ndx];
        if tbin.ncached == tbin.ncached_max {
            let keep = (tbin.ncached_max / 2) as usize;
            self.tcache_bin_flush(tbin, keep);
        }
        *tbin.avail.add(tbin.ncached as usize) = ptr_in;
        tbin.ncached += 1;
        self.tcache_event(tcache);
    }

    /// Large free through the cache.
    pub(super) unsafe fn tcache_dalloc_large(
        &self,
        tcache: *mut TCache,
        ptr_in: *mut u8,
        size: usize,
    ) {
        let bin_ndx = large_bin_index(size);
        let tbin = &mut (*tcache).bins[bin_ndx];
        if tbin.ncached == tbin.ncached_max {
            let keep = (tbin.ncached_max / 2) as usize;
            self.tcache_bin_flush(tbin, keep);
        }
        *tbin.avail.add(tbin.ncached as usize) = ptr_in;
        tbin.ncached += 1;
        self.tcache_event(tcache);
    }

    /// Flush every magazine and release the cache storage.
    pub(super) unsafe fn tcache_destroy(&self, tcache: *mut TCache) {
        for bin_ndx in 0..NHBINS {
            let tbin = &mut (*tcache).bins[bin_ndx];
            self.tcache_bin_flush(tbin, 0);
        }
        self.arena_dalloc(tcache as *mut u8);
    }

    /// Tear down the calling thread's cache, if any.
    pub fn tcache_flush_current(&self) {
        let value = self.tcache_slot.get();
        if value != 0 {
            self.tcache_slot.set(0);
        }
        if value > TCACHE_STATE_MAX {
            unsafe { self.tcache_destroy(value as *mut TCache) };
        }
    }
}
