//! Cache and TLB maintenance primitives.
//!
//! Safe wrappers around the ARMv6 CP15 operations the mapper needs when
//! it edits live translation tables. The required ordering is fixed:
//! cache clean/invalidate happens *before* a descriptor is cleared, the
//! descriptor write happens *before* the TLB entry is invalidated.
//!
//! On non-ARM targets (host unit tests) these are inert.

#![allow(unused_variables)]

use super::layout::{KernAddr, PAGE_SIZE, SEC_SIZE};

/// ARMv6 data-cache line size.
const CACHE_LINE: u32 = 32;

/// Clean (and, when `writeback` says the region may be dirty,
/// invalidate) the data cache for one page worth of a mapping.
///
/// `writeback == false` means the mapping was never writeable, so a
/// plain clean is sufficient.
pub fn flush_cache_for_page(va: KernAddr, writeback: bool) {
    #[cfg(target_arch = "arm")]
    unsafe {
        let mut line = va & !(CACHE_LINE - 1);
        let end = va.wrapping_add(PAGE_SIZE);
        while line != end {
            if writeback {
                // Clean and invalidate D-cache line by MVA.
                core::arch::asm!("mcr p15, 0, {0}, c7, c14, 1", in(reg) line);
            } else {
                // Clean D-cache line by MVA.
                core::arch::asm!("mcr p15, 0, {0}, c7, c10, 1", in(reg) line);
            }
            line = line.wrapping_add(CACHE_LINE);
        }
        data_sync_barrier();
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = (va, writeback, CACHE_LINE, PAGE_SIZE);
    }
}

/// Clean/invalidate the data cache for a whole 1 MiB section. Walking
/// 32768 lines by MVA is slower than a full-cache operation on this
/// core, so clean the entire cache instead.
pub fn flush_cache_for_section(va: KernAddr, writeback: bool) {
    #[cfg(target_arch = "arm")]
    unsafe {
        if writeback {
            // Clean and invalidate entire D-cache.
            core::arch::asm!("mcr p15, 0, {0}, c7, c14, 0", in(reg) 0u32);
        } else {
            // Clean entire D-cache.
            core::arch::asm!("mcr p15, 0, {0}, c7, c10, 0", in(reg) 0u32);
        }
        data_sync_barrier();
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = (va, writeback, SEC_SIZE);
    }
}

/// Invalidate the unified TLB entry covering one page.
pub fn flush_tlb_for_page(va: KernAddr) {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c8, c7, 1", in(reg) va & !(PAGE_SIZE - 1));
        data_sync_barrier();
    }
}

/// Invalidate the TLB entries covering one 1 MiB section.
pub fn flush_tlb_for_section(va: KernAddr) {
    #[cfg(target_arch = "arm")]
    unsafe {
        let base = va & !(SEC_SIZE - 1);
        let mut page = base;
        while page != base.wrapping_add(SEC_SIZE) {
            core::arch::asm!("mcr p15, 0, {0}, c8, c7, 1", in(reg) page);
            page = page.wrapping_add(PAGE_SIZE);
        }
        data_sync_barrier();
    }
}

#[cfg(target_arch = "arm")]
#[inline(always)]
unsafe fn data_sync_barrier() {
    core::arch::asm!("mcr p15, 0, {0}, c7, c10, 4", in(reg) 0u32);
}
