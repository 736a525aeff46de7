//! Early translation-table construction.
//!
//! Runs on the prestart image with the MMU disabled, so every access
//! goes through physical addresses. This module places TTB1, the
//! auxiliary TTB and the Master Page Database region, builds the
//! initial page tables, installs the identity and high-half mappings,
//! and fills in the startup-info record the rest of the kernel boots
//! from.
//!
//! Any mapping conflict here is fatal to bring-up; errors are returned
//! so the prestart caller can halt with a trace.

use core::ptr;

use super::descriptor::{
    make_section_aux_flags, make_section_flags, AuxEntry, AuxFlags, PageEntry, PageFlags,
    PageTable, SectionFlags, TableFlags, TtbEntry, TtbKind, PGAUXFLAGS_INIT_CODE,
    PGAUXFLAGS_INIT_DATA, PGAUXFLAGS_KERNEL_CODE, PGAUXFLAGS_KERNEL_DATA, PGAUXFLAGS_LIB_CODE,
    PGTBLFLAGS_INIT_CODE, PGTBLFLAGS_INIT_DATA, PGTBLFLAGS_KERNEL_CODE, PGTBLFLAGS_KERNEL_DATA,
    PGTBLFLAGS_LIB_CODE, PGTBLFLAGS_MMIO, TTBAUXFLAGS_PAGETABLE, TTBFLAGS_INIT_CODE,
    TTBFLAGS_INIT_DATA, TTBFLAGS_KERNEL_CODE, TTBFLAGS_KERNEL_DATA, TTBFLAGS_LIB_CODE,
    TTBFLAGS_MMIO,
};
use super::layout::{
    page_count, pgtbl_index, ttb_index, KernAddr, PhysAddr, PAGE_BITS, PAGE_COUNT_IO, PAGE_SIZE,
    PGTBL_ENTRIES, PHYSADDR_IO_BASE, SEC_SIZE, TTB1_ENTRIES, TTB1_SIZE, VMADDR_IO_BASE,
    VMADDR_KERNEL_FENCE,
};
use crate::status::{MmError, MmResult};

/// How physical addresses appear in the current address space.
///
/// At prestart the image runs identity-mapped, so the window is the
/// identity; host tests hand in a buffer standing in for RAM. This is
/// the same role the physical-memory offset plays for the runtime
/// mapper on offset-mapped kernels.
#[derive(Clone, Copy)]
pub struct PhysWindow {
    base: *mut u8,
    origin: PhysAddr,
    len: u32,
}

impl PhysWindow {
    /// Window over `len` bytes of physical memory starting at
    /// `origin`, visible at `base` in the current address space.
    ///
    /// # Safety
    ///
    /// `base..base+len` must be valid, writable memory for the life of
    /// the window.
    pub unsafe fn new(base: *mut u8, origin: PhysAddr, len: u32) -> PhysWindow {
        PhysWindow { base, origin, len }
    }

    /// The identity window used while the MMU is off.
    ///
    /// # Safety
    ///
    /// Only sound while physical addresses are directly dereferencable
    /// (MMU disabled or identity-mapped).
    pub const unsafe fn identity() -> PhysWindow {
        PhysWindow {
            base: ptr::null_mut(),
            origin: 0,
            len: u32::MAX,
        }
    }

    pub fn contains(&self, pa: PhysAddr, len: u32) -> bool {
        pa >= self.origin && pa - self.origin <= self.len.saturating_sub(len)
    }

    pub fn ptr(&self, pa: PhysAddr) -> *mut u8 {
        debug_assert!(self.contains(pa, 1), "PA {pa:#010x} outside window");
        ((self.base as usize).wrapping_add((pa - self.origin) as usize)) as *mut u8
    }

    pub fn typed<T>(&self, pa: PhysAddr) -> *mut T {
        self.ptr(pa) as *mut T
    }
}

/// Linker- and firmware-derived constants describing the loaded image.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootLayout {
    /// First free physical address after the loaded image.
    pub pa_first_free: PhysAddr,
    /// Pages from physical 0 through the end of the prestart image.
    pub cpg_prestart_total: u32,
    pub pa_library_code: PhysAddr,
    pub vma_library_code: KernAddr,
    pub cpg_library_code: u32,
    pub pa_kernel_code: PhysAddr,
    pub vma_kernel_code: KernAddr,
    pub cpg_kernel_code: u32,
    pub pa_kernel_data: PhysAddr,
    pub vma_kernel_data: KernAddr,
    pub cpg_kernel_data: u32,
    pub cpg_kernel_bss: u32,
    pub pa_init_code: PhysAddr,
    pub vma_init_code: KernAddr,
    pub cpg_init_code: u32,
    pub pa_init_data: PhysAddr,
    pub vma_init_data: KernAddr,
    pub cpg_init_data: u32,
    pub cpg_init_bss: u32,
    /// First free kernel virtual address after the linked image; the
    /// TTB, aux TTB and MPDB high-half windows start here.
    pub vma_first_free: KernAddr,
}

/// Everything the kernel proper needs to take over from prestart.
///
/// The board fields (machine type, serial, VideoCore split, …) are
/// filled by the ATAG collector; the early map builder owns the
/// memory-layout fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartupInfo {
    pub pa_ttb: PhysAddr,
    pub ka_ttb: KernAddr,
    pub pa_ttb_aux: PhysAddr,
    pub ka_ttb_aux: KernAddr,
    pub machine_type: u32,
    pub revision: u32,
    pub serial_number: u32,
    /// Total memory pages in the system.
    pub cpg_system_total: u32,
    /// Pages available after the VideoCore takes its share.
    pub cpg_system_avail: u32,
    /// Pages skipped between the image and the 16 KiB TTB boundary.
    pub cpg_ttb_gap: u32,
    pub pa_mpdb: PhysAddr,
    pub ka_mpdb: KernAddr,
    pub cpg_mpdb: u32,
    pub pa_first_page_table: PhysAddr,
    /// Kernel address the initial page-table region is mapped at, so
    /// the live mapper can adopt the tables without a bootstrap
    /// window.
    pub ka_first_page_table: KernAddr,
    pub cpg_page_tables: u32,
    /// Page tables still unused on the last table page (0 or 1).
    pub ctbl_free_on_last_page: u32,
    /// First free physical address after the initial page tables.
    pub pa_first_free: PhysAddr,
    /// First free kernel virtual address after the mapped MPDB.
    pub vma_first_free: KernAddr,
    pub emmc_clock_freq: u32,
    pub pa_vc_mem: PhysAddr,
    pub cb_vc_mem: u32,
    pub fb_width: u16,
    pub fb_height: u16,
    pub mac_address: [u8; 6],
}

/// Builder state while the initial tables are under construction.
struct EarlyMapper {
    win: PhysWindow,
    pa_ttb: PhysAddr,
    /// Physical address of the next unused 2 KiB table slot.
    pa_next_table: PhysAddr,
    cpg_page_tables: u32,
    free_tables_on_last_page: u32,
}

impl EarlyMapper {
    fn ttb_entry(&self, ndx: u32) -> *mut TtbEntry {
        self.win.typed::<TtbEntry>(self.pa_ttb + ndx * 4)
    }

    fn aux_entry(&self, ndx: u32) -> *mut AuxEntry {
        self.win.typed::<AuxEntry>(self.pa_ttb + TTB1_SIZE + ndx * 4)
    }

    /// Carve the next 2 KiB table pair off the bump region, zero it,
    /// and point the TTB slot at it. Never allocates a fresh page
    /// while one of the two tables on the current page is still free.
    fn alloc_page_table(&mut self, ndx_ttb: u32, table_flags: TableFlags) -> *mut PageTable {
        if self.free_tables_on_last_page == 0 {
            self.cpg_page_tables += 1;
            self.free_tables_on_last_page = 2;
        }
        self.free_tables_on_last_page -= 1;
        let pa_table = self.pa_next_table;
        self.pa_next_table += core::mem::size_of::<PageTable>() as u32;

        let table = self.win.typed::<PageTable>(pa_table);
        unsafe {
            (*table).zero();
            *self.ttb_entry(ndx_ttb) = TtbEntry::page_table(pa_table, table_flags);
            *self.aux_entry(ndx_ttb) = AuxEntry::new(TTBAUXFLAGS_PAGETABLE);
        }
        table
    }

    /// Install up to one TTB slot's worth of page mappings starting at
    /// `ndx_page` within the slot. Returns the number of pages mapped.
    fn alloc_pages(
        &mut self,
        mut pa_base: PhysAddr,
        ndx_ttb: u32,
        ndx_page: u32,
        cpg: u32,
        table_flags: TableFlags,
        page_flags: PageFlags,
        aux_flags: AuxFlags,
    ) -> MmResult<u32> {
        let entry = unsafe { *self.ttb_entry(ndx_ttb) };
        let table: *mut PageTable = match entry.kind() {
            TtbKind::Fault => self.alloc_page_table(ndx_ttb, table_flags),
            TtbKind::PageTable => {
                if entry.table_flags() != table_flags {
                    return Err(MmError::BadTtbFlags);
                }
                self.win.typed::<PageTable>(entry.table_base())
            }
            TtbKind::Section => {
                if entry.section_flags() != make_section_flags(table_flags, page_flags) {
                    return Err(MmError::BadTtbFlags);
                }
                let aux = unsafe { *self.aux_entry(ndx_ttb) };
                if aux.flags() != make_section_aux_flags(aux_flags) {
                    return Err(MmError::BadTtbFlags);
                }
                if entry.section_base() != pa_base & SectionFlags::BASE {
                    return Err(MmError::Collided);
                }
                ptr::null_mut()
            }
        };

        let cpg_current = cpg.min(PGTBL_ENTRIES - ndx_page);
        if !table.is_null() {
            for i in 0..cpg_current {
                let slot = (ndx_page + i) as usize;
                unsafe {
                    if (*table).entries[slot].is_present() {
                        return Err(MmError::Collided);
                    }
                    (*table).entries[slot] = PageEntry::small_page(pa_base, page_flags);
                    (*table).aux[slot] = AuxEntry::new(aux_flags);
                }
                pa_base += PAGE_SIZE;
            }
        }
        Ok(cpg_current)
    }

    /// Map `cpg` pages of physical memory at `vma_base`, preferring a
    /// 1 MiB section descriptor whenever physical base and remaining
    /// size line up on a section boundary.
    fn map_pages(
        &mut self,
        mut pa_base: PhysAddr,
        vma_base: KernAddr,
        cpg: u32,
        table_flags: TableFlags,
        page_flags: PageFlags,
        aux_flags: AuxFlags,
    ) -> MmResult<()> {
        log::trace!(
            "early map {pa_base:#010x}->{vma_base:#010x} cpg={cpg} tf={:#x} pf={:#x} af={:#x}",
            table_flags.bits(),
            page_flags.bits(),
            aux_flags.bits()
        );
        let mut ndx_ttb = ttb_index(vma_base);
        let ndx_page = pgtbl_index(vma_base);
        let mut remaining = cpg;

        if remaining > 0 && ndx_page > 0 {
            // Head fragment up to the next section boundary.
            let done = self.alloc_pages(
                pa_base, ndx_ttb, ndx_page, remaining, table_flags, page_flags, aux_flags,
            )?;
            pa_base += done << PAGE_BITS;
            remaining -= done;
            ndx_ttb += 1;
        }

        while remaining >= PGTBL_ENTRIES {
            if pa_base & SectionFlags::BASE == pa_base {
                // Whole aligned section.
                let sec_flags = make_section_flags(table_flags, page_flags);
                let sec_aux = make_section_aux_flags(aux_flags);
                let entry = unsafe { *self.ttb_entry(ndx_ttb) };
                match entry.kind() {
                    TtbKind::Fault => unsafe {
                        *self.ttb_entry(ndx_ttb) = TtbEntry::section(pa_base, sec_flags);
                        *self.aux_entry(ndx_ttb) = AuxEntry::new(sec_aux);
                    },
                    TtbKind::PageTable => return Err(MmError::Collided),
                    TtbKind::Section => {
                        if entry.section_flags() != sec_flags {
                            return Err(MmError::BadTtbFlags);
                        }
                        let aux = unsafe { *self.aux_entry(ndx_ttb) };
                        if aux.flags() != sec_aux {
                            return Err(MmError::BadTtbFlags);
                        }
                        if entry.section_base() != pa_base {
                            return Err(MmError::Collided);
                        }
                    }
                }
                pa_base += SEC_SIZE;
                remaining -= PGTBL_ENTRIES;
            } else {
                // Unaligned physically; fill the slot with small pages.
                let done = self.alloc_pages(
                    pa_base, ndx_ttb, 0, remaining, table_flags, page_flags, aux_flags,
                )?;
                pa_base += done << PAGE_BITS;
                remaining -= done;
            }
            ndx_ttb += 1;
        }

        if remaining > 0 {
            // Tail fragment in the next slot.
            self.alloc_pages(
                pa_base, ndx_ttb, 0, remaining, table_flags, page_flags, aux_flags,
            )?;
        }
        Ok(())
    }
}

/// Build the initial translation tables and startup info.
///
/// `cpg_system_total` and `cpg_system_avail` come from the firmware
/// memory tags (total RAM pages, and pages left after the VideoCore
/// reservation at the top of RAM).
pub fn build_initial_tables(
    layout: &BootLayout,
    cpg_system_total: u32,
    cpg_system_avail: u32,
    win: PhysWindow,
) -> MmResult<StartupInfo> {
    let mut startup = StartupInfo {
        cpg_system_total,
        cpg_system_avail,
        ..StartupInfo::default()
    };

    // Place TTB1 on the next 16 KiB boundary; remember the gap pages
    // so the frame allocator can hand them back later.
    let mut pa_ttb = layout.pa_first_free;
    while pa_ttb & (TTB1_SIZE - 1) != 0 {
        pa_ttb += PAGE_SIZE;
        startup.cpg_ttb_gap += 1;
    }
    startup.pa_ttb = pa_ttb;
    log::debug!("TTB1 at {pa_ttb:#010x}, gap {} pages", startup.cpg_ttb_gap);

    // Zero TTB1 and the aux TTB that follows it.
    unsafe {
        for i in 0..TTB1_ENTRIES {
            *win.typed::<TtbEntry>(pa_ttb + i * 4) = TtbEntry::FAULT;
            *win.typed::<AuxEntry>(pa_ttb + TTB1_SIZE + i * 4) = AuxEntry::CLEAR;
        }
    }
    startup.pa_ttb_aux = pa_ttb + TTB1_SIZE;

    // Reserve the Master Page Database region (8 bytes per frame).
    startup.pa_mpdb = startup.pa_ttb_aux + TTB1_SIZE;
    startup.cpg_mpdb = page_count(cpg_system_total * 8);
    let cb_mpdb = startup.cpg_mpdb << PAGE_BITS;

    // Page tables are carved from a bump region after the MPDB.
    startup.pa_first_page_table = startup.pa_mpdb + cb_mpdb;
    let mut mapper = EarlyMapper {
        win,
        pa_ttb,
        pa_next_table: startup.pa_first_page_table,
        cpg_page_tables: 0,
        free_tables_on_last_page: 0,
    };

    // Identity-map the prestart image (we are executing from it).
    mapper.map_pages(
        0,
        0,
        layout.cpg_prestart_total,
        TableFlags::ALWAYS,
        PageFlags::ALWAYS | PageFlags::AP01,
        AuxFlags::empty(),
    )?;
    // Identity-map the IO window (the early UART lives there).
    mapper.map_pages(
        PHYSADDR_IO_BASE,
        PHYSADDR_IO_BASE,
        PAGE_COUNT_IO,
        TTBFLAGS_MMIO,
        PGTBLFLAGS_MMIO,
        AuxFlags::empty(),
    )?;
    // Kernel segments at their link-time homes.
    mapper.map_pages(
        layout.pa_library_code,
        layout.vma_library_code,
        layout.cpg_library_code,
        TTBFLAGS_LIB_CODE,
        PGTBLFLAGS_LIB_CODE,
        PGAUXFLAGS_LIB_CODE,
    )?;
    mapper.map_pages(
        layout.pa_kernel_code,
        layout.vma_kernel_code,
        layout.cpg_kernel_code,
        TTBFLAGS_KERNEL_CODE,
        PGTBLFLAGS_KERNEL_CODE,
        PGAUXFLAGS_KERNEL_CODE,
    )?;
    mapper.map_pages(
        layout.pa_kernel_data,
        layout.vma_kernel_data,
        layout.cpg_kernel_data + layout.cpg_kernel_bss,
        TTBFLAGS_KERNEL_DATA,
        PGTBLFLAGS_KERNEL_DATA,
        PGAUXFLAGS_KERNEL_DATA,
    )?;
    mapper.map_pages(
        layout.pa_init_code,
        layout.vma_init_code,
        layout.cpg_init_code,
        TTBFLAGS_INIT_CODE,
        PGTBLFLAGS_INIT_CODE,
        PGAUXFLAGS_INIT_CODE,
    )?;
    mapper.map_pages(
        layout.pa_init_data,
        layout.vma_init_data,
        layout.cpg_init_data + layout.cpg_init_bss,
        TTBFLAGS_INIT_DATA,
        PGTBLFLAGS_INIT_DATA,
        PGAUXFLAGS_INIT_DATA,
    )?;

    // High-half windows: the TTB, aux TTB and MPDB become ordinary
    // kernel data once the MMU is on.
    startup.ka_ttb = layout.vma_first_free;
    mapper.map_pages(
        startup.pa_ttb,
        startup.ka_ttb,
        TTB1_SIZE / PAGE_SIZE,
        TTBFLAGS_KERNEL_DATA,
        PGTBLFLAGS_KERNEL_DATA,
        PGAUXFLAGS_KERNEL_DATA,
    )?;
    startup.ka_ttb_aux = startup.ka_ttb + TTB1_SIZE;
    mapper.map_pages(
        startup.pa_ttb_aux,
        startup.ka_ttb_aux,
        TTB1_SIZE / PAGE_SIZE,
        TTBFLAGS_KERNEL_DATA,
        PGTBLFLAGS_KERNEL_DATA,
        PGAUXFLAGS_KERNEL_DATA,
    )?;
    startup.ka_mpdb = startup.ka_ttb_aux + TTB1_SIZE;
    mapper.map_pages(
        startup.pa_mpdb,
        startup.ka_mpdb,
        startup.cpg_mpdb,
        TTBFLAGS_KERNEL_DATA,
        PGTBLFLAGS_KERNEL_DATA,
        PGAUXFLAGS_KERNEL_DATA,
    )?;
    // And the IO window again at its final high-half address.
    mapper.map_pages(
        PHYSADDR_IO_BASE,
        VMADDR_IO_BASE,
        PAGE_COUNT_IO,
        TTBFLAGS_MMIO,
        PGTBLFLAGS_MMIO,
        super::descriptor::PGAUXFLAGS_MMIO,
    )?;

    // Guarantee the live mapper at least one free page table at
    // startup: allocate one extra, empty table at the first faulted
    // slot above the kernel fence.
    let mut ndx = ttb_index(VMADDR_KERNEL_FENCE);
    while unsafe { !(*mapper.ttb_entry(ndx)).is_fault() } {
        ndx += 1;
    }
    mapper.alloc_page_table(ndx, TTBFLAGS_KERNEL_DATA);

    // Map the page-table region itself at its high-half home, so the
    // live mapper can reach every table once the prestart identity
    // windows go away. Mapping the region can allocate one more table
    // page, which then needs mapping too; loop until the count holds
    // still.
    startup.ka_first_page_table = startup.ka_mpdb + cb_mpdb;
    let mut cpg_mapped = 0;
    while cpg_mapped < mapper.cpg_page_tables {
        let target = mapper.cpg_page_tables;
        mapper.map_pages(
            startup.pa_first_page_table + (cpg_mapped << PAGE_BITS),
            startup.ka_first_page_table + (cpg_mapped << PAGE_BITS),
            target - cpg_mapped,
            TTBFLAGS_KERNEL_DATA,
            PGTBLFLAGS_KERNEL_DATA,
            PGAUXFLAGS_KERNEL_DATA,
        )?;
        cpg_mapped = target;
    }

    startup.cpg_page_tables = mapper.cpg_page_tables;
    startup.ctbl_free_on_last_page = mapper.free_tables_on_last_page;
    startup.pa_first_free =
        startup.pa_first_page_table + (mapper.cpg_page_tables << PAGE_BITS);
    startup.vma_first_free =
        startup.ka_first_page_table + (mapper.cpg_page_tables << PAGE_BITS);

    log::debug!(
        "initial tables: {} table pages, {} free on last, first free PA {:#010x}, VA {:#010x}",
        startup.cpg_page_tables,
        startup.ctbl_free_on_last_page,
        startup.pa_first_free,
        startup.vma_first_free
    );
    Ok(startup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::indices_to_vma;

    const TOTAL_PAGES: u32 = 1024; // 4 MiB of RAM in the fake machine
    const AVAIL_PAGES: u32 = 960; // GPU keeps the top 64

    fn test_layout() -> BootLayout {
        BootLayout {
            pa_first_free: 0x0004_0000,
            cpg_prestart_total: 8,
            pa_library_code: 0x0001_0000,
            vma_library_code: 0xB000_0000,
            cpg_library_code: 4,
            pa_kernel_code: 0x0002_0000,
            vma_kernel_code: 0xC000_0000,
            cpg_kernel_code: 8,
            pa_kernel_data: 0x0002_8000,
            vma_kernel_data: 0xC000_8000,
            cpg_kernel_data: 4,
            cpg_kernel_bss: 2,
            pa_init_code: 0x0003_0000,
            vma_init_code: 0xC000_E000,
            cpg_init_code: 2,
            pa_init_data: 0x0003_2000,
            vma_init_data: 0xC001_0000,
            cpg_init_data: 1,
            cpg_init_bss: 1,
            vma_first_free: 0xC010_0000,
        }
    }

    struct FakeRam {
        buf: Vec<u8>,
    }

    impl FakeRam {
        fn new(len: usize) -> FakeRam {
            FakeRam { buf: vec![0; len] }
        }
        fn window(&mut self) -> PhysWindow {
            unsafe { PhysWindow::new(self.buf.as_mut_ptr(), 0, self.buf.len() as u32) }
        }
    }

    fn ttb_at(win: &PhysWindow, pa_ttb: PhysAddr, ndx: u32) -> TtbEntry {
        unsafe { *win.typed::<TtbEntry>(pa_ttb + ndx * 4) }
    }

    /// Software page-walk through the fake tables.
    fn walk(win: &PhysWindow, pa_ttb: PhysAddr, vma: KernAddr) -> Option<PhysAddr> {
        let entry = ttb_at(win, pa_ttb, ttb_index(vma));
        match entry.kind() {
            TtbKind::Fault => None,
            TtbKind::Section => Some(entry.section_base() | (vma & !SectionFlags::BASE)),
            TtbKind::PageTable => {
                let table = win.typed::<PageTable>(entry.table_base());
                let pe = unsafe { (*table).entries[pgtbl_index(vma) as usize] };
                pe.is_present().then(|| pe.page_base() | (vma & (PAGE_SIZE - 1)))
            }
        }
    }

    #[test]
    fn places_tables_and_fills_startup_info() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let layout = test_layout();
        let startup =
            build_initial_tables(&layout, TOTAL_PAGES, AVAIL_PAGES, win).expect("build");

        // 0x40000 is already 16 KiB aligned: no gap.
        assert_eq!(startup.pa_ttb, 0x0004_0000);
        assert_eq!(startup.cpg_ttb_gap, 0);
        assert_eq!(startup.pa_ttb_aux, 0x0004_4000);
        assert_eq!(startup.pa_mpdb, 0x0004_8000);
        // 1024 frames * 8 bytes = 2 pages of MPDB.
        assert_eq!(startup.cpg_mpdb, 2);
        assert_eq!(startup.pa_first_page_table, 0x0004_A000);
        // Four live tables (identity, library, kernel, high windows)
        // plus the spare: three table pages, one table still free.
        assert_eq!(startup.cpg_page_tables, 3);
        assert_eq!(startup.ctbl_free_on_last_page, 1);
        assert_eq!(startup.pa_first_free, 0x0004_D000);
        assert_eq!(startup.ka_ttb, 0xC010_0000);
        assert_eq!(startup.ka_ttb_aux, 0xC010_4000);
        assert_eq!(startup.ka_mpdb, 0xC010_8000);
        assert_eq!(startup.ka_first_page_table, 0xC010_A000);
        assert_eq!(startup.vma_first_free, 0xC010_D000);
    }

    #[test]
    fn page_table_region_is_reachable_high() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let startup =
            build_initial_tables(&test_layout(), TOTAL_PAGES, AVAIL_PAGES, win).expect("build");
        for i in 0..startup.cpg_page_tables {
            assert_eq!(
                walk(
                    &win,
                    startup.pa_ttb,
                    startup.ka_first_page_table + i * PAGE_SIZE
                ),
                Some(startup.pa_first_page_table + i * PAGE_SIZE)
            );
        }
    }

    #[test]
    fn mmio_maps_as_sections_both_low_and_high() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let startup =
            build_initial_tables(&test_layout(), TOTAL_PAGES, AVAIL_PAGES, win).expect("build");

        for i in 0..4 {
            let low = ttb_at(&win, startup.pa_ttb, ttb_index(PHYSADDR_IO_BASE) + i);
            assert_eq!(low.kind(), TtbKind::Section);
            assert_eq!(low.section_base(), PHYSADDR_IO_BASE + i * SEC_SIZE);
            let high = ttb_at(&win, startup.pa_ttb, ttb_index(VMADDR_IO_BASE) + i);
            assert_eq!(high.kind(), TtbKind::Section);
            assert_eq!(high.section_base(), PHYSADDR_IO_BASE + i * SEC_SIZE);
        }
        // The high window carries the MMIO aux flags; a section aux
        // word preserves NOTPAGE.
        let aux = unsafe {
            *win.typed::<AuxEntry>(startup.pa_ttb + TTB1_SIZE + ttb_index(VMADDR_IO_BASE) * 4)
        };
        assert!(aux.sacred());
        assert!(aux.notpage());
    }

    #[test]
    fn kernel_segments_resolve() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let layout = test_layout();
        let startup =
            build_initial_tables(&layout, TOTAL_PAGES, AVAIL_PAGES, win).expect("build");

        // Identity prestart.
        assert_eq!(walk(&win, startup.pa_ttb, 0x3000), Some(0x3000));
        // Kernel code at its high-half home.
        assert_eq!(
            walk(&win, startup.pa_ttb, layout.vma_kernel_code + 0x2345),
            Some(layout.pa_kernel_code + 0x2345)
        );
        // Kernel data+bss spans its whole range.
        assert_eq!(
            walk(&win, startup.pa_ttb, layout.vma_kernel_data + 5 * PAGE_SIZE),
            Some(layout.pa_kernel_data + 5 * PAGE_SIZE)
        );
        // The TTB sees itself through its high window.
        assert_eq!(walk(&win, startup.pa_ttb, startup.ka_ttb), Some(startup.pa_ttb));
        // The MPDB maps at its own high window, after the aux TTB's.
        assert_eq!(
            walk(&win, startup.pa_ttb, startup.ka_mpdb),
            Some(startup.pa_mpdb)
        );
        assert_eq!(
            walk(&win, startup.pa_ttb, startup.ka_ttb_aux),
            Some(startup.pa_ttb_aux)
        );
    }

    #[test]
    fn spare_table_sits_at_first_free_slot_above_fence() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let startup =
            build_initial_tables(&test_layout(), TOTAL_PAGES, AVAIL_PAGES, win).expect("build");

        // Kernel image occupies 0xC00, high windows 0xC01; the spare
        // empty table must land at 0xC02.
        let spare = ttb_at(&win, startup.pa_ttb, 0xC02);
        assert_eq!(spare.kind(), TtbKind::PageTable);
        let table = win.typed::<PageTable>(spare.table_base());
        assert!(unsafe { (*table).is_empty() });
        assert_eq!(
            walk(&win, startup.pa_ttb, indices_to_vma(0xC02, 0, 0)),
            None
        );
    }

    #[test]
    fn ttb_gap_is_accounted() {
        let mut ram = FakeRam::new(0x6_0000);
        let win = ram.window();
        let mut layout = test_layout();
        layout.pa_first_free = 0x0004_1000; // 3 pages shy of 16 KiB alignment
        let startup =
            build_initial_tables(&layout, TOTAL_PAGES, AVAIL_PAGES, win).expect("build");
        assert_eq!(startup.pa_ttb, 0x0004_4000);
        assert_eq!(startup.cpg_ttb_gap, 3);
    }

    #[test]
    fn conflicting_remap_is_rejected() {
        let mut ram = FakeRam::new(0x5_0000);
        let win = ram.window();
        let layout = test_layout();
        let startup =
            build_initial_tables(&layout, TOTAL_PAGES, AVAIL_PAGES, win).expect("build");

        let mut mapper = EarlyMapper {
            win,
            pa_ttb: startup.pa_ttb,
            pa_next_table: startup.pa_first_free,
            cpg_page_tables: startup.cpg_page_tables,
            free_tables_on_last_page: startup.ctbl_free_on_last_page,
        };
        // Remapping kernel code over itself with different flags fails.
        let err = mapper
            .map_pages(
                layout.pa_kernel_code,
                layout.vma_kernel_code,
                1,
                TTBFLAGS_KERNEL_CODE,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
            )
            .unwrap_err();
        assert_eq!(err, MmError::Collided);
    }
}
