//! End-to-end mapper scenarios over a fully booted memory manager.
//!
//! Each test builds a fake machine: a buffer standing in for physical
//! RAM, the early map builder constructing the initial tables in it,
//! and a complete `MemoryManager` brought up from the resulting
//! startup info.

use kernel::memory::descriptor::{
    AuxFlags, PageFlags, TableFlags, TtbKind, PGAUXFLAGS_KERNEL_DATA, PGTBLFLAGS_KERNEL_DATA,
    TTBFLAGS_KERNEL_DATA,
};
use kernel::memory::early_map::{build_initial_tables, BootLayout, PhysWindow};
use kernel::memory::frame_allocator::{subtag, AllocFlags, PageTag};
use kernel::memory::layout::{KernAddr, PhysAddr, PAGE_SIZE};
use kernel::memory::mapper::PhysAccess;
use kernel::memory::MemoryManager;
use kernel::status::MmError;

const TOTAL_PAGES: u32 = 2048; // 8 MiB fake machine
const AVAIL_PAGES: u32 = 1920; // GPU reserves the top 128

fn boot_layout() -> BootLayout {
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

struct Machine {
    ram: Vec<u8>,
    _init_heap: Vec<u64>,
    mm: MemoryManager,
}

fn boot() -> Machine {
    let mut ram = vec![0u8; (TOTAL_PAGES * PAGE_SIZE) as usize];
    let win = unsafe { PhysWindow::new(ram.as_mut_ptr(), 0, ram.len() as u32) };
    let layout = boot_layout();
    let startup =
        build_initial_tables(&layout, TOTAL_PAGES, AVAIL_PAGES, win).expect("early tables");

    let mut init_heap = vec![0u64; 64 * 1024 / 8];
    let mm = unsafe {
        MemoryManager::new(
            &startup,
            &layout,
            init_heap.as_mut_ptr() as *mut u8,
            64 * 1024,
            PhysAccess::with_window(win),
        )
    }
    .expect("memory manager");

    Machine {
        ram,
        _init_heap: init_heap,
        mm,
    }
}

const KD: (TableFlags, PageFlags, AuxFlags) = (
    TTBFLAGS_KERNEL_DATA,
    PGTBLFLAGS_KERNEL_DATA,
    PGAUXFLAGS_KERNEL_DATA,
);

#[test]
fn boot_leaves_a_working_manager() {
    let mut m = boot();
    // The early kernel-code mapping resolves.
    assert_eq!(
        m.mm.get_phys_addr(None, 0xC000_0000 + 0x2345),
        Some(0x0002_0000 + 0x2345)
    );
    // The prestart identity window is gone, except the zero page.
    assert_eq!(m.mm.get_phys_addr(None, 0x0000_0000), Some(0));
    assert_eq!(m.mm.get_phys_addr(None, 0x0000_2000), None);
    // The identity MMIO window is gone; the high window remains.
    assert_eq!(m.mm.get_phys_addr(None, 0x2000_0000), None);
    assert_eq!(m.mm.get_phys_addr(None, 0xE000_0000), Some(0x2000_0000));
    // The early builder's spare table seeds the free tree.
    assert!(m.mm.free_table_count() >= 1);
}

/// Section promotion: a 256-page, megabyte-aligned map into a fresh
/// TTB slot must become a section descriptor, not a page table.
#[test]
fn section_promotion() {
    let mut m = boot();
    m.mm
        .map_pages(None, 0x0020_0000, 0xC100_0000, 256, KD.0, KD.1, KD.2)
        .expect("map");

    let entry = m.mm.kernel_context().entry_at(0xC10);
    assert_eq!(entry.kind(), TtbKind::Section);
    assert_eq!(entry.section_base(), 0x0020_0000);
    assert_eq!(
        m.mm.get_phys_addr(None, 0xC100_1234),
        Some(0x0020_1234)
    );
    // Every covered page resolves through the section (invariant 1).
    for k in [0u32, 1, 100, 255] {
        assert_eq!(
            m.mm.get_phys_addr(None, 0xC100_0000 + k * PAGE_SIZE),
            Some(0x0020_0000 + k * PAGE_SIZE)
        );
    }
    // The frame database records the section back pointer.
    let e = m.mm.mpdb_entry(0x200).unwrap();
    assert!(e.section_map());
    assert_ne!(e.pte_pa(), 0);
}

/// A map whose physical base is not section-aligned after the head
/// fragment stays page-granular and straddles TTB slots.
#[test]
fn cross_section_map() {
    let mut m = boot();
    m.mm
        .map_pages(None, 0x0030_0000, 0xC10F_0000, 512, KD.0, KD.1, KD.2)
        .expect("map");

    // Head: 16 entries at page indexes 240..255 of slot 0xC10.
    let ctxt = m.mm.kernel_context();
    assert_eq!(ctxt.entry_at(0xC10).kind(), TtbKind::PageTable);
    for i in 0..16u32 {
        let (pe, _) = ctxt.page_entry_at(0xC10, 240 + i).unwrap();
        assert!(pe.is_present());
        assert_eq!(pe.page_base(), 0x0030_0000 + i * PAGE_SIZE);
    }
    assert!(!ctxt.page_entry_at(0xC10, 239).unwrap().0.is_present());

    // Middle: the physical base is now 0x0031_0000 — not megabyte
    // aligned — so slot 0xC11 gets 256 small pages, not a section.
    assert_eq!(ctxt.entry_at(0xC11).kind(), TtbKind::PageTable);
    for i in [0u32, 128, 255] {
        let (pe, _) = ctxt.page_entry_at(0xC11, i).unwrap();
        assert_eq!(pe.page_base(), 0x0031_0000 + i * PAGE_SIZE);
    }

    // Tail: the remaining 240 pages land in slot 0xC12.
    assert_eq!(ctxt.entry_at(0xC12).kind(), TtbKind::PageTable);
    assert!(ctxt.page_entry_at(0xC12, 239).unwrap().0.is_present());
    assert!(!ctxt.page_entry_at(0xC12, 240).unwrap().0.is_present());

    // 16 + 256 + 240 pages all resolve (invariant 1).
    for k in [0u32, 15, 16, 271, 272, 511] {
        assert_eq!(
            m.mm.get_phys_addr(None, 0xC10F_0000 + k * PAGE_SIZE),
            Some(0x0030_0000 + k * PAGE_SIZE)
        );
    }
    assert_eq!(m.mm.get_phys_addr(None, 0xC10F_0000 + 512 * PAGE_SIZE), None);
}

/// Demapping the whole range reclaims every page table it emptied and
/// reverts the TTB slots to fault.
#[test]
fn empty_table_reclaim() {
    let mut m = boot();
    m.mm
        .map_pages(None, 0x0030_0000, 0xC10F_0000, 512, KD.0, KD.1, KD.2)
        .expect("map");
    let free_before = m.mm.free_table_count();

    m.mm.demap_pages(None, 0xC10F_0000, 512).expect("demap");

    // All three slots revert to fault and their tables go to the free
    // tree.
    for slot in [0xC10u32, 0xC11, 0xC12] {
        assert_eq!(m.mm.kernel_context().entry_at(slot).kind(), TtbKind::Fault);
    }
    assert_eq!(m.mm.free_table_count(), free_before + 3);
    assert_eq!(m.mm.get_phys_addr(None, 0xC10F_0000), None);
}

/// Map-then-demap restores the exact prior descriptor state,
/// including auxiliary words, and frees the page table exactly when
/// the map allocated it (invariant 2).
#[test]
fn map_demap_restores_prestate() {
    let mut m = boot();
    let slots = [0xC20u32, 0xC21];
    let before: Vec<_> = slots
        .iter()
        .map(|&s| {
            (
                m.mm.kernel_context().entry_at(s),
                m.mm.kernel_context().aux_at(s),
            )
        })
        .collect();
    let tables_before = m.mm.free_table_count();

    m.mm
        .map_pages(None, 0x0040_0000, 0xC200_8000, 300, KD.0, KD.1, KD.2)
        .expect("map");
    m.mm.demap_pages(None, 0xC200_8000, 300).expect("demap");

    for (i, &s) in slots.iter().enumerate() {
        assert_eq!(m.mm.kernel_context().entry_at(s), before[i].0);
        assert_eq!(m.mm.kernel_context().aux_at(s), before[i].1);
    }
    // Both slots needed a table this map allocated: one recycled from
    // the boot spare, one freshly split from a frame (whose sibling
    // half joined the free tree at allocation time). The demap frees
    // both, so the tree nets two tables over the starting state and
    // nothing leaks.
    assert_eq!(m.mm.free_table_count(), tables_before + 2);
}

/// Sacred mappings refuse to demap through the public surface, and
/// the descriptors stay exactly as they were.
#[test]
fn sacred_refusal() {
    let mut m = boot();
    m.mm
        .map_pages(
            None,
            0x0050_0000,
            0xC300_0000,
            4,
            KD.0,
            KD.1,
            AuxFlags::SACRED,
        )
        .expect("map");

    let err = m.mm.demap_pages(None, 0xC300_0000, 4).unwrap_err();
    assert_eq!(err, MmError::Sacred);
    for k in 0..4u32 {
        assert_eq!(
            m.mm.get_phys_addr(None, 0xC300_0000 + k * PAGE_SIZE),
            Some(0x0050_0000 + k * PAGE_SIZE)
        );
    }
    let (_, aux) = m
        .mm
        .kernel_context()
        .page_entry_at(0xC30, 0)
        .expect("page entry");
    assert!(aux.sacred());
}

/// Frame allocation with zero-fill drives the whole scratch-window
/// dance: map, zero through the window, demap.
#[test]
fn zeroed_frame_allocation() {
    let mut m = boot();
    // Dirty the low free frames so the zero pass has work to do.
    for b in m.ram[0x1000..0x9000].iter_mut() {
        *b = 0xAA;
    }
    let pa = m
        .mm
        .allocate_frame(AllocFlags::ZERO, PageTag::System, subtag::PGTBL)
        .expect("frame");

    // The frame really is zero in "RAM".
    let offset = pa as usize;
    assert!(m.ram[offset..offset + PAGE_SIZE as usize]
        .iter()
        .all(|&b| b == 0));

    // Tag checking on free.
    assert_eq!(
        m.mm.free_frame(pa, PageTag::System, subtag::MPDB),
        Err(MmError::BadTags)
    );
    m.mm.free_frame(pa, PageTag::System, subtag::PGTBL)
        .expect("free");
}

/// The kernel map/demap pair hands out a window and returns it.
#[test]
fn kernel_window_pair() {
    let mut m = boot();
    let pa: PhysAddr = 0x0060_0000;
    let va = m
        .mm
        .map_kernel_pages(pa, 3, KD.0, KD.1, AuxFlags::empty())
        .expect("window");
    assert!(va >= 0xC000_0000);
    for k in 0..3u32 {
        assert_eq!(
            m.mm.get_phys_addr(None, va + k * PAGE_SIZE),
            Some(pa + k * PAGE_SIZE)
        );
    }
    m.mm.demap_kernel_pages(va, 3).expect("return window");
    assert_eq!(m.mm.get_phys_addr(None, va), None);

    // Below the kernel fence the pair refuses.
    assert_eq!(
        m.mm.demap_kernel_pages(0x8000_0000, 1),
        Err(MmError::InvalidArg)
    );
}

/// On-demand page-table growth: exhaust the free tree and watch the
/// mapper take a frame, map it, and thread two records.
#[test]
fn page_table_growth_from_frames() {
    let mut m = boot();
    let frames_before = m.mm.available_frames();

    // Map one page into many distinct TTB slots to burn through the
    // free tables and force fresh allocations.
    for i in 0..8u32 {
        let va: KernAddr = 0xD000_0000 + i * 0x0010_0000;
        m.mm
            .map_pages(None, 0x0070_0000, va, 1, KD.0, KD.1, KD.2)
            .expect("map");
        assert_eq!(m.mm.get_phys_addr(None, va), Some(0x0070_0000));
    }
    // At least three fresh table frames were taken (two tables per
    // frame, eight slots, one spare from boot).
    assert!(m.mm.available_frames() < frames_before);

    // Demapping everything returns the tables to the free tree.
    for i in 0..8u32 {
        let va: KernAddr = 0xD000_0000 + i * 0x0010_0000;
        m.mm.demap_pages(None, va, 1).expect("demap");
    }
    assert!(m.mm.free_table_count() >= 8);
}

/// The chunk service hands out aligned, mapped, writable windows.
#[test]
fn chunk_service_for_the_heap() {
    let mut m = boot();
    // A 16-page chunk aligned to 16 pages.
    let (va, _zeroing) = m.mm.alloc_chunk_pages(16, 16).expect("chunk");
    assert_eq!(va % (16 * PAGE_SIZE), 0);
    for k in 0..16u32 {
        assert!(m.mm.get_phys_addr(None, va + k * PAGE_SIZE).is_some());
    }
}

#[cfg(feature = "testing")]
#[test]
fn simulated_oom_propagates() {
    let mut m = boot();
    m.mm.simulate_oom(true);
    assert_eq!(
        m.mm.allocate_frame(AllocFlags::empty(), PageTag::System, subtag::PGTBL),
        Err(MmError::OutOfMemory)
    );
    m.mm.simulate_oom(false);
}
