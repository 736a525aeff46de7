//! Live page mapper.
//!
//! Edits translation tables while the MMU is running. Four operations
//! work against any VM context: virtual-to-physical resolution,
//! mapping, demapping and reflagging. A single call may straddle TTB
//! slots; the outer walkers split the range into a head fragment, zero
//! or more whole 1 MiB slots, and a tail fragment, and the inner
//! single-slot workers report how many pages they handled.
//!
//! Page tables are allocated on demand: first from the free-table
//! tree, else by taking a fresh frame, mapping it into a kernel
//! window, and threading *two* bookkeeping records — each 4 KiB frame
//! holds two 1 KiB tables (plus their shadows). The recursive mapping
//! of the new table runs with allocation forbidden, which bounds the
//! recursion at one level; a failure anywhere rolls the whole
//! operation back.
//!
//! Everything here executes under the kernel lock (interrupts off
//! during table edits); the context pointers are raw because the
//! controlled recursion may revisit the kernel context mid-call.

use core::ptr;

use bitflags::bitflags;

use super::arch;
use super::descriptor::{
    make_section_aux_flags, make_section_flags, AuxEntry, AuxFlags, PageEntry, PageFlags,
    PageTable, SectionFlags, TableFlags, TtbEntry, TtbKind, PGAUXFLAGS_KERNEL_DATA,
    PGTBLFLAGS_KERNEL_DATA, TTBAUXFLAGS_PAGETABLE, TTBFLAGS_KERNEL_DATA,
};
use super::frame_allocator::{subtag, AllocFlags, Mpdb, PageTag};
use super::kernel_va::KernelSpace;
use super::layout::{
    indices_to_vma, page_index, pgtbl_index, ttb_index, KernAddr, PhysAddr, PAGE_BITS, PAGE_SIZE,
    PGTBL_ENTRIES, SEC_PAGES, SEC_SIZE, VMADDR_TTB_FENCE,
};
use crate::collections::rbtree::{RbAdapter, RbNode, RbTree};
use crate::heap::api::Allocator;
use crate::status::{MmError, MmResult};

#[cfg(not(target_arch = "arm"))]
use super::early_map::PhysWindow;

bitflags! {
    /// Internal mapping controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapControl: u32 {
        /// Do not allocate page tables (set inside the allocation
        /// recursion to forbid further recursion).
        const DONT_ALLOC = 0x0000_0001;
    }
}

bitflags! {
    /// Internal demap controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DemapControl: u32 {
        /// Ignore the sacred bit. Never exposed to outside callers.
        const NOTHING_SACRED = 0x0000_0001;
    }
}

bitflags! {
    /// Controls for a reflag operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReflagControl: u32 {
        const TABLE_COPY0 = 0x0000_0001;
        const TABLE_SET0 = 0x0000_0002;
        const TABLE_CLEAR0 = 0x0000_0004;
        const TABLE_CLEAR1 = 0x0000_0008;
        const PAGE_COPY0 = 0x0000_0010;
        const PAGE_SET0 = 0x0000_0020;
        const PAGE_CLEAR0 = 0x0000_0040;
        const PAGE_CLEAR1 = 0x0000_0080;
        const AUX_COPY0 = 0x0000_0100;
        const AUX_SET0 = 0x0000_0200;
        const AUX_CLEAR0 = 0x0000_0400;
        const AUX_CLEAR1 = 0x0000_0800;
        /// The operation buffer already holds clear/set mask pairs.
        const PRECALCULATED = 0x4000_0000;
        /// Apply even to sacred mappings.
        const NOTHING_SACRED = 0x8000_0000;
    }
}

/// Flag alterations for reflagging. Interpreted per the control bits;
/// once precalculated, element 0 of each pair is the clear mask and
/// element 1 the set mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagOperations {
    pub table: [u32; 2],
    pub page: [u32; 2],
    pub aux: [u32; 2],
}

/// Bookkeeping record for one 1 KiB page table (with its shadow),
/// keyed by the table's physical address. Lives in exactly one of the
/// free-table tree or a context's attached tree.
pub struct PageNode {
    node: RbNode,
    pa: PhysAddr,
    table: *mut PageTable,
}

impl PageNode {
    /// Write a fresh record into uninitialized storage.
    ///
    /// # Safety
    ///
    /// `slot` must be valid storage for a `PageNode`.
    pub unsafe fn init(slot: *mut PageNode, pa: PhysAddr, table: *mut PageTable) {
        ptr::write(
            slot,
            PageNode {
                node: RbNode::new(),
                pa,
                table,
            },
        );
    }

    pub fn table(&self) -> *mut PageTable {
        self.table
    }

    pub fn pa(&self) -> PhysAddr {
        self.pa
    }
}

pub struct PageNodeAdapter;

unsafe impl RbAdapter for PageNodeAdapter {
    type Item = PageNode;
    type Key = PhysAddr;

    unsafe fn node_of(item: *mut PageNode) -> *mut RbNode {
        ptr::addr_of_mut!((*item).node)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut PageNode {
        (node as *mut u8).sub(core::mem::offset_of!(PageNode, node)) as *mut PageNode
    }
    unsafe fn key_of(item: *const PageNode) -> PhysAddr {
        (*item).pa
    }
    fn compare(probe: &PhysAddr, item: &PhysAddr) -> core::cmp::Ordering {
        probe.cmp(item)
    }
}

/// One address space: a TTB, its shadow, and the page tables reachable
/// from it.
pub struct VmContext {
    ttb: *mut TtbEntry,
    ttb_aux: *mut AuxEntry,
    ttb_pa: PhysAddr,
    max_index: u32,
    page_tables: RbTree<PageNodeAdapter>,
}

// SAFETY: contexts are only manipulated under the kernel lock.
unsafe impl Send for VmContext {}

impl VmContext {
    /// # Safety
    ///
    /// `ttb`/`ttb_aux` must point at a live TTB of `max_index` entries
    /// and its shadow, owned by this context.
    pub unsafe fn new(
        ttb: *mut TtbEntry,
        ttb_aux: *mut AuxEntry,
        ttb_pa: PhysAddr,
        max_index: u32,
    ) -> VmContext {
        VmContext {
            ttb,
            ttb_aux,
            ttb_pa,
            max_index,
            page_tables: RbTree::new(),
        }
    }

    pub fn ttb_pa(&self) -> PhysAddr {
        self.ttb_pa
    }

    fn entry(&self, ndx: u32) -> *mut TtbEntry {
        debug_assert!(ndx < self.max_index);
        unsafe { self.ttb.add(ndx as usize) }
    }

    fn aux(&self, ndx: u32) -> *mut AuxEntry {
        debug_assert!(ndx < self.max_index);
        unsafe { self.ttb_aux.add(ndx as usize) }
    }

    /// Kernel pointer to the page table a TTB entry references, via
    /// this context's bookkeeping tree.
    fn resolve_pagetab(&self, entry: TtbEntry) -> *mut PageTable {
        let node = self.page_tables.find(&entry.table_base());
        if node.is_null() {
            ptr::null_mut()
        } else {
            unsafe { (*node).table }
        }
    }

    /// Attach a page-table record to this context.
    ///
    /// # Safety
    ///
    /// The record must be unlinked and stay pinned while attached.
    pub unsafe fn attach_table(&mut self, node: *mut PageNode) {
        self.page_tables.insert(node);
    }

    /// Read a first-level descriptor (diagnostics and tests).
    pub fn entry_at(&self, ndx: u32) -> TtbEntry {
        unsafe { *self.entry(ndx) }
    }

    /// Read a first-level auxiliary word (diagnostics and tests).
    pub fn aux_at(&self, ndx: u32) -> AuxEntry {
        unsafe { *self.aux(ndx) }
    }

    /// Read one second-level descriptor pair under a TTB slot, if that
    /// slot holds a page table this context knows about.
    pub fn page_entry_at(&self, ndx_ttb: u32, ndx_page: u32) -> Option<(PageEntry, AuxEntry)> {
        let entry = self.entry_at(ndx_ttb);
        if !entry.is_page_table() {
            return None;
        }
        let tab = self.resolve_pagetab(entry);
        if tab.is_null() {
            return None;
        }
        unsafe {
            Some((
                (*tab).entries[ndx_page as usize],
                (*tab).aux[ndx_page as usize],
            ))
        }
    }

    /// Number of page tables attached to this context.
    pub fn attached_table_count(&self) -> usize {
        let mut n = 0;
        self.page_tables.walk(&mut |_| {
            n += 1;
            true
        });
        n
    }
}

/// Adopt the page tables built before the MMU came up. The early
/// builder mapped the whole table region at its high-half home, so
/// adoption is pure bookkeeping: thread two records per table page —
/// each 4 KiB page holds two tables — into the kernel context, with
/// the trailing unused half going to the free tree when startup says
/// so.
///
/// # Safety
///
/// Must run once, against the env of a freshly built kernel context.
pub unsafe fn adopt_initial_tables(
    env: &mut MapperEnv,
    pa_first_table: PhysAddr,
    ka_first_table: KernAddr,
    cpg_tables: u32,
    free_on_last_page: u32,
) -> MmResult<()> {
    let kernel = env.kernel;
    for i in 0..cpg_tables {
        let pa = pa_first_table + (i << PAGE_BITS);
        let ka = ka_first_table + (i << PAGE_BITS);
        let table = env.phys.kernel_ptr(ka, pa) as *mut PageTable;
        let pair = core::mem::size_of::<PageTable>() as u32;

        let node_size = core::mem::size_of::<PageNode>();
        let first = env.node_alloc.alloc(node_size) as *mut PageNode;
        let second = env.node_alloc.alloc(node_size) as *mut PageNode;
        if first.is_null() || second.is_null() {
            return Err(MmError::OutOfMemory);
        }
        PageNode::init(first, pa, table);
        (*kernel).attach_table(first);
        PageNode::init(second, pa + pair, table.add(1));
        if i == cpg_tables - 1 && free_on_last_page != 0 {
            env.free_tables.insert(second);
        } else {
            (*kernel).attach_table(second);
        }
    }
    Ok(())
}

/// Walk the kernel context once and install the page-database back
/// pointer for every live mapping that is tracked there. Run after the
/// database is built; from then on the mapper keeps it current.
///
/// # Safety
///
/// `ctxt` must be the live kernel context.
pub unsafe fn replay_pte_mappings(ctxt: *const VmContext, mpdb: &mut Mpdb) {
    let ctxt = &*ctxt;
    for i in 0..ctxt.max_index {
        let entry = *ctxt.entry(i);
        match entry.kind() {
            TtbKind::PageTable => {
                let tab = ctxt.resolve_pagetab(entry);
                if tab.is_null() {
                    continue;
                }
                let mut pa_pte = entry.table_base();
                for j in 0..PGTBL_ENTRIES {
                    let pe = (*tab).entries[j as usize];
                    if pe.is_small_page() && !(*tab).aux[j as usize].notpage() {
                        mpdb.set_pte_address(page_index(pe.page_base()), pa_pte, false);
                    }
                    pa_pte += 4;
                }
            }
            TtbKind::Section => {
                if !(*ctxt.aux(i)).notpage() {
                    let pa_pte = ctxt.ttb_pa + i * 4;
                    for j in 0..SEC_PAGES {
                        mpdb.set_pte_address(
                            page_index(entry.section_base()) + j,
                            pa_pte,
                            true,
                        );
                    }
                }
            }
            TtbKind::Fault => {}
        }
    }
}

/// How the mapper reaches memory it knows only by kernel VA + PA.
/// Direct on the target (kernel VAs are dereferencable); host tests
/// reach through the fake-RAM window instead.
#[derive(Clone, Copy)]
pub struct PhysAccess {
    #[cfg(not(target_arch = "arm"))]
    window: PhysWindow,
}

// SAFETY: the access descriptor is plain address arithmetic; the
// memory it reaches is guarded by the kernel lock.
unsafe impl Send for PhysAccess {}

impl PhysAccess {
    #[cfg(target_arch = "arm")]
    pub const fn direct() -> PhysAccess {
        PhysAccess {}
    }

    #[cfg(not(target_arch = "arm"))]
    pub fn with_window(window: PhysWindow) -> PhysAccess {
        PhysAccess { window }
    }

    /// Pointer for a kernel mapping whose VA and backing PA are both
    /// known.
    #[allow(unused_variables)]
    pub fn kernel_ptr(&self, ka: KernAddr, pa: PhysAddr) -> *mut u8 {
        #[cfg(target_arch = "arm")]
        {
            ka as usize as *mut u8
        }
        #[cfg(not(target_arch = "arm"))]
        {
            self.window.ptr(pa)
        }
    }
}

/// The shared mapper environment: everything the walkers may need
/// besides the target context. The kernel context is raw because the
/// page-table allocation recursion re-enters it while a user-context
/// operation is in flight.
pub struct MapperEnv<'a> {
    pub kernel: *mut VmContext,
    pub free_tables: &'a mut RbTree<PageNodeAdapter>,
    pub mpdb: Option<&'a mut Mpdb>,
    pub kva: &'a mut KernelSpace,
    pub node_alloc: &'a dyn Allocator,
    pub phys: PhysAccess,
}

impl MapperEnv<'_> {
    /// Select the context an address resolves against: addresses above
    /// the TTB fence always belong to the kernel context.
    ///
    /// # Safety
    ///
    /// `user`, when non-null, must point at a live context distinct
    /// from the kernel context.
    pub unsafe fn resolve(&self, user: *mut VmContext, vma: KernAddr) -> *mut VmContext {
        if user.is_null() || (vma & VMADDR_TTB_FENCE) != 0 {
            self.kernel
        } else {
            user
        }
    }

    fn pte_hook(&mut self, notpage: bool, ndx_page: u32, pte_pa: PhysAddr, is_section: bool) {
        if notpage {
            return;
        }
        if let Some(mpdb) = self.mpdb.as_deref_mut() {
            mpdb.set_pte_address(ndx_page, pte_pa, is_section);
        }
    }
}

// ---------------------------------------------------------------------------
// Virtual-to-physical resolution
// ---------------------------------------------------------------------------

/// Resolve a virtual address against a context. None when the address
/// is unmapped or the covering page table cannot be resolved.
///
/// # Safety
///
/// `ctxt` must be a live context.
pub unsafe fn virt_to_phys(ctxt: *const VmContext, vma: KernAddr) -> Option<PhysAddr> {
    let ctxt = &*ctxt;
    let entry = *ctxt.entry(ttb_index(vma));
    match entry.kind() {
        TtbKind::Fault => None,
        TtbKind::Section => Some(entry.section_base() | (vma & !SectionFlags::BASE)),
        TtbKind::PageTable => {
            let tab = ctxt.resolve_pagetab(entry);
            if tab.is_null() {
                return None;
            }
            let pe = (*tab).entries[pgtbl_index(vma) as usize];
            if !pe.is_present() {
                return None;
            }
            Some(pe.page_base() | (vma & (PAGE_SIZE - 1)))
        }
    }
}

// ---------------------------------------------------------------------------
// Demap
// ---------------------------------------------------------------------------

/// Move an emptied page table back to the free tree.
unsafe fn free_page_table(env: &mut MapperEnv, ctxt: *mut VmContext, pa_table: PhysAddr) {
    let node = (*ctxt).page_tables.delete(&pa_table);
    if !node.is_null() {
        env.free_tables.insert(node);
    }
}

/// Demap within one TTB slot. Returns the number of pages handled.
#[allow(clippy::too_many_arguments)]
unsafe fn demap_pages1(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    mut vma_start: KernAddr,
    ndx_ttb: u32,
    ndx_page: u32,
    cpg: u32,
    control: DemapControl,
) -> MmResult<u32> {
    let cpg_current = cpg.min(PGTBL_ENTRIES - ndx_page);
    let entry = *(*ctxt).entry(ndx_ttb);
    let aux = *(*ctxt).aux(ndx_ttb);

    if entry.is_section() && cpg_current == PGTBL_ENTRIES && ndx_page == 0 {
        // The whole section dies.
        if aux.sacred() && !control.contains(DemapControl::NOTHING_SACRED) {
            return Err(MmError::Sacred);
        }
        let pa = entry.section_base();
        if entry.section_cacheable() {
            arch::flush_cache_for_section(vma_start, !aux.unwriteable());
        }
        *(*ctxt).entry(ndx_ttb) = TtbEntry::FAULT;
        *(*ctxt).aux(ndx_ttb) = AuxEntry::CLEAR;
        for i in 0..SEC_PAGES {
            env.pte_hook(aux.notpage(), page_index(pa) + i, 0, false);
        }
        arch::flush_tlb_for_section(vma_start);
    } else if entry.is_page_table() {
        let tab = (*ctxt).resolve_pagetab(entry);
        if tab.is_null() {
            return Err(MmError::NoPageTable);
        }
        for i in 0..cpg_current {
            let slot = (ndx_page + i) as usize;
            if (*tab).aux[slot].sacred() && !control.contains(DemapControl::NOTHING_SACRED) {
                return Err(MmError::Sacred);
            }
        }
        for i in 0..cpg_current {
            let slot = (ndx_page + i) as usize;
            let pe = (*tab).entries[slot];
            let pe_aux = (*tab).aux[slot];
            if pe.cacheable() {
                arch::flush_cache_for_page(vma_start, !pe_aux.unwriteable());
            }
            (*tab).entries[slot] = PageEntry::FAULT;
            (*tab).aux[slot] = AuxEntry::CLEAR;
            if pe.is_present() {
                env.pte_hook(pe_aux.notpage(), page_index(pe.page_base()), 0, false);
            }
            arch::flush_tlb_for_page(vma_start);
            vma_start += PAGE_SIZE;
        }
        if (*tab).is_empty() {
            // The table emptied out: detach it and put it on the free
            // tree for the next allocation.
            let pa_table = entry.table_base();
            *(*ctxt).entry(ndx_ttb) = TtbEntry::FAULT;
            *(*ctxt).aux(ndx_ttb) = AuxEntry::CLEAR;
            free_page_table(env, ctxt, pa_table);
            arch::flush_tlb_for_section(indices_to_vma(ndx_ttb, 0, 0));
        }
    }
    // A partial range over a section (or a fault slot) has nothing to
    // do at this granularity; the pages still count as handled.
    Ok(cpg_current)
}

/// Demap `cpg` pages at `vma_base` in `ctxt`.
///
/// # Safety
///
/// `ctxt` must be a live context; the env invariants must hold.
pub unsafe fn demap_pages(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    mut vma_base: KernAddr,
    cpg: u32,
    control: DemapControl,
) -> MmResult<()> {
    let mut ndx_ttb = ttb_index(vma_base);
    let ndx_page = pgtbl_index(vma_base);
    let mut remaining = cpg;

    if remaining > 0 && ndx_page > 0 {
        let done = demap_pages1(env, ctxt, vma_base, ndx_ttb, ndx_page, remaining, control)?;
        remaining -= done;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
        vma_base = indices_to_vma(ndx_ttb, 0, 0);
    }
    while remaining > 0 {
        let done = demap_pages1(env, ctxt, vma_base, ndx_ttb, 0, remaining, control)?;
        remaining -= done;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
        vma_base += SEC_SIZE;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reflag
// ---------------------------------------------------------------------------

/// Expand a flag-operations request into literal clear/set mask pairs.
pub fn precalculate_masks(src: &FlagOperations, control: ReflagControl) -> FlagOperations {
    let mut dst = FlagOperations::default();

    if control.contains(ReflagControl::TABLE_COPY0) {
        dst.table[0] = TableFlags::SAFEFLAGS;
    } else if control.contains(ReflagControl::TABLE_CLEAR0) {
        dst.table[0] = src.table[0];
    }
    if control.contains(ReflagControl::TABLE_CLEAR1) {
        dst.table[0] |= src.table[1];
    }
    if control.intersects(ReflagControl::TABLE_COPY0 | ReflagControl::TABLE_SET0) {
        dst.table[1] = src.table[0];
    }
    dst.table[0] &= TableFlags::SAFEFLAGS;
    dst.table[1] &= TableFlags::SAFEFLAGS;

    if control.contains(ReflagControl::PAGE_COPY0) {
        dst.page[0] = PageFlags::SAFEFLAGS;
    } else if control.contains(ReflagControl::PAGE_CLEAR0) {
        dst.page[0] = src.page[0];
    }
    if control.contains(ReflagControl::PAGE_CLEAR1) {
        dst.page[0] |= src.page[1];
    }
    if control.intersects(ReflagControl::PAGE_COPY0 | ReflagControl::PAGE_SET0) {
        dst.page[1] = src.page[0];
    }
    dst.page[0] &= PageFlags::SAFEFLAGS;
    dst.page[1] &= PageFlags::SAFEFLAGS;

    if control.contains(ReflagControl::AUX_COPY0) {
        dst.aux[0] = AuxFlags::SAFEFLAGS;
    } else if control.contains(ReflagControl::AUX_CLEAR0) {
        dst.aux[0] = src.aux[0];
    }
    if control.contains(ReflagControl::AUX_CLEAR1) {
        dst.aux[0] |= src.aux[1];
    }
    if control.intersects(ReflagControl::AUX_COPY0 | ReflagControl::AUX_SET0) {
        dst.aux[1] = src.aux[0];
    }
    dst.aux[0] &= AuxFlags::SAFEFLAGS;
    dst.aux[1] &= AuxFlags::SAFEFLAGS;

    dst
}

/// Reflag within one TTB slot. Returns the number of pages handled.
/// Reflagging never moves frames, so the page-database back pointers
/// stay valid and no hook fires.
#[allow(clippy::too_many_arguments)]
unsafe fn reflag_pages1(
    ctxt: *mut VmContext,
    mut vma_start: KernAddr,
    ndx_ttb: u32,
    ndx_page: u32,
    cpg: u32,
    ops: &FlagOperations,
    control: ReflagControl,
) -> MmResult<u32> {
    debug_assert!(control.contains(ReflagControl::PRECALCULATED));

    let cpg_current = cpg.min(PGTBL_ENTRIES - ndx_page);
    let entry = *(*ctxt).entry(ndx_ttb);
    let aux = *(*ctxt).aux(ndx_ttb);

    if entry.is_fault() {
        return Ok(cpg_current); // nothing mapped here, nothing to do
    }

    if entry.is_section() && cpg_current == PGTBL_ENTRIES && ndx_page == 0 {
        // Remap the section word directly.
        if aux.sacred() && !control.contains(ReflagControl::NOTHING_SACRED) {
            return Err(MmError::Sacred);
        }
        if entry.section_cacheable() {
            arch::flush_cache_for_section(vma_start, !aux.unwriteable());
        }
        let clear = make_section_flags(
            TableFlags::from_bits_retain(ops.table[0]),
            PageFlags::from_bits_retain(ops.page[0]),
        )
        .bits()
            & SectionFlags::SAFEFLAGS;
        let set = make_section_flags(
            TableFlags::from_bits_retain(ops.table[1]),
            PageFlags::from_bits_retain(ops.page[1]),
        )
        .bits()
            & SectionFlags::SAFEFLAGS;
        (*(*ctxt).entry(ndx_ttb)).0 = (entry.0 & !clear) | set;
        let aux_clear = make_section_aux_flags(AuxFlags::from_bits_retain(ops.aux[0])).bits();
        let aux_set = make_section_aux_flags(AuxFlags::from_bits_retain(ops.aux[1])).bits();
        (*(*ctxt).aux(ndx_ttb)).0 = (aux.0 & !aux_clear) | aux_set;
        arch::flush_tlb_for_section(vma_start);
    } else if entry.is_page_table() {
        let tab = (*ctxt).resolve_pagetab(entry);
        if tab.is_null() {
            return Err(MmError::NoPageTable);
        }
        for i in 0..cpg_current {
            if (*tab).aux[(ndx_page + i) as usize].sacred()
                && !control.contains(ReflagControl::NOTHING_SACRED)
            {
                return Err(MmError::Sacred);
            }
        }

        // When the change touches table-level flags, every entry of
        // this section *outside* the reflagged range must be
        // unallocated; otherwise we would silently change attributes
        // under a peer mapping.
        let new_table = (entry.0 & !ops.table[0]) | ops.table[1];
        let mut flip_section = false;
        if new_table != entry.0 {
            for i in 0..ndx_page {
                if (*tab).entries[i as usize].is_present() {
                    return Err(MmError::Collided);
                }
            }
            for i in ndx_page + cpg_current..PGTBL_ENTRIES {
                if (*tab).entries[i as usize].is_present() {
                    return Err(MmError::Collided);
                }
            }
            flip_section = true;
            arch::flush_cache_for_section(indices_to_vma(ndx_ttb, 0, 0), !aux.unwriteable());
            (*(*ctxt).entry(ndx_ttb)).0 = new_table;
        }

        for i in 0..cpg_current {
            let slot = (ndx_page + i) as usize;
            let pe = (*tab).entries[slot];
            if !pe.is_present() {
                vma_start += PAGE_SIZE;
                continue;
            }
            if !flip_section && pe.cacheable() {
                arch::flush_cache_for_page(
                    vma_start,
                    !(*tab).aux[slot].unwriteable(),
                );
            }
            (*tab).entries[slot].0 = (pe.0 & !ops.page[0]) | ops.page[1];
            (*tab).aux[slot].0 = ((*tab).aux[slot].0 & !ops.aux[0]) | ops.aux[1];
            if !flip_section {
                arch::flush_tlb_for_page(vma_start);
            }
            vma_start += PAGE_SIZE;
        }
        if flip_section {
            arch::flush_tlb_for_section(indices_to_vma(ndx_ttb, 0, 0));
        }
    }
    Ok(cpg_current)
}

/// Reflag `cpg` pages at `vma_base` in `ctxt`.
///
/// # Safety
///
/// As [`demap_pages`].
pub unsafe fn reflag_pages(
    ctxt: *mut VmContext,
    mut vma_base: KernAddr,
    cpg: u32,
    ops: &FlagOperations,
    control: ReflagControl,
) -> MmResult<()> {
    let real_ops;
    let control = if control.contains(ReflagControl::PRECALCULATED) {
        real_ops = *ops;
        control
    } else {
        real_ops = precalculate_masks(ops, control);
        control | ReflagControl::PRECALCULATED
    };

    let mut ndx_ttb = ttb_index(vma_base);
    let ndx_page = pgtbl_index(vma_base);
    let mut remaining = cpg;

    if remaining > 0 && ndx_page > 0 {
        let done = reflag_pages1(
            ctxt, vma_base, ndx_ttb, ndx_page, remaining, &real_ops, control,
        )?;
        remaining -= done;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
        vma_base = indices_to_vma(ndx_ttb, 0, 0);
    }
    while remaining > 0 {
        let done = reflag_pages1(ctxt, vma_base, ndx_ttb, 0, remaining, &real_ops, control)?;
        remaining -= done;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
        vma_base += SEC_SIZE;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Allocate a page table and point the given TTB slot at it.
///
/// The free tree is tried first. Otherwise — unless allocation is
/// forbidden — a fresh frame is taken, mapped into a one-page kernel
/// window, and split into an attached table plus a second, free table.
/// Failure at any step unwinds the frame, window and mapping.
unsafe fn alloc_page_table(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    ndx_ttb: u32,
    table_flags: TableFlags,
    control: MapControl,
) -> MmResult<*mut PageTable> {
    let node: *mut PageNode;

    if env.free_tables.is_empty() {
        if control.contains(MapControl::DONT_ALLOC) {
            return Err(MmError::Recursed);
        }
        let kernel = env.kernel;

        // Take a fresh frame for two new tables. A plain (non-zeroed)
        // frame is fine: the table is cleared below, so this cannot
        // re-enter the mapper through the zero path.
        let mpdb = env.mpdb.as_deref_mut().ok_or(MmError::OutOfMemory)?;
        let taken = mpdb.take_page(AllocFlags::empty()).ok_or(MmError::OutOfMemory)?;
        let pa_new = super::layout::page_addr(taken.ndx);
        mpdb.tag_page(taken.ndx, PageTag::System, subtag::PGTBL);

        let ka_new = match env.kva.allocate(env.node_alloc, 1) {
            Some(ka) => ka,
            None => {
                let mpdb = env.mpdb.as_deref_mut().unwrap();
                let _ = mpdb.free_frame(pa_new, PageTag::System, subtag::PGTBL);
                return Err(MmError::NoKernelSpace);
            }
        };

        unsafe fn unwind_frame_and_va(env: &mut MapperEnv, ka_new: KernAddr, pa_new: PhysAddr) {
            env.kva.free(env.node_alloc, ka_new, 1);
            let mpdb = env.mpdb.as_deref_mut().unwrap();
            let _ = mpdb.free_frame(pa_new, PageTag::System, subtag::PGTBL);
        }

        // Map the new page into the kernel window; further table
        // allocation is forbidden on this recursion.
        if let Err(e) = map_pages(
            env,
            kernel,
            pa_new,
            ka_new,
            1,
            TTBFLAGS_KERNEL_DATA,
            PGTBLFLAGS_KERNEL_DATA,
            PGAUXFLAGS_KERNEL_DATA,
            MapControl::DONT_ALLOC,
        ) {
            unwind_frame_and_va(env, ka_new, pa_new);
            return Err(e);
        }

        // Two bookkeeping records: the table we hand out now, and the
        // second half of the frame, which goes straight to the free
        // tree.
        let node_size = core::mem::size_of::<PageNode>();
        let free_node = env.node_alloc.alloc(node_size) as *mut PageNode;
        let attached_node = env.node_alloc.alloc(node_size) as *mut PageNode;
        if free_node.is_null() || attached_node.is_null() {
            env.node_alloc.free(free_node as *mut u8);
            env.node_alloc.free(attached_node as *mut u8);
            let _ = demap_pages(env, kernel, ka_new, 1, DemapControl::NOTHING_SACRED);
            unwind_frame_and_va(env, ka_new, pa_new);
            return Err(MmError::OutOfMemory);
        }

        let table = env.phys.kernel_ptr(ka_new, pa_new) as *mut PageTable;
        let pair = core::mem::size_of::<PageTable>() as u32;
        PageNode::init(free_node, pa_new + pair, table.add(1));
        env.free_tables.insert(free_node);
        PageNode::init(attached_node, pa_new, table);
        (*ctxt).attach_table(attached_node);
        node = attached_node;
    } else {
        // Recycle the lowest free table into this context.
        let min = env.free_tables.find_min();
        let key = (*min).pa;
        node = env.free_tables.delete(&key);
        debug_assert_eq!(node, min);
        (*ctxt).attach_table(node);
    }

    let table = (*node).table;
    (*table).zero();
    *(*ctxt).entry(ndx_ttb) = TtbEntry::page_table((*node).pa, table_flags);
    *(*ctxt).aux(ndx_ttb) = AuxEntry::new(TTBAUXFLAGS_PAGETABLE);
    Ok(table)
}

/// Map within one TTB slot. Returns the number of pages handled.
#[allow(clippy::too_many_arguments)]
unsafe fn map_pages1(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    mut pa_base: PhysAddr,
    ndx_ttb: u32,
    ndx_page: u32,
    cpg: u32,
    table_flags: TableFlags,
    page_flags: PageFlags,
    aux_flags: AuxFlags,
    control: MapControl,
) -> MmResult<u32> {
    let entry = *(*ctxt).entry(ndx_ttb);
    let (tab, pa_ptab): (*mut PageTable, PhysAddr) = match entry.kind() {
        TtbKind::Fault => {
            let tab = alloc_page_table(env, ctxt, ndx_ttb, table_flags, control)?;
            let pa = (*(*ctxt).entry(ndx_ttb)).table_base();
            (tab, pa)
        }
        TtbKind::PageTable => {
            if entry.table_flags() != table_flags {
                return Err(MmError::BadTtbFlags);
            }
            let tab = (*ctxt).resolve_pagetab(entry);
            if tab.is_null() {
                return Err(MmError::NoPageTable);
            }
            (tab, entry.table_base())
        }
        TtbKind::Section => {
            // Piggybacking on an existing section is fine as long as
            // flags and physical base line up exactly.
            if entry.section_flags() != make_section_flags(table_flags, page_flags) {
                return Err(MmError::BadTtbFlags);
            }
            if (*(*ctxt).aux(ndx_ttb)).flags() != make_section_aux_flags(aux_flags) {
                return Err(MmError::BadTtbFlags);
            }
            if entry.section_base() != pa_base & SectionFlags::BASE {
                return Err(MmError::Collided);
            }
            (ptr::null_mut(), (*ctxt).ttb_pa + ndx_ttb * 4)
        }
    };

    let cpg_current = cpg.min(PGTBL_ENTRIES - ndx_page);

    if !tab.is_null() {
        for i in 0..cpg_current {
            let slot = (ndx_page + i) as usize;
            if (*tab).entries[slot].is_present() {
                // Collision: reverse the entries written in this call.
                for j in (0..i).rev() {
                    let undo = (ndx_page + j) as usize;
                    let pe = (*tab).entries[undo];
                    (*tab).entries[undo] = PageEntry::FAULT;
                    (*tab).aux[undo] = AuxEntry::CLEAR;
                    env.pte_hook(
                        aux_flags.contains(AuxFlags::NOTPAGE),
                        page_index(pe.page_base()),
                        0,
                        false,
                    );
                }
                return Err(MmError::Collided);
            }
            (*tab).entries[slot] = PageEntry::small_page(pa_base, page_flags);
            (*tab).aux[slot] = AuxEntry::new(aux_flags);
            env.pte_hook(
                aux_flags.contains(AuxFlags::NOTPAGE),
                page_index(pa_base),
                pa_ptab + (ndx_page + i) * 4,
                false,
            );
            pa_base += PAGE_SIZE;
        }
    } else {
        // Covered by a section descriptor: record the section word as
        // the back pointer for each frame.
        for i in 0..cpg_current {
            env.pte_hook(
                aux_flags.contains(AuxFlags::NOTPAGE),
                page_index(pa_base & SectionFlags::BASE) + ndx_page + i,
                pa_ptab,
                true,
            );
        }
    }
    Ok(cpg_current)
}

/// Map `cpg` pages of physically contiguous memory at `vma_base` in
/// `ctxt`, choosing section descriptors whenever physical and virtual
/// alignment allow. On failure everything mapped by this call is
/// demapped again before the error returns.
///
/// # Safety
///
/// As [`demap_pages`]; the physical range must be owned by the caller.
#[allow(clippy::too_many_arguments)]
pub unsafe fn map_pages(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    pa_base: PhysAddr,
    vma_base: KernAddr,
    cpg: u32,
    table_flags: TableFlags,
    page_flags: PageFlags,
    aux_flags: AuxFlags,
    control: MapControl,
) -> MmResult<()> {
    let mut remaining = cpg;
    let result = map_pages_walk(
        env,
        ctxt,
        pa_base,
        vma_base,
        &mut remaining,
        table_flags,
        page_flags,
        aux_flags,
        control,
    );
    if let Err(e) = result {
        // Unwind everything this call managed to map.
        let mapped = cpg - remaining;
        if mapped > 0 {
            let _ = demap_pages(env, ctxt, vma_base, mapped, DemapControl::NOTHING_SACRED);
        }
        return Err(e);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
unsafe fn map_pages_walk(
    env: &mut MapperEnv,
    ctxt: *mut VmContext,
    mut pa_base: PhysAddr,
    vma_base: KernAddr,
    remaining: &mut u32,
    table_flags: TableFlags,
    page_flags: PageFlags,
    aux_flags: AuxFlags,
    control: MapControl,
) -> MmResult<()> {
    let mut ndx_ttb = ttb_index(vma_base);
    let ndx_page = pgtbl_index(vma_base);

    if *remaining > 0 && ndx_page > 0 {
        // Head fragment up to the next section boundary.
        let done = map_pages1(
            env, ctxt, pa_base, ndx_ttb, ndx_page, *remaining, table_flags, page_flags,
            aux_flags, control,
        )?;
        *remaining -= done;
        pa_base += done << PAGE_BITS;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && *remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
    }
    if *remaining == 0 {
        return Ok(());
    }

    let by_section = *remaining >= PGTBL_ENTRIES && (pa_base & SectionFlags::BASE) == pa_base;
    let sec_flags = make_section_flags(table_flags, page_flags);
    let sec_aux = make_section_aux_flags(aux_flags);

    while *remaining >= PGTBL_ENTRIES {
        let mut done = PGTBL_ENTRIES;
        if by_section {
            let entry = *(*ctxt).entry(ndx_ttb);
            match entry.kind() {
                TtbKind::Fault => {
                    *(*ctxt).entry(ndx_ttb) = TtbEntry::section(pa_base, sec_flags);
                    *(*ctxt).aux(ndx_ttb) = AuxEntry::new(sec_aux);
                    let pa_pte = (*ctxt).ttb_pa + ndx_ttb * 4;
                    for i in 0..SEC_PAGES {
                        env.pte_hook(
                            aux_flags.contains(AuxFlags::NOTPAGE),
                            page_index(pa_base) + i,
                            pa_pte,
                            true,
                        );
                    }
                }
                TtbKind::PageTable => {
                    // A table already covers this slot; fall back to
                    // page-granular entries inside it.
                    done = map_pages1(
                        env, ctxt, pa_base, ndx_ttb, 0, *remaining, table_flags, page_flags,
                        aux_flags, control,
                    )?;
                }
                TtbKind::Section => {
                    if entry.section_flags() != sec_flags
                        || (*(*ctxt).aux(ndx_ttb)).flags() != sec_aux
                    {
                        return Err(MmError::BadTtbFlags);
                    }
                    if entry.section_base() != pa_base {
                        return Err(MmError::Collided);
                    }
                }
            }
        } else {
            done = map_pages1(
                env, ctxt, pa_base, ndx_ttb, 0, *remaining, table_flags, page_flags, aux_flags,
                control,
            )?;
        }
        pa_base += done << PAGE_BITS;
        *remaining -= done;
        ndx_ttb += 1;
        if ndx_ttb == (*ctxt).max_index && *remaining > 0 {
            return Err(MmError::EndOfTtb);
        }
    }

    if *remaining > 0 {
        // Tail fragment in the next slot.
        let done = map_pages1(
            env, ctxt, pa_base, ndx_ttb, 0, *remaining, table_flags, page_flags, aux_flags,
            control,
        )?;
        *remaining -= done;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::init_heap::InitHeap;
    use crate::status::MmError;

    // A small fake machine: 8 MiB of "RAM" in a Vec, a 4096-entry
    // kernel TTB at PA 0x4000 with its shadow behind it, a handful of
    // preallocated page tables, and seeded kernel address space.
    struct Machine {
        _ram: Vec<u8>,
        win: PhysWindow,
        _heap_buf: Vec<u64>,
        heap: InitHeap,
        kernel: Box<VmContext>,
        free_tables: RbTree<PageNodeAdapter>,
        kva: KernelSpace,
    }

    const PA_TTB: PhysAddr = 0x0000_4000;
    const PA_TABLES: PhysAddr = 0x0001_0000;

    impl Machine {
        fn new() -> Machine {
            let mut ram = vec![0u8; 0x80_0000];
            let win = unsafe { PhysWindow::new(ram.as_mut_ptr(), 0, ram.len() as u32) };
            let mut heap_buf = vec![0u64; 16384 / 8];
            let heap = unsafe { InitHeap::new(heap_buf.as_mut_ptr() as *mut u8, 16384) };

            let kernel = unsafe {
                Box::new(VmContext::new(
                    win.typed::<TtbEntry>(PA_TTB),
                    win.typed::<AuxEntry>(PA_TTB + super::super::layout::TTB1_SIZE),
                    PA_TTB,
                    4096,
                ))
            };
            let mut kva = KernelSpace::new();
            kva.seed(&heap, 0xC060_0000, 0xE000_0000);

            let mut m = Machine {
                _ram: ram,
                win,
                _heap_buf: heap_buf,
                heap,
                kernel,
                free_tables: RbTree::new(),
                kva,
            };
            // Seed the free-table tree with both halves of one table
            // page, the way startup does.
            for half in 0..2 {
                let pa = PA_TABLES + half * 2048;
                let table = m.win.typed::<PageTable>(pa);
                unsafe {
                    (*table).zero();
                    let node = m.heap.alloc(core::mem::size_of::<PageNode>()) as *mut PageNode;
                    PageNode::init(node, pa, table);
                    m.free_tables.insert(node);
                }
            }
            m
        }

        fn env(&mut self) -> MapperEnv<'_> {
            MapperEnv {
                kernel: &mut *self.kernel,
                free_tables: &mut self.free_tables,
                mpdb: None,
                kva: &mut self.kva,
                node_alloc: &self.heap,
                phys: PhysAccess::with_window(self.win),
            }
        }
    }

    #[test]
    fn map_and_resolve_small_pages() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            map_pages(
                &mut env,
                kernel,
                0x0010_0000,
                0xC123_4000,
                3,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map");
            assert_eq!(virt_to_phys(kernel, 0xC123_4123), Some(0x0010_0123));
            assert_eq!(virt_to_phys(kernel, 0xC123_6FFF), Some(0x0010_2FFF));
            assert_eq!(virt_to_phys(kernel, 0xC123_7000), None);
        }
    }

    #[test]
    fn map_rejects_incompatible_table_flags() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            map_pages(
                &mut env,
                kernel,
                0x0010_0000,
                0xC123_4000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map");
            // Same slot, different table flags.
            let err = map_pages(
                &mut env,
                kernel,
                0x0020_0000,
                0xC123_8000,
                1,
                TableFlags::ALWAYS | TableFlags::PXN,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .unwrap_err();
            assert_eq!(err, MmError::BadTtbFlags);
        }
    }

    #[test]
    fn collision_rolls_back_partial_inner_work() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            map_pages(
                &mut env,
                kernel,
                0x0030_0000,
                0xC200_2000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map");
            // This map would cover pages 0..4 of the slot; page 2 is
            // taken, so the whole call must fail and leave pages 0..1
            // unmapped again.
            let err = map_pages(
                &mut env,
                kernel,
                0x0040_0000,
                0xC200_0000,
                4,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .unwrap_err();
            assert_eq!(err, MmError::Collided);
            assert_eq!(virt_to_phys(kernel, 0xC200_0000), None);
            assert_eq!(virt_to_phys(kernel, 0xC200_1000), None);
            assert_eq!(virt_to_phys(kernel, 0xC200_2000), Some(0x0030_0000));
        }
    }

    #[test]
    fn dont_alloc_recurses_out_when_tables_run_dry() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            // Drain the two free tables.
            map_pages(
                &mut env,
                kernel,
                0x0010_0000,
                0xC300_0000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::DONT_ALLOC,
            )
            .expect("first table");
            map_pages(
                &mut env,
                kernel,
                0x0010_0000,
                0xC310_0000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::DONT_ALLOC,
            )
            .expect("second table");
            // No free tables, no MPDB, allocation forbidden.
            let err = map_pages(
                &mut env,
                kernel,
                0x0010_0000,
                0xC320_0000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::DONT_ALLOC,
            )
            .unwrap_err();
            assert_eq!(err, MmError::Recursed);
        }
    }

    #[test]
    fn reflag_changes_page_protection() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            map_pages(
                &mut env,
                kernel,
                0x0050_0000,
                0xC400_0000,
                2,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map");
            // Make both pages read-only (APX set).
            let ops = FlagOperations {
                page: [PageFlags::APX.bits(), 0],
                ..FlagOperations::default()
            };
            reflag_pages(
                kernel,
                0xC400_0000,
                2,
                &ops,
                ReflagControl::PAGE_SET0 | ReflagControl::NOTHING_SACRED,
            )
            .expect("reflag");

            let entry = *(*kernel).entry(ttb_index(0xC400_0000));
            let tab = (*kernel).resolve_pagetab(entry);
            let pf = (*tab).entries[0].page_flags();
            assert!(pf.contains(PageFlags::APX));
            // Table-level flags untouched: no collision check needed.
        }
    }

    #[test]
    fn reflag_table_flags_collides_with_peer_mappings() {
        let mut m = Machine::new();
        let mut env = m.env();
        let kernel = env.kernel;
        unsafe {
            // Two separate mappings share the 0xC500 slot.
            map_pages(
                &mut env,
                kernel,
                0x0060_0000,
                0xC500_0000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map a");
            map_pages(
                &mut env,
                kernel,
                0x0061_0000,
                0xC500_8000,
                1,
                TTBFLAGS_KERNEL_DATA,
                PGTBLFLAGS_KERNEL_DATA,
                PGAUXFLAGS_KERNEL_DATA,
                MapControl::empty(),
            )
            .expect("map b");

            // Changing a table-level flag over only the first page
            // must refuse: the peer at page 8 would silently change.
            let ops = FlagOperations {
                table: [TableFlags::PXN.bits(), 0],
                ..FlagOperations::default()
            };
            let err = reflag_pages(
                kernel,
                0xC500_0000,
                1,
                &ops,
                ReflagControl::TABLE_SET0 | ReflagControl::NOTHING_SACRED,
            )
            .unwrap_err();
            assert_eq!(err, MmError::Collided);
        }
    }

    #[test]
    fn precalculated_masks_clamp_to_safe_flags() {
        let src = FlagOperations {
            table: [0xFFFF_FFFF, 0],
            page: [0xFFFF_FFFF, 0],
            aux: [0xFFFF_FFFF, 0],
        };
        let out = precalculate_masks(
            &src,
            ReflagControl::TABLE_SET0 | ReflagControl::PAGE_SET0 | ReflagControl::AUX_SET0,
        );
        assert_eq!(out.table[1] & !TableFlags::SAFEFLAGS, 0);
        assert_eq!(out.page[1] & !PageFlags::SAFEFLAGS, 0);
        assert_eq!(out.aux[1] & !AuxFlags::SAFEFLAGS, 0);
        // The type bits can never be flipped by a reflag.
        assert_eq!(out.page[1] & PageFlags::ALWAYS.bits(), 0);
    }
}
