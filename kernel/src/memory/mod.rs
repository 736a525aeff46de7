//! Kernel memory management.
//!
//! The subsystems in this module are tightly coupled: the mapper may
//! need the frame allocator to grow page tables, zeroing a frame needs
//! a scratch mapping from the mapper, and both lean on the kernel
//! address-space allocator and (during bring-up) the init heap. The
//! [`MemoryManager`] aggregate owns all four under one lock — the
//! "kernel lock" of this layer — so the controlled mutual recursion
//! between them is ordinary method calls and cannot deadlock.
//!
//! Initialization order mirrors bring-up: init heap, kernel address
//! space, adoption of the early-built page tables, then the Master
//! Page Database (which replays the descriptor back pointers and takes
//! its zero-scratch window).

pub mod arch;
pub mod descriptor;
pub mod early_map;
pub mod frame_allocator;
pub mod init_heap;
pub mod kernel_va;
pub mod layout;
pub mod mapper;

use core::ptr::{self, NonNull};

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::heap::api::ChunkAllocator;
use crate::status::{MmError, MmResult, Zeroing};
use descriptor::{
    AuxFlags, PageFlags, TableFlags, PGAUXFLAGS_KERNEL_DATA, PGTBLFLAGS_KERNEL_DATA,
    TTBFLAGS_KERNEL_DATA,
};
use early_map::{BootLayout, StartupInfo};
use frame_allocator::{subtag, AllocFlags, Mpdb, MpdbEntry, PageTag};
use init_heap::InitHeap;
use kernel_va::KernelSpace;
use layout::{
    page_addr, KernAddr, PhysAddr, PAGE_BITS, PAGE_COUNT_IO, PAGE_SIZE, PHYSADDR_IO_BASE,
    TTB1_ENTRIES, VMADDR_IO_BASE, VMADDR_KERNEL_FENCE, VMADDR_KERNEL_NOMANS,
};
use mapper::{
    DemapControl, FlagOperations, MapControl, MapperEnv, PageNodeAdapter, PhysAccess,
    ReflagControl, VmContext,
};

pub use early_map::{build_initial_tables, PhysWindow};

/// The aggregated kernel memory manager.
pub struct MemoryManager {
    init_heap: InitHeap,
    kva: KernelSpace,
    kernel_ctxt: VmContext,
    free_tables: crate::collections::rbtree::RbTree<PageNodeAdapter>,
    mpdb: Option<Mpdb>,
    /// Scratch window where frames are mapped for zeroing.
    ka_zero: KernAddr,
    phys: PhysAccess,
}

impl MemoryManager {
    /// Bring the memory manager up from the startup-info record.
    ///
    /// # Safety
    ///
    /// `startup` must describe tables actually built by the early map
    /// builder; `init_heap_region` must be a valid, unaliased region
    /// of at least [`init_heap::SIZE_INIT_HEAP`]-ish size; `phys` must
    /// reach the machine's physical memory.
    pub unsafe fn new(
        startup: &StartupInfo,
        boot_layout: &BootLayout,
        init_heap_region: *mut u8,
        init_heap_len: usize,
        phys: PhysAccess,
    ) -> MmResult<MemoryManager> {
        log::info!("memory manager: init heap and kernel address space");
        let init_heap = InitHeap::new(init_heap_region, init_heap_len);

        let mut kva = KernelSpace::new();
        kva.seed(&init_heap, startup.vma_first_free, VMADDR_IO_BASE);
        kva.seed(
            &init_heap,
            VMADDR_IO_BASE + PAGE_COUNT_IO * PAGE_SIZE,
            VMADDR_KERNEL_NOMANS,
        );

        let kernel_ctxt = VmContext::new(
            phys.kernel_ptr(startup.ka_ttb, startup.pa_ttb) as *mut descriptor::TtbEntry,
            phys.kernel_ptr(startup.ka_ttb_aux, startup.pa_ttb_aux)
                as *mut descriptor::AuxEntry,
            startup.pa_ttb,
            TTB1_ENTRIES,
        );

        let mut mm = MemoryManager {
            init_heap,
            kva,
            kernel_ctxt,
            free_tables: crate::collections::rbtree::RbTree::new(),
            mpdb: None,
            ka_zero: 0,
            phys,
        };

        log::info!(
            "memory manager: adopting {} initial page-table pages",
            startup.cpg_page_tables
        );
        {
            let mut env = mm.env();
            mapper::adopt_initial_tables(
                &mut env,
                startup.pa_first_page_table,
                startup.ka_first_page_table,
                startup.cpg_page_tables,
                startup.ctbl_free_on_last_page,
            )?;

            // Drop the temporary identity windows from prestart. The
            // zero page stays: the exception vectors live there.
            let kernel = env.kernel;
            mapper::demap_pages(
                &mut env,
                kernel,
                PAGE_SIZE,
                boot_layout.cpg_prestart_total - 1,
                DemapControl::empty(),
            )?;
            mapper::demap_pages(
                &mut env,
                kernel,
                PHYSADDR_IO_BASE,
                PAGE_COUNT_IO,
                DemapControl::empty(),
            )?;

            // Pin the zero page down as kernel data owned by nobody.
            let zero_page_ops = FlagOperations {
                table: [TableFlags::SAFEFLAGS, TTBFLAGS_KERNEL_DATA.bits()],
                page: [PageFlags::SAFEFLAGS, PGTBLFLAGS_KERNEL_DATA.bits()],
                aux: [
                    AuxFlags::SAFEFLAGS,
                    (PGAUXFLAGS_KERNEL_DATA | AuxFlags::NOTPAGE).bits(),
                ],
            };
            mapper::reflag_pages(
                kernel,
                0,
                1,
                &zero_page_ops,
                ReflagControl::PRECALCULATED | ReflagControl::NOTHING_SACRED,
            )?;
        }

        log::info!("memory manager: building the master page database");
        let entries = phys.kernel_ptr(startup.ka_mpdb, startup.pa_mpdb) as *mut MpdbEntry;
        let mut mpdb = Mpdb::new(entries, startup, boot_layout);
        mapper::replay_pte_mappings(&mm.kernel_ctxt, &mut mpdb);
        mm.mpdb = Some(mpdb);

        // The one-page window frames are mapped into while they are
        // zeroed.
        mm.ka_zero = mm
            .kva
            .allocate(&mm.init_heap, 1)
            .ok_or(MmError::NoKernelSpace)?;

        Ok(mm)
    }

    /// Split-borrow the aggregate into a mapper environment.
    fn env(&mut self) -> MapperEnv<'_> {
        MapperEnv {
            kernel: &mut self.kernel_ctxt,
            free_tables: &mut self.free_tables,
            mpdb: self.mpdb.as_mut(),
            kva: &mut self.kva,
            node_alloc: &self.init_heap,
            phys: self.phys,
        }
    }

    // -- Frame allocation -------------------------------------------------

    /// Allocate one physical frame, optionally zero-filled, and stamp
    /// it with the caller's ownership tags.
    pub fn allocate_frame(
        &mut self,
        flags: AllocFlags,
        tag: PageTag,
        sub: u8,
    ) -> MmResult<PhysAddr> {
        let taken = self
            .mpdb
            .as_mut()
            .ok_or(MmError::OutOfMemory)?
            .take_page(flags)
            .ok_or(MmError::OutOfMemory)?;
        if taken.needs_zero {
            if let Err(e) = self.zero_frame(taken.ndx) {
                self.mpdb.as_mut().unwrap().untake_page(taken.ndx);
                return Err(e);
            }
        }
        self.mpdb.as_mut().unwrap().tag_page(taken.ndx, tag, sub);
        Ok(page_addr(taken.ndx))
    }

    /// Release a frame, verifying the caller's idea of its tags.
    pub fn free_frame(&mut self, pa: PhysAddr, tag: PageTag, sub: u8) -> MmResult<()> {
        self.mpdb
            .as_mut()
            .ok_or(MmError::Unexpected)?
            .free_frame(pa, tag, sub)
    }

    /// Zero a frame through the scratch window. The window is mapped
    /// with the not-tracked aux bit so the mapper will not call back
    /// into the frame database for a frame the allocator itself owns
    /// right now.
    fn zero_frame(&mut self, ndx: u32) -> MmResult<()> {
        let ka = self.ka_zero;
        debug_assert_ne!(ka, 0, "zero window not allocated yet");
        let pa = page_addr(ndx);
        let phys = self.phys;
        let mut env = self.env();
        let kernel = env.kernel;
        unsafe {
            mapper::map_pages(
                &mut env,
                kernel,
                pa,
                ka,
                1,
                TableFlags::ALWAYS,
                PageFlags::ALWAYS | PageFlags::AP01 | PageFlags::XN,
                AuxFlags::NOTPAGE,
                MapControl::empty(),
            )?;
            ptr::write_bytes(phys.kernel_ptr(ka, pa), 0, PAGE_SIZE as usize);
            mapper::demap_pages(&mut env, kernel, ka, 1, DemapControl::empty())?;
        }
        Ok(())
    }

    // -- Mapping ----------------------------------------------------------

    /// Resolve a virtual address. Addresses above the TTB fence always
    /// resolve against the kernel context.
    pub fn get_phys_addr(
        &mut self,
        user: Option<&mut VmContext>,
        vma: KernAddr,
    ) -> Option<PhysAddr> {
        let user = user.map_or(ptr::null_mut(), |u| u as *mut VmContext);
        let env = self.env();
        unsafe {
            let ctxt = env.resolve(user, vma);
            mapper::virt_to_phys(ctxt, vma)
        }
    }

    /// Map `cpg` pages of physical memory at `vma_base`.
    pub fn map_pages(
        &mut self,
        user: Option<&mut VmContext>,
        pa_base: PhysAddr,
        vma_base: KernAddr,
        cpg: u32,
        table_flags: TableFlags,
        page_flags: PageFlags,
        aux_flags: AuxFlags,
    ) -> MmResult<()> {
        let user = user.map_or(ptr::null_mut(), |u| u as *mut VmContext);
        let mut env = self.env();
        unsafe {
            let ctxt = env.resolve(user, vma_base);
            mapper::map_pages(
                &mut env,
                ctxt,
                pa_base,
                vma_base,
                cpg,
                table_flags,
                page_flags,
                aux_flags,
                MapControl::empty(),
            )
        }
    }

    /// Demap `cpg` pages at `vma_base`. Sacred mappings refuse.
    pub fn demap_pages(
        &mut self,
        user: Option<&mut VmContext>,
        vma_base: KernAddr,
        cpg: u32,
    ) -> MmResult<()> {
        let user = user.map_or(ptr::null_mut(), |u| u as *mut VmContext);
        let mut env = self.env();
        unsafe {
            let ctxt = env.resolve(user, vma_base);
            mapper::demap_pages(&mut env, ctxt, vma_base, cpg, DemapControl::empty())
        }
    }

    /// Rewrite mapping flags over a range. The sacred override bit is
    /// not honored from outside.
    pub fn reflag_pages(
        &mut self,
        user: Option<&mut VmContext>,
        vma_base: KernAddr,
        cpg: u32,
        ops: &FlagOperations,
        control: ReflagControl,
    ) -> MmResult<()> {
        let user = user.map_or(ptr::null_mut(), |u| u as *mut VmContext);
        let env = self.env();
        unsafe {
            let ctxt = env.resolve(user, vma_base);
            mapper::reflag_pages(
                ctxt,
                vma_base,
                cpg,
                ops,
                control & !ReflagControl::NOTHING_SACRED,
            )
        }
    }

    /// Allocate a kernel VA window and map `cpg` physically contiguous
    /// pages into it. The window is released again if the map fails.
    pub fn map_kernel_pages(
        &mut self,
        pa_base: PhysAddr,
        cpg: u32,
        table_flags: TableFlags,
        page_flags: PageFlags,
        aux_flags: AuxFlags,
    ) -> MmResult<KernAddr> {
        let vma = self
            .kva
            .allocate(&self.init_heap, cpg)
            .ok_or(MmError::NoKernelSpace)?;
        let result = {
            let mut env = self.env();
            let kernel = env.kernel;
            unsafe {
                mapper::map_pages(
                    &mut env,
                    kernel,
                    pa_base,
                    vma,
                    cpg,
                    table_flags,
                    page_flags,
                    aux_flags,
                    MapControl::empty(),
                )
            }
        };
        match result {
            Ok(()) => Ok(vma),
            Err(e) => {
                self.kva.free(&self.init_heap, vma, cpg);
                Err(e)
            }
        }
    }

    /// Demap a kernel window and hand its addresses back. This is the
    /// only demap path that also returns VA to the space allocator.
    pub fn demap_kernel_pages(&mut self, vma_base: KernAddr, cpg: u32) -> MmResult<()> {
        if vma_base & VMADDR_KERNEL_FENCE != VMADDR_KERNEL_FENCE {
            return Err(MmError::InvalidArg);
        }
        {
            let mut env = self.env();
            let kernel = env.kernel;
            unsafe { mapper::demap_pages(&mut env, kernel, vma_base, cpg, DemapControl::empty())? }
        }
        self.kva.free(&self.init_heap, vma_base, cpg);
        Ok(())
    }

    // -- Introspection ----------------------------------------------------

    pub fn kernel_context(&self) -> &VmContext {
        &self.kernel_ctxt
    }

    pub fn free_table_count(&self) -> usize {
        let mut n = 0;
        self.free_tables.walk(&mut |_| {
            n += 1;
            true
        });
        n
    }

    pub fn available_frames(&self) -> u32 {
        self.mpdb.as_ref().map_or(0, |m| m.available_frames())
    }

    pub fn mpdb_entry(&self, ndx: u32) -> Option<MpdbEntry> {
        self.mpdb.as_ref().map(|m| m.entry_at(ndx))
    }

    /// Reclaim the init-segment pages once initialization is over.
    pub fn release_init_pages(&mut self) {
        if let Some(mpdb) = self.mpdb.as_mut() {
            mpdb.release_init_pages();
        }
    }

    pub fn init_heap(&self) -> &InitHeap {
        &self.init_heap
    }

    #[cfg(feature = "testing")]
    pub fn simulate_oom(&mut self, enable: bool) {
        if let Some(mpdb) = self.mpdb.as_mut() {
            mpdb.simulate_oom(enable);
        }
    }

    // -- Chunk service for the production heap ----------------------------

    /// Allocate a chunk-aligned block of kernel address space backed
    /// by fresh frames, for the production heap.
    pub fn alloc_chunk_pages(&mut self, cpg: u32, align_pages: u32) -> MmResult<(KernAddr, Zeroing)> {
        debug_assert!(align_pages.is_power_of_two());
        let total = cpg + align_pages - 1;
        let raw = self
            .kva
            .allocate(&self.init_heap, total)
            .ok_or(MmError::NoKernelSpace)?;
        let align_bytes = align_pages << PAGE_BITS;
        let base = (raw + align_bytes - 1) & !(align_bytes - 1);

        // Return the alignment slack right away.
        let lead = (base - raw) >> PAGE_BITS;
        if lead > 0 {
            self.kva.free(&self.init_heap, raw, lead);
        }
        let trail = total - cpg - lead;
        if trail > 0 {
            self.kva
                .free(&self.init_heap, base + (cpg << PAGE_BITS), trail);
        }

        // Back the window page by page.
        for i in 0..cpg {
            let va = base + (i << PAGE_BITS);
            let pa = match self.allocate_frame(AllocFlags::empty(), PageTag::System, subtag::HEAP)
            {
                Ok(pa) => pa,
                Err(e) => {
                    self.unwind_chunk_pages(base, i);
                    self.kva
                        .free(&self.init_heap, base + (i << PAGE_BITS), cpg - i);
                    return Err(e);
                }
            };
            let mapped = {
                let mut env = self.env();
                let kernel = env.kernel;
                unsafe {
                    mapper::map_pages(
                        &mut env,
                        kernel,
                        pa,
                        va,
                        1,
                        TTBFLAGS_KERNEL_DATA,
                        PGTBLFLAGS_KERNEL_DATA,
                        AuxFlags::empty(),
                        MapControl::empty(),
                    )
                }
            };
            if let Err(e) = mapped {
                let _ = self.free_frame(pa, PageTag::System, subtag::HEAP);
                self.unwind_chunk_pages(base, i);
                self.kva
                    .free(&self.init_heap, base + (i << PAGE_BITS), cpg - i);
                return Err(e);
            }
        }
        Ok((base, Zeroing::NonZeroed))
    }

    /// Undo the first `mapped` pages of a failed chunk allocation.
    fn unwind_chunk_pages(&mut self, base: KernAddr, mapped: u32) {
        for i in 0..mapped {
            let va = base + (i << PAGE_BITS);
            let pa = self.get_phys_addr(None, va);
            {
                let mut env = self.env();
                let kernel = env.kernel;
                let _ =
                    unsafe { mapper::demap_pages(&mut env, kernel, va, 1, DemapControl::empty()) };
            }
            self.kva.free(&self.init_heap, va, 1);
            if let Some(pa) = pa {
                let _ = self.free_frame(pa, PageTag::System, subtag::HEAP);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

static MEMORY_MANAGER: OnceCell<Mutex<MemoryManager>> = OnceCell::uninit();

/// Initialize the global memory manager from startup info.
///
/// # Safety
///
/// As [`MemoryManager::new`]; must be called exactly once, before any
/// other entry point of this module.
pub unsafe fn init(
    startup: &StartupInfo,
    boot_layout: &BootLayout,
    init_heap_region: *mut u8,
    init_heap_len: usize,
    phys: PhysAccess,
) -> MmResult<()> {
    log::info!("initializing kernel memory management");
    let mm = MemoryManager::new(startup, boot_layout, init_heap_region, init_heap_len, phys)?;
    MEMORY_MANAGER.init_once(|| Mutex::new(mm));
    log::info!("kernel memory management online");
    Ok(())
}

/// Run `f` under the kernel memory lock.
pub fn with_memory_manager<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> R {
    let mm = MEMORY_MANAGER
        .get()
        .expect("memory manager used before init");
    f(&mut mm.lock())
}

/// The chunk-allocator capability the production heap is created with:
/// chunks are kernel VA windows backed by frames from the page
/// database.
///
/// Purging is advisory here. A recycled chunk must stay mapped so the
/// heap can hand it out again without a recommit step, so the frames
/// stay put and purge simply reports that the memory is not zeroed.
pub struct KernelChunkAllocator;

impl ChunkAllocator for KernelChunkAllocator {
    fn alloc_chunk(&self, size: usize, align: usize) -> MmResult<(NonNull<u8>, Zeroing)> {
        if size == 0 || size & (PAGE_SIZE as usize - 1) != 0 {
            return Err(MmError::InvalidArg);
        }
        let cpg = (size >> PAGE_BITS) as u32;
        let align_pages = ((align.max(PAGE_SIZE as usize)) >> PAGE_BITS) as u32;
        let (va, zeroing) = with_memory_manager(|mm| mm.alloc_chunk_pages(cpg, align_pages))?;
        let ptr = with_memory_manager(|mm| {
            let pa = mm.get_phys_addr(None, va).expect("chunk page mapped");
            mm.phys.kernel_ptr(va, pa)
        });
        NonNull::new(ptr).map(|p| (p, zeroing)).ok_or(MmError::Unexpected)
    }

    fn purge_unused(&self, _ptr: NonNull<u8>, _size: usize) -> MmResult<Zeroing> {
        Ok(Zeroing::NonZeroed)
    }
}
