//! Physical frame allocator — the Master Page Database.
//!
//! One 8-byte record per physical frame, built once at bring-up and
//! mutated forever after. Records thread through circular singly
//! linked lists via their `next` field: the free list, the zeroed
//! list, and the init list (pages reclaimed wholesale when
//! initialization ends). Each record also carries the physical address
//! of the descriptor currently mapping the frame, kept up to date by
//! the live mapper through [`Mpdb::set_pte_address`]; that back
//! pointer is what will make pageout possible without scanning every
//! page table.
//!
//! Zero-filling a frame requires temporarily mapping it, which is the
//! mapper's job; the aggregate memory manager owns that dance (see
//! `memory::MemoryManager::allocate_frame`). This module only reports
//! whether a frame handed out still needs zeroing.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use super::early_map::{BootLayout, StartupInfo};
use super::layout::{page_index, PhysAddr, TTB1_SIZE};
use crate::status::{MmError, MmResult};

bitflags! {
    /// Frame-allocation request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The caller wants the frame zero-filled.
        const ZERO = 0x0000_0001;
    }
}

/// Frame ownership tag (3 bits in the record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    Unknown = 0,
    Normal = 1,
    System = 2,
}

impl PageTag {
    fn from_bits(bits: u32) -> PageTag {
        match bits {
            1 => PageTag::Normal,
            2 => PageTag::System,
            _ => PageTag::Unknown,
        }
    }
}

/// Subtags for `PageTag::System` frames.
pub mod subtag {
    pub const ZEROPAGE: u8 = 0;
    pub const LIBCODE: u8 = 1;
    pub const KCODE: u8 = 2;
    pub const KDATA: u8 = 3;
    pub const INIT: u8 = 4;
    pub const TTB: u8 = 5;
    pub const TTBAUX: u8 = 6;
    pub const MPDB: u8 = 7;
    pub const PGTBL: u8 = 8;
    pub const GPU: u8 = 9;
    /// Frames backing production-heap chunks.
    pub const HEAP: u8 = 10;
}

/// One Master Page Database record.
///
/// Layout: the physical address of the mapping descriptor, then a
/// packed word of `[subtag:8][tag:3][section_map:1][next:20]`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MpdbEntry {
    pte_pa: PhysAddr,
    packed: u32,
}

const_assert_eq!(core::mem::size_of::<MpdbEntry>(), 8);

const NEXT_MASK: u32 = 0x000F_FFFF;
const SECTION_MAP_BIT: u32 = 1 << 20;
const TAG_SHIFT: u32 = 21;
const TAG_MASK: u32 = 0x7 << TAG_SHIFT;
const SUBTAG_SHIFT: u32 = 24;

impl MpdbEntry {
    pub fn pte_pa(&self) -> PhysAddr {
        self.pte_pa
    }

    pub fn next(&self) -> u32 {
        self.packed & NEXT_MASK
    }

    fn set_next(&mut self, next: u32) {
        debug_assert_eq!(next & !NEXT_MASK, 0);
        self.packed = (self.packed & !NEXT_MASK) | next;
    }

    pub fn section_map(&self) -> bool {
        self.packed & SECTION_MAP_BIT != 0
    }

    pub fn tag(&self) -> PageTag {
        PageTag::from_bits((self.packed & TAG_MASK) >> TAG_SHIFT)
    }

    pub fn subtag(&self) -> u8 {
        (self.packed >> SUBTAG_SHIFT) as u8
    }

    fn set_tags(&mut self, tag: PageTag, sub: u8) {
        self.packed = (self.packed & (NEXT_MASK | SECTION_MAP_BIT))
            | ((tag as u32) << TAG_SHIFT)
            | ((sub as u32) << SUBTAG_SHIFT);
    }

    fn set_pte(&mut self, pte_pa: PhysAddr, is_section: bool) {
        self.pte_pa = pte_pa;
        if is_section {
            self.packed |= SECTION_MAP_BIT;
        } else {
            self.packed &= !SECTION_MAP_BIT;
        }
    }
}

/// Head of one circular frame list: the index of the last frame and
/// the member count. `entries[last].next` is always the list head.
#[derive(Debug, Clone, Copy)]
pub struct PageList {
    last: u32,
    count: u32,
}

impl PageList {
    const EMPTY: PageList = PageList { last: 0, count: 0 };

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn last_index(&self) -> u32 {
        self.last
    }
}

/// The frame allocator proper.
pub struct Mpdb {
    entries: *mut MpdbEntry,
    total_frames: u32,
    free: PageList,
    zeroed: PageList,
    init: PageList,
    #[cfg(feature = "testing")]
    simulate_oom: bool,
}

// SAFETY: the record array is exclusively owned by this struct and the
// struct only moves under the kernel lock.
unsafe impl Send for Mpdb {}

/// Which frame a successful allocation produced, and whether the
/// caller still owes it a zero pass.
pub struct TakenFrame {
    pub ndx: u32,
    pub needs_zero: bool,
}

impl Mpdb {
    fn entry(&self, ndx: u32) -> &mut MpdbEntry {
        debug_assert!(ndx < self.total_frames);
        unsafe { &mut *self.entries.add(ndx as usize) }
    }

    fn find_predecessor(&self, ndx: u32) -> u32 {
        let mut i = ndx;
        while self.entry(i).next() != ndx {
            i = self.entry(i).next();
        }
        i
    }

    /// Unchain `ndx` from the circular list it lives in, scanning from
    /// `start`. Relies on the list being circular: the scan always
    /// comes back around to the start index.
    fn unchain(&mut self, ndx: u32, start: u32) -> bool {
        let mut i = start;
        loop {
            if self.entry(i).next() == ndx {
                let succ = self.entry(ndx).next();
                self.entry(i).set_next(succ);
                return true;
            }
            i = self.entry(i).next();
            if i == start {
                return false;
            }
        }
    }

    fn remove_from(&mut self, which: ListId, ndx: u32) {
        let mut list = self.list(which);
        if list.last == ndx {
            list.last = self.find_predecessor(ndx);
        }
        let scan_from = list.last;
        let unchained = self.unchain(ndx, scan_from);
        debug_assert!(unchained, "frame {ndx} missing from its list");
        list.count -= 1;
        if list.count == 0 {
            list.last = 0;
        }
        *self.list_mut(which) = list;
        debug_assert!(self.list_is_circular(which));
    }

    fn add_to(&mut self, which: ListId, ndx: u32) {
        let mut list = self.list(which);
        if list.count == 0 {
            self.entry(ndx).set_next(ndx);
        } else {
            let head = self.entry(list.last).next();
            self.entry(ndx).set_next(head);
            self.entry(list.last).set_next(ndx);
        }
        list.last = ndx;
        list.count += 1;
        *self.list_mut(which) = list;
        debug_assert!(self.list_is_circular(which));
    }

    fn list(&self, which: ListId) -> PageList {
        match which {
            ListId::Free => self.free,
            ListId::Zeroed => self.zeroed,
            ListId::Init => self.init,
        }
    }

    fn list_mut(&mut self, which: ListId) -> &mut PageList {
        match which {
            ListId::Free => &mut self.free,
            ListId::Zeroed => &mut self.zeroed,
            ListId::Init => &mut self.init,
        }
    }

    /// Walk the list and confirm `last.next` closes the cycle within
    /// `count` hops. Debug-build verification only.
    fn list_is_circular(&self, which: ListId) -> bool {
        let list = self.list(which);
        if list.count == 0 {
            return true;
        }
        let mut i = self.entry(list.last).next();
        for _ in 1..list.count {
            if i == list.last {
                return false; // cycle shorter than the count says
            }
            i = self.entry(i).next();
        }
        i == list.last
    }

    /// Pull one frame off the free/zeroed lists per the allocation
    /// policy. Does not tag the frame.
    pub fn take_page(&mut self, flags: AllocFlags) -> Option<TakenFrame> {
        #[cfg(feature = "testing")]
        if self.simulate_oom {
            return None;
        }

        let (which, needs_zero) = if flags.contains(AllocFlags::ZERO) {
            if !self.zeroed.is_empty() {
                (ListId::Zeroed, false)
            } else if !self.free.is_empty() {
                (ListId::Free, true)
            } else {
                return None;
            }
        } else if !self.free.is_empty() {
            (ListId::Free, false)
        } else if !self.zeroed.is_empty() {
            (ListId::Zeroed, false)
        } else {
            return None;
        };

        // Take the head (the last frame's successor).
        let ndx = self.entry(self.list(which).last).next();
        self.remove_from(which, ndx);
        Some(TakenFrame { ndx, needs_zero })
    }

    /// Give a frame back after a failed allocation attempt.
    pub fn untake_page(&mut self, ndx: u32) {
        self.add_to(ListId::Free, ndx);
    }

    /// Stamp ownership tags on an allocated frame.
    pub fn tag_page(&mut self, ndx: u32, tag: PageTag, sub: u8) {
        self.entry(ndx).set_tags(tag, sub);
    }

    /// Release a frame. The caller states the tags it believes the
    /// frame carries; a mismatch means a double free or type confusion
    /// and fails with the bad-tags status.
    pub fn free_frame(&mut self, pa: PhysAddr, tag: PageTag, sub: u8) -> MmResult<()> {
        let ndx = page_index(pa);
        if ndx >= self.total_frames {
            return Err(MmError::InvalidArg);
        }
        let e = self.entry(ndx);
        if e.tag() != tag || e.subtag() != sub {
            log::warn!(
                "frame {ndx:#x} freed with tags {:?}/{} but carries {:?}/{}",
                tag,
                sub,
                e.tag(),
                e.subtag()
            );
            return Err(MmError::BadTags);
        }
        self.entry(ndx).set_tags(PageTag::Normal, 0);
        self.add_to(ListId::Free, ndx);
        Ok(())
    }

    /// Mapper hook: descriptor at `pte_pa` now maps frame `ndx` (or
    /// was cleared, when `pte_pa` is 0). `is_section` marks a frame
    /// covered by a 1 MiB section descriptor rather than its own
    /// small-page entry.
    pub fn set_pte_address(&mut self, ndx: u32, pte_pa: PhysAddr, is_section: bool) {
        if ndx < self.total_frames {
            self.entry(ndx).set_pte(pte_pa, is_section);
        }
    }

    pub fn entry_at(&self, ndx: u32) -> MpdbEntry {
        *self.entry(ndx)
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    pub fn free_list(&self) -> PageList {
        self.free
    }

    pub fn zeroed_list(&self) -> PageList {
        self.zeroed
    }

    pub fn init_list(&self) -> PageList {
        self.init
    }

    /// Number of frames the allocator can still hand out.
    pub fn available_frames(&self) -> u32 {
        self.free.count + self.zeroed.count
    }

    /// Chain `cpg` consecutive frames starting at `first`, stamp their
    /// tags, and optionally splice the chain into a list. Returns the
    /// index after the chain.
    fn build_page_chain(
        &mut self,
        first: u32,
        cpg: u32,
        tag: PageTag,
        sub: u8,
        add_to: Option<ListId>,
    ) -> u32 {
        if cpg == 0 {
            return first;
        }
        for i in 0..cpg {
            self.entry(first + i).set_tags(tag, sub);
            if i < cpg - 1 {
                self.entry(first + i).set_next(first + i + 1);
            }
        }
        if let Some(which) = add_to {
            let mut list = self.list(which);
            if list.count == 0 {
                self.entry(first + cpg - 1).set_next(first);
            } else {
                let head = self.entry(list.last).next();
                self.entry(first + cpg - 1).set_next(head);
                self.entry(list.last).set_next(first);
            }
            list.last = first + cpg - 1;
            list.count += cpg;
            *self.list_mut(which) = list;
            debug_assert!(self.list_is_circular(which));
        }
        first + cpg
    }

    /// Build the database: classify every physical frame the firmware
    /// reported, in image order, and thread the reusable ones onto
    /// their lists. The classified count must come out exactly equal
    /// to the frame total.
    ///
    /// # Safety
    ///
    /// `entries` must point at `startup.cpg_mpdb` pages of writable
    /// memory that stays owned by the returned database.
    pub unsafe fn new(
        entries: *mut MpdbEntry,
        startup: &StartupInfo,
        layout: &BootLayout,
    ) -> Mpdb {
        let mut mpdb = Mpdb {
            entries,
            total_frames: startup.cpg_system_total,
            free: PageList::EMPTY,
            zeroed: PageList::EMPTY,
            init: PageList::EMPTY,
            #[cfg(feature = "testing")]
            simulate_oom: false,
        };

        core::ptr::write_bytes(entries as *mut u8, 0, (startup.cpg_mpdb as usize) << 12);

        let mut i;
        i = mpdb.build_page_chain(0, 1, PageTag::System, subtag::ZEROPAGE, None);
        i = mpdb.build_page_chain(
            i,
            layout.cpg_prestart_total - 1,
            PageTag::Normal,
            0,
            Some(ListId::Free),
        );
        i = mpdb.build_page_chain(
            i,
            layout.cpg_library_code,
            PageTag::System,
            subtag::LIBCODE,
            None,
        );
        i = mpdb.build_page_chain(
            i,
            layout.cpg_kernel_code,
            PageTag::System,
            subtag::KCODE,
            None,
        );
        i = mpdb.build_page_chain(
            i,
            layout.cpg_kernel_data + layout.cpg_kernel_bss,
            PageTag::System,
            subtag::KDATA,
            None,
        );
        i = mpdb.build_page_chain(
            i,
            layout.cpg_init_code + layout.cpg_init_data + layout.cpg_init_bss,
            PageTag::System,
            subtag::INIT,
            Some(ListId::Init),
        );
        i = mpdb.build_page_chain(i, startup.cpg_ttb_gap, PageTag::Normal, 0, Some(ListId::Free));
        i = mpdb.build_page_chain(
            i,
            TTB1_SIZE / 4096,
            PageTag::System,
            subtag::TTB,
            None,
        );
        i = mpdb.build_page_chain(
            i,
            TTB1_SIZE / 4096,
            PageTag::System,
            subtag::TTBAUX,
            None,
        );
        i = mpdb.build_page_chain(i, startup.cpg_mpdb, PageTag::System, subtag::MPDB, None);
        i = mpdb.build_page_chain(
            i,
            startup.cpg_page_tables,
            PageTag::System,
            subtag::PGTBL,
            None,
        );
        i = mpdb.build_page_chain(
            i,
            startup.cpg_system_avail - i,
            PageTag::Normal,
            0,
            Some(ListId::Free),
        );
        i = mpdb.build_page_chain(
            i,
            startup.cpg_system_total - startup.cpg_system_avail,
            PageTag::System,
            subtag::GPU,
            None,
        );
        assert_eq!(i, mpdb.total_frames, "frame classification mismatch");
        log::info!(
            "MPDB: {} frames, {} free after bring-up",
            mpdb.total_frames,
            mpdb.free.count
        );
        mpdb
    }

    /// Hand every init-segment page back to the free list. Called once
    /// the production heap is live and init code/data is dead.
    pub fn release_init_pages(&mut self) {
        while !self.init.is_empty() {
            let ndx = self.entry(self.init.last).next();
            self.remove_from(ListId::Init, ndx);
            self.entry(ndx).set_tags(PageTag::Normal, 0);
            self.add_to(ListId::Free, ndx);
        }
        log::info!("init pages released; {} frames free", self.free.count);
    }

    /// Force every allocation to fail, for out-of-memory testing.
    #[cfg(feature = "testing")]
    pub fn simulate_oom(&mut self, enable: bool) {
        if enable {
            log::warn!("OOM simulation enabled; all frame allocations will fail");
        }
        self.simulate_oom = enable;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    Free,
    Zeroed,
    Init,
}

impl Mpdb {
    /// Move a frame from the free list to the zeroed list (used after
    /// background zeroing; the allocator itself zeroes on demand).
    pub fn mark_zeroed(&mut self, ndx: u32) {
        self.remove_from(ListId::Free, ndx);
        self.add_to(ListId::Zeroed, ndx);
    }
}
