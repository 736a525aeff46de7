//! ARMv6 translation-table descriptor layer.
//!
//! Encodes and decodes the three kinds of first-level (TTB) words —
//! fault, coarse-page-table pointer, 1 MiB section — and the two kinds
//! of second-level words — fault, 4 KiB small page — plus the parallel
//! software-only auxiliary words that shadow every hardware entry.
//!
//! Every constant here is bit-exact against the ARMv6 short-descriptor
//! format; the MMU reads these words directly.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use super::layout::{PhysAddr, PGTBL_ENTRIES};

bitflags! {
    /// Flags of a first-level coarse-page-table descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TableFlags: u32 {
        /// Bits [1:0] = 01 for every page-table descriptor.
        const ALWAYS = 0x0000_0001;
        /// Privileged Execute-Never.
        const PXN = 0x0000_0004;
        /// Not Secure.
        const NS = 0x0000_0008;
        /// Protection domain field (4 bits).
        const DOM_MASK = 0x0000_01E0;
        /// ECC enable (not supported by the BCM2835, keep clear).
        const P = 0x0000_0200;
    }
}

impl TableFlags {
    pub const ALLFLAGS: u32 = 0x0000_03FF;
    /// Flags a caller may legitimately alter (type bits excluded).
    pub const SAFEFLAGS: u32 = Self::ALLFLAGS & !0x3;
    /// Base-address mask of the 1 KiB-aligned page table.
    pub const BASE: u32 = 0xFFFF_FC00;
}

bitflags! {
    /// Flags of a first-level 1 MiB section descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// Privileged Execute-Never.
        const PXN = 0x0000_0001;
        /// Bit 1 is set for every section descriptor.
        const ALWAYS = 0x0000_0002;
        /// Bufferable.
        const B = 0x0000_0004;
        /// Cacheable.
        const C = 0x0000_0008;
        /// Execute-Never.
        const XN = 0x0000_0010;
        /// Protection domain field (4 bits).
        const DOM_MASK = 0x0000_01E0;
        /// ECC enable (not supported).
        const P = 0x0000_0200;
        /// Access permissions.
        const AP = 0x0000_0C00;
        /// Memory-type extension field.
        const TEX = 0x0000_7000;
        /// Access-permission extension.
        const APX = 0x0000_8000;
        /// Shared.
        const S = 0x0001_0000;
        /// Not Global.
        const NG = 0x0002_0000;
        /// Supersection.
        const SUPER = 0x0004_0000;
        /// Not Secure.
        const NS = 0x0008_0000;
    }
}

impl SectionFlags {
    pub const ALLFLAGS: u32 = 0x000F_FFFF;
    /// Flags a caller may alter (type and supersection bits excluded).
    pub const SAFEFLAGS: u32 =
        Self::ALLFLAGS & !(Self::ALWAYS.bits() | Self::SUPER.bits());
    /// Base-address mask of the 1 MiB-aligned section.
    pub const BASE: u32 = 0xFFF0_0000;

    /// AP field values for the standard access-control model.
    pub const AP01: SectionFlags = SectionFlags::from_bits_retain(0x0000_0400);
    pub const AP10: SectionFlags = SectionFlags::from_bits_retain(0x0000_0800);
    pub const AP11: SectionFlags = SectionFlags::from_bits_retain(0x0000_0C00);
}

bitflags! {
    /// Flags of a second-level small-page descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Execute-Never.
        const XN = 0x0000_0001;
        /// Bit 1 is set for every small-page descriptor.
        const ALWAYS = 0x0000_0002;
        /// Bufferable.
        const B = 0x0000_0004;
        /// Cacheable.
        const C = 0x0000_0008;
        /// Access permissions.
        const AP = 0x0000_0030;
        /// Memory-type extension field.
        const TEX = 0x0000_01C0;
        /// Access-permission extension.
        const APX = 0x0000_0200;
        /// Shared.
        const S = 0x0000_0400;
        /// Not Global.
        const NG = 0x0000_0800;
    }
}

impl PageFlags {
    pub const ALLFLAGS: u32 = 0x0000_0FFF;
    /// Flags a caller may alter (type bit excluded).
    pub const SAFEFLAGS: u32 = Self::ALLFLAGS & !Self::ALWAYS.bits();
    /// Base-address mask of the 4 KiB-aligned page.
    pub const BASE: u32 = 0xFFFF_F000;

    /// AP field values for the standard access-control model.
    pub const AP01: PageFlags = PageFlags::from_bits_retain(0x0000_0010);
    pub const AP10: PageFlags = PageFlags::from_bits_retain(0x0000_0020);
    pub const AP11: PageFlags = PageFlags::from_bits_retain(0x0000_0030);
}

bitflags! {
    /// Software-only flags shadowing each hardware descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuxFlags: u32 {
        /// Never demap or reflag this entry without override authority.
        const SACRED = 0x0000_0001;
        /// The mapping was never writeable; no dirty writeback needed.
        const UNWRITEABLE = 0x0000_0002;
        /// The frame is not tracked in the page database (MMIO, or a
        /// frame temporarily owned by the frame allocator itself).
        const NOTPAGE = 0x0000_0004;
    }
}

impl AuxFlags {
    pub const ALLFLAGS: u32 = 0x0000_0007;
    /// Flags a caller may alter; `NOTPAGE` is owned by the mapper.
    pub const SAFEFLAGS: u32 = Self::ALLFLAGS & !Self::NOTPAGE.bits();
}

/// What kind of entry a first-level descriptor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtbKind {
    Fault,
    PageTable,
    Section,
}

/// A first-level (TTB) descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TtbEntry(pub u32);

impl TtbEntry {
    pub const FAULT: TtbEntry = TtbEntry(0);

    pub const fn kind(self) -> TtbKind {
        match self.0 & 0x3 {
            0 => TtbKind::Fault,
            1 => TtbKind::PageTable,
            _ => TtbKind::Section, // 2 and 3 (PXN section)
        }
    }

    pub const fn is_fault(self) -> bool {
        self.0 & 0x3 == 0
    }

    pub const fn is_page_table(self) -> bool {
        self.0 & 0x3 == 1
    }

    /// True for both plain and PXN sections (bit 1 set).
    pub const fn is_section(self) -> bool {
        self.0 & SectionFlags::ALWAYS.bits() != 0
    }

    pub fn page_table(base: PhysAddr, flags: TableFlags) -> TtbEntry {
        debug_assert_eq!(base & !TableFlags::BASE, 0);
        TtbEntry(base | flags.bits())
    }

    pub fn section(base: PhysAddr, flags: SectionFlags) -> TtbEntry {
        debug_assert_eq!(base & !SectionFlags::BASE, 0);
        TtbEntry(base | flags.bits())
    }

    /// Physical address of the 1 KiB page table this entry points at.
    pub const fn table_base(self) -> PhysAddr {
        self.0 & TableFlags::BASE
    }

    /// Physical base of the 1 MiB section this entry maps.
    pub const fn section_base(self) -> PhysAddr {
        self.0 & SectionFlags::BASE
    }

    pub fn table_flags(self) -> TableFlags {
        TableFlags::from_bits_retain(self.0 & TableFlags::ALLFLAGS)
    }

    pub fn section_flags(self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.0 & SectionFlags::ALLFLAGS)
    }

    /// Is the section mapping cacheable (C bit)?
    pub fn section_cacheable(self) -> bool {
        self.section_flags().contains(SectionFlags::C)
    }
}

/// A second-level page-table descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(pub u32);

impl PageEntry {
    pub const FAULT: PageEntry = PageEntry(0);

    /// Anything but fault (small page, with or without XN).
    pub const fn is_present(self) -> bool {
        self.0 & 0x3 != 0
    }

    pub const fn is_small_page(self) -> bool {
        self.0 & PageFlags::ALWAYS.bits() != 0
    }

    pub fn small_page(base: PhysAddr, flags: PageFlags) -> PageEntry {
        debug_assert_eq!(base & !PageFlags::BASE, 0);
        PageEntry(base | flags.bits())
    }

    pub const fn page_base(self) -> PhysAddr {
        self.0 & PageFlags::BASE
    }

    pub fn page_flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & PageFlags::ALLFLAGS)
    }

    pub fn cacheable(self) -> bool {
        self.page_flags().contains(PageFlags::C)
    }
}

/// A software auxiliary descriptor word (one per hardware entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AuxEntry(pub u32);

impl AuxEntry {
    pub const CLEAR: AuxEntry = AuxEntry(0);

    pub fn new(flags: AuxFlags) -> AuxEntry {
        AuxEntry(flags.bits())
    }

    pub fn flags(self) -> AuxFlags {
        AuxFlags::from_bits_retain(self.0 & AuxFlags::ALLFLAGS)
    }

    pub fn sacred(self) -> bool {
        self.flags().contains(AuxFlags::SACRED)
    }

    pub fn unwriteable(self) -> bool {
        self.flags().contains(AuxFlags::UNWRITEABLE)
    }

    pub fn notpage(self) -> bool {
        self.flags().contains(AuxFlags::NOTPAGE)
    }
}

/// One hardware page table plus its auxiliary shadow, as laid out in
/// memory: 256 hardware words at the 1 KiB-aligned base the TTB points
/// at, immediately followed by 256 auxiliary words. Two of these pairs
/// fit in a 4 KiB frame.
#[repr(C)]
pub struct PageTable {
    pub entries: [PageEntry; PGTBL_ENTRIES as usize],
    pub aux: [AuxEntry; PGTBL_ENTRIES as usize],
}

const_assert_eq!(core::mem::size_of::<PageTable>(), 2048);
const_assert_eq!(core::mem::size_of::<TtbEntry>(), 4);
const_assert_eq!(core::mem::size_of::<PageEntry>(), 4);
const_assert_eq!(core::mem::size_of::<AuxEntry>(), 4);

impl PageTable {
    pub fn zero(&mut self) {
        for e in self.entries.iter_mut() {
            *e = PageEntry::FAULT;
        }
        for a in self.aux.iter_mut() {
            *a = AuxEntry::CLEAR;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

/// Fold the flag words used for a page-table + small-page mapping into
/// the equivalent flags of a single 1 MiB section descriptor, so a
/// page-granular mapping can be transparently upgraded to a section
/// when base and size align.
pub fn make_section_flags(table: TableFlags, page: PageFlags) -> SectionFlags {
    let t = table.bits();
    let p = page.bits();
    let mut rc = SectionFlags::ALWAYS.bits();
    rc |= (t & TableFlags::PXN.bits()) >> 2;
    rc |= (t & TableFlags::NS.bits()) << 16;
    rc |= t & TableFlags::DOM_MASK.bits();
    rc |= t & TableFlags::P.bits();
    rc |= (p & PageFlags::XN.bits()) << 4;
    rc |= p & PageFlags::B.bits();
    rc |= p & PageFlags::C.bits();
    rc |= (p & PageFlags::AP.bits()) << 6;
    rc |= (p & PageFlags::TEX.bits()) << 6;
    rc |= (p & PageFlags::APX.bits()) << 6;
    rc |= (p & PageFlags::S.bits()) << 6;
    rc |= (p & PageFlags::NG.bits()) << 6;
    SectionFlags::from_bits_retain(rc)
}

/// Fold per-page auxiliary flags into the auxiliary flags of a section
/// entry. All three software bits carry over unchanged.
pub fn make_section_aux_flags(aux: AuxFlags) -> AuxFlags {
    aux & (AuxFlags::SACRED | AuxFlags::UNWRITEABLE | AuxFlags::NOTPAGE)
}

// Canonical flag recipes used across the kernel.
pub const TTBFLAGS_LIB_CODE: TableFlags = TableFlags::ALWAYS;
pub const PGTBLFLAGS_LIB_CODE: PageFlags = PageFlags::ALWAYS
    .union(PageFlags::B)
    .union(PageFlags::C)
    .union(PageFlags::AP10);
pub const PGAUXFLAGS_LIB_CODE: AuxFlags = AuxFlags::SACRED.union(AuxFlags::UNWRITEABLE);

pub const TTBFLAGS_KERNEL_CODE: TableFlags = TableFlags::ALWAYS;
pub const PGTBLFLAGS_KERNEL_CODE: PageFlags = PageFlags::ALWAYS
    .union(PageFlags::B)
    .union(PageFlags::C)
    .union(PageFlags::AP01);
pub const PGAUXFLAGS_KERNEL_CODE: AuxFlags = AuxFlags::SACRED.union(AuxFlags::UNWRITEABLE);

pub const TTBFLAGS_KERNEL_DATA: TableFlags = TableFlags::ALWAYS;
pub const PGTBLFLAGS_KERNEL_DATA: PageFlags = PageFlags::XN
    .union(PageFlags::ALWAYS)
    .union(PageFlags::B)
    .union(PageFlags::C)
    .union(PageFlags::AP01);
pub const PGAUXFLAGS_KERNEL_DATA: AuxFlags = AuxFlags::SACRED;

pub const TTBFLAGS_INIT_CODE: TableFlags = TTBFLAGS_KERNEL_CODE;
pub const PGTBLFLAGS_INIT_CODE: PageFlags = PGTBLFLAGS_KERNEL_CODE;
pub const PGAUXFLAGS_INIT_CODE: AuxFlags = AuxFlags::UNWRITEABLE;

pub const TTBFLAGS_INIT_DATA: TableFlags = TTBFLAGS_KERNEL_DATA;
pub const PGTBLFLAGS_INIT_DATA: PageFlags = PGTBLFLAGS_KERNEL_DATA;
pub const PGAUXFLAGS_INIT_DATA: AuxFlags = AuxFlags::empty();

pub const TTBFLAGS_MMIO: TableFlags = TableFlags::ALWAYS;
pub const PGTBLFLAGS_MMIO: PageFlags = PageFlags::ALWAYS.union(PageFlags::AP01);
pub const PGAUXFLAGS_MMIO: AuxFlags = AuxFlags::SACRED.union(AuxFlags::NOTPAGE);

/// Auxiliary word written for a TTB slot that holds a page table.
pub const TTBAUXFLAGS_PAGETABLE: AuxFlags = AuxFlags::empty();
