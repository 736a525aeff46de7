//! Kernel virtual-address-space allocator.
//!
//! Free kernel address ranges live as half-open, page-aligned
//! intervals in a red-black tree ordered by address. Allocation is
//! first-fit over the in-order walk; freeing coalesces with both
//! neighbors so the tree never holds two adjacent intervals. Interval
//! nodes come from the mutable-allocator contract — the init heap
//! during bring-up.
//!
//! Running out of kernel address space is a kernel bug, not a
//! recoverable condition; the allocator asserts in debug builds and
//! reports exhaustion to the caller in release builds.

use core::cmp::Ordering;
use core::ptr;

use crate::collections::rbtree::{RbAdapter, RbNode, RbTree};
use crate::heap::api::Allocator;
use super::layout::{KernAddr, PAGE_BITS};

/// A half-open interval of kernel addresses `[first, last)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub first: KernAddr,
    pub last: KernAddr,
}

impl Interval {
    pub fn new(first: KernAddr, last: KernAddr) -> Interval {
        debug_assert!(first < last);
        Interval { first, last }
    }

    pub fn from_pages(base: KernAddr, cpg: u32) -> Interval {
        Interval::new(base, base + (cpg << PAGE_BITS))
    }

    pub fn pages(&self) -> u32 {
        (self.last - self.first) >> PAGE_BITS
    }

    /// `self` ends exactly where `other` begins.
    pub fn adjacent_to(&self, other: &Interval) -> bool {
        self.last == other.first
    }
}

/// Interval ordering: disjoint intervals order by address; a probe
/// entirely contained in (or equal to) a tree interval compares equal.
/// Partial overlap would mean the free tree is corrupt.
fn interval_compare(probe: &Interval, item: &Interval) -> Ordering {
    debug_assert!(probe.first < probe.last);
    debug_assert!(item.first < item.last);
    if probe.first >= item.first && probe.last <= item.last {
        return Ordering::Equal;
    }
    if probe.last <= item.first {
        return Ordering::Less;
    }
    if probe.first >= item.last {
        return Ordering::Greater;
    }
    debug_assert!(false, "overlapping intervals in the free-address tree");
    Ordering::Equal
}

struct AddrNode {
    node: RbNode,
    ai: Interval,
}

struct AddrAdapter;

unsafe impl RbAdapter for AddrAdapter {
    type Item = AddrNode;
    type Key = Interval;

    unsafe fn node_of(item: *mut AddrNode) -> *mut RbNode {
        ptr::addr_of_mut!((*item).node)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut AddrNode {
        (node as *mut u8).sub(core::mem::offset_of!(AddrNode, node)) as *mut AddrNode
    }
    unsafe fn key_of(item: *const AddrNode) -> Interval {
        (*item).ai
    }
    fn compare(probe: &Interval, item: &Interval) -> Ordering {
        interval_compare(probe, item)
    }
}

/// The free-address tree.
pub struct KernelSpace {
    tree: RbTree<AddrAdapter>,
}

impl KernelSpace {
    pub const fn new() -> KernelSpace {
        KernelSpace {
            tree: RbTree::new(),
        }
    }

    /// Add an initial free range.
    pub fn seed(&mut self, alloc: &dyn Allocator, first: KernAddr, last: KernAddr) {
        self.insert_range(alloc, first, last);
    }

    fn insert_range(&mut self, alloc: &dyn Allocator, first: KernAddr, last: KernAddr) {
        let raw = alloc.alloc(core::mem::size_of::<AddrNode>()) as *mut AddrNode;
        assert!(!raw.is_null(), "no memory for a free-address node");
        unsafe {
            ptr::write(
                raw,
                AddrNode {
                    node: RbNode::new(),
                    ai: Interval::new(first, last),
                },
            );
            self.tree.insert(raw);
        }
    }

    /// Allocate `cpg` contiguous pages of kernel address space.
    /// First-fit: the lowest free interval that is large enough.
    pub fn allocate(&mut self, alloc: &dyn Allocator, cpg: u32) -> Option<KernAddr> {
        debug_assert!(cpg > 0);
        let mut found: *mut AddrNode = ptr::null_mut();
        self.tree.walk(&mut |item| {
            if unsafe { (*item).ai.pages() } >= cpg {
                found = item;
                false
            } else {
                true
            }
        });
        if found.is_null() {
            // Kernel address space exhaustion is a bug.
            debug_assert!(false, "kernel address space exhausted");
            log::error!("kernel address space exhausted ({cpg} pages wanted)");
            return None;
        }

        unsafe {
            let base = (*found).ai.first;
            if (*found).ai.pages() == cpg {
                // The interval is consumed exactly; drop its node.
                let key = (*found).ai;
                let removed = self.tree.delete(&key);
                debug_assert_eq!(removed, found);
                alloc.free(removed as *mut u8);
            } else {
                // Shorten in place; the interval keeps its tree
                // position because only its start moves forward.
                (*found).ai.first += cpg << PAGE_BITS;
            }
            Some(base)
        }
    }

    /// Return `cpg` pages at `base`, merging with any adjacent free
    /// interval.
    pub fn free(&mut self, alloc: &dyn Allocator, base: KernAddr, cpg: u32) {
        let ai = Interval::from_pages(base, cpg);
        debug_assert!(
            self.tree.find(&ai).is_null(),
            "freed kernel addresses overlap the free tree"
        );

        let pred = self.tree.floor(&ai);
        let succ = self.tree.ceiling(&ai);
        let pred_adj =
            !pred.is_null() && unsafe { (*pred).ai.adjacent_to(&ai) };
        let succ_adj =
            !succ.is_null() && unsafe { ai.adjacent_to(&(*succ).ai) };

        unsafe {
            match (pred_adj, succ_adj) {
                (true, true) => {
                    // Bridge: predecessor swallows the freed range and
                    // the successor; the successor's node retires.
                    let succ_key = (*succ).ai;
                    let removed = self.tree.delete(&succ_key);
                    debug_assert_eq!(removed, succ);
                    (*pred).ai.last = (*succ).ai.last;
                    alloc.free(removed as *mut u8);
                }
                (true, false) => (*pred).ai.last = ai.last,
                (false, true) => (*succ).ai.first = ai.first,
                (false, false) => self.insert_range(alloc, ai.first, ai.last),
            }
        }
    }

    /// In-order snapshot of the free intervals (diagnostics, tests).
    pub fn for_each_free(&self, f: &mut dyn FnMut(Interval)) {
        self.tree.walk(&mut |item| {
            f(unsafe { (*item).ai });
            true
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::init_heap::InitHeap;

    struct Fixture {
        _buf: Vec<u64>,
        heap: InitHeap,
        kva: KernelSpace,
    }

    fn fixture() -> Fixture {
        let mut buf = vec![0u64; 8192 / 8];
        let heap = unsafe { InitHeap::new(buf.as_mut_ptr() as *mut u8, 8192) };
        Fixture {
            _buf: buf,
            heap,
            kva: KernelSpace::new(),
        }
    }

    fn snapshot(kva: &KernelSpace) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        kva.for_each_free(&mut |ai| out.push((ai.first, ai.last)));
        out
    }

    #[test]
    fn allocate_then_free_coalesces_with_successor() {
        // The literal scenario: seed [0x1000, 0x5000), take one page,
        // give it back.
        let mut f = fixture();
        f.kva.seed(&f.heap, 0x1000, 0x5000);

        let got = f.kva.allocate(&f.heap, 1).unwrap();
        assert_eq!(got, 0x1000);
        assert_eq!(snapshot(&f.kva), vec![(0x2000, 0x5000)]);

        f.kva.free(&f.heap, 0x1000, 1);
        assert_eq!(snapshot(&f.kva), vec![(0x1000, 0x5000)]);
    }

    #[test]
    fn first_fit_skips_small_intervals() {
        let mut f = fixture();
        f.kva.seed(&f.heap, 0x1000, 0x3000); // 2 pages
        f.kva.seed(&f.heap, 0x8000, 0x1_0000); // 8 pages
        let got = f.kva.allocate(&f.heap, 4).unwrap();
        assert_eq!(got, 0x8000);
        assert_eq!(snapshot(&f.kva), vec![(0x1000, 0x3000), (0xC000, 0x1_0000)]);
    }

    #[test]
    fn exact_fit_consumes_the_node() {
        let mut f = fixture();
        f.kva.seed(&f.heap, 0x1000, 0x3000);
        let heap_used = f.heap.allocated_bytes();
        let got = f.kva.allocate(&f.heap, 2).unwrap();
        assert_eq!(got, 0x1000);
        assert!(f.kva.is_empty());
        assert!(f.heap.allocated_bytes() < heap_used);
    }

    #[test]
    fn free_coalesces_with_predecessor() {
        let mut f = fixture();
        f.kva.seed(&f.heap, 0x1000, 0x5000);
        let a = f.kva.allocate(&f.heap, 2).unwrap(); // [0x1000,0x3000)
        let b = f.kva.allocate(&f.heap, 1).unwrap(); // [0x3000,0x4000)
        assert_eq!((a, b), (0x1000, 0x3000));

        f.kva.free(&f.heap, a, 2);
        assert_eq!(snapshot(&f.kva), vec![(0x1000, 0x3000), (0x4000, 0x5000)]);
        // b's range bridges the two: everything merges into one node.
        f.kva.free(&f.heap, b, 1);
        assert_eq!(snapshot(&f.kva), vec![(0x1000, 0x5000)]);
    }

    #[test]
    fn free_inserts_island_without_neighbors() {
        let mut f = fixture();
        f.kva.seed(&f.heap, 0x1000, 0x2000);
        f.kva.free(&f.heap, 0x9000, 2);
        assert_eq!(snapshot(&f.kva), vec![(0x1000, 0x2000), (0x9000, 0xB000)]);
    }

    /// Invariant: after arbitrary allocate/free traffic, the tree
    /// holds no adjacent or overlapping intervals and the union of
    /// free intervals plus live allocations equals the seed.
    #[test]
    fn no_adjacent_intervals_and_conservation() {
        let mut f = fixture();
        const SEED_FIRST: u32 = 0x10_0000;
        const SEED_LAST: u32 = 0x20_0000; // 256 pages
        f.kva.seed(&f.heap, SEED_FIRST, SEED_LAST);

        let mut live: Vec<(u32, u32)> = Vec::new();
        let mut lcg: u32 = 0x1234_5678;
        let mut rand = move || {
            lcg = lcg.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            lcg >> 16
        };

        for step in 0..400 {
            let do_alloc = live.is_empty() || (rand() % 3) != 0;
            if do_alloc {
                let cpg = 1 + rand() % 8;
                let fits = snapshot(&f.kva)
                    .iter()
                    .any(|(a, b)| (b - a) >> 12 >= cpg);
                if fits {
                    let base = f.kva.allocate(&f.heap, cpg).unwrap();
                    live.push((base, cpg));
                }
            } else {
                let victim = (rand() as usize) % live.len();
                let (base, cpg) = live.swap_remove(victim);
                f.kva.free(&f.heap, base, cpg);
            }

            let snap = snapshot(&f.kva);
            for w in snap.windows(2) {
                assert!(w[0].1 < w[1].0, "adjacent or overlapping at step {step}");
            }
            let free_pages: u32 = snap.iter().map(|(a, b)| (b - a) >> 12).sum();
            let live_pages: u32 = live.iter().map(|(_, c)| c).sum();
            assert_eq!(
                free_pages + live_pages,
                (SEED_LAST - SEED_FIRST) >> 12,
                "page conservation at step {step}"
            );
        }

        // Drain everything; the seed must reassemble exactly.
        for (base, cpg) in live.drain(..) {
            f.kva.free(&f.heap, base, cpg);
        }
        assert_eq!(snapshot(&f.kva), vec![(SEED_FIRST, SEED_LAST)]);
    }
}
