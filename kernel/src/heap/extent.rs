//! Extent nodes: free-region records for the chunk layer.
//!
//! One node describes a contiguous free region `{ptr, size, zeroed}`
//! and threads through two trees at once — ordered by (size, address)
//! for best-fit recycling and by address alone for coalescing.

use core::cmp::Ordering;
use core::ptr;

use crate::collections::rbtree::{RbAdapter, RbNode};

pub struct ExtentNode {
    size_addr_link: RbNode,
    addr_link: RbNode,
    pub ptr: *mut u8,
    pub size: usize,
    pub zeroed: bool,
}

impl ExtentNode {
    /// Write a fresh record into raw storage.
    ///
    /// # Safety
    ///
    /// `slot` must be valid storage for an `ExtentNode`.
    pub unsafe fn init(slot: *mut ExtentNode, region: *mut u8, size: usize, zeroed: bool) {
        ptr::write(
            slot,
            ExtentNode {
                size_addr_link: RbNode::new(),
                addr_link: RbNode::new(),
                ptr: region,
                size,
                zeroed,
            },
        );
    }
}

/// Key for the (size, address) tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeAddrKey {
    pub size: usize,
    pub addr: usize,
}

pub struct SizeAddrAdapter;

unsafe impl RbAdapter for SizeAddrAdapter {
    type Item = ExtentNode;
    type Key = SizeAddrKey;

    unsafe fn node_of(item: *mut ExtentNode) -> *mut RbNode {
        ptr::addr_of_mut!((*item).size_addr_link)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut ExtentNode {
        (node as *mut u8).sub(core::mem::offset_of!(ExtentNode, size_addr_link))
            as *mut ExtentNode
    }
    unsafe fn key_of(item: *const ExtentNode) -> SizeAddrKey {
        SizeAddrKey {
            size: (*item).size,
            addr: (*item).ptr as usize,
        }
    }
    fn compare(probe: &SizeAddrKey, item: &SizeAddrKey) -> Ordering {
        probe
            .size
            .cmp(&item.size)
            .then(probe.addr.cmp(&item.addr))
    }
}

pub struct AddrAdapter;

unsafe impl RbAdapter for AddrAdapter {
    type Item = ExtentNode;
    type Key = usize;

    unsafe fn node_of(item: *mut ExtentNode) -> *mut RbNode {
        ptr::addr_of_mut!((*item).addr_link)
    }
    unsafe fn item_of(node: *mut RbNode) -> *mut ExtentNode {
        (node as *mut u8).sub(core::mem::offset_of!(ExtentNode, addr_link)) as *mut ExtentNode
    }
    unsafe fn key_of(item: *const ExtentNode) -> usize {
        (*item).ptr as usize
    }
    fn compare(probe: &usize, item: &usize) -> Ordering {
        probe.cmp(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::rbtree::RbTree;

    #[test]
    fn node_sits_in_both_trees_at_once() {
        let mut nodes: Vec<Box<ExtentNode>> = [(0x40_0000usize, 0x80_0000usize),
            (0xC0_0000, 0x40_0000),
            (0x100_0000, 0x40_0000)]
        .iter()
        .map(|&(addr, size)| {
            let mut n: Box<ExtentNode> = Box::new(unsafe { core::mem::zeroed() });
            unsafe { ExtentNode::init(&mut *n, addr as *mut u8, size, false) };
            n
        })
        .collect();

        let mut by_size: RbTree<SizeAddrAdapter> = RbTree::new();
        let mut by_addr: RbTree<AddrAdapter> = RbTree::new();
        for n in nodes.iter_mut() {
            unsafe {
                by_size.insert(&mut **n);
                by_addr.insert(&mut **n);
            }
        }

        // Best-fit: the smallest node of sufficient size, lowest
        // address first among equals.
        let fit = by_size.ceiling(&SizeAddrKey {
            size: 0x40_0000,
            addr: 0,
        });
        assert_eq!(unsafe { (*fit).ptr } as usize, 0xC0_0000);

        // Address ordering is independent of size ordering.
        let min = by_addr.find_min();
        assert_eq!(unsafe { (*min).ptr } as usize, 0x40_0000);

        // Removing from one tree leaves the other intact.
        let key = unsafe { SizeAddrAdapter::key_of(fit) };
        by_size.delete(&key);
        assert!(!by_addr.find(&0xC0_0000).is_null());
    }
}
