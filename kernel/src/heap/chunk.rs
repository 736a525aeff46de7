//! Chunk layer.
//!
//! Chunks — power-of-two, chunk-aligned regions from the injected
//! chunk allocator — are the unit everything above is carved from.
//! Freed chunks are purged through the capability and parked in two
//! extent trees (size-address for best-fit recycling, address-only for
//! coalescing) until they are reused. Every live non-base chunk is
//! registered in the radix tree, which is what `did_alloc` consults.
//!
//! Oversize allocations (at least one chunk) bypass the arena
//! entirely: they are whole chunks tracked in an address tree of their
//! own, and they are recognizable on free because only oversize
//! allocations hand out chunk-aligned pointers.

use core::ptr;

use super::api::MutexGuard;
use super::extent::{ExtentNode, SizeAddrKey};
use super::Heap;
use crate::status::Zeroing;

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl Heap {
    pub(super) fn chunk_ceiling(&self, size: usize) -> usize {
        align_up(size, self.chunk_size)
    }

    /// Base of the chunk containing `ptr`.
    pub(super) fn chunk_base(&self, ptr: *mut u8) -> *mut u8 {
        (ptr as usize & !(self.chunk_size - 1)) as *mut u8
    }

    /// Try to satisfy a chunk request from the free extents.
    ///
    /// `zeroed` carries "the caller wants zeroed memory" in and "the
    /// memory is zeroed" out.
    unsafe fn chunk_recycle(&self, size: usize, alignment: usize, zeroed: &mut bool) -> *mut u8 {
        // A region this large can always be carved to alignment.
        let Some(alloc_size) = size.checked_add(alignment - self.chunk_size) else {
            return ptr::null_mut();
        };
        if alloc_size < size {
            return ptr::null_mut();
        }

        let guard = MutexGuard::lock(self.chunks_mtx);
        let trees = &mut *self.chunks.get();
        let node = trees.by_size_addr.ceiling(&SizeAddrKey {
            size: alloc_size,
            addr: 0,
        });
        if node.is_null() {
            return ptr::null_mut();
        }

        let region = (*node).ptr;
        let leading = align_up(region as usize, alignment) - region as usize;
        debug_assert!((*node).size >= leading + size);
        let trailing = (*node).size - leading - size;
        let rc = region.add(leading);
        let was_zeroed = (*node).zeroed;
        if was_zeroed {
            *zeroed = true;
        }

        // Pull the extent out of both trees, then give back the
        // leading and trailing slack as smaller extents.
        let sa_key = SizeAddrKey {
            size: (*node).size,
            addr: region as usize,
        };
        trees.by_size_addr.delete(&sa_key);
        trees.by_addr.delete(&(region as usize));

        let mut spare = node;
        if leading > 0 {
            (*spare).size = leading;
            trees.by_size_addr.insert(spare);
            trees.by_addr.insert(spare);
            spare = ptr::null_mut();
        }
        if trailing > 0 {
            let tnode = if spare.is_null() {
                // Need another node; base allocation nests inside the
                // chunks lock by design (base never takes it back).
                let tnode = self.base_node_alloc();
                if tnode.is_null() {
                    // No bookkeeping for the remainder: undo by
                    // freeing the carved region wholesale.
                    drop(guard);
                    self.chunk_dealloc(rc, size, true);
                    return ptr::null_mut();
                }
                tnode
            } else {
                spare
            };
            ExtentNode::init(tnode, rc.add(size), trailing, was_zeroed);
            trees.by_size_addr.insert(tnode);
            trees.by_addr.insert(tnode);
            spare = ptr::null_mut();
        }
        drop(guard);

        if !spare.is_null() {
            self.base_node_dalloc(spare);
        }
        if *zeroed && !was_zeroed {
            ptr::write_bytes(rc, 0, size);
        }
        rc
    }

    /// Allocate a chunk-aligned region of `size` bytes (both multiples
    /// of the chunk size). `base` marks allocations for the base
    /// allocator, which skip recycling and registration.
    pub(super) fn chunk_alloc(
        &self,
        size: usize,
        alignment: usize,
        base: bool,
        zeroed: &mut bool,
    ) -> *mut u8 {
        debug_assert!(size != 0 && size & (self.chunk_size - 1) == 0);
        debug_assert!(alignment != 0 && alignment & (self.chunk_size - 1) == 0);

        let mut rc = if base {
            ptr::null_mut()
        } else {
            unsafe { self.chunk_recycle(size, alignment, zeroed) }
        };

        if rc.is_null() {
            match self.chunk_source.alloc_chunk(size, alignment) {
                Ok((chunk, fill)) => {
                    rc = chunk.as_ptr();
                    match fill {
                        Zeroing::Zeroed => *zeroed = true,
                        Zeroing::NonZeroed => {
                            if *zeroed {
                                // The caller asked for zeroes and the
                                // provider could not promise them.
                                unsafe { ptr::write_bytes(rc, 0, size) };
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("chunk allocation of {size} bytes failed: {e}");
                    return ptr::null_mut();
                }
            }
        }

        if !base && !self.rtree_set(rc as usize, rc) {
            self.chunk_dealloc(rc, size, true);
            return ptr::null_mut();
        }
        debug_assert_eq!(self.chunk_base(rc), rc);
        rc
    }

    /// Park a freed region in the extent trees, coalescing forward
    /// then backward.
    unsafe fn chunk_record(&self, chunk: *mut u8, size: usize) {
        let unzeroed = matches!(
            self.chunk_source
                .purge_unused(ptr::NonNull::new_unchecked(chunk), size),
            Ok(Zeroing::NonZeroed) | Err(_)
        );

        // Get the node we may need before taking the tree lock.
        let mut fresh = self.base_node_alloc();
        let mut retired: *mut ExtentNode = ptr::null_mut();
        {
            let _guard = MutexGuard::lock(self.chunks_mtx);
            let trees = &mut *self.chunks.get();

            // Forward: is the extent starting at our end already free?
            let end = chunk as usize + size;
            let succ = trees.by_addr.ceiling(&end);
            let node = if !succ.is_null() && (*succ).ptr as usize == end {
                let sa_key = SizeAddrKey {
                    size: (*succ).size,
                    addr: end,
                };
                trees.by_size_addr.delete(&sa_key);
                // Extending downward keeps the address ordering: the
                // gap being bridged held no other extent.
                (*succ).ptr = chunk;
                (*succ).size += size;
                (*succ).zeroed = (*succ).zeroed && !unzeroed;
                trees.by_size_addr.insert(succ);
                succ
            } else {
                if fresh.is_null() {
                    // Losing track of a chunk beats corrupting the
                    // trees; in kernel context this is worth a loud
                    // complaint.
                    log::error!("leaking {size}-byte chunk: no extent node available");
                    return;
                }
                ExtentNode::init(fresh, chunk, size, !unzeroed);
                trees.by_size_addr.insert(fresh);
                trees.by_addr.insert(fresh);
                core::mem::replace(&mut fresh, ptr::null_mut())
            };

            // Backward: does a free extent end exactly where this
            // region starts?
            let prev = trees.by_addr.floor(&(chunk as usize - 1));
            if !prev.is_null() && (*prev).ptr as usize + (*prev).size == chunk as usize {
                let prev_sa = SizeAddrKey {
                    size: (*prev).size,
                    addr: (*prev).ptr as usize,
                };
                trees.by_size_addr.delete(&prev_sa);
                trees.by_addr.delete(&((*prev).ptr as usize));

                let node_sa = SizeAddrKey {
                    size: (*node).size,
                    addr: (*node).ptr as usize,
                };
                trees.by_size_addr.delete(&node_sa);
                (*node).ptr = (*prev).ptr;
                (*node).size += (*prev).size;
                (*node).zeroed = (*node).zeroed && (*prev).zeroed;
                trees.by_size_addr.insert(node);
                retired = prev;
            }
        }
        if !fresh.is_null() {
            self.base_node_dalloc(fresh);
        }
        if !retired.is_null() {
            self.base_node_dalloc(retired);
        }
    }

    /// Deregister and optionally retire a chunk.
    pub(super) fn chunk_dealloc(&self, chunk: *mut u8, size: usize, unmap: bool) {
        debug_assert!(!chunk.is_null());
        debug_assert_eq!(self.chunk_base(chunk), chunk);
        debug_assert!(size != 0 && size & (self.chunk_size - 1) == 0);

        self.rtree_set(chunk as usize, ptr::null_mut());
        if unmap {
            unsafe { self.chunk_record(chunk, size) };
        }
    }

    // -- Oversize allocations ---------------------------------------------

    /// Allocate `size` bytes as whole chunks, bypassing the arena.
    pub(super) fn huge_alloc(&self, size: usize, zero: bool) -> *mut u8 {
        let csize = self.chunk_ceiling(size);
        if csize == 0 {
            return ptr::null_mut();
        }
        let node = self.base_node_alloc();
        if node.is_null() {
            return ptr::null_mut();
        }
        let mut zeroed = zero;
        let chunk = self.chunk_alloc(csize, self.chunk_size, false, &mut zeroed);
        if chunk.is_null() {
            self.base_node_dalloc(node);
            return ptr::null_mut();
        }
        unsafe {
            ExtentNode::init(node, chunk, csize, zeroed);
            let _guard = MutexGuard::lock(self.huge_mtx);
            (*self.huge.get()).insert(node);
        }
        chunk
    }

    /// Size of an oversize allocation, or None if `ptr` is not one.
    pub(super) fn huge_salloc(&self, ptr_in: *mut u8) -> Option<usize> {
        let _guard = MutexGuard::lock(self.huge_mtx);
        unsafe {
            let node = (*self.huge.get()).find(&(ptr_in as usize));
            if node.is_null() {
                None
            } else {
                Some((*node).size)
            }
        }
    }

    /// Release an oversize allocation.
    pub(super) fn huge_dalloc(&self, ptr_in: *mut u8) {
        let node = {
            let _guard = MutexGuard::lock(self.huge_mtx);
            unsafe { (*self.huge.get()).delete(&(ptr_in as usize)) }
        };
        debug_assert!(!node.is_null(), "oversize free of unknown pointer");
        if node.is_null() {
            return;
        }
        unsafe {
            let (chunk, size) = ((*node).ptr, (*node).size);
            self.chunk_dealloc(chunk, size, true);
        }
        self.base_node_dalloc(node);
    }
}
