//! Heap-internal base allocator.
//!
//! A bump allocator over dedicated chunks, used only by heap internals
//! that must never re-enter the main allocation paths: extent nodes,
//! radix-tree nodes, and other bookkeeping. Allocations are rounded to
//! cache lines and never freed individually; recycled extent nodes go
//! on a private LIFO instead.

use core::ptr;

use super::api::MutexGuard;
use super::extent::ExtentNode;
use super::Heap;

/// Cache-line rounding for base allocations.
const CACHELINE: usize = 64;

const fn cacheline_ceiling(size: usize) -> usize {
    (size + CACHELINE - 1) & !(CACHELINE - 1)
}

/// Bump state over the current base chunk. The first word of every
/// base chunk links to the previous one so the storage stays reachable
/// for the heap's lifetime.
pub(super) struct BaseState {
    pub chunks: *mut u8,
    pub next: *mut u8,
    pub past: *mut u8,
    pub free_nodes: *mut ExtentNode,
}

impl BaseState {
    pub(super) const fn new() -> BaseState {
        BaseState {
            chunks: ptr::null_mut(),
            next: ptr::null_mut(),
            past: ptr::null_mut(),
            free_nodes: ptr::null_mut(),
        }
    }
}

impl Heap {
    /// Pull a fresh chunk for the base region. Base chunks bypass the
    /// recycle path so bookkeeping storage never competes with the
    /// extents it describes.
    unsafe fn base_grow(&self, minimum: usize) -> bool {
        let size = self.chunk_ceiling(minimum);
        let mut zeroed = false;
        let chunk = self.chunk_alloc(size, self.chunk_size, true, &mut zeroed);
        if chunk.is_null() {
            return false;
        }
        let base = &mut *self.base.get();
        *(chunk as *mut *mut u8) = base.chunks;
        base.chunks = chunk;
        base.next = chunk.add(core::mem::size_of::<*mut u8>());
        base.past = chunk.add(size);
        true
    }

    /// Cache-line-aligned bookkeeping allocation. Never freed.
    pub(super) fn base_alloc(&self, size: usize) -> *mut u8 {
        let size = cacheline_ceiling(size);
        let _guard = MutexGuard::lock(self.base_mtx);
        unsafe {
            let state = &mut *self.base.get();
            if (state.next as usize) + size > state.past as usize {
                if !self.base_grow(size + core::mem::size_of::<*mut u8>()) {
                    return ptr::null_mut();
                }
            }
            let state = &mut *self.base.get();
            let rc = state.next;
            state.next = state.next.add(size);
            rc
        }
    }

    /// Take an extent node from the private free list, or carve a new
    /// one from the base region.
    pub(super) fn base_node_alloc(&self) -> *mut ExtentNode {
        let recycled = {
            let _guard = MutexGuard::lock(self.base_mtx);
            unsafe {
                let state = &mut *self.base.get();
                let node = state.free_nodes;
                if !node.is_null() {
                    state.free_nodes = *(node as *mut *mut ExtentNode);
                }
                node
            }
        };
        if !recycled.is_null() {
            return recycled;
        }
        self.base_alloc(core::mem::size_of::<ExtentNode>()) as *mut ExtentNode
    }

    /// Push a retired extent node onto the free LIFO.
    pub(super) fn base_node_dalloc(&self, node: *mut ExtentNode) {
        if node.is_null() {
            return;
        }
        let _guard = MutexGuard::lock(self.base_mtx);
        unsafe {
            let state = &mut *self.base.get();
            *(node as *mut *mut ExtentNode) = state.free_nodes;
            state.free_nodes = node;
        }
    }
}
