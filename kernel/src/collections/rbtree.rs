//! Intrusive left-leaning red-black trees.
//!
//! An implementation of left-leaning red-black 2-3 trees as described
//! in "Left-leaning Red-Black Trees" (Robert Sedgewick, 2008). Nodes
//! are embedded in their owning records; the tree never allocates. The
//! node color is stored in the low-order bit of the right-child
//! pointer, which is sound because every [`RbNode`] is at least
//! pointer-aligned.
//!
//! Keys are extracted through an [`RbAdapter`], so one record can sit
//! in several trees at once (e.g. the heap's extent nodes, which are
//! threaded through a size-address tree and an address tree).
//!
//! `floor`/`ceiling` are exact ordered lookups (greatest item not
//! above, least item not below); the kernel-address coalescing logic
//! depends on them never missing a neighbor.

use core::cmp::Ordering;
use core::marker::PhantomData;
use core::ptr;

const RED: bool = true;
const BLACK: bool = false;

/// Embedded tree-node hook. Zero/`new()` state is "not linked".
#[repr(C)]
pub struct RbNode {
    left: *mut RbNode,
    /// Right-child pointer with the node color in bit 0.
    right_color: usize,
}

impl RbNode {
    pub const fn new() -> RbNode {
        RbNode {
            left: ptr::null_mut(),
            right_color: 0,
        }
    }

    fn right(&self) -> *mut RbNode {
        (self.right_color & !1) as *mut RbNode
    }

    fn color(&self) -> bool {
        self.right_color & 1 != 0
    }

    fn set_right(&mut self, right: *mut RbNode) {
        self.right_color = (right as usize & !1) | (self.right_color & 1);
    }

    fn set_color(&mut self, color: bool) {
        self.right_color = (self.right_color & !1) | color as usize;
    }

    /// Reset the hook to a fresh, unlinked, red node.
    pub fn reset(&mut self) {
        self.left = ptr::null_mut();
        self.right_color = RED as usize;
    }
}

impl Default for RbNode {
    fn default() -> Self {
        RbNode::new()
    }
}

/// Glue between a tree and the records it indexes.
///
/// # Safety
///
/// `node_of`/`item_of` must translate between a record pointer and the
/// embedded [`RbNode`] of *that same record*, and `key_of` must be
/// stable while the record is linked into a tree.
pub unsafe trait RbAdapter {
    type Item;
    type Key: Copy;

    unsafe fn node_of(item: *mut Self::Item) -> *mut RbNode;
    unsafe fn item_of(node: *mut RbNode) -> *mut Self::Item;
    unsafe fn key_of(item: *const Self::Item) -> Self::Key;

    /// Compare a probe key (first argument) against a tree item's key.
    fn compare(probe: &Self::Key, item: &Self::Key) -> Ordering;
}

pub struct RbTree<A: RbAdapter> {
    root: *mut RbNode,
    _adapter: PhantomData<A>,
}

// The tree itself holds only pointers to records owned elsewhere; it is
// moved between contexts only under the kernel lock.
unsafe impl<A: RbAdapter> Send for RbTree<A> {}

fn is_red(node: *mut RbNode) -> bool {
    !node.is_null() && unsafe { (*node).color() }
}

unsafe fn rotate_left(h: *mut RbNode) -> *mut RbNode {
    let x = (*h).right();
    (*h).set_right((*x).left);
    (*x).left = h;
    (*x).set_color((*h).color());
    (*h).set_color(RED);
    x
}

unsafe fn rotate_right(h: *mut RbNode) -> *mut RbNode {
    let x = (*h).left;
    (*h).left = (*x).right();
    (*x).set_right(h);
    (*x).set_color((*h).color());
    (*h).set_color(RED);
    x
}

unsafe fn color_flip(h: *mut RbNode) {
    (*h).set_color(!(*h).color());
    if !(*h).left.is_null() {
        let l = (*h).left;
        (*l).set_color(!(*l).color());
    }
    let r = (*h).right();
    if !r.is_null() {
        (*r).set_color(!(*r).color());
    }
}

unsafe fn fix_up(mut h: *mut RbNode) -> *mut RbNode {
    if is_red((*h).right()) && !is_red((*h).left) {
        h = rotate_left(h);
    }
    if is_red((*h).left) && is_red((*(*h).left).left) {
        h = rotate_right(h);
    }
    if is_red((*h).left) && is_red((*h).right()) {
        color_flip(h);
    }
    h
}

unsafe fn move_red_left(mut h: *mut RbNode) -> *mut RbNode {
    color_flip(h);
    let r = (*h).right();
    if !r.is_null() && is_red((*r).left) {
        (*h).set_right(rotate_right(r));
        h = rotate_left(h);
        color_flip(h);
    }
    h
}

unsafe fn move_red_right(mut h: *mut RbNode) -> *mut RbNode {
    color_flip(h);
    if !(*h).left.is_null() && is_red((*(*h).left).left) {
        h = rotate_right(h);
        color_flip(h);
    }
    h
}

unsafe fn min_node(mut h: *mut RbNode) -> *mut RbNode {
    while !(*h).left.is_null() {
        h = (*h).left;
    }
    h
}

impl<A: RbAdapter> RbTree<A> {
    pub const fn new() -> Self {
        RbTree {
            root: ptr::null_mut(),
            _adapter: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Link `item` into the tree. The item's hook must be unlinked.
    ///
    /// # Safety
    ///
    /// `item` must stay valid and pinned for as long as it is linked.
    /// Its key must not compare equal to any key already in the tree.
    pub unsafe fn insert(&mut self, item: *mut A::Item) {
        let node = A::node_of(item);
        (*node).reset();
        let key = A::key_of(item);
        self.root = self.insert_at(self.root, node, &key);
        (*self.root).set_color(BLACK);
    }

    unsafe fn insert_at(
        &mut self,
        h: *mut RbNode,
        node: *mut RbNode,
        key: &A::Key,
    ) -> *mut RbNode {
        if h.is_null() {
            return node;
        }
        let h_key = A::key_of(A::item_of(h));
        match A::compare(key, &h_key) {
            Ordering::Less => {
                let l = self.insert_at((*h).left, node, key);
                (*h).left = l;
            }
            _ => {
                debug_assert!(
                    A::compare(key, &h_key) == Ordering::Greater,
                    "duplicate key inserted into intrusive tree"
                );
                let r = self.insert_at((*h).right(), node, key);
                (*h).set_right(r);
            }
        }
        fix_up(h)
    }

    /// Item whose key compares equal to `key`, or null.
    pub fn find(&self, key: &A::Key) -> *mut A::Item {
        let mut n = self.root;
        unsafe {
            while !n.is_null() {
                let item = A::item_of(n);
                match A::compare(key, &A::key_of(item)) {
                    Ordering::Equal => return item,
                    Ordering::Less => n = (*n).left,
                    Ordering::Greater => n = (*n).right(),
                }
            }
        }
        ptr::null_mut()
    }

    /// Leftmost (minimum-key) item, or null for an empty tree.
    pub fn find_min(&self) -> *mut A::Item {
        if self.root.is_null() {
            return ptr::null_mut();
        }
        unsafe { A::item_of(min_node(self.root)) }
    }

    /// Greatest item whose key is not above `key`, or null.
    pub fn floor(&self, key: &A::Key) -> *mut A::Item {
        let mut best = ptr::null_mut();
        let mut n = self.root;
        unsafe {
            while !n.is_null() {
                let item = A::item_of(n);
                match A::compare(key, &A::key_of(item)) {
                    Ordering::Equal => return item,
                    Ordering::Less => n = (*n).left,
                    Ordering::Greater => {
                        best = item;
                        n = (*n).right();
                    }
                }
            }
        }
        best
    }

    /// Least item whose key is not below `key`, or null.
    pub fn ceiling(&self, key: &A::Key) -> *mut A::Item {
        let mut best = ptr::null_mut();
        let mut n = self.root;
        unsafe {
            while !n.is_null() {
                let item = A::item_of(n);
                match A::compare(key, &A::key_of(item)) {
                    Ordering::Equal => return item,
                    Ordering::Greater => n = (*n).right(),
                    Ordering::Less => {
                        best = item;
                        n = (*n).left;
                    }
                }
            }
        }
        best
    }

    /// Unlink the item whose key compares equal to `key` and return it
    /// (null if no such item). The returned record's hook is stale; it
    /// must be `reset` before reinsertion anywhere.
    pub fn delete(&mut self, key: &A::Key) -> *mut A::Item {
        if self.find(key).is_null() {
            return ptr::null_mut();
        }
        let mut removed: *mut RbNode = ptr::null_mut();
        unsafe {
            self.root = self.delete_at(self.root, key, &mut removed);
            if !self.root.is_null() {
                (*self.root).set_color(BLACK);
            }
            debug_assert!(!removed.is_null());
            A::item_of(removed)
        }
    }

    unsafe fn delete_at(
        &mut self,
        mut h: *mut RbNode,
        key: &A::Key,
        removed: &mut *mut RbNode,
    ) -> *mut RbNode {
        if A::compare(key, &A::key_of(A::item_of(h))) == Ordering::Less {
            if !is_red((*h).left) && !(*h).left.is_null() && !is_red((*(*h).left).left) {
                h = move_red_left(h);
            }
            let l = self.delete_at((*h).left, key, removed);
            (*h).left = l;
        } else {
            if is_red((*h).left) {
                h = rotate_right(h);
            }
            if A::compare(key, &A::key_of(A::item_of(h))) == Ordering::Equal
                && (*h).right().is_null()
            {
                *removed = h;
                return ptr::null_mut();
            }
            {
                let r = (*h).right();
                if !r.is_null() && !is_red(r) && !is_red((*r).left) {
                    h = move_red_right(h);
                }
            }
            if A::compare(key, &A::key_of(A::item_of(h))) == Ordering::Equal {
                // Replace this node with the minimum of its right
                // subtree; the record being removed keeps its hook.
                let mut successor: *mut RbNode = ptr::null_mut();
                let r = self.delete_min_at((*h).right(), &mut successor);
                debug_assert!(!successor.is_null());
                (*successor).left = (*h).left;
                (*successor).set_right(r);
                (*successor).set_color((*h).color());
                *removed = h;
                h = successor;
            } else {
                let r = self.delete_at((*h).right(), key, removed);
                (*h).set_right(r);
            }
        }
        fix_up(h)
    }

    unsafe fn delete_min_at(
        &mut self,
        mut h: *mut RbNode,
        removed: &mut *mut RbNode,
    ) -> *mut RbNode {
        if (*h).left.is_null() {
            *removed = h;
            return ptr::null_mut();
        }
        if !is_red((*h).left) && !is_red((*(*h).left).left) {
            h = move_red_left(h);
        }
        let l = self.delete_min_at((*h).left, removed);
        (*h).left = l;
        fix_up(h)
    }

    /// In-order traversal. The visitor returns `false` to stop early;
    /// the walk returns `true` when it visited every item.
    pub fn walk(&self, visit: &mut dyn FnMut(*mut A::Item) -> bool) -> bool {
        unsafe { Self::walk_at(self.root, visit) }
    }

    unsafe fn walk_at(h: *mut RbNode, visit: &mut dyn FnMut(*mut A::Item) -> bool) -> bool {
        if h.is_null() {
            return true;
        }
        if !Self::walk_at((*h).left, visit) {
            return false;
        }
        if !visit(A::item_of(h)) {
            return false;
        }
        Self::walk_at((*h).right(), visit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec {
        node: RbNode,
        key: u32,
    }

    struct ByKey;

    unsafe impl RbAdapter for ByKey {
        type Item = Rec;
        type Key = u32;

        unsafe fn node_of(item: *mut Rec) -> *mut RbNode {
            core::ptr::addr_of_mut!((*item).node)
        }
        unsafe fn item_of(node: *mut RbNode) -> *mut Rec {
            (node as *mut u8).sub(core::mem::offset_of!(Rec, node)) as *mut Rec
        }
        unsafe fn key_of(item: *const Rec) -> u32 {
            (*item).key
        }
        fn compare(probe: &u32, item: &u32) -> Ordering {
            probe.cmp(item)
        }
    }

    fn make(keys: &[u32]) -> (Vec<Box<Rec>>, RbTree<ByKey>) {
        let mut recs: Vec<Box<Rec>> = keys
            .iter()
            .map(|&key| {
                Box::new(Rec {
                    node: RbNode::new(),
                    key,
                })
            })
            .collect();
        let mut tree = RbTree::<ByKey>::new();
        for r in recs.iter_mut() {
            unsafe { tree.insert(&mut **r) };
        }
        (recs, tree)
    }

    fn collect(tree: &RbTree<ByKey>) -> Vec<u32> {
        let mut out = Vec::new();
        tree.walk(&mut |item| {
            out.push(unsafe { (*item).key });
            true
        });
        out
    }

    #[test]
    fn insert_orders_in_order() {
        let (_recs, tree) = make(&[50, 20, 90, 10, 30, 70, 100, 60, 80]);
        assert_eq!(collect(&tree), vec![10, 20, 30, 50, 60, 70, 80, 90, 100]);
        assert_eq!(unsafe { (*tree.find_min()).key }, 10);
    }

    #[test]
    fn find_floor_ceiling() {
        let (_recs, tree) = make(&[10, 20, 30, 40]);
        assert_eq!(unsafe { (*tree.find(&30)).key }, 30);
        assert!(tree.find(&35).is_null());
        assert_eq!(unsafe { (*tree.floor(&35)).key }, 30);
        assert_eq!(unsafe { (*tree.floor(&40)).key }, 40);
        assert!(tree.floor(&5).is_null());
        assert_eq!(unsafe { (*tree.ceiling(&35)).key }, 40);
        assert_eq!(unsafe { (*tree.ceiling(&10)).key }, 10);
        assert!(tree.ceiling(&45).is_null());
    }

    #[test]
    fn floor_ceiling_never_miss_neighbors() {
        // Shapes that defeat a naive descent: the true neighbor can be
        // an ancestor rather than a subtree leaf.
        let (_recs, tree) = make(&[64, 32, 96, 16, 48, 80, 112, 40, 56]);
        for probe in 0u32..128 {
            let keys = [64u32, 32, 96, 16, 48, 80, 112, 40, 56];
            let want_floor = keys.iter().filter(|&&k| k <= probe).max().copied();
            let want_ceiling = keys.iter().filter(|&&k| k >= probe).min().copied();
            let got_floor = tree.floor(&probe);
            let got_ceiling = tree.ceiling(&probe);
            assert_eq!(
                want_floor,
                (!got_floor.is_null()).then(|| unsafe { (*got_floor).key }),
                "floor({probe})"
            );
            assert_eq!(
                want_ceiling,
                (!got_ceiling.is_null()).then(|| unsafe { (*got_ceiling).key }),
                "ceiling({probe})"
            );
        }
    }

    #[test]
    fn delete_keeps_order_and_membership() {
        let keys: Vec<u32> = (0..64).map(|i| (i * 37 + 11) % 1024).collect();
        let (_recs, mut tree) = make(&keys);
        let mut model: Vec<u32> = keys.clone();
        model.sort_unstable();

        // Delete in a scrambled order, checking the survivors after
        // each removal.
        let mut order = keys.clone();
        order.reverse();
        order.rotate_left(13);
        for k in order {
            let removed = tree.delete(&k);
            assert!(!removed.is_null());
            assert_eq!(unsafe { (*removed).key }, k);
            model.retain(|&m| m != k);
            assert_eq!(collect(&tree), model);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn delete_missing_is_null() {
        let (_recs, mut tree) = make(&[1, 2, 3]);
        assert!(tree.delete(&99).is_null());
        assert_eq!(collect(&tree), vec![1, 2, 3]);
    }

    #[test]
    fn delete_and_reinsert() {
        let (mut recs, mut tree) = make(&[5, 1, 9]);
        let removed = tree.delete(&5);
        assert!(!removed.is_null());
        unsafe { tree.insert(removed) };
        assert_eq!(collect(&tree), vec![1, 5, 9]);
        // keep recs alive to the end
        assert_eq!(recs.len(), 3);
        recs.clear();
    }

    #[test]
    fn walk_stops_early() {
        let (_recs, tree) = make(&[4, 2, 6, 1, 3, 5, 7]);
        let mut seen = Vec::new();
        let completed = tree.walk(&mut |item| {
            let k = unsafe { (*item).key };
            seen.push(k);
            k != 3
        });
        assert!(!completed);
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
