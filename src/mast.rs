//! Module `mast` implement the Masstree index: a trie of cache-aware,
//! lock-coupled B+ trees mapping byte-string keys to opaque 64-bit
//! values, with lock-free readers and fine-grained locking writers.
//!
//! The descent, split and collapse protocol in a nutshell:
//!
//! * Readers validate every hand-over-hand step against the version
//!   words captured along the path; a failed check either retries the
//!   step or, when the split counter moved, restarts from the root.
//!   Splits go only to-the-right, so a reader that missed a split
//!   recovers by walking the sibling chain instead of re-descending.
//! * Writers lock bottom-up within a layer, top-down across layers and
//!   left-to-right along the sibling chain, which keeps the lock order
//!   acyclic.
//! * A layer may get a new root on split or collapse, or disappear
//!   outright; stale root pointers are healed by walking the parent
//!   chain, dismantled layers are flagged `DE_LAYER` and their entry in
//!   the upper layer is stripped by the next descending writer.

use log::debug;

use std::sync::atomic::{
    fence, AtomicPtr,
    Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
};
use std::{fmt, ptr, result};

use crate::alloc::{Allocator, SysAlloc};
use crate::error::Error;
use crate::node::{
    as_inode, as_leaf, fetch_slice, free_node, gc_next_of, key_llen, key_type, new_inode,
    new_leaf, node_version, parent_of, perm_keyidx, perm_nkeys, set_parent, Inode, Leaf,
    NodePtr, KT_LAYER, KT_NOTFOUND, KT_UNSTABLE, KT_VALUE, NODE_MAX, NODE_PIVOT,
};
use crate::version::{self, Version};
use crate::Result;

/// Maximum height of the B+ tree within a single layer:
///
/// ```text
///     h <= log_d((n + 1) / 2)
/// ```
///
/// The order here is d = 7.5, since the fanout is 16. The number of
/// slices has an upper bound of 2^64 and the number of keys per slice
/// has an upper bound of 9, eight possible lengths plus an entry for
/// the next layer. Hence n = 9 * 2^64 and h <= ~23. Useful to size
/// path buffers.
pub const MAX_HEIGHT: usize = 23;

// Entries collected per descent while iterating; the cursor resumes the
// scan where the batch stopped.
const ITER_BATCH: usize = 32;

/// Index is a Masstree instance. Safe to share across threads; any
/// number of concurrent readers and writers.
///
/// Values are opaque 64-bit words. The index never interprets, clones
/// or frees a value; callers storing pointers pair [Index::del] with
/// their own deferred reclamation, exactly as they pair node retirement
/// with [Index::gc_run].
pub struct Index {
    root: AtomicPtr<Version>,
    gc_nodes: AtomicPtr<Version>,
    alloc: Box<dyn Allocator>,
}

// All shared state is atomic and the version protocol provides the
// ordering; the allocator is required to be Send + Sync by its trait
// bound.
unsafe impl Send for Index {}
unsafe impl Sync for Index {}

impl Default for Index {
    fn default() -> Index {
        Index::new()
    }
}

impl Index {
    /// Create an empty index backed by [SysAlloc].
    pub fn new() -> Index {
        Index::with_alloc(Box::new(SysAlloc))
    }

    /// Create an empty index backed by `alloc`. The allocator supplies
    /// node blocks and sees every block back via [Allocator::free] once
    /// retirement completes.
    pub fn with_alloc(alloc: Box<dyn Allocator>) -> Index {
        let root = new_leaf(&*alloc, version::IS_ROOT);
        assert!(!root.is_null(), "allocator failed bootstrapping the index");
        fence(SeqCst);

        debug!(target: "mast", "created index, root {:p}", root);

        Index {
            root: AtomicPtr::new(root as NodePtr),
            gc_nodes: AtomicPtr::new(ptr::null_mut()),
            alloc,
        }
    }

    /// Consume the index, checking the contract that it is empty and
    /// quiescent. A non-empty index is a programmer error: asserts under
    /// debug, returns [Error::Invalid] otherwise. The nodes themselves
    /// are freed by Drop either way.
    pub fn destroy(self) -> Result<()> {
        let root = self.load_root();
        let empty = unsafe {
            let v = node_version(root).get();
            (v & version::IS_BORDER) != 0 && as_leaf(root).nkeys() == 0
        } && self.gc_nodes.load(Relaxed).is_null();

        debug_assert!(empty, "destroy on a non-empty index! call the programmer");
        if empty {
            Ok(())
        } else {
            err_at!(Invalid, msg: "destroy on a non-empty index")
        }
    }

    #[inline]
    fn load_root(&self) -> NodePtr {
        self.root.load(Acquire)
    }
}

// Write operations.
impl Index {
    /// Set `key` to `value`. Returns the replaced value, or None when
    /// the key was newly inserted.
    ///
    /// Fails only on node allocation: [Error::OutOfMemory] leaves the
    /// index in its pre-call state.
    pub fn put(&self, key: &[u8], value: u64) -> Result<Option<u64>> {
        let mut root = self.load_root();
        let mut layer = 0;

        'advance: loop {
            let (skey, kinfo) = fetch_slice(key, layer);
            layer += 1;

            let leaf = match self.find_leaf_locked(root, skey) {
                Some(leaf) => leaf,
                None => {
                    // Collided with a layer deletion; re-try from the
                    // top root.
                    root = self.load_root();
                    layer = 0;
                    continue 'advance;
                }
            };
            let lf = unsafe { &*leaf };
            let node = lf.as_node();

            let (idx, typ) = lf.find_value(skey, key_llen(kinfo));
            match typ {
                KT_VALUE => {
                    // The key was found: store the new value in place.
                    let old = lf.value_at(idx);
                    lf.set_value(idx, value);
                    unsafe { node_version(node) }.unlock();
                    return Ok(Some(old));
                }
                KT_LAYER => {
                    // Continue to the next layer, fixing up the root
                    // pointer if it went stale.
                    let mut lroot = lf.value_at(idx) as usize as NodePtr;
                    if !unsafe { node_version(lroot) }.has(version::IS_ROOT) {
                        lroot = unsafe { walk_to_root(lroot) };
                        lf.set_value(idx, lroot as u64);
                    }
                    unsafe { node_version(node) }.unlock();
                    root = lroot;
                    continue 'advance;
                }
                _ => {
                    debug_assert!(
                        typ == KT_NOTFOUND,
                        "unstable tag under the leaf lock! call the programmer"
                    );
                }
            }

            // The key was not found: insert it, growing a fresh layer
            // for every slice still to come.
            let mut node = node;
            let mut skey = skey;
            let mut kinfo = kinfo;
            loop {
                let lf = unsafe { as_leaf(node) };
                let layered = (kinfo & KT_LAYER) != 0;

                let (sval, nlayer) = if layered {
                    let bits = version::LOCKED | version::INSERTING | version::IS_ROOT;
                    let nl = new_leaf(&*self.alloc, bits);
                    if nl.is_null() {
                        unsafe { node_version(node) }.unlock();
                        return err_at!(OutOfMemory, msg: "put, new layer root");
                    }
                    fence(SeqCst);
                    (nl as u64, nl)
                } else {
                    (value, ptr::null_mut())
                };

                if !lf.insert(skey, kinfo, sval) {
                    // The node is full: split, carrying the entry along.
                    if let Err(err) = self.split_leaf(node, skey, kinfo, sval) {
                        if !nlayer.is_null() {
                            // Never published; discard.
                            unsafe { free_node(&*self.alloc, nlayer as NodePtr) };
                        }
                        return Err(err);
                    }
                } else {
                    unsafe { node_version(node) }.unlock();
                }

                if !layered {
                    return Ok(None);
                }

                // Jump into the freshly grown layer; it is still locked
                // and dirty, holding concurrent readers at the gate.
                let (nskey, nkinfo) = fetch_slice(key, layer);
                layer += 1;
                skey = nskey;
                kinfo = nkinfo;
                node = nlayer as NodePtr;
            }
        }
    }

    /// Remove `key`. Returns the removed value, None when the key was
    /// absent.
    pub fn del(&self, key: &[u8]) -> Option<u64> {
        let mut root = self.load_root();
        let mut layer = 0;
        let mut cleanup = 0;
        let mut old = None;

        'advance: loop {
            let (skey, kinfo) = fetch_slice(key, layer);
            layer += 1;

            let leaf = match self.find_leaf_locked(root, skey) {
                Some(leaf) => leaf,
                None => {
                    root = self.load_root();
                    layer = 0;
                    continue 'advance;
                }
            };
            let lf = unsafe { &*leaf };
            let node = lf.as_node();

            let (idx, typ) = lf.find_value(skey, key_llen(kinfo));
            match typ {
                KT_VALUE => old = Some(lf.value_at(idx)),
                KT_LAYER => {
                    // Check it points to the real root; if not, walk up
                    // and reset the pointer.
                    let mut lroot = lf.value_at(idx) as usize as NodePtr;
                    if !unsafe { node_version(lroot) }.has(version::IS_ROOT) {
                        lroot = unsafe { walk_to_root(lroot) };
                        lf.set_value(idx, lroot as u64);
                    }

                    if layer != cleanup {
                        unsafe { node_version(node) }.unlock();
                        root = lroot;
                        continue 'advance;
                    }
                    debug_assert!(cleanup != 0);
                    if !unsafe { node_version(lroot) }.has(version::DE_LAYER) {
                        // A racing thread performed the fixup.
                        unsafe { node_version(node) }.unlock();
                        return old;
                    }
                    // The layer below died; fall through and strip its
                    // entry out of this leaf.
                }
                _ => {
                    debug_assert!(
                        typ == KT_NOTFOUND,
                        "unstable tag under the leaf lock! call the programmer"
                    );
                    unsafe { node_version(node) }.unlock();
                    return old;
                }
            }

            if !lf.remove(skey, key_llen(kinfo)) {
                unsafe { node_version(node) }.unlock();
                return old;
            }

            // It was the last entry: delete the whole leaf, collapsing
            // up-tree. When an entire layer died, restart from the top
            // to strip its entry out of the upper layer.
            if !self.delete_leaf(node, skey) {
                return old;
            }
            cleanup = layer - 1;
            root = self.load_root();
            layer = 0;
        }
    }
}

// Read operations.
impl Index {
    /// Fetch the value for `key`, None when absent. Lock-free; retries
    /// internally on interference from concurrent writers.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        let mut root = self.load_root();
        let mut layer = 0;

        'advance: loop {
            let (skey, kinfo) = fetch_slice(key, layer);
            layer += 1;
            let klen = key_llen(kinfo);

            'retry: loop {
                let (mut leaf, mut v) = self.find_leaf(root, skey);
                loop {
                    if (v & version::DELETED) != 0 {
                        // Collided with a deletion; from the root again.
                        continue 'retry;
                    }
                    let lf = unsafe { &*leaf };

                    // Fetch the value, or the pointer to the next layer.
                    let (idx, typ) = lf.find_value(skey, klen);
                    let lv = lf.value_at(idx);
                    fence(SeqCst);

                    // Check that the version has not changed; a split
                    // moves entries only to-the-right, walk the chain.
                    if (lf.version.get() ^ v) > version::LOCKED {
                        let (nleaf, nv) = self.walk_right(leaf, skey);
                        leaf = nleaf;
                        v = nv;
                        continue;
                    }

                    return match typ {
                        KT_VALUE => Some(lv),
                        KT_LAYER => {
                            // Advance the key into the next layer.
                            root = lv as usize as NodePtr;
                            continue 'advance;
                        }
                        _ => None,
                    };
                }
            }
        }
    }

    /// Iterate entries, in key order, starting from `key` inclusive.
    /// Pure reader: holds no locks, revalidates node versions as it
    /// goes. Keys never repeat and never regress; entries inserted
    /// concurrently behind the cursor are not reported.
    pub fn iter_from<'a>(&'a self, key: &[u8]) -> Iter<'a> {
        Iter {
            index: self,
            from: key.to_vec(),
            inclusive: true,
            batch: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Full scan, in key order.
    pub fn iter(&self) -> Iter {
        self.iter_from(b"")
    }
}

// Reclamation.
impl Index {
    /// Detach the current retirement list and return it as an opaque
    /// handle, to be freed via [Index::gc_run] at a quiescent point.
    pub fn gc_prepare(&self) -> GcList {
        let head = self.gc_nodes.swap(ptr::null_mut(), AcqRel);
        GcList { head }
    }

    /// Free every node staged on `list`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee quiescence: every operation that began
    /// before the matching [Index::gc_prepare] has completed, and no
    /// thread holds a reference into the detached nodes.
    pub unsafe fn gc_run(&self, list: GcList) {
        let mut node = list.head;
        let mut count = 0;
        while !node.is_null() {
            debug_assert!(
                node_version(node).has(version::DELETED | version::DE_LAYER),
                "live node on the retirement list! call the programmer"
            );
            let next = gc_next_of(node).load(Relaxed);
            free_node(&*self.alloc, node);
            node = next;
            count += 1;
        }
        if count > 0 {
            debug!(target: "mast", "gc freed {} nodes", count);
        }
    }

    /// Release the lock of a deleted node and stage it for reclamation.
    fn unlock_gc(&self, node: NodePtr) {
        debug_assert!(unsafe { node_version(node) }
            .has(version::DELETED | version::DE_LAYER));
        unsafe { node_version(node) }.unlock();

        let gc_next = unsafe { gc_next_of(node) };
        loop {
            let head = self.gc_nodes.load(Relaxed);
            gc_next.store(head, Relaxed);
            if self
                .gc_nodes
                .compare_exchange_weak(head, node, Release, Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

// Descent.
impl Index {
    /// Traverse a layer, without acquiring any locks, to the leaf
    /// covering `skey`. Returns the leaf with its stable version.
    /// Hand-over-hand validation: each captured child pointer is only
    /// trusted if the parent's version held still; a moved split
    /// counter restarts the descent.
    fn find_leaf(&self, root: NodePtr, skey: u64) -> (*mut Leaf, u32) {
        let mut root = root;
        'retry: loop {
            let mut node = root;
            let mut v = unsafe { node_version(node) }.stable();

            // Handle stale roots which can occur due to splits.
            if (v & version::IS_ROOT) == 0 {
                node = unsafe { walk_to_root(node) };
                root = node;
                v = unsafe { node_version(node) }.stable();
            }

            while (v & version::IS_BORDER) == 0 {
                let child = unsafe { as_inode(node) }.lookup(skey);
                let cv = unsafe { node_version(child) }.stable();

                if (unsafe { node_version(node) }.get() ^ v) <= version::LOCKED {
                    // Good - keep descending.
                    node = child;
                    v = cv;
                    continue;
                }

                // If a split occurred the hierarchy might have been
                // disrupted; retry from the root.
                let nv = unsafe { node_version(node) }.stable();
                if (nv & version::V_SPLIT) != (v & version::V_SPLIT) {
                    continue 'retry;
                }
                v = nv;
            }
            return (node as *mut Leaf, v);
        }
    }

    /// Walk the sibling chain to-the-right after a version check
    /// failed. Reliable because splits only ever move entries right.
    fn walk_right(&self, leaf: *mut Leaf, skey: u64) -> (*mut Leaf, u32) {
        let mut leaf = leaf;
        let mut v = unsafe { &*leaf }.version.stable();
        let mut next = unsafe { &*leaf }.next.load(Acquire);

        while (v & version::DELETED) == 0 && !next.is_null() {
            // Compare with the lowest slice of the next leaf.
            if !unsafe { &*next }.covers_slice(skey) {
                break;
            }
            v = unsafe { &*next }.version.stable();
            leaf = next;
            next = unsafe { &*leaf }.next.load(Acquire);
        }
        (leaf, v)
    }

    /// Reader descent, then lock the leaf and re-check the split
    /// counter and deletion flags. None means the layer is being
    /// dismantled and the caller shall restart from the top root.
    fn find_leaf_locked(&self, root: NodePtr, skey: u64) -> Option<*mut Leaf> {
        'retry: loop {
            let (mut leaf, mut v) = self.find_leaf(root, skey);
            loop {
                if (v & version::DE_LAYER) != 0 {
                    return None;
                }
                if (v & version::DELETED) != 0 {
                    continue 'retry;
                }

                let lf = unsafe { &*leaf };
                lf.version.lock();
                let nvc = lf.version.get() & (version::V_SPLIT | version::DELETED);
                if nvc != (v & version::V_SPLIT) {
                    lf.version.unlock();
                    let (nleaf, nv) = self.walk_right(leaf, skey);
                    leaf = nleaf;
                    v = nv;
                    continue;
                }
                return Some(leaf);
            }
        }
    }
}

// Split and collapse.
impl Index {
    /// Split a full leaf and insert `(skey, kinfo, value)` into the
    /// correct half, then propagate up-tree, splitting full ancestors
    /// and synthesising a new root when the old one splits.
    ///
    /// The leaf lock is consumed. Only the first allocation can fail
    /// with the index unchanged; running out of memory mid-ascend
    /// aborts, a half-published split cannot be unwound.
    fn split_leaf(&self, node: NodePtr, skey: u64, kinfo: u8, value: u64) -> Result<()> {
        let leaf = unsafe { as_leaf(node) };
        debug_assert!(leaf.version.is_locked());

        let nleaf_ptr = new_leaf(&*self.alloc, version::LOCKED);
        if nleaf_ptr.is_null() {
            leaf.version.unlock();
            return err_at!(OutOfMemory, msg: "split, right leaf");
        }
        let nleaf = unsafe { &*nleaf_ptr };

        // Copy the high half into the fresh leaf, flag both dirty, and
        // only then shrink the original's permutation.
        let removed = leaf.migrate_high(nleaf);
        nleaf.version.set(version::SPLITTING);
        nleaf.set_sequential(NODE_MAX - NODE_PIVOT);
        fence(SeqCst);
        let mut nkey = nleaf.slice_at(0);

        // Splice into the sibling list. The right neighbour's 'prev' may
        // be updated because this leaf, its current 'prev', is locked.
        let next = leaf.next.load(Relaxed);
        nleaf.next.store(next, Relaxed);
        if !next.is_null() {
            unsafe { &*next }.prev.store(nleaf_ptr, Release);
        }
        nleaf.prev.store(node as *mut Leaf, Relaxed);
        nleaf.parent.store(leaf.parent.load(Relaxed), Relaxed);

        leaf.version.set(version::SPLITTING);
        fence(SeqCst);
        leaf.shrink_migrated(removed);

        // Insert the new entry on whichever side it belongs, and only
        // then make the right leaf reachable from the left.
        let ok = if nleaf.covers_key(skey, key_llen(kinfo)) {
            nleaf.insert(skey, kinfo, value)
        } else {
            leaf.insert(skey, kinfo, value)
        };
        debug_assert!(ok, "split halves cannot be full! call the programmer");
        leaf.next.store(nleaf_ptr, Release);

        // Done with the leaves; ascend the internodes, both sides
        // locked.
        let mut node = node;
        let mut nnode = nleaf_ptr as NodePtr;
        loop {
            let parent = match self.lock_parent(node) {
                None => {
                    // We have reached the root: synthesise a new one.
                    let bits = version::LOCKED | version::INSERTING | version::IS_ROOT;
                    let pnode_ptr = new_inode(&*self.alloc, bits);
                    if pnode_ptr.is_null() {
                        grow_failed()
                    }
                    let pnode = unsafe { &*pnode_ptr };

                    pnode.set_separator(0, nkey);
                    pnode.set_child(0, node);
                    pnode.set_child(1, nnode);
                    pnode.set_nkeys(1);
                    fence(SeqCst);

                    unsafe {
                        set_parent(nnode, pnode_ptr);
                        set_parent(node, pnode_ptr);
                    }
                    let parent = pnode_ptr as NodePtr;

                    // Long live new root! Only the top layer's root is
                    // recorded on the index itself.
                    let _ = self
                        .root
                        .compare_exchange(node, parent, SeqCst, SeqCst);

                    // Unlock clears IS_ROOT on the split nodes.
                    unsafe {
                        node_version(parent).unlock();
                        node_version(nnode).unlock();
                        node_version(node).unlock();
                    }
                    return Ok(());
                }
                Some(parent) => parent,
            };

            if unsafe { as_inode(parent) }.nkeys() == NODE_MAX {
                // The parent is full: split it and ascend, carrying the
                // pivot as the next separator. The lock of the already
                // published child can go.
                unsafe { node_version(node) }.unlock();
                let (rnode, midkey) = self.split_inode(parent, nkey, nnode);
                unsafe { node_version(nnode) }.unlock();

                node = parent;
                nnode = rnode;
                nkey = midkey;
                continue;
            }

            // The parent is not full: flag it dirty and insert.
            unsafe { node_version(parent) }.set(version::INSERTING);
            unsafe { node_version(node) }.unlock();
            unsafe { as_inode(parent) }.insert(nkey, nnode);

            unsafe { node_version(nnode) }.unlock();
            unsafe { node_version(parent) }.unlock();
            return Ok(());
        }
    }

    /// Split a full interior node: the high half moves into a fresh
    /// right node, the pivot separator is returned for the level above,
    /// and the pending `(ckey, nchild)` lands on the correct side.
    fn split_inode(&self, parent: NodePtr, ckey: u64, nchild: NodePtr) -> (NodePtr, u64) {
        let lnode = unsafe { as_inode(parent) };
        debug_assert!(lnode.version.is_locked());
        debug_assert!(unsafe { node_version(nchild) }.is_locked());
        debug_assert!(lnode.nkeys() == NODE_MAX);

        let rnode_ptr = new_inode(&*self.alloc, version::LOCKED | version::SPLITTING);
        if rnode_ptr.is_null() {
            grow_failed()
        }
        let rnode = unsafe { &*rnode_ptr };

        let split = NODE_PIVOT + 1;
        let count = NODE_MAX - split;
        let midkey = lnode.slice_at(NODE_PIVOT);

        rnode.parent.store(lnode.parent.load(Relaxed), Relaxed);

        // Copy all separators after the pivot; the pivot itself moves
        // up as the middle key.
        for i in 0..count {
            rnode.set_separator(i, lnode.slice_at(split + i));
        }
        for i in 0..=count {
            let child = lnode.child_at(split + i);
            rnode.set_child(i, child);
            unsafe { set_parent(child, rnode_ptr) };
        }
        rnode.set_nkeys(count);

        lnode.version.set(version::SPLITTING);
        fence(SeqCst);
        lnode.set_nkeys(split - 1);

        // Insert the pending child into the correct half.
        let pnode = if ckey < midkey {
            parent
        } else {
            rnode_ptr as NodePtr
        };
        unsafe { as_inode(pnode) }.insert(ckey, nchild);

        (rnode_ptr as NodePtr, midkey)
    }

    /// Lock the parent, re-checking that it still is the parent once
    /// locked; the parent pointer is only trusted under the parent's
    /// own lock.
    fn lock_parent(&self, node: NodePtr) -> Option<NodePtr> {
        loop {
            let parent = unsafe { parent_of(node) };
            if parent.is_null() {
                return None;
            }
            let pnode = parent as NodePtr;
            unsafe { node_version(pnode) }.lock();
            if unsafe { parent_of(node) } == parent {
                return Some(pnode);
            }
            unsafe { node_version(pnode) }.unlock();
        }
    }

    /// Unlink the emptied leaf from its sibling chain and collapse
    /// up-tree. The leaf lock is consumed. Returns true when an entire
    /// layer died and the upper layer needs a cleanup.
    fn delete_leaf(&self, node: NodePtr, skey: u64) -> bool {
        let leaf = unsafe { as_leaf(node) };
        debug_assert!(leaf.version.is_locked());
        debug_assert!(!leaf.version.has(version::DIRTY));

        // The top level leaf is merely kept empty.
        if self.load_root() == node {
            debug_assert!(unsafe { parent_of(node) }.is_null());
            leaf.version.unlock();
            return false;
        }

        // Lock the next leaf, then flag this one deleted; readers will
        // fail and retry from the top from here on.
        let mut next;
        loop {
            next = leaf.next.load(Acquire);
            if next.is_null() {
                break;
            }
            unsafe { &*next }.version.lock();
            if !unsafe { &*next }.version.has(version::DELETED) {
                break;
            }
            // Race: our 'next' pointer is about to be updated.
            unsafe { &*next }.version.unlock();
        }
        leaf.version.set(version::DELETED);
        fence(SeqCst);

        // Take a stable version of the previous leaf and compare-and-
        // swap its 'next' over this node; a changed version or a failed
        // swap means the neighbourhood moved, retry.
        loop {
            let prev = leaf.prev.load(Acquire);
            if prev.is_null() {
                break;
            }
            let prevl = unsafe { &*prev };
            let pv = prevl.version.stable();
            let ok = prevl.next.load(Acquire) == next
                || prevl
                    .next
                    .compare_exchange(node as *mut Leaf, next, SeqCst, SeqCst)
                    .is_ok();
            if ok && (prevl.version.get() ^ pv) <= version::LOCKED {
                break;
            }
        }
        if !next.is_null() {
            unsafe { &*next }.prev.store(leaf.prev.load(Relaxed), Release);
            unsafe { &*next }.version.unlock();
        }

        self.collapse(node, skey)
    }

    /// Collapse the intermediate nodes above a deleted node. Returns
    /// true when the upper layer needs a cleanup, that is an entire
    /// layer died.
    fn collapse(&self, node: NodePtr, skey: u64) -> bool {
        debug_assert!(unsafe { node_version(node) }.has(version::DELETED));
        debug_assert!(self.load_root() != node);
        let mut node = node;

        // No parent: the node roots a non-top layer. Flag the layer
        // dismantled; the upper layer strips its entry on the next
        // descent.
        let parent = match self.lock_parent(node) {
            None => {
                let v = unsafe { node_version(node) }.get();
                unsafe { node_version(node) }
                    .replace((v & !version::DELETED) | version::DE_LAYER);
                self.unlock_gc(node);
                return true;
            }
            Some(parent) => parent,
        };
        self.unlock_gc(node);

        // Fail the readers by pretending an insertion, then remove the
        // dead child's separator.
        debug_assert!(!unsafe { node_version(parent) }.has(version::DELETED));
        unsafe { node_version(parent) }.set(version::INSERTING);
        fence(SeqCst);

        let child = match unsafe { as_inode(parent) }.remove(skey) {
            None => {
                unsafe { node_version(parent) }.unlock();
                return false;
            }
            Some(child) => child,
        };
        debug_assert!(child != node);

        // It was the last separator: rotate the tree, deleting the
        // internode and handing its surviving child to the level above.
        unsafe { node_version(parent) }.set(version::DELETED);
        node = parent;

        if let Some(gparent) = self.lock_parent(node) {
            let pnode = unsafe { as_inode(gparent) };
            let nkeys = pnode.nkeys();
            let mut i = 0;
            while i < nkeys {
                if skey < pnode.slice_at(i) {
                    break;
                }
                i += 1;
            }
            debug_assert!(pnode.child_at(i) == node);
            pnode.set_child(i, child);
            unsafe { set_parent(child, gparent as *mut Inode) };
            self.unlock_gc(node);

            unsafe { node_version(gparent) }.unlock();
            return false;
        }

        // No grandparent: the surviving child becomes the layer root.
        // The deleted internode keeps redirecting stranded readers: its
        // parent pointer is aimed at the child so walk-to-root passes
        // through.
        let v = unsafe { node_version(node) }.get();
        unsafe { node_version(node) }.replace((v & !version::IS_ROOT) | version::DELETED);
        unsafe { set_parent(node, child as *mut Inode) };
        let toproot = self
            .root
            .compare_exchange(node, child, SeqCst, SeqCst)
            .is_ok();
        fence(SeqCst);
        unsafe { set_parent(child, ptr::null_mut()) };
        self.unlock_gc(node);

        // A dead non-top layer tells the caller to clean the layer
        // above.
        !toproot
    }
}

/// Walk the parent chain up to the current root of the layer.
unsafe fn walk_to_root(node: NodePtr) -> NodePtr {
    let mut node = node;
    loop {
        let parent = parent_of(node);
        if parent.is_null() {
            break node;
        }
        node = parent as NodePtr;
    }
}

/// Structural allocations beyond the first cannot be unwound; treat
/// exhaustion mid-split the way the standard library treats it.
fn grow_failed() -> ! {
    std::alloc::handle_alloc_error(std::alloc::Layout::new::<Inode>())
}

/// Opaque handle over a detached retirement list, returned by
/// [Index::gc_prepare]. Dropping the handle without running
/// [Index::gc_run] leaks the staged nodes.
pub struct GcList {
    head: NodePtr,
}

// The staged nodes are unreachable from the index; the handle is the
// only way in.
unsafe impl Send for GcList {}

impl GcList {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        // Drop has exclusive access, the quiescence argument is the
        // borrow checker's.
        let root = self.root.swap(ptr::null_mut(), Relaxed);
        if !root.is_null() {
            if let Ok(stats) = unsafe { node_version(root) }.to_stats() {
                debug!(target: "mast", "root version {}", stats);
            }
            unsafe { self.drop_subtree(root) };
        }
        let list = self.gc_prepare();
        unsafe { self.gc_run(list) };
        debug!(target: "mast", "dropped index");
    }
}

impl Index {
    unsafe fn drop_subtree(&self, node: NodePtr) {
        if (*node).has(version::IS_BORDER) {
            let lf = as_leaf(node);
            let perm = lf.permutation();
            for i in 0..perm_nkeys(perm) {
                let idx = perm_keyidx(perm, i);
                if key_type(lf.kinfo_at(idx)) == KT_LAYER {
                    self.drop_subtree(lf.value_at(idx) as usize as NodePtr);
                }
            }
        } else {
            let inode = as_inode(node);
            for i in 0..=inode.nkeys() {
                self.drop_subtree(inode.child_at(i));
            }
        }
        free_node(&*self.alloc, node);
    }
}

/// Statistics for an [Index], counted by [Index::validate].
#[derive(Clone, Default, Debug)]
pub struct Stats {
    /// Number of layers, that is B+ trees, in the trie.
    pub n_layers: usize,
    /// Number of leaf nodes across all layers.
    pub n_leafs: usize,
    /// Number of interior nodes across all layers.
    pub n_inodes: usize,
    /// Number of live value entries.
    pub n_entries: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ n_layers = {}, n_leafs = {}, ",
                "n_inodes = {}, n_entries = {} }}",
            ),
            self.n_layers, self.n_leafs, self.n_inodes, self.n_entries,
        )
    }
}

// Validation.
impl Index {
    /// Audit the whole trie against its structural invariants:
    ///
    /// * Within a leaf, entries are unique and sorted by (slice, length);
    ///   the removed bitmap never overlaps a live slot.
    /// * Within an interior node, separators strictly ascend and every
    ///   child's slices fall between its bounding separators.
    /// * Every child's parent pointer aims back at its parent.
    /// * The sibling chain visits exactly the leaves reachable by
    ///   descent, in order, with consistent back links.
    ///
    /// Callers must be quiescent: no concurrent writers.
    pub fn validate(&self) -> Result<Stats> {
        let mut stats = Stats::default();
        unsafe { self.validate_layer(self.load_root(), 0, &mut stats)? };
        Ok(stats)
    }

    unsafe fn validate_layer(
        &self,
        root: NodePtr,
        depth: usize,
        stats: &mut Stats,
    ) -> Result<()> {
        if depth >= MAX_HEIGHT {
            return err_at!(Invalid, msg: "trie depth exceeds {}", MAX_HEIGHT);
        }
        stats.n_layers += 1;

        let mut leaves: Vec<*mut Leaf> = vec![];
        self.validate_node(root, depth, None, None, &mut leaves, stats)?;

        // No orphans: the sibling chain from the leftmost leaf is
        // exactly the in-order leaf sequence of the descent.
        let mut chain = leaves[0];
        for (i, leaf) in leaves.iter().enumerate() {
            if chain != *leaf {
                return err_at!(Invalid, msg: "sibling chain diverges at leaf {}", i);
            }
            let next = (*chain).next.load(Relaxed);
            if !next.is_null() && (*next).prev.load(Relaxed) != chain {
                return err_at!(Invalid, msg: "broken back link at leaf {}", i);
            }
            chain = next;
        }
        if !chain.is_null() {
            return err_at!(Invalid, msg: "sibling chain runs past the last leaf");
        }
        Ok(())
    }

    unsafe fn validate_node(
        &self,
        node: NodePtr,
        depth: usize,
        lo: Option<u64>,
        hi: Option<u64>,
        leaves: &mut Vec<*mut Leaf>,
        stats: &mut Stats,
    ) -> Result<()> {
        if node.is_null() {
            return err_at!(Invalid, msg: "null child pointer");
        }
        let v = node_version(node).get();
        if (v & version::DELETED) != 0 {
            return err_at!(Invalid, msg: "deleted node reachable from the root");
        }

        if (v & version::IS_BORDER) != 0 {
            let lf = as_leaf(node);
            stats.n_leafs += 1;

            let perm = lf.permutation();
            let nkeys = perm_nkeys(perm);
            let mut live: u16 = 0;
            let mut prev: Option<(u64, u8)> = None;

            for i in 0..nkeys {
                let idx = perm_keyidx(perm, i);
                live |= 1 << idx;
                let slice = lf.slice_at(idx);
                let kinfo = lf.kinfo_at(idx);
                let entry = (slice, key_llen(kinfo));

                if let Some(prev) = prev {
                    if entry <= prev {
                        return err_at!(Invalid, msg: "leaf disorder at position {}", i);
                    }
                }
                prev = Some(entry);

                if let Some(lo) = lo {
                    if slice < lo {
                        return err_at!(Invalid, msg: "leaf slice below separator");
                    }
                }
                if let Some(hi) = hi {
                    if slice >= hi {
                        return err_at!(Invalid, msg: "leaf slice above separator");
                    }
                }

                match key_type(kinfo) {
                    KT_VALUE => stats.n_entries += 1,
                    KT_LAYER => {
                        let sub = lf.value_at(idx) as usize as NodePtr;
                        self.validate_layer(sub, depth + 1, stats)?;
                    }
                    _ => return err_at!(Invalid, msg: "unstable entry at rest"),
                }
            }

            if (live & lf.removed_bits()) != 0 {
                return err_at!(Invalid, msg: "removed bitmap overlaps live slots");
            }
            leaves.push(node as *mut Leaf);
            return Ok(());
        }

        let inode = as_inode(node);
        stats.n_inodes += 1;

        let nkeys = inode.nkeys();
        if nkeys == 0 {
            return err_at!(Invalid, msg: "empty interior node");
        }
        for i in 1..nkeys {
            if inode.slice_at(i - 1) >= inode.slice_at(i) {
                return err_at!(Invalid, msg: "separator disorder at {}", i);
            }
        }

        for i in 0..=nkeys {
            let child = inode.child_at(i);
            if child.is_null() {
                return err_at!(Invalid, msg: "null child at {}", i);
            }
            if parent_of(child) != (node as *mut Inode) {
                return err_at!(Invalid, msg: "child {} disowns its parent", i);
            }
            let clo = if i == 0 { lo } else { Some(inode.slice_at(i - 1)) };
            let chi = if i == nkeys { hi } else { Some(inode.slice_at(i)) };
            self.validate_node(child, depth, clo, chi, leaves, stats)?;
        }
        Ok(())
    }
}

/// Iterator over `(key, value)` pairs in key order, from
/// [Index::iter_from].
pub struct Iter<'a> {
    index: &'a Index,
    from: Vec<u8>,
    inclusive: bool,
    batch: std::vec::IntoIter<(Vec<u8>, u64)>,
    done: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Vec<u8>, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.batch.next() {
                self.from.clear();
                self.from.extend_from_slice(&entry.0);
                self.inclusive = false;
                return Some(entry);
            }
            if self.done {
                return None;
            }

            let mut scanner = Scanner {
                index: self.index,
                from: &mut self.from,
                inclusive: self.inclusive,
                out: Vec::with_capacity(ITER_BATCH),
            };
            let mut prefix = vec![];
            scanner.scan_layer(self.index.load_root(), &mut prefix);

            let out = scanner.out;
            if out.is_empty() {
                self.done = true;
                return None;
            }
            self.batch = out.into_iter();
        }
    }
}

// Batch refill for Iter: one lock-free pass from the root, re-resolving
// from the cursor whenever a leaf mutates under us.
struct Scanner<'a, 'b> {
    index: &'a Index,
    // Lower bound; advanced over every admitted entry, making retries
    // and walk-rights naturally idempotent.
    from: &'b mut Vec<u8>,
    inclusive: bool,
    out: Vec<(Vec<u8>, u64)>,
}

impl<'a, 'b> Scanner<'a, 'b> {
    fn admit(&self, key: &[u8]) -> bool {
        match key.cmp(self.from.as_slice()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.inclusive,
            std::cmp::Ordering::Less => false,
        }
    }

    // Scan one layer left-to-right from the bound, recursing into child
    // layers. Returns true once the batch is full.
    fn scan_layer(&mut self, root: NodePtr, prefix: &mut Vec<u8>) -> bool {
        let depth = prefix.len() / 8;

        'restart: loop {
            let skey = if self.from.len() > prefix.len()
                && self.from.starts_with(prefix.as_slice())
            {
                fetch_slice(self.from, depth).0
            } else {
                0
            };

            let (mut leaf, mut v) = self.index.find_leaf(root, skey);
            loop {
                if (v & version::DELETED) != 0 {
                    continue 'restart;
                }
                let lf = unsafe { &*leaf };

                // Snapshot the live entries, then re-check the version;
                // a failed check re-reads this leaf, entries that moved
                // right are picked up by the chain walk.
                let mut entries: Vec<(u64, u8, u64)> = Vec::with_capacity(NODE_MAX);
                let perm = lf.permutation();
                for i in 0..perm_nkeys(perm) {
                    let idx = perm_keyidx(perm, i);
                    entries.push((lf.slice_at(idx), lf.kinfo_at(idx), lf.value_at(idx)));
                }
                fence(SeqCst);
                if (lf.version.get() ^ v) > version::LOCKED {
                    v = lf.version.stable();
                    if (v & version::DELETED) != 0 {
                        continue 'restart;
                    }
                    continue;
                }

                for (slice, kinfo, lv) in entries {
                    match key_type(kinfo) {
                        KT_VALUE => {
                            let llen = key_llen(kinfo) as usize;
                            let mut key = prefix.clone();
                            key.extend_from_slice(&slice.to_be_bytes()[..llen]);
                            if self.admit(&key) {
                                self.from.clear();
                                self.from.extend_from_slice(&key);
                                self.inclusive = false;
                                self.out.push((key, lv));
                                if self.out.len() >= ITER_BATCH {
                                    return true;
                                }
                            }
                        }
                        KT_LAYER => {
                            let sub = lv as usize as NodePtr;
                            let bytes = slice.to_be_bytes();
                            let saved = prefix.len();
                            prefix.extend_from_slice(&bytes);
                            // Skip sublayers entirely below the bound.
                            let below = prefix.as_slice() < self.from.as_slice()
                                && !self.from.starts_with(prefix.as_slice());
                            let full = if below {
                                false
                            } else {
                                self.scan_layer(sub, prefix)
                            };
                            prefix.truncate(saved);
                            if full {
                                return true;
                            }
                        }
                        _ => {
                            debug_assert!(
                                key_type(kinfo) != KT_UNSTABLE,
                                "unstable tag published! call the programmer"
                            );
                        }
                    }
                }

                let next = lf.next.load(Acquire);
                if next.is_null() {
                    return false;
                }
                v = unsafe { &*next }.version.stable();
                leaf = next;
            }
        }
    }
}

#[cfg(test)]
#[path = "mast_test.rs"]
mod mast_test;
