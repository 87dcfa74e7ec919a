//! Module `alloc` define the node-block allocator hook.
//!
//! The index requests blocks of exactly two sizes, one per node type, and
//! returns every block with the size it was requested with. There is no
//! size-class management here; hosts that want arena or pool behavior can
//! plug their own [Allocator] via [Index::with_alloc].
//!
//! [Index::with_alloc]: crate::Index::with_alloc

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

/// Node blocks are version-word headed structures holding 64-bit slices,
/// hence the alignment contract.
pub const NODE_ALIGN: usize = 8;

/// Supply and return fixed-size node blocks.
///
/// Blocks handed out must stay at a stable address until returned via
/// [Allocator::free]; readers hold references into them until the
/// retirement protocol completes.
pub trait Allocator: Send + Sync {
    /// Allocate a block of `size` bytes aligned to [NODE_ALIGN].
    /// Return a null pointer when memory is exhausted.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Return a block obtained from [Allocator::alloc]. `size` shall match
    /// the size the block was allocated with.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator's `alloc` with the same
    /// `size`, and must not be freed twice.
    unsafe fn free(&self, ptr: *mut u8, size: usize);
}

/// Default allocator, mapping straight onto the process heap.
pub struct SysAlloc;

impl Allocator for SysAlloc {
    fn alloc(&self, size: usize) -> *mut u8 {
        match Layout::from_size_align(size, NODE_ALIGN) {
            Ok(layout) => unsafe { alloc(layout) },
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut u8, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, NODE_ALIGN);
        dealloc(ptr, layout)
    }
}
