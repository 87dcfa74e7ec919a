//! Mast implement [Masstree], a trie of cache-aware, lock-coupled B+ trees,
//! indexing variable length byte-string keys to opaque 64-bit values.
//!
//! Keys are sliced into 64-bit chunks, big-endian, one chunk per layer of
//! the trie. Each layer is a B+ tree of fanout 16 ordered by the chunk,
//! and splits only to-the-right; under-full nodes are never merged.
//!
//! **Concurrency in a nutshell**:
//!
//! * _Readers_ walk the tree without locks, capturing stable snapshots of
//!   per-node version words and retrying when a version check fails. Think
//!   of seqlocks. A reader that collides with a split recovers by walking
//!   the sibling chain to-the-right.
//! * _Writers_ acquire a per-node spinlock carried in the same version
//!   word. Entry shuffling within a leaf is published with a single atomic
//!   store of the leaf's permutation word, or else the node is flagged
//!   dirty for the duration to fail concurrent readers.
//! * _Reclamation_ is deferred. Emptied nodes are unlinked, flagged
//!   deleted and staged on a per-index retirement list; the application
//!   frees them via [Index::gc_prepare]/[Index::gc_run] once it can
//!   guarantee quiescence.
//!
//! [Masstree]: https://pdos.csail.mit.edu/papers/masstree:eurosys12.pdf

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// err_at!(OutOfMemory, msg: "allocating leaf node")
/// ```
///
/// ```ignore
/// err_at!(FailConvert, usize::try_from(value))
/// ```
///
/// ```ignore
/// err_at!(Invalid, usize::try_from(value), "node count")
/// ```
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

mod alloc;
mod error;
mod kv;
mod mast;
mod node;
mod version;

pub use crate::alloc::{Allocator, SysAlloc};
pub use crate::error::Error;
pub use crate::kv::Kv;
pub use crate::mast::{GcList, Index, Iter, Stats, MAX_HEIGHT};

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;
