//! Module `version` implement the per-node version word, useful for
//! non-blocking concurrency.
//!
//! The version word is a single 32-bit, single-writer multi-reader
//! synchronisation variable. Writers treat bit-0 as an exclusive
//! spin-lock; every other mutation of the node happens between a
//! lock-set and an unlock-clear. Readers never store into the word;
//! they capture a _stable_ snapshot, do their reads, and compare the
//! word again to detect interference. Think of seqlocks.
//!
//! Layout:
//!
//! * bit 0, `LOCKED` exclusive writer lock.
//! * bit 1, `INSERTING` entries are changing, readers must retry.
//! * bit 2, `SPLITTING` tree shape is changing, readers must retry.
//! * bit 3, `DELETED` node is unlinked from its tree.
//! * bit 4, `IS_ROOT` node is the current root of its layer.
//! * bit 5, `IS_BORDER` node is a leaf.
//! * bits 6-12, `V_INSERT` 7-bit insert counter.
//! * bits 13-30, `V_SPLIT` 18-bit split counter.
//! * bit 31, `DE_LAYER` the layer rooted at this node was dismantled.
//!
//! Insert and split counter bit fields are adjacent such that the
//! inserts may overflow into the split. That is, 7 + 18 bits in total,
//! thus making 2^25 the real overflow.
//!
//! The `debug` feature compiles in per-node lock acquisition and
//! conflict counters, surfaced through [Version::to_stats]; without the
//! feature the word stays a bare 32-bit cell and the stats read zero.

use std::hint;
use std::sync::atomic::{
    fence, AtomicU32,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use std::{fmt, result};

use crate::Result;

pub(crate) const LOCKED: u32 = 1 << 0;
pub(crate) const INSERTING: u32 = 1 << 1;
pub(crate) const SPLITTING: u32 = 1 << 2;
pub(crate) const DELETED: u32 = 1 << 3;
pub(crate) const IS_ROOT: u32 = 1 << 4;
pub(crate) const IS_BORDER: u32 = 1 << 5;
pub(crate) const DE_LAYER: u32 = 1 << 31;

pub(crate) const DIRTY: u32 = INSERTING | SPLITTING;

pub(crate) const V_INSERT: u32 = 0x0000_1fc0; // insert counter, bits 6-12
pub(crate) const V_INSERT_SHIFT: u32 = 6;
pub(crate) const V_SPLIT: u32 = 0x7fff_e000; // split counter, bits 13-30
pub(crate) const V_SPLIT_SHIFT: u32 = 13;

const BACKOFF_MIN: u32 = 4;
const BACKOFF_MAX: u32 = 128;

/// Exponential back-off for the spinning paths.
pub(crate) struct Backoff {
    count: u32,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff { count: BACKOFF_MIN }
    }

    pub(crate) fn spin(&mut self) {
        for _ in 0..self.count {
            hint::spin_loop();
        }
        if self.count < BACKOFF_MAX {
            self.count += self.count;
        }
    }
}

/// Version word heading every node. All nodes embed this as their first
/// field, so a type-erased node pointer can be probed for `IS_BORDER`
/// before casting.
#[repr(C)]
pub(crate) struct Version {
    word: AtomicU32,
    #[cfg(feature = "debug")]
    locks: AtomicU32,
    #[cfg(feature = "debug")]
    conflicts: AtomicU32,
}

impl Version {
    #[cfg(test)]
    pub(crate) fn new(value: u32) -> Version {
        Version {
            word: AtomicU32::new(value),
            #[cfg(feature = "debug")]
            locks: AtomicU32::new(0),
            #[cfg(feature = "debug")]
            conflicts: AtomicU32::new(0),
        }
    }

    /// Pre-publication store, before the node is visible to any other
    /// thread.
    pub(crate) fn init(&self, value: u32) {
        self.word.store(value, Relaxed)
    }

    #[inline]
    pub(crate) fn get(&self) -> u32 {
        self.word.load(Acquire)
    }

    #[inline]
    pub(crate) fn has(&self, bits: u32) -> bool {
        (self.word.load(Acquire) & bits) != 0
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.has(LOCKED)
    }

    /// Fold `bits` into the word. Callers either hold the lock or own a
    /// node that is not yet published.
    pub(crate) fn set(&self, bits: u32) {
        self.word.fetch_or(bits, Relaxed);
    }

    /// Replace the full word. Only the lock holder shall call this.
    pub(crate) fn replace(&self, value: u32) {
        debug_assert!(self.is_locked());
        self.word.store(value, Release)
    }

    /// Capture a snapshot of the version when neither insertion nor
    /// split is happening, in other words when the node is not dirty.
    /// Callers use the snapshot to detect interference and retry.
    pub(crate) fn stable(&self) -> u32 {
        let mut bo = Backoff::new();
        let mut v = self.word.load(Acquire);
        while (v & DIRTY) != 0 {
            bo.spin();
            v = self.word.load(Acquire);
        }
        fence(SeqCst);
        v
    }

    /// Acquire the exclusive writer lock, spinning with back-off.
    pub(crate) fn lock(&self) {
        let mut bo = Backoff::new();
        loop {
            let v = self.word.load(Relaxed);
            if (v & LOCKED) != 0 {
                #[cfg(feature = "debug")]
                self.conflicts.fetch_add(1, SeqCst);
                bo.spin();
                continue;
            }
            if self
                .word
                .compare_exchange_weak(v, v | LOCKED, SeqCst, Relaxed)
                .is_ok()
            {
                break;
            }
            #[cfg(feature = "debug")]
            self.conflicts.fetch_add(1, SeqCst);
        }
        #[cfg(feature = "debug")]
        self.locks.fetch_add(1, SeqCst);
        fence(SeqCst);
    }

    /// Release the lock, folding the dirty flags into the counters:
    ///
    /// * `INSERTING` increments `V_INSERT`, overflowing into `V_SPLIT`.
    /// * `SPLITTING` increments `V_SPLIT` and clears `IS_ROOT`, the node
    ///   has a parent now.
    pub(crate) fn unlock(&self) {
        let mut v = self.word.load(Relaxed);
        debug_assert!((v & LOCKED) != 0, "unlock without lock! call the programmer");

        if (v & INSERTING) != 0 {
            let c = (v & V_INSERT) + (1 << V_INSERT_SHIFT);
            v = (v & !V_INSERT) | c;
        }
        if (v & SPLITTING) != 0 {
            let c = (v & V_SPLIT) + (1 << V_SPLIT_SHIFT);
            v = ((v & !IS_ROOT) & !V_SPLIT) | (c & V_SPLIT);
        }
        v &= !(LOCKED | INSERTING | SPLITTING);

        fence(SeqCst);
        self.word.store(v, Release);
    }

    pub(crate) fn to_stats(&self) -> Result<Stats> {
        let (locks, conflicts) = self.counters()?;
        Ok(Stats {
            version: self.word.load(SeqCst),
            locks,
            conflicts,
        })
    }

    #[cfg(feature = "debug")]
    fn counters(&self) -> Result<(usize, usize)> {
        use std::convert::TryFrom;

        use crate::Error;

        let locks = err_at!(FailConvert, usize::try_from(self.locks.load(SeqCst)))?;
        let conflicts = err_at!(FailConvert, usize::try_from(self.conflicts.load(SeqCst)))?;
        Ok((locks, conflicts))
    }

    #[cfg(not(feature = "debug"))]
    fn counters(&self) -> Result<(usize, usize)> {
        Ok((0, 0))
    }
}

/// Statistic type, to capture [Version] lock metrics. The counters are
/// live only under the `debug` feature.
#[derive(Default)]
pub(crate) struct Stats {
    /// Actual 32-bit value of the version word when
    /// [to_stats][Version::to_stats] is called.
    pub(crate) version: u32,
    /// Total number of lock acquisitions so far.
    pub(crate) locks: usize,
    /// Total number of conflicts so far, while acquiring the lock.
    pub(crate) conflicts: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ version = {:X}, locks = {}, conflicts = {} }}",
            self.version, self.locks, self.conflicts,
        )
    }
}

#[cfg(test)]
#[path = "version_test.rs"]
mod version_test;
