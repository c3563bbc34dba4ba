// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded test-and-set locks on shared words.
//!
//! Nothing in the protocol ever waits on a lock indefinitely: we try a fixed
//! number of times and then give up with `LockTimeout`, which keeps every
//! list operation callable from contexts that cannot block. A successful
//! acquisition returns a guard, and the lock is released when the guard is
//! dropped, on every exit path.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use smpkt_abi::{SmPktError, TasKind, LOCK_TAKEN};

use crate::barrier;
use crate::mem::SmMem;

const FREE: u32 = 0;

/// Holds a shared lock until dropped.
#[must_use]
pub(crate) struct LockGuard<'a> {
    word: &'a AtomicU32,
}

/// Takes the lock word at window offset `lock`, trying at most `tries`
/// times (and at least once).
pub(crate) fn acquire(
    mem: &SmMem,
    lock: u32,
    kind: TasKind,
    tries: u32,
) -> Result<LockGuard<'_>, SmPktError> {
    let word = mem.word(lock);
    for _ in 0..tries.max(1) {
        if test_and_set(word, kind) {
            return Ok(LockGuard { word });
        }
        core::hint::spin_loop();
    }
    Err(SmPktError::LockTimeout)
}

fn test_and_set(word: &AtomicU32, kind: TasKind) -> bool {
    let taken = LOCK_TAKEN.to_be();
    match kind {
        TasKind::Hard => word
            .compare_exchange(FREE, taken, Ordering::Acquire, Ordering::Relaxed)
            .is_ok(),
        TasKind::Soft => critical_section::with(|_| {
            if word.load(Ordering::Relaxed) != FREE {
                return false;
            }
            word.store(taken, Ordering::Relaxed);
            fence(Ordering::Acquire);
            true
        }),
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Everything we wrote under the lock must be out before the lock
        // reads as free to anyone else.
        barrier::store_store_barrier();
        self.word.store(FREE, Ordering::Release);
    }
}
