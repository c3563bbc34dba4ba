// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory barriers for talking to other CPUs through shared memory.
//!
//! Two different things need ordering here. The Rust memory model needs
//! atomic fences so that the compiler (and, on the host, other threads) see
//! our shared writes in program order. The hardware needs real barrier
//! instructions, since another bus master reading the region does not
//! participate in our cache or store buffer. Each barrier below does both.
//!
//! Architectures without an entry get the atomic fence alone.

use core::sync::atomic::{compiler_fence, fence, Ordering};

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        // The M-profile parts only implement the full-system DMB, and on the
        // bigger cores it is the one that reaches other bus masters, so all
        // four barriers are the same instruction.
        #[inline(always)]
        fn dmb() {
            // Safety: DMB has no operands and no effect beyond ordering.
            unsafe {
                core::arch::asm!("dmb sy", options(nostack, preserves_flags));
            }
        }

        #[inline(always)]
        fn arch_load_load() {
            dmb();
        }

        #[inline(always)]
        fn arch_store_store() {
            dmb();
        }

        #[inline(always)]
        fn arch_store_load() {
            dmb();
        }
    } else if #[cfg(target_arch = "x86_64")] {
        // x86 only reorders stores after later loads; see Doug Lea's JMM
        // cookbook.
        #[inline(always)]
        fn arch_load_load() {}

        #[inline(always)]
        fn arch_store_store() {}

        #[inline(always)]
        fn arch_store_load() {
            // Safety: MFENCE has no operands and no effect beyond ordering.
            unsafe {
                core::arch::asm!("mfence", options(nostack, preserves_flags));
            }
        }
    } else {
        #[inline(always)]
        fn arch_load_load() {}

        #[inline(always)]
        fn arch_store_store() {}

        #[inline(always)]
        fn arch_store_load() {}
    }
}

/// Loads before the barrier complete before loads after it.
#[inline(always)]
pub fn load_load_barrier() {
    fence(Ordering::Acquire);
    arch_load_load();
    compiler_fence(Ordering::SeqCst);
}

/// Stores before the barrier become visible before stores after it.
#[inline(always)]
pub fn store_store_barrier() {
    fence(Ordering::Release);
    arch_store_store();
    compiler_fence(Ordering::SeqCst);
}

/// Stores before the barrier become visible before loads after it are
/// performed, rather than being satisfied from a store buffer.
#[inline(always)]
pub fn store_load_barrier() {
    fence(Ordering::SeqCst);
    arch_store_load();
    compiler_fence(Ordering::SeqCst);
}
