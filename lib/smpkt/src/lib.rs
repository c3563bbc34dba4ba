// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet exchange between CPUs through shared memory.
//!
//! A set of CPUs on a common bus share a window of memory. One of them, the
//! master, formats a packet region in that window with [`setup`] and keeps
//! it alive by calling [`beat`] periodically. Every CPU, the master
//! included, then builds a local [`SmPktDesc`] and attaches it. After that
//! the steady state is
//!
//! - sender: [`SmPktDesc::free_get`], fill in the packet, [`SmPktDesc::send`]
//! - receiver: [`SmPktDesc::recv`], consume, [`SmPktDesc::free_put`]
//!
//! Every packet lives in the region for its whole life and circulates
//! between the global free list and the per-CPU input queues. Each queue
//! has its own lock and a depth limit, and a sender rings the destination's
//! doorbell only when its queue goes from empty to non-empty.
//!
//! Nothing here blocks. Locks are taken with a bounded number of attempts,
//! and the only long-running operation is [`SmPktDesc::attach`], which polls
//! the master's heartbeat for a bounded time.
//!
//! The things the protocol needs from the system (doorbells, delays, and a
//! memory probe) come from a [`Platform`].

#![cfg_attr(not(test), no_std)]

mod attach;
mod barrier;
mod config;
mod info;
mod mem;
mod pkt;
mod region;
mod setup;
mod sll;
mod tas;
mod trace;

pub use smpkt_abi::{
    NotifyKind, NotifyMethod, SmPktError, TasKind, DEFAULT_MAX_INPUT_PKTS,
    MASTER_CPU, SM_MAX_CPUS,
};

pub use crate::config::{PktConfig, SetupConfig};
pub use crate::info::{CpuInfo, CpuSel, CpuSet, RegionInfo};
pub use crate::mem::SmMem;
pub use crate::pkt::{Dest, Packet, PktError};
pub use crate::setup::{beat, setup};
pub use crate::trace::{Trace, TraceEntry, TraceRing};

use crate::mem::ShOff;
use crate::region::Region;

/// Number of events each descriptor remembers.
pub const TRACE_DEPTH: usize = 32;

/// A doorbell could not be rung.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotifyFailed;

/// Services the protocol needs from the system it runs on.
pub trait Platform {
    /// Wakes `cpu` using the method it registered at attach.
    fn notify(&self, cpu: u16, method: &NotifyMethod)
        -> Result<(), NotifyFailed>;

    /// Waits roughly `ticks` scheduler ticks.
    fn delay(&self, ticks: u32);

    /// Checks that `len` bytes at window offset `off` can be read and
    /// written.
    ///
    /// The default writes a pattern to the first and last word of the range
    /// and reads it back. Platforms that can catch bus errors should
    /// override this.
    fn probe(&self, mem: &SmMem, off: usize, len: usize) -> bool {
        const PATTERN: u32 = 0xa55a_5aa5;

        let word = core::mem::size_of::<u32>();
        if len < word || !mem.contains(off, len) {
            return false;
        }
        let last = (off + len - word) & !(word - 1);
        [off, last].into_iter().all(|at| {
            let at = at as u32;
            mem.store(at, PATTERN);
            mem.flush(at);
            let ok = mem.load(at) == PATTERN;
            mem.store(at, 0);
            ok
        })
    }
}

/// One CPU's handle on the packet region.
///
/// This lives in the CPU's private memory and is never shared. It holds
/// the local configuration, the region layout resolved at attach, and a
/// trace of recent events.
pub struct SmPktDesc<P: Platform> {
    mem: SmMem,
    platform: P,
    cfg: PktConfig,
    region: Option<Region>,
    /// A packet that could not be put back on the free list because its
    /// lock timed out. It goes back before our next free-list operation.
    stray: Option<ShOff>,
    trace: TraceRing<Trace, TRACE_DEPTH>,
}

impl<P: Platform> SmPktDesc<P> {
    pub fn cpu(&self) -> u16 {
        self.cfg.cpu
    }

    pub fn config(&self) -> &PktConfig {
        &self.cfg
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    /// Recent protocol events, for debugging.
    pub fn trace(&self) -> &TraceRing<Trace, TRACE_DEPTH> {
        &self.trace
    }
}
