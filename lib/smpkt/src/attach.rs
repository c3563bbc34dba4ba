// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Joining and leaving the region.

use core::mem::offset_of;

use smpkt_abi::{Anchor, CpuDesc, SmPktError, ANCHOR_READY, CPU_ATTACHED};

use crate::barrier;
use crate::config::PktConfig;
use crate::mem::{ShOff, SmMem};
use crate::region::Region;
use crate::trace::{trace, Trace, TraceRing};
use crate::{Platform, SmPktDesc};

const READY: u32 = offset_of!(Anchor, ready) as u32;
const HEARTBEAT: u32 = offset_of!(Anchor, heartbeat) as u32;
const PKT_REGION: u32 = offset_of!(Anchor, pkt_region) as u32;

const STATUS: usize = offset_of!(CpuDesc, status);
const NOTIFY_KIND: usize = offset_of!(CpuDesc, notify_kind);
const NOTIFY_ARGS: usize = offset_of!(CpuDesc, notify_args);

impl<P: Platform> SmPktDesc<P> {
    /// Builds a detached descriptor. Touches no shared memory.
    pub fn init(mem: SmMem, platform: P, cfg: PktConfig) -> Self {
        Self {
            mem,
            platform,
            cfg: PktConfig {
                max_input_pkts: cfg.input_depth(),
                ..cfg
            },
            region: None,
            stray: None,
            trace: TraceRing::new(Trace::None),
        }
    }

    /// Waits for the region to come alive, then joins it.
    ///
    /// This is the one operation that may take a long time: it polls the
    /// heartbeat for up to the configured number of beats, failing with
    /// `Down` if the region never shows a ready anchor with a moving
    /// heartbeat.
    pub fn attach(&mut self) -> Result<(), SmPktError> {
        if self.region.is_some() {
            trace!(self.trace, Trace::AlreadyAttached);
            return Err(SmPktError::AlreadyAttached);
        }
        self.wait_alive()?;

        // Don't let the header reads below be satisfied from before we saw
        // the anchor go ready.
        barrier::load_load_barrier();
        let hdr = ShOff::new(self.mem.load(PKT_REGION))
            .ok_or(SmPktError::Down)?;
        let region = Region::load(&self.mem, hdr, self.cfg.tas_tries)?;

        let cpu = self.cfg.cpu;
        if cpu >= region.max_cpus {
            return Err(SmPktError::InvalidCpuNumber);
        }

        let desc = region.cpu_desc(cpu);
        let notify = self.cfg.notify;
        self.mem.store(desc.at(NOTIFY_KIND), notify.kind as u32);
        for (i, &arg) in notify.args.iter().enumerate() {
            self.mem.store(desc.at(NOTIFY_ARGS + i * 4), arg);
        }
        if let Err(e) = region
            .input_list(&self.mem, cpu)
            .set_limit(self.cfg.max_input_pkts)
        {
            trace!(self.trace, Trace::LockTimeout);
            return Err(e);
        }

        // Publishing the status is what lets others send to us, so the
        // registration above has to be visible first.
        self.mem.store_release(desc.at(STATUS), CPU_ATTACHED);
        self.mem.flush(desc.at(STATUS));

        self.region = Some(region);
        trace!(self.trace, Trace::Attached { cpu });
        // Anything held back at our last detach goes home now if it can;
        // otherwise the next free-list operation will try again.
        let _ = self.settle(&region);
        Ok(())
    }

    /// Leaves the region.
    ///
    /// With `drain`, every packet still queued for us goes back to the free
    /// list. Returns how many were drained.
    ///
    /// If the free list cannot be locked mid-drain, the packet in hand is
    /// held by this descriptor and returned when it next attaches; the rest
    /// stay queued. The descriptor is detached either way, except that a
    /// packet already held back from earlier must be returned first; if
    /// that fails we stay attached and report `LockTimeout`.
    pub fn detach(&mut self, drain: bool) -> Result<u32, SmPktError> {
        let region = self.region.ok_or(SmPktError::NotAttached)?;
        // Only one packet can be held back at a time.
        self.settle(&region)?;
        self.region = None;
        let cpu = self.cfg.cpu;

        let status = region.cpu_desc(cpu).at(STATUS);
        self.mem.store_release(status, 0);
        self.mem.flush(status);

        let mut drained = 0;
        if drain {
            let input = region.input_list(&self.mem, cpu);
            let free = region.free_list(&self.mem);
            loop {
                let node = match input.get() {
                    Ok(Some(node)) => node,
                    Ok(None) => break,
                    Err(e) => {
                        trace!(self.trace, Trace::LockTimeout);
                        return Err(e);
                    }
                };
                if let Err(e) = free.put(node) {
                    self.stray = Some(node);
                    trace!(self.trace, Trace::HeldBack);
                    return Err(e);
                }
                drained += 1;
            }
        }

        trace!(self.trace, Trace::Detached { drained });
        Ok(drained)
    }

    /// Polls until the anchor is ready and the heartbeat has moved.
    fn wait_alive(&mut self) -> Result<(), SmPktError> {
        let polls = self.cfg.alive_polls();
        let mut last = heartbeat(&self.mem);
        for _ in 0..polls {
            self.platform.delay(self.cfg.ticks_per_beat);
            let now = heartbeat(&self.mem);
            if let (Some(a), Some(b)) = (last, now) {
                if a != b {
                    return Ok(());
                }
            }
            last = now;
        }
        trace!(self.trace, Trace::Down { polls });
        Err(SmPktError::Down)
    }
}

/// The heartbeat, if the anchor says the region is ready.
fn heartbeat(mem: &SmMem) -> Option<u32> {
    if mem.load_acquire(READY) != ANCHOR_READY || mem.load(PKT_REGION) == 0 {
        return None;
    }
    Some(mem.load(HEARTBEAT))
}
