// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Region and CPU status, and their console rendering.
//!
//! These are unlocked snapshots: counts can be stale by the time the caller
//! looks at them, which is fine for a status display.

use core::fmt;

use smpkt_abi::{NotifyKind, NotifyMethod, SmPktError};

use crate::{Platform, SmPktDesc};

/// A set of CPU numbers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    /// Adds `cpu`, which must be below `SM_MAX_CPUS`.
    pub fn insert(&mut self, cpu: u16) {
        self.0 |= 1 << cpu;
    }

    pub fn contains(&self, cpu: u16) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        let bits = self.0;
        (0..64u16).filter(move |&c| bits & (1 << c) != 0)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cpu) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{cpu}")?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionInfo {
    pub max_pkt_bytes: u32,
    pub max_cpus: u16,
    /// CPU that formatted the region and keeps its heartbeat.
    pub master: u16,
    /// Packets the region was formatted with.
    pub total_pkts: u32,
    /// Packets on the free list right now.
    pub free_pkts: u32,
    pub attached: CpuSet,
}

impl RegionInfo {
    pub fn attached_cpus(&self) -> u32 {
        self.attached.len()
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "master CPU:       {:>6}", self.master)?;
        writeln!(f, "max packet bytes: {:>6}", self.max_pkt_bytes)?;
        writeln!(f, "total packets:    {:>6}", self.total_pkts)?;
        writeln!(f, "free packets:     {:>6}", self.free_pkts)?;
        write!(
            f,
            "attached CPUs:    {:>6} of {} [{}]",
            self.attached_cpus(),
            self.max_cpus,
            self.attached
        )
    }
}

/// Which CPU to ask about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuSel {
    /// The CPU this descriptor belongs to.
    This,
    Cpu(u16),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CpuInfo {
    pub cpu: u16,
    pub attached: bool,
    /// Packets waiting in the input queue.
    pub depth: u32,
    /// Input queue limit.
    pub limit: u32,
    /// Doorbell the CPU registered, if its slot holds one we understand.
    pub notify: Option<NotifyMethod>,
}

impl fmt::Display for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.attached { "attached" } else { "detached" };
        write!(
            f,
            "{:>3} {:<8} {:>5}/{:<5} ",
            self.cpu, state, self.depth, self.limit
        )?;
        match self.notify {
            None => f.write_str("?"),
            Some(n) if n.kind == NotifyKind::None => f.write_str("polled"),
            Some(n) => write!(
                f,
                "{:?} {:#x} {:#x} {:#x}",
                n.kind, n.args[0], n.args[1], n.args[2]
            ),
        }
    }
}

impl<P: Platform> SmPktDesc<P> {
    pub fn region_info(&self) -> Result<RegionInfo, SmPktError> {
        let region = self.region.ok_or(SmPktError::NotAttached)?;
        let mut attached = CpuSet::EMPTY;
        for cpu in 0..region.max_cpus {
            if region.cpu_attached(&self.mem, cpu) {
                attached.insert(cpu);
            }
        }
        Ok(RegionInfo {
            max_pkt_bytes: region.max_pkt_bytes,
            max_cpus: region.max_cpus,
            master: region.master,
            total_pkts: region.total,
            free_pkts: region.free_list(&self.mem).count(),
            attached,
        })
    }

    pub fn cpu_info(&self, sel: CpuSel) -> Result<CpuInfo, SmPktError> {
        let region = self.region.ok_or(SmPktError::NotAttached)?;
        let cpu = match sel {
            CpuSel::This => self.cfg.cpu,
            CpuSel::Cpu(n) => n,
        };
        if cpu >= region.max_cpus {
            return Err(SmPktError::InvalidCpuNumber);
        }
        let input = region.input_list(&self.mem, cpu);
        Ok(CpuInfo {
            cpu,
            attached: region.cpu_attached(&self.mem, cpu),
            depth: input.count(),
            limit: input.limit(),
            notify: region.notify_method(&self.mem, cpu),
        })
    }
}
