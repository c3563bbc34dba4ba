// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What an attached CPU remembers about the region.
//!
//! The header is read once at attach and validated; afterwards every shared
//! object is located from this cached copy rather than by re-reading
//! offsets another CPU could have scribbled on.

use core::mem::{offset_of, size_of};

use num_traits::FromPrimitive;
use smpkt_abi::{
    pkt_stride, Anchor, CpuDesc, NotifyKind, NotifyMethod, RegionHdr, SllHead,
    SmPktError, TasKind, CPU_ATTACHED, SM_MAX_CPUS,
};

use crate::mem::{ShOff, SmMem};
use crate::pkt::Packet;
use crate::sll::Sll;

#[derive(Copy, Clone, Debug)]
pub(crate) struct Region {
    pub hdr: ShOff,
    pub max_pkt_bytes: u32,
    pub max_cpus: u16,
    pub tas: TasKind,
    pub cpu_table: ShOff,
    pub pkt_pool: ShOff,
    pub total: u32,
    /// The CPU that formatted the region and beats it, from the anchor.
    pub master: u16,
    /// Lock attempts, from the local configuration.
    pub tries: u32,
}

impl Region {
    /// Reads and checks the header at `hdr`, and the anchor fields that go
    /// with it.
    pub(crate) fn load(
        mem: &SmMem,
        hdr: ShOff,
        tries: u32,
    ) -> Result<Self, SmPktError> {
        if !mem.contains(hdr.get() as usize, size_of::<RegionHdr>()) {
            return Err(SmPktError::BadParameter);
        }
        let field = |at| mem.load(hdr.at(at));

        let max_pkt_bytes = field(offset_of!(RegionHdr, max_pkt_bytes));
        let max_cpus = u16::try_from(field(offset_of!(RegionHdr, max_cpus)))
            .ok()
            .filter(|&n| n != 0 && usize::from(n) <= SM_MAX_CPUS)
            .ok_or(SmPktError::BadParameter)?;
        let tas = TasKind::from_u32(field(offset_of!(RegionHdr, tas_kind)))
            .ok_or(SmPktError::BadParameter)?;
        let cpu_table = ShOff::new(field(offset_of!(RegionHdr, cpu_table)))
            .ok_or(SmPktError::BadParameter)?;
        let pkt_pool = ShOff::new(field(offset_of!(RegionHdr, pkt_pool)))
            .ok_or(SmPktError::BadParameter)?;
        let total = field(
            offset_of!(RegionHdr, free_list) + offset_of!(SllHead, limit),
        );
        let master = u16::try_from(
            mem.load(offset_of!(Anchor, master_cpu) as u32),
        )
        .ok()
        .filter(|&m| m < max_cpus)
        .ok_or(SmPktError::BadParameter)?;

        let region = Self {
            hdr,
            max_pkt_bytes,
            max_cpus,
            tas,
            cpu_table,
            pkt_pool,
            total,
            master,
            tries,
        };

        let table_len = usize::from(max_cpus) * size_of::<CpuDesc>();
        let pool_len = (total as usize).checked_mul(region.stride());
        let fits = mem.contains(cpu_table.get() as usize, table_len)
            && pool_len
                .is_some_and(|n| mem.contains(pkt_pool.get() as usize, n));
        if !fits || max_pkt_bytes == 0 {
            return Err(SmPktError::BadParameter);
        }
        Ok(region)
    }

    pub(crate) fn stride(&self) -> usize {
        pkt_stride(self.max_pkt_bytes)
    }

    /// This CPU's slot. `cpu` must already be in range.
    pub(crate) fn cpu_desc(&self, cpu: u16) -> ShOff {
        self.cpu_table
            .offset(usize::from(cpu) * size_of::<CpuDesc>())
    }

    pub(crate) fn free_list<'a>(&self, mem: &'a SmMem) -> Sll<'a> {
        let head = self.hdr.offset(offset_of!(RegionHdr, free_list));
        Sll::new(mem, head, self.tas, self.tries)
    }

    pub(crate) fn input_list<'a>(&self, mem: &'a SmMem, cpu: u16) -> Sll<'a> {
        let head = self.cpu_desc(cpu).offset(offset_of!(CpuDesc, input_list));
        Sll::new(mem, head, self.tas, self.tries)
    }

    pub(crate) fn cpu_attached(&self, mem: &SmMem, cpu: u16) -> bool {
        if cpu >= self.max_cpus {
            return false;
        }
        let status = self.cpu_desc(cpu).at(offset_of!(CpuDesc, status));
        mem.load_acquire(status) == CPU_ATTACHED
    }

    /// The doorbell a CPU registered, or `None` if its slot holds a kind we
    /// do not know.
    pub(crate) fn notify_method(
        &self,
        mem: &SmMem,
        cpu: u16,
    ) -> Option<NotifyMethod> {
        let desc = self.cpu_desc(cpu);
        let kind = mem.load(desc.at(offset_of!(CpuDesc, notify_kind)));
        let kind = NotifyKind::from_u32(kind)?;
        let args_at = offset_of!(CpuDesc, notify_args);
        let mut args = [0; 3];
        for (i, a) in args.iter_mut().enumerate() {
            *a = mem.load(desc.at(args_at + i * size_of::<u32>()));
        }
        Some(NotifyMethod { kind, args })
    }

    /// Wraps a node taken off one of our lists.
    pub(crate) fn packet(&self, mem: &SmMem, node: ShOff) -> Packet {
        Packet::new(*mem, node, self.max_pkt_bytes)
    }

    /// Checks that `pkt` is a packet slot in this region, as seen through
    /// `mem`.
    pub(crate) fn owns(&self, mem: &SmMem, pkt: &Packet) -> bool {
        pkt.mem().base() == mem.base() && self.owns_node(pkt.node())
    }

    /// Checks that `node` is the start of a packet slot.
    pub(crate) fn owns_node(&self, node: ShOff) -> bool {
        let Some(rel) = node.get().checked_sub(self.pkt_pool.get()) else {
            return false;
        };
        let rel = rel as usize;
        rel.is_multiple_of(self.stride())
            && rel / self.stride() < self.total as usize
    }
}
