// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Master-side formatting of the region, and the heartbeat.

use core::mem::{offset_of, size_of};

use smpkt_abi::{
    round_pkt_bytes, Anchor, RegionGeometry, RegionHdr, SllHead, SmPktError,
    TasKind, ANCHOR_READY, MASTER_CPU, SHARED_ALIGN, SM_MAX_CPUS,
};
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromZeros, IntoBytes};

use crate::config::SetupConfig;
use crate::mem::{ShOff, SmMem};
use crate::sll::Sll;
use crate::Platform;

const READY: u32 = offset_of!(Anchor, ready) as u32;
const HEARTBEAT: u32 = offset_of!(Anchor, heartbeat) as u32;
const PKT_REGION: u32 = offset_of!(Anchor, pkt_region) as u32;
const MASTER: u32 = offset_of!(Anchor, master_cpu) as u32;

/// Formats `size` bytes at `region` as a packet region and publishes it in
/// the anchor at the base of `mem`.
///
/// Only the master calls this, once, before anyone attaches. The region
/// must lie inside the window, after the anchor. On failure the anchor is
/// left not-ready, so nobody can attach to a half-built region.
pub fn setup<P: Platform>(
    mem: &SmMem,
    platform: &P,
    region: *mut u8,
    size: usize,
    cfg: &SetupConfig,
) -> Result<(), SmPktError> {
    let max_cpus = usize::from(cfg.max_cpus);
    if max_cpus == 0 || max_cpus > SM_MAX_CPUS || cfg.max_pkt_bytes == 0 {
        return Err(SmPktError::BadParameter);
    }
    let max_pkt_bytes =
        round_pkt_bytes(cfg.max_pkt_bytes).ok_or(SmPktError::BadParameter)?;
    let start = mem.offset_of(region).ok_or(SmPktError::BadParameter)?;
    if start < size_of::<Anchor>()
        || !start.is_multiple_of(SHARED_ALIGN)
        || !mem.contains(start, size)
    {
        return Err(SmPktError::BadParameter);
    }
    let hdr = ShOff::from_usize(start).ok_or(SmPktError::BadParameter)?;

    mem.store(READY, 0);
    mem.store(PKT_REGION, 0);
    mem.flush(READY);

    let geom = RegionGeometry::compute(size, max_cpus, max_pkt_bytes)
        .ok_or(SmPktError::RegionTooSmall)?;
    if !platform.probe(mem, start, size) {
        return Err(SmPktError::RegionNotAccessible);
    }
    mem.zero(start, size);

    let header = RegionHdr {
        max_pkt_bytes: U32::new(max_pkt_bytes),
        max_cpus: U32::new(u32::from(cfg.max_cpus)),
        tas_kind: U32::new(cfg.tas as u32),
        cpu_table: U32::new(hdr.offset(geom.cpu_table).get()),
        pkt_pool: U32::new(hdr.offset(geom.pkt_pool).get()),
        free_list: SllHead::new_zeroed(),
    };
    mem.copy_in(start, header.as_bytes());

    // Nobody else can be looking yet, so the always-available soft lock
    // will do, and it will never be contended.
    let free = Sll::new(
        mem,
        hdr.offset(offset_of!(RegionHdr, free_list)),
        TasKind::Soft,
        1,
    );
    for i in 0..geom.pkt_count {
        free.grow_and_put(hdr.offset(geom.pkt_pool + i * geom.stride))?;
    }

    mem.store(MASTER, u32::from(MASTER_CPU));
    mem.store(PKT_REGION, hdr.get());
    mem.flush(PKT_REGION);
    mem.store_release(READY, ANCHOR_READY);
    mem.flush(READY);
    Ok(())
}

/// Advances the heartbeat. The master calls this from a periodic timer;
/// attaching CPUs wait to see it move.
pub fn beat(mem: &SmMem) {
    let beat = mem.load(HEARTBEAT);
    mem.store(HEARTBEAT, beat.wrapping_add(1));
    mem.flush(HEARTBEAT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::tests::window;
    use crate::NotifyFailed;
    use smpkt_abi::{pkt_stride, NotifyMethod};

    struct Bare {
        accessible: bool,
    }

    impl Platform for Bare {
        fn notify(&self, _: u16, _: &NotifyMethod) -> Result<(), NotifyFailed> {
            Ok(())
        }

        fn delay(&self, _: u32) {}

        fn probe(&self, mem: &SmMem, off: usize, len: usize) -> bool {
            self.accessible && mem.contains(off, len)
        }
    }

    const OK: Bare = Bare { accessible: true };

    fn cfg(max_cpus: u16, max_pkt_bytes: u32) -> SetupConfig {
        SetupConfig {
            max_cpus,
            max_pkt_bytes,
            tas: TasKind::Hard,
        }
    }

    fn region(mem: &SmMem, off: usize) -> *mut u8 {
        mem.base().as_ptr().wrapping_add(off)
    }

    #[test]
    fn formats_and_publishes() {
        let mem = window(0x4000);
        setup(&mem, &OK, region(&mem, 0x40), 0x4000 - 0x40, &cfg(2, 100))
            .unwrap();

        assert_eq!(mem.load(READY), ANCHOR_READY);
        assert_eq!(mem.load(PKT_REGION), 0x40);

        let rounded = round_pkt_bytes(100).unwrap();
        assert_eq!(mem.load(0x40), rounded);
        let g = RegionGeometry::compute(0x4000 - 0x40, 2, rounded).unwrap();
        let limit = 0x40 + (offset_of!(RegionHdr, free_list)
            + offset_of!(SllHead, limit)) as u32;
        let count = limit - 4;
        assert_eq!(mem.load(limit), g.pkt_count as u32);
        assert_eq!(mem.load(count), g.pkt_count as u32);

        // First packet at the head, last at the tail.
        let head = count - 8;
        let tail = count - 4;
        let pool = 0x40 + g.pkt_pool as u32;
        assert_eq!(mem.load(head), pool);
        assert_eq!(
            mem.load(tail) as usize,
            pool as usize + (g.pkt_count - 1) * pkt_stride(rounded)
        );
    }

    #[test]
    fn rejects_bad_parameters() {
        let mem = window(0x1000);
        let r = region(&mem, 0x40);
        for c in [cfg(0, 64), cfg(65, 64), cfg(2, 0)] {
            assert_eq!(
                setup(&mem, &OK, r, 0x800, &c),
                Err(SmPktError::BadParameter)
            );
        }
        // Overlapping the anchor, past the window, and misaligned.
        for (at, size) in [(0, 0x800), (0x40, 0x1000), (0x42, 0x800)] {
            assert_eq!(
                setup(&mem, &OK, region(&mem, at), size, &cfg(2, 64)),
                Err(SmPktError::BadParameter)
            );
        }
        assert_ne!(mem.load(READY), ANCHOR_READY);
    }

    #[test]
    fn too_small_and_inaccessible() {
        let mem = window(0x1000);
        let r = region(&mem, 0x40);
        assert_eq!(
            setup(&mem, &OK, r, 200, &cfg(2, 64)),
            Err(SmPktError::RegionTooSmall)
        );
        assert_eq!(
            setup(&mem, &Bare { accessible: false }, r, 0x800, &cfg(2, 64)),
            Err(SmPktError::RegionNotAccessible)
        );
        assert_ne!(mem.load(READY), ANCHOR_READY);
    }

    #[test]
    fn reformat_clears_ready_first() {
        let mem = window(0x1000);
        let r = region(&mem, 0x40);
        setup(&mem, &OK, r, 0x800, &cfg(2, 64)).unwrap();
        assert_eq!(
            setup(&mem, &OK, r, 100, &cfg(2, 64)),
            Err(SmPktError::RegionTooSmall)
        );
        assert_eq!(mem.load(READY), 0);
        assert_eq!(mem.load(PKT_REGION), 0);
    }

    #[test]
    fn default_memory_check_round_trips() {
        struct Plain;
        impl Platform for Plain {
            fn notify(
                &self,
                _: u16,
                _: &NotifyMethod,
            ) -> Result<(), NotifyFailed> {
                Ok(())
            }
            fn delay(&self, _: u32) {}
        }

        let mem = window(0x100);
        assert!(Plain.probe(&mem, 0x40, 0xc0));
        assert!(!Plain.probe(&mem, 0x40, 0xc4));
        assert!(!Plain.probe(&mem, 0x40, 2));
        assert_eq!(mem.load(0x40), 0);
    }

    #[test]
    fn beat_advances() {
        let mem = window(0x40);
        mem.store(HEARTBEAT, u32::MAX);
        beat(&mem);
        assert_eq!(mem.load(HEARTBEAT), 0);
        beat(&mem);
        assert_eq!(mem.load(HEARTBEAT), 1);
    }
}
