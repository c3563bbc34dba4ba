// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host harness: a leaked buffer stands in for the shared window, threads
//! or plain sequential calls stand in for CPUs.

#![allow(dead_code)]

use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use smpkt::{
    NotifyFailed, NotifyKind, NotifyMethod, PktConfig, Platform, SetupConfig,
    SmMem, SmPktDesc, TasKind,
};
use smpkt_abi::{RegionHdr, SllHead, LOCK_TAKEN};

/// Where the region starts in every test window.
pub const REGION_AT: usize = 64;

pub struct TestPlatform {
    mem: SmMem,
    doorbells: Arc<Mutex<Vec<u16>>>,
    failures: Arc<AtomicU32>,
    lock_on_doorbell: Arc<AtomicBool>,
    beating: bool,
}

impl Platform for TestPlatform {
    fn notify(&self, cpu: u16, _: &NotifyMethod) -> Result<(), NotifyFailed> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending != 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(NotifyFailed);
        }
        self.doorbells.lock().unwrap().push(cpu);
        if self.lock_on_doorbell.swap(false, Ordering::SeqCst) {
            hold_free_list(&self.mem, true);
        }
        Ok(())
    }

    /// Time only passes for the region when the master beats it; here every
    /// delay is a beat, so attach sees a live region straight away.
    fn delay(&self, _: u32) {
        if self.beating {
            smpkt::beat(&self.mem);
        }
    }
}

/// One shared window and the observable side effects of using it.
pub struct Rig {
    pub mem: SmMem,
    pub doorbells: Arc<Mutex<Vec<u16>>>,
    /// Number of upcoming doorbells that will fail.
    pub failures: Arc<AtomicU32>,
    /// When set, the next doorbell that rings leaves the free list locked,
    /// as if another CPU had grabbed it at that moment.
    pub lock_on_doorbell: Arc<AtomicBool>,
}

impl Rig {
    /// Maps a fresh window with room for a `region_size` region after the
    /// anchor.
    pub fn new(region_size: usize) -> Self {
        let len = REGION_AT + region_size;
        let words = Box::leak(vec![0u64; len.div_ceil(8)].into_boxed_slice());
        let mem = unsafe { SmMem::from_raw(words.as_mut_ptr().cast(), len) }
            .unwrap();
        Self {
            mem,
            doorbells: Arc::default(),
            failures: Arc::default(),
            lock_on_doorbell: Arc::default(),
        }
    }

    /// A window with a region already formatted.
    pub fn formatted(
        region_size: usize,
        max_cpus: u16,
        pkt_bytes: u32,
    ) -> Self {
        let rig = Self::new(region_size);
        let cfg = SetupConfig {
            max_cpus,
            max_pkt_bytes: pkt_bytes,
            tas: TasKind::Hard,
        };
        smpkt::setup(
            &rig.mem,
            &rig.platform(),
            rig.region_ptr(),
            region_size,
            &cfg,
        )
        .unwrap();
        rig
    }

    pub fn region_ptr(&self) -> *mut u8 {
        self.mem.base().as_ptr().wrapping_add(REGION_AT)
    }

    pub fn platform(&self) -> TestPlatform {
        TestPlatform {
            mem: self.mem,
            doorbells: self.doorbells.clone(),
            failures: self.failures.clone(),
            lock_on_doorbell: self.lock_on_doorbell.clone(),
            beating: true,
        }
    }

    /// A platform on which the heartbeat never moves.
    pub fn stalled_platform(&self) -> TestPlatform {
        TestPlatform {
            beating: false,
            ..self.platform()
        }
    }

    /// Configuration for `cpu`, rung by bus interrupt.
    pub fn config(cpu: u16) -> PktConfig {
        PktConfig {
            notify: NotifyMethod {
                kind: NotifyKind::Bus,
                args: [3, 0x60 + u32::from(cpu), 0],
            },
            alive_timeout_secs: 1,
            ..PktConfig::for_cpu(cpu)
        }
    }

    pub fn desc(&self, cfg: PktConfig) -> SmPktDesc<TestPlatform> {
        SmPktDesc::init(self.mem, self.platform(), cfg)
    }

    /// An attached descriptor for `cpu`, with the default configuration.
    pub fn node(&self, cpu: u16) -> SmPktDesc<TestPlatform> {
        self.node_with(Self::config(cpu))
    }

    pub fn node_with(&self, cfg: PktConfig) -> SmPktDesc<TestPlatform> {
        let mut d = self.desc(cfg);
        d.attach().unwrap();
        d
    }

    pub fn doorbells(&self) -> Vec<u16> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn clear_doorbells(&self) {
        self.doorbells.lock().unwrap().clear();
    }

    /// Takes or releases the free list's lock behind everyone's back.
    pub fn hold_free_list(&self, held: bool) {
        hold_free_list(&self.mem, held);
    }
}

fn hold_free_list(mem: &SmMem, held: bool) {
    let at = REGION_AT
        + offset_of!(RegionHdr, free_list)
        + offset_of!(SllHead, lock);
    let word = mem.base().as_ptr().wrapping_add(at).cast::<u32>();
    let value = if held { LOCK_TAKEN.to_be() } else { 0 };
    unsafe { AtomicU32::from_ptr(word) }.store(value, Ordering::SeqCst);
}

/// Number of packets on the free list, as `desc` sees it.
pub fn free_count(desc: &SmPktDesc<TestPlatform>) -> u32 {
    desc.region_info().unwrap().free_pkts
}

/// Free packets plus everything queued for any CPU.
pub fn circulating(desc: &SmPktDesc<TestPlatform>) -> u32 {
    let info = desc.region_info().unwrap();
    let queued: u32 = (0..info.max_cpus)
        .map(|c| desc.cpu_info(smpkt::CpuSel::Cpu(c)).unwrap().depth)
        .sum();
    info.free_pkts + queued
}
