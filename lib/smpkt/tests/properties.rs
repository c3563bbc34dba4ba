// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Random operation sequences against a model of where every packet is.

mod common;

use std::collections::VecDeque;

use common::{circulating, Rig};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use proptest_derive::Arbitrary;
use smpkt::{CpuSel, Dest, Packet, PktConfig, SmPktDesc, SmPktError};

const CPUS: u16 = 3;
const DEPTH: u32 = 4;

#[derive(Copy, Clone, Debug, Arbitrary)]
enum Op {
    Get(#[proptest(strategy = "0..CPUS")] u16),
    Put(#[proptest(strategy = "0..CPUS")] u16),
    Send {
        #[proptest(strategy = "0..CPUS")]
        from: u16,
        #[proptest(strategy = "0..CPUS")]
        to: u16,
    },
    Recv(#[proptest(strategy = "0..CPUS")] u16),
}

struct World {
    rig: Rig,
    cpus: Vec<SmPktDesc<common::TestPlatform>>,
    held: Vec<Vec<Packet>>,
    queued: Vec<VecDeque<u32>>,
    next_tag: u32,
    total: u32,
}

impl World {
    fn new() -> Self {
        let rig = Rig::formatted(2048, CPUS, 64);
        let cpus: Vec<_> = (0..CPUS)
            .map(|c| {
                rig.node_with(PktConfig {
                    max_input_pkts: DEPTH,
                    ..Rig::config(c)
                })
            })
            .collect();
        let total = cpus[0].region_info().unwrap().total_pkts;
        Self {
            rig,
            cpus,
            held: (0..CPUS).map(|_| vec![]).collect(),
            queued: (0..CPUS).map(|_| VecDeque::new()).collect(),
            next_tag: 1,
            total,
        }
    }

    fn apply(&mut self, op: Op) -> Result<(), TestCaseError> {
        match op {
            Op::Get(c) => {
                let c = usize::from(c);
                if let Some(mut p) = self.cpus[c].free_get().unwrap() {
                    p.set_type(self.next_tag);
                    self.next_tag += 1;
                    self.held[c].push(p);
                }
            }
            Op::Put(c) => {
                let c = usize::from(c);
                if let Some(p) = self.held[c].pop() {
                    self.cpus[c].free_put(p).unwrap();
                }
            }
            Op::Send { from, to } => {
                let (f, t) = (usize::from(from), usize::from(to));
                let Some(p) = self.held[f].pop() else {
                    return Ok(());
                };
                let tag = p.pkt_type();
                match self.cpus[f].send(p, Dest::Cpu(to)) {
                    Ok(()) => self.queued[t].push_back(tag),
                    Err(e) => {
                        prop_assert_eq!(e.error, SmPktError::ListFull);
                        prop_assert_eq!(self.queued[t].len(), DEPTH as usize);
                        let p = e.packet.expect("refused packet returned");
                        prop_assert_eq!(p.pkt_type(), tag);
                        self.held[f].push(p);
                    }
                }
            }
            Op::Recv(c) => {
                let c = usize::from(c);
                let got = self.cpus[c].recv().unwrap();
                let want = self.queued[c].pop_front();
                prop_assert_eq!(got.as_ref().map(Packet::pkt_type), want);
                if let Some(p) = got {
                    self.held[c].push(p);
                }
            }
        }
        Ok(())
    }

    fn check(&self) -> Result<(), TestCaseError> {
        let held: usize = self.held.iter().map(Vec::len).sum();
        prop_assert_eq!(
            circulating(&self.cpus[0]) as usize + held,
            self.total as usize
        );
        for c in 0..CPUS {
            let info = self.cpus[0].cpu_info(CpuSel::Cpu(c)).unwrap();
            prop_assert!(info.depth <= info.limit);
            let queued = self.queued[usize::from(c)].len();
            prop_assert_eq!(info.depth as usize, queued);
        }
        Ok(())
    }
}

proptest! {
    #[test]
    fn packets_are_conserved(ops in prop::collection::vec(any::<Op>(), 1..80)) {
        let mut world = World::new();
        for op in ops {
            world.apply(op)?;
            world.check()?;
        }
        prop_assert!(world.rig.doorbells().len() <= world.next_tag as usize);
    }

    #[test]
    fn detach_returns_everything(
        ops in prop::collection::vec(any::<Op>(), 1..40),
    ) {
        let mut world = World::new();
        for op in ops {
            world.apply(op)?;
        }
        for c in 1..usize::from(CPUS) {
            let drained = world.cpus[c].detach(true).unwrap();
            prop_assert_eq!(drained as usize, world.queued[c].len());
            world.queued[c].clear();
        }
        world.check()?;
    }
}
