// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packets, and moving them between CPUs.
//!
//! A packet is owned by exactly one party at a time: the free list, one
//! CPU's input queue, or a CPU holding a [`Packet`] handle. Handles are not
//! `Clone`, and every operation that hands a packet to shared memory takes
//! the handle by value. When such an operation fails before the packet was
//! linked anywhere, the handle comes back inside the [`PktError`].

use core::mem::{offset_of, size_of};

use smpkt_abi::{PktHdr, SmPktError};

use crate::mem::{ShOff, SmMem};
use crate::region::Region;
use crate::sll::Put;
use crate::trace::{trace, Trace};
use crate::{Platform, SmPktDesc};

/// A packet owned by this CPU.
///
/// Dropping a handle does not return the packet to the free list; the slot
/// stays out of circulation until the region is formatted again. Give it
/// back with [`SmPktDesc::free_put`].
#[derive(Debug)]
#[must_use]
pub struct Packet {
    mem: SmMem,
    node: ShOff,
    capacity: u32,
}

const TYPE: usize = offset_of!(PktHdr, pkt_type);
const LEN: usize = offset_of!(PktHdr, len);
const SRC: usize = offset_of!(PktHdr, src_cpu);
const DATA: usize = size_of::<PktHdr>();

impl Packet {
    pub(crate) fn new(mem: SmMem, node: ShOff, capacity: u32) -> Self {
        Self {
            mem,
            node,
            capacity,
        }
    }

    pub(crate) fn mem(&self) -> &SmMem {
        &self.mem
    }

    pub(crate) fn node(&self) -> ShOff {
        self.node
    }

    /// Caller-defined tag.
    pub fn pkt_type(&self) -> u32 {
        self.mem.load(self.node.at(TYPE))
    }

    pub fn set_type(&mut self, pkt_type: u32) {
        self.mem.store(self.node.at(TYPE), pkt_type);
    }

    /// Number of valid payload bytes, as recorded in the header.
    pub fn len(&self) -> usize {
        self.mem.load(self.node.at(LEN)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the number of valid payload bytes. A length beyond
    /// [`capacity`](Self::capacity) is stored as given and refused at send
    /// time.
    pub fn set_len(&mut self, len: u32) {
        self.mem.store(self.node.at(LEN), len);
    }

    /// CPU that sent this packet.
    pub fn src_cpu(&self) -> u16 {
        self.mem.load(self.node.at(SRC)) as u16
    }

    /// Payload capacity, the same for every packet in the region.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// The valid part of the payload.
    pub fn data(&self) -> &[u8] {
        let len = self.len().min(self.capacity());
        // Safety: we own the packet, so no other CPU touches its payload.
        unsafe { self.mem.bytes(self.node.at(DATA) as usize, len) }
    }

    /// The whole payload area, regardless of the recorded length.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        // Safety: as for `data`, and `&mut self` rules out a second borrow.
        unsafe {
            self.mem
                .bytes_mut(self.node.at(DATA) as usize, self.capacity())
        }
    }

    /// Copies `data` into the payload and sets the length to match.
    pub fn fill(&mut self, data: &[u8]) -> Result<(), SmPktError> {
        let len =
            u32::try_from(data.len()).map_err(|_| SmPktError::PacketTooBig)?;
        if len > self.capacity {
            return Err(SmPktError::PacketTooBig);
        }
        self.mem.copy_in(self.node.at(DATA) as usize, data);
        self.set_len(len);
        Ok(())
    }

    /// Makes this packet a copy of `other`: type, length and payload.
    fn copy_from(&mut self, other: &Packet) {
        let len = other.len().min(other.capacity());
        self.mem.copy_within(
            other.node.at(DATA) as usize,
            self.node.at(DATA) as usize,
            len,
        );
        self.set_type(other.pkt_type());
        self.set_len(len as u32);
    }
}

/// A failed packet operation.
///
/// `packet` is the caller's packet, handed back, if the operation failed
/// before linking it into any list. It is `None` when the packet was
/// delivered to a queue and is no longer the caller's, as with
/// `NotifyIncomplete` and `IncompleteBroadcast`.
#[derive(Debug)]
pub struct PktError {
    pub error: SmPktError,
    pub packet: Option<Packet>,
}

impl PktError {
    fn returned(error: SmPktError, packet: Packet) -> Self {
        Self {
            error,
            packet: Some(packet),
        }
    }

    fn consumed(error: SmPktError) -> Self {
        Self {
            error,
            packet: None,
        }
    }
}

impl From<PktError> for SmPktError {
    fn from(e: PktError) -> Self {
        e.error
    }
}

impl core::fmt::Display for PktError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.error.fmt(f)
    }
}

impl core::error::Error for PktError {}

/// Where to send a packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dest {
    Cpu(u16),
    /// Every attached CPU other than the sender.
    Broadcast,
}

impl<P: Platform> SmPktDesc<P> {
    /// Takes a packet off the free list. `Ok(None)` means none are free.
    pub fn free_get(&mut self) -> Result<Option<Packet>, SmPktError> {
        let region = self.region.ok_or(SmPktError::NotAttached)?;
        self.settle(&region)?;
        match region.free_list(&self.mem).get() {
            Ok(node) => Ok(node.map(|n| region.packet(&self.mem, n))),
            Err(e) => {
                trace!(self.trace, Trace::LockTimeout);
                Err(e)
            }
        }
    }

    /// Returns a packet to the free list.
    pub fn free_put(&mut self, pkt: Packet) -> Result<(), PktError> {
        let Some(region) = self.region else {
            return Err(PktError::returned(SmPktError::NotAttached, pkt));
        };
        if !region.owns(&self.mem, &pkt) {
            return Err(PktError::returned(SmPktError::InvalidPacket, pkt));
        }
        if let Err(e) = self.settle(&region) {
            return Err(PktError::returned(e, pkt));
        }
        match region.free_list(&self.mem).put(pkt.node) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e == SmPktError::LockTimeout {
                    trace!(self.trace, Trace::LockTimeout);
                }
                Err(PktError::returned(e, pkt))
            }
        }
    }

    /// Puts a held-back packet, if we have one, on the free list.
    pub(crate) fn settle(&mut self, region: &Region) -> Result<(), SmPktError> {
        let Some(node) = self.stray else {
            return Ok(());
        };
        if !region.owns_node(node) {
            // Left over from a region that has since been reformatted.
            self.stray = None;
            return Ok(());
        }
        match region.free_list(&self.mem).put(node) {
            Ok(_) => {
                self.stray = None;
                trace!(self.trace, Trace::Recovered);
                Ok(())
            }
            Err(e) => {
                trace!(self.trace, Trace::LockTimeout);
                Err(e)
            }
        }
    }

    /// Returns `node` to the free list, or holds on to it for `settle` if
    /// the lock cannot be had. Callers must have settled first, so there is
    /// never more than one packet held back.
    pub(crate) fn release(&mut self, region: &Region, node: ShOff) {
        if region.free_list(&self.mem).put(node).is_err() {
            debug_assert!(self.stray.is_none());
            self.stray = Some(node);
            trace!(self.trace, Trace::HeldBack);
        }
    }

    /// Takes the next packet off this CPU's input queue. `Ok(None)` means
    /// the queue is empty.
    ///
    /// A doorbell is only rung when a queue goes from empty to non-empty, so
    /// a CPU woken by one should keep receiving until this returns `None`.
    pub fn recv(&mut self) -> Result<Option<Packet>, SmPktError> {
        let region = self.region.ok_or(SmPktError::NotAttached)?;
        match region.input_list(&self.mem, self.cfg.cpu).get() {
            Ok(node) => Ok(node.map(|n| region.packet(&self.mem, n))),
            Err(e) => {
                trace!(self.trace, Trace::LockTimeout);
                Err(e)
            }
        }
    }

    /// Sends `pkt` to one CPU, or to every other attached CPU.
    ///
    /// On success the packet belongs to the destination. On failure, check
    /// [`PktError::packet`]: if it is `Some`, nothing was queued and the
    /// packet is yours again.
    pub fn send(&mut self, pkt: Packet, dest: Dest) -> Result<(), PktError> {
        let Some(region) = self.region else {
            return Err(PktError::returned(SmPktError::NotAttached, pkt));
        };
        if !region.owns(&self.mem, &pkt) {
            return Err(PktError::returned(SmPktError::InvalidPacket, pkt));
        }
        if pkt.len() > region.max_pkt_bytes as usize {
            return Err(PktError::returned(SmPktError::PacketTooBig, pkt));
        }
        match dest {
            Dest::Cpu(cpu) => self.send_one(&region, pkt, cpu),
            Dest::Broadcast => self.broadcast(&region, pkt),
        }
    }

    fn send_one(
        &mut self,
        region: &Region,
        pkt: Packet,
        dest: u16,
    ) -> Result<(), PktError> {
        if dest >= region.max_cpus {
            return Err(PktError::returned(SmPktError::InvalidCpuNumber, pkt));
        }
        if !region.cpu_attached(&self.mem, dest) {
            return Err(PktError::returned(SmPktError::DestNotAttached, pkt));
        }
        let put = match self.enqueue(region, &pkt, dest) {
            Ok(put) => put,
            Err(e) => return Err(PktError::returned(e, pkt)),
        };
        // `pkt` is the destination's now, and is not used again.
        if put.was_empty && dest != self.cfg.cpu {
            self.ring(region, dest).map_err(PktError::consumed)?;
        }
        Ok(())
    }

    /// Sends a copy of `pkt` to every attached CPU but us, in CPU order.
    ///
    /// Copies come off the free list. When it runs dry, the next destination
    /// gets the original itself; after that there is nothing left to send,
    /// and every remaining destination is missed. A copy that could not be
    /// queued is kept for the next destination. If the free list cannot be
    /// locked before anything has been sent, the whole call fails with
    /// `LockTimeout` and the packet comes back.
    fn broadcast(
        &mut self,
        region: &Region,
        pkt: Packet,
    ) -> Result<(), PktError> {
        if let Err(e) = self.settle(region) {
            return Err(PktError::returned(e, pkt));
        }
        let mut original = Some(pkt);
        let mut spare: Option<Packet> = None;
        let mut delivered = 0u16;
        let mut missed = 0u16;

        for cpu in 0..region.max_cpus {
            if cpu == self.cfg.cpu || !region.cpu_attached(&self.mem, cpu) {
                continue;
            }
            let Some(orig) = original.as_ref() else {
                missed += 1;
                continue;
            };

            let fresh = match spare.take() {
                Some(copy) => Some(copy),
                None => match region.free_list(&self.mem).get() {
                    Ok(Some(node)) => {
                        let mut copy = region.packet(&self.mem, node);
                        copy.copy_from(orig);
                        Some(copy)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        trace!(self.trace, Trace::LockTimeout);
                        if delivered == 0 && missed == 0 {
                            // Nothing has gone anywhere, so the caller can
                            // simply try again.
                            return Err(match original.take() {
                                Some(p) => PktError::returned(e, p),
                                None => PktError::consumed(e),
                            });
                        }
                        missed += 1;
                        continue;
                    }
                },
            };
            let (outgoing, is_copy) = match fresh {
                Some(copy) => (copy, true),
                None => match original.take() {
                    Some(p) => (p, false),
                    None => continue,
                },
            };

            match self.enqueue(region, &outgoing, cpu) {
                Ok(put) => {
                    if put.was_empty && self.ring(region, cpu).is_err() {
                        missed += 1;
                    } else {
                        delivered += 1;
                    }
                }
                Err(_) => {
                    missed += 1;
                    if is_copy {
                        spare = Some(outgoing);
                    } else {
                        original = Some(outgoing);
                    }
                }
            }
        }

        trace!(self.trace, Trace::Broadcast { delivered, missed });

        if let Some(copy) = spare {
            self.release(region, copy.node);
        }
        let error = if missed == 0 {
            None
        } else {
            Some(SmPktError::IncompleteBroadcast)
        };
        if let Some(orig) = original {
            if let Err(e) = region.free_list(&self.mem).put(orig.node) {
                trace!(self.trace, Trace::LockTimeout);
                return Err(PktError::returned(error.unwrap_or(e), orig));
            }
        }
        match error {
            None => Ok(()),
            Some(e) => Err(PktError::consumed(e)),
        }
    }

    /// Stamps the sender and links `pkt` onto `dest`'s input queue.
    fn enqueue(
        &mut self,
        region: &Region,
        pkt: &Packet,
        dest: u16,
    ) -> Result<Put, SmPktError> {
        self.mem.store(pkt.node.at(SRC), u32::from(self.cfg.cpu));
        let r = region.input_list(&self.mem, dest).put(pkt.node);
        match r {
            Ok(_) => trace!(self.trace, Trace::Sent { dest }),
            Err(SmPktError::ListFull) => {
                trace!(self.trace, Trace::ListFull { dest })
            }
            Err(_) => trace!(self.trace, Trace::LockTimeout),
        }
        r
    }

    /// Rings `dest`'s doorbell, retrying a bounded number of times.
    fn ring(&mut self, region: &Region, dest: u16) -> Result<(), SmPktError> {
        let Some(method) = region.notify_method(&self.mem, dest) else {
            trace!(self.trace, Trace::DoorbellFailed { dest, attempt: 0 });
            return Err(SmPktError::NotifyIncomplete);
        };
        if method.kind == smpkt_abi::NotifyKind::None {
            return Ok(());
        }

        for attempt in 0..=self.cfg.notify_retries {
            if attempt != 0 {
                self.platform.delay(self.cfg.notify_retry_ticks);
            }
            if self.platform.notify(dest, &method).is_ok() {
                trace!(self.trace, Trace::Doorbell { dest });
                return Ok(());
            }
            trace!(self.trace, Trace::DoorbellFailed { dest, attempt });
        }
        Err(SmPktError::NotifyIncomplete)
    }
}
