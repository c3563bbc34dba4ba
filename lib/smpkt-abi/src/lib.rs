// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared-memory packet protocol ABI.
//!
//! These are the structures that every CPU on the backplane agrees on, bit
//! for bit. Nothing in here is a pointer: every reference between shared
//! structures is a 32-bit offset from the start of the shared window (which
//! is where the anchor lives), because each CPU maps the window at a
//! different local address.
//!
//! All multi-byte fields are stored big-endian, so that CPUs of differing
//! endianness can share a region without corrupting one another's view of it.
//! The structures are `Unaligned` and contain no padding; their sizes are
//! pinned below, since changing any of them changes the ABI.

#![no_std]

use num_derive::FromPrimitive;
use serde::Deserialize;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Value the master stores in `Anchor::ready` once the packet region has been
/// formatted and its offset published. Anything else means "not yet".
pub const ANCHOR_READY: u32 = 0x534d_504b;

/// Value stored in `CpuDesc::status` while a CPU is attached.
pub const CPU_ATTACHED: u32 = 0x4154_4348;

/// Lock word value while a list lock is held. A free lock is zero.
pub const LOCK_TAKEN: u32 = 0x8000_0000;

/// Largest number of CPUs a region can be formatted for. This keeps a set of
/// CPUs representable as a single `u64` mask.
pub const SM_MAX_CPUS: usize = 64;

/// CPU number of the node that formats the region and drives the heartbeat.
pub const MASTER_CPU: u16 = 0;

/// Input queue depth used when a CPU asks for zero.
pub const DEFAULT_MAX_INPUT_PKTS: u32 = 100;

/// Payload sizes are rounded up to a multiple of this. The rounded value is
/// what gets recorded in the region header, so CPUs with a different native
/// word size still agree on packet geometry.
pub const PKT_WORD: u32 = core::mem::size_of::<usize>() as u32;

/// Alignment of every shared structure within the window.
pub const SHARED_ALIGN: usize = core::mem::size_of::<u32>();

/// The well-known record at offset zero of the shared window.
///
/// Every node looks here first. The anchor is written only by the master.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct Anchor {
    /// `ANCHOR_READY` once the region is usable.
    pub ready: U32,
    /// Incremented periodically by the master; attachers watch it move to
    /// decide that the region is alive.
    pub heartbeat: U32,
    /// Offset of the `RegionHdr`, or zero if not published.
    pub pkt_region: U32,
    /// CPU number of the master.
    pub master_cpu: U32,
}

/// Lock-protected singly-linked list head.
///
/// `head` and `tail` are window offsets of packet headers, with zero meaning
/// "none". `count == 0` exactly when `tail == 0`, and `count <= limit`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct SllHead {
    pub lock: U32,
    pub head: U32,
    pub tail: U32,
    pub count: U32,
    pub limit: U32,
}

/// Per-region metadata, found through `Anchor::pkt_region`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct RegionHdr {
    /// Payload capacity of every packet, already rounded to `PKT_WORD`.
    pub max_pkt_bytes: U32,
    /// Number of slots in the CPU table.
    pub max_cpus: U32,
    /// `TasKind` every CPU must use on this region's locks.
    pub tas_kind: U32,
    /// Offset of the first `CpuDesc`.
    pub cpu_table: U32,
    /// Offset of the first packet. Packets follow at `pkt_stride` intervals.
    pub pkt_pool: U32,
    /// Global free packet list. Its `limit` is the number of packets the
    /// region was formatted with and never changes afterwards.
    pub free_list: SllHead,
}

/// Per-CPU slot in the CPU table.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct CpuDesc {
    /// `CPU_ATTACHED` while attached, anything else otherwise.
    pub status: U32,
    /// `NotifyKind` the CPU wants to be woken with.
    pub notify_kind: U32,
    /// Arguments to the notification mechanism, opaque to the protocol.
    pub notify_args: [U32; 3],
    /// Packets destined for this CPU; `limit` is its input queue depth.
    pub input_list: SllHead,
}

/// Header at the start of every packet; the payload follows immediately.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct PktHdr {
    /// List linkage.
    pub next: U32,
    /// Caller-defined tag.
    pub pkt_type: U32,
    /// Number of valid payload bytes.
    pub len: U32,
    /// CPU that sent the packet, stamped at send time.
    pub src_cpu: U32,
}

const_assert_eq!(core::mem::size_of::<Anchor>(), 16);
const_assert_eq!(core::mem::size_of::<SllHead>(), 20);
const_assert_eq!(core::mem::size_of::<RegionHdr>(), 40);
const_assert_eq!(core::mem::size_of::<CpuDesc>(), 40);
const_assert_eq!(core::mem::size_of::<PktHdr>(), 16);

/// Kind of test-and-set used on every lock in a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum TasKind {
    /// Read-test-write with local interrupts masked. Only sound when a
    /// single CPU can touch the region, e.g. while the master formats it, or
    /// on buses that lock around the whole sequence.
    Soft = 1,
    /// Atomic read-modify-write cycle on the shared bus.
    Hard = 2,
}

/// How a sender wakes a destination CPU. Registered by each CPU at attach
/// time in its `CpuDesc`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum NotifyKind {
    /// The CPU polls its input queue; senders never ring it.
    None = 0,
    /// Bus interrupt; args are level and vector.
    Bus = 1,
    /// Byte-wide mailbox; args are address space, address and value.
    Mailbox1 = 2,
    /// Halfword mailbox.
    Mailbox2 = 3,
    /// Word mailbox.
    Mailbox4 = 4,
    /// Board-specific mechanisms.
    User1 = 5,
    User2 = 6,
}

/// A notification mechanism plus its arguments.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct NotifyMethod {
    pub kind: NotifyKind,
    #[serde(default)]
    pub args: [u32; 3],
}

impl NotifyMethod {
    pub const POLLED: Self = Self {
        kind: NotifyKind::None,
        args: [0; 3],
    };
}

impl Default for NotifyMethod {
    fn default() -> Self {
        Self::POLLED
    }
}

/// Errors reported by the packet protocol.
///
/// The discriminants are stable and may cross CPU boundaries as status
/// codes; use `FromPrimitive` to decode one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum SmPktError {
    /// The local descriptor is not attached to the region.
    NotAttached = 1,
    /// The local descriptor is already attached.
    AlreadyAttached,
    /// The packet handle does not name a packet in this region.
    InvalidPacket,
    /// The packet's length exceeds the region's payload capacity.
    PacketTooBig,
    /// The CPU number is outside the region's CPU table.
    InvalidCpuNumber,
    /// The destination CPU is not attached.
    DestNotAttached,
    /// The destination list is at its limit.
    ListFull,
    /// A list lock could not be taken within the configured tries.
    LockTimeout,
    /// The region never showed a ready anchor and a moving heartbeat.
    Down,
    /// The packet was queued but the destination's doorbell could not be
    /// rung. The packet is no longer the caller's.
    NotifyIncomplete,
    /// At least one broadcast destination was missed. The original packet
    /// is no longer the caller's.
    IncompleteBroadcast,
    /// The region cannot hold the header, CPU table and one packet per CPU.
    RegionTooSmall,
    /// The region failed its read/write probe.
    RegionNotAccessible,
    /// An argument is out of range, or a shared header field is nonsense.
    BadParameter,
}

impl core::fmt::Display for SmPktError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::NotAttached => "not attached",
            Self::AlreadyAttached => "already attached",
            Self::InvalidPacket => "invalid packet",
            Self::PacketTooBig => "packet too big",
            Self::InvalidCpuNumber => "invalid CPU number",
            Self::DestNotAttached => "destination not attached",
            Self::ListFull => "list full",
            Self::LockTimeout => "lock timeout",
            Self::Down => "shared memory region down",
            Self::NotifyIncomplete => "packet queued, notification failed",
            Self::IncompleteBroadcast => "incomplete broadcast",
            Self::RegionTooSmall => "region too small",
            Self::RegionNotAccessible => "region not accessible",
            Self::BadParameter => "bad parameter",
        };
        f.write_str(s)
    }
}

impl core::error::Error for SmPktError {}

/// Rounds a requested payload size up to `PKT_WORD`. Returns `None` on
/// overflow.
pub const fn round_pkt_bytes(bytes: u32) -> Option<u32> {
    match bytes.checked_add(PKT_WORD - 1) {
        Some(n) => Some(n & !(PKT_WORD - 1)),
        None => None,
    }
}

/// Distance between consecutive packets in the pool.
pub const fn pkt_stride(max_pkt_bytes: u32) -> usize {
    core::mem::size_of::<PktHdr>() + max_pkt_bytes as usize
}

/// Placement of the region's parts, relative to the start of the region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionGeometry {
    pub cpu_table: usize,
    pub pkt_pool: usize,
    pub stride: usize,
    pub pkt_count: usize,
}

impl RegionGeometry {
    /// Lays out a region of `size` bytes for `max_cpus` CPUs and payloads of
    /// `max_pkt_bytes` (already rounded).
    ///
    /// Returns `None` unless the region fits the header, the CPU table, and
    /// at least one packet per CPU.
    pub fn compute(
        size: usize,
        max_cpus: usize,
        max_pkt_bytes: u32,
    ) -> Option<Self> {
        let cpu_table = core::mem::size_of::<RegionHdr>();
        let pkt_pool = max_cpus
            .checked_mul(core::mem::size_of::<CpuDesc>())?
            .checked_add(cpu_table)?;
        let stride = pkt_stride(max_pkt_bytes);
        let pkt_count = size.checked_sub(pkt_pool)? / stride;
        if pkt_count < max_cpus || pkt_count > u32::MAX as usize {
            return None;
        }
        Some(Self {
            cpu_table,
            pkt_pool,
            stride,
            pkt_count,
        })
    }
}
