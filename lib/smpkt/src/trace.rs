// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-descriptor event trace.
//!
//! Each descriptor keeps a small ring of recent protocol events for
//! post-mortem inspection, either from a debugger or through
//! [`SmPktDesc::trace`](crate::SmPktDesc::trace). Recording the same event
//! from the same line twice in a row bumps a count instead of taking a new
//! slot, so a spinning retry loop does not wash out the history.

/// Something worth remembering.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Attached { cpu: u16 },
    /// Gave up waiting for the region after this many polls.
    Down { polls: u32 },
    Detached { drained: u32 },
    AlreadyAttached,
    Sent { dest: u16 },
    Doorbell { dest: u16 },
    DoorbellFailed { dest: u16, attempt: u32 },
    ListFull { dest: u16 },
    LockTimeout,
    /// A packet is held locally until the free list can be locked.
    HeldBack,
    /// A held-back packet made it to the free list.
    Recovered,
    Broadcast { delivered: u16, missed: u16 },
}

/// A recorded event.
#[derive(Copy, Clone, Debug)]
pub struct TraceEntry<T: Copy + PartialEq> {
    /// Source line that recorded it.
    pub line: u16,
    /// Bumped each time the slot is reused.
    pub generation: u16,
    /// Number of consecutive identical recordings.
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct TraceRing<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [TraceEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> TraceRing<T, N> {
    pub const fn new(empty: T) -> Self {
        Self {
            last: None,
            buffer: [TraceEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: empty,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // An untouched ring has no last entry; treating that as an
        // out-of-range index makes the first entry land in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let ndx = match last.wrapping_add(1) {
            n if n >= N => 0,
            n => n,
        };
        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Zero-sized ring.
            return;
        };
        *ent = TraceEntry {
            line,
            generation: ent.generation.wrapping_add(1),
            count: 1,
            payload,
        };
        self.last = Some(ndx);
    }

    /// Recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry<T>> + '_ {
        let start = self.last.map_or(0, |l| l + 1);
        self.buffer[start.min(N)..]
            .iter()
            .chain(&self.buffer[..start.min(N)])
            .filter(|e| e.count != 0)
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<&TraceEntry<T>> {
        self.last.and_then(|l| self.buffer.get(l))
    }
}

/// Records an event, tagged with the current source line.
macro_rules! trace {
    ($ring:expr, $payload:expr) => {
        $ring.entry(line!() as u16, $payload)
    };
}
pub(crate) use trace;
