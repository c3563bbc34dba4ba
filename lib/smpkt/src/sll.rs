// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared singly-linked FIFO lists.
//!
//! The free list and every CPU's input queue are instances of this. Nodes
//! are packets; the link lives in the first word of the packet header. Each
//! list has its own lock, and there is no lock spanning two lists.

use core::mem::offset_of;

use smpkt_abi::{PktHdr, SllHead, SmPktError, TasKind};

use crate::mem::{ShOff, SmMem};
use crate::tas;

/// Result of a successful `put`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Put {
    /// The list was empty before this put. This is the edge a doorbell is
    /// rung on.
    pub was_empty: bool,
}

/// A list head in shared memory, plus what we need to lock it.
#[derive(Copy, Clone)]
pub(crate) struct Sll<'a> {
    mem: &'a SmMem,
    head: ShOff,
    tas: TasKind,
    tries: u32,
}

const LOCK: usize = offset_of!(SllHead, lock);
const HEAD: usize = offset_of!(SllHead, head);
const TAIL: usize = offset_of!(SllHead, tail);
const COUNT: usize = offset_of!(SllHead, count);
const LIMIT: usize = offset_of!(SllHead, limit);
const NEXT: usize = offset_of!(PktHdr, next);

impl<'a> Sll<'a> {
    pub(crate) fn new(
        mem: &'a SmMem,
        head: ShOff,
        tas: TasKind,
        tries: u32,
    ) -> Self {
        Self {
            mem,
            head,
            tas,
            tries,
        }
    }

    /// Appends `node` at the tail.
    ///
    /// Fails with `ListFull` if the list is at its limit, leaving `node`
    /// untouched and still the caller's.
    pub(crate) fn put(&self, node: ShOff) -> Result<Put, SmPktError> {
        let mem = self.mem;
        let _lock =
            tas::acquire(mem, self.head.at(LOCK), self.tas, self.tries)?;

        let count = mem.load(self.head.at(COUNT));
        if count >= mem.load(self.head.at(LIMIT)) {
            return Err(SmPktError::ListFull);
        }

        mem.store(node.at(NEXT), 0);
        let was_empty = match ShOff::new(mem.load(self.head.at(TAIL))) {
            None => {
                mem.store(self.head.at(HEAD), node.get());
                true
            }
            Some(tail) => {
                mem.store(tail.at(NEXT), node.get());
                false
            }
        };
        mem.store(self.head.at(TAIL), node.get());
        mem.store(self.head.at(COUNT), count + 1);

        // The destination may be told about this as soon as we return; make
        // sure the list it finds is the one we just wrote.
        mem.flush(self.head.at(COUNT));
        Ok(Put { was_empty })
    }

    /// Unlinks and returns the head node, or `None` if the list is empty.
    pub(crate) fn get(&self) -> Result<Option<ShOff>, SmPktError> {
        let mem = self.mem;
        let _lock =
            tas::acquire(mem, self.head.at(LOCK), self.tas, self.tries)?;

        let Some(first) = ShOff::new(mem.load(self.head.at(HEAD))) else {
            return Ok(None);
        };
        let next = ShOff::new(mem.load(first.at(NEXT)));
        mem.store(self.head.at(HEAD), ShOff::encode(next));
        if next.is_none() {
            mem.store(self.head.at(TAIL), 0);
        }
        let count = mem.load(self.head.at(COUNT));
        mem.store(self.head.at(COUNT), count.saturating_sub(1));
        mem.store(first.at(NEXT), 0);

        mem.flush(self.head.at(COUNT));
        Ok(Some(first))
    }

    /// Replaces the list's limit, and returns the limit in force.
    ///
    /// The limit never drops below what is already queued: asking for less
    /// than the current count sets the limit to the count instead.
    pub(crate) fn set_limit(&self, limit: u32) -> Result<u32, SmPktError> {
        let _lock =
            tas::acquire(self.mem, self.head.at(LOCK), self.tas, self.tries)?;
        let limit = limit.max(self.mem.load(self.head.at(COUNT)));
        self.mem.store(self.head.at(LIMIT), limit);
        Ok(limit)
    }

    /// Grows the limit by one and appends `node`, for use while formatting.
    /// If the append fails, the limit is put back.
    pub(crate) fn grow_and_put(&self, node: ShOff) -> Result<(), SmPktError> {
        let limit = self.head.at(LIMIT);
        self.mem.store(limit, self.mem.load(limit) + 1);
        if let Err(e) = self.put(node) {
            self.mem.store(limit, self.mem.load(limit) - 1);
            return Err(e);
        }
        Ok(())
    }

    /// Unlocked snapshot of the length.
    pub(crate) fn count(&self) -> u32 {
        self.mem.load(self.head.at(COUNT))
    }

    /// Unlocked snapshot of the limit.
    pub(crate) fn limit(&self) -> u32 {
        self.mem.load(self.head.at(LIMIT))
    }
}
