// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local view of the shared window.
//!
//! Each CPU maps the shared window at its own local address. `SmMem` holds
//! that local base and translates window offsets into local references; no
//! local address is ever written into shared memory, and no raw offset leaves
//! this crate.

use core::num::NonZeroU32;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use smpkt_abi::{Anchor, SmPktError, SHARED_ALIGN};

use crate::barrier;

/// Window offset of a shared object.
///
/// Offset zero is the anchor, which is never linked into anything, so a zero
/// link encodes "no node" and a real link is always nonzero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ShOff(NonZeroU32);

impl ShOff {
    pub(crate) fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub(crate) fn from_usize(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().and_then(Self::new)
    }

    pub(crate) fn get(self) -> u32 {
        self.0.get()
    }

    /// Offset of a field `bytes` into the object at `self`.
    pub(crate) fn at(self, bytes: usize) -> u32 {
        // Field offsets are tiny and objects were placed inside a window
        // whose length fits in 32 bits, so this cannot wrap for any offset
        // that `SmMem::word` would accept.
        self.0.get().wrapping_add(bytes as u32)
    }

    /// The object `bytes` into the object at `self`.
    pub(crate) fn offset(self, bytes: usize) -> Self {
        Self(self.0.saturating_add(bytes as u32))
    }

    /// Encodes an optional link for storage in a shared word.
    pub(crate) fn encode(link: Option<Self>) -> u32 {
        link.map_or(0, Self::get)
    }
}

/// A CPU's mapping of the shared window.
///
/// The base is the local address of the anchor. This is a plain view and
/// is freely copied; see `from_raw` for the contract that makes that sound.
#[derive(Copy, Clone, Debug)]
pub struct SmMem {
    base: NonNull<u8>,
    len: usize,
}

// Safety: all access to the window goes through atomics, or through packet
// payloads, which are only touched by the CPU that currently owns the packet.
unsafe impl Send for SmMem {}
unsafe impl Sync for SmMem {}

impl SmMem {
    /// Wraps `len` bytes of shared memory at local address `base`.
    ///
    /// The window must be aligned for 32-bit words, must hold at least an
    /// anchor, and must be small enough to be addressed with 32-bit offsets.
    ///
    /// # Safety
    ///
    /// The memory must stay mapped, readable and writable for as long as any
    /// copy of the returned `SmMem` (or any `Packet` derived from it) exists,
    /// and must not be accessed other than through this crate, by this or any
    /// other CPU.
    pub unsafe fn from_raw(
        base: *mut u8,
        len: usize,
    ) -> Result<Self, SmPktError> {
        let base = NonNull::new(base).ok_or(SmPktError::BadParameter)?;
        if !(base.as_ptr() as usize).is_multiple_of(SHARED_ALIGN)
            || len < core::mem::size_of::<Anchor>()
            || len > u32::MAX as usize
        {
            return Err(SmPktError::BadParameter);
        }
        Ok(Self { base, len })
    }

    /// Local address of the window, which is also the anchor's address.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translates a local address into a window offset, if it falls within
    /// the window.
    pub fn offset_of(&self, local: *const u8) -> Option<usize> {
        let off = (local as usize).checked_sub(self.base.as_ptr() as usize)?;
        (off < self.len).then_some(off)
    }

    /// Checks that `off..off + len` lies within the window.
    pub(crate) fn contains(&self, off: usize, len: usize) -> bool {
        off.checked_add(len).is_some_and(|end| end <= self.len)
    }

    /// Returns the shared word at `off`.
    ///
    /// Offsets come out of trusted shared memory; one that is out of bounds
    /// or misaligned means the region is corrupt, and we stop rather than
    /// touch memory outside the window.
    pub(crate) fn word(&self, off: u32) -> &AtomicU32 {
        let off = off as usize;
        assert!(
            off.is_multiple_of(SHARED_ALIGN) && self.contains(off, 4),
            "shared offset {off:#x} outside window"
        );
        // Safety: in bounds and aligned per the check above; the window is
        // valid for the lifetime of `self` per the `from_raw` contract, and
        // every access to this word is atomic.
        unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(off).cast()) }
    }

    /// Reads a shared field, converting from canonical byte order.
    pub(crate) fn load(&self, off: u32) -> u32 {
        u32::from_be(self.word(off).load(Ordering::Relaxed))
    }

    /// Writes a shared field in canonical byte order.
    pub(crate) fn store(&self, off: u32, value: u32) {
        self.word(off).store(value.to_be(), Ordering::Relaxed)
    }

    /// Reads a field that another CPU publishes with `store_release`.
    pub(crate) fn load_acquire(&self, off: u32) -> u32 {
        u32::from_be(self.word(off).load(Ordering::Acquire))
    }

    /// Writes a field, ordering all of our earlier shared writes before it.
    pub(crate) fn store_release(&self, off: u32, value: u32) {
        self.word(off).store(value.to_be(), Ordering::Release)
    }

    /// Pushes our writes out to the shared memory.
    ///
    /// Bridges between our CPU and the memory may post writes and complete
    /// them later. Reading back a location we just wrote forces the posted
    /// writes ahead of it to land before anyone is told to look.
    pub(crate) fn flush(&self, off: u32) {
        barrier::store_load_barrier();
        let _ = self.word(off).load(Ordering::SeqCst);
    }

    /// Copies `src` into the window at `off`.
    ///
    /// Only used on memory no other CPU can be looking at: a region being
    /// formatted, or the payload of a packet we own.
    pub(crate) fn copy_in(&self, off: usize, src: &[u8]) {
        assert!(self.contains(off, src.len()));
        // Safety: bounds checked above; see the doc comment for exclusivity.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.base.as_ptr().add(off),
                src.len(),
            );
        }
    }

    /// Copies `len` bytes within the window from `src` to `dst`.
    pub(crate) fn copy_within(&self, src: usize, dst: usize, len: usize) {
        assert!(self.contains(src, len) && self.contains(dst, len));
        // Safety: both ranges are in bounds; `core::ptr::copy` tolerates
        // overlap, although packets never overlap one another.
        unsafe {
            core::ptr::copy(
                self.base.as_ptr().add(src),
                self.base.as_ptr().add(dst),
                len,
            );
        }
    }

    /// Zero-fills `len` bytes at `off`.
    pub(crate) fn zero(&self, off: usize, len: usize) {
        assert!(self.contains(off, len));
        // Safety: bounds checked above; only used while formatting.
        unsafe {
            core::ptr::write_bytes(self.base.as_ptr().add(off), 0, len);
        }
    }

    /// Borrows `len` bytes at `off`.
    ///
    /// # Safety
    ///
    /// No other CPU may write the range while the borrow lives.
    pub(crate) unsafe fn bytes(&self, off: usize, len: usize) -> &[u8] {
        assert!(self.contains(off, len));
        unsafe {
            core::slice::from_raw_parts(self.base.as_ptr().add(off), len)
        }
    }

    /// Mutably borrows `len` bytes at `off`.
    ///
    /// # Safety
    ///
    /// No other CPU may read or write the range while the borrow lives, and
    /// no other borrow of it may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, off: usize, len: usize) -> &mut [u8] {
        assert!(self.contains(off, len));
        unsafe {
            core::slice::from_raw_parts_mut(self.base.as_ptr().add(off), len)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Leaks a zeroed, word-aligned window of `len` bytes.
    pub(crate) fn window(len: usize) -> SmMem {
        let words = Box::leak(vec![0u64; len.div_ceil(8)].into_boxed_slice());
        unsafe { SmMem::from_raw(words.as_mut_ptr().cast(), len).unwrap() }
    }

    #[test]
    fn rejects_bad_windows() {
        let words = Box::leak(vec![0u64; 8].into_boxed_slice());
        let base: *mut u8 = words.as_mut_ptr().cast();
        unsafe {
            assert_eq!(
                SmMem::from_raw(core::ptr::null_mut(), 64).unwrap_err(),
                SmPktError::BadParameter
            );
            assert_eq!(
                SmMem::from_raw(base.add(1), 32).unwrap_err(),
                SmPktError::BadParameter
            );
            assert_eq!(
                SmMem::from_raw(base, 8).unwrap_err(),
                SmPktError::BadParameter
            );
            assert!(SmMem::from_raw(base, 64).is_ok());
        }
    }

    #[test]
    fn fields_are_canonical_big_endian() {
        let mem = window(64);
        mem.store(8, 0x0102_0304);
        let raw = unsafe { mem.bytes(8, 4) };
        assert_eq!(raw, &[1, 2, 3, 4]);
        assert_eq!(mem.load(8), 0x0102_0304);
    }

    #[test]
    fn offset_translation() {
        let mem = window(64);
        let base = mem.base().as_ptr();
        assert_eq!(mem.offset_of(base), Some(0));
        assert_eq!(mem.offset_of(base.wrapping_add(63)), Some(63));
        assert_eq!(mem.offset_of(base.wrapping_add(64)), None);
        assert_eq!(mem.offset_of(base.wrapping_sub(1)), None);
    }

    #[test]
    fn links_encode_zero_as_none() {
        assert_eq!(ShOff::new(0), None);
        assert_eq!(ShOff::encode(None), 0);
        assert_eq!(ShOff::encode(ShOff::new(0x40)), 0x40);
        assert_eq!(ShOff::new(0x40).unwrap().at(12), 0x4c);
    }

    #[test]
    #[should_panic]
    fn out_of_window_word_panics() {
        let mem = window(64);
        mem.load(64);
    }
}
