// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Stack memory snapshots.

use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::{Pread, LE};

/// A borrowed view of the faulting thread's stack.
///
/// The walker never dereferences recovered pointers directly; every load
/// goes through [`StackMemory::get_memory_at_address`], which refuses reads
/// outside the snapshot. Tests hand in synthetic buffers, fault handlers
/// hand in the live stack range.
#[derive(Debug, Clone)]
pub struct StackMemory<'a> {
    base_address: u64,
    bytes: &'a [u8],
}

impl<'a> StackMemory<'a> {
    /// A snapshot over `bytes`, which start at `base_address` in the
    /// walked thread's address space.
    pub fn new(base_address: u64, bytes: &'a [u8]) -> StackMemory<'a> {
        StackMemory {
            base_address,
            bytes,
        }
    }

    /// A snapshot over the live memory range `[base_address,
    /// base_address + size)`.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped readable for `'a`, which holds for the
    /// current thread's own stack between its limit and base. Walking
    /// another thread's stack this way additionally requires that thread to
    /// be suspended.
    pub unsafe fn from_live_range(base_address: u64, size: usize) -> StackMemory<'a> {
        StackMemory {
            base_address,
            bytes: std::slice::from_raw_parts(base_address as usize as *const u8, size),
        }
    }

    /// The lowest address covered by this snapshot.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The number of bytes covered by this snapshot.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Read a value at `addr`, or `None` if any byte of it falls outside
    /// the snapshot.
    pub fn get_memory_at_address<T>(&self, addr: u64) -> Option<T>
    where
        T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
        T: SizeWith<scroll::Endian>,
    {
        let _end = self.base_address.checked_add(self.size())?;
        let start = addr.checked_sub(self.base_address)? as usize;

        self.bytes.pread_with::<T>(start, LE).ok()
    }
}
