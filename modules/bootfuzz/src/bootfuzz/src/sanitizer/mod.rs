// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Trailing-canary sanitizer for the target's pool allocator
//!
//! Every allocation is padded with an 8-byte canary just past the region the target asked
//! for. The canary is verified when the allocation is freed and whenever the harness
//! checks all live allocations, so an overflow is caught even if the block is never freed.
//!
//! Records live in a fixed-capacity table searched linearly. The sanitizer has to work
//! before any heap exists, so there is no growable collection here.

use core::{mem::size_of, ptr::NonNull};

use getters::Getters;
use log::{debug, trace};

use crate::error::{HarnessError, Result};

/// Value written past the end of every allocation
pub const CANARY: u64 = 0xdead_c0de_cafe_f00d;
/// Bytes reserved past the end of every allocation for the canary
pub const CANARY_SIZE: usize = size_of::<u64>();

/// The target's own pool allocator, wrapped by the sanitizer
pub trait PoolAllocator {
    /// Allocate `size` bytes, returning null on failure
    ///
    /// # Safety
    ///
    /// Called with the target's allocator in whatever state the target left it.
    unsafe fn allocate(&mut self, size: usize) -> *mut u8;

    /// Release a block returned by [`PoolAllocator::allocate`]
    ///
    /// # Safety
    ///
    /// `pointer` must have been returned by `allocate` and not freed since.
    unsafe fn free(&mut self, pointer: *mut u8);
}

#[derive(Getters, Debug, Clone, Copy, PartialEq, Eq)]
#[getters(deref)]
/// One live allocation
pub struct AllocationRecord {
    pointer: usize,
    usable_size: usize,
}

impl AllocationRecord {
    fn canary_address(&self) -> usize {
        self.pointer + self.usable_size
    }

    /// Read the current value of the trailing canary
    ///
    /// # Safety
    ///
    /// The record must describe a live allocation.
    unsafe fn canary(&self) -> u64 {
        (self.canary_address() as *const u64).read_unaligned()
    }

    /// Verify the trailing canary
    ///
    /// # Safety
    ///
    /// The record must describe a live allocation.
    unsafe fn verify(&self) -> Result<()> {
        let found = self.canary();

        if found != CANARY {
            return Err(HarnessError::CanaryOverwritten {
                pointer: self.pointer,
                size: self.usable_size,
                found,
            });
        }

        Ok(())
    }
}

/// Sanitizer over a pool allocator with room for `N` live allocations
pub struct CanarySanitizer<A, const N: usize> {
    allocator: A,
    records: [Option<AllocationRecord>; N],
    live: usize,
    high_water: usize,
}

impl<A, const N: usize> CanarySanitizer<A, N>
where
    A: PoolAllocator,
{
    pub const fn new(allocator: A) -> Self {
        Self {
            allocator,
            records: [None; N],
            live: 0,
            high_water: 0,
        }
    }

    /// Allocate `size` bytes followed by a canary. Returns `Ok(None)` when the underlying
    /// allocator is out of memory, which is the target's business. Running out of records
    /// is a harness error.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        let slot = self
            .records
            .iter()
            .position(Option::is_none)
            .ok_or(HarnessError::AllocationTableExhausted { capacity: N })?;

        let Some(padded) = size.checked_add(CANARY_SIZE) else {
            return Ok(None);
        };

        let Some(pointer) = NonNull::new(unsafe { self.allocator.allocate(padded) }) else {
            return Ok(None);
        };

        let record = AllocationRecord {
            pointer: pointer.as_ptr() as usize,
            usable_size: size,
        };

        // SAFETY: the block is `size + CANARY_SIZE` bytes long
        unsafe { (record.canary_address() as *mut u64).write_unaligned(CANARY) };

        self.records[slot] = Some(record);
        self.live += 1;
        self.high_water = self.high_water.max(self.live);

        trace!("allocate({size:#x}) = {:#x}", record.pointer);

        Ok(Some(pointer))
    }

    /// [`CanarySanitizer::allocate`] with the user region zeroed
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        let pointer = self.allocate(size)?;

        if let Some(pointer) = pointer {
            // SAFETY: the block has at least `size` usable bytes
            unsafe { pointer.as_ptr().write_bytes(0, size) };
        }

        Ok(pointer)
    }

    /// Verify and release an allocation. Freeing null does nothing.
    pub fn free(&mut self, pointer: *mut u8) -> Result<()> {
        if pointer.is_null() {
            return Ok(());
        }

        let slot = self.find(pointer)?;

        if let Some(record) = self.records[slot] {
            // SAFETY: the record is live
            unsafe { record.verify()? };
            // SAFETY: `pointer` came from this allocator and is live
            unsafe { self.allocator.free(pointer) };
            trace!("free({:#x})", record.pointer);
        }

        self.records[slot] = None;
        self.live -= 1;

        Ok(())
    }

    /// Resize an allocation. A null pointer allocates, a zero size frees.
    pub fn reallocate(&mut self, pointer: *mut u8, size: usize) -> Result<Option<NonNull<u8>>> {
        if pointer.is_null() {
            return self.allocate(size);
        }

        if size == 0 {
            self.free(pointer)?;
            return Ok(None);
        }

        let slot = self.find(pointer)?;
        let Some(old) = self.records[slot] else {
            return Err(HarnessError::UnknownPointer {
                pointer: pointer as usize,
            });
        };

        // SAFETY: the record is live
        unsafe { old.verify()? };

        // The new block takes over the old record's slot
        let Some(padded) = size.checked_add(CANARY_SIZE) else {
            return Ok(None);
        };

        let Some(new) = NonNull::new(unsafe { self.allocator.allocate(padded) }) else {
            return Ok(None);
        };

        let record = AllocationRecord {
            pointer: new.as_ptr() as usize,
            usable_size: size,
        };

        // SAFETY: both blocks are live and distinct, the new one is `size + CANARY_SIZE` long
        unsafe {
            core::ptr::copy_nonoverlapping(pointer, new.as_ptr(), old.usable_size.min(size));
            (record.canary_address() as *mut u64).write_unaligned(CANARY);
            self.allocator.free(pointer);
        }

        self.records[slot] = Some(record);

        trace!("reallocate({:#x}, {size:#x}) = {:#x}", old.pointer, record.pointer);

        Ok(Some(new))
    }

    /// Verify the canary of every live allocation
    pub fn check(&self) -> Result<()> {
        self.records
            .iter()
            .flatten()
            // SAFETY: every record in the table is live
            .try_for_each(|record| unsafe { record.verify() })?;

        debug!("Verified {} live allocation canaries", self.live);

        Ok(())
    }

    fn find(&self, pointer: *mut u8) -> Result<usize> {
        let address = pointer as usize;

        self.records
            .iter()
            .position(|r| r.is_some_and(|r| r.pointer == address))
            .ok_or(HarnessError::UnknownPointer { pointer: address })
    }

    /// Number of live allocations
    pub fn live(&self) -> usize {
        self.live
    }

    /// Largest number of simultaneously live allocations seen
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter().flatten()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

/// Object-safe view of the sanitizer handed to the target
pub trait Sanitizer {
    fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>>;
    fn allocate_zeroed(&mut self, size: usize) -> Result<Option<NonNull<u8>>>;
    fn reallocate(&mut self, pointer: *mut u8, size: usize) -> Result<Option<NonNull<u8>>>;
    fn free(&mut self, pointer: *mut u8) -> Result<()>;
    fn check(&self) -> Result<()>;
    fn live(&self) -> usize;
}

impl<A, const N: usize> Sanitizer for CanarySanitizer<A, N>
where
    A: PoolAllocator,
{
    fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        CanarySanitizer::allocate(self, size)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
        CanarySanitizer::allocate_zeroed(self, size)
    }

    fn reallocate(&mut self, pointer: *mut u8, size: usize) -> Result<Option<NonNull<u8>>> {
        CanarySanitizer::reallocate(self, pointer, size)
    }

    fn free(&mut self, pointer: *mut u8) -> Result<()> {
        CanarySanitizer::free(self, pointer)
    }

    fn check(&self) -> Result<()> {
        CanarySanitizer::check(self)
    }

    fn live(&self) -> usize {
        CanarySanitizer::live(self)
    }
}
