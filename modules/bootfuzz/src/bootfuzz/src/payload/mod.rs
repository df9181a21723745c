// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! The payload buffer shared with the hypervisor
//!
//! The hypervisor writes each new input into this buffer during `NEXT_PAYLOAD`: a 32-bit
//! signed size followed by the input bytes. Both are untrusted. The buffer is kept as a raw
//! region rather than a slice because its contents change underneath the harness on every
//! iteration.

use core::{marker::PhantomData, mem::size_of, ptr::NonNull, slice};

use crate::{
    error::{HarnessError, Result},
    paging::PAGE_SIZE,
};

/// Size of the header preceding the payload bytes
pub const HEADER_SIZE: usize = size_of::<i32>();

#[derive(Debug)]
pub struct PayloadBuffer<'a> {
    base: NonNull<u8>,
    size: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> PayloadBuffer<'a> {
    /// Take ownership of a page-aligned region as the payload buffer. The region must
    /// be a whole number of pages.
    pub fn new(region: &'a mut [u8]) -> Result<Self> {
        let address = region.as_mut_ptr() as usize;

        if address % PAGE_SIZE != 0 {
            return Err(HarnessError::Misaligned {
                what: "Payload buffer",
                address,
                alignment: PAGE_SIZE,
            });
        }

        if region.is_empty() || region.len() % PAGE_SIZE != 0 {
            return Err(HarnessError::InvalidRegionSize {
                what: "Payload buffer",
                size: region.len(),
                granularity: PAGE_SIZE,
            });
        }

        region.fill(0);
        let size = region.len();

        Ok(Self {
            base: NonNull::from(region).cast(),
            size,
            _region: PhantomData,
        })
    }

    /// Address of the buffer as registered with `GET_PAYLOAD`
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Total size of the region, header included
    pub fn region_size(&self) -> usize {
        self.size
    }

    /// Maximum number of payload bytes
    pub fn capacity(&self) -> usize {
        self.size - HEADER_SIZE
    }

    /// Size of the current payload, clamped to the capacity. Negative sizes are empty.
    pub fn len(&self) -> usize {
        // SAFETY: the region is at least one page long and page aligned
        let raw = unsafe { self.base.as_ptr().cast::<i32>().read_volatile() };
        usize::try_from(raw).map_or(0, |len| len.min(self.capacity()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current payload
    pub fn data(&self) -> &[u8] {
        // SAFETY: `len` never exceeds the bytes following the header
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(HEADER_SIZE), self.len()) }
    }

    /// The current payload, writable (the virtual disk's write path)
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        // SAFETY: `len` never exceeds the bytes following the header
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(HEADER_SIZE), len) }
    }

    /// Addresses of every page of the region
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        (self.address()..self.address() + self.size).step_by(PAGE_SIZE)
    }
}
