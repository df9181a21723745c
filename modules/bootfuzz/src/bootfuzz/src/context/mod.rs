// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Harness state threaded through every entry point
//!
//! The paging structures, the interrupt table and the allocation table live in storage
//! the integration provides (usually statics in the bootloader image). The context
//! borrows them for the lifetime of the harness, so nothing in this crate is a mutable
//! global.

use core::{fmt, ptr::null_mut};

use getters::Getters;
use typed_builder::TypedBuilder;

use crate::{
    agent::{escalate, AgentClient},
    arch::Processor,
    configuration::{Delivery, HarnessConfiguration},
    disk::{Disposition, LinearMemory, RegisterState, VirtualDisk},
    error::HarnessError,
    hypercall::Hypercall,
    interrupts::{HandlerAddresses, InterruptTable},
    logger::hprintf,
    paging::{PageControl, PagingScaffold},
    payload::PayloadBuffer,
    sanitizer::{CanarySanitizer, PoolAllocator, Sanitizer},
};

#[derive(TypedBuilder, Getters)]
#[getters(mutable)]
pub struct HarnessContext<'a, H, P, A, const RECORDS: usize, const TABLES: usize> {
    #[builder(default)]
    pub(crate) configuration: HarnessConfiguration,
    pub(crate) client: AgentClient<H>,
    pub(crate) processor: P,
    pub(crate) paging: &'a mut PagingScaffold<TABLES>,
    pub(crate) interrupts: &'a mut InterruptTable,
    pub(crate) sanitizer: &'a mut CanarySanitizer<A, RECORDS>,
    pub(crate) payload: PayloadBuffer<'a>,
    #[builder(default)]
    /// Entry points of the fault and no-op interrupt stubs
    pub(crate) handlers: HandlerAddresses,
}

impl<'a, H, P, A, const RECORDS: usize, const TABLES: usize>
    HarnessContext<'a, H, P, A, RECORDS, TABLES>
where
    H: Hypercall,
    P: Processor,
    A: PoolAllocator,
{
    /// The disk shim as configured
    pub fn disk(&self) -> VirtualDisk {
        VirtualDisk::new(
            self.configuration.drive_number(),
            self.configuration.geometry(),
            self.configuration.delivery() == Delivery::VirtualDisk,
        )
    }

    /// Handle for one execution of the target
    pub fn iteration(&mut self) -> Iteration<'_, 'a> {
        let disk = self.disk();
        let delivery = self.configuration.delivery();

        Iteration {
            transport: self.client.transport(),
            sanitizer: &mut *self.sanitizer,
            processor: &mut self.processor,
            paging: &mut *self.paging,
            payload: &mut self.payload,
            disk,
            delivery,
        }
    }
}

/// What the target sees of the harness during one iteration
///
/// Every helper that can observe a problem handles it itself: target faults end the
/// iteration with the panic hypercall, harness errors with the abort hypercall. The target
/// never receives a harness error.
pub struct Iteration<'i, 'p> {
    transport: &'i dyn Hypercall,
    sanitizer: &'i mut dyn Sanitizer,
    processor: &'i mut dyn Processor,
    paging: &'i mut dyn PageControl,
    payload: &'i mut PayloadBuffer<'p>,
    disk: VirtualDisk,
    delivery: Delivery,
}

impl<'i, 'p> Iteration<'i, 'p> {
    fn escalate(&self, error: HarnessError) -> ! {
        escalate(self.transport, &error)
    }

    /// Sanitized replacement for the target's pool allocation. Returns null when the pool
    /// is exhausted.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        match self.sanitizer.allocate(size) {
            Ok(pointer) => pointer.map_or(null_mut(), |p| p.as_ptr()),
            Err(e) => self.escalate(e),
        }
    }

    pub fn allocate_zeroed(&mut self, size: usize) -> *mut u8 {
        match self.sanitizer.allocate_zeroed(size) {
            Ok(pointer) => pointer.map_or(null_mut(), |p| p.as_ptr()),
            Err(e) => self.escalate(e),
        }
    }

    pub fn reallocate(&mut self, pointer: *mut u8, size: usize) -> *mut u8 {
        match self.sanitizer.reallocate(pointer, size) {
            Ok(pointer) => pointer.map_or(null_mut(), |p| p.as_ptr()),
            Err(e) => self.escalate(e),
        }
    }

    /// Sanitized replacement for the target's pool free
    pub fn free(&mut self, pointer: *mut u8) {
        if let Err(e) = self.sanitizer.free(pointer) {
            self.escalate(e);
        }
    }

    /// Verify every live allocation now rather than at release
    pub fn check(&self) {
        if let Err(e) = self.sanitizer.check() {
            self.escalate(e);
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.sanitizer.live()
    }

    /// Set the presence of the page containing `address` and flush its translation.
    /// Returns the previous presence.
    pub fn map_unmap(&mut self, address: usize, present: bool) -> bool {
        let previous = self.paging.map_unmap(address, present);
        self.processor.invalidate_page(address);
        previous
    }

    pub fn mapped_pages(&self) -> usize {
        self.paging.mapped_pages()
    }

    /// The payload, when it is delivered as a raw buffer
    pub fn payload(&self) -> Option<&[u8]> {
        (self.delivery == Delivery::RawBuffer).then(|| self.payload.data())
    }

    /// Serve an INT 13h request from the target's disk hook
    pub fn disk_service<M>(&mut self, regs: &mut RegisterState, memory: &mut M) -> Disposition
    where
        M: LinearMemory + ?Sized,
    {
        self.disk.service(regs, memory, self.payload)
    }

    pub fn printf(&self, args: fmt::Arguments<'_>) {
        hprintf(self.transport, args);
    }

    /// Report a crash the target detected itself
    pub fn crash(&self) -> ! {
        self.escalate(HarnessError::TargetCrash)
    }
}
