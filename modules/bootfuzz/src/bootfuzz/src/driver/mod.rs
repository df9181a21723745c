// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! The persistent fuzzing loop
//!
//! The driver runs the platform bring-up and scaffold initialization once, performs the
//! handshake with the hypervisor, and then executes the target once per payload between
//! `ACQUIRE` and `RELEASE`. A crash never returns to the driver: the hypervisor restores
//! its snapshot and the loop continues from there.

use getters::Getters;
use log::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::{
    agent::escalate,
    arch::Processor,
    context::HarnessContext,
    error::{HarnessError, Result},
    hypercall::{HostConfig, Hypercall},
    platform::{discover_memory, enable_a20, Bios, MemoryMap},
    sanitizer::PoolAllocator,
    state::{Baseline, DriverState},
    traits::Target,
};

/// Entries kept from the firmware memory map
pub const MEMORY_MAP_ENTRIES: usize = 32;
/// Low memory the firmware writes memory map entries to during bring-up
pub const MEMORY_MAP_SCRATCH: u32 = 0x0500;

#[derive(TypedBuilder, Getters)]
#[getters(mutable)]
pub struct Driver<'a, H, P, A, const RECORDS: usize, const TABLES: usize> {
    context: HarnessContext<'a, H, P, A, RECORDS, TABLES>,
    #[builder(default)]
    #[getters(deref)]
    state: DriverState,
    #[builder(default = 0)]
    #[getters(deref)]
    /// The number of completed iterations
    iterations: usize,
    #[builder(default)]
    #[getters(deref)]
    /// Resource usage after the handshake, set by [`Driver::handshake`]
    baseline: Option<Baseline>,
}

impl<'a, H, P, A, const RECORDS: usize, const TABLES: usize> Driver<'a, H, P, A, RECORDS, TABLES>
where
    H: Hypercall,
    P: Processor,
    A: PoolAllocator,
{
    /// Enable the A20 line and read the firmware memory map. Only targets that start
    /// before their own firmware setup need this.
    pub fn bring_up<B>(&mut self, bios: &mut B) -> Result<MemoryMap<MEMORY_MAP_ENTRIES>>
    where
        B: Bios + ?Sized,
    {
        enable_a20(bios)?;
        let map = discover_memory::<MEMORY_MAP_ENTRIES, _>(bios, MEMORY_MAP_SCRATCH)?;

        let covered = self.context.paging.covered() as u64;

        if let Some(highest) = map.highest_usable() {
            if highest > covered {
                warn!("Usable memory up to {highest:#x} extends past the paged {covered:#x} bytes");
            }
        }

        Ok(map)
    }

    /// Build the paging scaffold and interrupt table and load them
    pub fn initialize(&mut self) -> Result<()> {
        let context = &mut self.context;
        let identity = context.configuration.identity_map();
        let covered = context.paging.covered() as u64;

        if identity.end > covered || identity.start > identity.end {
            return Err(HarnessError::OutsideCoverage {
                start: identity.start,
                end: identity.end,
                covered,
            });
        }

        context.paging.init()?;
        context
            .paging
            .map_range(identity.start as usize, identity.end as usize, true)?;

        context.interrupts.build(
            context.configuration.fault_policy(),
            context.configuration.code_selector(),
            &context.handlers,
        );

        // SAFETY: the table is borrowed for the lifetime of the harness
        unsafe { context.interrupts.load(&mut context.processor) };

        if context.configuration.enable_paging() {
            // SAFETY: the identity range covers the harness and the target
            unsafe { context.paging.enable(&mut context.processor)? };
        }

        info!(
            "Initialized with {} identity mapped pages",
            context.paging.mapped_pages()
        );

        self.state = DriverState::Handshake;

        Ok(())
    }

    /// Announce the harness to the hypervisor and register the payload buffer and coverage
    /// range
    pub fn handshake(&mut self) -> Result<HostConfig> {
        let context = &mut self.context;
        let coverage = context.configuration.coverage();

        if coverage.is_empty() {
            return Err(HarnessError::EmptyCoverageRange {
                start: coverage.start,
                end: coverage.end,
            });
        }

        let region = context.payload.region_size();
        let host = context
            .client
            .handshake(&context.configuration, region as u32)?;

        let required = host.payload_buffer_size as usize;

        if region < required {
            return Err(HarnessError::PayloadBufferTooSmall {
                capacity: region,
                required,
            });
        }

        if context.paging.enabled() {
            let start = context.payload.address();
            context.paging.map_range(start, start + region, true)?;
        }

        context.client.get_payload(&context.payload);
        context
            .client
            .submit_mode(context.configuration.submit_mode());
        context.client.submit_range(&coverage)?;

        let baseline = Baseline::new(context.sanitizer.live(), context.paging.mapped_pages());

        debug!("Recorded baseline {baseline:?}");

        self.baseline = Some(baseline);
        self.state = DriverState::WaitPayload;

        Ok(host)
    }

    /// Run the target against one payload
    ///
    /// An `Err` leaves the iteration acquired and must be escalated through
    /// [`crate::agent::escalate`]; later calls fail with
    /// [`HarnessError::IterationUnfinished`].
    pub fn iteration<T>(&mut self, target: &mut T) -> Result<()>
    where
        T: Target + ?Sized,
    {
        match self.state {
            DriverState::WaitPayload => {}
            DriverState::Init | DriverState::Handshake => {
                return Err(HarnessError::HandshakeIncomplete)
            }
            state => return Err(HarnessError::IterationUnfinished { state }),
        }

        self.context.client.next_payload()?;
        self.context.client.acquire()?;
        self.state = DriverState::Acquired;

        trace!(
            "Iteration {} with {} byte payload",
            self.iterations,
            self.context.payload.len()
        );

        self.state = DriverState::RunTarget;
        target.run(&mut self.context.iteration());

        if self.context.configuration.check_canaries_on_release() {
            self.context.sanitizer.check()?;
        }

        self.state = DriverState::Release;
        self.context.client.release()?;
        self.iterations += 1;

        self.check_leaks();

        self.state = DriverState::WaitPayload;

        Ok(())
    }

    fn check_leaks(&self) {
        let Some(baseline) = self.baseline else {
            return;
        };

        let live = self.context.sanitizer.live();
        let mapped = self.context.paging.mapped_pages();

        if live > baseline.live_allocations() {
            warn!(
                "Iteration {} leaked {} allocations",
                self.iterations,
                live - baseline.live_allocations()
            );
        }

        if mapped != baseline.mapped_pages() {
            warn!(
                "Iteration {} left {mapped} pages present, {} after handshake",
                self.iterations,
                baseline.mapped_pages()
            );
        }
    }

    /// Run iterations forever. Errors end the campaign through the hypervisor.
    pub fn run<T>(&mut self, target: &mut T) -> !
    where
        T: Target + ?Sized,
    {
        loop {
            if let Err(e) = self.iteration(target) {
                error!("Iteration {} failed: {e}", self.iterations);
                escalate(self.context.client.transport(), &e);
            }
        }
    }

    fn setup<B>(&mut self, bios: Option<&mut B>) -> Result<()>
    where
        B: Bios + ?Sized,
    {
        if let Some(bios) = bios {
            self.bring_up(bios)?;
        }

        self.initialize()?;
        self.handshake()?;

        Ok(())
    }

    /// Bring the harness up and run the target forever
    pub fn start<B, T>(&mut self, bios: Option<&mut B>, target: &mut T) -> !
    where
        B: Bios + ?Sized,
        T: Target + ?Sized,
    {
        if let Err(e) = self.setup(bios) {
            error!("Harness setup failed in state {}: {e}", self.state);
            escalate(self.context.client.transport(), &e);
        }

        self.run(target)
    }
}
