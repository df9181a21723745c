// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Architecture specific operations
//!
//! The paging scaffold and interrupt table are plain data until they are loaded into the
//! processor. Loading goes through [`Processor`] so the same scaffold code runs on real
//! hardware ([`x86::X86Processor`]) and under test.

pub mod x86;

/// Processor control operations used by the harness
pub trait Processor {
    /// Load the physical address of the page directory into the directory base register
    ///
    /// # Safety
    ///
    /// `directory` must be the physical address of a fully initialized page directory
    /// that stays alive for as long as paging is enabled.
    unsafe fn load_page_directory(&mut self, directory: u32);

    /// Set or clear the paging enable bit
    ///
    /// # Safety
    ///
    /// Enabling paging requires every page the processor touches next (code, stack, the
    /// interrupt table) to be mapped.
    unsafe fn set_paging(&mut self, enabled: bool);

    /// Drop any cached translation for the page containing `address`
    fn invalidate_page(&mut self, address: usize);

    /// Load the interrupt descriptor table register
    ///
    /// # Safety
    ///
    /// `base` must point at `limit + 1` bytes of valid gates that stay alive while
    /// interrupts can be delivered.
    unsafe fn load_interrupt_table(&mut self, base: usize, limit: u16);
}
