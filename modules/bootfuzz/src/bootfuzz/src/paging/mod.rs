// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! 32-bit two-level paging scaffold
//!
//! One page directory and `TABLES` page tables are allocated statically, covering
//! `TABLES * 4 MiB` from address zero. Every table entry is pre-populated with its
//! identity frame, so after initialization the only thing that ever changes is whether a
//! page is present. Unmapping a page the target later touches turns the access into a
//! page fault, which the interrupt table reports as a crash.

use log::{debug, trace};

use crate::{
    arch::Processor,
    error::{HarnessError, Result},
};

/// Size of one page and of every paging structure
pub const PAGE_SIZE: usize = 4096;
/// Entries in one directory or table
pub const ENTRIES: usize = 1024;
/// Bytes mapped by one page table
pub const TABLE_COVERAGE: usize = PAGE_SIZE * ENTRIES;

pub const PAGE_PRESENT: u32 = 1 << 0;
pub const PAGE_WRITE: u32 = 1 << 1;

const FRAME_MASK: u32 = !(PAGE_SIZE as u32 - 1);

#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct PageTable {
    entries: [u32; ENTRIES],
}

#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct PageDirectory {
    entries: [u32; ENTRIES],
}

impl PageTable {
    const fn empty() -> Self {
        Self {
            entries: [0; ENTRIES],
        }
    }

    pub fn entries(&self) -> &[u32; ENTRIES] {
        &self.entries
    }
}

impl PageDirectory {
    const fn empty() -> Self {
        Self {
            entries: [0; ENTRIES],
        }
    }

    pub fn entries(&self) -> &[u32; ENTRIES] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A software translation hit a non-present entry
pub struct PageFault {
    pub address: usize,
    /// The directory entry was absent, as opposed to the table entry
    pub directory: bool,
}

/// Paging structures covering the first `TABLES * 4 MiB` of the address space
pub struct PagingScaffold<const TABLES: usize> {
    directory: PageDirectory,
    tables: [PageTable; TABLES],
    mapped: usize,
    initialized: bool,
    enabled: bool,
}

impl<const TABLES: usize> PagingScaffold<TABLES> {
    const VALID: () = assert!(TABLES > 0 && TABLES <= ENTRIES);

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;

        Self {
            directory: PageDirectory::empty(),
            tables: [PageTable::empty(); TABLES],
            mapped: 0,
            initialized: false,
            enabled: false,
        }
    }

    /// Wire the directory to every table and pre-populate every table entry with its
    /// identity frame, writable and not present
    pub fn init(&mut self) -> Result<()> {
        let directory = &self.directory as *const PageDirectory as usize;

        if directory % PAGE_SIZE != 0 {
            return Err(HarnessError::Misaligned {
                what: "Page directory",
                address: directory,
                alignment: PAGE_SIZE,
            });
        }

        for (index, table) in self.tables.iter_mut().enumerate() {
            let address = table as *const PageTable as usize;

            if address % PAGE_SIZE != 0 {
                return Err(HarnessError::Misaligned {
                    what: "Page table",
                    address,
                    alignment: PAGE_SIZE,
                });
            }

            let base = index * TABLE_COVERAGE;

            table
                .entries
                .iter_mut()
                .enumerate()
                .for_each(|(page, entry)| *entry = (base + page * PAGE_SIZE) as u32 | PAGE_WRITE);

            self.directory.entries[index] = (address as u32 & FRAME_MASK) | PAGE_WRITE | PAGE_PRESENT;
        }

        self.directory.entries[TABLES..].fill(0);
        self.mapped = 0;
        self.initialized = true;

        debug!(
            "Initialized {TABLES} page tables covering {:#x} bytes",
            self.covered()
        );

        Ok(())
    }

    /// Load the directory and turn paging on, initializing the structures first if needed
    ///
    /// # Safety
    ///
    /// Everything the processor touches after this call (code, stack, interrupt table)
    /// must be mapped, and the scaffold must not move while paging is enabled.
    pub unsafe fn enable<P>(&mut self, processor: &mut P) -> Result<()>
    where
        P: Processor + ?Sized,
    {
        if !self.initialized {
            self.init()?;
        }

        processor.load_page_directory(self.directory_address());
        processor.set_paging(true);
        self.enabled = true;

        debug!("Paging enabled with {} present pages", self.mapped);

        Ok(())
    }

    /// Turn paging off
    ///
    /// # Safety
    ///
    /// The code calling this must be identity mapped.
    pub unsafe fn disable<P>(&mut self, processor: &mut P)
    where
        P: Processor + ?Sized,
    {
        processor.set_paging(false);
        self.enabled = false;
    }

    /// Set the presence of the page containing `address`, returning its previous presence.
    /// `address` must lie inside [`PagingScaffold::covered`]; other addresses are ignored.
    pub fn map_unmap(&mut self, address: usize, present: bool) -> bool {
        let Some(entry) = self.entry_mut(address) else {
            trace!("Ignoring presence change outside coverage at {address:#x}");
            return false;
        };

        let previous = *entry & PAGE_PRESENT != 0;

        if present {
            *entry |= PAGE_PRESENT;
        } else {
            *entry &= !PAGE_PRESENT;
        }

        match (previous, present) {
            (false, true) => self.mapped += 1,
            (true, false) => self.mapped -= 1,
            _ => {}
        }

        previous
    }

    /// Set the presence of every page overlapping `start..end`
    pub fn map_range(&mut self, start: usize, end: usize, present: bool) -> Result<()> {
        if end > self.covered() || start > end {
            return Err(HarnessError::OutsideCoverage {
                start: start as u64,
                end: end as u64,
                covered: self.covered() as u64,
            });
        }

        let first = start & !(PAGE_SIZE - 1);

        (first..end).step_by(PAGE_SIZE).for_each(|page| {
            self.map_unmap(page, present);
        });

        trace!(
            "Set presence {present} for {:#x}..{end:#x}, {} pages present",
            first,
            self.mapped
        );

        Ok(())
    }

    /// Walk the structures the way the processor does
    pub fn translate(&self, address: usize) -> core::result::Result<usize, PageFault> {
        let directory_index = address / TABLE_COVERAGE;

        let directory_entry = self
            .directory
            .entries
            .get(directory_index)
            .copied()
            .unwrap_or(0);

        if directory_entry & PAGE_PRESENT == 0 {
            return Err(PageFault {
                address,
                directory: true,
            });
        }

        let table = &self.tables[directory_index];
        let entry = table.entries[(address / PAGE_SIZE) % ENTRIES];

        if entry & PAGE_PRESENT == 0 {
            return Err(PageFault {
                address,
                directory: false,
            });
        }

        Ok((entry & FRAME_MASK) as usize | (address % PAGE_SIZE))
    }

    pub fn is_present(&self, address: usize) -> bool {
        self.translate(address).is_ok()
    }

    fn entry_mut(&mut self, address: usize) -> Option<&mut u32> {
        self.tables
            .get_mut(address / TABLE_COVERAGE)
            .map(|table| &mut table.entries[(address / PAGE_SIZE) % ENTRIES])
    }

    /// Number of present pages
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Bytes of address space the tables cover
    pub const fn covered(&self) -> usize {
        TABLES * TABLE_COVERAGE
    }

    /// Value loaded into the directory base register
    pub fn directory_address(&self) -> u32 {
        &self.directory as *const PageDirectory as usize as u32
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn tables(&self) -> &[PageTable; TABLES] {
        &self.tables
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl<const TABLES: usize> Default for PagingScaffold<TABLES> {
    fn default() -> Self {
        Self::new()
    }
}

/// Object-safe presence control handed to the target
pub trait PageControl {
    fn map_unmap(&mut self, address: usize, present: bool) -> bool;
    fn mapped_pages(&self) -> usize;
}

impl<const TABLES: usize> PageControl for PagingScaffold<TABLES> {
    fn map_unmap(&mut self, address: usize, present: bool) -> bool {
        PagingScaffold::map_unmap(self, address, present)
    }

    fn mapped_pages(&self) -> usize {
        PagingScaffold::mapped_pages(self)
    }
}
