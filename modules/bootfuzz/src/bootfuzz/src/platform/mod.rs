// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Firmware services used while bringing the platform up

use core::mem::size_of;

use log::{debug, trace};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::{
    disk::{LinearMemory, RegisterState},
    error::{HarnessError, Result},
};

/// Signature passed in and returned from the memory map query
pub const SMAP: u32 = u32::from_be_bytes(*b"SMAP");
/// Miscellaneous system services interrupt
pub const SYSTEM_SERVICES: u8 = 0x15;

/// Real-mode firmware
pub trait Bios: LinearMemory {
    /// Invoke software interrupt `vector` with `regs` swapped into the registers. The
    /// registers after the interrupt are written back to `regs`.
    ///
    /// # Safety
    ///
    /// The firmware must be able to run, and any memory it is told to write must be
    /// unused by the harness.
    unsafe fn interrupt(&mut self, vector: u8, regs: &mut RegisterState);
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// Trampoline provided by the integration: drops to real mode, raises the interrupt
    /// and returns to protected mode
    fn bootfuzz_invoke_realmode(vector: u8, regs: *mut RegisterState);
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub struct RealModeBios {
    memory: crate::disk::IdentityMemory,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl RealModeBios {
    /// # Safety
    ///
    /// Paging must be disabled or low memory identity mapped, and the integration must
    /// link a `bootfuzz_invoke_realmode` trampoline.
    pub const unsafe fn new() -> Self {
        Self {
            memory: crate::disk::IdentityMemory::new(),
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl LinearMemory for RealModeBios {
    fn read(&self, address: u32, buffer: &mut [u8]) {
        self.memory.read(address, buffer)
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        self.memory.write(address, data)
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl Bios for RealModeBios {
    unsafe fn interrupt(&mut self, vector: u8, regs: &mut RegisterState) {
        bootfuzz_invoke_realmode(vector, regs);
    }
}

/// Enable the A20 line through the firmware
pub fn enable_a20<B>(bios: &mut B) -> Result<()>
where
    B: Bios + ?Sized,
{
    let mut regs = RegisterState {
        eax: 0x2401,
        ..Default::default()
    };

    // SAFETY: the A20 service touches no memory
    unsafe { bios.interrupt(SYSTEM_SERVICES, &mut regs) };

    if regs.carry() {
        return Err(HarnessError::A20Unavailable { status: regs.ah() });
    }

    debug!("A20 line enabled");

    Ok(())
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MemoryKind {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    Bad = 5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Raw memory map entry as written by the firmware
pub struct E820Entry {
    pub base: u64,
    pub size: u64,
    pub kind: u32,
}

impl E820Entry {
    pub const SIZE: usize = size_of::<u64>() * 2 + size_of::<u32>();

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let (mut base, mut size, mut kind) = ([0; 8], [0; 8], [0; 4]);
        base.copy_from_slice(&bytes[0..8]);
        size.copy_from_slice(&bytes[8..16]);
        kind.copy_from_slice(&bytes[16..20]);

        Self {
            base: u64::from_le_bytes(base),
            size: u64::from_le_bytes(size),
            kind: u32::from_le_bytes(kind),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.base.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.kind.to_le_bytes());
        bytes
    }

    pub fn kind(&self) -> Option<MemoryKind> {
        MemoryKind::from_u32(self.kind)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// The firmware's memory map, at most `N` entries
pub struct MemoryMap<const N: usize> {
    entries: [E820Entry; N],
    len: usize,
}

impl<const N: usize> MemoryMap<N> {
    pub const fn new() -> Self {
        Self {
            entries: [E820Entry {
                base: 0,
                size: 0,
                kind: 0,
            }; N],
            len: 0,
        }
    }

    fn push(&mut self, entry: E820Entry) -> Result<()> {
        let slot = self
            .entries
            .get_mut(self.len)
            .ok_or(HarnessError::MemoryMapOverflow { capacity: N })?;
        *slot = entry;
        self.len += 1;
        Ok(())
    }

    pub fn entries(&self) -> &[E820Entry] {
        &self.entries[..self.len]
    }

    /// Entries describing usable RAM
    pub fn usable(&self) -> impl Iterator<Item = &E820Entry> {
        self.entries()
            .iter()
            .filter(|e| e.kind() == Some(MemoryKind::Usable))
    }

    /// End of the highest usable range
    pub fn highest_usable(&self) -> Option<u64> {
        self.usable().map(E820Entry::end).max()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for MemoryMap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Query the firmware memory map. Each entry is written by the firmware to `scratch`,
/// which must be below 1 MiB and unused. Firmware that keeps returning entries after
/// `4 * N` calls is treated as an overflow.
pub fn discover_memory<const N: usize, B>(bios: &mut B, scratch: u32) -> Result<MemoryMap<N>>
where
    B: Bios + ?Sized,
{
    let mut map = MemoryMap::new();
    let mut regs = RegisterState::default();

    for _ in 0..N.saturating_mul(4) {
        regs.eax = 0xe820;
        regs.ecx = E820Entry::SIZE as u32;
        regs.edx = SMAP;
        regs.es = (scratch >> 4) as u16;
        regs.edi = scratch & 0xf;

        // SAFETY: the caller guarantees `scratch` is unused low memory
        unsafe { bios.interrupt(SYSTEM_SERVICES, &mut regs) };

        if regs.carry() || regs.eax != SMAP {
            return Err(HarnessError::MemoryMapUnavailable { status: regs.ah() });
        }

        let mut bytes = [0; E820Entry::SIZE];
        bios.read(scratch, &mut bytes);
        let entry = E820Entry::from_bytes(&bytes);

        trace!(
            "E820 {:#x}..{:#x} kind {}",
            entry.base,
            entry.end(),
            entry.kind
        );

        if entry.size > 0 {
            map.push(entry)?;
        }

        if regs.ebx == 0 {
            debug!("Discovered {} memory map entries", map.len());
            return Ok(map);
        }
    }

    Err(HarnessError::MemoryMapOverflow { capacity: N })
}
