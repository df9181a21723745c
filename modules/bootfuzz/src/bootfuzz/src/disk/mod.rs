// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Legacy disk service (INT 13h) backed by the payload buffer
//!
//! The target believes it is reading a hard disk. Requests for the configured drive are
//! served from the current payload, requests for every other drive are passed through to
//! the firmware. Only the extended (LBA) calls are supported: the installation check
//! advertises them, so targets do not fall back to CHS addressing.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::payload::PayloadBuffer;

/// Carry flag in the flags register, set on failure
pub const CARRY_FLAG: u32 = 1 << 0;
pub const SECTOR_SIZE: usize = 512;

/// Minimum size of the extended drive parameters result buffer
pub const DRIVE_PARAMETERS_SIZE: u16 = 0x1a;
/// Disk address packet size without the flat buffer address
pub const PACKET_SIZE: u8 = 0x10;
/// Disk address packet size with the EDD 3.0 flat buffer address
pub const PACKET_SIZE_FLAT: u8 = 0x18;

/// Status codes returned in AH
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_FUNCTION: u8 = 0x01;
    pub const SECTOR_NOT_FOUND: u8 = 0x04;
}

/// Sub-functions selected by AH
pub mod function {
    pub const RESET: u8 = 0x00;
    pub const CHECK_EXTENSIONS: u8 = 0x41;
    pub const EXTENDED_READ: u8 = 0x42;
    pub const EXTENDED_WRITE: u8 = 0x43;
    pub const DRIVE_PARAMETERS: u8 = 0x48;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Register file exchanged with real-mode software interrupts
pub struct RegisterState {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub efl: u32,
    pub es: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

impl RegisterState {
    pub fn ah(&self) -> u8 {
        (self.eax >> 8) as u8
    }

    pub fn set_ah(&mut self, value: u8) {
        self.eax = (self.eax & !0xff00) | (value as u32) << 8;
    }

    pub fn dl(&self) -> u8 {
        self.edx as u8
    }

    pub fn bx(&self) -> u16 {
        self.ebx as u16
    }

    pub fn set_bx(&mut self, value: u16) {
        self.ebx = (self.ebx & !0xffff) | value as u32;
    }

    pub fn set_cx(&mut self, value: u16) {
        self.ecx = (self.ecx & !0xffff) | value as u32;
    }

    pub fn carry(&self) -> bool {
        self.efl & CARRY_FLAG != 0
    }

    /// Linear address of `DS:SI`
    pub fn ds_si(&self) -> u32 {
        linear(self.ds, self.esi as u16)
    }

    /// Finish a call successfully with `ah` in AH and the carry flag clear
    pub fn succeed(&mut self, ah: u8) {
        self.set_ah(ah);
        self.efl &= !CARRY_FLAG;
    }

    /// Fail a call with `status` in AH and the carry flag set
    pub fn fail(&mut self, status: u8) {
        self.set_ah(status);
        self.efl |= CARRY_FLAG;
    }
}

/// Real-mode segment:offset to linear address
pub const fn linear(segment: u16, offset: u16) -> u32 {
    (segment as u32) * 16 + offset as u32
}

/// Memory addressed by the caller of a real-mode service
pub trait LinearMemory {
    fn read(&self, address: u32, buffer: &mut [u8]);
    fn write(&mut self, address: u32, data: &[u8]);

    fn read_u16(&self, address: u32) -> u16 {
        let mut bytes = [0; 2];
        self.read(address, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    fn write_u16(&mut self, address: u32, value: u16) {
        self.write(address, &value.to_le_bytes());
    }
}

/// Low memory accessed directly, for identity-mapped bare-metal use
pub struct IdentityMemory(());

impl IdentityMemory {
    /// # Safety
    ///
    /// Every address passed to the returned accessor must be identity mapped and valid for
    /// the access.
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

impl LinearMemory for IdentityMemory {
    fn read(&self, address: u32, buffer: &mut [u8]) {
        // SAFETY: guaranteed by the constructor's contract
        unsafe {
            core::ptr::copy(address as usize as *const u8, buffer.as_mut_ptr(), buffer.len())
        }
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        // SAFETY: guaranteed by the constructor's contract
        unsafe { core::ptr::copy(data.as_ptr(), address as usize as *mut u8, data.len()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Extended read/write request
///
/// Layout in memory: size (u8), reserved (u8), sector count (u16), buffer offset (u16),
/// buffer segment (u16), starting LBA (u64) and, for 0x18-byte packets, a flat 64-bit
/// buffer address.
pub struct DiskAddressPacket {
    pub size: u8,
    pub count: u16,
    pub offset: u16,
    pub segment: u16,
    pub lba: u64,
    pub flat: Option<u64>,
}

impl DiskAddressPacket {
    /// Offset of the sector count, rewritten with the number of sectors transferred
    pub const COUNT_OFFSET: u32 = 2;

    pub fn read<M>(memory: &M, address: u32) -> Self
    where
        M: LinearMemory + ?Sized,
    {
        let mut bytes = [0u8; PACKET_SIZE as usize];
        memory.read(address, &mut bytes);

        let [size, _, c0, c1, o0, o1, s0, s1, lba @ ..] = bytes;

        let flat = (size >= PACKET_SIZE_FLAT).then(|| {
            let mut flat = [0u8; 8];
            memory.read(address + PACKET_SIZE as u32, &mut flat);
            u64::from_le_bytes(flat)
        });

        Self {
            size,
            count: u16::from_le_bytes([c0, c1]),
            offset: u16::from_le_bytes([o0, o1]),
            segment: u16::from_le_bytes([s0, s1]),
            lba: u64::from_le_bytes(lba),
            flat,
        }
    }

    /// Linear address of the caller's buffer
    pub fn buffer(&self) -> Option<u32> {
        match self.flat {
            Some(flat) if self.segment == 0xffff && self.offset == 0xffff => {
                u32::try_from(flat).ok()
            }
            _ => Some(linear(self.segment, self.offset)),
        }
    }

    /// Byte range of the payload the request covers
    pub fn span(&self) -> Option<(usize, usize)> {
        let start = self.lba.checked_mul(SECTOR_SIZE as u64)?;
        let end = self
            .lba
            .checked_add(self.count as u64)?
            .checked_mul(SECTOR_SIZE as u64)?;

        Some((usize::try_from(start).ok()?, usize::try_from(end).ok()?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// EDD result buffer of get drive parameters
pub struct DriveParameters {
    pub size: u16,
    pub flags: u16,
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub total_sectors: u64,
    pub bytes_per_sector: u16,
}

impl DriveParameters {
    /// The geometry fields are valid
    pub const GEOMETRY_VALID: u16 = 1 << 1;

    pub fn to_bytes(&self) -> [u8; DRIVE_PARAMETERS_SIZE as usize] {
        let mut bytes = [0; DRIVE_PARAMETERS_SIZE as usize];
        bytes[0..2].copy_from_slice(&self.size.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.cylinders.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.heads.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.total_sectors.to_le_bytes());
        bytes[24..26].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DRIVE_PARAMETERS_SIZE as usize]) -> Self {
        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let dword = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        Self {
            size: word(0),
            flags: word(2),
            cylinders: dword(4),
            heads: dword(8),
            sectors_per_track: dword(12),
            total_sectors: dword(16) as u64 | (dword(20) as u64) << 32,
            bytes_per_sector: word(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Geometry reported by get drive parameters
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self {
            cylinders: 1024,
            heads: 16,
            sectors_per_track: 63,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the integration's INT 13h hook should do after [`VirtualDisk::service`]
pub enum Disposition {
    /// The request was answered, return to the caller with the updated registers
    Handled,
    /// Forward the request to the firmware unchanged
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualDisk {
    drive: u8,
    geometry: DiskGeometry,
    active: bool,
}

impl VirtualDisk {
    pub const fn new(drive: u8, geometry: DiskGeometry, active: bool) -> Self {
        Self {
            drive,
            geometry,
            active,
        }
    }

    pub fn drive(&self) -> u8 {
        self.drive
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Serve one INT 13h request
    pub fn service<M>(
        &self,
        regs: &mut RegisterState,
        memory: &mut M,
        payload: &mut PayloadBuffer<'_>,
    ) -> Disposition
    where
        M: LinearMemory + ?Sized,
    {
        if !self.active || regs.dl() != self.drive {
            return Disposition::PassThrough;
        }

        let function = regs.ah();

        let result = match function {
            function::RESET => Ok(status::SUCCESS),
            function::CHECK_EXTENSIONS => Self::check_extensions(regs),
            function::EXTENDED_READ => Self::transfer(regs, memory, payload, false),
            function::EXTENDED_WRITE => Self::transfer(regs, memory, payload, true),
            function::DRIVE_PARAMETERS => self.drive_parameters(regs, memory, payload),
            _ => Err(status::INVALID_FUNCTION),
        };

        trace!("INT 13h AH={function:#04x} -> {result:x?}");

        match result {
            Ok(ah) => regs.succeed(ah),
            Err(status) => regs.fail(status),
        }

        Disposition::Handled
    }

    fn check_extensions(regs: &mut RegisterState) -> Result<u8, u8> {
        if regs.bx() != 0x55aa {
            return Err(status::INVALID_FUNCTION);
        }

        regs.set_bx(0xaa55);
        // Fixed disk access subset only
        regs.set_cx(0x0001);
        // EDD 3.0
        Ok(0x30)
    }

    fn transfer<M>(
        regs: &mut RegisterState,
        memory: &mut M,
        payload: &mut PayloadBuffer<'_>,
        write: bool,
    ) -> Result<u8, u8>
    where
        M: LinearMemory + ?Sized,
    {
        let address = regs.ds_si();
        let packet = DiskAddressPacket::read(memory, address);

        if packet.size < PACKET_SIZE {
            return Err(status::INVALID_FUNCTION);
        }

        let range = packet
            .span()
            .filter(|(_, end)| *end <= payload.len())
            .zip(packet.buffer());

        let Some(((start, end), buffer)) = range else {
            memory.write_u16(address + DiskAddressPacket::COUNT_OFFSET, 0);
            return Err(status::SECTOR_NOT_FOUND);
        };

        if write {
            memory.read(buffer, &mut payload.data_mut()[start..end]);
        } else {
            memory.write(buffer, &payload.data()[start..end]);
        }

        Ok(status::SUCCESS)
    }

    fn drive_parameters<M>(
        &self,
        regs: &mut RegisterState,
        memory: &mut M,
        payload: &PayloadBuffer<'_>,
    ) -> Result<u8, u8>
    where
        M: LinearMemory + ?Sized,
    {
        let address = regs.ds_si();

        if memory.read_u16(address) < DRIVE_PARAMETERS_SIZE {
            return Err(status::INVALID_FUNCTION);
        }

        let parameters = DriveParameters {
            size: DRIVE_PARAMETERS_SIZE,
            flags: DriveParameters::GEOMETRY_VALID,
            cylinders: self.geometry.cylinders,
            heads: self.geometry.heads,
            sectors_per_track: self.geometry.sectors_per_track,
            total_sectors: (payload.capacity() / SECTOR_SIZE) as u64,
            bytes_per_sector: SECTOR_SIZE as u16,
        };

        memory.write(address, &parameters.to_bytes());

        Ok(status::SUCCESS)
    }
}
