// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use bootfuzz::{
    disk::{
        DiskGeometry, Disposition, DriveParameters, LinearMemory, RegisterState, VirtualDisk,
        DRIVE_PARAMETERS_SIZE, SECTOR_SIZE,
    },
    payload::PayloadBuffer,
    Iteration,
};
use tests::{
    aligned_region, configuration, fill_payload, ready_driver, raw_buffer_configuration,
    GuestMemory, MockHypervisor,
};

const PACKET: u32 = 0x0600;
const BUFFER: u32 = 0x8000;

fn disk() -> VirtualDisk {
    VirtualDisk::new(0x80, DiskGeometry::default(), true)
}

/// A payload of `sectors` sectors, each byte identifying its position
fn payload(sectors: usize) -> PayloadBuffer<'static> {
    let buffer = PayloadBuffer::new(aligned_region(4)).expect("aligned region");
    let data = (0..sectors * SECTOR_SIZE)
        .map(|i| (i / SECTOR_SIZE * 31 + i) as u8)
        .collect::<Vec<_>>();
    fill_payload(&buffer, &data);
    buffer
}

fn write_packet(memory: &mut GuestMemory, size: u8, count: u16, buffer: (u16, u16), lba: u64) {
    let mut packet = vec![size, 0];
    packet.extend_from_slice(&count.to_le_bytes());
    packet.extend_from_slice(&buffer.1.to_le_bytes());
    packet.extend_from_slice(&buffer.0.to_le_bytes());
    packet.extend_from_slice(&lba.to_le_bytes());
    memory.write(PACKET, &packet);
}

fn request(function: u8) -> RegisterState {
    RegisterState {
        eax: (function as u32) << 8,
        edx: 0x80,
        ds: (PACKET >> 4) as u16,
        esi: PACKET & 0xf,
        ..Default::default()
    }
}

#[test]
fn test_extended_read_copies_exact_range() {
    let mut payload = payload(6);
    let mut memory = GuestMemory::new();
    let expected = payload.data()[SECTOR_SIZE..3 * SECTOR_SIZE].to_vec();

    write_packet(&mut memory, 0x10, 2, ((BUFFER >> 4) as u16, 0), 1);
    let mut regs = request(0x42);

    assert_eq!(
        disk().service(&mut regs, &mut memory, &mut payload),
        Disposition::Handled
    );
    assert!(!regs.carry());
    assert_eq!(regs.ah(), 0);

    let start = BUFFER as usize;
    assert_eq!(&memory.bytes[start..start + 2 * SECTOR_SIZE], &expected[..]);
    assert!(memory.bytes[start + 2 * SECTOR_SIZE..start + 3 * SECTOR_SIZE]
        .iter()
        .all(|b| *b == 0));
}

#[test]
fn test_read_past_payload_fails_without_copy() {
    let mut payload = payload(4);

    for (lba, count) in [(3u64, 2u16), (4, 1), (0, 5), (u64::MAX, 1), (u64::MAX / 256, 2)] {
        let mut memory = GuestMemory::new();
        write_packet(&mut memory, 0x10, count, ((BUFFER >> 4) as u16, 0), lba);
        let mut regs = request(0x42);

        assert_eq!(
            disk().service(&mut regs, &mut memory, &mut payload),
            Disposition::Handled
        );
        assert!(regs.carry(), "lba {lba:#x} count {count} should fail");
        assert_eq!(regs.ah(), 0x04);
        assert_eq!(memory.read_u16(PACKET + 2), 0);
        assert!(memory.bytes[BUFFER as usize..].iter().all(|b| *b == 0));
    }
}

#[test]
fn test_read_of_whole_payload() {
    let mut payload = payload(4);
    let mut memory = GuestMemory::new();
    write_packet(&mut memory, 0x10, 4, ((BUFFER >> 4) as u16, 0), 0);
    let mut regs = request(0x42);

    disk().service(&mut regs, &mut memory, &mut payload);

    assert!(!regs.carry());
    assert_eq!(memory.read_u16(PACKET + 2), 4);
    assert_eq!(
        &memory.bytes[BUFFER as usize..BUFFER as usize + 4 * SECTOR_SIZE],
        payload.data()
    );
}

#[test]
fn test_flat_buffer_address() {
    let mut payload = payload(2);
    let mut memory = GuestMemory::new();
    let flat = 0x0010_0000u64;

    write_packet(&mut memory, 0x18, 1, (0xffff, 0xffff), 1);
    memory.write(PACKET + 0x10, &flat.to_le_bytes());
    let mut regs = request(0x42);

    disk().service(&mut regs, &mut memory, &mut payload);

    assert!(!regs.carry());
    assert_eq!(
        &memory.bytes[flat as usize..flat as usize + SECTOR_SIZE],
        &payload.data()[SECTOR_SIZE..]
    );
}

#[test]
fn test_extended_write_updates_payload() {
    let mut payload = payload(2);
    let mut memory = GuestMemory::new();
    memory.write(BUFFER, &[0xee; SECTOR_SIZE]);

    write_packet(&mut memory, 0x10, 1, ((BUFFER >> 4) as u16, 0), 0);
    let mut regs = request(0x43);

    disk().service(&mut regs, &mut memory, &mut payload);

    assert!(!regs.carry());
    assert!(payload.data()[..SECTOR_SIZE].iter().all(|b| *b == 0xee));
    assert!(payload.data()[SECTOR_SIZE..].iter().any(|b| *b != 0xee));
}

#[test]
fn test_drive_parameters() {
    let mut payload = payload(1);
    let mut memory = GuestMemory::new();
    memory.write_u16(PACKET, 0x1e);
    let mut regs = request(0x48);

    disk().service(&mut regs, &mut memory, &mut payload);

    assert!(!regs.carry());
    let mut bytes = [0; DRIVE_PARAMETERS_SIZE as usize];
    memory.read(PACKET, &mut bytes);
    let parameters = DriveParameters::from_bytes(&bytes);
    assert_eq!(parameters.size, DRIVE_PARAMETERS_SIZE);
    assert_eq!(parameters.heads, 16);
    assert_eq!(parameters.sectors_per_track, 63);
    assert_eq!(parameters.cylinders, 1024);
    assert_eq!(parameters.bytes_per_sector, 512);
    assert_eq!(
        parameters.total_sectors,
        (payload.capacity() / SECTOR_SIZE) as u64
    );

    memory.write_u16(PACKET, 0x18);
    let mut regs = request(0x48);
    disk().service(&mut regs, &mut memory, &mut payload);
    assert!(regs.carry());
    assert_eq!(regs.ah(), 0x01);
}

#[test]
fn test_installation_check_and_unsupported_functions() {
    let mut payload = payload(1);
    let mut memory = GuestMemory::new();

    let mut regs = request(0x41);
    regs.ebx = 0x55aa;
    disk().service(&mut regs, &mut memory, &mut payload);
    assert!(!regs.carry());
    assert_eq!(regs.bx(), 0xaa55);
    assert_eq!(regs.ah(), 0x30);
    assert_eq!(regs.ecx & 0xffff, 1);

    let mut regs = request(0x00);
    regs.efl = 1;
    disk().service(&mut regs, &mut memory, &mut payload);
    assert!(!regs.carry());

    for function in [0x02u8, 0x08, 0x15, 0x44, 0x47] {
        let mut regs = request(function);
        assert_eq!(
            disk().service(&mut regs, &mut memory, &mut payload),
            Disposition::Handled
        );
        assert!(regs.carry());
        assert_eq!(regs.ah(), 0x01);
    }
}

#[test]
fn test_other_drives_and_raw_delivery_pass_through() {
    let mut payload = payload(1);
    let mut memory = GuestMemory::new();
    write_packet(&mut memory, 0x10, 1, ((BUFFER >> 4) as u16, 0), 0);

    for drive in [0x00u32, 0x81, 0xe0] {
        let mut regs = request(0x42);
        regs.edx = drive;
        assert_eq!(
            disk().service(&mut regs, &mut memory, &mut payload),
            Disposition::PassThrough
        );
        assert_eq!(regs, RegisterState { edx: drive, ..request(0x42) });
    }

    let inactive = VirtualDisk::new(0x80, DiskGeometry::default(), false);
    let mut regs = request(0x42);
    assert_eq!(
        inactive.service(&mut regs, &mut memory, &mut payload),
        Disposition::PassThrough
    );
    assert!(memory.bytes[BUFFER as usize..].iter().all(|b| *b == 0));
}

#[test]
fn test_iteration_serves_disk_from_payload() -> Result<()> {
    let hypervisor = MockHypervisor::builder().build().leak();
    let mut driver = ready_driver(hypervisor, configuration());
    let image = (0..SECTOR_SIZE * 2).map(|i| i as u8).collect::<Vec<_>>();
    hypervisor.queue_payload(&image);

    let mut memory = GuestMemory::new();
    write_packet(&mut memory, 0x10, 1, ((BUFFER >> 4) as u16, 0), 1);

    driver.iteration(&mut |it: &mut Iteration<'_, '_>| {
        assert!(it.payload().is_none());
        let mut regs = request(0x42);
        assert_eq!(it.disk_service(&mut regs, &mut memory), Disposition::Handled);
        assert!(!regs.carry());
    })?;

    assert_eq!(
        &memory.bytes[BUFFER as usize..BUFFER as usize + SECTOR_SIZE],
        &image[SECTOR_SIZE..]
    );

    Ok(())
}

#[test]
fn test_raw_delivery_exposes_buffer() -> Result<()> {
    let hypervisor = MockHypervisor::builder().build().leak();
    let mut driver = ready_driver(hypervisor, raw_buffer_configuration());
    hypervisor.queue_payload(b"\x7fELF");

    let mut memory = GuestMemory::new();
    let mut seen = Vec::new();

    driver.iteration(&mut |it: &mut Iteration<'_, '_>| {
        seen = it.payload().map(<[u8]>::to_vec).unwrap_or_default();
        let mut regs = request(0x42);
        assert_eq!(
            it.disk_service(&mut regs, &mut memory),
            Disposition::PassThrough
        );
    })?;

    assert_eq!(seen, b"\x7fELF");

    Ok(())
}
