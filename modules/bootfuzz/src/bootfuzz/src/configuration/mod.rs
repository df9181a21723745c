// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

use getters::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    disk::DiskGeometry,
    hypercall::{SubmitMode, AGENT_MAGIC, AGENT_VERSION, HOST_MAGIC, HOST_VERSION},
    interrupts::FaultPolicy,
};

impl HarnessConfiguration {
    /// Size of the coverage bitmap requested from the hypervisor
    pub const DEFAULT_COVERAGE_BITMAP_SIZE: u32 = 0x10000;
    /// Drive number of the first fixed disk
    pub const DEFAULT_DRIVE_NUMBER: u8 = 0x80;
    /// Flat 32-bit code segment selector set up by typical protected mode bootloaders
    pub const DEFAULT_CODE_SELECTOR: u16 = 0x08;
    /// The target's image, stack and low memory all live below 16 MiB
    pub const DEFAULT_IDENTITY_MAP_END: u64 = 0x0100_0000;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Code region submitted for coverage tracing
pub struct CoverageRange {
    pub start: u64,
    pub end: u64,
    /// Third word of the range submission
    pub flags: u64,
}

impl CoverageRange {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// How the target receives the payload
pub enum Delivery {
    #[default]
    /// As the contents of a disk through the INT 13h shim
    VirtualDisk,
    /// As a raw buffer the target reads itself
    RawBuffer,
}

#[derive(TypedBuilder, Getters, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[getters(deref)]
#[serde(default)]
pub struct HarnessConfiguration {
    #[builder(default = HOST_MAGIC)]
    /// Magic the host configuration must carry
    host_magic: u32,
    #[builder(default = HOST_VERSION)]
    host_version: u32,
    #[builder(default = AGENT_MAGIC)]
    agent_magic: u32,
    #[builder(default = AGENT_VERSION)]
    agent_version: u32,
    #[builder(default = false)]
    /// Whether the agent records coverage itself instead of relying on hypervisor tracing
    agent_tracing: bool,
    #[builder(default = false)]
    timeout_detection: bool,
    #[builder(default = true)]
    /// The target is not reloaded between iterations
    non_reload_mode: bool,
    #[builder(default = HarnessConfiguration::DEFAULT_COVERAGE_BITMAP_SIZE)]
    coverage_bitmap_size: u32,
    #[builder(default)]
    submit_mode: SubmitMode,
    #[builder(default)]
    /// The target's load image. Must be set before the handshake.
    coverage: CoverageRange,
    #[builder(default)]
    delivery: Delivery,
    #[builder(default = HarnessConfiguration::DEFAULT_DRIVE_NUMBER)]
    /// Drive served from the payload
    drive_number: u8,
    #[builder(default)]
    geometry: DiskGeometry,
    #[builder(default)]
    fault_policy: FaultPolicy,
    #[builder(default = HarnessConfiguration::DEFAULT_CODE_SELECTOR)]
    /// Code segment selector written into every interrupt gate
    code_selector: u16,
    #[builder(default = MemoryRange { start: 0, end: HarnessConfiguration::DEFAULT_IDENTITY_MAP_END })]
    /// Range mapped present before paging is enabled
    identity_map: MemoryRange,
    #[builder(default = true)]
    enable_paging: bool,
    #[builder(default = true)]
    /// Verify every live allocation's canary before each release
    check_canaries_on_release: bool,
}

impl Default for HarnessConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}
