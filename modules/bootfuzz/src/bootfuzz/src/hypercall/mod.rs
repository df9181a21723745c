// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Hypercall opcodes and the records exchanged with the hypervisor
//!
//! Each hypercall is a 32-bit opcode plus one pointer or immediate argument. Records
//! passed by pointer use the packed layouts the hypervisor expects.

use core::fmt::Display;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Value placed in the accumulator to mark a `vmcall` as a fuzzing hypercall
pub const HYPERCALL_ID: usize = 0x1f;
/// Magic the hypervisor places at the start of its host configuration ("NyxH")
pub const HOST_MAGIC: u32 = 0x4878_794e;
/// Host configuration layout version this harness understands
pub const HOST_VERSION: u32 = 2;
/// Magic the harness places at the start of its agent configuration ("NyxA")
pub const AGENT_MAGIC: u32 = 0x4178_794e;
/// Agent configuration layout version this harness produces
pub const AGENT_VERSION: u32 = 1;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    Acquire = 0,
    GetPayload = 1,
    Release = 4,
    Panic = 8,
    NextPayload = 12,
    Printf = 13,
    UserSubmitMode = 17,
    UserAbort = 20,
    RangeSubmit = 29,
    GetHostConfig = 35,
    SetAgentConfig = 36,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({})", self, *self as u32)
    }
}

#[repr(u32)]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Default, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
/// Operating mode the guest reports with `USER_SUBMIT_MODE`
pub enum SubmitMode {
    Bits64 = 0,
    #[default]
    Bits32 = 1,
    Bits16 = 2,
}

/// Transport for hypercalls
///
/// Implementations must be usable through a shared reference: the transport is also used
/// by the logger and by fault handlers, which have no access to the harness context.
pub trait Hypercall {
    /// Issue a hypercall the hypervisor returns from, yielding the accumulator
    fn hypercall(&self, opcode: Opcode, argument: usize) -> usize;

    /// Issue a hypercall after which the hypervisor never resumes this context. The
    /// hypervisor restores its snapshot instead, so nothing after this call runs.
    fn hypercall_noreturn(&self, opcode: Opcode, argument: usize) -> !;
}

impl<H> Hypercall for &H
where
    H: Hypercall + ?Sized,
{
    fn hypercall(&self, opcode: Opcode, argument: usize) -> usize {
        (**self).hypercall(opcode, argument)
    }

    fn hypercall_noreturn(&self, opcode: Opcode, argument: usize) -> ! {
        (**self).hypercall_noreturn(opcode, argument)
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Configuration the hypervisor writes through the `GET_HOST_CONFIG` pointer
pub struct HostConfig {
    pub magic: u32,
    pub version: u32,
    pub bitmap_size: u32,
    pub ijon_bitmap_size: u32,
    pub payload_buffer_size: u32,
    pub worker_id: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Configuration the harness sends with `SET_AGENT_CONFIG`
pub struct AgentConfig {
    pub magic: u32,
    pub version: u32,
    pub timeout_detection: u8,
    /// Non-zero when the agent records coverage itself instead of the hypervisor tracing
    pub tracing: u8,
    pub ijon_tracing: u8,
    pub non_reload_mode: u8,
    pub trace_buffer_vaddr: u64,
    pub ijon_trace_buffer_vaddr: u64,
    pub coverage_bitmap_size: u32,
    pub input_buffer_size: u32,
    /// Set by the hypervisor
    pub dump_payloads: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Three-word record passed by pointer with `RANGE_SUBMIT`
pub struct RangeSubmission {
    pub start: u64,
    pub end: u64,
    pub flags: u64,
}
