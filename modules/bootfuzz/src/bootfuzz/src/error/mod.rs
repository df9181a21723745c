// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Harness error definitions
//!
//! Every error the harness can observe falls into one of two classes. Setup errors are
//! bugs or misconfigurations of the harness itself and are reported with the abort
//! hypercall. Target faults mean the current payload crashed the target and are reported
//! with the panic hypercall, which is the signal the fuzzing campaign collects.

use crate::state::DriverState;
use thiserror::Error;

/// Result type used across the harness
pub type Result<T> = core::result::Result<T, HarnessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How an error is escalated to the hypervisor
pub enum ErrorClass {
    /// The harness is broken or misconfigured. Reported with `USER_ABORT`.
    Setup,
    /// The current input crashed the target. Reported with `PANIC`.
    TargetFault,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessError {
    #[error("Host magic {found:#010x} does not match expected magic {expected:#010x}")]
    HostMagicMismatch { expected: u32, found: u32 },
    #[error("Host version {found} does not match expected version {expected}")]
    HostVersionMismatch { expected: u32, found: u32 },
    #[error("Payload buffer of {capacity:#x} bytes cannot hold host payloads of {required:#x} bytes")]
    PayloadBufferTooSmall { capacity: usize, required: usize },
    #[error("{what} at {address:#x} is not aligned to {alignment:#x}")]
    Misaligned {
        what: &'static str,
        address: usize,
        alignment: usize,
    },
    #[error("{what} size {size:#x} is not a non-zero multiple of {granularity:#x}")]
    InvalidRegionSize {
        what: &'static str,
        size: usize,
        granularity: usize,
    },
    #[error("Range {start:#x}..{end:#x} lies outside the {covered:#x} bytes covered by paging")]
    OutsideCoverage { start: u64, end: u64, covered: u64 },
    #[error("Coverage range {start:#x}..{end:#x} is empty")]
    EmptyCoverageRange { start: u64, end: u64 },
    #[error("Allocation table exhausted with {capacity} live records")]
    AllocationTableExhausted { capacity: usize },
    #[error("Acquire called while an iteration is already acquired")]
    NestedAcquire,
    #[error("Release called without a matching acquire")]
    UnpairedRelease,
    #[error("Iteration requested before the handshake completed")]
    HandshakeIncomplete,
    #[error("Iteration requested while the previous one is unfinished (state {state})")]
    IterationUnfinished { state: DriverState },
    #[error("A logger is already registered")]
    LoggerAlreadySet,
    #[error("Firmware could not enable the A20 line (status {status:#04x})")]
    A20Unavailable { status: u8 },
    #[error("Firmware memory map query failed (status {status:#04x})")]
    MemoryMapUnavailable { status: u8 },
    #[error("Firmware memory map has more than {capacity} entries")]
    MemoryMapOverflow { capacity: usize },
    #[error("Canary of allocation {pointer:#x} ({size:#x} bytes) overwritten with {found:#018x}")]
    CanaryOverwritten {
        pointer: usize,
        size: usize,
        found: u64,
    },
    #[error("Free of unknown pointer {pointer:#x}")]
    UnknownPointer { pointer: usize },
    #[error("Target reported a crash")]
    TargetCrash,
}

impl HarnessError {
    /// Classify the error to decide which hypercall reports it
    pub fn class(&self) -> ErrorClass {
        match self {
            HarnessError::CanaryOverwritten { .. }
            | HarnessError::UnknownPointer { .. }
            | HarnessError::TargetCrash => ErrorClass::TargetFault,
            _ => ErrorClass::Setup,
        }
    }

    /// Whether the error means the current input crashed the target
    pub fn is_target_fault(&self) -> bool {
        self.class() == ErrorClass::TargetFault
    }
}
