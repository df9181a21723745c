// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Interrupt descriptor table that turns processor faults into crash reports
//!
//! All 256 vectors are populated once. Vectors the [`FaultPolicy`] marks fatal point at a
//! per-vector stub that reports the exception and issues the panic hypercall. Every other
//! vector points at a stub that returns immediately, so stray hardware interrupts do not
//! disturb the target.

use core::{fmt::Display, mem::size_of};

use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::{Deserialize, Serialize};

use crate::{
    arch::Processor,
    hypercall::{Hypercall, Opcode},
    logger::hprintf,
};

/// Number of vectors in the table
pub const VECTORS: usize = 256;
/// Number of architecturally reserved exception vectors
pub const EXCEPTION_VECTORS: usize = 32;
/// Present, ring 0, 32-bit interrupt gate
pub const INTERRUPT_GATE: u8 = 0x8e;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
/// Architectural exception vectors
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
}

impl Display for Exception {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which exception vectors are reported as crashes. Bit `n` set means vector `n` is fatal.
pub struct FaultPolicy {
    fatal: u32,
}

impl FaultPolicy {
    /// Divide error through machine check
    pub const DEFAULT_FATAL: u32 = (1 << 19) - 1;

    pub const fn new(fatal: u32) -> Self {
        Self { fatal }
    }

    pub const fn none() -> Self {
        Self { fatal: 0 }
    }

    pub const fn is_fatal(&self, vector: u8) -> bool {
        (vector as usize) < EXCEPTION_VECTORS && self.fatal & (1 << vector) != 0
    }

    pub const fn with_fatal(self, vector: Exception) -> Self {
        Self {
            fatal: self.fatal | (1 << vector as u8),
        }
    }

    pub const fn without(self, vector: Exception) -> Self {
        Self {
            fatal: self.fatal & !(1 << vector as u8),
        }
    }

    pub const fn mask(&self) -> u32 {
        self.fatal
    }
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FATAL)
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdtGate {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    attributes: u8,
    offset_high: u16,
}

impl IdtGate {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            attributes: 0,
            offset_high: 0,
        }
    }

    pub const fn new(handler: usize, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            reserved: 0,
            attributes: INTERRUPT_GATE,
            offset_high: (handler >> 16) as u16,
        }
    }

    pub fn offset(&self) -> usize {
        let (low, high) = (self.offset_low, self.offset_high);
        (high as usize) << 16 | low as usize
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Returns to the interrupted code
    Ignore,
    /// Reports a crash and never returns
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Entry points the gates point at
pub struct HandlerAddresses {
    pub fatal: [usize; EXCEPTION_VECTORS],
    pub ignore: usize,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    static bootfuzz_fault_stubs: [usize; EXCEPTION_VECTORS];
    fn bootfuzz_ignore();
}

impl Default for HandlerAddresses {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn default() -> Self {
        Self {
            // SAFETY: the table is emitted below and never written
            fatal: unsafe { bootfuzz_fault_stubs },
            ignore: bootfuzz_ignore as usize,
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn default() -> Self {
        Self {
            fatal: [0; EXCEPTION_VECTORS],
            ignore: 0,
        }
    }
}

pub struct InterruptTable {
    gates: [IdtGate; VECTORS],
    kinds: [GateKind; VECTORS],
    built: bool,
}

impl InterruptTable {
    /// Value loaded with the table base
    pub const LIMIT: u16 = (VECTORS * size_of::<IdtGate>() - 1) as u16;

    pub const fn new() -> Self {
        Self {
            gates: [IdtGate::missing(); VECTORS],
            kinds: [GateKind::Ignore; VECTORS],
            built: false,
        }
    }

    /// Populate every vector according to `policy`
    pub fn build(&mut self, policy: FaultPolicy, selector: u16, handlers: &HandlerAddresses) {
        for vector in 0..VECTORS {
            let (kind, handler) = match handlers.fatal.get(vector) {
                Some(handler) if policy.is_fatal(vector as u8) => (GateKind::Fatal, *handler),
                _ => (GateKind::Ignore, handlers.ignore),
            };

            self.gates[vector] = IdtGate::new(handler, selector);
            self.kinds[vector] = kind;
        }

        self.built = true;

        debug!(
            "Built interrupt table with fatal vectors {:#010x}",
            policy.mask()
        );
    }

    /// Load the table into the processor
    ///
    /// # Safety
    ///
    /// The table must have been built and must not move while interrupts can be delivered.
    pub unsafe fn load<P>(&self, processor: &mut P)
    where
        P: Processor + ?Sized,
    {
        processor.load_interrupt_table(self.gates.as_ptr() as usize, Self::LIMIT);
    }

    /// Deliver `vector` in software with the semantics of the installed gate. Fatal vectors
    /// never return.
    pub fn dispatch(&self, vector: u8, transport: &dyn Hypercall) {
        if self.kinds[vector as usize] == GateKind::Fatal {
            raise_fault(transport, vector);
        }
    }

    pub fn gate(&self, vector: u8) -> IdtGate {
        self.gates[vector as usize]
    }

    pub fn kind(&self, vector: u8) -> GateKind {
        self.kinds[vector as usize]
    }

    pub fn built(&self) -> bool {
        self.built
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Report a fatal exception and hand control to the hypervisor
pub fn raise_fault(transport: &dyn Hypercall, vector: u8) -> ! {
    match Exception::from_u8(vector) {
        Some(exception) => hprintf(
            transport,
            format_args!("Fatal exception {exception} (vector {vector})\n"),
        ),
        None => hprintf(transport, format_args!("Fatal interrupt vector {vector}\n")),
    }

    transport.hypercall_noreturn(Opcode::Panic, 0)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" fn exception_entry(vector: u32) -> ! {
    raise_fault(&crate::arch::x86::Vmcall, vector as u8)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
macro_rules! fault_stubs {
    ($($vector:literal),*) => {
        core::arch::global_asm!(
            ".section .text.bootfuzz_interrupts, \"ax\"",
            $(
                concat!(".global bootfuzz_fault_", stringify!($vector)),
                concat!("bootfuzz_fault_", stringify!($vector), ":"),
                concat!("push ", stringify!($vector)),
                "call {entry}",
            )*
            ".global bootfuzz_ignore",
            "bootfuzz_ignore:",
            "iretd",
            ".section .rodata.bootfuzz_interrupts, \"a\"",
            ".balign 4",
            ".global bootfuzz_fault_stubs",
            "bootfuzz_fault_stubs:",
            $(concat!(".long bootfuzz_fault_", stringify!($vector)),)*
            ".text",
            entry = sym exception_entry,
        );
    };
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fault_stubs!(
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
    25, 26, 27, 28, 29, 30, 31
);
