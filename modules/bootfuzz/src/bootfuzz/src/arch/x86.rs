// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! x86 processor control and the `vmcall` hypercall transport

use super::Processor;
use crate::hypercall::{Hypercall, Opcode, HYPERCALL_ID};

/// Paging enable bit in CR0
pub const CR0_PG: usize = 1 << 31;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[repr(C, packed)]
/// Operand of `lidt`
struct TablePointer {
    limit: u16,
    base: usize,
}

#[derive(Debug, Default, Clone, Copy)]
/// Processor control for a 32-bit protected mode bootloader
pub struct X86Processor;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Processor for X86Processor {
    unsafe fn load_page_directory(&mut self, directory: u32) {
        core::arch::asm!("mov cr3, {}", in(reg) directory as usize, options(nostack));
    }

    unsafe fn set_paging(&mut self, enabled: bool) {
        let mut cr0: usize;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));

        if enabled {
            cr0 |= CR0_PG;
        } else {
            cr0 &= !CR0_PG;
        }

        core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack));
    }

    fn invalidate_page(&mut self, address: usize) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) address, options(nostack));
        }
    }

    unsafe fn load_interrupt_table(&mut self, base: usize, limit: u16) {
        let pointer = TablePointer { limit, base };
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &pointer as *const TablePointer,
            options(readonly, nostack)
        );
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
/// Disable interrupts and halt forever
pub fn halt() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
/// Hypercall transport through `vmcall`
///
/// The accumulator carries [`HYPERCALL_ID`], the base register the opcode and the count
/// register the argument. The accumulator holds the result on return.
pub struct Vmcall;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn vmcall(opcode: usize, argument: usize) -> usize {
    let result: usize;
    // NOTE: rbx is reserved by LLVM and cannot be named as an operand
    core::arch::asm!(
        "xchg {opcode}, rbx",
        "vmcall",
        "xchg {opcode}, rbx",
        opcode = inout(reg) opcode => _,
        inout("rax") HYPERCALL_ID => result,
        in("rcx") argument,
        options(nostack),
    );
    result
}

#[cfg(target_arch = "x86")]
#[inline(always)]
unsafe fn vmcall(opcode: usize, argument: usize) -> usize {
    let result: usize;
    core::arch::asm!(
        "xchg {opcode}, ebx",
        "vmcall",
        "xchg {opcode}, ebx",
        opcode = inout(reg) opcode => _,
        inout("eax") HYPERCALL_ID => result,
        in("ecx") argument,
        options(nostack),
    );
    result
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Hypercall for Vmcall {
    fn hypercall(&self, opcode: Opcode, argument: usize) -> usize {
        unsafe { vmcall(opcode as usize, argument) }
    }

    fn hypercall_noreturn(&self, opcode: Opcode, argument: usize) -> ! {
        unsafe {
            vmcall(opcode as usize, argument);
        }
        halt()
    }
}
