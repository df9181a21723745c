// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Host-side stand-ins for the hypervisor, the processor and the firmware
//!
//! Diverging hypercalls cannot return, so the mock hypervisor unwinds with an
//! [`Escalation`] payload instead. [`escalation_of`] catches it and hands it back to the
//! test.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::VecDeque,
    ffi::CStr,
    panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe},
    slice,
    sync::Mutex,
};

use bootfuzz::{
    agent::AgentClient,
    arch::Processor,
    configuration::{CoverageRange, Delivery, HarnessConfiguration},
    context::HarnessContext,
    disk::{LinearMemory, RegisterState},
    driver::Driver,
    hypercall::{
        AgentConfig, HostConfig, Hypercall, Opcode, RangeSubmission, HOST_MAGIC, HOST_VERSION,
    },
    interrupts::InterruptTable,
    paging::{PagingScaffold, PAGE_SIZE},
    payload::{PayloadBuffer, HEADER_SIZE},
    platform::{Bios, E820Entry, SMAP},
    sanitizer::{CanarySanitizer, PoolAllocator},
};
use typed_builder::TypedBuilder;

/// Page tables used by the test harnesses, covering 32 MiB
pub const TABLES: usize = 8;
/// Allocation records used by the test harnesses
pub const RECORDS: usize = 64;
/// Payload buffer size used by the test harnesses
pub const PAYLOAD_PAGES: usize = 4;

pub type TestContext =
    HarnessContext<'static, &'static MockHypervisor, MockProcessor, HeapPool, RECORDS, TABLES>;
pub type TestDriver =
    Driver<'static, &'static MockHypervisor, MockProcessor, HeapPool, RECORDS, TABLES>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A hypercall observed by the mock hypervisor
pub enum Call {
    Acquire,
    GetPayload(usize),
    Release,
    Panic,
    NextPayload,
    Printf(String),
    SubmitMode(usize),
    Abort(String),
    RangeSubmit(RangeSubmission),
    GetHostConfig,
    SetAgentConfig(AgentConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Unwind payload standing in for a hypercall that never returns
pub struct Escalation {
    pub opcode: Opcode,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct HypervisorState {
    calls: Vec<Call>,
    payloads: VecDeque<Vec<u8>>,
    payload_address: Option<usize>,
}

#[derive(TypedBuilder, Debug)]
/// Records every hypercall and serves queued payloads on `NEXT_PAYLOAD`
pub struct MockHypervisor {
    #[builder(default = MockHypervisor::default_host())]
    host: HostConfig,
    #[builder(default, setter(skip))]
    state: Mutex<HypervisorState>,
}

impl MockHypervisor {
    pub fn default_host() -> HostConfig {
        HostConfig {
            magic: HOST_MAGIC,
            version: HOST_VERSION,
            bitmap_size: 0x10000,
            ijon_bitmap_size: 0,
            payload_buffer_size: (PAYLOAD_PAGES * PAGE_SIZE) as u32,
            worker_id: 0,
        }
    }

    /// A hypervisor that lives for the rest of the test binary
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    pub fn queue_payload(&self, payload: &[u8]) {
        self.lock().payloads.push_back(payload.to_vec());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.opcode() == opcode)
            .count()
    }

    pub fn printed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Printf(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HypervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    fn message(argument: usize) -> String {
        unsafe { CStr::from_ptr(argument as *const std::ffi::c_char) }
            .to_string_lossy()
            .into_owned()
    }

    fn write_next_payload(&self) {
        let mut state = self.lock();

        let Some(payload) = state.payloads.pop_front() else {
            drop(state);
            panic_any(Escalation {
                opcode: Opcode::NextPayload,
                message: Some("payload queue exhausted".to_string()),
            });
        };

        let Some(address) = state.payload_address else {
            return;
        };

        let capacity = self.host.payload_buffer_size as usize - HEADER_SIZE;
        let len = payload.len().min(capacity);

        unsafe {
            (address as *mut i32).write_unaligned(len as i32);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                (address + HEADER_SIZE) as *mut u8,
                len,
            );
        }
    }
}

impl Call {
    pub fn opcode(&self) -> Opcode {
        match self {
            Call::Acquire => Opcode::Acquire,
            Call::GetPayload(_) => Opcode::GetPayload,
            Call::Release => Opcode::Release,
            Call::Panic => Opcode::Panic,
            Call::NextPayload => Opcode::NextPayload,
            Call::Printf(_) => Opcode::Printf,
            Call::SubmitMode(_) => Opcode::UserSubmitMode,
            Call::Abort(_) => Opcode::UserAbort,
            Call::RangeSubmit(_) => Opcode::RangeSubmit,
            Call::GetHostConfig => Opcode::GetHostConfig,
            Call::SetAgentConfig(_) => Opcode::SetAgentConfig,
        }
    }
}

impl Hypercall for MockHypervisor {
    fn hypercall(&self, opcode: Opcode, argument: usize) -> usize {
        match opcode {
            Opcode::Acquire => self.record(Call::Acquire),
            Opcode::Release => self.record(Call::Release),
            Opcode::GetPayload => {
                self.lock().payload_address = Some(argument);
                self.record(Call::GetPayload(argument));
            }
            Opcode::NextPayload => {
                self.record(Call::NextPayload);
                self.write_next_payload();
            }
            Opcode::Printf => self.record(Call::Printf(Self::message(argument))),
            Opcode::UserSubmitMode => self.record(Call::SubmitMode(argument)),
            Opcode::RangeSubmit => {
                let range = unsafe { (argument as *const RangeSubmission).read_unaligned() };
                self.record(Call::RangeSubmit(range));
            }
            Opcode::GetHostConfig => {
                unsafe { (argument as *mut HostConfig).write_unaligned(self.host) };
                self.record(Call::GetHostConfig);
            }
            Opcode::SetAgentConfig => {
                let agent = unsafe { (argument as *const AgentConfig).read_unaligned() };
                self.record(Call::SetAgentConfig(agent));
            }
            Opcode::Panic => self.record(Call::Panic),
            Opcode::UserAbort => self.record(Call::Abort(Self::message(argument))),
        }

        0
    }

    fn hypercall_noreturn(&self, opcode: Opcode, argument: usize) -> ! {
        let message = match opcode {
            Opcode::UserAbort => Some(Self::message(argument)),
            _ => None,
        };

        self.hypercall(opcode, argument);

        panic_any(Escalation { opcode, message })
    }
}

/// Run `f`, returning the escalation it ended with, if any
pub fn escalation_of<F>(f: F) -> Option<Escalation>
where
    F: FnOnce(),
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<Escalation>() {
            Ok(escalation) => Some(*escalation),
            Err(payload) => resume_unwind(payload),
        },
    }
}

#[derive(Debug, Default)]
/// Records the control operations instead of performing them
pub struct MockProcessor {
    pub page_directory: Option<u32>,
    pub paging: bool,
    pub invalidated: Vec<usize>,
    pub interrupt_table: Option<(usize, u16)>,
}

impl Processor for MockProcessor {
    unsafe fn load_page_directory(&mut self, directory: u32) {
        self.page_directory = Some(directory);
    }

    unsafe fn set_paging(&mut self, enabled: bool) {
        self.paging = enabled;
    }

    fn invalidate_page(&mut self, address: usize) {
        self.invalidated.push(address);
    }

    unsafe fn load_interrupt_table(&mut self, base: usize, limit: u16) {
        self.interrupt_table = Some((base, limit));
    }
}

#[derive(Debug, Default)]
/// Pool allocator backed by the host heap, optionally limited to `limit` bytes
pub struct HeapPool {
    pub limit: Option<usize>,
    pub in_use: usize,
    pub outstanding: usize,
}

impl HeapPool {
    const HEADER: usize = 16;

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(Self::HEADER)?, Self::HEADER).ok()
    }
}

impl PoolAllocator for HeapPool {
    unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if self.limit.is_some_and(|l| self.in_use + size > l) {
            return std::ptr::null_mut();
        }

        let Some(layout) = Self::layout(size) else {
            return std::ptr::null_mut();
        };

        let base = alloc_zeroed(layout);

        if base.is_null() {
            return base;
        }

        (base as *mut usize).write(size);
        self.in_use += size;
        self.outstanding += 1;
        base.add(Self::HEADER)
    }

    unsafe fn free(&mut self, pointer: *mut u8) {
        let base = pointer.sub(Self::HEADER);
        let size = (base as *const usize).read();

        if let Some(layout) = Self::layout(size) {
            dealloc(base, layout);
        }

        self.in_use -= size;
        self.outstanding -= 1;
    }
}

/// The first megabyte and a bit of a real-mode address space
pub struct GuestMemory {
    pub bytes: Vec<u8>,
}

impl GuestMemory {
    pub const SIZE: usize = 0x11_0000;

    pub fn new() -> Self {
        Self {
            bytes: vec![0; Self::SIZE],
        }
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearMemory for GuestMemory {
    fn read(&self, address: u32, buffer: &mut [u8]) {
        let start = address as usize;
        buffer.copy_from_slice(&self.bytes[start..start + buffer.len()]);
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }
}

#[derive(TypedBuilder)]
/// Firmware answering the A20 and memory map services
pub struct MockBios {
    #[builder(default)]
    pub memory: GuestMemory,
    #[builder(default)]
    pub entries: Vec<E820Entry>,
    #[builder(default = false)]
    pub a20_fails: bool,
    #[builder(default = false)]
    pub memory_map_fails: bool,
    #[builder(default, setter(skip))]
    pub interrupts: Vec<(u8, u32)>,
}

impl LinearMemory for MockBios {
    fn read(&self, address: u32, buffer: &mut [u8]) {
        self.memory.read(address, buffer)
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        self.memory.write(address, data)
    }
}

impl Bios for MockBios {
    unsafe fn interrupt(&mut self, vector: u8, regs: &mut RegisterState) {
        self.interrupts.push((vector, regs.eax));

        match (vector, regs.eax) {
            (0x15, 0x2401) if self.a20_fails => regs.fail(0x86),
            (0x15, 0x2401) => regs.succeed(0),
            (0x15, 0xe820) if self.memory_map_fails => regs.fail(0x86),
            (0x15, 0xe820) => {
                let index = regs.ebx as usize;
                let entry = self.entries.get(index).copied().unwrap_or_default();
                let address = (regs.es as u32) * 16 + regs.edi;
                self.memory.write(address, &entry.to_bytes());

                regs.eax = SMAP;
                regs.ecx = E820Entry::SIZE as u32;
                regs.ebx = if index + 1 < self.entries.len() {
                    index as u32 + 1
                } else {
                    0
                };
                regs.efl &= !1;
            }
            _ => regs.fail(0x86),
        }
    }
}

/// Leak `value` to obtain storage that lives as long as a harness
pub fn leak<T>(value: T) -> &'static mut T {
    Box::leak(Box::new(value))
}

/// Leak a zeroed, page-aligned region of `pages` pages
pub fn aligned_region(pages: usize) -> &'static mut [u8] {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("valid layout");
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null(), "allocation failed");
    unsafe { slice::from_raw_parts_mut(base, pages * PAGE_SIZE) }
}

/// Write `data` as the current payload of `buffer`, the way the hypervisor does
pub fn fill_payload(buffer: &PayloadBuffer<'_>, data: &[u8]) {
    assert!(data.len() <= buffer.capacity());
    unsafe {
        (buffer.address() as *mut i32).write_unaligned(data.len() as i32);
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            (buffer.address() + HEADER_SIZE) as *mut u8,
            data.len(),
        );
    }
}

/// Configuration used by most tests: the raw buffer is not paged on the host, so paging
/// stays off
pub fn configuration() -> HarnessConfiguration {
    HarnessConfiguration::builder()
        .coverage(CoverageRange {
            start: 0x7c00,
            end: 0x1_0000,
            flags: 0,
        })
        .enable_paging(false)
        .build()
}

pub fn raw_buffer_configuration() -> HarnessConfiguration {
    HarnessConfiguration::builder()
        .coverage(CoverageRange {
            start: 0x7c00,
            end: 0x1_0000,
            flags: 0,
        })
        .delivery(Delivery::RawBuffer)
        .enable_paging(false)
        .build()
}

/// A context over fresh leaked storage
pub fn context(
    hypervisor: &'static MockHypervisor,
    configuration: HarnessConfiguration,
) -> TestContext {
    context_with_pool(hypervisor, configuration, HeapPool::default())
}

pub fn context_with_pool(
    hypervisor: &'static MockHypervisor,
    configuration: HarnessConfiguration,
    pool: HeapPool,
) -> TestContext {
    HarnessContext::builder()
        .configuration(configuration)
        .client(AgentClient::new(hypervisor))
        .processor(MockProcessor::default())
        .paging(leak(PagingScaffold::new()))
        .interrupts(leak(InterruptTable::new()))
        .sanitizer(leak(CanarySanitizer::new(pool)))
        .payload(
            PayloadBuffer::new(aligned_region(PAYLOAD_PAGES)).expect("aligned payload region"),
        )
        .build()
}

/// A driver that has been initialized and has completed the handshake
pub fn ready_driver(
    hypervisor: &'static MockHypervisor,
    configuration: HarnessConfiguration,
) -> TestDriver {
    let mut driver = Driver::builder()
        .context(context(hypervisor, configuration))
        .build();
    driver.initialize().expect("initialize");
    driver.handshake().expect("handshake");
    driver
}
