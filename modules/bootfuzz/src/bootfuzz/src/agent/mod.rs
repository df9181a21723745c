// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Agent side of the hypervisor protocol
//!
//! The agent announces itself once (host configuration, agent configuration, payload
//! buffer, operating mode, coverage range) and then brackets every execution of the target
//! with `ACQUIRE` and `RELEASE`. Anything that goes wrong is escalated through one of two
//! diverging hypercalls: `PANIC` for a crash of the target and `USER_ABORT` for a broken
//! harness.

use core::{fmt, ptr::addr_of_mut};

use log::{debug, info};

use crate::{
    configuration::{CoverageRange, HarnessConfiguration},
    error::{ErrorClass, HarnessError, Result},
    hypercall::{AgentConfig, HostConfig, Hypercall, Opcode, RangeSubmission, SubmitMode},
    logger::{hprintf, MessageBuffer, MESSAGE_SIZE},
    payload::PayloadBuffer,
};

pub struct AgentClient<H> {
    transport: H,
    host: Option<HostConfig>,
    acquired: bool,
}

impl<H> AgentClient<H>
where
    H: Hypercall,
{
    pub const fn new(transport: H) -> Self {
        Self {
            transport,
            host: None,
            acquired: false,
        }
    }

    pub fn transport(&self) -> &H {
        &self.transport
    }

    /// The host configuration received during the handshake
    pub fn host(&self) -> Option<HostConfig> {
        self.host
    }

    pub fn acquired(&self) -> bool {
        self.acquired
    }

    /// Ask the hypervisor to write its configuration. The result is not validated.
    pub fn get_host_config(&self) -> HostConfig {
        let mut config = HostConfig::default();
        self.transport
            .hypercall(Opcode::GetHostConfig, addr_of_mut!(config) as usize);
        // SAFETY: the hypervisor wrote the record through the pointer above
        unsafe { addr_of_mut!(config).read_volatile() }
    }

    pub fn set_agent_config(&self, config: &AgentConfig) {
        self.transport.hypercall(
            Opcode::SetAgentConfig,
            config as *const AgentConfig as usize,
        );
    }

    /// Exchange configurations with the hypervisor. The host magic is validated before the
    /// version, and nothing is sent back on a mismatch.
    pub fn handshake(
        &mut self,
        configuration: &HarnessConfiguration,
        input_buffer_size: u32,
    ) -> Result<HostConfig> {
        let host = self.get_host_config();
        let (magic, version) = (host.magic, host.version);

        if magic != configuration.host_magic() {
            return Err(HarnessError::HostMagicMismatch {
                expected: configuration.host_magic(),
                found: magic,
            });
        }

        if version != configuration.host_version() {
            return Err(HarnessError::HostVersionMismatch {
                expected: configuration.host_version(),
                found: version,
            });
        }

        let (bitmap_size, payload_buffer_size, worker_id) =
            (host.bitmap_size, host.payload_buffer_size, host.worker_id);

        info!(
            "Host configuration: worker {worker_id}, bitmap {bitmap_size:#x}, payload {payload_buffer_size:#x}"
        );

        let agent = AgentConfig {
            magic: configuration.agent_magic(),
            version: configuration.agent_version(),
            timeout_detection: configuration.timeout_detection() as u8,
            tracing: configuration.agent_tracing() as u8,
            non_reload_mode: configuration.non_reload_mode() as u8,
            coverage_bitmap_size: configuration.coverage_bitmap_size(),
            input_buffer_size,
            ..Default::default()
        };

        self.set_agent_config(&agent);
        self.host = Some(host);

        Ok(host)
    }

    /// Report the guest's operating mode
    pub fn submit_mode(&self, mode: SubmitMode) {
        self.transport
            .hypercall(Opcode::UserSubmitMode, mode as u32 as usize);
    }

    /// Register the code range coverage is traced for
    pub fn submit_range(&self, range: &CoverageRange) -> Result<()> {
        if range.is_empty() {
            return Err(HarnessError::EmptyCoverageRange {
                start: range.start,
                end: range.end,
            });
        }

        let submission = RangeSubmission {
            start: range.start,
            end: range.end,
            flags: range.flags,
        };

        self.transport.hypercall(
            Opcode::RangeSubmit,
            &submission as *const RangeSubmission as usize,
        );

        debug!("Submitted coverage range {:#x}..{:#x}", range.start, range.end);

        Ok(())
    }

    /// Register the buffer the hypervisor writes payloads into
    pub fn get_payload(&self, buffer: &PayloadBuffer<'_>) {
        self.transport
            .hypercall(Opcode::GetPayload, buffer.address());
    }

    /// Block until the hypervisor has written the next payload
    pub fn next_payload(&self) -> Result<()> {
        if self.host.is_none() {
            return Err(HarnessError::HandshakeIncomplete);
        }

        self.transport.hypercall(Opcode::NextPayload, 0);

        Ok(())
    }

    pub fn acquire(&mut self) -> Result<()> {
        if self.host.is_none() {
            return Err(HarnessError::HandshakeIncomplete);
        }

        if self.acquired {
            return Err(HarnessError::NestedAcquire);
        }

        self.transport.hypercall(Opcode::Acquire, 0);
        self.acquired = true;

        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Err(HarnessError::UnpairedRelease);
        }

        self.acquired = false;
        self.transport.hypercall(Opcode::Release, 0);

        Ok(())
    }

    pub fn printf(&self, args: fmt::Arguments<'_>) {
        hprintf(&self.transport, args);
    }

    /// Report a crash of the target
    pub fn panic(&self) -> ! {
        self.transport.hypercall_noreturn(Opcode::Panic, 0)
    }

    /// Report a broken harness
    pub fn abort(&self, args: fmt::Arguments<'_>) -> ! {
        abort(&self.transport, args)
    }

    pub fn escalate(&self, error: &HarnessError) -> ! {
        escalate(&self.transport, error)
    }
}

/// Abort the campaign with a message
pub fn abort(transport: &dyn Hypercall, args: fmt::Arguments<'_>) -> ! {
    let message = MessageBuffer::<MESSAGE_SIZE>::format(args);
    transport.hypercall_noreturn(Opcode::UserAbort, message.as_ptr() as usize)
}

/// Report `error` through the hypercall matching its class
pub fn escalate(transport: &dyn Hypercall, error: &HarnessError) -> ! {
    match error.class() {
        ErrorClass::TargetFault => {
            hprintf(transport, format_args!("Target fault: {error}\n"));
            transport.hypercall_noreturn(Opcode::Panic, 0)
        }
        ErrorClass::Setup => {
            hprintf(transport, format_args!("Harness error: {error}\n"));
            abort(transport, format_args!("{error}"))
        }
    }
}
