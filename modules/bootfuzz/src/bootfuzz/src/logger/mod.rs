// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Logging through the `PRINTF` hypercall
//!
//! There is no heap when the harness starts, so messages are formatted into a fixed
//! buffer on the stack, truncated if needed, and handed to the hypervisor as a
//! NUL-terminated string.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::{
    error::{HarnessError, Result},
    hypercall::{Hypercall, Opcode},
};

/// Size of the buffer a single log message is formatted into, including the terminator
pub const MESSAGE_SIZE: usize = 256;

/// Fixed-capacity, always NUL-terminated message buffer
pub struct MessageBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> MessageBuffer<N> {
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Format `args` into a new buffer
    pub fn format(args: fmt::Arguments<'_>) -> Self {
        let mut buffer = Self::new();
        // Truncation is recorded, never reported as an error
        let _ = buffer.write_fmt(args);
        buffer
    }

    /// The message bytes without the terminator
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole UTF-8 sequences are ever appended
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    /// Pointer to the NUL-terminated message
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<const N: usize> Default for MessageBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for MessageBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // One byte is always kept for the terminator
        let available = N.saturating_sub(1).saturating_sub(self.len);

        let mut take = s.len().min(available);
        while !s.is_char_boundary(take) {
            take -= 1;
        }

        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if N > 0 {
            self.bytes[self.len] = 0;
        }

        if take < s.len() {
            self.truncated = true;
            return Err(fmt::Error);
        }

        Ok(())
    }
}

/// Send a formatted message to the hypervisor log
pub fn hprintf(transport: &dyn Hypercall, args: fmt::Arguments<'_>) {
    let message = MessageBuffer::<MESSAGE_SIZE>::format(args);
    transport.hypercall(Opcode::Printf, message.as_ptr() as usize);
}

/// A [`log::Log`] implementation that forwards records through `PRINTF`
pub struct HypercallLogger<H> {
    transport: H,
    level: LevelFilter,
}

impl<H> HypercallLogger<H>
where
    H: Hypercall,
{
    pub const fn new(transport: H, level: LevelFilter) -> Self {
        Self { transport, level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

impl<H> Log for HypercallLogger<H>
where
    H: Hypercall + Send + Sync,
{
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        hprintf(
            &self.transport,
            format_args!(
                "[{}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ),
        );
    }

    fn flush(&self) {}
}

/// Register `logger` as the global logger
pub fn init_hypercall_logger<H>(logger: &'static HypercallLogger<H>) -> Result<()>
where
    H: Hypercall + Send + Sync + 'static,
{
    log::set_logger(logger).map_err(|_| HarnessError::LoggerAlreadySet)?;
    log::set_max_level(logger.level());
    Ok(())
}
