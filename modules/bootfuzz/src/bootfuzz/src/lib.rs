// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Guest-side fuzzing harness for legacy bootloaders
//!
//! # Overview
//!
//! This crate is linked into a bootloader (the target under test) and turns it into a
//! persistent fuzzing target for a Nyx-compatible hypervisor. It runs before the target
//! has any memory management, interrupt handling or OS services of its own, so every
//! structure it uses is statically sized and provided by the integration.
//!
//! # Capabilities
//!
//! The harness can:
//!
//! - Perform the agent handshake with the hypervisor, register the payload buffer and
//!   submit the coverage range of the target's load image
//! - Drive the target once per payload in a persistent acquire/release loop
//! - Build a 32-bit paging scaffold covering the low address space and toggle the
//!   presence of individual pages
//! - Install an interrupt table that turns processor faults into crash reports
//! - Detect heap overflows in the target's pool allocator with trailing canaries
//! - Serve legacy INT 13h extended disk requests for one drive out of the payload buffer
//!
//! Faults never unwind back into the harness: they are reported to the hypervisor through
//! a diverging hypercall, and the hypervisor's snapshot restore restarts the loop.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod agent;
pub mod arch;
pub mod configuration;
pub mod context;
pub mod disk;
pub mod driver;
pub mod error;
pub mod hypercall;
pub mod interrupts;
pub mod logger;
pub mod paging;
pub mod payload;
pub mod platform;
pub mod sanitizer;
pub mod state;
pub mod traits;

pub use agent::AgentClient;
pub use configuration::HarnessConfiguration;
pub use context::{HarnessContext, Iteration};
pub use driver::Driver;
pub use error::{ErrorClass, HarnessError, Result};
pub use hypercall::{Hypercall, Opcode};
pub use traits::Target;
