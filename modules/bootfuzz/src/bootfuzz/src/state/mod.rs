// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

//! Definitions for tracking the state of the fuzzing loop

use core::fmt::Display;

use getters::Getters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Phase of the driver. After the handshake the driver cycles through the last four
/// states once per payload.
pub enum DriverState {
    #[default]
    Init,
    Handshake,
    WaitPayload,
    Acquired,
    RunTarget,
    Release,
}

impl Display for DriverState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Getters, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[getters(deref)]
/// Resource usage recorded after the handshake, compared after every iteration to detect
/// state leaking between iterations
pub struct Baseline {
    live_allocations: usize,
    mapped_pages: usize,
}

impl Baseline {
    pub fn new(live_allocations: usize, mapped_pages: usize) -> Self {
        Self {
            live_allocations,
            mapped_pages,
        }
    }
}
