// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

use crate::context::Iteration;

/// The code under test
pub trait Target {
    /// Run the target once against the current payload. Crashes never return here: they
    /// are reported through the iteration handle or the interrupt table.
    fn run(&mut self, iteration: &mut Iteration<'_, '_>);
}

impl<F> Target for F
where
    F: FnMut(&mut Iteration<'_, '_>),
{
    fn run(&mut self, iteration: &mut Iteration<'_, '_>) {
        self(iteration)
    }
}
