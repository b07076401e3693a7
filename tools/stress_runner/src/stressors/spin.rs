// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;
use stress_harness::BodyFn;
use stress_harness::ExitStatus;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

const STEPS_PER_OP: u32 = 4096;

/// Pure compute spin loop. One bogo-op per batch of LCG steps.
pub struct Spin;

fn spin(ctx: &mut WorkerContext) -> ExitStatus {
    let mut x: u64 = ctx.counter() | 1;
    for _ in 0..STEPS_PER_OP {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
    }
    std::hint::black_box(x);
    ctx.inc();
    ExitStatus::Success
}

impl Stressor for Spin {
    fn name(&self) -> &'static str {
        "spin"
    }

    fn class(&self) -> StressorClass {
        StressorClass::CPU
    }

    fn prepare(&self, _args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        Ok(Box::new(BodyFn::new(spin)))
    }
}
