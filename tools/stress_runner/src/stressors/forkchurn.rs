// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use anyhow::Result;
use stress_harness::oomable::oomable_child;
use stress_harness::BodyFn;
use stress_harness::ExitStatus;
use stress_harness::OomPolicy;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

/// Every iteration forks a short-lived, OOM-able grandchild that does one
/// bogo-op of work and exits.
pub struct ForkChurn;

fn grandchild(ctx: &mut WorkerContext) -> ExitStatus {
    // A page of private, dirtied memory so each child costs something.
    let mut page = vec![0u8; ctx.page_size()];
    page[0] = ctx.counter() as u8;
    std::hint::black_box(&page);
    ctx.inc();
    ExitStatus::Success
}

struct ForkChurnBody;

impl WorkerBody for ForkChurnBody {
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        oomable_child(ctx, OomPolicy::DROP_CAP, &BodyFn::new(grandchild))
    }
}

impl Stressor for ForkChurn {
    fn name(&self) -> &'static str {
        "forkchurn"
    }

    fn class(&self) -> StressorClass {
        StressorClass::OS | StressorClass::SCHEDULER
    }

    fn prepare(&self, _args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        Ok(Box::new(ForkChurnBody))
    }
}
