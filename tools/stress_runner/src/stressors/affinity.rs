// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use anyhow::Context;
use anyhow::Result;
use log::warn;
use nix::errno::Errno;
use nix::sched::sched_yield;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use stress_harness::child::set_affinity;
use stress_harness::ExitStatus;
use stress_harness::Help;
use stress_harness::Shared;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

/// Moves its workers from CPU to CPU as fast as the scheduler allows.
pub struct Affinity;

const HELP: &[Help] = &[Help {
    opt: "affinity-pin",
    description: "slot 0 picks the CPU and every worker follows it",
}];

#[derive(Default)]
struct AffinityShared {
    cpu: AtomicU32,
}

struct AffinityBody {
    shared: Shared<AffinityShared>,
    nr_cpus: usize,
    pin: bool,
}

impl AffinityBody {
    fn next_cpu(&self, ctx: &WorkerContext) -> usize {
        if !self.pin {
            return (ctx.counter() as usize + ctx.slot()) % self.nr_cpus;
        }
        if ctx.slot() == 0 {
            let next = (self.shared.cpu.load(Relaxed) as usize + 1) % self.nr_cpus;
            self.shared.cpu.store(next as u32, Relaxed);
            next
        } else {
            self.shared.cpu.load(Relaxed) as usize
        }
    }
}

impl WorkerBody for AffinityBody {
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        let cpu = self.next_cpu(ctx);
        match set_affinity(cpu) {
            Ok(()) => {
                let _ = sched_yield();
            }
            // Offline or outside our cpuset, move on.
            Err(Errno::EINVAL) => {}
            Err(e) => {
                warn!("{}: sched_setaffinity to CPU {} failed ({})", ctx.name(), cpu, e);
                return ExitStatus::Failure;
            }
        }
        ctx.inc();
        ExitStatus::Success
    }
}

fn nr_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

impl Stressor for Affinity {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn class(&self) -> StressorClass {
        StressorClass::SCHEDULER
    }

    fn help(&self) -> &'static [Help] {
        HELP
    }

    fn prepare(&self, args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        let pin = args.setting::<bool>("affinity-pin")?.unwrap_or(false);
        let shared = Shared::<AffinityShared>::new().context("Failed to map pinned CPU")?;
        Ok(Box::new(AffinityBody {
            shared,
            nr_cpus: nr_cpus(),
            pin,
        }))
    }
}
