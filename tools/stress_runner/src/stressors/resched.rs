// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One worker per nice level. Each worker cycles through the normal
//! scheduling policies yielding the CPU, renices itself one step and repeats
//! until it reaches the weakest level, then exits and is started again at
//! its original level.

use anyhow::Context;
use anyhow::Result;
use log::debug;
use nix::sched::sched_yield;
use nix::sys::resource::getrlimit;
use nix::sys::resource::Resource;
use stress_harness::ChildConfig;
use stress_harness::CounterBlock;
use stress_harness::ExitStatus;
use stress_harness::Respawn;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

const YIELDS_PER_LEVEL: usize = 1024;
const MAX_NICE: usize = 19;

const NORMAL_POLICIES: [libc::c_int; 3] = [libc::SCHED_OTHER, libc::SCHED_BATCH, libc::SCHED_IDLE];

pub struct Resched;

/// Weakest nice level we will renice to. RLIMIT_NICE caps it as
/// `20 - rlim_cur`.
fn max_prio() -> usize {
    match getrlimit(Resource::RLIMIT_NICE) {
        Ok((cur, _)) if cur < 20 => (20 - cur as usize).min(MAX_NICE),
        _ => MAX_NICE,
    }
}

struct ReschedBody {
    /// Yields per nice level, summed across workers.
    yields: CounterBlock,
    max_prio: usize,
}

impl WorkerBody for ReschedBody {
    fn child_config(&self, slot: usize) -> ChildConfig {
        ChildConfig::default().with_nice(slot as i32)
    }

    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        let param = libc::sched_param { sched_priority: 0 };
        for level in ctx.slot()..=self.max_prio {
            for _ in 0..YIELDS_PER_LEVEL {
                for policy in NORMAL_POLICIES {
                    unsafe { libc::sched_setscheduler(0, policy, &param) };
                    let _ = sched_yield();
                    self.yields.inc(level);
                    ctx.inc();
                }
            }
            unsafe { libc::nice(1) };
            if !ctx.keep_stressing() {
                break;
            }
        }
        ExitStatus::Success
    }
}

impl Drop for ReschedBody {
    fn drop(&mut self) {
        let yields = self.yields.snapshot();
        let total: u64 = yields.iter().sum();
        if total == 0 {
            return;
        }
        for (prio, &n) in yields.iter().enumerate().filter(|(_, n)| **n > 0) {
            let percent = 100.0 * n as f64 / total as f64;
            match prio.checked_sub(1).map(|p| yields[p]) {
                Some(prev) if prev > 0 => {
                    let scale = n as f64 / prev as f64;
                    debug!(
                        "resched: prio {:2}: {:5.2}% yields (prio {:2} x {:.6}){}",
                        prio,
                        percent,
                        prio - 1,
                        scale,
                        if scale < 1.0 { " bad" } else { "" }
                    );
                }
                _ => debug!("resched: prio {:2}: {:5.2}% yields", prio, percent),
            }
        }
    }
}

impl Stressor for Resched {
    fn name(&self) -> &'static str {
        "resched"
    }

    fn class(&self) -> StressorClass {
        StressorClass::SCHEDULER | StressorClass::OS
    }

    /// One per level, whatever was asked for.
    fn workers(&self, _requested: usize) -> usize {
        max_prio() + 1
    }

    fn respawn(&self) -> Respawn {
        Respawn::Always
    }

    fn one_shot(&self) -> bool {
        true
    }

    fn prepare(&self, _args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        let max_prio = max_prio();
        let yields = CounterBlock::create(max_prio + 1).context("Failed to map yield counters")?;
        Ok(Box::new(ReschedBody { yields, max_prio }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_prio_in_range() {
        let p = max_prio();
        assert!(p <= MAX_NICE);
        assert_eq!(Resched.workers(1), p + 1);
        assert_eq!(Resched.workers(64), p + 1);
    }
}
