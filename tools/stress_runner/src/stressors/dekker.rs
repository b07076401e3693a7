// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use anyhow::Context;
use anyhow::Result;
use log::error;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::Ordering::SeqCst;
use stress_harness::ExitStatus;
use stress_harness::Shared;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

/// Dekker's mutual exclusion between two processes over shared memory.
pub struct Dekker;

#[derive(Default)]
struct DekkerState {
    wants_to_enter: [AtomicBool; 2],
    turn: AtomicUsize,
    check: AtomicI32,
}

struct DekkerBody {
    state: Shared<DekkerState>,
}

impl DekkerBody {
    /// Spin until `cond` clears. False if the run stopped meanwhile.
    fn wait_while(&self, ctx: &WorkerContext, cond: impl Fn(&DekkerState) -> bool) -> bool {
        while cond(&self.state) {
            if !ctx.termination().keep_stressing_flag() {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }

    fn lock(&self, ctx: &WorkerContext, me: usize) -> bool {
        let other = 1 - me;
        let d = &*self.state;

        d.wants_to_enter[me].store(true, SeqCst);
        fence(SeqCst);
        while d.wants_to_enter[other].load(SeqCst) {
            if d.turn.load(SeqCst) != me {
                d.wants_to_enter[me].store(false, SeqCst);
                fence(SeqCst);
                if !self.wait_while(ctx, |d| d.turn.load(SeqCst) != me) {
                    return false;
                }
                d.wants_to_enter[me].store(true, SeqCst);
                fence(SeqCst);
            }
            if !ctx.termination().keep_stressing_flag() {
                d.wants_to_enter[me].store(false, SeqCst);
                return false;
            }
        }
        true
    }

    fn unlock(&self, me: usize) {
        let d = &*self.state;
        d.turn.store(1 - me, SeqCst);
        d.wants_to_enter[me].store(false, SeqCst);
        fence(SeqCst);
    }
}

impl WorkerBody for DekkerBody {
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        let me = ctx.slot();
        if !self.lock(ctx, me) {
            return ExitStatus::Success;
        }

        // Critical section: worker 0 counts up, worker 1 counts down.
        let delta = if me == 0 { 1 } else { -1 };
        let check0 = self.state.check.load(Relaxed);
        self.state.check.store(check0.wrapping_add(delta), Relaxed);
        let check1 = self.state.check.load(Relaxed);
        ctx.inc();

        self.unlock(me);

        if check0.wrapping_add(delta) != check1 {
            error!(
                "{} p{}: dekker mutex check failed {} vs {}",
                ctx.name(),
                me,
                check0.wrapping_add(delta),
                check1
            );
            return ExitStatus::Failure;
        }
        ExitStatus::Success
    }
}

impl Stressor for Dekker {
    fn name(&self) -> &'static str {
        "dekker"
    }

    fn class(&self) -> StressorClass {
        StressorClass::CPU_CACHE
    }

    /// The algorithm is defined for exactly two parties.
    fn workers(&self, _requested: usize) -> usize {
        2
    }

    fn prepare(&self, _args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        let state = Shared::<DekkerState>::new().context("Failed to map dekker state")?;
        Ok(Box::new(DekkerBody { state }))
    }
}
