// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # OOM-able workers
//!
//! Some stressors exhaust memory on purpose. Their workers volunteer as the
//! OOM killer's first victim, and a SIGKILL the supervisor did not send is
//! taken as routine rather than as a bug: the worker is quietly replaced and
//! the run carries on.
//!
//! There are two forms. [`run_oomable`] marks the calling process and runs
//! the body in place; the supervisor (with [`Respawn::OnOomKill`]) handles
//! the replacement. Workers of a supervisor with an [`OomPolicy`] enter
//! their first iteration through it. [`oomable_child`] is for use inside a worker that wants
//! to keep its own process alive: it forks a grandchild for each attempt and
//! restarts it after an OOM kill.

use crate::ChildExit;
use crate::CounterBlock;
use crate::ExitStatus;
use crate::Respawn;
use crate::SlotState;
use crate::Supervisor;
use crate::WorkerBody;
use crate::WorkerContext;
use log::debug;
use std::fs;

/// How an OOM-able worker is prepared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OomPolicy {
    /// Don't report OOM kills above debug level.
    pub quiet: bool,
    /// Drop all capabilities before running the body.
    pub drop_cap: bool,
}

impl OomPolicy {
    pub const DEFAULT: Self = Self {
        quiet: false,
        drop_cap: false,
    };
    pub const QUIET: Self = Self {
        quiet: true,
        drop_cap: false,
    };
    pub const DROP_CAP: Self = Self {
        quiet: false,
        drop_cap: true,
    };

    pub const fn union(self, other: Self) -> Self {
        Self {
            quiet: self.quiet || other.quiet,
            drop_cap: self.drop_cap || other.drop_cap,
        }
    }
}

/// Make the calling process the preferred OOM-killer victim. Best-effort:
/// kernels without either knob simply keep their default scoring.
pub fn make_oomable() -> std::io::Result<()> {
    match fs::write("/proc/self/oom_score_adj", "1000") {
        Ok(()) => Ok(()),
        Err(_) => fs::write("/proc/self/oom_adj", "15"),
    }
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Forbid privilege gain through exec and clear every capability set.
pub fn drop_capabilities() -> nix::Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(nix::errno::Errno::last());
    }

    let mut hdr = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData::default(); 2];
    let ret = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &mut hdr as *mut CapHeader,
            data.as_ptr(),
        )
    };
    if ret < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// Apply `policy` to the calling process, logging what could not be done.
pub fn apply_policy(name: &str, policy: OomPolicy) {
    if let Err(e) = make_oomable() {
        debug!("{}: cannot adjust OOM score ({})", name, e);
    }
    if policy.drop_cap {
        if let Err(e) = drop_capabilities() {
            debug!("{}: cannot drop capabilities ({})", name, e);
        }
    }
}

/// Mark the current process as OOM-able and run `body` in it.
pub fn run_oomable(ctx: &mut WorkerContext, policy: OomPolicy, body: &dyn WorkerBody) -> ExitStatus {
    apply_policy(ctx.name(), policy);
    body.run(ctx)
}

/// Run `body` once in a forked, OOM-able grandchild that counts into the
/// caller's slot, restarting it for as long as it is OOM killed and the
/// run goes on. An OOM kill is never reported as a failure.
pub fn oomable_child(ctx: &mut WorkerContext, policy: OomPolicy, body: &dyn WorkerBody) -> ExitStatus {
    let counters: &CounterBlock = ctx.counters();
    let mut sup = Supervisor::new(ctx.args(), counters, ctx.termination())
        .workers(1, ctx.counter_slot())
        .forker(ctx.forker())
        .respawn(Respawn::OnOomKill)
        .oom_policy(Some(policy))
        .one_shot(true);

    if let Err(e) = sup.spawn_worker(0, body) {
        debug!("{}: cannot fork OOM-able child ({})", ctx.name(), e);
        return e.exit_status();
    }
    sup.supervise(body);
    // Still alive only if the run is ending.
    if sup.live() > 0 {
        sup.shutdown_all();
    }

    match sup.slots()[0].state {
        SlotState::Reaped(ChildExit::Exited(status)) => status,
        SlotState::Reaped(ChildExit::KilledBySignal(_)) => ExitStatus::Failure,
        _ => ExitStatus::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_union() {
        let p = OomPolicy::QUIET.union(OomPolicy::DROP_CAP);
        assert!(p.quiet);
        assert!(p.drop_cap);
        assert_eq!(OomPolicy::DEFAULT, OomPolicy::default());
    }

    #[test]
    fn test_make_oomable_in_child() {
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let ok = match make_oomable() {
                    Ok(()) => fs::read_to_string("/proc/self/oom_score_adj")
                        .map(|s| s.trim() == "1000")
                        .unwrap_or(true),
                    // No procfs in this environment.
                    Err(_) => true,
                };
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }

    fn run_in_child(f: impl FnOnce() -> bool) {
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let ok = f();
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }

    #[test]
    fn test_run_oomable_marks_then_runs() {
        let args = crate::StressorArgs::new("oomable");
        let counters = CounterBlock::create(1).unwrap();
        let term = crate::Termination::new(None).unwrap();
        let forker = crate::SysFork;
        run_in_child(|| {
            let mut ctx = WorkerContext::new(&args, 0, 1, 0, &counters, &term, &forker);
            let body = crate::BodyFn::new(|ctx: &mut WorkerContext| {
                let adj = fs::read_to_string("/proc/self/oom_score_adj");
                ctx.inc();
                match adj {
                    Ok(s) if s.trim() != "1000" => ExitStatus::Failure,
                    _ => ExitStatus::Success,
                }
            });
            run_oomable(&mut ctx, OomPolicy::DEFAULT, &body) == ExitStatus::Success
        });
        assert_eq!(counters.get(0), 1);
    }

    #[test]
    fn test_drop_cap_sets_no_new_privs() {
        run_in_child(|| {
            apply_policy("oomable", OomPolicy::DROP_CAP);
            unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
        });
    }

    #[test]
    fn test_oomable_child_counts_into_callers_slot() {
        let args = crate::StressorArgs::new("oomable");
        let counters = CounterBlock::create(2).unwrap();
        let term = crate::Termination::new(None).unwrap();
        let forker = crate::SysFork;
        run_in_child(|| {
            let mut ctx = WorkerContext::new(&args, 1, 2, 1, &counters, &term, &forker);
            let body = crate::BodyFn::new(|ctx: &mut WorkerContext| {
                ctx.inc();
                ExitStatus::Success
            });
            oomable_child(&mut ctx, OomPolicy::QUIET.union(OomPolicy::DROP_CAP), &body)
                == ExitStatus::Success
        });
        assert_eq!(counters.get(0), 0);
        assert_eq!(counters.get(1), 1);
    }
}
