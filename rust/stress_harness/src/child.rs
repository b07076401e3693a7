// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Setup performed inside a freshly forked worker before it runs its body.

use crate::OomPolicy;
use log::debug;
use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::sys::signal::sigaction;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::unistd::getppid;
use nix::unistd::Pid;

/// Per-worker settings applied in the child right after fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChildConfig {
    /// Pin the worker to this CPU.
    pub cpu: Option<usize>,
    /// Absolute nice level for the worker.
    pub nice: Option<i32>,
    /// Make the worker a preferred OOM-killer victim before its first
    /// iteration.
    pub oom: Option<OomPolicy>,
}

impl ChildConfig {
    pub fn with_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = Some(nice);
        self
    }

    pub fn with_oom(mut self, policy: OomPolicy) -> Self {
        self.oom = Some(policy);
        self
    }
}

extern "C" fn unblock_handler(_: libc::c_int) {
    // Only here to interrupt a blocking syscall. The stop itself is read
    // from shared memory.
}

/// Install the SIGALRM handler used to knock workers out of blocking
/// syscalls. No `SA_RESTART`, so interrupted calls return `EINTR`.
pub fn install_unblock_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(unblock_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }.map(|_| ())
}

/// Die with the parent. Returns false if the parent is already gone, in
/// which case the caller must exit immediately.
pub fn die_with_parent(parent: Pid) -> bool {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
    }
    // The parent may have died between fork and prctl.
    getppid() == parent
}

pub fn set_affinity(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

pub fn set_nice(nice: i32) -> nix::Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if ret < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// Everything a worker does between fork and its first iteration. Settings
/// that cannot be applied are logged and skipped; only a dead parent stops
/// the child here.
pub fn prepare_child(name: &str, parent: Pid, config: &ChildConfig) -> bool {
    if !die_with_parent(parent) {
        return false;
    }
    if let Err(e) = install_unblock_handler() {
        debug!("{}: cannot install SIGALRM handler ({})", name, e);
    }
    if let Some(cpu) = config.cpu {
        if let Err(e) = set_affinity(cpu) {
            debug!("{}: cannot pin to CPU {} ({})", name, cpu, e);
        }
    }
    if let Some(nice) = config.nice {
        if let Err(e) = set_nice(nice) {
            debug!("{}: cannot set nice {} ({})", name, nice, e);
        }
    }
    true
}

/// Whether the calling process runs more than one thread. Unknown counts as
/// yes.
pub fn is_multithreaded() -> bool {
    std::fs::read_dir("/proc/self/task")
        .map(|d| d.count() > 1)
        .unwrap_or(true)
}

/// Cut a child forked from a multi-threaded parent off from the logger and
/// the panic message. Another parent thread may have held their locks at
/// fork time, so the child reports through its exit status only.
pub fn silence_child() {
    log::set_max_level(log::LevelFilter::Off);
    std::panic::set_hook(Box::new(|_| {}));
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::sys::wait::waitpid;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::fork;
    use nix::unistd::getpid;
    use nix::unistd::ForkResult;

    #[test]
    fn test_config_builders() {
        let cfg = ChildConfig::default().with_cpu(2).with_nice(5);
        assert_eq!(cfg.cpu, Some(2));
        assert_eq!(cfg.nice, Some(5));
        assert_eq!(cfg.oom, None);
    }

    #[test]
    fn test_sigalrm_interrupts_sleep() {
        let parent = getpid();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                if !prepare_child("test", parent, &ChildConfig::default()) {
                    unsafe { libc::_exit(2) };
                }
                // Survives SIGALRM and comes back out of the blocking call.
                let ret = unsafe { libc::sleep(30) };
                unsafe { libc::_exit(if ret > 0 { 0 } else { 1 }) };
            }
            ForkResult::Parent { child } => {
                std::thread::sleep(std::time::Duration::from_millis(200));
                kill(child, Signal::SIGALRM).unwrap();
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
