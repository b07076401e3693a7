// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::child;
use crate::exit::read_oom_kill_count;
use crate::fork::fork_with_retry;
use crate::fork::FORK_RETRIES;
use crate::kill_pid;
use crate::killpid::open_pidfd;
use crate::killpid::wait_pidfds;
use crate::oomable;
use crate::ChildConfig;
use crate::ChildExit;
use crate::CounterBlock;
use crate::ExitStatus;
use crate::Fork;
use crate::OomPolicy;
use crate::Result;
use crate::StressorArgs;
use crate::SysFork;
use crate::Termination;
use crate::WorkerBody;
use crate::WorkerContext;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::getpid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use serde::Serialize;
use std::os::fd::OwnedFd;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use std::time::Instant;

const DEFAULT_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_POLL: Duration = Duration::from_millis(10);
const MIN_BACKOFF: Duration = Duration::from_micros(50);

/// Lifecycle of one worker slot.
///
/// `Empty -> Spawning -> Running -> Exited -> Reaped`, after which a slot
/// either goes back to `Empty` for a respawn or stays `Reaped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Spawning,
    Running(Pid),
    Exited(Pid, ChildExit),
    Reaped(ChildExit),
}

/// Which worker deaths get a replacement while the run is still going.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Respawn {
    #[default]
    Never,
    /// Only workers taken by the OOM killer.
    OnOomKill,
    /// Any worker that exits, e.g. children designed to finish early.
    Always,
}

impl Respawn {
    fn wants(self, exit: &ChildExit) -> bool {
        match self {
            Self::Never => false,
            // A worker that vanished without a status may have been OOM
            // killed too.
            Self::OnOomKill => matches!(exit, ChildExit::OomKilled | ChildExit::Unknown),
            Self::Always => !matches!(exit, ChildExit::Terminated(_)),
        }
    }
}

#[derive(Debug)]
pub struct WorkerSlot {
    pub index: usize,
    pub state: SlotState,
    /// Processes started in this slot.
    pub spawns: u64,
    /// Processes reaped from this slot. Equal to `spawns` once the slot is
    /// idle.
    pub reaps: u64,
    pub last_exit: Option<ChildExit>,
    sent: Option<Signal>,
    /// Readable once the running worker exits.
    pidfd: Option<OwnedFd>,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Empty,
            spawns: 0,
            reaps: 0,
            last_exit: None,
            sent: None,
            pidfd: None,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.state {
            SlotState::Running(pid) | SlotState::Exited(pid, _) => Some(pid),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.pid().is_some()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub spawns: u64,
    pub respawns: u64,
    pub oom_kills: u64,
    pub unexpected_deaths: u64,
    pub failures: u64,
    pub fork_failures: u64,
}

/// Forks a family of workers, watches them and tears them down.
///
/// The supervisor only ever waits on the PIDs it spawned, so several
/// supervisors can share a process without stealing each other's children.
/// Dropping a supervisor with live workers shuts them down.
pub struct Supervisor<'a> {
    args: &'a StressorArgs,
    counters: &'a CounterBlock,
    term: &'a Termination,
    forker: &'a dyn Fork,
    parent: Pid,
    slots: Vec<WorkerSlot>,
    counter_offset: usize,
    respawn: Respawn,
    oom: Option<OomPolicy>,
    one_shot: bool,
    grace: Duration,
    poll: Duration,
    fork_retries: u32,
    status: ExitStatus,
    stats: SupervisorStats,
    oom_kill_seen: Option<u64>,
    /// Forked children must not touch the logger.
    threaded: bool,
}

impl<'a> Supervisor<'a> {
    /// One slot per counter in `counters`.
    pub fn new(args: &'a StressorArgs, counters: &'a CounterBlock, term: &'a Termination) -> Self {
        Self {
            args,
            counters,
            term,
            forker: &SysFork,
            parent: getpid(),
            slots: (0..counters.slots()).map(WorkerSlot::new).collect(),
            counter_offset: 0,
            respawn: Respawn::Never,
            oom: None,
            one_shot: false,
            grace: DEFAULT_GRACE,
            poll: DEFAULT_POLL,
            fork_retries: FORK_RETRIES,
            status: ExitStatus::Success,
            stats: SupervisorStats::default(),
            oom_kill_seen: None,
            threaded: child::is_multithreaded(),
        }
    }

    /// Supervise `nr` workers counting into `counter_offset..` of the block.
    pub fn workers(mut self, nr: usize, counter_offset: usize) -> Self {
        let nr = nr.min(self.counters.slots().saturating_sub(counter_offset));
        self.slots = (0..nr).map(WorkerSlot::new).collect();
        self.counter_offset = counter_offset;
        self
    }

    pub fn forker(mut self, forker: &'a dyn Fork) -> Self {
        self.forker = forker;
        self
    }

    pub fn respawn(mut self, respawn: Respawn) -> Self {
        self.respawn = respawn;
        self
    }

    /// Applied to every worker on top of the body's own configuration.
    pub fn oom_policy(mut self, policy: Option<OomPolicy>) -> Self {
        self.oom = policy;
        self
    }

    /// Run the body once per process instead of looping it until stop.
    pub fn one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }

    /// How long workers get to leave on their own during shutdown.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn fork_retries(mut self, retries: u32) -> Self {
        self.fork_retries = retries;
        self
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// Worst status reported by any worker so far.
    pub fn status(&self) -> ExitStatus {
        self.status
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_live()).count()
    }

    fn name(&self) -> &str {
        &self.args.name
    }

    /// Fork a worker into `slot`. In the child this never returns.
    pub fn spawn_worker(&mut self, slot: usize, body: &dyn WorkerBody) -> Result<Pid> {
        let s = &mut self.slots[slot];
        debug_assert!(!s.is_live(), "slot {} still owns a process", slot);
        s.state = SlotState::Spawning;

        let res = unsafe { fork_with_retry(self.forker, self.term, self.fork_retries) };
        match res {
            Ok(ForkResult::Child) => {
                let code = self.child_main(slot, body);
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                let s = &mut self.slots[slot];
                s.state = SlotState::Running(child);
                s.spawns += 1;
                s.sent = None;
                s.pidfd = open_pidfd(child);
                self.stats.spawns += 1;
                trace!("{}: slot {} spawned pid {}", self.args.name, slot, child);
                Ok(child)
            }
            Err(e) => {
                self.slots[slot].state = SlotState::Empty;
                self.stats.fork_failures += 1;
                Err(e)
            }
        }
    }

    fn child_main(&self, slot: usize, body: &dyn WorkerBody) -> i32 {
        if self.threaded {
            child::silence_child();
        }
        let mut config: ChildConfig = body.child_config(slot);
        if config.oom.is_none() {
            config.oom = self.oom;
        }
        if !child::prepare_child(self.name(), self.parent, &config) {
            return ExitStatus::Success.code();
        }

        let mut ctx = WorkerContext::new(
            self.args,
            slot,
            self.slots.len(),
            self.counter_offset + slot,
            self.counters,
            self.term,
            self.forker,
        );
        let one_shot = self.one_shot;
        let mut oom = config.oom;
        let res = catch_unwind(AssertUnwindSafe(|| {
            let mut step = |ctx: &mut WorkerContext| match oom.take() {
                Some(policy) => oomable::run_oomable(ctx, policy, body),
                None => body.run(ctx),
            };
            if one_shot {
                return step(&mut ctx);
            }
            let mut status = ExitStatus::Success;
            while ctx.keep_stressing() {
                status = step(&mut ctx);
                if status != ExitStatus::Success {
                    break;
                }
            }
            status
        }));
        // A panic has already unwound out of the body; the parent logs the
        // failure.
        res.unwrap_or(ExitStatus::Failure).code()
    }

    /// Start a worker in every empty slot. Fails only if not a single worker
    /// could be started; a partially started family keeps running.
    pub fn spawn_all(&mut self, body: &dyn WorkerBody) -> Result<usize> {
        self.oom_kill_seen = read_oom_kill_count();
        let mut started = 0;
        let mut last_err = None;
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_live() || self.term.stopped() {
                continue;
            }
            match self.spawn_worker(slot, body) {
                Ok(_) => started += 1,
                Err(e) => {
                    warn!("{}: cannot start worker {} ({})", self.name(), slot, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if started == 0 && self.live() == 0 => Err(e),
            Some(_) => {
                warn!(
                    "{}: running with {} of {} workers",
                    self.name(),
                    self.live(),
                    self.slots.len()
                );
                Ok(started)
            }
            None => Ok(started),
        }
    }

    fn record_exit(&mut self, slot: usize, pid: Pid, exit: ChildExit) {
        self.slots[slot].state = SlotState::Exited(pid, exit);

        match exit {
            ChildExit::OomKilled => {
                self.stats.oom_kills += 1;
                let now = read_oom_kill_count();
                let confirmed = matches!((self.oom_kill_seen, now), (Some(a), Some(b)) if b > a);
                self.oom_kill_seen = now;
                let quiet = self.oom.map(|p| p.quiet).unwrap_or(false);
                if quiet {
                    debug!("{}: worker {} (pid {}) OOM killed", self.name(), slot, pid);
                } else {
                    info!(
                        "{}: assuming worker {} (pid {}) was killed by the OOM killer{}",
                        self.name(),
                        slot,
                        pid,
                        if confirmed { ", kernel confirms" } else { "" }
                    );
                }
            }
            ChildExit::KilledBySignal(_) => {
                self.stats.unexpected_deaths += 1;
                warn!("{}: worker {} (pid {}) {}", self.name(), slot, pid, exit);
            }
            ChildExit::Exited(status) if status.is_failure() => {
                self.stats.failures += 1;
                warn!("{}: worker {} (pid {}) {}", self.name(), slot, pid, exit);
            }
            _ => trace!("{}: worker {} (pid {}) {}", self.name(), slot, pid, exit),
        }
        self.status = self.status.worst(exit.status());

        let s = &mut self.slots[slot];
        s.pidfd = None;
        s.reaps += 1;
        s.last_exit = Some(exit);
        s.state = SlotState::Reaped(exit);
    }

    /// Reap whatever has exited without blocking. Returns how many workers
    /// are still alive.
    fn reap_nonblocking(&mut self) -> usize {
        let mut live = 0;
        for slot in 0..self.slots.len() {
            let SlotState::Running(pid) = self.slots[slot].state else {
                continue;
            };
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => live += 1,
                Ok(status) => match ChildExit::classify(status, self.slots[slot].sent) {
                    Some(exit) => self.record_exit(slot, pid, exit),
                    None => live += 1,
                },
                Err(Errno::ECHILD) => self.record_exit(slot, pid, ChildExit::Unknown),
                Err(e) => {
                    debug!("{}: waitpid({}) failed ({})", self.name(), pid, e);
                    self.record_exit(slot, pid, ChildExit::Unknown);
                }
            }
        }
        live
    }

    fn respawn_reaped(&mut self, body: &dyn WorkerBody) {
        for slot in 0..self.slots.len() {
            let SlotState::Reaped(exit) = self.slots[slot].state else {
                continue;
            };
            if self.slots[slot].sent.is_some() || !self.respawn.wants(&exit) {
                continue;
            }
            if !self.term.should_continue(self.counters) {
                return;
            }
            self.slots[slot].state = SlotState::Empty;
            match self.spawn_worker(slot, body) {
                Ok(pid) => {
                    self.stats.respawns += 1;
                    debug!("{}: respawned worker {} as pid {}", self.name(), slot, pid);
                }
                Err(e) => {
                    warn!("{}: cannot respawn worker {} ({})", self.name(), slot, e);
                    self.status = self.status.worst(e.exit_status());
                }
            }
        }
    }

    /// Watch the workers until the termination context says stop or no
    /// worker is left alive and none is due for a respawn. Replacements are
    /// started in the same pass that reaps the dead worker.
    pub fn supervise(&mut self, body: &dyn WorkerBody) {
        let mut backoff = MIN_BACKOFF;
        loop {
            let reaps = self.reaps();
            self.reap_nonblocking();
            self.respawn_reaped(body);
            if !self.term.should_continue(self.counters) || self.live() == 0 {
                break;
            }
            if self.reaps() != reaps {
                backoff = MIN_BACKOFF;
            }
            backoff = self.wait_for_exit(backoff);
        }
    }

    fn reaps(&self) -> u64 {
        self.slots.iter().map(|s| s.reaps).sum()
    }

    /// Sleep until a worker exits, the poll interval passes or a signal
    /// arrives. Without pidfds, sleep for `backoff` instead and return the
    /// next, longer backoff, capped at the poll interval.
    fn wait_for_exit(&self, backoff: Duration) -> Duration {
        let pidfds: Vec<&OwnedFd> = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Running(_)))
            .filter_map(|s| s.pidfd.as_ref())
            .collect();
        if !pidfds.is_empty() && pidfds.len() == self.live() {
            wait_pidfds(&pidfds, self.poll);
            return backoff;
        }
        std::thread::sleep(backoff.min(self.poll));
        (backoff * 2).min(self.poll)
    }

    fn signal_live(&mut self, sig: Signal) {
        for slot in self.slots.iter_mut() {
            if let SlotState::Running(pid) = slot.state {
                slot.sent = Some(sig);
                match kill(pid, sig) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => debug!("kill({}, {}) failed ({})", pid, sig, e),
                }
            }
        }
    }

    fn wait_blocking(&mut self, slot: usize) {
        let SlotState::Running(pid) = self.slots[slot].state else {
            return;
        };
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(exit) = ChildExit::classify(status, self.slots[slot].sent) {
                        self.record_exit(slot, pid, exit);
                        return;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if e != Errno::ECHILD {
                        debug!("{}: waitpid({}) failed ({})", self.name(), pid, e);
                    }
                    self.record_exit(slot, pid, ChildExit::Unknown);
                    return;
                }
            }
        }
    }

    /// Stop and reap every worker: latch the stop flag, send SIGALRM to
    /// knock workers out of blocking calls, give them the grace period to
    /// leave, then SIGKILL and reap the rest. Safe to call repeatedly.
    pub fn shutdown_all(&mut self) {
        self.term.request_stop();
        if self.live() == 0 {
            return;
        }

        self.signal_live(Signal::SIGALRM);
        let deadline = Instant::now() + self.grace;
        let mut backoff = MIN_BACKOFF;
        while self.reap_nonblocking() > 0 && Instant::now() < deadline {
            backoff = self.wait_for_exit(backoff);
        }

        for slot in 0..self.slots.len() {
            if let SlotState::Running(pid) = self.slots[slot].state {
                self.slots[slot].sent = Some(Signal::SIGKILL);
                if let Err(e) = kill_pid(pid) {
                    debug!("{}: cannot kill pid {} ({})", self.name(), pid, e);
                }
                self.wait_blocking(slot);
            }
        }
    }
}

impl Drop for Supervisor<'_> {
    fn drop(&mut self) {
        // Only the process that forked the workers may reap them.
        if getpid() == self.parent && self.live() > 0 {
            self.shutdown_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stressor::BodyFn;

    fn spin(ctx: &mut WorkerContext) -> ExitStatus {
        ctx.inc();
        std::hint::spin_loop();
        ExitStatus::Success
    }

    #[test]
    fn test_respawn_policy() {
        assert!(!Respawn::Never.wants(&ChildExit::OomKilled));
        assert!(Respawn::OnOomKill.wants(&ChildExit::OomKilled));
        assert!(!Respawn::OnOomKill.wants(&ChildExit::KilledBySignal(libc::SIGSEGV)));
        assert!(Respawn::OnOomKill.wants(&ChildExit::Unknown));
        assert!(!Respawn::OnOomKill.wants(&ChildExit::Exited(ExitStatus::Success)));
        assert!(Respawn::Always.wants(&ChildExit::Exited(ExitStatus::Success)));
        assert!(!Respawn::Always.wants(&ChildExit::Terminated(libc::SIGKILL)));
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let args = StressorArgs::new("spin");
        let counters = CounterBlock::create(2).unwrap();
        let term = Termination::new(None).unwrap();
        let body = BodyFn::new(spin);
        let mut sup = Supervisor::new(&args, &counters, &term);

        assert_eq!(sup.spawn_all(&body).unwrap(), 2);
        assert_eq!(sup.live(), 2);
        std::thread::sleep(Duration::from_millis(100));
        sup.shutdown_all();

        assert_eq!(sup.live(), 0);
        for slot in sup.slots() {
            assert!(matches!(slot.state, SlotState::Reaped(_)));
            assert_eq!(slot.spawns, slot.reaps);
        }
        assert!(counters.get(0) > 0);
        assert!(counters.get(1) > 0);
        assert_eq!(sup.status(), ExitStatus::Success);
    }

    #[test]
    fn test_worker_failure_does_not_stop_siblings() {
        let args = StressorArgs::new("mixed");
        let counters = CounterBlock::create(2).unwrap();
        let term = Termination::new(None).unwrap();
        let body = BodyFn::new(|ctx: &mut WorkerContext| {
            if ctx.slot() == 0 {
                return ExitStatus::Failure;
            }
            ctx.inc();
            ExitStatus::Success
        });
        term.install_deadline(Duration::from_millis(300)).unwrap();
        let mut sup = Supervisor::new(&args, &counters, &term);
        sup.spawn_all(&body).unwrap();
        sup.supervise(&body);
        assert!(term.stopped());
        sup.shutdown_all();

        assert_eq!(sup.stats().failures, 1);
        assert_eq!(sup.status(), ExitStatus::Failure);
        assert_eq!(counters.get(0), 0);
        assert!(counters.get(1) > 0);
    }

    #[test]
    fn test_panic_maps_to_failure() {
        let args = StressorArgs::new("panic");
        let counters = CounterBlock::create(1).unwrap();
        let term = Termination::new(None).unwrap();
        let body = BodyFn::new(|_: &mut WorkerContext| -> ExitStatus { panic!("boom") });
        let mut sup = Supervisor::new(&args, &counters, &term);
        sup.spawn_all(&body).unwrap();
        sup.supervise(&body);
        assert_eq!(
            sup.slots()[0].last_exit,
            Some(ChildExit::Exited(ExitStatus::Failure))
        );
    }

    #[test]
    fn test_threaded_parent_silences_children() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let helper = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        log::set_max_level(log::LevelFilter::Trace);

        let args = StressorArgs::new("quiet");
        let counters = CounterBlock::create(1).unwrap();
        let term = Termination::new(None).unwrap();
        let body = BodyFn::new(|_: &mut WorkerContext| {
            if log::max_level() == log::LevelFilter::Off {
                ExitStatus::Success
            } else {
                ExitStatus::Failure
            }
        });
        let mut sup = Supervisor::new(&args, &counters, &term).one_shot(true);
        sup.spawn_all(&body).unwrap();
        sup.supervise(&body);
        drop(tx);
        helper.join().unwrap();

        assert_eq!(
            sup.slots()[0].last_exit,
            Some(ChildExit::Exited(ExitStatus::Success))
        );
        assert_ne!(log::max_level(), log::LevelFilter::Off);
    }
}
