// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::counter::CounterBlock;
use crate::shm::Shared;
use crate::HarnessError;
use crate::Result;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const REASON_NONE: u8 = 0;

/// Why a stressor instance stopped. Only the first reason is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Requested = 1,
    Deadline = 2,
    MaxOps = 3,
    /// Every worker left on its own and none was due for a respawn.
    WorkersExited = 4,
}

impl StopReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Requested),
            2 => Some(Self::Deadline),
            3 => Some(Self::MaxOps),
            4 => Some(Self::WorkersExited),
            _ => None,
        }
    }
}

#[derive(Default)]
struct TerminationState {
    stop: AtomicBool,
    reason: AtomicU8,
    start_ns: AtomicU64,
    /// Absolute CLOCK_MONOTONIC deadline, 0 when none is armed.
    deadline_ns: AtomicU64,
    /// 0 means unlimited.
    max_ops: AtomicU64,
}

fn monotonic_ns() -> Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return Err(HarnessError::Configuration(format!(
            "CLOCK_MONOTONIC unavailable: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Cooperative stop signal for one stressor instance.
///
/// The state lives in shared memory, so a stop latched by any process of the
/// family (the supervisor, a worker reaching the op limit, a Ctrl-C handler)
/// is seen by all of them on their next check. Once stopped, it stays
/// stopped. CLOCK_MONOTONIC is system wide, so every process compares
/// against the same deadline.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Termination {
    state: Arc<Shared<TerminationState>>,
}

impl Termination {
    pub fn new(max_ops: Option<u64>) -> Result<Self> {
        let state = Shared::<TerminationState>::new()?;
        state.start_ns.store(monotonic_ns()?, Ordering::Relaxed);
        state
            .max_ops
            .store(max_ops.unwrap_or(0), Ordering::Relaxed);
        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Arm the deadline `duration` from now, replacing any pending one.
    pub fn install_deadline(&self, duration: Duration) -> Result<()> {
        let now = monotonic_ns()?;
        let dur_ns = u64::try_from(duration.as_nanos()).map_err(|_| {
            HarnessError::Configuration(format!("deadline {:?} out of range", duration))
        })?;
        if self.state.deadline_ns.load(Ordering::Relaxed) == 0 {
            self.state.start_ns.store(now, Ordering::Relaxed);
        }
        self.state
            .deadline_ns
            .store(now.saturating_add(dur_ns).max(1), Ordering::Release);
        Ok(())
    }

    pub fn max_ops(&self) -> Option<u64> {
        match self.state.max_ops.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    fn latch(&self, reason: StopReason) {
        let _ = self.state.reason.compare_exchange(
            REASON_NONE,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.state.stop.store(true, Ordering::Release);
    }

    /// Whether both handles refer to the same shared state.
    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Latch the stop flag. Calling it again has no further effect.
    pub fn request_stop(&self) {
        self.latch(StopReason::Requested);
    }

    /// Latch the stop flag because the family has no worker left.
    pub fn workers_exited(&self) {
        self.latch(StopReason::WorkersExited);
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.state.stop.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.state.reason.load(Ordering::Acquire))
    }

    fn deadline_expired(&self) -> bool {
        let deadline = self.state.deadline_ns.load(Ordering::Acquire);
        if deadline == 0 {
            return false;
        }
        match monotonic_ns() {
            Ok(now) => now >= deadline,
            // A clock that stopped working can no longer bound the run.
            Err(_) => true,
        }
    }

    /// The stop flag and deadline only, for loops that have no counters at
    /// hand.
    #[inline]
    pub fn keep_stressing_flag(&self) -> bool {
        if self.stopped() {
            return false;
        }
        if self.deadline_expired() {
            self.latch(StopReason::Deadline);
            return false;
        }
        true
    }

    /// The predicate every worker loop tests once per iteration.
    #[inline]
    pub fn should_continue(&self, counters: &CounterBlock) -> bool {
        if !self.keep_stressing_flag() {
            return false;
        }
        if let Some(max) = self.max_ops() {
            if counters.aggregate() >= max {
                self.latch(StopReason::MaxOps);
                return false;
            }
        }
        true
    }

    /// Time since the context was created or since the first deadline was
    /// armed.
    pub fn elapsed(&self) -> Duration {
        let start = self.state.start_ns.load(Ordering::Relaxed);
        let now = monotonic_ns().unwrap_or(start);
        Duration::from_nanos(now.saturating_sub(start))
    }

    /// Time left until the armed deadline, `None` when no deadline is armed.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.state.deadline_ns.load(Ordering::Acquire);
        if deadline == 0 {
            return None;
        }
        let now = monotonic_ns().unwrap_or(deadline);
        Some(Duration::from_nanos(deadline.saturating_sub(now)))
    }
}

impl std::fmt::Debug for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Termination")
            .field("stopped", &self.stopped())
            .field("reason", &self.reason())
            .field("max_ops", &self.max_ops())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_runs_until_requested() {
        let term = Termination::new(None).unwrap();
        let counters = CounterBlock::create(1).unwrap();
        assert!(term.should_continue(&counters));
        assert!(term.remaining().is_none());
        term.request_stop();
        term.request_stop();
        assert!(!term.should_continue(&counters));
        assert_eq!(term.reason(), Some(StopReason::Requested));
    }

    #[test]
    fn test_workers_exited_survives_shutdown() {
        let term = Termination::new(None).unwrap();
        term.workers_exited();
        term.request_stop();
        assert!(term.stopped());
        assert_eq!(term.reason(), Some(StopReason::WorkersExited));
    }

    #[test]
    fn test_deadline_fires_within_slack() {
        let term = Termination::new(None).unwrap();
        let counters = CounterBlock::create(1).unwrap();
        let start = Instant::now();
        term.install_deadline(Duration::from_millis(100)).unwrap();
        while term.should_continue(&counters) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let took = start.elapsed();
        assert!(took >= Duration::from_millis(100));
        assert!(took < Duration::from_millis(600), "took {:?}", took);
        assert_eq!(term.reason(), Some(StopReason::Deadline));
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let term = Termination::new(None).unwrap();
        term.install_deadline(Duration::from_millis(1)).unwrap();
        term.install_deadline(Duration::from_secs(3600)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(term.keep_stressing_flag());
        assert!(term.remaining().unwrap() > Duration::from_secs(3000));
    }

    #[test]
    fn test_max_ops_latches() {
        let term = Termination::new(Some(100)).unwrap();
        let counters = CounterBlock::create(2).unwrap();
        counters.add(0, 60);
        assert!(term.should_continue(&counters));
        counters.add(1, 40);
        assert!(!term.should_continue(&counters));
        assert_eq!(term.reason(), Some(StopReason::MaxOps));

        // Stays stopped even if a later reader sees fewer ops.
        let fresh = CounterBlock::create(1).unwrap();
        assert!(!term.should_continue(&fresh));
    }

    #[test]
    fn test_first_reason_wins() {
        let term = Termination::new(Some(1)).unwrap();
        let counters = CounterBlock::create(1).unwrap();
        counters.inc(0);
        assert!(!term.should_continue(&counters));
        term.request_stop();
        assert_eq!(term.reason(), Some(StopReason::MaxOps));
    }

    #[test]
    fn test_stop_from_child_is_seen_by_parent() {
        let term = Termination::new(None).unwrap();
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                term.request_stop();
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
                assert!(term.stopped());
            }
        }
    }
}
