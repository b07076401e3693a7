// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::Serialize;
use std::fmt;

/// Exit status of a worker process or of a whole stressor instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ExitStatus {
    Success = 0,
    Failure = 1,
    NotSuccess = 2,
    NoResource = 3,
    NotImplemented = 4,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Unknown codes are treated as failures.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::NotSuccess,
            3 => Self::NoResource,
            4 => Self::NotImplemented,
            _ => Self::Failure,
        }
    }

    /// Whether this status counts against the stressor. "No resource" and
    /// "not implemented" mean the environment could not host the probe.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::NotSuccess)
    }

    pub fn is_skip(self) -> bool {
        matches!(self, Self::NoResource | Self::NotImplemented)
    }

    /// Pick the status that best describes a family of workers: any failure
    /// wins over a skip, a skip wins over success.
    pub fn worst(self, other: Self) -> Self {
        fn rank(s: ExitStatus) -> u8 {
            match s {
                ExitStatus::Success => 0,
                ExitStatus::NotImplemented => 1,
                ExitStatus::NoResource => 2,
                ExitStatus::NotSuccess => 3,
                ExitStatus::Failure => 4,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "passed",
            Self::Failure => "failed",
            Self::NotSuccess => "not successful",
            Self::NoResource => "skipped (no resource)",
            Self::NotImplemented => "skipped (not implemented)",
        };
        write!(f, "{}", s)
    }
}

/// How a worker process ended, as seen by its supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChildExit {
    Exited(ExitStatus),
    /// Killed by a signal the supervisor did not expect.
    KilledBySignal(i32),
    /// SIGKILL from someone other than the supervisor. Assumed to be the
    /// kernel's OOM killer, which cannot be told apart reliably.
    OomKilled,
    /// Killed by the signal the supervisor sent during shutdown.
    Terminated(i32),
    Unknown,
}

impl ChildExit {
    /// Classify a wait status. `sent` is the last signal the supervisor sent
    /// to this child, if any.
    pub fn classify(status: WaitStatus, sent: Option<Signal>) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(ExitStatus::from_code(code))),
            WaitStatus::Signaled(_, sig, _) => Some(Self::from_signal(sig, sent)),
            // Stops, continues and ptrace events leave the child alive.
            _ => None,
        }
    }

    fn from_signal(sig: Signal, sent: Option<Signal>) -> Self {
        if sent.is_some() && matches!(sig, Signal::SIGKILL | Signal::SIGALRM | Signal::SIGTERM) {
            return Self::Terminated(sig as i32);
        }
        match sig {
            Signal::SIGKILL => Self::OomKilled,
            _ => Self::KilledBySignal(sig as i32),
        }
    }

    /// Deaths the supervisor should report as a worker failure.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Exited(status) => status.is_failure(),
            Self::KilledBySignal(_) => true,
            Self::OomKilled | Self::Terminated(_) | Self::Unknown => false,
        }
    }

    /// Status this death contributes to the stressor's overall result.
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::Exited(status) => *status,
            Self::KilledBySignal(_) => ExitStatus::Failure,
            Self::OomKilled | Self::Terminated(_) | Self::Unknown => ExitStatus::Success,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signame = |sig: i32| {
            Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("signal {}", sig))
        };
        match self {
            Self::Exited(status) => write!(f, "exited: {}", status),
            Self::KilledBySignal(sig) => write!(f, "killed by {}", signame(*sig)),
            Self::OomKilled => write!(f, "killed by OOM killer (assumed)"),
            Self::Terminated(sig) => write!(f, "terminated by {}", signame(*sig)),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Read the kernel's cumulative OOM-kill count, when exposed.
pub(crate) fn read_oom_kill_count() -> Option<u64> {
    let vmstat = std::fs::read_to_string("/proc/vmstat").ok()?;
    vmstat
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_exit_codes() {
        for status in [
            ExitStatus::Success,
            ExitStatus::Failure,
            ExitStatus::NotSuccess,
            ExitStatus::NoResource,
            ExitStatus::NotImplemented,
        ] {
            assert_eq!(ExitStatus::from_code(status.code()), status);
        }
        assert_eq!(ExitStatus::from_code(101), ExitStatus::Failure);
    }

    #[test]
    fn test_worst() {
        use ExitStatus::*;
        assert_eq!(Success.worst(NoResource), NoResource);
        assert_eq!(NoResource.worst(Failure), Failure);
        assert_eq!(Failure.worst(Success), Failure);
        assert_eq!(NotImplemented.worst(NoResource), NoResource);
    }

    #[test]
    fn test_classify() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            ChildExit::classify(WaitStatus::Exited(pid, 0), None),
            Some(ChildExit::Exited(ExitStatus::Success))
        );
        assert_eq!(
            ChildExit::classify(WaitStatus::Exited(pid, 3), None),
            Some(ChildExit::Exited(ExitStatus::NoResource))
        );
        assert_eq!(
            ChildExit::classify(WaitStatus::Signaled(pid, Signal::SIGKILL, false), None),
            Some(ChildExit::OomKilled)
        );
        assert_eq!(
            ChildExit::classify(
                WaitStatus::Signaled(pid, Signal::SIGKILL, false),
                Some(Signal::SIGKILL)
            ),
            Some(ChildExit::Terminated(libc::SIGKILL))
        );
        assert_eq!(
            ChildExit::classify(WaitStatus::Signaled(pid, Signal::SIGSEGV, true), None),
            Some(ChildExit::KilledBySignal(libc::SIGSEGV))
        );
        assert_eq!(
            ChildExit::classify(
                WaitStatus::Signaled(pid, Signal::SIGSEGV, true),
                Some(Signal::SIGALRM)
            ),
            Some(ChildExit::KilledBySignal(libc::SIGSEGV))
        );
        assert_eq!(ChildExit::classify(WaitStatus::StillAlive, None), None);
    }

    #[test]
    fn test_failure_classes() {
        assert!(ChildExit::KilledBySignal(libc::SIGSEGV).is_failure());
        assert!(ChildExit::Exited(ExitStatus::Failure).is_failure());
        assert!(!ChildExit::OomKilled.is_failure());
        assert!(!ChildExit::Terminated(libc::SIGKILL).is_failure());
        assert!(!ChildExit::Exited(ExitStatus::NoResource).is_failure());
    }
}
