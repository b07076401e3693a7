// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Process creation behind a trait, so the retry policy can be exercised
//! against injected failures.

use crate::HarnessError;
use crate::Result;
use crate::Termination;
use log::debug;
use nix::errno::Errno;
use nix::unistd::ForkResult;
use std::time::Duration;

/// Default number of retries for transient fork failures.
pub const FORK_RETRIES: u32 = 16;

const FORK_BACKOFF: Duration = Duration::from_millis(10);

pub trait Fork: Send + Sync {
    /// # Safety
    ///
    /// Same contract as `fork(2)`: in a multi-threaded parent the child may
    /// only rely on state that is consistent after fork.
    unsafe fn fork(&self) -> nix::Result<ForkResult>;
}

/// The real `fork(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysFork;

impl Fork for SysFork {
    unsafe fn fork(&self) -> nix::Result<ForkResult> {
        nix::unistd::fork()
    }
}

/// Errors worth another attempt: the process table or memory is briefly
/// exhausted, or a signal interrupted the call.
pub fn is_transient(errno: Errno) -> bool {
    matches!(errno, Errno::EAGAIN | Errno::ENOMEM | Errno::EINTR)
}

/// Fork, retrying transient failures up to `retries` times. Gives up early
/// once `term` has been stopped, so a run that is ending never spins on a
/// full process table.
///
/// # Safety
///
/// See [`Fork::fork`].
pub unsafe fn fork_with_retry(
    forker: &dyn Fork,
    term: &Termination,
    retries: u32,
) -> Result<ForkResult> {
    let mut attempt = 0;
    loop {
        match forker.fork() {
            Ok(res) => return Ok(res),
            Err(e) if is_transient(e) && attempt < retries && !term.stopped() => {
                attempt += 1;
                debug!("fork failed ({}), retry {}/{}", e, attempt, retries);
                if e != Errno::EINTR {
                    std::thread::sleep(FORK_BACKOFF);
                }
            }
            Err(e) if is_transient(e) => return Err(HarnessError::resource("fork", e)),
            Err(e) => return Err(HarnessError::sys("fork", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    /// Fails with `errno` every time and counts the attempts.
    struct AlwaysFail {
        errno: Errno,
        calls: AtomicU32,
    }

    impl Fork for AlwaysFail {
        unsafe fn fork(&self) -> nix::Result<ForkResult> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(self.errno)
        }
    }

    #[test]
    fn test_bounded_retries() {
        let term = Termination::new(None).unwrap();
        let forker = AlwaysFail {
            errno: Errno::EAGAIN,
            calls: AtomicU32::new(0),
        };
        let res = unsafe { fork_with_retry(&forker, &term, 3) };
        assert!(matches!(res, Err(HarnessError::Resource { .. })));
        assert_eq!(forker.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_hard_error_not_retried() {
        let term = Termination::new(None).unwrap();
        let forker = AlwaysFail {
            errno: Errno::EPERM,
            calls: AtomicU32::new(0),
        };
        let res = unsafe { fork_with_retry(&forker, &term, 3) };
        assert!(matches!(res, Err(HarnessError::Sys { .. })));
        assert_eq!(forker.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_retry_once_stopped() {
        let term = Termination::new(None).unwrap();
        term.request_stop();
        let forker = AlwaysFail {
            errno: Errno::ENOMEM,
            calls: AtomicU32::new(0),
        };
        let res = unsafe { fork_with_retry(&forker, &term, 16) };
        assert!(res.is_err());
        assert_eq!(forker.calls.load(Ordering::Relaxed), 1);
    }
}
