// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::time::Duration;

// Same number on every architecture using the unified syscall table.
const SYS_PROCESS_MRELEASE: libc::c_long = 448;

/// SIGKILL `pid` and ask the kernel to reclaim its memory right away instead
/// of waiting for the exit path.
///
/// The pidfd and `process_mrelease` parts are best-effort. A process that is
/// already gone (`ESRCH`) is not an error.
pub fn kill_pid(pid: Pid) -> nix::Result<()> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) } as libc::c_int;

    let ret = match kill(pid, Signal::SIGKILL) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    };

    if pidfd >= 0 {
        if ret.is_ok() {
            unsafe {
                libc::syscall(SYS_PROCESS_MRELEASE, pidfd, 0);
            }
        }
        unsafe {
            libc::close(pidfd);
        }
    }
    ret
}

/// A pidfd for our own child `pid`, or `None` on kernels without pidfds.
///
/// The pid cannot be recycled while the child is unreaped, so opening it
/// after fork is race free.
pub(crate) fn open_pidfd(pid: Pid) -> Option<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

/// Sleep until one of `pidfds` becomes readable, i.e. its process exited, or
/// until `timeout` passes or a signal arrives. Returns true if a process
/// exited.
pub(crate) fn wait_pidfds(pidfds: &[&OwnedFd], timeout: Duration) -> bool {
    let mut fds: Vec<libc::pollfd> = pidfds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let ms = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    ret > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::fork;
    use nix::unistd::ForkResult;

    #[test]
    fn test_kill_and_rekill() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => {
                kill_pid(child).unwrap();
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Signaled(child, Signal::SIGKILL, false));
                // Reaped, so the pid no longer exists.
                assert!(kill_pid(child).is_ok());
            }
        }
    }

    #[test]
    fn test_pidfd_wakes_on_exit() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                std::thread::sleep(Duration::from_millis(50));
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                let Some(fd) = open_pidfd(child) else {
                    waitpid(child, None).unwrap();
                    return;
                };
                let start = std::time::Instant::now();
                assert!(wait_pidfds(&[&fd], Duration::from_secs(10)));
                assert!(start.elapsed() < Duration::from_secs(5));
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
