// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::exit::ExitStatus;
use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors raised by the harness itself. None of them is fatal to the whole
/// run: each one ends the stressor instance it was raised for, and the
/// variant decides which exit status that instance reports.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Out of some resource (memory for shared counters, process slots).
    /// The stressor is skipped, not failed.
    #[error("{what}: no resource ({source})")]
    Resource {
        what: &'static str,
        #[source]
        source: Errno,
    },

    /// The harness could not be set up for this stressor, e.g. the deadline
    /// could not be armed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The probe cannot run in this environment.
    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },
}

impl HarnessError {
    pub fn resource(what: &'static str, source: Errno) -> Self {
        Self::Resource { what, source }
    }

    pub fn sys(op: &'static str, source: Errno) -> Self {
        Self::Sys { op, source }
    }

    /// The exit status a stressor instance reports when it stops on this
    /// error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Resource { .. } => ExitStatus::NoResource,
            Self::Unsupported(_) => ExitStatus::NotImplemented,
            Self::Configuration(_) | Self::Sys { .. } => ExitStatus::Failure,
        }
    }
}
