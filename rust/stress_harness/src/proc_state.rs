// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use log::trace;
use std::fmt;

/// Points in a stressor's life reported to an optional observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Init,
    Run,
    Deinit,
    Exit,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Run => "RUN",
            Self::Deinit => "DEINIT",
            Self::Exit => "EXIT",
        };
        write!(f, "{}", s)
    }
}

/// Observer of state transitions. Purely informational; the harness behaves
/// the same with or without one.
pub trait StateNotifier: Send + Sync {
    fn notify(&self, name: &str, state: ProcState);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl StateNotifier for NullNotifier {
    fn notify(&self, _: &str, _: ProcState) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl StateNotifier for LogNotifier {
    fn notify(&self, name: &str, state: ProcState) {
        trace!("{}: state {}", name, state);
    }
}
