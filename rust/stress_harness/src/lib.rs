// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Worker harness for process-based stressors
//!
//! A stressor is an independent probe that hammers one operating-system
//! interface from a family of forked worker processes. Every stressor shares
//! the same lifecycle, which this crate implements once:
//!
//! - A [`CounterBlock`] in anonymous shared memory collects "bogo-ops", one
//!   relaxed 64-bit slot per worker.
//! - A [`Termination`] context, also in shared memory, tells every worker
//!   when to stop: an explicit request, an expired deadline or the aggregate
//!   op count reaching a configured maximum.
//! - A [`Supervisor`] forks the workers, watches them, respawns the ones the
//!   stressor's policy allows (OOM kills, self-terminating children) and
//!   finally tears everything down and reaps it exactly once.
//!
//! ## Stressor Interface
//!
//! Stressor bodies implement [`Stressor`] and [`WorkerBody`] and are looked
//! up by name in a [`Registry`]. [`run_stressor`] drives one invocation end
//! to end and returns a [`RunReport`].
//!
//! ## Failure Model
//!
//! Workers report through their exit status ([`ExitStatus`]). The supervisor
//! never trusts anything else crossing a process boundary and classifies
//! each death as a [`ChildExit`].

#[macro_use]
extern crate lazy_static;

mod error;
pub use error::HarnessError;
pub use error::Result;

pub mod shm;
pub use shm::Shared;
pub use shm::SharedMapping;
pub use shm::PAGE_SIZE;

mod counter;
pub use counter::CounterBlock;

mod termination;
pub use termination::StopReason;
pub use termination::Termination;

mod exit;
pub use exit::ChildExit;
pub use exit::ExitStatus;

pub mod fork;
pub use fork::Fork;
pub use fork::SysFork;

mod killpid;
pub use killpid::kill_pid;

pub mod child;
pub use child::ChildConfig;

mod supervisor;
pub use supervisor::Respawn;
pub use supervisor::SlotState;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorStats;
pub use supervisor::WorkerSlot;

pub mod oomable;
pub use oomable::OomPolicy;

mod proc_state;
pub use proc_state::LogNotifier;
pub use proc_state::NullNotifier;
pub use proc_state::ProcState;
pub use proc_state::StateNotifier;

mod stressor;
pub use stressor::BodyFn;
pub use stressor::Help;
pub use stressor::Registry;
pub use stressor::Stressor;
pub use stressor::StressorArgs;
pub use stressor::StressorClass;
pub use stressor::WorkerBody;
pub use stressor::WorkerContext;

mod runner;
pub use runner::run_stressor;
pub use runner::ActiveRun;
pub use runner::RunReport;
