// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::termination::StopReason;
use crate::CounterBlock;
use crate::ExitStatus;
use crate::HarnessError;
use crate::ProcState;
use crate::StateNotifier;
use crate::Stressor;
use crate::StressorArgs;
use crate::Supervisor;
use crate::SupervisorStats;
use crate::Termination;
use log::debug;
use log::info;
use log::warn;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one stressor invocation.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub name: String,
    pub workers: usize,
    pub bogo_ops: u64,
    pub per_slot: Vec<u64>,
    pub elapsed: Duration,
    pub status: ExitStatus,
    pub stop_reason: Option<StopReason>,
    pub error: Option<String>,
    pub stats: SupervisorStats,
}

impl RunReport {
    fn new(name: &str, workers: usize) -> Self {
        Self {
            name: name.to_string(),
            workers,
            bogo_ops: 0,
            per_slot: vec![],
            elapsed: Duration::ZERO,
            status: ExitStatus::Success,
            stop_reason: None,
            error: None,
            stats: SupervisorStats::default(),
        }
    }

    fn failed(mut self, status: ExitStatus, reason: String) -> Self {
        self.status = status;
        self.error = Some(reason);
        self
    }

    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bogo_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Handle on the stressors currently running, for stopping them from
/// outside (e.g. a Ctrl-C handler). A stop requested between runs also
/// applies to every later run, so a late signal is never lost.
#[derive(Default)]
pub struct ActiveRun {
    current: Mutex<Vec<Termination>>,
    stopped: AtomicBool,
}

impl ActiveRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(cur) = self.current.lock() {
            for term in cur.iter() {
                term.request_stop();
            }
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn enter(&self, term: &Termination) -> ActiveGuard<'_> {
        if let Ok(mut cur) = self.current.lock() {
            if self.stopped() {
                term.request_stop();
            }
            cur.push(term.clone());
        }
        ActiveGuard {
            active: self,
            term: term.clone(),
        }
    }
}

struct ActiveGuard<'a> {
    active: &'a ActiveRun,
    term: Termination,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut cur) = self.active.current.lock() {
            cur.retain(|t| !t.same(&self.term));
        }
    }
}

/// Run one stressor end to end: set up shared counters and the stop
/// context, fork and supervise the workers, tear them down and aggregate.
///
/// Nothing here aborts the caller. Environments that cannot host the probe
/// come back as skipped reports, harness errors as failed ones.
pub fn run_stressor(
    stressor: &dyn Stressor,
    args: &StressorArgs,
    notifier: &dyn StateNotifier,
    active: Option<&ActiveRun>,
) -> RunReport {
    let name = stressor.name();
    let workers = stressor.workers(args.workers);
    let mut report = RunReport::new(name, workers);

    notifier.notify(name, ProcState::Init);
    let report = match run_inner(stressor, args, workers, notifier, active, &mut report) {
        Ok(()) => report,
        Err(e) => {
            let status = e.exit_status();
            if status.is_skip() {
                info!("{}: skipped, {}", name, e);
            } else {
                warn!("{}: {}", name, e);
            }
            report.failed(status, e.to_string())
        }
    };
    notifier.notify(name, ProcState::Exit);
    report
}

fn run_inner(
    stressor: &dyn Stressor,
    args: &StressorArgs,
    workers: usize,
    notifier: &dyn StateNotifier,
    active: Option<&ActiveRun>,
    report: &mut RunReport,
) -> crate::Result<()> {
    let name = stressor.name();
    stressor.supported().map_err(HarnessError::Unsupported)?;

    let mut args = args.clone();
    args.name = name.to_string();
    args.workers = workers;

    let counters = CounterBlock::create(workers)?;
    let term = Termination::new(args.max_ops)?;
    if let Some(timeout) = args.timeout {
        term.install_deadline(timeout)?;
    }
    let _guard = active.map(|a| a.enter(&term));

    let body = match stressor.prepare(&args) {
        Ok(body) => body,
        Err(e) => {
            return Err(match e.downcast::<HarnessError>() {
                Ok(he) => he,
                Err(e) => HarnessError::Configuration(format!("{:#}", e)),
            });
        }
    };

    debug!(
        "{}: starting {} workers (timeout {:?}, max ops {:?})",
        name, workers, args.timeout, args.max_ops
    );
    notifier.notify(name, ProcState::Run);

    let mut sup = Supervisor::new(&args, &counters, &term)
        .respawn(stressor.respawn())
        .oom_policy(stressor.oom_policy())
        .one_shot(stressor.one_shot());
    let spawned = sup.spawn_all(body.as_ref());
    if spawned.is_ok() {
        sup.supervise(body.as_ref());
        if sup.live() == 0 {
            term.workers_exited();
        }
    }
    sup.shutdown_all();
    notifier.notify(name, ProcState::Deinit);

    report.elapsed = term.elapsed();
    report.per_slot = counters.snapshot();
    report.bogo_ops = counters.aggregate();
    report.stop_reason = term.reason();
    report.stats = sup.stats();
    report.status = sup.status();
    spawned?;
    Ok(())
}
