// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod stressors;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use log::warn;
use stress_harness::run_stressor;
use stress_harness::ActiveRun;
use stress_harness::ExitStatus;
use stress_harness::LogNotifier;
use stress_harness::Registry;
use stress_harness::RunReport;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;

/// stress-runner: run process-based stressors and report their throughput.
///
/// Each stressor forks a family of worker processes that hammer one
/// operating system interface and count "bogo-ops" into shared memory. A
/// stressor stops when its timeout expires, when its workers reach the
/// bogo-op limit or on SIGINT/SIGTERM. Workers that the OOM killer takes are
/// replaced for stressors that expect it.
#[derive(Debug, Parser)]
#[command(name = "stress-runner", version)]
struct Opts {
    /// Stressor to run, optionally with a worker count (NAME[:N]). N=0 starts
    /// one worker per online CPU. May be given multiple times.
    #[clap(short = 's', long = "stressor", value_parser = parse_stressor)]
    stressors: Vec<(String, usize)>,

    /// Run every stressor of this class with one worker each.
    #[clap(short = 'c', long)]
    class: Option<String>,

    /// Run each stressor for this many seconds. 0 runs until the bogo-op
    /// limit or a signal.
    #[clap(short = 't', long, default_value = "10")]
    timeout: u64,

    /// Stop each stressor after this many bogo-ops, summed over its workers.
    #[clap(long)]
    ops: Option<u64>,

    /// Stressor specific option (KEY=VALUE, or KEY for a flag). See --list.
    #[clap(short = 'O', long = "opt", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Run the selected stressors one after another. This is the default.
    #[clap(long, action = clap::ArgAction::SetTrue, conflicts_with = "parallel")]
    sequential: bool,

    /// Run the selected stressors at the same time.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    parallel: bool,

    /// List the available stressors, their classes and options, and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    list: bool,

    /// Print the results as JSON instead of a table.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_stressor(s: &str) -> Result<(String, usize)> {
    match s.split_once(':') {
        None => Ok((s.to_string(), 1)),
        Some((name, n)) => {
            let n = n
                .parse::<usize>()
                .with_context(|| format!("invalid worker count '{}'", n))?;
            Ok((name.to_string(), n))
        }
    }
}

fn parse_setting(s: &str) -> Result<(String, String)> {
    let (k, v) = s.split_once('=').unwrap_or((s, ""));
    if k.is_empty() {
        bail!("empty option name in '{}'", s);
    }
    Ok((k.to_string(), v.to_string()))
}

fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

fn list_stressors(reg: &Registry) {
    for s in reg.iter() {
        println!("{:<12} {}", s.name(), s.class());
        for h in s.help() {
            println!("    -O {:<20} {}", h.opt, h.description);
        }
    }
}

/// Stressor names and worker counts selected on the command line, in
/// order, without duplicates.
fn select(opts: &Opts, reg: &Registry) -> Result<Vec<(&'static str, usize)>> {
    let mut picked: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut order = vec![];

    for (name, n) in opts.stressors.iter() {
        let s = reg.get(name).ok_or_else(|| {
            anyhow!(
                "unknown stressor '{}', expected one of: {}",
                name,
                reg.names().collect::<Vec<_>>().join(", ")
            )
        })?;
        let n = if *n == 0 { online_cpus() } else { *n };
        if picked.insert(s.name(), n).is_none() {
            order.push(s.name());
        }
    }

    if let Some(class) = opts.class.as_ref() {
        let class: StressorClass = class.parse()?;
        for s in reg.by_class(class) {
            if !picked.contains_key(s.name()) {
                picked.insert(s.name(), 1);
                order.push(s.name());
            }
        }
    }

    if order.is_empty() {
        bail!("nothing to run, use --stressor or --class (see --list)");
    }
    Ok(order.into_iter().map(|n| (n, picked[n])).collect())
}

fn print_table(reports: &[RunReport]) {
    println!(
        "{:<12} {:>7} {:>14} {:>10} {:>14} {:>8} {:<16}",
        "stressor", "workers", "bogo ops", "real (s)", "bogo ops/s", "oom", "status"
    );
    for r in reports {
        let status = match r.error.as_ref() {
            Some(e) if r.status.is_skip() => format!("skipped: {}", e),
            Some(e) => format!("{}: {}", r.status, e),
            None => r.status.to_string(),
        };
        println!(
            "{:<12} {:>7} {:>14} {:>10.2} {:>14.2} {:>8} {:<16}",
            r.name,
            r.workers,
            r.bogo_ops,
            r.elapsed.as_secs_f64(),
            r.ops_per_sec(),
            r.stats.oom_kills,
            status
        );
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let reg = stressors::registry()?;
    if opts.list {
        list_stressors(&reg);
        return Ok(());
    }
    let selected = select(&opts, &reg)?;

    let active = Arc::new(ActiveRun::new());
    let active_clone = active.clone();
    ctrlc::set_handler(move || {
        active_clone.stop();
    })
    .context("Error setting Ctrl-C handler")?;

    let timeout = match opts.timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let settings: BTreeMap<String, String> = opts.settings.iter().cloned().collect();
    let args_for = |name: &str, workers: usize| StressorArgs {
        settings: settings.clone(),
        ..StressorArgs::new(name)
            .with_workers(workers)
            .with_max_ops(opts.ops)
            .with_timeout(timeout)
    };

    info!(
        "Running {} stressor(s), timeout {:?}, max ops {:?}",
        selected.len(),
        timeout,
        opts.ops
    );
    let notifier = LogNotifier;
    let run_one = |name: &'static str, workers: usize| -> Result<RunReport> {
        let stressor = reg
            .get(name)
            .ok_or_else(|| anyhow!("stressor '{}' vanished", name))?;
        Ok(run_stressor(
            stressor,
            &args_for(name, workers),
            &notifier,
            Some(active.as_ref()),
        ))
    };

    let reports: Vec<RunReport> = if opts.parallel && !opts.sequential {
        std::thread::scope(|s| {
            let runs: Vec<_> = selected
                .iter()
                .map(|&(name, workers)| s.spawn(move || run_one(name, workers)))
                .collect();
            runs.into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|_| anyhow!("stressor thread panicked"))
                        .and_then(|r| r)
                })
                .collect::<Result<Vec<_>>>()
        })?
    } else {
        let mut reports = vec![];
        for &(name, workers) in selected.iter() {
            if active.stopped() {
                debug!("{}: not started, stop requested", name);
                continue;
            }
            reports.push(run_one(name, workers)?);
        }
        reports
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_table(&reports);
    }

    let status = reports
        .iter()
        .fold(ExitStatus::Success, |acc, r| acc.worst(r.status));
    if status.is_failure() {
        warn!("One or more stressors failed");
    }
    // Skips alone do not fail the run.
    let code = if status.is_skip() { 0 } else { status.code() };
    std::process::exit(code);
}
