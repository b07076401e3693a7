// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod affinity;
mod dekker;
mod forkchurn;
mod memhog;
mod resched;
mod spin;

use anyhow::Result;
use stress_harness::Registry;
use stress_harness::Stressor;

/// Every stressor this binary knows about.
pub fn registry() -> Result<Registry> {
    let stressors: Vec<Box<dyn Stressor>> = vec![
        Box::new(affinity::Affinity),
        Box::new(dekker::Dekker),
        Box::new(forkchurn::ForkChurn),
        Box::new(memhog::Memhog),
        Box::new(resched::Resched),
        Box::new(spin::Spin),
    ];
    let mut reg = Registry::new();
    for s in stressors {
        reg.register(s)?;
    }
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stress_harness::run_stressor;
    use stress_harness::ExitStatus;
    use stress_harness::NullNotifier;
    use stress_harness::StressorArgs;
    use stress_harness::StressorClass;

    fn short_run(name: &str, workers: usize) -> stress_harness::RunReport {
        let reg = registry().unwrap();
        let args = StressorArgs::new(name)
            .with_workers(workers)
            .with_timeout(Some(Duration::from_millis(500)));
        run_stressor(reg.get(name).unwrap(), &args, &NullNotifier, None)
    }

    #[test]
    fn test_registry_contents() {
        let reg = registry().unwrap();
        assert_eq!(
            reg.names().collect::<Vec<_>>(),
            vec!["affinity", "dekker", "forkchurn", "memhog", "resched", "spin"]
        );
        assert!(reg.by_class(StressorClass::SCHEDULER).count() >= 3);
    }

    #[test]
    fn test_spin() {
        let report = short_run("spin", 2);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.per_slot.iter().all(|n| *n > 0));
    }

    #[test]
    fn test_dekker_two_workers() {
        let report = short_run("dekker", 8);
        assert_eq!(report.workers, 2);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.bogo_ops > 0);
    }

    #[test]
    fn test_affinity() {
        let report = short_run("affinity", 2);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.bogo_ops > 0);
    }

    #[test]
    fn test_forkchurn() {
        let report = short_run("forkchurn", 1);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.bogo_ops > 0);
        assert_eq!(report.stats.unexpected_deaths, 0);
    }

    #[test]
    fn test_memhog_small() {
        let reg = registry().unwrap();
        let args = StressorArgs::new("memhog")
            .with_timeout(Some(Duration::from_millis(500)))
            .with_setting("memhog-bytes", "4194304");
        let report = run_stressor(reg.get("memhog").unwrap(), &args, &NullNotifier, None);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.bogo_ops >= 4);
    }

    #[test]
    fn test_resched_respawns() {
        let report = short_run("resched", 1);
        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.bogo_ops > 0);
    }
}
