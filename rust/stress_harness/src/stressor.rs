// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use crate::shm::PAGE_SIZE;
use crate::ChildConfig;
use crate::CounterBlock;
use crate::ExitStatus;
use crate::Fork;
use crate::OomPolicy;
use crate::Respawn;
use crate::Termination;
use anyhow::anyhow;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stressor class tags, combined as a bit set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StressorClass(u32);

impl StressorClass {
    pub const CPU: Self = Self(1 << 0);
    pub const CPU_CACHE: Self = Self(1 << 1);
    pub const MEMORY: Self = Self(1 << 2);
    pub const OS: Self = Self(1 << 3);
    pub const SCHEDULER: Self = Self(1 << 4);
    pub const VM: Self = Self(1 << 5);

    const NAMES: [(&'static str, StressorClass); 6] = [
        ("cpu", Self::CPU),
        ("cpu-cache", Self::CPU_CACHE),
        ("memory", Self::MEMORY),
        ("os", Self::OS),
        ("scheduler", Self::SCHEDULER),
        ("vm", Self::VM),
    ];

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::NAMES.iter().map(|(n, _)| *n)
    }
}

impl std::ops::BitOr for StressorClass {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl FromStr for StressorClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == s)
            .map(|(_, c)| *c)
            .ok_or_else(|| {
                anyhow!(
                    "unknown class '{}', expected one of: {}",
                    s,
                    Self::names().collect::<Vec<_>>().join(", ")
                )
            })
    }
}

impl fmt::Display for StressorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, c)| self.contains(*c))
            .map(|(n, _)| *n)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// One line of a stressor's option help.
#[derive(Clone, Copy, Debug)]
pub struct Help {
    pub opt: &'static str,
    pub description: &'static str,
}

/// Per-invocation arguments handed to a stressor.
#[derive(Clone, Debug, Default)]
pub struct StressorArgs {
    pub name: String,
    pub workers: usize,
    pub max_ops: Option<u64>,
    pub timeout: Option<Duration>,
    /// Stressor specific `key=value` options, opaque to the harness.
    pub settings: BTreeMap<String, String>,
}

impl StressorArgs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            workers: 1,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_ops(mut self, max_ops: Option<u64>) -> Self {
        self.max_ops = max_ops;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse the setting `key` if present. A flag given without a value
    /// ("key=") reads as "true".
    pub fn setting<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.settings.get(key) else {
            return Ok(None);
        };
        let raw = if raw.is_empty() { "true" } else { raw.as_str() };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, key, e))
    }
}

/// What a worker sees of the harness: its counter slot, the shared stop
/// predicate and the stressor's arguments.
pub struct WorkerContext<'a> {
    args: &'a StressorArgs,
    slot: usize,
    nr_workers: usize,
    counter_slot: usize,
    counters: &'a CounterBlock,
    term: &'a Termination,
    forker: &'a dyn Fork,
}

impl<'a> WorkerContext<'a> {
    pub fn new(
        args: &'a StressorArgs,
        slot: usize,
        nr_workers: usize,
        counter_slot: usize,
        counters: &'a CounterBlock,
        term: &'a Termination,
        forker: &'a dyn Fork,
    ) -> Self {
        Self {
            args,
            slot,
            nr_workers,
            counter_slot,
            counters,
            term,
            forker,
        }
    }

    pub fn name(&self) -> &'a str {
        &self.args.name
    }

    pub fn args(&self) -> &'a StressorArgs {
        self.args
    }

    /// Index of this worker within its family.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn nr_workers(&self) -> usize {
        self.nr_workers
    }

    pub fn counters(&self) -> &'a CounterBlock {
        self.counters
    }

    pub fn counter_slot(&self) -> usize {
        self.counter_slot
    }

    pub fn termination(&self) -> &'a Termination {
        self.term
    }

    pub fn forker(&self) -> &'a dyn Fork {
        self.forker
    }

    pub fn page_size(&self) -> usize {
        *PAGE_SIZE
    }

    /// Count one bogo-op for this worker.
    #[inline]
    pub fn inc(&self) {
        self.counters.inc(self.counter_slot);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.counters.add(self.counter_slot, n);
    }

    /// This worker's own count.
    pub fn counter(&self) -> u64 {
        self.counters.get(self.counter_slot)
    }

    #[inline]
    pub fn keep_stressing(&self) -> bool {
        self.term.should_continue(self.counters)
    }
}

/// The code one worker process runs.
pub trait WorkerBody: Send + Sync {
    /// Settings applied to the worker in `slot` right after fork.
    fn child_config(&self, _slot: usize) -> ChildConfig {
        ChildConfig::default()
    }

    /// One unit of work, or a whole stress loop that polls
    /// [`WorkerContext::keep_stressing`] itself. Anything but `Success` ends
    /// the worker with that status.
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus;
}

/// A plain function or closure as a [`WorkerBody`].
pub struct BodyFn<F>(F);

impl<F> BodyFn<F>
where
    F: Fn(&mut WorkerContext<'_>) -> ExitStatus + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> WorkerBody for BodyFn<F>
where
    F: Fn(&mut WorkerContext<'_>) -> ExitStatus + Send + Sync,
{
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        (self.0)(ctx)
    }
}

/// A registered probe.
pub trait Stressor: Send + Sync {
    fn name(&self) -> &'static str;

    fn class(&self) -> StressorClass;

    fn help(&self) -> &'static [Help] {
        &[]
    }

    /// `Err` carries the reason the probe cannot run here. The stressor is
    /// then reported as skipped, not failed.
    fn supported(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Number of workers to run for a request of `requested`.
    fn workers(&self, requested: usize) -> usize {
        requested.max(1)
    }

    fn respawn(&self) -> Respawn {
        Respawn::Never
    }

    fn oom_policy(&self) -> Option<OomPolicy> {
        None
    }

    /// Workers run their body once and exit instead of looping until stop.
    /// Mostly useful together with [`Respawn::Always`].
    fn one_shot(&self) -> bool {
        false
    }

    /// Parent-side setup before any worker is forked, e.g. mapping the
    /// stressor's own shared state.
    fn prepare(&self, args: &StressorArgs) -> Result<Box<dyn WorkerBody>>;
}

/// Stressors by name.
#[derive(Default)]
pub struct Registry {
    stressors: BTreeMap<&'static str, Box<dyn Stressor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stressor: Box<dyn Stressor>) -> Result<()> {
        let name = stressor.name();
        if self.stressors.contains_key(name) {
            return Err(anyhow!("stressor '{}' registered twice", name));
        }
        self.stressors.insert(name, stressor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Stressor> {
        self.stressors.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stressors.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Stressor> + '_ {
        self.stressors.values().map(|s| s.as_ref())
    }

    pub fn by_class(&self, class: StressorClass) -> impl Iterator<Item = &dyn Stressor> + '_ {
        self.iter().filter(move |s| s.class().contains(class))
    }

    pub fn len(&self) -> usize {
        self.stressors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stressors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Stressor for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn class(&self) -> StressorClass {
            StressorClass::CPU | StressorClass::OS
        }

        fn prepare(&self, _: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
            Ok(Box::new(BodyFn::new(|_: &mut WorkerContext| ExitStatus::Success)))
        }
    }

    #[test]
    fn test_class_parse_and_display() {
        let c: StressorClass = "scheduler".parse().unwrap();
        assert_eq!(c, StressorClass::SCHEDULER);
        assert!("gpu".parse::<StressorClass>().is_err());
        assert_eq!((StressorClass::CPU | StressorClass::VM).to_string(), "cpu|vm");
        assert!((StressorClass::CPU | StressorClass::VM).contains(StressorClass::VM));
        assert!(!StressorClass::CPU.contains(StressorClass::VM));
    }

    #[test]
    fn test_settings() {
        let args = StressorArgs::new("x")
            .with_setting("affinity-pin", "")
            .with_setting("memhog-bytes", "4096")
            .with_setting("bad", "abc");
        assert_eq!(args.setting::<bool>("affinity-pin").unwrap(), Some(true));
        assert_eq!(args.setting::<u64>("memhog-bytes").unwrap(), Some(4096));
        assert_eq!(args.setting::<u64>("missing").unwrap(), None);
        assert!(args.setting::<u64>("bad").is_err());
    }

    #[test]
    fn test_registry() {
        let mut reg = Registry::new();
        reg.register(Box::new(Noop)).unwrap();
        assert!(reg.register(Box::new(Noop)).is_err());
        assert_eq!(reg.len(), 1);
        assert!(reg.get("noop").is_some());
        assert!(reg.get("nope").is_none());
        assert_eq!(reg.by_class(StressorClass::OS).count(), 1);
        assert_eq!(reg.by_class(StressorClass::VM).count(), 0);
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["noop"]);
    }
}
