//! Lightweight counters for cache behaviour and build/tune timings.
//!
//! Recording only happens with the `profiler` feature; otherwise every entry
//! point compiles to a no-op and [`take_report`] returns an empty report.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    Cache,
    Scope,
}

impl EventKind {
    fn label(self) -> &'static str {
        match self {
            EventKind::Cache => "cache",
            EventKind::Scope => "scope",
        }
    }
}

type EventKey = (EventKind, &'static str);

#[derive(Default, Clone, Copy)]
struct Tally {
    count: u64,
    elapsed: Duration,
}

fn recorder() -> &'static Mutex<BTreeMap<EventKey, Tally>> {
    static TALLIES: OnceLock<Mutex<BTreeMap<EventKey, Tally>>> = OnceLock::new();
    TALLIES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
fn record(key: EventKey, elapsed: Duration) {
    let mut tallies = recorder().lock().expect("profiler table poisoned");
    let tally = tallies.entry(key).or_default();
    tally.count = tally.count.saturating_add(1);
    tally.elapsed = tally.elapsed.saturating_add(elapsed);
}

/// Adds the time between creation and drop to its scope's tally.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    started: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        record((EventKind::Scope, self.name), self.started.elapsed());
    }
}

#[inline(always)]
pub fn scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ScopeGuard {
            name,
            started: Instant::now(),
        }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

/// Counts one occurrence of `name`, e.g. a cache hit or miss.
#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    record((EventKind::Cache, name), Duration::ZERO);
    #[cfg(not(feature = "profiler"))]
    let _ = name;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub kind: &'static str,
    pub name: &'static str,
    pub calls: u64,
    pub total: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileReport {
    pub rows: Vec<ProfileRow>,
}

impl ProfileReport {
    /// Occurrences recorded under `name`, across kinds.
    pub fn calls(&self, name: &str) -> u64 {
        self.rows
            .iter()
            .filter(|row| row.name == name)
            .map(|row| row.calls)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<6} {:<40} {:>8} {:>12}", "kind", "name", "calls", "total_us")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<6} {:<40} {:>8} {:>12}",
                row.kind,
                row.name,
                row.calls,
                row.total.as_micros()
            )?;
        }
        Ok(())
    }
}

/// Drains the collected tallies, cache events first, each kind sorted by name.
pub fn take_report() -> ProfileReport {
    let tallies = std::mem::take(&mut *recorder().lock().expect("profiler table poisoned"));
    let rows = tallies
        .into_iter()
        .map(|((kind, name), tally)| ProfileRow {
            kind: kind.label(),
            name,
            calls: tally.count,
            total: tally.elapsed,
        })
        .collect();
    ProfileReport { rows }
}

/// Discards everything recorded so far.
pub fn reset() {
    recorder().lock().expect("profiler table poisoned").clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "profiler")]
    #[test]
    fn cache_events_and_scopes_are_counted() {
        cache_event("autokern.test.event");
        cache_event("autokern.test.event");
        {
            let _scope = scope("autokern.test.scope");
        }
        let report = take_report();
        assert_eq!(report.calls("autokern.test.event"), 2);
        assert_eq!(report.calls("autokern.test.scope"), 1);
        let kinds: Vec<_> = report.rows.iter().map(|row| row.kind).collect();
        assert_eq!(kinds.first(), Some(&"cache"));
    }

    #[cfg(not(feature = "profiler"))]
    #[test]
    fn recording_is_disabled_without_the_feature() {
        cache_event("autokern.test.disabled");
        drop(scope("autokern.test.disabled"));
        assert_eq!(take_report().calls("autokern.test.disabled"), 0);
    }
}
