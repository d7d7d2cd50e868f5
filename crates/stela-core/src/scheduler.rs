//! Drives backup rounds from a schedule. One timer, no external
//! framework: the loop sleeps in short ticks, fires a round when its
//! instant arrives, and skips the tick when the previous operation still
//! holds the gate.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::parse_duration;
use crate::error::{Result, StelaError};

/// Loop granularity; also the shutdown-latency upper bound.
const TICK: Duration = Duration::from_millis(250);

/// A cron expression (`0 0 2 * * *`) or a fixed interval (`every 4h`,
/// or a bare duration like `30m`).
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Schedule {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(StelaError::Config("empty schedule".into()));
        }
        if let Some(rest) = spec.strip_prefix("every ") {
            return Ok(Schedule::Every(parse_duration(rest)?));
        }
        if let Ok(interval) = parse_duration(spec) {
            return Ok(Schedule::Every(interval));
        }
        match cron::Schedule::from_str(spec) {
            Ok(parsed) => Ok(Schedule::Cron(Box::new(parsed))),
            Err(first_err) => {
                // Operators often write classic five-field cron; the parser
                // wants a seconds field, so try again with one prepended.
                if spec.split_whitespace().count() == 5 {
                    if let Ok(parsed) = cron::Schedule::from_str(&format!("0 {spec}")) {
                        return Ok(Schedule::Cron(Box::new(parsed)));
                    }
                }
                Err(StelaError::Config(format!(
                    "invalid schedule '{spec}': {first_err}"
                )))
            }
        }
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&now).next(),
            Schedule::Every(interval) => {
                Some(now + chrono::Duration::from_std(*interval).ok()?)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    BackupRound,
    Restore,
}

/// Admits one long-running operation at a time: rounds never overlap each
/// other, and a round never runs beside a restore.
#[derive(Default)]
#[derive(Debug)]
pub struct OperationGate {
    busy: Mutex<Option<OpKind>>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or learn what currently holds it.
    pub fn try_begin(&self, kind: OpKind) -> std::result::Result<OpGuard<'_>, OpKind> {
        let mut busy = self.busy.lock().unwrap();
        if let Some(current) = *busy {
            return Err(current);
        }
        *busy = Some(kind);
        Ok(OpGuard { gate: self })
    }
}

#[derive(Debug)]
pub struct OpGuard<'a> {
    gate: &'a OperationGate,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *self.gate.busy.lock().unwrap() = None;
    }
}

/// Run the round driver until `shutdown` is set. `round_fn` is called once
/// per firing; a firing that collides with a running operation is skipped.
pub fn run_loop<F>(
    schedule: &Schedule,
    gate: &OperationGate,
    shutdown: &AtomicBool,
    clock: &dyn Clock,
    round_fn: F,
) where
    F: Fn() + Sync,
{
    let mut next = schedule.next_after(clock.now());
    tracing::info!(next = ?next, "round driver started");
    std::thread::scope(|s| {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                tracing::info!("round driver stopping");
                break;
            }
            let Some(due) = next else {
                tracing::warn!("schedule yields no further instants, driver idle");
                break;
            };
            if clock.now() >= due {
                next = schedule.next_after(clock.now());
                match gate.try_begin(OpKind::BackupRound) {
                    Ok(guard) => {
                        let round_fn = &round_fn;
                        s.spawn(move || {
                            let _gate = guard;
                            round_fn();
                        });
                    }
                    Err(holder) => {
                        tracing::warn!(holder = ?holder, "RoundSkipped: previous operation still running");
                    }
                }
            }
            std::thread::sleep(TICK);
        }
    });
}
