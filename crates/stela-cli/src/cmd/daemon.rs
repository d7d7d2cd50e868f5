use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use stela_core::backup::{run_round, BackupContext, RoundKind, RoundOutcome};
use stela_core::scheduler::{self, OpKind, OperationGate, Schedule};
use stela_core::throttle::Governor;

use crate::signal::SHUTDOWN;

use super::Runtime;

/// How often the incremental watcher sweeps `backups/` directories.
const INCREMENTAL_SWEEP: Duration = Duration::from_secs(60);

/// Shutdown-check granularity inside the watcher loop.
const WATCH_TICK: Duration = Duration::from_millis(500);

pub fn run(rt: &Runtime) -> i32 {
    let Some(spec) = rt.config.snapshot_schedule.as_deref() else {
        eprintln!("daemon mode needs snapshot_schedule in the configuration");
        return 2;
    };
    let schedule = Schedule::parse(spec).expect("validated at startup");

    crate::signal::install_signal_handlers();

    let governor = Governor::new(
        rt.config.max_concurrent_files,
        rt.config.upload_rate_bytes_per_sec,
    );
    let ctx = BackupContext {
        config: &rt.config,
        store: &*rt.store,
        db: &rt.db,
        clock: &rt.clock,
        governor: &governor,
        registry: &rt.registry,
        cache: &rt.cache,
    };
    if let Err(e) = ctx.prime_cache() {
        tracing::warn!("fingerprint cache not primed, first round re-checks the store: {e}");
    }

    let gate = OperationGate::new();
    tracing::info!(schedule = spec, incremental = rt.config.incremental_enabled, "daemon starting");

    std::thread::scope(|s| {
        if rt.config.incremental_enabled {
            let gate = &gate;
            let ctx = &ctx;
            s.spawn(move || incremental_watcher(ctx, gate));
        }
        scheduler::run_loop(&schedule, &gate, &SHUTDOWN, &rt.clock, || {
            log_outcome("snapshot", run_round(&ctx, RoundKind::Snapshot));
            rt.registry.evict_terminal();
        });
    });

    tracing::info!("daemon stopped");
    0
}

fn incremental_watcher(ctx: &BackupContext<'_>, gate: &OperationGate) {
    let mut next_sweep = Instant::now() + INCREMENTAL_SWEEP;
    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            return;
        }
        if Instant::now() >= next_sweep {
            next_sweep = Instant::now() + INCREMENTAL_SWEEP;
            match gate.try_begin(OpKind::BackupRound) {
                Ok(_guard) => {
                    log_outcome("incremental", run_round(ctx, RoundKind::Incremental));
                }
                Err(holder) => {
                    tracing::debug!(holder = ?holder, "incremental sweep skipped");
                }
            }
        }
        std::thread::sleep(WATCH_TICK);
    }
}

fn log_outcome(kind: &str, outcome: RoundOutcome) {
    match outcome {
        RoundOutcome::Success {
            uploaded, skipped, ..
        } => {
            tracing::info!(kind, uploaded, skipped, "round succeeded");
        }
        RoundOutcome::PartialFailure {
            failed, uploaded, ..
        } => {
            tracing::error!(kind, failed, uploaded, "round partially failed");
        }
        RoundOutcome::Failed { cause, .. } => {
            tracing::error!(kind, "round failed: {cause}");
        }
    }
}
