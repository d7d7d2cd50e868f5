use stela_core::backup::{run_round, BackupContext, RoundKind, RoundOutcome};
use stela_core::throttle::Governor;

use super::{exit_code, Runtime};

pub fn run(rt: &Runtime, incremental: bool) -> i32 {
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
        tracing::error!("cannot prime fingerprint cache: {e}");
        return exit_code(&e);
    }

    let kind = if incremental {
        RoundKind::Incremental
    } else {
        RoundKind::Snapshot
    };
    match run_round(&ctx, kind) {
        RoundOutcome::Success {
            uploaded,
            skipped,
            manifest_key,
            ..
        } => {
            println!("round complete: {uploaded} uploaded, {skipped} already present");
            if let Some(key) = manifest_key {
                println!("manifest: {key}");
            }
            0
        }
        RoundOutcome::PartialFailure {
            failed,
            uploaded,
            records,
        } => {
            eprintln!("round partially failed: {failed} failed, {uploaded} uploaded");
            for key in records {
                eprintln!("  {key}");
            }
            5
        }
        RoundOutcome::Failed { cause, .. } => {
            eprintln!("round failed: {cause}");
            exit_code(&cause)
        }
    }
}
