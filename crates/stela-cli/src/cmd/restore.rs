use chrono::{DateTime, Utc};

use stela_core::backup_path::parse_instant;
use stela_core::error::Result;
use stela_core::restore::{self, RestoreContext, RestoreOutcome, RestoreRequest};
use stela_core::throttle::Governor;

use super::{exit_code, Runtime};

/// Accepts the key-native instant format (`201806051234`) or RFC 3339.
fn parse_target_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = parse_instant(raw) {
        return Ok(t);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            stela_core::error::StelaError::Config(format!(
                "cannot parse target time '{raw}': expected yyyyMMddHHmm or RFC 3339"
            ))
        })
}

pub fn run(
    rt: &Runtime,
    token: Option<String>,
    at: &str,
    keyspace: Option<String>,
    column_family: Option<String>,
) -> i32 {
    let at = match parse_target_time(at) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };
    let request = RestoreRequest {
        token: token.unwrap_or_else(|| rt.config.token.clone()),
        at,
        keyspace,
        column_family,
    };

    let scheme = rt.config.key_scheme();
    let plan = match restore::plan(&*rt.store, &scheme, &rt.config.instance_region, &request) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("cannot plan restore: {e}");
            return exit_code(&e);
        }
    };
    println!(
        "restoring {} files from manifest at {} (v{})",
        plan.entries.len(),
        plan.manifest_instant,
        plan.manifest_version
    );

    let governor = Governor::new(rt.config.max_concurrent_restores, 0);
    let ctx = RestoreContext {
        config: &rt.config,
        store: &*rt.store,
        db: &rt.db,
        clock: &rt.clock,
        governor: &governor,
        registry: &rt.registry,
    };
    match restore::execute(&ctx, &plan) {
        RestoreOutcome::Success(stats) => {
            println!(
                "restore complete: {} fetched, {} skipped, {} tables refreshed",
                stats.fetched, stats.skipped, stats.refreshed_tables
            );
            0
        }
        RestoreOutcome::Failed { cause, stats } => {
            eprintln!(
                "restore failed after placing {} files: {cause}",
                stats.fetched
            );
            for key in &stats.records {
                eprintln!("  {key}");
            }
            if stats.fetched > 0 {
                5
            } else {
                exit_code(&cause)
            }
        }
    }
}
