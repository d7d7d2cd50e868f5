use stela_core::backup_path::format_instant;
use stela_core::manifest::list_manifests;

use super::{exit_code, Runtime};

pub fn run(rt: &Runtime, token: Option<String>) -> i32 {
    let token = token.unwrap_or_else(|| rt.config.token.clone());
    let scheme = rt.config.key_scheme();
    match list_manifests(&*rt.store, &scheme, &token, &rt.config.instance_region) {
        Ok(refs) if refs.is_empty() => {
            println!("no manifests for token {token}");
            0
        }
        Ok(refs) => {
            for reference in refs {
                println!(
                    "{}  v{}  {}",
                    format_instant(reference.instant),
                    reference.version,
                    reference.key
                );
            }
            0
        }
        Err(e) => {
            eprintln!("cannot list manifests: {e}");
            exit_code(&e)
        }
    }
}
