//! Database control adapter: shells out to the node's management tool.
//!
//! The core only needs `snapshot` / `refresh` / `clearsnapshot`; this
//! adapter maps them onto the management CLI that ships with the
//! database. Override the binary with `STELA_DB_CONTROL` (default
//! `nodetool`).

use std::process::Command;

use stela_core::dbcontrol::DbControl;
use stela_core::error::{Result, StelaError};

pub const DB_CONTROL_ENV: &str = "STELA_DB_CONTROL";

pub struct ShellDbControl {
    program: String,
}

impl ShellDbControl {
    pub fn from_env() -> Self {
        let program = std::env::var(DB_CONTROL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "nodetool".to_string());
        Self { program }
    }

    fn invoke(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| StelaError::DbControl(format!("cannot run {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StelaError::DbControl(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl DbControl for ShellDbControl {
    fn snapshot(&self, tag: &str) -> Result<()> {
        self.invoke(&["snapshot", "-t", tag])
    }

    fn refresh(&self, keyspace: &str, column_family: &str) -> Result<()> {
        self.invoke(&["refresh", keyspace, column_family])
    }

    fn clear_snapshot(&self, tag: &str) -> Result<()> {
        self.invoke(&["clearsnapshot", "-t", tag])
    }
}
