//! Control channel to the local database process.
//!
//! The pipeline needs exactly three operations from the database; any
//! adapter that speaks the node's management protocol can implement them.
//! Wire details stay on the adapter side.

use std::sync::Mutex;

use crate::error::Result;

pub trait DbControl: Send + Sync {
    /// Take a snapshot tagged `tag` (hardlink set under
    /// `<ks>/<cf>/snapshots/<tag>/`).
    fn snapshot(&self, tag: &str) -> Result<()>;

    /// Make the database open files newly placed under `<ks>/<cf>/`.
    fn refresh(&self, keyspace: &str, column_family: &str) -> Result<()>;

    /// Remove the snapshot directory for `tag`.
    fn clear_snapshot(&self, tag: &str) -> Result<()>;
}

/// Serializes calls to an underlying adapter: the management channel of
/// the database tolerates one outstanding request.
pub struct SerializedDbControl<C> {
    inner: C,
    gate: Mutex<()>,
}

impl<C: DbControl> SerializedDbControl<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }
}

impl<C: DbControl> DbControl for SerializedDbControl<C> {
    fn snapshot(&self, tag: &str) -> Result<()> {
        let _gate = self.gate.lock().unwrap();
        self.inner.snapshot(tag)
    }

    fn refresh(&self, keyspace: &str, column_family: &str) -> Result<()> {
        let _gate = self.gate.lock().unwrap();
        self.inner.refresh(keyspace, column_family)
    }

    fn clear_snapshot(&self, tag: &str) -> Result<()> {
        let _gate = self.gate.lock().unwrap();
        self.inner.clear_snapshot(tag)
    }
}
