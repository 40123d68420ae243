//! The sediment writer service: accepts change-sets over the bus,
//! serializes them into database files, raises the invalidation flag and
//! emits change notifications. One writer object per database, created
//! on first reference; an alternative keyfile backend keeps a
//! human-editable text twin and merges external edits.

mod blame;
mod keyfile;
mod router;
mod writer;

#[cfg(test)]
pub(crate) mod testenv {
    use parking_lot::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    /// Points the XDG directories at a fresh scratch home, holding a
    /// process-wide lock so env-dependent tests never interleave.
    pub fn scratch() -> (MutexGuard<'static, ()>, tempfile::TempDir) {
        let guard = LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_CONFIG_HOME", dir.path().join("config"));
        std::env::set_var("XDG_RUNTIME_DIR", dir.path().join("runtime"));
        std::fs::create_dir_all(dir.path().join("runtime")).unwrap();
        (guard, dir)
    }
}

pub use crate::blame::Blame;
pub use crate::keyfile::KeyfileWriter;
pub use crate::router::Router;
pub use crate::writer::{Emitter, TableWriter, Writer};
