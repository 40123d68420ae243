//! The per-database invalidation flag.
//!
//! One single-byte file per user-writable database lives under
//! `$XDG_RUNTIME_DIR/sediment/<name>`. Readers map it read-only and poll
//! the byte at well-defined points; a writer flips it to 1 after
//! rewriting the data file and then unlinks it, so the next reader to
//! open gets a fresh zero page. The store goes through a mapping rather
//! than `write(2)` because some kernels do not keep the filesystem cache
//! coherent with shared mappings.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::{Mmap, MmapMut};

use crate::error::Result;

fn flag_dir() -> io::Result<PathBuf> {
    let dir = dirs::runtime_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no runtime directory"))?;
    Ok(dir.join("sediment"))
}

/// A reader's mapping of the invalidation byte.
pub struct Shm {
    map: Mmap,
}

impl Shm {
    /// Opens (creating if necessary) the flag file for `name` and maps it
    /// read-only.
    pub fn open(name: &str) -> Result<Shm> {
        let dir = flag_dir()?;
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(dir.join(name))?;
        file.set_len(1)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Shm { map })
    }

    /// Returns true when the data file this flag guards has been
    /// rewritten and must be re-opened. Monotone until the flag file is
    /// replaced.
    pub fn is_flagged(&self) -> bool {
        let byte = unsafe { &*(self.map.as_ptr() as *const AtomicU8) };
        byte.load(Ordering::Relaxed) != 0
    }

    /// Writer side: flips the flag for `name` and unlinks the file.
    /// A missing flag file means no reader holds a mapping, so there is
    /// nothing to invalidate.
    pub fn flag(name: &str) -> Result<()> {
        let path = flag_dir()?.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        file.set_len(1)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        let byte = unsafe { &*(map.as_ptr() as *const AtomicU8) };
        byte.store(1, Ordering::SeqCst);
        drop(map);

        fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_runtime_dir<T>(f: impl FnOnce() -> T) -> T {
        static LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
        let _guard = LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let old = std::env::var_os("XDG_RUNTIME_DIR");
        std::env::set_var("XDG_RUNTIME_DIR", dir.path());
        let result = f();
        match old {
            Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
        result
    }

    #[test]
    fn flag_round_trip() {
        with_runtime_dir(|| {
            let shm = Shm::open("db").unwrap();
            assert!(!shm.is_flagged());

            Shm::flag("db").unwrap();
            assert!(shm.is_flagged());

            // The flag file was unlinked, so a new reader starts clean.
            let fresh = Shm::open("db").unwrap();
            assert!(!fresh.is_flagged());
            assert!(shm.is_flagged());
        })
    }

    #[test]
    fn flagging_without_readers_is_a_no_op() {
        with_runtime_dir(|| {
            Shm::flag("nobody").unwrap();
        })
    }
}
