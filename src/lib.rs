//! # sediment — a layered configuration store
//!
//! Applications read string-keyed configuration out of a filesystem-like
//! tree. The values visible at any key are the composition of an ordered
//! [`Profile`] of database layers: the top layer is per-user and
//! writable, the layers underneath supply defaults and may pin keys with
//! locks. Reads are lock-free over memory-mapped files; writes travel as
//! [`Changeset`] transactions to a single writer service per database,
//! which rewrites the file and flips a shared invalidation flag so every
//! reader re-opens.
//!
//! ```no_run
//! use sediment::{Client, Value};
//!
//! fn main() -> sediment::Result<()> {
//!     let client = Client::new()?;
//!     client.write("/org/example/editor/font-size", Value::Int32(11))?;
//!     let size = client.read("/org/example/editor/font-size")?;
//!     assert_eq!(size.and_then(|v| v.as_i32()), Some(11));
//!     Ok(())
//! }
//! ```

mod engine;
mod profile;
mod source;

pub use crate::engine::{ChangeEvent, Engine};
pub use crate::profile::{Profile, SourceDesc, SourceKind, PROFILE_DIR, PROFILE_ENV};
pub use crate::source::SYSTEM_DB_DIR;
pub use sediment_core::{
    Bus, BusKind, BusMap, Changeset, Error, Notify, Result, Value, OBJECT_PREFIX,
};

use futures::channel::mpsc;

/// The high-level handle applications use.
///
/// A thin facade over [`Engine`]: single-key conveniences, plus the
/// change-set entry points for multi-key transactions.
pub struct Client {
    engine: Engine,
}

impl Client {
    /// Opens the default profile on the process-global buses.
    pub fn new() -> Result<Client> {
        Client::with_profile(&Profile::default_profile())
    }

    /// Opens an explicit profile on the process-global buses.
    pub fn with_profile(profile: &Profile) -> Result<Client> {
        Client::with_buses(profile, BusMap::global())
    }

    /// Opens an explicit profile with explicit buses. Tests use this to
    /// wire a client and a writer service over a private broker.
    pub fn with_buses(profile: &Profile, buses: BusMap) -> Result<Client> {
        Ok(Client {
            engine: Engine::new(profile, buses)?,
        })
    }

    /// The engine underneath, for callers needing the full interface.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Reads the value at `key`, or `None` when unset everywhere.
    pub fn read(&self, key: &str) -> Result<Option<Value>> {
        self.engine.read(key)
    }

    /// Reads the value `key` would have after a reset.
    pub fn read_default(&self, key: &str) -> Result<Option<Value>> {
        self.engine.read_default(key)
    }

    /// Lists the direct children of `dir`.
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.engine.list(dir)
    }

    /// Whether a write to `key` could succeed.
    pub fn is_writable(&self, key: &str) -> bool {
        self.engine.is_writable(key)
    }

    /// Writes one key and waits for the writer's acknowledgement.
    pub fn write(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.engine
            .change_sync(Changeset::new_write(key, Some(value.into().boxed())))?;
        Ok(())
    }

    /// Writes one key without waiting; the new value is visible to this
    /// client immediately.
    pub fn write_fast(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.engine
            .change_fast(Changeset::new_write(key, Some(value.into().boxed())))
    }

    /// Resets a key, or a whole subtree when `path` is a dir.
    pub fn reset(&self, path: &str) -> Result<()> {
        self.engine.change_sync(Changeset::new_write(path, None))?;
        Ok(())
    }

    /// Applies a change-set transactionally, returning its tag.
    pub fn change_sync(&self, change: Changeset) -> Result<String> {
        self.engine.change_sync(change)
    }

    /// Queues a change-set without waiting.
    pub fn change_fast(&self, change: Changeset) -> Result<()> {
        self.engine.change_fast(change)
    }

    /// Starts delivering [`ChangeEvent`]s for `path` to [`Client::events`]
    /// subscribers.
    pub fn watch(&self, path: &str) -> Result<()> {
        self.engine.watch(path)
    }

    /// Undoes one [`Client::watch`].
    pub fn unwatch(&self, path: &str) -> Result<()> {
        self.engine.unwatch(path)
    }

    /// A stream of change events: local echoes, remote notifications for
    /// watched paths, and synthetic reverts after failed writes.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.engine.events()
    }

    /// Blocks until every queued fast write has been acknowledged.
    pub fn sync(&self) {
        self.engine.sync()
    }
}
