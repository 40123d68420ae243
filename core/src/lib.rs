//! # Shared pieces of the sediment configuration store
//!
//! Configuration lives in a filesystem-like tree of string keys: paths
//! begin with `/`, dirs end with `/`. Readers see the composition of an
//! ordered list of database layers; all writes go to the top layer
//! through a per-database writer service. This crate holds everything
//! both sides agree on:
//!
//! * [`paths`] — classification of key and dir strings.
//! * [`Value`] — the tagged value union stored under keys.
//! * [`Changeset`] — a batch of writes forming one atomic transaction,
//!   also the writer's in-memory representation of a whole database.
//! * [`Table`] — the immutable memory-mapped database file.
//! * [`Shm`] — the one-byte shared flag a writer flips to tell readers a
//!   file has been rewritten.
//! * [`Bus`] — the message transport between engines and writer
//!   services, with the threading contract the engine relies on.

mod bus;
mod changeset;
mod error;
pub mod paths;
#[cfg(test)]
mod props;
mod shm;
mod table;
mod util;
mod value;

pub use crate::bus::{
    Bus, BusKind, BusMap, Completion, Handler, MatchRule, Notify, PendingCall, Reply, Request,
    SignalCallback, OBJECT_PREFIX,
};
pub use crate::changeset::{Changeset, Description};
pub use crate::error::{Error, Result};
pub use crate::shm::Shm;
pub use crate::table::{Table, TableRef, LOCKS_TABLE};
pub use crate::value::{ArchivedValue, Value};
