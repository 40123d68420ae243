use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytecheck::CheckBytes;
use rkyv::validation::validators::check_archived_root;
use rkyv::{Archive, Serialize};

use crate::error::{Error, Result};
use crate::paths;
use crate::util;
use crate::value::Value;

/// A batch of writes forming one atomic transaction.
///
/// Each recorded path is either a key bound to a value (set), a key bound
/// to nothing (reset this key) or a dir bound to nothing (reset the
/// subtree). Binding a value to a dir is invalid everywhere: local misuse
/// is an assertion failure, wire input is silently dropped.
///
/// A *database* change-set holds concrete state rather than requests:
/// resets delete entries instead of being recorded, so the entry map is
/// exactly the key→value content of a database. The writer service keeps
/// its committed and uncommitted state in this form.
///
/// Change-sets are shared as `Arc<Changeset>` once sealed; sealing
/// forbids further mutation so a sealed set can be walked from any
/// thread.
pub struct Changeset {
    entries: BTreeMap<String, Option<Value>>,
    database: bool,
    sealed: AtomicBool,
}

/// The result of [`Changeset::describe`]: the longest common dir prefix
/// of all recorded paths and each path relative to it, sorted.
#[derive(Clone, Debug, PartialEq)]
pub struct Description {
    pub prefix: String,
    pub paths: Vec<String>,
    pub values: Vec<Option<Value>>,
}

#[derive(Archive, Serialize)]
#[archive_attr(derive(CheckBytes))]
struct WireEntry {
    path: String,
    value: Option<Value>,
}

impl Changeset {
    /// Creates an empty change-set.
    pub fn new() -> Self {
        Changeset {
            entries: BTreeMap::new(),
            database: false,
            sealed: AtomicBool::new(false),
        }
    }

    /// Creates an empty database change-set.
    pub fn new_database() -> Self {
        Changeset {
            entries: BTreeMap::new(),
            database: true,
            sealed: AtomicBool::new(false),
        }
    }

    /// Creates a change-set recording a single write.
    pub fn new_write(path: &str, value: Option<Value>) -> Self {
        let mut change = Changeset::new();
        change.set(path, value);
        change
    }

    pub fn is_database(&self) -> bool {
        self.database
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Records an operation on `path`.
    ///
    /// A key may be set (`Some`) or reset (`None`); a dir may only be
    /// reset, which first drops every recorded entry underneath it.
    pub fn set(&mut self, path: &str, value: Option<Value>) {
        assert!(!self.is_sealed(), "attempt to modify a sealed change-set");
        assert!(paths::is_path(path), "not a path: {:?}", path);

        if path.ends_with('/') {
            assert!(value.is_none(), "a dir cannot be bound to a value");
            self.entries.retain(|p, _| !p.starts_with(path));
            if !self.database {
                self.entries.insert(path.to_owned(), None);
            }
        } else if self.database && value.is_none() {
            self.entries.remove(path);
        } else {
            self.entries.insert(path.to_owned(), value);
        }
    }

    /// Returns the operation recorded for exactly `path`, if any.
    pub fn get(&self, path: &str) -> Option<Option<&Value>> {
        self.entries.get(path).map(|v| v.as_ref())
    }

    /// Returns the value `key` would have after applying this change-set
    /// to a state in which it is unbound — `Some(None)` when the key is
    /// reset directly or through an enclosing dir-reset.
    pub fn binding(&self, key: &str) -> Option<Option<&Value>> {
        if let Some(value) = self.entries.get(key) {
            return Some(value.as_ref());
        }
        for dir in paths::ancestors(key) {
            if self.entries.contains_key(dir) {
                return Some(None);
            }
        }
        None
    }

    /// Iterates the recorded operations in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries.iter().map(|(p, v)| (p.as_str(), v.as_ref()))
    }

    /// Iterates the recorded paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|p| p.as_str())
    }

    /// Two change-sets are similar when they touch exactly the same set
    /// of paths, values ignored. Used to coalesce repeated writes of the
    /// same keys (the slider-drag case).
    pub fn is_similar_to(&self, other: &Changeset) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.keys().zip(other.entries.keys()).all(|(a, b)| a == b)
    }

    /// Forbids all future mutation. After sealing, a shared change-set
    /// may be read concurrently.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Describes the change-set as a common prefix plus relative paths.
    ///
    /// The prefix is trimmed back to a `/` boundary when more than one
    /// path is recorded; a single-entry set describes itself as its whole
    /// path with an empty relative part. Returns `None` when empty.
    pub fn describe(&self) -> Option<Description> {
        let first = self.entries.keys().next()?;

        let mut prefix_len = first.len();
        for path in self.entries.keys() {
            let common = first
                .as_bytes()
                .iter()
                .zip(path.as_bytes())
                .take_while(|(a, b)| a == b)
                .count();
            prefix_len = prefix_len.min(common);
        }

        if self.entries.len() > 1 {
            while first.as_bytes()[prefix_len - 1] != b'/' {
                prefix_len -= 1;
            }
        }

        let prefix = first[..prefix_len].to_owned();
        let mut paths = Vec::with_capacity(self.entries.len());
        let mut values = Vec::with_capacity(self.entries.len());
        for (path, value) in &self.entries {
            paths.push(path[prefix_len..].to_owned());
            values.push(value.clone());
        }

        Some(Description { prefix, paths, values })
    }

    /// Applies `other` on top of this change-set: later writes shadow
    /// earlier ones and dir-resets prune everything in their subtree.
    pub fn change(&mut self, other: &Changeset) {
        for (path, value) in other.iter() {
            self.set(path, value.cloned());
        }
    }

    /// Computes the minimal change-set turning this database state into
    /// `other`, or `None` when the two are identical. Both sides must be
    /// database change-sets. `apply(diff(a, b), a) ≡ b`.
    pub fn diff(&self, other: &Changeset) -> Option<Changeset> {
        debug_assert!(self.database && other.database);

        let mut delta = Changeset::new();
        for path in self.entries.keys() {
            if !other.entries.contains_key(path) {
                delta.set(path, None);
            }
        }
        for (path, value) in &other.entries {
            if self.entries.get(path) != Some(value) {
                delta.set(path, value.clone());
            }
        }

        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// Serializes to the wire form: a sequence of path → optional value
    /// entries.
    pub fn serialize(&self) -> Vec<u8> {
        let wire: Vec<WireEntry> = self
            .entries
            .iter()
            .map(|(path, value)| WireEntry {
                path: path.clone(),
                value: value.clone(),
            })
            .collect();
        util::archive(&wire).to_vec()
    }

    /// Deserializes the wire form. Entries that bind a value to a dir or
    /// carry a malformed path are silently dropped.
    pub fn deserialize(bytes: &[u8]) -> Result<Changeset> {
        let buf = util::aligned(bytes);
        let archived = check_archived_root::<Vec<WireEntry>>(&buf)
            .map_err(|e| Error::Transport(format!("malformed change-set: {}", e)))?;

        let mut change = Changeset::new();
        for entry in archived.iter() {
            let path = entry.path.as_str();
            match entry.value.as_ref() {
                None if paths::is_path(path) => change.set(path, None),
                Some(value) if paths::is_key(path) => change.set(path, Some(value.to_value())),
                _ => {}
            }
        }
        Ok(change)
    }
}

impl Default for Changeset {
    fn default() -> Self {
        Changeset::new()
    }
}

impl Clone for Changeset {
    /// Clones start out unsealed: the writer clones its committed state
    /// to build the next uncommitted overlay.
    fn clone(&self) -> Self {
        Changeset {
            entries: self.entries.clone(),
            database: self.database,
            sealed: AtomicBool::new(false),
        }
    }
}

impl PartialEq for Changeset {
    fn eq(&self, other: &Self) -> bool {
        self.database == other.database && self.entries == other.entries
    }
}

impl std::fmt::Debug for Changeset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (path, value) in &self.entries {
            map.entry(&path, value);
        }
        map.finish()
    }
}
