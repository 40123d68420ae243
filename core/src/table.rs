//! The on-disk immutable map.
//!
//! A table file is a 16-byte header (magic plus reserved bytes) followed
//! by an rkyv archive of the key→value entries and any named sub-tables.
//! Readers map the file and query the archive in place; nothing is
//! deserialized until a value is actually fetched. A writer invalidates
//! every live mapping of a file by overwriting the first 8 bytes with
//! zeros, which destroys the magic.

use std::fs;
use std::path::{Path, PathBuf};

use bytecheck::CheckBytes;
use memmap2::Mmap;
use rkyv::validation::validators::check_archived_root;
use rkyv::{archived_root, AlignedVec, Archive, Serialize};

use crate::changeset::Changeset;
use crate::error::{Error, Result};
use crate::paths;
use crate::util;
use crate::value::Value;

const MAGIC: [u8; 8] = *b"SdMap\x01\0\0";
const HEADER_LEN: usize = 16;

/// Name of the sub-table holding lock records in read-only layers.
pub const LOCKS_TABLE: &str = ".locks";

#[derive(Archive, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
#[archive(bound(serialize = "__S: rkyv::ser::ScratchSpace + rkyv::ser::Serializer"))]
struct TableData {
    /// Sorted by path.
    entries: Vec<TableEntry>,
    #[omit_bounds]
    #[archive_attr(omit_bounds)]
    tables: Vec<TableSub>,
}

#[derive(Archive, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
#[archive(bound(serialize = "__S: rkyv::ser::ScratchSpace + rkyv::ser::Serializer"))]
struct TableEntry {
    path: String,
    value: Value,
}

#[derive(Archive, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
#[archive(bound(serialize = "__S: rkyv::ser::ScratchSpace + rkyv::ser::Serializer"))]
struct TableSub {
    name: String,
    #[omit_bounds]
    #[archive_attr(omit_bounds)]
    data: TableData,
}

enum Backing {
    Mapped(Mmap),
    Heap(AlignedVec),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Heap(buf) => buf,
        }
    }
}

/// An opened table file.
pub struct Table {
    backing: Backing,
}

impl Table {
    /// Maps the file at `path`. The archive is validated once here; all
    /// later queries walk it without further checks.
    pub fn open(path: &Path) -> Result<Table> {
        let file = fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        Table::validate(Backing::Mapped(map), path)
    }

    /// Reads the file at `path` into memory, `Ok(None)` when it does not
    /// exist. The writer service loads its committed state this way.
    pub fn load(path: &Path) -> Result<Option<Table>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(Table::validate(
                Backing::Heap(util::aligned(&bytes)),
                path,
            )?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(backing: Backing, path: &Path) -> Result<Table> {
        let bytes = backing.bytes();
        if bytes.len() < HEADER_LEN || bytes[..8] != MAGIC {
            return Err(Error::file_format(
                path.display().to_string(),
                "bad magic header",
            ));
        }
        if let Err(e) = check_archived_root::<TableData>(&bytes[HEADER_LEN..]) {
            return Err(Error::file_format(path.display().to_string(), e.to_string()));
        }
        Ok(Table { backing })
    }

    /// Returns false once a writer has stomped the header to force
    /// readers to re-open. The check must hold up against a concurrent
    /// writer, hence the volatile read.
    pub fn is_valid(&self) -> bool {
        let bytes = self.backing.bytes();
        let word = unsafe { std::ptr::read_volatile(bytes.as_ptr() as *const u64) };
        word == u64::from_ne_bytes(MAGIC)
    }

    fn root(&self) -> &ArchivedTableData {
        unsafe { archived_root::<TableData>(&self.backing.bytes()[HEADER_LEN..]) }
    }

    pub fn has_value(&self, key: &str) -> bool {
        find_in(self.root(), key).is_some()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        find_in(self.root(), key).map(|e| e.value.to_value())
    }

    /// Lists the direct children of `dir`: plain names for keys, names
    /// with a trailing `/` for sub-dirs. Sorted and deduplicated.
    pub fn list(&self, dir: &str) -> Vec<String> {
        list_in(self.root(), dir)
    }

    /// Looks up a named sub-table.
    pub fn get_table(&self, name: &str) -> Option<TableRef<'_>> {
        self.root()
            .tables
            .iter()
            .find(|t| t.name.as_str() == name)
            .map(|t| TableRef { data: &t.data })
    }

    /// Returns true if the `.locks` sub-table pins `key`: an entry for
    /// the key itself or for any dir enclosing it.
    pub fn has_lock(&self, key: &str) -> bool {
        let locks = match self.get_table(LOCKS_TABLE) {
            Some(locks) => locks,
            None => return false,
        };
        if locks.has_value(key) {
            return true;
        }
        paths::ancestors(key).any(|dir| locks.has_value(dir))
    }

    /// Returns true if any lock record would pin a key under `dir`.
    pub fn any_lock_under(&self, dir: &str) -> bool {
        let locks = match self.get_table(LOCKS_TABLE) {
            Some(locks) => locks,
            None => return false,
        };
        if paths::ancestors(dir).any(|d| locks.has_value(d)) {
            return true;
        }
        let entries = &locks.data.entries;
        let start = entries.partition_point(|e| e.path.as_str() < dir);
        entries
            .get(start)
            .map(|e| e.path.as_str().starts_with(dir))
            .unwrap_or(false)
    }

    /// Converts the table's entries into a database change-set, the form
    /// the writer service mutates. Non-key paths are skipped.
    pub fn to_database(&self) -> Changeset {
        let mut database = Changeset::new_database();
        for entry in self.root().entries.iter() {
            let path = entry.path.as_str();
            if paths::is_key(path) {
                database.set(path, Some(entry.value.to_value()));
            }
        }
        database
    }

    /// Serializes `database` (plus optional lock records) and atomically
    /// replaces the file at `path` via a `.tmp` sibling rename.
    pub fn write_contents(path: &Path, database: &Changeset, locks: &[String]) -> Result<()> {
        let mut entries = Vec::with_capacity(database.len());
        for (p, value) in database.iter() {
            if let Some(value) = value {
                entries.push(TableEntry {
                    path: p.to_owned(),
                    value: value.clone(),
                });
            }
        }

        let mut tables = Vec::new();
        if !locks.is_empty() {
            let mut lock_entries: Vec<String> = locks.to_vec();
            lock_entries.sort();
            lock_entries.dedup();
            tables.push(TableSub {
                name: LOCKS_TABLE.to_owned(),
                data: TableData {
                    entries: lock_entries
                        .into_iter()
                        .map(|p| TableEntry {
                            path: p,
                            value: Value::Bool(true),
                        })
                        .collect(),
                    tables: Vec::new(),
                },
            });
        }

        let archive = util::archive(&TableData { entries, tables });
        let mut bytes = Vec::with_capacity(HEADER_LEN + archive.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&[0u8; HEADER_LEN - MAGIC.len()]);
        bytes.extend_from_slice(&archive);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::WriterBackend)?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&tmp, &bytes).map_err(Error::WriterBackend)?;
        fs::rename(&tmp, path).map_err(Error::WriterBackend)?;
        Ok(())
    }
}

/// A borrowed sub-table.
pub struct TableRef<'a> {
    data: &'a ArchivedTableData,
}

impl<'a> TableRef<'a> {
    pub fn has_value(&self, key: &str) -> bool {
        find_in(self.data, key).is_some()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        find_in(self.data, key).map(|e| e.value.to_value())
    }

    pub fn list(&self, dir: &str) -> Vec<String> {
        list_in(self.data, dir)
    }
}

fn find_in<'a>(data: &'a ArchivedTableData, key: &str) -> Option<&'a ArchivedTableEntry> {
    data.entries
        .binary_search_by(|e| e.path.as_str().cmp(key))
        .ok()
        .map(|i| &data.entries[i])
}

fn list_in(data: &ArchivedTableData, dir: &str) -> Vec<String> {
    let entries = &data.entries;
    let start = entries.partition_point(|e| e.path.as_str() < dir);
    let mut names: Vec<String> = Vec::new();
    for entry in entries[start..].iter() {
        let path = entry.path.as_str();
        let rest = match path.strip_prefix(dir) {
            Some(rest) => rest,
            None => break,
        };
        let name = match rest.find('/') {
            Some(pos) => &rest[..=pos],
            None => rest,
        };
        if names.last().map(|n| n.as_str() != name).unwrap_or(true) {
            names.push(name.to_owned());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn sample() -> Changeset {
        let mut db = Changeset::new_database();
        db.set("/a/b", Some(Value::Int32(7).boxed()));
        db.set("/a/c/d", Some(Value::Str("x".into()).boxed()));
        db.set("/e", Some(Value::Bool(true).boxed()));
        db
    }

    #[test]
    fn write_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Table::write_contents(&path, &sample(), &[]).unwrap();

        let table = Table::open(&path).unwrap();
        assert!(table.is_valid());
        assert!(table.has_value("/a/b"));
        assert_eq!(table.get_value("/a/b").unwrap().as_i32(), Some(7));
        assert_eq!(table.get_value("/nope"), None);
        assert_eq!(table.list("/"), ["a/", "e"]);
        assert_eq!(table.list("/a/"), ["b", "c/"]);
        assert_eq!(table.to_database(), sample());
    }

    #[test]
    fn locks_match_key_and_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Table::write_contents(&path, &sample(), &["/a/b".into(), "/locked/".into()]).unwrap();

        let table = Table::open(&path).unwrap();
        assert!(table.has_lock("/a/b"));
        assert!(!table.has_lock("/a/c/d"));
        assert!(table.has_lock("/locked/anything"));
        assert!(table.any_lock_under("/a/"));
        assert!(table.any_lock_under("/locked/sub/"));
        assert!(!table.any_lock_under("/e/"));
        assert!(table.get_table(LOCKS_TABLE).is_some());
        assert!(table.get_table(".nope").is_none());
    }

    #[test]
    fn stomped_header_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        Table::write_contents(&path, &sample(), &[]).unwrap();
        let table = Table::open(&path).unwrap();
        assert!(table.is_valid());

        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[0u8; 8]).unwrap();
        assert!(!table.is_valid());
    }

    #[test]
    fn garbage_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        fs::write(&path, b"not a table file at all........").unwrap();
        match Table::open(&path) {
            Err(Error::FileFormat { .. }) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_file_is_none_on_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Table::load(&dir.path().join("absent")).unwrap().is_none());
    }
}
