//! The table-file writer: transactional application of change-sets to
//! one database.
//!
//! A transaction is a `begin`/`change`*/`commit`/`end` cycle. The
//! committed database lives in memory as a database change-set; `begin`
//! layers an uncommitted copy on top, `change` folds client change-sets
//! into it and queues them with their tags, `commit` serializes the
//! overlay to disk behind an atomic rename and promotes it, and `end`
//! emits one notification per committed change. A failed commit drops
//! the overlay and its queued changes — committed state is untouched and
//! no notification escapes.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use sediment_core::{Bus, Changeset, Error, Notify, Result, Shm, Table};
use tracing::warn;

/// What a writer needs to mint tags and raise signals.
#[derive(Clone)]
pub struct Emitter {
    pub bus: Bus,
    pub unique_name: String,
}

/// The transaction cycle every backend implements.
pub trait Writer: Send {
    fn name(&self) -> &str;

    /// Mints a tag unique to this writer: `<unique-name>:<db>:<serial>`.
    fn next_tag(&mut self) -> String;

    /// Loads committed state (first time) and opens the overlay.
    fn begin(&mut self) -> Result<()>;

    /// Folds `change` into the overlay and queues it under `tag`.
    fn change(&mut self, change: Arc<Changeset>, tag: &str);

    /// Persists the overlay and promotes it to committed.
    fn commit(&mut self) -> Result<()>;

    /// Closes the transaction: drops any uncommitted leftovers and
    /// emits one notification per committed change. Always called, on
    /// success and failure alike.
    fn end(&mut self);
}

struct TaggedChange {
    change: Arc<Changeset>,
    tag: String,
}

pub struct TableWriter {
    name: String,
    filename: PathBuf,
    object_path: String,
    /// Native writers serve a user database: the file sits under the
    /// config dir and readers learn of rewrites through the shared
    /// invalidation flag. Non-native (service) writers keep the file in
    /// the runtime dir and invalidate by stomping the old file's header.
    native: bool,
    emitter: Emitter,
    tag_serial: u64,
    need_write: bool,
    /// Set when the file is missing and a client depends on it existing.
    create_pending: bool,
    committed: Option<Changeset>,
    uncommitted: Option<Changeset>,
    uncommitted_changes: VecDeque<TaggedChange>,
    committed_changes: VecDeque<TaggedChange>,
}

pub(crate) fn no_base_dir() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        "no base directory for databases",
    ))
}

impl TableWriter {
    pub fn new(
        name: &str,
        native: bool,
        object_path: String,
        emitter: Emitter,
    ) -> Result<TableWriter> {
        let filename = if native {
            dirs::config_dir()
                .ok_or_else(no_base_dir)?
                .join("sediment")
                .join(name)
        } else {
            dirs::runtime_dir()
                .ok_or_else(no_base_dir)?
                .join("sediment-service")
                .join(name)
        };
        Ok(TableWriter {
            name: name.to_owned(),
            filename,
            object_path,
            native,
            emitter,
            tag_serial: 0,
            need_write: false,
            create_pending: false,
            committed: None,
            uncommitted: None,
            uncommitted_changes: VecDeque::new(),
            committed_changes: VecDeque::new(),
        })
    }

    /// The committed database diffed against `other`, for backends that
    /// merge external edits.
    pub(crate) fn diff_committed(&self, other: &Changeset) -> Option<Changeset> {
        self.committed
            .as_ref()
            .expect("diff inside a transaction")
            .diff(other)
    }
}

impl Writer for TableWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_tag(&mut self) -> String {
        let tag = format!(
            "{}:{}:{}",
            self.emitter.unique_name, self.name, self.tag_serial
        );
        self.tag_serial += 1;
        tag
    }

    fn begin(&mut self) -> Result<()> {
        if self.committed.is_none() {
            // A load error must abort: overwriting a database we could
            // not read would throw away someone's configuration.
            match Table::load(&self.filename)? {
                Some(table) => self.committed = Some(table.to_database()),
                None => {
                    self.committed = Some(Changeset::new_database());
                    // Service clients poll for the file; make sure the
                    // first commit materializes it even when empty.
                    if !self.native {
                        self.create_pending = true;
                    }
                }
            }
        }
        self.uncommitted = Some(self.committed.clone().expect("committed state loaded"));
        Ok(())
    }

    fn change(&mut self, change: Arc<Changeset>, tag: &str) {
        let overlay = self
            .uncommitted
            .as_mut()
            .expect("change outside a transaction");
        overlay.change(&change);
        self.uncommitted_changes.push_back(TaggedChange {
            change,
            tag: tag.to_owned(),
        });
        self.need_write = true;
    }

    fn commit(&mut self) -> Result<()> {
        let unchanged = !self.need_write || self.uncommitted == self.committed;
        if unchanged && !self.create_pending {
            // Nothing to write; drop the overlay but still promote the
            // queued changes so their notifications fire.
            self.uncommitted = None;
            self.committed_changes.append(&mut self.uncommitted_changes);
            self.need_write = false;
            return Ok(());
        }

        // For a service database, readers may hold mappings of the file
        // being replaced; grab it before the rename so its header can be
        // stomped afterwards.
        let invalidate = if !self.native {
            fs::OpenOptions::new().write(true).open(&self.filename).ok()
        } else {
            None
        };

        let overlay = self.uncommitted.as_ref().expect("commit outside a transaction");
        Table::write_contents(&self.filename, overlay, &[])?;

        if self.native {
            if let Err(e) = Shm::flag(&self.name) {
                warn!("unable to flag {:?} as invalid: {}", self.name, e);
            }
        }
        if let Some(old) = invalidate {
            old.write_all_at(&[0u8; 8], 0).ok();
        }

        self.committed = self.uncommitted.take();
        self.committed_changes.append(&mut self.uncommitted_changes);
        self.need_write = false;
        self.create_pending = false;
        Ok(())
    }

    fn end(&mut self) {
        self.uncommitted_changes.clear();
        self.uncommitted = None;
        while let Some(tagged) = self.committed_changes.pop_front() {
            if let Some(description) = tagged.change.describe() {
                self.emitter.bus.emit(Notify {
                    object_path: self.object_path.clone(),
                    prefix: description.prefix,
                    paths: description.paths,
                    tag: tagged.tag,
                });
            }
        }
    }
}

/// Names of the table databases that exist on disk for this user: plain
/// files without a dot in the database directory.
pub fn list_existing() -> Vec<String> {
    let dir = match dirs::config_dir() {
        Some(dir) => dir.join("sediment"),
        None => return Vec::new(),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.contains('.'))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::Value;

    fn scratch() -> (parking_lot::MutexGuard<'static, ()>, tempfile::TempDir, Emitter) {
        let (guard, dir) = crate::testenv::scratch();
        let emitter = Emitter {
            bus: Bus::new(),
            unique_name: ":1.0".into(),
        };
        (guard, dir, emitter)
    }

    fn write(writer: &mut TableWriter, change: Changeset) -> String {
        let tag = writer.next_tag();
        change.seal();
        writer.begin().unwrap();
        writer.change(Arc::new(change), &tag);
        writer.commit().unwrap();
        writer.end();
        tag
    }

    #[test]
    fn commit_persists_and_reloads() {
        let (_guard, _dir, emitter) = scratch();
        let mut writer = TableWriter::new("db", true, "/dev/sediment/Writer/db".into(), emitter)
            .unwrap();

        let mut change = Changeset::new();
        change.set("/a/b", Some(Value::Int32(7)));
        let tag = write(&mut writer, change);
        assert_eq!(tag, ":1.0:db:0");

        let table = Table::load(&writer.filename).unwrap().unwrap();
        assert_eq!(table.get_value("/a/b").unwrap().as_i32(), Some(7));

        // A fresh writer starts from the persisted state.
        let emitter = Emitter {
            bus: Bus::new(),
            unique_name: ":1.1".into(),
        };
        let mut again =
            TableWriter::new("db", true, "/dev/sediment/Writer/db".into(), emitter).unwrap();
        again.begin().unwrap();
        assert_eq!(
            again.uncommitted.as_ref().unwrap().get("/a/b"),
            Some(Some(&Value::Int32(7)))
        );
        again.end();
    }

    #[test]
    fn unchanged_commit_skips_the_write() {
        let (_guard, _dir, emitter) = scratch();
        let mut writer =
            TableWriter::new("db2", true, "/dev/sediment/Writer/db2".into(), emitter).unwrap();

        use std::os::unix::fs::MetadataExt;

        let mut change = Changeset::new();
        change.set("/k", Some(Value::Bool(true)));
        write(&mut writer, change);
        let before = fs::metadata(&writer.filename).unwrap().ino();

        // Same value again: structurally identical overlay, so no new
        // file is renamed into place.
        let mut same = Changeset::new();
        same.set("/k", Some(Value::Bool(true)));
        write(&mut writer, same);
        let after = fs::metadata(&writer.filename).unwrap().ino();
        assert_eq!(before, after);
    }

    #[test]
    fn service_writer_creates_missing_file_on_init() {
        let (_guard, _dir, emitter) = scratch();
        let mut writer =
            TableWriter::new("vol", false, "/dev/sediment/vol".into(), emitter).unwrap();

        // An Init cycle with no client change still materializes it.
        writer.begin().unwrap();
        writer.commit().unwrap();
        writer.end();
        assert!(writer.filename.exists());
    }

    #[test]
    fn dir_reset_composes_into_committed_state() {
        let (_guard, _dir, emitter) = scratch();
        let mut writer =
            TableWriter::new("db3", true, "/dev/sediment/Writer/db3".into(), emitter).unwrap();

        let mut seed = Changeset::new();
        seed.set("/p/a", Some(Value::Int32(1)));
        seed.set("/p/b", Some(Value::Int32(2)));
        seed.set("/q", Some(Value::Int32(3)));
        write(&mut writer, seed);

        let mut reset = Changeset::new();
        reset.set("/p/", None);
        reset.set("/p/c", Some(Value::Int32(4)));
        write(&mut writer, reset);

        let table = Table::load(&writer.filename).unwrap().unwrap();
        assert!(!table.has_value("/p/a"));
        assert!(!table.has_value("/p/b"));
        assert_eq!(table.get_value("/p/c").unwrap().as_i32(), Some(4));
        assert_eq!(table.get_value("/q").unwrap().as_i32(), Some(3));
    }
}
