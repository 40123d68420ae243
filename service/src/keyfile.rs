//! The keyfile backend: a human-editable text twin of a database.
//!
//! The database proper is still a table file that clients map; next to
//! it sits `<name>.txt`, an INI-like file the user may edit with any
//! tool. Every transaction starts by taking a whole-file advisory lock,
//! re-reading the text and diffing it against the committed database;
//! differences are folded in as an implicit change before the client's
//! own, so external edits flow to readers exactly like writes. A file
//! watch triggers an empty transaction when the text changes outside of
//! any client activity.
//!
//! Groups map to dirs: `[/]` holds root keys, `[a/b]` holds keys under
//! `/a/b/`. Values are printed in the `Value` text form.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sediment_core::{Bus, Changeset, Error, Request, Result, Value};
use tracing::warn;

use crate::writer::{no_base_dir, Emitter, TableWriter, Writer};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct Keyfile {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl Keyfile {
    fn parse(text: &str, fyi: &str) -> Keyfile {
        let mut groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(group) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                groups.entry(group.to_owned()).or_default();
                current = Some(group.to_owned());
            } else if let Some((key, value)) = line.split_once('=') {
                match &current {
                    Some(group) => {
                        groups
                            .entry(group.clone())
                            .or_default()
                            .insert(key.trim().to_owned(), value.trim().to_owned());
                    }
                    None => warn!("{}: entry before any group: {:?}", fyi, line),
                }
            } else {
                warn!("{}: ignoring unparsable line: {:?}", fyi, line);
            }
        }
        Keyfile { groups }
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        for (group, keys) in &self.groups {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push('[');
            out.push_str(group);
            out.push_str("]\n");
            for (key, value) in keys {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }

    /// The database state this text describes. Invalid groups, keys and
    /// values are reported and skipped.
    fn to_changeset(&self, fyi: &str) -> Changeset {
        let mut database = Changeset::new_database();
        for (group, keys) in &self.groups {
            let prefix = if group == "/" {
                "/".to_owned()
            } else if group.starts_with('/') || group.ends_with('/') || group.contains("//") {
                warn!("{}: ignoring invalid group name: {:?}", fyi, group);
                continue;
            } else {
                format!("/{}/", group)
            };
            for (key, raw) in keys {
                if key.is_empty() || key.contains('/') {
                    warn!("{}: [{}]: ignoring invalid key name: {:?}", fyi, group, key);
                    continue;
                }
                match serde_json::from_str::<Value>(raw) {
                    Ok(value) => database.set(&format!("{}{}", prefix, key), Some(value)),
                    Err(e) => {
                        warn!("{}: [{}]: {}: skipping invalid value {:?} ({})", fyi, group, key, raw, e);
                    }
                }
            }
        }
        database
    }

    /// Mirrors a change-set into the text model.
    fn apply(&mut self, change: &Changeset) {
        for (path, value) in change.iter() {
            if path == "/" {
                self.groups.clear();
            } else if path.ends_with('/') {
                // Remove the exactly-named group and every nested one:
                // a reset of "/a/" drops [a] and [a/b] but not [another].
                let exact = &path[1..path.len() - 1];
                let nested = &path[1..];
                self.groups
                    .retain(|group, _| group.as_str() != exact && !group.starts_with(nested));
            } else {
                let (group, key) = split_group_key(path);
                match value {
                    Some(value) => match serde_json::to_string(value) {
                        Ok(text) => {
                            self.groups
                                .entry(group.to_owned())
                                .or_default()
                                .insert(key.to_owned(), text);
                        }
                        Err(e) => warn!("unprintable value for {}: {}", path, e),
                    },
                    None => {
                        if let Some(keys) = self.groups.get_mut(group) {
                            keys.remove(key);
                        }
                    }
                }
            }
        }
    }
}

fn split_group_key(key: &str) -> (&str, &str) {
    let last = key.rfind('/').expect("keys contain a slash");
    if last == 0 {
        ("/", &key[1..])
    } else {
        (&key[1..last], &key[last + 1..])
    }
}

pub struct KeyfileWriter {
    base: TableWriter,
    filename: PathBuf,
    lock_filename: PathBuf,
    lock_file: Option<File>,
    contents: Option<String>,
    keyfile: Keyfile,
    watcher: Option<RecommendedWatcher>,
    emitter: Emitter,
    object_path: String,
}

impl KeyfileWriter {
    pub fn new(name: &str, object_path: String, emitter: Emitter) -> Result<KeyfileWriter> {
        let base = TableWriter::new(name, true, object_path.clone(), emitter.clone())?;
        let dir = dirs::config_dir().ok_or_else(no_base_dir)?.join("sediment");
        Ok(KeyfileWriter {
            base,
            filename: dir.join(format!("{}.txt", name)),
            lock_filename: dir.join(format!("{}.txt-lock", name)),
            lock_file: None,
            contents: None,
            keyfile: Keyfile::default(),
            watcher: None,
            emitter,
            object_path,
        })
    }

    /// Watches the text file so edits made outside the service are
    /// merged promptly: a change schedules an empty transaction against
    /// our own writer object, whose `begin` picks up the diff.
    fn ensure_watch(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        let bus: Bus = self.emitter.bus.clone();
        let object_path = self.object_path.clone();
        let watched = self.filename.clone();
        let result = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(_) => return,
            };
            let interesting = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p == &watched);
            if interesting {
                bus.call(&object_path, Request::Init, Box::new(|_| {}));
            }
        });
        match result {
            Ok(mut watcher) => {
                // Watch the directory: the file itself may not exist yet.
                if let Some(parent) = self.filename.parent() {
                    fs::create_dir_all(parent).ok();
                    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                        warn!("unable to watch {}: {}", parent.display(), e);
                        return;
                    }
                }
                self.watcher = Some(watcher);
            }
            Err(e) => warn!("unable to watch {}: {}", self.filename.display(), e),
        }
    }
}

impl Writer for KeyfileWriter {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn next_tag(&mut self) -> String {
        self.base.next_tag()
    }

    fn begin(&mut self) -> Result<()> {
        self.ensure_watch();

        if let Some(parent) = self.lock_filename.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_filename)?;
        loop {
            match lock.lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.lock_file = Some(lock);

        self.contents = match fs::read_to_string(&self.filename) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let fyi = self.filename.display().to_string();
        self.keyfile = self
            .contents
            .as_deref()
            .map(|text| Keyfile::parse(text, &fyi))
            .unwrap_or_default();

        self.base.begin()?;

        // Fold in whatever changed behind our back — external edits and
        // the very first population of the database.
        if let Some(changes) = self.base.diff_committed(&self.keyfile.to_changeset(&fyi)) {
            changes.seal();
            self.base.change(Arc::new(changes), "");
        }
        Ok(())
    }

    fn change(&mut self, change: Arc<Changeset>, tag: &str) {
        self.keyfile.apply(&change);
        self.base.change(change, tag);
    }

    fn commit(&mut self) -> Result<()> {
        let text = self.keyfile.to_text();
        if self.contents.as_deref() != Some(text.as_str()) {
            fs::write(&self.filename, &text).map_err(Error::WriterBackend)?;
        }
        self.base.commit()
    }

    fn end(&mut self) {
        self.base.end();
        self.contents = None;
        if let Some(lock) = self.lock_file.take() {
            lock.unlock().ok();
        }
    }
}

/// Names of the keyfile databases that exist on disk for this user.
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
        .filter_map(|name| name.strip_suffix(".txt").map(str::to_owned))
        .collect();
    names.sort();
    names
}
