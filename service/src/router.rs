//! One writer object per database name, created on first reference.
//!
//! The router is the service's bus handler: it owns the name→writer map
//! and turns requests into transaction cycles. The object path selects
//! the flavor — `…/Writer/<name>` is a native user database,
//! `…/<name>` an ephemeral service database. The bus dispatch layer
//! serializes calls, so writers themselves need no locking beyond the
//! map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use sediment_core::paths;
use sediment_core::{
    Bus, Changeset, Error, Handler, Reply, Request, Result, OBJECT_PREFIX,
};

use crate::blame::Blame;
use crate::keyfile::KeyfileWriter;
use crate::writer::{Emitter, TableWriter, Writer};

struct Inner {
    bus: Bus,
    unique_name: Mutex<String>,
    writers: Mutex<HashMap<String, Box<dyn Writer>>>,
    blame: Blame,
}

/// The writer service: attach it to a bus and it serves every database
/// name under [`OBJECT_PREFIX`].
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

struct RouterHandler(Arc<Inner>);

impl Router {
    pub fn attach(bus: &Bus) -> Router {
        let inner = Arc::new(Inner {
            bus: bus.clone(),
            unique_name: Mutex::new(String::new()),
            writers: Mutex::new(HashMap::new()),
            blame: Blame::from_env(),
        });
        let name = bus.register(OBJECT_PREFIX, Arc::new(RouterHandler(inner.clone())));
        *inner.unique_name.lock() = name;
        Router { inner }
    }

    /// The connection's unique name, the first component of every tag
    /// this service mints.
    pub fn unique_name(&self) -> String {
        self.inner.unique_name.lock().clone()
    }

    /// The transaction log, for diagnostics.
    pub fn blame(&self) -> &Blame {
        &self.inner.blame
    }

    /// Databases present on disk, across both backends.
    pub fn list_existing(&self) -> Vec<String> {
        let mut names = crate::writer::list_existing();
        names.extend(crate::keyfile::list_existing());
        names.sort();
        names.dedup();
        names
    }
}

impl Inner {
    fn create_writer(&self, name: &str, native: bool, object_path: &str) -> Result<Box<dyn Writer>> {
        let emitter = Emitter {
            bus: self.bus.clone(),
            unique_name: self.unique_name.lock().clone(),
        };
        if native && keyfile_selected(name) {
            Ok(Box::new(KeyfileWriter::new(
                name,
                object_path.to_owned(),
                emitter,
            )?))
        } else {
            Ok(Box::new(TableWriter::new(
                name,
                native,
                object_path.to_owned(),
                emitter,
            )?))
        }
    }
}

/// The keyfile backend serves a name when its text file already exists,
/// or for every new name when `SEDIMENT_BACKEND=keyfile`.
fn keyfile_selected(name: &str) -> bool {
    if std::env::var_os("SEDIMENT_BACKEND").map(|v| v == "keyfile") == Some(true) {
        return true;
    }
    dirs::config_dir()
        .map(|dir| {
            PathBuf::from(dir)
                .join("sediment")
                .join(format!("{}.txt", name))
                .exists()
        })
        .unwrap_or(false)
}

impl Handler for RouterHandler {
    fn call(&self, object_path: &str, request: Request) -> Result<Reply> {
        self.0.blame.record(object_path, &request);
        if matches!(request, Request::Blame) {
            return Ok(Reply::Text(self.0.blame.text()));
        }

        let rest = object_path
            .strip_prefix(OBJECT_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| Error::Transport(format!("bad object path {}", object_path)))?;
        let (name, native) = match rest.strip_prefix("Writer/") {
            Some(name) => (name, true),
            None => (rest, false),
        };

        let mut writers = self.0.writers.lock();
        if !writers.contains_key(name) {
            let writer = self.0.create_writer(name, native, object_path)?;
            writers.insert(name.to_owned(), writer);
        }
        let writer = writers.get_mut(name).expect("just inserted");
        dispatch(writer.as_mut(), request)
    }
}

fn dispatch(writer: &mut dyn Writer, request: Request) -> Result<Reply> {
    match request {
        Request::Init => {
            let result = writer.begin().and_then(|_| writer.commit());
            writer.end();
            result.map(|_| Reply::Unit)
        }
        Request::Change(blob) => apply(writer, Changeset::deserialize(&blob)?),
        Request::Write { key, value } => {
            if value.is_some() {
                paths::require_key(&key)?;
            } else {
                paths::require_path(&key)?;
            }
            apply(writer, Changeset::new_write(&key, value))
        }
        Request::WriteMany { prefix, changes } => {
            let mut change = Changeset::new();
            for (rel, value) in changes {
                let path = format!("{}{}", prefix, rel);
                if value.is_some() {
                    paths::require_key(&path)?;
                } else {
                    paths::require_path(&path)?;
                }
                change.set(&path, value);
            }
            apply(writer, change)
        }
        Request::Blame => unreachable!("handled by the router"),
    }
}

/// One full transaction cycle. The tag is minted up front and returned
/// even for an empty change, so every call is acknowledged uniformly.
fn apply(writer: &mut dyn Writer, change: Changeset) -> Result<Reply> {
    let tag = writer.next_tag();
    let result = if change.is_empty() {
        Ok(())
    } else {
        change.seal();
        writer.begin().and_then(|_| {
            writer.change(Arc::new(change), &tag);
            writer.commit()
        })
    };
    writer.end();
    result.map(|_| Reply::Tag(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::Value;

    fn scratch() -> (parking_lot::MutexGuard<'static, ()>, tempfile::TempDir, Bus) {
        let (guard, dir) = crate::testenv::scratch();
        (guard, dir, Bus::new())
    }

    #[test]
    fn change_round_trip_over_the_bus() {
        let (_guard, _dir, bus) = scratch();
        let router = Router::attach(&bus);
        assert_eq!(router.unique_name(), ":1.0");

        let mut change = Changeset::new();
        change.set("/a/b", Some(Value::Int32(7)));
        let reply = bus
            .call_sync(
                "/dev/sediment/Writer/db",
                Request::Change(change.serialize()),
            )
            .unwrap();
        match reply {
            Reply::Tag(tag) => assert_eq!(tag, ":1.0:db:0"),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(router.list_existing(), ["db"]);
    }

    #[test]
    fn write_shorthand_validates_paths() {
        let (_guard, _dir, bus) = scratch();
        let _router = Router::attach(&bus);

        let bad = bus.call_sync(
            "/dev/sediment/Writer/db",
            Request::Write {
                key: "/ends/in/slash/".into(),
                value: Some(Value::Int32(1)),
            },
        );
        assert!(matches!(bad, Err(Error::InvalidPath(_))));

        // A dir path is fine for a reset.
        bus.call_sync(
            "/dev/sediment/Writer/db",
            Request::Write {
                key: "/ends/in/slash/".into(),
                value: None,
            },
        )
        .unwrap();
    }

    #[test]
    fn init_materializes_service_databases() {
        let (_guard, dir, bus) = scratch();
        let _router = Router::attach(&bus);

        bus.call_sync("/dev/sediment/vol", Request::Init).unwrap();
        assert!(dir
            .path()
            .join("runtime")
            .join("sediment-service")
            .join("vol")
            .exists());
    }

    #[test]
    fn blame_log_served_over_the_bus() {
        let (_guard, _dir, bus) = scratch();
        let router = Router::attach(&bus);
        router.blame().enable();

        bus.call_sync("/dev/sediment/Writer/db", Request::Init)
            .unwrap();
        let reply = bus
            .call_sync("/dev/sediment/Writer/db", Request::Blame)
            .unwrap();
        match reply {
            Reply::Text(text) => {
                assert!(text.contains("Method: Init"));
                assert!(text.contains("Object path: /dev/sediment/Writer/db"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
