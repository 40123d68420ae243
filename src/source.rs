//! One layer of the read-side composition: an opened table file, its
//! lock records, and the machinery to notice that the file has been
//! rewritten and re-open it.

use std::path::PathBuf;

use sediment_core::{BusKind, BusMap, Request, Result, Shm, Table, OBJECT_PREFIX};
use tracing::{error, warn};

use crate::profile::{SourceDesc, SourceKind};

/// Where system databases live.
pub const SYSTEM_DB_DIR: &str = "/etc/sediment/db";

enum State {
    /// User sources carry a mapping of the invalidation flag; the table
    /// is never held without it.
    User { shm: Option<Shm> },
    Plain,
}

pub(crate) struct Source {
    pub name: String,
    pub kind: SourceKind,
    pub writable: bool,
    pub bus_kind: Option<BusKind>,
    pub object_path: Option<String>,
    values: Option<Table>,
    state: State,
    did_warn: bool,
}

impl Source {
    pub fn new(desc: &SourceDesc) -> Source {
        let (writable, bus_kind, object_path, state) = match desc.kind {
            SourceKind::User => (
                true,
                Some(BusKind::Session),
                Some(format!("{}/Writer/{}", OBJECT_PREFIX, desc.name)),
                State::User { shm: None },
            ),
            SourceKind::Service => (
                true,
                Some(BusKind::Session),
                Some(format!("{}/{}", OBJECT_PREFIX, desc.name)),
                State::Plain,
            ),
            SourceKind::System | SourceKind::File => (false, None, None, State::Plain),
        };
        Source {
            name: desc.name.clone(),
            kind: desc.kind,
            writable,
            bus_kind,
            object_path,
            values: None,
            state,
            did_warn: false,
        }
    }

    /// One-time setup. For user sources this maps the invalidation flag
    /// and opens the data file; failure to map the flag is fatal, since
    /// without it the reader could never learn of a rewrite.
    pub fn init(&mut self) -> Result<()> {
        if matches!(self.state, State::User { .. }) {
            let mapping = match Shm::open(&self.name) {
                Ok(mapping) => mapping,
                Err(e) => {
                    error!(
                        "unable to map the invalidation flag for {:?}: {}",
                        self.name, e
                    );
                    return Err(e);
                }
            };
            if let State::User { shm } = &mut self.state {
                *shm = Some(mapping);
            }
            self.open_file(true);
        }
        Ok(())
    }

    fn filename(&self) -> Option<PathBuf> {
        match self.kind {
            SourceKind::User => Some(dirs::config_dir()?.join("sediment").join(&self.name)),
            SourceKind::Service => Some(
                dirs::runtime_dir()?
                    .join("sediment-service")
                    .join(&self.name),
            ),
            SourceKind::System => Some(PathBuf::from(SYSTEM_DB_DIR).join(&self.name)),
            SourceKind::File => Some(PathBuf::from(&self.name)),
        }
    }

    fn needs_reopen(&self) -> bool {
        match (&self.state, self.kind) {
            (State::User { shm }, _) => shm.as_ref().map(Shm::is_flagged).unwrap_or(false),
            (State::Plain, SourceKind::File) => self.values.is_none(),
            (State::Plain, _) => self.values.as_ref().map(|t| !t.is_valid()).unwrap_or(true),
        }
    }

    /// Cheap per-call check: re-opens the table when the invalidation
    /// flag (user) or the file's own validity (system/service) says the
    /// mapping is stale. Returns true when the source changed.
    pub fn refresh(&mut self, buses: &BusMap) -> bool {
        if !self.needs_reopen() {
            return false;
        }
        self.values = None;
        self.reopen(buses);
        true
    }

    fn reopen(&mut self, buses: &BusMap) {
        match self.kind {
            SourceKind::User => {
                // Remap the flag before the data file: the fresh page
                // reads 0, and any rewrite that slips in between simply
                // flags it again.
                let mapping = match Shm::open(&self.name) {
                    Ok(mapping) => Some(mapping),
                    Err(e) => {
                        self.warn_once(&format!(
                            "unable to remap the invalidation flag for {:?}: {}",
                            self.name, e
                        ));
                        None
                    }
                };
                let mapped = mapping.is_some();
                if let State::User { shm } = &mut self.state {
                    *shm = mapping;
                }
                if mapped {
                    self.open_file(true);
                }
            }
            SourceKind::Service => {
                // A missing file means the service has never
                // materialized this database; kick it and try again.
                if let (Some(path), Some(kind), Some(object_path)) =
                    (self.filename(), self.bus_kind, self.object_path.as_deref())
                {
                    if !path.exists() {
                        buses.get(kind).call_sync(object_path, Request::Init).ok();
                    }
                }
                self.open_file(false);
            }
            SourceKind::System | SourceKind::File => self.open_file(false),
        }
    }

    fn open_file(&mut self, missing_is_normal: bool) {
        let path = match self.filename() {
            Some(path) => path,
            None => {
                self.warn_once(&format!(
                    "no base directory available for database {:?}",
                    self.name
                ));
                return;
            }
        };
        match Table::open(&path) {
            Ok(table) => self.values = Some(table),
            Err(sediment_core::Error::Io(e))
                if missing_is_normal && e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.warn_once(&format!(
                    "unable to open {}: {}; expect degraded performance",
                    path.display(),
                    e
                ));
            }
        }
    }

    fn warn_once(&mut self, message: &str) {
        if !self.did_warn {
            warn!("{}", message);
            self.did_warn = true;
        }
    }

    pub fn lookup(&self, key: &str) -> Option<sediment_core::Value> {
        self.values.as_ref()?.get_value(key)
    }

    pub fn list(&self, dir: &str) -> Vec<String> {
        self.values
            .as_ref()
            .map(|t| t.list(dir))
            .unwrap_or_default()
    }

    pub fn has_lock(&self, key: &str) -> bool {
        self.values.as_ref().map(|t| t.has_lock(key)).unwrap_or(false)
    }

    pub fn any_lock_under(&self, dir: &str) -> bool {
        self.values
            .as_ref()
            .map(|t| t.any_lock_under(dir))
            .unwrap_or(false)
    }
}
