//! The client engine: layered reads with lock precedence, the in-flight
//! write queue, and change-signal routing.
//!
//! One mutex guards all engine state and is only ever held for in-memory
//! work — never across a bus call. Reads refresh every source first (a
//! cheap staleness check per source), then consult the in-flight queue
//! so a client always observes its own writes, then walk the layers.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use fnv::FnvHashMap;
use futures::channel::mpsc;
use parking_lot::{Condvar, Mutex};
use sediment_core::paths;
use sediment_core::{
    BusKind, BusMap, Changeset, Error, MatchRule, Notify, Reply, Request, Result, Value,
};
use smallvec::SmallVec;
use tracing::warn;

use crate::profile::Profile;
use crate::source::Source;

/// How many acknowledged transaction tags are remembered for suppressing
/// the echo of our own writes.
const TAG_MEMORY: usize = 16;

/// A change notification delivered to [`Engine::events`] subscribers.
///
/// `tag` is `Some` for changes committed by a writer service (possibly
/// on behalf of another client) and `None` for synthetic local events:
/// the immediate echo of a fast write, the revert after a failed one,
/// and the catch-up event after establishing a watch.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub prefix: String,
    pub paths: Vec<String>,
    pub tag: Option<String>,
}

struct Queued {
    change: Arc<Changeset>,
    in_flight: bool,
}

struct PendingWatch {
    path: String,
    serial: u64,
}

struct State {
    sources: Vec<Source>,
    serial: u64,
    queue: SmallVec<[Queued; 2]>,
    committed_tags: VecDeque<String>,
    watch_counts: FnvHashMap<String, usize>,
    pending_watches: Vec<PendingWatch>,
    subscribers: Vec<(BusKind, u64)>,
}

struct Shared {
    buses: BusMap,
    state: Mutex<State>,
    idle: Condvar,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

/// A handle on one profile's worth of configuration. Cheap to clone;
/// clones share all state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Builds the engine for `profile`, resolving writers through
    /// `buses`. Fails only when a user source cannot map its
    /// invalidation flag.
    pub fn new(profile: &Profile, buses: BusMap) -> Result<Engine> {
        let mut sources = Vec::with_capacity(profile.sources.len());
        for desc in &profile.sources {
            let mut source = Source::new(desc);
            source.init()?;
            sources.push(source);
        }

        let kinds: BTreeSet<BusKind> = sources
            .iter()
            .filter(|s| s.writable)
            .filter_map(|s| s.bus_kind)
            .collect();

        let shared = Arc::new(Shared {
            buses,
            state: Mutex::new(State {
                sources,
                serial: 0,
                queue: SmallVec::new(),
                committed_tags: VecDeque::new(),
                watch_counts: FnvHashMap::default(),
                pending_watches: Vec::new(),
                subscribers: Vec::new(),
            }),
            idle: Condvar::new(),
            watchers: Mutex::new(Vec::new()),
        });

        for kind in kinds {
            let weak = Arc::downgrade(&shared);
            let id = shared.buses.get(kind).subscribe(Arc::new(move |notify| {
                if let Some(shared) = weak.upgrade() {
                    Shared::handle_notify(&shared, notify);
                }
            }));
            shared.state.lock().subscribers.push((kind, id));
        }

        {
            let mut state = shared.state.lock();
            Shared::refresh(&shared, &mut state);
        }

        Ok(Engine { shared })
    }

    /// Returns a stream of change events. Every clone of the engine
    /// feeds every subscribed stream.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.shared.watchers.lock().push(tx);
        rx
    }

    /// Reads `key`, honoring locks and the in-flight queue.
    pub fn read(&self, key: &str) -> Result<Option<Value>> {
        paths::require_key(key)?;
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);

        let start = lock_floor(&state.sources, key);
        for queued in state.queue.iter().rev() {
            if let Some(binding) = queued.change.binding(key) {
                return Ok(match binding {
                    Some(value) => Some(value.clone()),
                    // A queued reset uncovers whatever the read-only
                    // layers hold.
                    None => read_sources(&state.sources, key, start.max(1)),
                });
            }
        }
        Ok(read_sources(&state.sources, key, start))
    }

    /// Reads `key` as if the writable layer did not exist: the value the
    /// key would revert to on reset.
    pub fn read_default(&self, key: &str) -> Result<Option<Value>> {
        paths::require_key(key)?;
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);
        let start = lock_floor(&state.sources, key);
        Ok(read_sources(&state.sources, key, start.max(1)))
    }

    /// Reads only the writable layer (including the in-flight queue),
    /// ignoring defaults underneath.
    pub fn read_local(&self, key: &str) -> Result<Option<Value>> {
        paths::require_key(key)?;
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);

        for queued in state.queue.iter().rev() {
            if let Some(binding) = queued.change.binding(key) {
                return Ok(binding.cloned());
            }
        }
        Ok(state
            .sources
            .first()
            .filter(|s| s.writable)
            .and_then(|s| s.lookup(key)))
    }

    /// Lists the direct children of `dir` across all layers, overlaying
    /// writes still in flight. Sorted and deduplicated.
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        paths::require_dir(dir)?;
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);

        let mut user: BTreeSet<String> = BTreeSet::new();
        let mut lower: BTreeSet<String> = BTreeSet::new();
        for (i, source) in state.sources.iter().enumerate() {
            let into = if i == 0 && source.writable {
                &mut user
            } else {
                &mut lower
            };
            into.extend(source.list(dir));
        }

        // The queue only ever affects the writable layer, so resets are
        // applied against the children that layer contributed; a child
        // also present in a lower layer stays visible.
        for queued in state.queue.iter() {
            for (path, value) in queued.change.iter() {
                if path.ends_with('/') {
                    if dir.starts_with(path) {
                        user.clear();
                    } else if let Some(child) = direct_child(dir, path) {
                        if path.len() == dir.len() + child.len() {
                            user.remove(child);
                        }
                    }
                } else if let Some(child) = direct_child(dir, path) {
                    if value.is_some() {
                        user.insert(child.to_owned());
                    } else if path.len() == dir.len() + child.len() {
                        user.remove(child);
                    }
                }
            }
        }

        user.extend(lower);
        Ok(user.into_iter().collect())
    }

    /// A key is writable when no layer below the first carries a lock
    /// for it. The writable layer's own locks are ignored — they would
    /// only stop the user from resetting their own keys.
    pub fn is_writable(&self, key: &str) -> bool {
        if !paths::is_key(key) {
            return false;
        }
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);
        path_writable(&state.sources, key)
    }

    /// Queues `change` and returns immediately. The local echo event
    /// fires before this returns; the writer's acknowledgement is
    /// handled in the background, coalescing repeated similar writes so
    /// at most one request per database is in flight with at most one
    /// pending behind it.
    pub fn change_fast(&self, change: Changeset) -> Result<()> {
        change.seal();
        let change = Arc::new(change);
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);
        validate_writable(&state.sources, &change)?;
        if change.is_empty() {
            return Ok(());
        }

        match state.queue.last_mut() {
            Some(last) if !last.in_flight && last.change.is_similar_to(&change) => {
                last.change = change.clone();
            }
            _ => state.queue.push(Queued {
                change: change.clone(),
                in_flight: false,
            }),
        }

        if let Some(description) = change.describe() {
            self.shared.emit(ChangeEvent {
                prefix: description.prefix,
                paths: description.paths,
                tag: None,
            });
        }

        Shared::dispatch(&self.shared, &mut state);
        Ok(())
    }

    /// Sends `change` and blocks for the writer's acknowledgement tag.
    pub fn change_sync(&self, change: Changeset) -> Result<String> {
        change.seal();
        let kind;
        let object_path;
        let body;
        {
            let mut state = self.shared.state.lock();
            Shared::refresh(&self.shared, &mut state);
            validate_writable(&state.sources, &change)?;
            let source = &state.sources[0];
            kind = source.bus_kind.expect("writable source has a bus");
            object_path = source.object_path.clone().expect("writable source has a path");
            body = change.serialize();
        }

        match self
            .shared
            .buses
            .get(kind)
            .call_sync(&object_path, Request::Change(body))?
        {
            Reply::Tag(tag) => Ok(tag),
            other => Err(Error::Transport(format!("unexpected reply: {:?}", other))),
        }
    }

    /// Subscribes to changes under `path` (a key or a dir). Reference
    /// counted per path; the first subscription installs a match rule
    /// with every writable source's bus.
    pub fn watch(&self, path: &str) -> Result<()> {
        paths::require_path(path)?;
        let mut state = self.shared.state.lock();
        let count = state.watch_counts.entry(path.to_owned()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(());
        }

        let serial = state.serial;
        state.pending_watches.push(PendingWatch {
            path: path.to_owned(),
            serial,
        });

        for (kind, object_path) in watchable(&state.sources) {
            let subscriber = subscriber_for(&state.subscribers, kind);
            let rule = MatchRule {
                object_path,
                arg0_prefix: path.to_owned(),
            };
            let weak = Arc::downgrade(&self.shared);
            let watched = path.to_owned();
            self.shared.buses.get(kind).add_match(
                subscriber,
                rule,
                Box::new(move |_| {
                    if let Some(shared) = weak.upgrade() {
                        Shared::watch_established(&shared, &watched);
                    }
                }),
            );
        }
        Ok(())
    }

    /// Drops one subscription on `path`; the last drop removes the match
    /// rules.
    pub fn unwatch(&self, path: &str) -> Result<()> {
        paths::require_path(path)?;
        let mut state = self.shared.state.lock();
        let count = match state.watch_counts.get_mut(path) {
            Some(count) => count,
            None => return Ok(()),
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        state.watch_counts.remove(path);
        state.pending_watches.retain(|w| w.path != path);

        for (kind, object_path) in watchable(&state.sources) {
            let subscriber = subscriber_for(&state.subscribers, kind);
            self.shared.buses.get(kind).remove_match(
                subscriber,
                MatchRule {
                    object_path,
                    arg0_prefix: path.to_owned(),
                },
            );
        }
        Ok(())
    }

    /// Blocks until every queued write has been acknowledged.
    pub fn sync(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }

    /// The number of writes queued but not yet acknowledged. Diagnostic.
    pub fn pending_writes(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// A counter that moves every time any source is re-opened.
    pub fn state_serial(&self) -> u64 {
        let mut state = self.shared.state.lock();
        Shared::refresh(&self.shared, &mut state);
        state.serial
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) > 1 {
            return;
        }
        let subscribers = std::mem::take(&mut self.shared.state.lock().subscribers);
        for (kind, id) in subscribers {
            self.shared.buses.get(kind).unsubscribe(id);
        }
    }
}

impl Shared {
    fn refresh(shared: &Shared, state: &mut State) {
        for source in &mut state.sources {
            if source.refresh(&shared.buses) {
                state.serial += 1;
            }
        }
    }

    fn emit(&self, event: ChangeEvent) {
        self.watchers
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Sends the queue head if nothing is in flight. Called with the
    /// state lock held; the bus call itself only enqueues.
    fn dispatch(shared: &Arc<Shared>, state: &mut State) {
        let (kind, object_path) = {
            let source = match state.sources.first() {
                Some(source) if source.writable => source,
                _ => return,
            };
            (
                source.bus_kind.expect("writable source has a bus"),
                source.object_path.clone().expect("writable source has a path"),
            )
        };
        let head = match state.queue.first_mut() {
            Some(head) if !head.in_flight => head,
            _ => return,
        };
        head.in_flight = true;
        let body = head.change.serialize();

        let weak = Arc::downgrade(shared);
        shared.buses.get(kind).call(
            &object_path,
            Request::Change(body),
            Box::new(move |result| {
                if let Some(shared) = weak.upgrade() {
                    Shared::handle_reply(&shared, result);
                }
            }),
        );
    }

    fn handle_reply(shared: &Arc<Shared>, result: Result<Reply>) {
        let mut event = None;
        {
            let mut state = shared.state.lock();
            if state.queue.is_empty() {
                return;
            }
            let head = state.queue.remove(0);
            match result {
                Ok(Reply::Tag(tag)) => {
                    state.committed_tags.push_back(tag);
                    while state.committed_tags.len() > TAG_MEMORY {
                        state.committed_tags.pop_front();
                    }
                }
                other => {
                    if let Err(e) = &other {
                        warn!("write rejected by the writer service: {}", e);
                    }
                    // The write never happened: emit a synthetic event so
                    // listeners re-read and observe the old value.
                    event = head.change.describe().map(|d| ChangeEvent {
                        prefix: d.prefix,
                        paths: d.paths,
                        tag: None,
                    });
                }
            }
            Shared::dispatch(shared, &mut state);
            if state.queue.is_empty() {
                shared.idle.notify_all();
            }
            if let Some(event) = event.take() {
                self_emit_locked(shared, event);
            }
        }
    }

    fn handle_notify(shared: &Arc<Shared>, notify: &Notify) {
        let mut state = shared.state.lock();
        let known = state
            .sources
            .iter()
            .any(|s| s.object_path.as_deref() == Some(notify.object_path.as_str()));
        if !known {
            return;
        }
        // The echo of our own queued write: the local event already
        // fired when the write was queued.
        if let Some(pos) = state.committed_tags.iter().position(|t| *t == notify.tag) {
            state.committed_tags.remove(pos);
            return;
        }
        self_emit_locked(
            shared,
            ChangeEvent {
                prefix: notify.prefix.clone(),
                paths: notify.paths.clone(),
                tag: Some(notify.tag.clone()),
            },
        );
    }

    fn watch_established(shared: &Arc<Shared>, path: &str) {
        let mut state = shared.state.lock();
        let pos = match state.pending_watches.iter().position(|w| w.path == path) {
            Some(pos) => pos,
            None => return,
        };
        let pending = state.pending_watches.remove(pos);
        Shared::refresh(shared, &mut state);
        if state.serial == pending.serial {
            return;
        }
        // Something changed while the match rule was being installed; a
        // notification may have been missed, so synthesize one.
        self_emit_locked(
            shared,
            ChangeEvent {
                prefix: pending.path,
                paths: vec![String::new()],
                tag: None,
            },
        );
    }
}

/// Emitting only pushes on unbounded channels, so holding the state lock
/// here is fine and keeps event order consistent with state order.
fn self_emit_locked(shared: &Shared, event: ChangeEvent) {
    shared.emit(event);
}

fn read_sources(sources: &[Source], key: &str, start: usize) -> Option<Value> {
    sources
        .get(start..)
        .unwrap_or(&[])
        .iter()
        .find_map(|source| source.lookup(key))
}

/// Index of the bottom-most layer holding a lock for `key`, or 0. A lock
/// in layer i hides values in layers 0..i, so reads start there.
fn lock_floor(sources: &[Source], key: &str) -> usize {
    (1..sources.len())
        .rev()
        .find(|&i| sources[i].has_lock(key))
        .unwrap_or(0)
}

fn path_writable(sources: &[Source], path: &str) -> bool {
    if sources.first().map(|s| !s.writable).unwrap_or(true) {
        return false;
    }
    let locked = if path.ends_with('/') {
        sources[1..].iter().any(|s| s.any_lock_under(path))
    } else {
        sources[1..].iter().any(|s| s.has_lock(path))
    };
    !locked
}

fn validate_writable(sources: &[Source], change: &Changeset) -> Result<()> {
    if sources.first().map(|s| !s.writable).unwrap_or(true) {
        let path = change.paths().next().unwrap_or("/");
        return Err(Error::NotWritable(path.to_owned()));
    }
    for path in change.paths() {
        if !path_writable(sources, path) {
            return Err(Error::NotWritable(path.to_owned()));
        }
    }
    Ok(())
}

fn watchable(sources: &[Source]) -> Vec<(BusKind, String)> {
    sources
        .iter()
        .filter(|s| s.writable)
        .filter_map(|s| Some((s.bus_kind?, s.object_path.clone()?)))
        .collect()
}

fn subscriber_for(subscribers: &[(BusKind, u64)], kind: BusKind) -> u64 {
    subscribers
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, id)| *id)
        .expect("subscribed at construction for every writable bus kind")
}

/// For a `path` strictly under `dir`, the name of the direct child of
/// `dir` it falls under: a plain name for a key, trailing `/` for a
/// subtree.
fn direct_child<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(dir)?;
    if rest.is_empty() {
        return None;
    }
    Some(match rest.find('/') {
        Some(pos) => &rest[..=pos],
        None => rest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_children() {
        assert_eq!(direct_child("/a/", "/a/b"), Some("b"));
        assert_eq!(direct_child("/a/", "/a/b/c"), Some("b/"));
        assert_eq!(direct_child("/a/", "/a/b/"), Some("b/"));
        assert_eq!(direct_child("/a/", "/a/"), None);
        assert_eq!(direct_child("/a/", "/x/y"), None);
    }
}
