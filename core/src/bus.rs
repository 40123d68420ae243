//! The message-bus abstraction between engines and writer services.
//!
//! The transport itself is out of scope for the store: requests, replies
//! and signals are plain Rust values and this module moves them between
//! peers inside one process. The shape is the part that matters and is
//! load-bearing for the engine's concurrency contract:
//!
//! * calls execute on a dedicated *exec* thread, one at a time, which is
//!   what serializes writer objects;
//! * completions for asynchronous calls and all signal callbacks run on a
//!   separate *delivery* thread, so they can take locks a synchronous
//!   caller is holding without deadlocking the call;
//! * replies to synchronous calls bypass the delivery queue entirely and
//!   are handed straight to the blocked caller;
//! * signals emitted while a call is being handled are queued after the
//!   call's reply, preserving the reply-then-notify order a writer
//!   produces.
//!
//! The session and system buses are process-wide and never torn down;
//! `Bus::new` makes an isolated broker for tests.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use futures::channel::{mpsc, oneshot};
use futures::executor::block_on;
use futures::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// Object path prefix every writer service exports under. Native
/// (user-database) writers live at `<prefix>/Writer/<name>`, ephemeral
/// service-database writers at `<prefix>/<name>`.
pub const OBJECT_PREFIX: &str = "/dev/sediment";

/// Which broker a peer is reachable on.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BusKind {
    Session,
    System,
}

/// A request addressed to a writer object.
#[derive(Clone, Debug)]
pub enum Request {
    /// Force-create the underlying file.
    Init,
    /// Apply a serialized change-set transactionally.
    Change(Vec<u8>),
    /// Single-key shorthand for `Change`.
    Write { key: String, value: Option<Value> },
    /// Multi-key shorthand for `Change`.
    WriteMany {
        prefix: String,
        changes: Vec<(String, Option<Value>)>,
    },
    /// Fetch the transaction log, when blame mode is enabled.
    Blame,
}

#[derive(Clone, Debug)]
pub enum Reply {
    Unit,
    Tag(String),
    Text(String),
}

/// The change notification a writer emits once per committed
/// transaction.
#[derive(Clone, Debug)]
pub struct Notify {
    pub object_path: String,
    pub prefix: String,
    pub paths: Vec<String>,
    pub tag: String,
}

/// Implemented by services exporting objects under a path prefix.
pub trait Handler: Send + Sync {
    fn call(&self, object_path: &str, request: Request) -> Result<Reply>;
}

pub type SignalCallback = Arc<dyn Fn(&Notify) + Send + Sync>;
pub type Completion = Box<dyn FnOnce(Result<Reply>) + Send>;

/// Scopes signal delivery to one object path and one subtree of keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MatchRule {
    pub object_path: String,
    pub arg0_prefix: String,
}

impl MatchRule {
    fn matches(&self, notify: &Notify) -> bool {
        self.object_path == notify.object_path
            && (notify.prefix.starts_with(&self.arg0_prefix)
                || self.arg0_prefix.starts_with(&notify.prefix))
    }
}

/// Handle for an in-flight asynchronous call. Cancellation is
/// best-effort: the request may still reach the handler, but the
/// completion is discarded.
pub struct PendingCall {
    cancelled: Arc<AtomicBool>,
}

impl PendingCall {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

enum ExecOp {
    Call {
        object_path: String,
        request: Request,
        reply_to: ReplyTo,
    },
}

enum ReplyTo {
    Sync(oneshot::Sender<Result<Reply>>),
    Async {
        completion: Completion,
        cancelled: Arc<AtomicBool>,
    },
}

enum DeliveryOp {
    Completion(Completion, Result<Reply>, Arc<AtomicBool>),
    Signal(Notify),
    AddMatch {
        subscriber: u64,
        rule: MatchRule,
        completion: Completion,
    },
    RemoveMatch {
        subscriber: u64,
        rule: MatchRule,
    },
}

struct Subscriber {
    id: u64,
    callback: SignalCallback,
    rules: Vec<MatchRule>,
}

#[derive(Default)]
struct BusState {
    handlers: Vec<(String, Arc<dyn Handler>)>,
    subscribers: Vec<Subscriber>,
}

struct BusShared {
    exec_tx: mpsc::UnboundedSender<ExecOp>,
    delivery_tx: mpsc::UnboundedSender<DeliveryOp>,
    state: Mutex<BusState>,
    next_name: AtomicU64,
    next_subscriber: AtomicU64,
}

thread_local! {
    /// Set while the exec thread runs a handler; signals emitted during
    /// the call land here and are flushed after the reply.
    static IN_CALL: RefCell<Option<Vec<Notify>>> = const { RefCell::new(None) };
}

/// A connection to one broker. Cheap to clone; all clones share the
/// broker's threads and state.
#[derive(Clone)]
pub struct Bus {
    shared: Arc<BusShared>,
}

static SESSION: Lazy<Bus> = Lazy::new(Bus::new);
static SYSTEM: Lazy<Bus> = Lazy::new(Bus::new);

impl Default for Bus {
    fn default() -> Self {
        Bus::new()
    }
}

impl Bus {
    /// Creates an isolated broker with its own worker threads.
    pub fn new() -> Bus {
        let (exec_tx, exec_rx) = mpsc::unbounded();
        let (delivery_tx, delivery_rx) = mpsc::unbounded();
        let shared = Arc::new(BusShared {
            exec_tx,
            delivery_tx,
            state: Mutex::new(BusState::default()),
            next_name: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
        });

        let exec_shared = shared.clone();
        thread::Builder::new()
            .name("sediment-bus-exec".into())
            .spawn(move || exec_loop(exec_shared, exec_rx))
            .expect("spawning bus exec thread");

        let delivery_shared = shared.clone();
        thread::Builder::new()
            .name("sediment-bus-delivery".into())
            .spawn(move || delivery_loop(delivery_shared, delivery_rx))
            .expect("spawning bus delivery thread");

        Bus { shared }
    }

    /// The process-wide session bus.
    pub fn session() -> Bus {
        SESSION.clone()
    }

    /// The process-wide system bus.
    pub fn system() -> Bus {
        SYSTEM.clone()
    }

    /// Exports `handler` for every object path under `path_prefix` and
    /// returns the connection's unique name.
    pub fn register(&self, path_prefix: &str, handler: Arc<dyn Handler>) -> String {
        let name = format!(":1.{}", self.shared.next_name.fetch_add(1, Ordering::Relaxed));
        self.shared
            .state
            .lock()
            .handlers
            .push((path_prefix.to_owned(), handler));
        name
    }

    /// Registers a signal callback. Nothing is delivered until match
    /// rules are added for the returned subscriber id.
    pub fn subscribe(&self, callback: SignalCallback) -> u64 {
        let id = self
            .shared
            .next_subscriber
            .fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().subscribers.push(Subscriber {
            id,
            callback,
            rules: Vec::new(),
        });
        id
    }

    /// Drops a subscriber and all of its match rules.
    pub fn unsubscribe(&self, subscriber: u64) {
        self.shared
            .state
            .lock()
            .subscribers
            .retain(|s| s.id != subscriber);
    }

    /// Sends an asynchronous call. The completion runs on the delivery
    /// thread, never on the caller's.
    pub fn call(&self, object_path: &str, request: Request, completion: Completion) -> PendingCall {
        let cancelled = Arc::new(AtomicBool::new(false));
        let op = ExecOp::Call {
            object_path: object_path.to_owned(),
            request,
            reply_to: ReplyTo::Async {
                completion,
                cancelled: cancelled.clone(),
            },
        };
        self.shared.exec_tx.unbounded_send(op).ok();
        PendingCall { cancelled }
    }

    /// Sends a call and blocks for the reply. Must not be invoked from a
    /// bus handler; safe from any other thread, including while holding
    /// locks that delivery callbacks also take.
    pub fn call_sync(&self, object_path: &str, request: Request) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let op = ExecOp::Call {
            object_path: object_path.to_owned(),
            request,
            reply_to: ReplyTo::Sync(tx),
        };
        self.shared
            .exec_tx
            .unbounded_send(op)
            .map_err(|_| Error::Transport("bus is shut down".into()))?;
        block_on(rx).map_err(|_| Error::Transport("call dropped without a reply".into()))?
    }

    /// Emits a signal to every subscriber with a matching rule.
    pub fn emit(&self, notify: Notify) {
        let mut notify = Some(notify);
        IN_CALL.with(|cell| {
            if let Some(buf) = cell.borrow_mut().as_mut() {
                buf.push(notify.take().unwrap());
            }
        });
        if let Some(notify) = notify {
            self.shared
                .delivery_tx
                .unbounded_send(DeliveryOp::Signal(notify))
                .ok();
        }
    }

    /// Asynchronously installs a match rule for `subscriber`. The
    /// completion runs on the delivery thread once the rule is active.
    pub fn add_match(&self, subscriber: u64, rule: MatchRule, completion: Completion) {
        self.shared
            .delivery_tx
            .unbounded_send(DeliveryOp::AddMatch {
                subscriber,
                rule,
                completion,
            })
            .ok();
    }

    /// Removes a previously installed match rule.
    pub fn remove_match(&self, subscriber: u64, rule: MatchRule) {
        self.shared
            .delivery_tx
            .unbounded_send(DeliveryOp::RemoveMatch { subscriber, rule })
            .ok();
    }
}

fn exec_loop(shared: Arc<BusShared>, mut rx: mpsc::UnboundedReceiver<ExecOp>) {
    while let Some(op) = block_on(rx.next()) {
        let ExecOp::Call {
            object_path,
            request,
            reply_to,
        } = op;

        let handler = {
            let state = shared.state.lock();
            state
                .handlers
                .iter()
                .find(|(prefix, _)| object_path.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler.clone())
        };

        IN_CALL.with(|cell| *cell.borrow_mut() = Some(Vec::new()));
        let result = match handler {
            Some(handler) => handler.call(&object_path, request),
            None => Err(Error::Transport(format!(
                "no handler for {}",
                object_path
            ))),
        };
        let signals = IN_CALL
            .with(|cell| cell.borrow_mut().take())
            .unwrap_or_default();

        match reply_to {
            ReplyTo::Sync(tx) => {
                tx.send(result).ok();
            }
            ReplyTo::Async {
                completion,
                cancelled,
            } => {
                shared
                    .delivery_tx
                    .unbounded_send(DeliveryOp::Completion(completion, result, cancelled))
                    .ok();
            }
        }
        for notify in signals {
            shared
                .delivery_tx
                .unbounded_send(DeliveryOp::Signal(notify))
                .ok();
        }
    }
}

fn delivery_loop(shared: Arc<BusShared>, mut rx: mpsc::UnboundedReceiver<DeliveryOp>) {
    while let Some(op) = block_on(rx.next()) {
        match op {
            DeliveryOp::Completion(completion, result, cancelled) => {
                if !cancelled.load(Ordering::Acquire) {
                    completion(result);
                }
            }
            DeliveryOp::Signal(notify) => {
                let callbacks: Vec<SignalCallback> = {
                    let state = shared.state.lock();
                    state
                        .subscribers
                        .iter()
                        .filter(|s| s.rules.iter().any(|r| r.matches(&notify)))
                        .map(|s| s.callback.clone())
                        .collect()
                };
                for callback in callbacks {
                    callback(&notify);
                }
            }
            DeliveryOp::AddMatch {
                subscriber,
                rule,
                completion,
            } => {
                {
                    let mut state = shared.state.lock();
                    if let Some(sub) = state.subscribers.iter_mut().find(|s| s.id == subscriber) {
                        sub.rules.push(rule);
                    }
                }
                completion(Ok(Reply::Unit));
            }
            DeliveryOp::RemoveMatch { subscriber, rule } => {
                let mut state = shared.state.lock();
                if let Some(sub) = state.subscribers.iter_mut().find(|s| s.id == subscriber) {
                    if let Some(pos) = sub.rules.iter().position(|r| *r == rule) {
                        sub.rules.remove(pos);
                    }
                }
            }
        }
    }
}

/// Resolves a bus kind to a connection. Engines carry one of these so
/// tests can substitute isolated brokers for the process globals.
#[derive(Clone)]
pub struct BusMap {
    session: Bus,
    system: Bus,
}

impl BusMap {
    /// The process-global session and system buses.
    pub fn global() -> BusMap {
        BusMap {
            session: Bus::session(),
            system: Bus::system(),
        }
    }

    /// Fresh private brokers, for tests.
    pub fn isolated() -> BusMap {
        BusMap {
            session: Bus::new(),
            system: Bus::new(),
        }
    }

    pub fn get(&self, kind: BusKind) -> &Bus {
        match kind {
            BusKind::Session => &self.session,
            BusKind::System => &self.system,
        }
    }
}
