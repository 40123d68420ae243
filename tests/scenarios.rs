//! End-to-end scenarios: a client engine and the writer service wired
//! over a private bus, with database files under a scratch home.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use once_cell::sync::Lazy;
use sediment::{
    BusKind, BusMap, ChangeEvent, Changeset, Client, Error, Profile, Value,
};
use sediment_service::Router;

/// One scratch home for the whole test process; every test uses its own
/// database names. The base directories are resolved from the
/// environment on every access, so setting them once up front is enough.
static HOME: Lazy<PathBuf> = Lazy::new(|| {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_CONFIG_HOME", dir.path().join("config"));
    std::env::set_var("XDG_RUNTIME_DIR", dir.path().join("runtime"));
    fs::create_dir_all(dir.path().join("runtime")).unwrap();
    let path = dir.path().to_path_buf();
    std::mem::forget(dir);
    path
});

fn setup(profile: &str) -> (Client, BusMap, Router) {
    Lazy::force(&HOME);
    let buses = BusMap::isolated();
    let router = Router::attach(buses.get(BusKind::Session));
    let client = Client::with_buses(&Profile::parse(profile), buses.clone()).unwrap();
    (client, buses, router)
}

fn int(value: Option<Value>) -> Option<i32> {
    value.and_then(|v| v.as_i32())
}

/// Waits for the next event matching `pred`, failing after a few
/// seconds.
fn recv_event(
    events: &mut UnboundedReceiver<ChangeEvent>,
    pred: impl Fn(&ChangeEvent) -> bool,
) -> ChangeEvent {
    for _ in 0..100 {
        while let Ok(Some(event)) = events.try_next() {
            if pred(&event) {
                return event;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("no matching event arrived");
}

fn drain(events: &mut UnboundedReceiver<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = events.try_next() {
        out.push(event);
    }
    out
}

#[test]
fn round_trip_single_write() {
    let (client, buses, _router) = setup("user-db:s1");

    let mut change = Changeset::new();
    change.set("/a/b", Some(Value::Int32(7).boxed()));
    let tag = client.change_sync(change).unwrap();
    assert!(!tag.is_empty());

    assert_eq!(int(client.read("/a/b").unwrap()), Some(7));
    assert_eq!(client.list("/a/").unwrap(), ["b"]);

    // A second engine opened after the commit sees the same state.
    let second = Client::with_buses(&Profile::parse("user-db:s1"), buses).unwrap();
    assert_eq!(int(second.read("/a/b").unwrap()), Some(7));
}

#[test]
fn lock_precedence() {
    Lazy::force(&HOME);
    let site = HOME.join("site-db");
    let mut db = Changeset::new_database();
    db.set("/a/b", Some(Value::Int32(9).boxed()));
    sediment_core::Table::write_contents(&site, &db, &["/a/b".to_owned()]).unwrap();

    let profile = format!("user-db:s2\nfile-db:{}", site.display());
    let (client, _buses, _router) = setup(&profile);

    assert!(!client.is_writable("/a/b"));
    match client.write("/a/b", Value::Int32(1)) {
        Err(Error::NotWritable(key)) => assert_eq!(key, "/a/b"),
        other => panic!("write should have been refused: {:?}", other),
    }
    assert_eq!(int(client.read("/a/b").unwrap()), Some(9));

    // Unlocked keys in the user layer still work.
    client.write("/a/c", Value::Int32(2)).unwrap();
    assert_eq!(int(client.read("/a/c").unwrap()), Some(2));
}

#[test]
fn dir_reset() {
    let (client, _buses, _router) = setup("user-db:s3");

    let mut seed = Changeset::new();
    seed.set("/p/a", Some(Value::Int32(1).boxed()));
    seed.set("/p/b", Some(Value::Int32(2).boxed()));
    seed.set("/q", Some(Value::Int32(3).boxed()));
    client.change_sync(seed).unwrap();

    let mut reset = Changeset::new();
    reset.set("/p/", None);
    reset.set("/p/c", Some(Value::Int32(4).boxed()));
    client.change_sync(reset).unwrap();

    assert_eq!(int(client.read("/p/a").unwrap()), None);
    assert_eq!(int(client.read("/p/b").unwrap()), None);
    assert_eq!(int(client.read("/p/c").unwrap()), Some(4));
    assert_eq!(int(client.read("/q").unwrap()), Some(3));
    assert_eq!(client.list("/p/").unwrap(), ["c"]);
}

#[test]
fn coalescing_bounds_the_queue() {
    let (client, _buses, _router) = setup("user-db:s4");
    let mut events = client.events();

    for i in 0..100 {
        client.write_fast("/x", Value::Int32(i)).unwrap();
        assert!(client.engine().pending_writes() <= 2);
    }
    client.sync();

    assert_eq!(int(client.read("/x").unwrap()), Some(99));

    // One local echo per fast write, nothing else: no watch was
    // installed, so no remote notifications arrive.
    std::thread::sleep(Duration::from_millis(200));
    let events = drain(&mut events);
    assert_eq!(events.len(), 100);
    assert!(events.iter().all(|e| e.tag.is_none()));
    assert!(events.iter().all(|e| e.prefix == "/x"));
}

#[test]
fn invalidation_reopens_readers() {
    let (reader, buses, _router) = setup("user-db:s5");
    assert_eq!(int(reader.read("/k").unwrap()), None);
    let serial = reader.engine().state_serial();

    let writer = Client::with_buses(&Profile::parse("user-db:s5"), buses).unwrap();
    writer.write("/k", Value::Int32(5)).unwrap();

    // The reader notices on its next read: the invalidation byte went
    // 0 → 1, the file was re-opened, and the flag page is fresh again.
    assert_eq!(int(reader.read("/k").unwrap()), Some(5));
    assert!(reader.engine().state_serial() > serial);
}

#[test]
fn keyfile_merges_external_edits() {
    Lazy::force(&HOME);
    let dir = HOME.join("config").join("sediment");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("s6.txt"), "[grp]\nk={\"int32\":5}\n").unwrap();

    let (client, _buses, _router) = setup("user-db:s6");

    // Any transaction merges the externally-written content first.
    client.write("/other/x", Value::Int32(1)).unwrap();

    assert_eq!(int(client.read("/grp/k").unwrap()), Some(5));
    assert_eq!(int(client.read("/other/x").unwrap()), Some(1));

    // And the text twin was rewritten to include the client's write.
    let text = fs::read_to_string(dir.join("s6.txt")).unwrap();
    assert!(text.contains("[grp]"));
    assert!(text.contains("[other]"));
}

#[test]
fn notify_routing_and_suppression() {
    let (alice, buses, _router) = setup("user-db:s7");
    let bob = Client::with_buses(&Profile::parse("user-db:s7"), buses).unwrap();

    alice.watch("/w/").unwrap();
    // Give the match rule time to install.
    std::thread::sleep(Duration::from_millis(300));
    let mut events = alice.events();

    // A change by another client arrives as a tagged notification.
    let tag = {
        let mut change = Changeset::new();
        change.set("/w/k", Some(Value::Int32(2).boxed()));
        bob.change_sync(change).unwrap()
    };
    let event = recv_event(&mut events, |e| e.tag.is_some());
    assert_eq!(event.tag.as_deref(), Some(tag.as_str()));
    assert_eq!(event.prefix, "/w/k");

    // Alice's own fast write produces exactly one synthetic echo; the
    // writer's notification for it is suppressed by its tag.
    alice.write_fast("/w/k", Value::Int32(3)).unwrap();
    alice.sync();
    std::thread::sleep(Duration::from_millis(300));
    let remaining = drain(&mut events);
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].tag.is_none());
    assert_eq!(int(alice.read("/w/k").unwrap()), Some(3));
}

#[test]
fn failed_write_reverts_with_a_signal() {
    // No writer service is attached to these buses: every dispatch
    // fails at the transport.
    Lazy::force(&HOME);
    let buses = BusMap::isolated();
    let client = Client::with_buses(&Profile::parse("user-db:s8"), buses).unwrap();
    let mut events = client.events();

    client.write_fast("/k", Value::Int32(1)).unwrap();
    // Read-your-writes while the request is in flight.
    assert!(int(client.read("/k").unwrap()) == Some(1) || client.engine().pending_writes() == 0);

    client.sync();
    assert_eq!(int(client.read("/k").unwrap()), None);

    // The echo when the write was queued, then the synthetic revert.
    std::thread::sleep(Duration::from_millis(200));
    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.tag.is_none() && e.prefix == "/k"));

    // The synchronous path surfaces the failure directly.
    assert!(matches!(
        client.write("/k", Value::Int32(2)),
        Err(Error::Transport(_))
    ));
}
