//! An optional in-memory log of every handled request, for chasing down
//! which client keeps hammering the writer. Enabled by the
//! `SEDIMENT_BLAME` environment variable or `sediment-blame` on the boot
//! command line, and served back through the `Blame` request.

use std::fmt::Write as _;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sediment_core::Request;

pub struct Blame {
    enabled: AtomicBool,
    log: Mutex<String>,
}

impl Blame {
    pub fn from_env() -> Blame {
        let enabled = std::env::var_os("SEDIMENT_BLAME").is_some()
            || fs::read_to_string("/proc/cmdline")
                .map(|cmdline| cmdline.split_whitespace().any(|w| w == "sediment-blame"))
                .unwrap_or(false);
        Blame {
            enabled: AtomicBool::new(enabled),
            log: Mutex::new(String::new()),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record(&self, object_path: &str, request: &Request) {
        if !self.is_enabled() {
            return;
        }
        let mut log = self.log.lock();
        if !log.is_empty() {
            log.push_str("\n====================================================================\n");
        }
        let _ = writeln!(log, "Object path: {}", object_path);
        let _ = writeln!(log, "Method: {}", method_name(request));
        match request {
            Request::Change(blob) => {
                let _ = writeln!(log, "Parameters: {} serialized bytes", blob.len());
            }
            Request::Write { key, value } => {
                let _ = writeln!(log, "Parameters: {} {:?}", key, value);
            }
            Request::WriteMany { prefix, changes } => {
                let _ = writeln!(log, "Parameters: {} ({} changes)", prefix, changes.len());
            }
            Request::Init | Request::Blame => {}
        }
    }

    pub fn text(&self) -> String {
        if !self.is_enabled() {
            return "blame mode is not enabled (set SEDIMENT_BLAME)\n".to_owned();
        }
        self.log.lock().clone()
    }
}

fn method_name(request: &Request) -> &'static str {
    match request {
        Request::Init => "Init",
        Request::Change(_) => "Change",
        Request::Write { .. } => "Write",
        Request::WriteMany { .. } => "WriteMany",
        Request::Blame => "Blame",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_when_enabled() {
        let blame = Blame {
            enabled: AtomicBool::new(false),
            log: Mutex::new(String::new()),
        };
        blame.record("/dev/sediment/Writer/db", &Request::Init);
        assert!(blame.log.lock().is_empty());

        blame.enable();
        blame.record("/dev/sediment/Writer/db", &Request::Init);
        blame.record(
            "/dev/sediment/Writer/db",
            &Request::Write {
                key: "/k".into(),
                value: None,
            },
        );
        let text = blame.text();
        assert_eq!(text.matches("Method: ").count(), 2);
        assert!(text.contains("===="));
    }
}
