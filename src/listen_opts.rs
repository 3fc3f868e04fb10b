//! listen_opts implements the phased option directives: each directive is
//! tagged with the setup phase at which it must run, the setup pipeline
//! applies and consumes the directives of its current phase.
//!
use crate::socket_util;
use std::os::unix::prelude::{PermissionsExt, RawFd};
use std::path::Path;
use std::time::Duration;

/// directives consumed by the lifecycle itself
pub const OPT_BACKLOG: &str = "backlog";
///
pub const OPT_FORK: &str = "fork";
///
pub const OPT_MAX_CHILDREN: &str = "max-children";
///
pub const OPT_ACCEPT_TIMEOUT: &str = "accept-timeout";
///
pub const OPT_RANGE: &str = "range";
///
pub const OPT_SOURCEPORT: &str = "sourceport";
///
pub const OPT_LOWPORT: &str = "lowport";

/// directives applied to the descriptor or the socket file
pub const OPT_REUSEADDR: &str = "reuseaddr";
///
pub const OPT_KEEPALIVE: &str = "keepalive";
///
pub const OPT_PASS_CRED: &str = "pass-credentials";
///
pub const OPT_RCVBUF: &str = "rcvbuf";
///
pub const OPT_SNDBUF: &str = "sndbuf";
///
pub const OPT_CLOEXEC: &str = "cloexec";
///
pub const OPT_NONBLOCK: &str = "nonblock";
///
pub const OPT_MODE: &str = "mode";

// Keys the lifecycle extracts by hand (take_* / get_*). The phase
// application must leave them pending, it has no setter for them.
const EXTRACTED_KEYS: &[&str] = &[
    OPT_BACKLOG,
    OPT_FORK,
    OPT_MAX_CHILDREN,
    OPT_ACCEPT_TIMEOUT,
    OPT_RANGE,
    OPT_SOURCEPORT,
    OPT_LOWPORT,
    OPT_CLOEXEC,
];

fn is_extracted(key: &str) -> bool {
    EXTRACTED_KEYS.contains(&key)
}

/// The moment in the setup sequence at which a directive runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptPhase {
    ///
    Init,
    ///
    PastSocket,
    ///
    PreBind,
    ///
    Bind,
    ///
    PastBind,
    /// descriptor (or socket file, for pathname unix sockets) exists
    Fd,
    ///
    Early,
    ///
    PreOpen,
    ///
    PreListen,
    ///
    Listen,
    /// a connection has been accepted
    PastAccept,
    ///
    Connected,
    ///
    Late,
}

///
#[derive(Debug, Clone, PartialEq)]
pub enum OptValue {
    ///
    Bool(bool),
    ///
    Int(i64),
    ///
    String(String),
    ///
    Duration(Duration),
}

///
#[derive(Debug, Clone)]
pub struct OptDirective {
    key: String,
    phase: OptPhase,
    value: OptValue,
}

impl OptDirective {
    ///
    pub fn new(key: &str, phase: OptPhase, value: OptValue) -> OptDirective {
        OptDirective {
            key: key.to_string(),
            phase,
            value,
        }
    }

    ///
    pub fn key(&self) -> &str {
        &self.key
    }

    ///
    pub fn phase(&self) -> OptPhase {
        self.phase
    }
}

/// The pending directive list. Directives are consumed either by the phase
/// application or by keyed extraction; retry attempts start over from a
/// fresh copy of the original set.
#[derive(Debug, Clone, Default)]
pub struct OptSet {
    dirs: Vec<OptDirective>,
}

impl OptSet {
    ///
    pub fn new() -> OptSet {
        OptSet { dirs: Vec::new() }
    }

    ///
    pub fn push(&mut self, dir: OptDirective) {
        self.dirs.push(dir);
    }

    ///
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    ///
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Discard whatever is still pending and reinstate a fresh copy of the
    /// original declarative set.
    pub fn reset_from(&mut self, original: &OptSet) {
        self.dirs = original.dirs.clone();
    }

    /// Apply and consume every directive tagged for `phase`, in insertion
    /// order. Keys the lifecycle extracts by hand stay pending regardless
    /// of their phase. Failures of individual directives are logged and do
    /// not stop the pipeline.
    pub fn apply(&mut self, fd: RawFd, path: Option<&Path>, phase: OptPhase) {
        let mut pending = Vec::with_capacity(self.dirs.len());
        for dir in self.dirs.drain(..) {
            if dir.phase == phase && !is_extracted(&dir.key) {
                apply_one(&dir, fd, path);
            } else {
                pending.push(dir);
            }
        }
        self.dirs = pending;
    }

    /// Remove the directive with the given key and return its value.
    fn take(&mut self, key: &str) -> Option<OptValue> {
        let pos = self.dirs.iter().position(|d| d.key == key)?;
        Some(self.dirs.remove(pos).value)
    }

    ///
    pub fn take_int(&mut self, key: &str) -> Option<i64> {
        match self.take(key)? {
            OptValue::Int(v) => Some(v),
            v => {
                log::warn!("option {} has unexpected value {:?}, dropped", key, v);
                None
            }
        }
    }

    ///
    pub fn take_bool(&mut self, key: &str) -> Option<bool> {
        match self.take(key)? {
            OptValue::Bool(v) => Some(v),
            v => {
                log::warn!("option {} has unexpected value {:?}, dropped", key, v);
                None
            }
        }
    }

    ///
    pub fn take_string(&mut self, key: &str) -> Option<String> {
        match self.take(key)? {
            OptValue::String(v) => Some(v),
            v => {
                log::warn!("option {} has unexpected value {:?}, dropped", key, v);
                None
            }
        }
    }

    ///
    pub fn take_duration(&mut self, key: &str) -> Option<Duration> {
        match self.take(key)? {
            OptValue::Duration(v) => Some(v),
            v => {
                log::warn!("option {} has unexpected value {:?}, dropped", key, v);
                None
            }
        }
    }

    /// Look at an integer directive without consuming it.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.dirs.iter().find(|d| d.key == key).and_then(|d| match d.value {
            OptValue::Int(v) => Some(v),
            _ => None,
        })
    }

    /// Look at a boolean directive without consuming it. Used for flags
    /// that are mirrored onto every accepted descriptor.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.dirs.iter().find(|d| d.key == key).map(|d| match d.value {
            OptValue::Bool(v) => v,
            _ => false,
        })
    }
}

fn apply_one(dir: &OptDirective, fd: RawFd, path: Option<&Path>) {
    let ret = match (dir.key.as_str(), &dir.value) {
        (OPT_REUSEADDR, OptValue::Bool(v)) => socket_util::set_reuse_addr(fd, *v),
        (OPT_KEEPALIVE, OptValue::Bool(v)) => socket_util::set_keepalive_state(fd, *v),
        (OPT_PASS_CRED, OptValue::Bool(v)) => socket_util::set_pass_cred(fd, *v),
        (OPT_RCVBUF, OptValue::Int(v)) => socket_util::set_receive_buffer(fd, *v as usize),
        (OPT_SNDBUF, OptValue::Int(v)) => socket_util::set_send_buffer(fd, *v as usize),
        (OPT_CLOEXEC, OptValue::Bool(v)) => socket_util::fd_cloexec(fd, *v),
        (OPT_NONBLOCK, OptValue::Bool(v)) => socket_util::fd_nonblock(fd, *v),
        (OPT_MODE, OptValue::Int(v)) => {
            // pathname unix sockets only; the file exists after bind
            match path {
                Some(p) => std::fs::set_permissions(
                    p,
                    std::fs::Permissions::from_mode(*v as u32),
                )
                .map_err(|e| crate::error::Error::Nix {
                    source: nix::errno::Errno::from_i32(e.raw_os_error().unwrap_or(0)),
                }),
                None => {
                    log::debug!("option {} without a socket file, dropped", dir.key);
                    Ok(())
                }
            }
        }
        _ => {
            log::debug!("dropping unhandled option {} at {:?}", dir.key, dir.phase);
            Ok(())
        }
    };

    if let Err(e) = ret {
        log::warn!("applying option {} errno: {}", dir.key, e);
    }
}
