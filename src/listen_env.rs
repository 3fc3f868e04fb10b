//! listen_env exports connection metadata into the process environment for
//! downstream consumers (and, after a fork, for the child's payload).
//!
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::net::Ipv4Addr;

static ENV_PREFIX: Lazy<String> = Lazy::new(|| {
    let name = std::env::args()
        .next()
        .and_then(|arg0| {
            std::path::Path::new(&arg0)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
        })
        .unwrap_or_default();
    sanitize(&name)
});

/// uppercase, everything outside [A-Z0-9] squashed to '_'
fn sanitize(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if mapped.is_empty() {
        "LISTEN".to_string()
    } else {
        mapped
    }
}

fn setenv(name: &str, value: &str) {
    std::env::set_var(format!("{}_{}", &*ENV_PREFIX, name), value);
}

/// Export one endpoint of the connection; `which` is "SOCK" for the local
/// side and "PEER" for the remote one. Unix addresses export the path (or
/// abstract name) as the ADDR value and no PORT.
pub(crate) fn export_sockaddr(which: &str, sa: &SockaddrStorage) {
    if let Some(v4) = sa.as_sockaddr_in() {
        setenv(
            &format!("{}ADDR", which),
            &Ipv4Addr::from(v4.ip()).to_string(),
        );
        setenv(&format!("{}PORT", which), &v4.port().to_string());
    } else if let Some(v6) = sa.as_sockaddr_in6() {
        setenv(&format!("{}ADDR", which), &v6.ip().to_string());
        setenv(&format!("{}PORT", which), &v6.port().to_string());
    } else if let Some(ua) = sa.as_unix_addr() {
        let value = match ua.path() {
            Some(p) => p.to_string_lossy().to_string(),
            None => "<abstract>".to_string(),
        };
        setenv(&format!("{}ADDR", which), &value);
    } else {
        log::debug!("not exporting address of family {:?}", sa.family());
    }
}

/// the child's own process id, exported before finalization
pub(crate) fn export_pid(pid: Pid) {
    setenv("PID", &pid.to_string());
}
