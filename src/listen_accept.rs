//! listen_accept implements the accept loop: wait for a connection (with an
//! optional accept-timeout that drains children and stops the listener),
//! validate the peer, and either adopt the connection directly or isolate
//! it in a forked child while the parent keeps listening.
//!
use crate::error::*;
use crate::io_wait;
use crate::listen_child;
use crate::listen_env;
use crate::listen_opts::{self, OptPhase, OptSet};
use crate::listen_peer::PeerValidator;
use crate::listen_port::{ListenFlags, ListenPort};
use crate::socket_util;
use nix::{
    errno::Errno,
    sys::socket::{self, SockaddrStorage},
    unistd::{self, ForkResult},
};
use std::time::Duration;

/// Reject inconsistent directive combinations. Runs before the first
/// socket operation; peeks only, the attempt loop still owns the set.
pub(crate) fn check_preconditions(port: &ListenPort, opts: &OptSet) -> Result<()> {
    let dofork = opts.get_bool(listen_opts::OPT_FORK).unwrap_or(false);
    if dofork && !port.flags().contains(ListenFlags::MAY_FORK) {
        log::error!("option fork not allowed here");
        return OptionsSnafu {
            what: "fork not allowed here".to_string(),
        }
        .fail();
    }
    if !dofork && opts.get_int(listen_opts::OPT_MAX_CHILDREN).unwrap_or(0) != 0 {
        log::error!("option max-children not allowed without option fork");
        return OptionsSnafu {
            what: "max-children without fork".to_string(),
        }
        .fail();
    }
    Ok(())
}

/// Accept connections on a live listening descriptor until one of them is
/// adopted by this process. Only the forking parent loops; every other
/// path leaves the loop after the first serviced connection. Returns with
/// the handle owning a connected descriptor.
pub(crate) fn accept_loop(port: &ListenPort, opts: &mut OptSet, level: log::Level) -> Result<()> {
    let dofork = opts.take_bool(listen_opts::OPT_FORK).unwrap_or(false);
    if dofork {
        if !port.flags().contains(ListenFlags::MAY_FORK) {
            log::error!("option fork not allowed here");
            port.close_fd();
            return OptionsSnafu {
                what: "fork not allowed here".to_string(),
            }
            .fail();
        }
        port.set_does_fork();
    }

    let max_children = opts.take_int(listen_opts::OPT_MAX_CHILDREN).unwrap_or(0);
    if !dofork && max_children != 0 {
        log::error!("option max-children not allowed without option fork");
        port.close_fd();
        return OptionsSnafu {
            what: "max-children without fork".to_string(),
        }
        .fail();
    }

    if dofork {
        listen_child::register_reaper()?;
    }

    // binding port 0 filled in fields we want to log and export
    port.refresh_local();

    let validator = match PeerValidator::from_opts(opts) {
        Ok(v) => v,
        Err(e) => {
            port.close_fd();
            return Err(e);
        }
    };
    let accept_timeout = opts.take_duration(listen_opts::OPT_ACCEPT_TIMEOUT);

    log::info!("starting accept loop");

    let (peer_addr, local_addr) = loop {
        log::info!("listening on {}", port.local_info());

        if let Some(tmo) = accept_timeout {
            if !wait_ready(port.fd(), tmo) {
                drain_and_exit(port);
            }
        }

        let ps = match accept_one(port, level) {
            Ok(fd) => fd,
            Err(e) => return Err(e),
        };

        if let Some(v) = opts.get_bool(listen_opts::OPT_CLOEXEC) {
            if let Err(e) = socket_util::fd_cloexec(ps, v) {
                log::warn!("cloexec({}): {}", ps, e);
            }
        }

        let peer_addr: Option<SockaddrStorage> = match socket::getpeername::<SockaddrStorage>(ps) {
            Ok(sa) => Some(sa),
            Err(e) => {
                log::info!("getpeername({}): {}", ps, e);
                None
            }
        };
        let local_addr: Option<SockaddrStorage> = match socket::getsockname::<SockaddrStorage>(ps) {
            Ok(sa) => Some(sa),
            Err(e) => {
                log::warn!("getsockname({}): {}", ps, e);
                None
            }
        };

        log::info!(
            "accepting connection from {} on {}",
            describe(&peer_addr),
            describe(&local_addr)
        );

        if let (Some(pa), Some(la)) = (&peer_addr, &local_addr) {
            if !validator.check(la, pa) {
                if let Err(e) = socket::shutdown(ps, socket::Shutdown::Both) {
                    log::info!("shutdown({}): {}", ps, e);
                }
                socket_util::close(ps);
                continue;
            }
        }

        if let Some(pa) = &peer_addr {
            log::info!("permitting connection from {}", crate::listen_config::sockaddr_info(pa));
        }

        if !dofork {
            port.adopt(ps);
            break (peer_addr, local_addr);
        }

        // a child that dies before its birth is recorded must not be
        // reaped in between
        listen_child::block_sigchld();

        match unsafe { unistd::fork() } {
            Err(e) => {
                log::warn!("fork(): {}", e);
                port.close_fd();
                listen_child::unblock_sigchld();
                return Err(Error::Fork { source: e });
            }
            Ok(ForkResult::Child) => {
                listen_child::unblock_sigchld();

                let cpid = unistd::getpid();
                log::info!("just born: child process {}", cpid);
                listen_env::export_pid(cpid);

                port.adopt(ps);
                port.clear_retry();
                break (peer_addr, local_addr);
            }
            Ok(ForkResult::Parent { child }) => {
                listen_child::note_child_born();
                log::debug!("forked off child process {}", child);

                // shutdown() would tear the socket down for the child too;
                // close() does what we want
                socket_util::close(ps);

                listen_child::unblock_sigchld();

                if max_children > 0 {
                    listen_child::wait_admission(max_children);
                }
                log::info!("still listening");
            }
        }
    };

    // the handle now holds the connection; remaining phases act on it
    opts.apply(port.fd(), None, OptPhase::Fd);
    opts.apply(port.fd(), None, OptPhase::PastSocket);
    opts.apply(port.fd(), None, OptPhase::Connected);
    open_late(port, opts);

    if let Some(la) = &local_addr {
        listen_env::export_sockaddr("SOCK", la);
    }
    if let Some(pa) = &peer_addr {
        listen_env::export_sockaddr("PEER", pa);
    }

    Ok(())
}

/// Wait for readability up to the accept-timeout. Interruptions by
/// unrelated signals restart the wait; false means the lease ran out.
fn wait_ready(fd: i32, timeout: Duration) -> bool {
    loop {
        match io_wait::wait_for_readable(fd, Some(timeout)) {
            Ok(ready) => return ready,
            Err(Error::Interrupted { .. }) => continue,
            Err(e) => {
                // let accept() report whatever is wrong with the descriptor
                log::error!("ppoll({}): {}", fd, e);
                return true;
            }
        }
    }
}

/// The deliberate "lease expired, drain and stop" path: no connection
/// arrived within the accept-timeout, so stop listening, let the live
/// children finish, and terminate successfully.
fn drain_and_exit(port: &ListenPort) -> ! {
    log::warn!("accept: {}", Errno::ETIMEDOUT);
    port.close_fd();
    log::info!("waiting for child processes to terminate");
    listen_child::reset_reaper();
    listen_child::drain_children();
    std::process::exit(0);
}

/// One accept, retrying the known-benign conditions: an interrupted call
/// is repeated silently, an aborted-before-accept connection is logged at
/// informational level and repeated. Anything else consumes the listener.
fn accept_one(port: &ListenPort, level: log::Level) -> Result<i32> {
    loop {
        match port.accept() {
            Ok(ps) => return Ok(ps),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNABORTED) => {
                log::info!("accept({}): {}", port.fd(), Errno::ECONNABORTED);
                continue;
            }
            Err(e) => {
                log::log!(level, "accept({}): {}", port.fd(), e);
                let fd = port.fd();
                port.close_fd();
                return Err(Error::Accept { fd, source: e });
            }
        }
    }
}

/// late hook on the established connection
fn open_late(port: &ListenPort, opts: &mut OptSet) {
    opts.apply(port.fd(), None, OptPhase::Late);
}

fn describe(sa: &Option<SockaddrStorage>) -> String {
    match sa {
        Some(sa) => crate::listen_config::sockaddr_info(sa),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listen_config::{parse_socket_address, ListenConfig};
    use crate::listen_opts::{OptDirective, OptValue, OPT_FORK, OPT_MAX_CHILDREN};
    use nix::sys::socket::SockType;
    use std::rc::Rc;

    fn idle_port(flags: ListenFlags) -> ListenPort {
        let sa = parse_socket_address("127.0.0.1:31464", SockType::Stream).unwrap();
        ListenPort::new(&Rc::new(ListenConfig::new(sa)), flags)
    }

    #[test]
    fn test_fork_requires_permission() {
        let port = idle_port(ListenFlags::empty());
        let mut opts = OptSet::new();
        opts.push(OptDirective::new(
            OPT_FORK,
            OptPhase::PastAccept,
            OptValue::Bool(true),
        ));

        let ret = accept_loop(&port, &mut opts, log::Level::Error);
        assert_eq!(ret.unwrap_err().retriable(), Retriable::Never);
    }

    #[test]
    fn test_max_children_requires_fork() {
        // rejected before any socket operation: the port has no descriptor
        let port = idle_port(ListenFlags::MAY_FORK);
        let mut opts = OptSet::new();
        opts.push(OptDirective::new(
            OPT_MAX_CHILDREN,
            OptPhase::PastAccept,
            OptValue::Int(4),
        ));

        let ret = accept_loop(&port, &mut opts, log::Level::Error);
        assert_eq!(ret.unwrap_err().retriable(), Retriable::Never);
        assert_eq!(port.fd(), crate::listen_port::SOCKET_INVALID_FD);
    }
}
