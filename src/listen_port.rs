//! listen_port implements the descriptor-owning handle and the phased
//! socket → bind → listen setup sequence.
//!
use crate::error::*;
use crate::listen_config::ListenConfig;
use crate::listen_opts::{self, OptPhase, OptSet};
use crate::socket_util;
use bitflags::bitflags;
use nix::{
    errno::Errno,
    sys::socket::{self, AddressFamily, SockFlag, SockaddrStorage},
};
use std::{cell::RefCell, fmt, os::unix::prelude::RawFd, path::PathBuf, rc::Rc};

pub(crate) const SOCKET_INVALID_FD: RawFd = -1;

/* why 5? 1 seems to cause problems under some load */
pub(crate) const DEFAULT_BACKLOG: i64 = 5;

bitflags! {
    /// caller-granted context and handle state
    pub struct ListenFlags: u8 {
        /// the caller permits per-connection child processes here
        const MAY_FORK = 0b0001;
        /// the handle has entered forking mode
        const DOES_FORK = 0b0010;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryState {
    pub retry: u32,
    pub forever: bool,
}

impl RetryState {
    pub(crate) fn enabled(&self) -> bool {
        self.forever || self.retry > 0
    }
}

/// Owns exactly one descriptor at a time: the listening socket while the
/// accept loop runs, the accepted connection afterwards (in non-forking
/// mode, and in the child after a fork).
#[derive(Debug)]
pub struct ListenPort {
    // associated objects
    config: Rc<ListenConfig>,

    // owned objects
    fd: RefCell<RawFd>,
    flags: RefCell<ListenFlags>,
    retry: RefCell<RetryState>,
    local: RefCell<Option<SockaddrStorage>>,
}

impl ListenPort {
    ///
    pub fn new(configr: &Rc<ListenConfig>, flags: ListenFlags) -> ListenPort {
        ListenPort {
            config: Rc::clone(configr),
            fd: RefCell::new(SOCKET_INVALID_FD),
            flags: RefCell::new(flags),
            retry: RefCell::new(RetryState {
                retry: configr.retry,
                forever: configr.forever,
            }),
            local: RefCell::new(None),
        }
    }

    ///
    pub fn fd(&self) -> RawFd {
        *self.fd.borrow()
    }

    pub(crate) fn set_fd(&self, fd: RawFd) {
        *self.fd.borrow_mut() = fd;
    }

    ///
    pub fn config(&self) -> &ListenConfig {
        &self.config
    }

    ///
    pub fn flags(&self) -> ListenFlags {
        *self.flags.borrow()
    }

    pub(crate) fn set_does_fork(&self) {
        self.flags.borrow_mut().insert(ListenFlags::DOES_FORK);
    }

    pub(crate) fn unix_path(&self) -> Option<PathBuf> {
        self.config.sa.path()
    }

    /// The address actually bound, re-read from the descriptor (binding
    /// port 0 fills in fields the configuration left empty).
    pub fn local(&self) -> Option<SockaddrStorage> {
        *self.local.borrow()
    }

    pub(crate) fn retry_enabled(&self) -> bool {
        self.retry.borrow().enabled()
    }

    pub(crate) fn consume_retry(&self) {
        let mut state = self.retry.borrow_mut();
        state.retry = state.retry.saturating_sub(1);
    }

    /// A child never retries; retrying is a listener-level concept.
    pub(crate) fn clear_retry(&self) {
        let mut state = self.retry.borrow_mut();
        state.retry = 0;
        state.forever = false;
    }

    /// Run the socket/bind/listen sequence, interleaved with the option
    /// phases. On success the handle holds a live listening descriptor.
    /// Transient failures are logged at `level` and classified for the
    /// retry wrapper.
    pub fn open_listen(&self, opts: &mut OptSet, level: log::Level) -> Result<()> {
        let sa = &self.config.sa;

        opts.apply(self.fd(), None, OptPhase::Init);

        let fd = match socket::socket(sa.family(), sa.sa_type(), SockFlag::empty(), sa.protocol())
        {
            Ok(fd) => fd,
            Err(e) => {
                log::log!(
                    level,
                    "socket({:?}, {:?}, {:?}): {}",
                    sa.family(),
                    sa.sa_type(),
                    sa.protocol(),
                    e
                );
                return Err(Error::Socket { source: e });
            }
        };
        self.set_fd(fd);

        opts.apply(fd, None, OptPhase::PastSocket);
        if let Some(v) = opts.get_bool(listen_opts::OPT_CLOEXEC) {
            if let Err(e) = socket_util::fd_cloexec(fd, v) {
                log::warn!("cloexec({}): {}", fd, e);
            }
        }

        // address reuse is the default for a listener; a reuseaddr
        // directive at the prebind phase may still override it
        if let Err(e) = socket_util::set_reuse_addr(fd, true) {
            log::warn!("setsockopt({}, SO_REUSEADDR): {}", fd, e);
        }
        opts.apply(fd, None, OptPhase::PreBind);

        opts.apply(fd, None, OptPhase::Bind);
        if let Err(e) = self.bind() {
            log::log!(level, "bind({}, {}): {}", fd, sa, e);
            self.close_fd();
            return Err(Error::Bind {
                fd,
                addr: sa.to_string(),
                source: e,
            });
        }

        if sa.family() == AddressFamily::Unix {
            // for pathname sockets these phases act on the socket file
            opts.apply(fd, self.unix_path().as_deref(), OptPhase::Fd);
        }

        opts.apply(fd, None, OptPhase::PastBind);

        if sa.family() == AddressFamily::Unix {
            opts.apply(fd, self.unix_path().as_deref(), OptPhase::Early);
            opts.apply(fd, self.unix_path().as_deref(), OptPhase::PreOpen);
        }

        opts.apply(fd, None, OptPhase::PreListen);
        let backlog = opts
            .take_int(listen_opts::OPT_BACKLOG)
            .unwrap_or(DEFAULT_BACKLOG);
        opts.apply(fd, None, OptPhase::Listen);
        if let Err(e) = socket::listen(fd, backlog.max(0) as usize) {
            log::error!("listen({}, {}): {}", fd, backlog, e);
            self.close_fd();
            return Err(Error::Listen {
                fd,
                backlog,
                source: e,
            });
        }

        Ok(())
    }

    fn bind(&self) -> std::result::Result<(), Errno> {
        let sa = &self.config.sa;
        let fd = self.fd();

        if let Some(path) = sa.path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|_| Errno::EINVAL)?;
            }
            // a stale socket file from a previous run is replaced
            match socket::bind(fd, sa.sock_addr()) {
                Err(Errno::EADDRINUSE) => {
                    sa.unlink();
                    socket::bind(fd, sa.sock_addr())
                }
                other => other,
            }
        } else {
            socket::bind(fd, sa.sock_addr())
        }
    }

    ///
    pub fn accept(&self) -> std::result::Result<RawFd, Errno> {
        socket::accept(self.fd())
    }

    /// refresh the recorded local address from the descriptor
    pub(crate) fn refresh_local(&self) {
        match socket::getsockname::<SockaddrStorage>(self.fd()) {
            Ok(sa) => {
                *self.local.borrow_mut() = Some(sa);
            }
            Err(e) => {
                log::warn!("getsockname({}): {}", self.fd(), e);
            }
        }
    }

    /// Close the listening descriptor and make the accepted connection the
    /// handle's descriptor; the handle represents a connection from now on.
    pub(crate) fn adopt(&self, fd: RawFd) {
        if let Err(e) = nix::unistd::close(self.fd()) {
            log::info!("close({}): {}", self.fd(), e);
        }
        self.set_fd(fd);
    }

    /// close the descriptor without touching any socket file
    pub(crate) fn close_fd(&self) {
        if self.fd() < 0 {
            return;
        }
        socket_util::close(self.fd());
        self.set_fd(SOCKET_INVALID_FD);
    }

    /// Close the descriptor and remove the socket file of a pathname unix
    /// listener.
    pub fn close(&self) {
        if self.fd() < 0 {
            return;
        }

        socket_util::close(self.fd());
        self.config.sa.unlink();
        self.set_fd(SOCKET_INVALID_FD);
    }

    /// "listening on ..." detail for log lines
    pub(crate) fn local_info(&self) -> String {
        match &*self.local.borrow() {
            Some(sa) => crate::listen_config::sockaddr_info(sa),
            None => self.config.sa.to_string(),
        }
    }
}

impl fmt::Display for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fd: {}, socket address: {}", self.fd(), self.config.sa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listen_config::{parse_socket_address, ListenConfig};
    use nix::sys::socket::SockType;
    use std::net::TcpStream;

    fn port_for(addr: &str) -> ListenPort {
        let sa = parse_socket_address(addr, SockType::Stream).unwrap();
        let config = Rc::new(ListenConfig::new(sa));
        ListenPort::new(&config, ListenFlags::empty())
    }

    #[test]
    fn test_open_listen_inet() {
        let port = port_for("127.0.0.1:31461");
        assert_eq!(port.fd(), SOCKET_INVALID_FD);

        let mut opts = OptSet::new();
        port.open_listen(&mut opts, log::Level::Error).unwrap();
        assert_ne!(port.fd(), SOCKET_INVALID_FD);

        port.refresh_local();
        assert!(port.local().is_some());
        assert_eq!(port.local_info(), "127.0.0.1:31461");

        // the queue is live
        let conn = TcpStream::connect("127.0.0.1:31461").unwrap();
        let accepted = port.accept().unwrap();
        assert!(accepted >= 0);
        socket_util::close(accepted);
        drop(conn);

        port.close();
        assert_eq!(port.fd(), SOCKET_INVALID_FD);
    }

    #[test]
    fn test_open_listen_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.socket");
        let port = port_for(path.to_str().unwrap());

        let mut opts = OptSet::new();
        port.open_listen(&mut opts, log::Level::Error).unwrap();
        assert!(path.exists());

        // a second listener replaces the stale socket file
        let stale = port_for(path.to_str().unwrap());
        port.close_fd();
        stale.open_listen(&mut OptSet::new(), log::Level::Error).unwrap();
        assert!(path.exists());

        stale.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_adopt_swaps_descriptor() {
        let port = port_for("127.0.0.1:31462");
        port.open_listen(&mut OptSet::new(), log::Level::Error)
            .unwrap();
        let listener = port.fd();

        let _conn = TcpStream::connect("127.0.0.1:31462").unwrap();
        let accepted = port.accept().unwrap();
        port.adopt(accepted);

        assert_eq!(port.fd(), accepted);
        assert_ne!(port.fd(), listener);

        port.close_fd();
    }

    #[test]
    fn test_open_listen_keeps_extracted_directives() {
        use crate::listen_opts::{OptDirective, OptValue, OPT_ACCEPT_TIMEOUT, OPT_BACKLOG};
        use std::time::Duration;

        let port = port_for("127.0.0.1:31469");
        let mut opts = OptSet::new();
        opts.push(OptDirective::new(
            OPT_BACKLOG,
            OptPhase::PreListen,
            OptValue::Int(10),
        ));
        opts.push(OptDirective::new(
            OPT_ACCEPT_TIMEOUT,
            OptPhase::Listen,
            OptValue::Duration(Duration::from_secs(2)),
        ));

        port.open_listen(&mut opts, log::Level::Error).unwrap();

        // the backlog was taken by the setup itself, not by a phase pass
        assert_eq!(opts.take_int(OPT_BACKLOG), None);
        // the accept loop still finds its timeout after the Listen phase
        assert_eq!(
            opts.take_duration(OPT_ACCEPT_TIMEOUT),
            Some(Duration::from_secs(2))
        );

        port.close();
    }

    #[test]
    fn test_retry_state() {
        let sa = parse_socket_address("127.0.0.1:31463", SockType::Stream).unwrap();
        let mut config = ListenConfig::new(sa);
        config.retry = 2;
        let port = ListenPort::new(&Rc::new(config), ListenFlags::empty());

        assert!(port.retry_enabled());
        port.consume_retry();
        port.consume_retry();
        assert!(!port.retry_enabled());

        port.clear_retry();
        assert!(!port.retry_enabled());
    }
}
