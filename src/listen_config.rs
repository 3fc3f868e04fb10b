//! listen_config mod holds the listening address model and loads the conf
//! file list, converting it to the structures defined in this mod.
//!
#![allow(non_snake_case)]
use crate::error::*;
use crate::listen_opts::{self, OptDirective, OptPhase, OptSet, OptValue};
use crate::socket_util;
use confique::Config;
use nix::sys::socket::{
    AddressFamily, SockProtocol, SockType, SockaddrIn, SockaddrIn6, SockaddrLike, SockaddrStorage,
    UnixAddr,
};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::time::Duration;

/// A socket address together with the type and protocol the descriptor
/// must be created with.
pub struct SocketAddress {
    sock_addr: Box<dyn SockaddrLike>,
    sa_type: SockType,
    protocol: Option<SockProtocol>,
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAddress")
            .field("sa_type", &self.sa_type)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl SocketAddress {
    ///
    pub fn new(
        sock_addr: Box<dyn SockaddrLike>,
        sa_type: SockType,
        protocol: Option<SockProtocol>,
    ) -> SocketAddress {
        SocketAddress {
            sock_addr,
            sa_type,
            protocol,
        }
    }

    ///
    pub fn family(&self) -> AddressFamily {
        self.sock_addr.family().unwrap()
    }

    ///
    pub fn sa_type(&self) -> SockType {
        self.sa_type
    }

    ///
    pub fn protocol(&self) -> Option<SockProtocol> {
        self.protocol
    }

    ///
    pub(crate) fn sock_addr(&self) -> &dyn SockaddrLike {
        &*self.sock_addr
    }

    /// the socket file, for pathname unix sockets only
    pub fn path(&self) -> Option<PathBuf> {
        if self.sock_addr.family() != Some(AddressFamily::Unix) {
            return None;
        }

        if let Some(unix_addr) =
            unsafe { UnixAddr::from_raw(self.sock_addr.as_ptr(), Some(self.sock_addr.len())) }
        {
            return unix_addr.path().map(|p| p.to_path_buf());
        }
        None
    }

    ///
    pub fn unlink(&self) {
        if let Some(AddressFamily::Unix) = self.sock_addr.family() {
            if let Some(path) = self.path() {
                log::debug!("unlink path: {:?}", path);
                match nix::unistd::unlink(&path) {
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Unable to unlink {:?}, error: {}", path, e)
                    }
                }
            }
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.path() {
            Some(p) => write!(f, "{:?} ({:?})", p, self.sa_type),
            None => write!(
                f,
                "sock type: {:?}, sock family: {:?}",
                self.sa_type,
                self.sock_addr.family().unwrap(),
            ),
        }
    }
}

/// human-readable form of a peer or local address, for diagnostics
pub(crate) fn sockaddr_info(sa: &SockaddrStorage) -> String {
    if let Some(v4) = sa.as_sockaddr_in() {
        return format!("{}:{}", Ipv4Addr::from(v4.ip()), v4.port());
    }
    if let Some(v6) = sa.as_sockaddr_in6() {
        return format!("[{}]:{}", v6.ip(), v6.port());
    }
    if let Some(ua) = sa.as_unix_addr() {
        return match ua.path() {
            Some(p) => format!("{:?}", p),
            None => "<abstract>".to_string(),
        };
    }
    format!("family: {:?}", sa.family())
}

/// Parse a listening address. Accepted forms: a pathname unix socket
/// starting with `/`, an abstract unix socket starting with `@`, a plain
/// port number (any-address, v6 when supported), `a.b.c.d:port` and
/// `[v6addr]:port`.
pub fn parse_socket_address(item: &str, socket_type: SockType) -> Result<SocketAddress> {
    if item.starts_with('/') {
        let unix_addr = UnixAddr::new(&PathBuf::from(item)).map_err(|_| Error::Parse {
            what: item.to_string(),
        })?;
        return Ok(SocketAddress::new(Box::new(unix_addr), socket_type, None));
    }

    if let Some(name) = item.strip_prefix('@') {
        let unix_addr = UnixAddr::new_abstract(name.as_bytes()).map_err(|_| Error::Parse {
            what: item.to_string(),
        })?;
        return Ok(SocketAddress::new(Box::new(unix_addr), socket_type, None));
    }

    if let Ok(port) = item.parse::<u16>() {
        if port == 0 {
            return ParseSnafu {
                what: item.to_string(),
            }
            .fail();
        }

        if socket_util::ipv6_is_supported() {
            let sock_addr =
                SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
            return Ok(SocketAddress::new(Box::new(sock_addr), socket_type, None));
        }
        let sock_addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        return Ok(SocketAddress::new(Box::new(sock_addr), socket_type, None));
    }

    match item.parse::<SocketAddr>() {
        Ok(SocketAddr::V4(v4)) if v4.port() != 0 => Ok(SocketAddress::new(
            Box::new(SockaddrIn::from(v4)),
            socket_type,
            None,
        )),
        Ok(SocketAddr::V6(v6)) if v6.port() != 0 => Ok(SocketAddress::new(
            Box::new(SockaddrIn6::from(v6)),
            socket_type,
            None,
        )),
        _ => ParseSnafu {
            what: item.to_string(),
        }
        .fail(),
    }
}

/// Everything the lifecycle needs besides the pending directive list.
#[derive(Debug)]
pub struct ListenConfig {
    /// address to bind, with socket type and protocol
    pub sa: SocketAddress,
    /// how many times a transiently failed attempt is retried
    pub retry: u32,
    /// retry without bound, ignoring `retry`
    pub forever: bool,
    /// sleep between attempts that follow a transient failure
    pub interval: Duration,
}

impl ListenConfig {
    ///
    pub fn new(sa: SocketAddress) -> ListenConfig {
        ListenConfig {
            sa,
            retry: 0,
            forever: false,
            interval: Duration::from_secs(1),
        }
    }
}

/// File-level configuration, `[Listen]` section.
#[derive(Config, Default, Debug)]
pub struct ListenConfigData {
    ///
    #[config(nested)]
    pub Listen: SectionListen,
}

///
#[derive(Config, Default, Clone, Debug)]
pub struct SectionListen {
    ///
    pub Address: Option<String>,
    ///
    pub Backlog: Option<i64>,
    ///
    #[config(default = false)]
    pub Fork: bool,
    ///
    pub MaxChildren: Option<i64>,
    ///
    pub AcceptTimeoutSec: Option<u64>,
    ///
    pub Range: Option<String>,
    ///
    pub SourcePort: Option<u16>,
    ///
    #[config(default = false)]
    pub LowPort: bool,
    ///
    pub Retry: Option<u32>,
    ///
    #[config(default = false)]
    pub Forever: bool,
    ///
    pub RetryIntervalSec: Option<u64>,
    ///
    pub ReuseAddr: Option<bool>,
    ///
    pub KeepAlive: Option<bool>,
    ///
    pub PassCredentials: Option<bool>,
    ///
    pub ReceiveBuffer: Option<i64>,
    ///
    pub SendBuffer: Option<i64>,
    ///
    pub SocketMode: Option<u32>,
    ///
    pub Cloexec: Option<bool>,
}

impl ListenConfigData {
    /// Load the configuration file list and convert it into the listener
    /// configuration plus the pending directive set.
    pub fn load(paths: Vec<PathBuf>) -> Result<(ListenConfig, OptSet)> {
        let mut builder = ListenConfigData::builder().env();
        for v in &paths {
            builder = builder.file(v);
        }
        let data = builder.load().context(ConfigSnafu)?;

        data.Listen.parse()
    }
}

impl SectionListen {
    /// Convert the section into (config, directives).
    pub fn parse(&self) -> Result<(ListenConfig, OptSet)> {
        let addr = self.Address.as_ref().ok_or_else(|| Error::Parse {
            what: "Address not set".to_string(),
        })?;
        let sa = parse_socket_address(addr, SockType::Stream)?;

        let mut config = ListenConfig::new(sa);
        if let Some(v) = self.Retry {
            config.retry = v;
        }
        config.forever = self.Forever;
        if let Some(v) = self.RetryIntervalSec {
            config.interval = Duration::from_secs(v);
        }

        let mut opts = OptSet::new();
        if let Some(v) = self.Backlog {
            opts.push(OptDirective::new(
                listen_opts::OPT_BACKLOG,
                OptPhase::PreListen,
                OptValue::Int(v),
            ));
        }
        if self.Fork {
            opts.push(OptDirective::new(
                listen_opts::OPT_FORK,
                OptPhase::PastAccept,
                OptValue::Bool(true),
            ));
        }
        if let Some(v) = self.MaxChildren {
            opts.push(OptDirective::new(
                listen_opts::OPT_MAX_CHILDREN,
                OptPhase::PastAccept,
                OptValue::Int(v),
            ));
        }
        if let Some(v) = self.AcceptTimeoutSec {
            if v > 0 {
                opts.push(OptDirective::new(
                    listen_opts::OPT_ACCEPT_TIMEOUT,
                    OptPhase::Listen,
                    OptValue::Duration(Duration::from_secs(v)),
                ));
            }
        }
        if let Some(v) = &self.Range {
            opts.push(OptDirective::new(
                listen_opts::OPT_RANGE,
                OptPhase::PastAccept,
                OptValue::String(v.clone()),
            ));
        }
        if let Some(v) = self.SourcePort {
            opts.push(OptDirective::new(
                listen_opts::OPT_SOURCEPORT,
                OptPhase::PastAccept,
                OptValue::Int(v as i64),
            ));
        }
        if self.LowPort {
            opts.push(OptDirective::new(
                listen_opts::OPT_LOWPORT,
                OptPhase::PastAccept,
                OptValue::Bool(true),
            ));
        }
        if let Some(v) = self.ReuseAddr {
            opts.push(OptDirective::new(
                listen_opts::OPT_REUSEADDR,
                OptPhase::PreBind,
                OptValue::Bool(v),
            ));
        }
        if let Some(v) = self.KeepAlive {
            opts.push(OptDirective::new(
                listen_opts::OPT_KEEPALIVE,
                OptPhase::PastSocket,
                OptValue::Bool(v),
            ));
        }
        if let Some(v) = self.PassCredentials {
            opts.push(OptDirective::new(
                listen_opts::OPT_PASS_CRED,
                OptPhase::PastSocket,
                OptValue::Bool(v),
            ));
        }
        if let Some(v) = self.ReceiveBuffer {
            opts.push(OptDirective::new(
                listen_opts::OPT_RCVBUF,
                OptPhase::PastSocket,
                OptValue::Int(v),
            ));
        }
        if let Some(v) = self.SendBuffer {
            opts.push(OptDirective::new(
                listen_opts::OPT_SNDBUF,
                OptPhase::PastSocket,
                OptValue::Int(v),
            ));
        }
        if let Some(v) = self.SocketMode {
            opts.push(OptDirective::new(
                listen_opts::OPT_MODE,
                OptPhase::Fd,
                OptValue::Int(v as i64),
            ));
        }
        if let Some(v) = self.Cloexec {
            opts.push(OptDirective::new(
                listen_opts::OPT_CLOEXEC,
                OptPhase::Fd,
                OptValue::Bool(v),
            ));
        }

        Ok((config, opts))
    }
}
