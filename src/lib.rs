//!  solisten opens a listening socket, accepts connections on it and, on
//!  request, isolates every accepted connection into a forked child process.
//!  The whole lifecycle sits behind a retry wrapper so a transiently failing
//!  bind or accept is reattempted after a configurable interval.
//!
//! #  Example:
//! ``` toml
//!  [Listen]
//!  Address="127.0.0.1:31972"
//!  Backlog=5
//!  Fork=true
//!  MaxChildren=10
//!  AcceptTimeoutSec=30
//!  Range="10.0.0.0/8"
//!  ReuseAddr=true
//!  SocketMode="0600"
//!  Retry=3
//!  RetryIntervalSec=1
//! ```
//!  [Listen] section related configuration
//!
//!  Address
//!
//!  The listening address. Unix sockets start with /, abstract namespace
//!  sockets start with @. A bare number listens on that port over IPv6 when
//!  the host supports it, IPv4 otherwise. "a.b.c.d:x" listens on an IPv4
//!  address, "[a]:x" on an IPv6 address.
//!
//!  Backlog
//!
//!  Length of the pending connection queue passed to listen(2).
//!
//!  Fork、MaxChildren
//!
//!  With Fork enabled every accepted connection is handed to a forked child
//!  process; MaxChildren caps how many children may be alive at once and
//!  makes the parent wait before accepting more. MaxChildren is only valid
//!  together with Fork.
//!
//!  AcceptTimeoutSec
//!
//!  If no connection arrives within this many seconds the listener shuts
//!  down, waits for its remaining children and exits successfully.
//!
//!  Range、SourcePort、LowPort
//!
//!  Restrict which peers are accepted: an address range in "addr/bits" or
//!  "addr:mask" notation, an exact source port, or the privileged port
//!  range 0..=1023. Rejected peers are shut down and the loop continues.
//!
//!  ReuseAddr、KeepAlive、PassCredentials、ReceiveBuffer、SendBuffer
//!
//!  Common socket options applied while the listener is being set up.
//!  ReuseAddr defaults to on.
//!
//!  SocketMode
//!
//!  File permissions applied to a unix socket after bind.
//!
//!  Retry、Forever、RetryIntervalSec
//!
//!  How often a transiently failed attempt is repeated and how long to
//!  sleep in between. Forever retries without bound.

pub mod error;
mod io_wait;
mod listen_accept;
mod listen_child;
pub mod listen_config;
mod listen_env;
pub mod listen_opts;
pub mod listen_peer;
pub mod listen_port;
mod listen_retry;
pub mod socket_util;

pub use crate::error::{Error, Result, Retriable};
pub use crate::listen_config::{
    parse_socket_address, ListenConfig, ListenConfigData, SectionListen, SocketAddress,
};
pub use crate::listen_opts::{OptDirective, OptPhase, OptSet, OptValue};
pub use crate::listen_peer::{AddrRange, PeerValidator};
pub use crate::listen_port::{ListenFlags, ListenPort};
pub use crate::listen_retry::listen;
