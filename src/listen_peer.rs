//! listen_peer implements the source-address restriction and the peer
//! admission predicates checked on every accepted connection.
//!
use crate::error::*;
use crate::listen_config::sockaddr_info;
use crate::listen_opts::{self, OptSet};
use nix::sys::socket::SockaddrStorage;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A source-address restriction: only peers inside the range are admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrRange {
    ///
    V4 {
        ///
        net: Ipv4Addr,
        ///
        mask: Ipv4Addr,
    },
    ///
    V6 {
        ///
        net: Ipv6Addr,
        ///
        bits: u8,
    },
}

impl AddrRange {
    /// Parse `a.b.c.d/bits`, `a.b.c.d:m.m.m.m` or `v6addr/bits` (the v6
    /// address may be bracketed).
    pub fn parse(item: &str) -> Result<AddrRange> {
        let bad = || Error::Range {
            what: item.to_string(),
        };

        if let Some((addr, mask)) = item.split_once('/') {
            let bits: u8 = mask.parse().map_err(|_| bad())?;
            let addr = addr.trim_start_matches('[').trim_end_matches(']');
            match addr.parse::<IpAddr>().map_err(|_| bad())? {
                IpAddr::V4(net) => {
                    if bits > 32 {
                        return Err(bad());
                    }
                    let mask = if bits == 0 {
                        0
                    } else {
                        u32::MAX << (32 - bits)
                    };
                    Ok(AddrRange::V4 {
                        net,
                        mask: Ipv4Addr::from(mask),
                    })
                }
                IpAddr::V6(net) => {
                    if bits > 128 {
                        return Err(bad());
                    }
                    Ok(AddrRange::V6 { net, bits })
                }
            }
        } else if let Some((addr, mask)) = item.split_once(':') {
            let net: Ipv4Addr = addr.parse().map_err(|_| bad())?;
            let mask: Ipv4Addr = mask.parse().map_err(|_| bad())?;
            Ok(AddrRange::V4 { net, mask })
        } else {
            Err(bad())
        }
    }

    ///
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (AddrRange::V4 { net, mask }, IpAddr::V4(ip)) => {
                let net = u32::from(*net);
                let mask = u32::from(*mask);
                let ip = u32::from(*ip);
                ip & mask == net & mask
            }
            (AddrRange::V6 { net, bits }, IpAddr::V6(ip)) => {
                let net = u128::from(*net);
                let ip = u128::from(*ip);
                let mask = if *bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - *bits)
                };
                ip & mask == net & mask
            }
            _ => false,
        }
    }
}

/// Decides whether an accepted connection is serviced or shut down.
#[derive(Debug, Clone, Default)]
pub struct PeerValidator {
    ///
    pub range: Option<AddrRange>,
    /// the peer must use exactly this source port
    pub source_port: Option<u16>,
    /// the peer must use a privileged (< 1024) source port
    pub low_port: bool,
}

impl PeerValidator {
    /// Extract the validation directives from the pending set. A range
    /// that does not parse is a configuration error, not a transient one.
    pub(crate) fn from_opts(opts: &mut OptSet) -> Result<PeerValidator> {
        let range = match opts.take_string(listen_opts::OPT_RANGE) {
            Some(v) => Some(AddrRange::parse(&v)?),
            None => None,
        };
        let source_port = opts
            .take_int(listen_opts::OPT_SOURCEPORT)
            .map(|v| v as u16);
        let low_port = opts.take_bool(listen_opts::OPT_LOWPORT).unwrap_or(false);

        Ok(PeerValidator {
            range,
            source_port,
            low_port,
        })
    }

    /// ACCEPT/REJECT decision for a connection, given both endpoint
    /// addresses.
    pub fn check(&self, _local: &SockaddrStorage, peer: &SockaddrStorage) -> bool {
        let (ip, port) = if let Some(v4) = peer.as_sockaddr_in() {
            (IpAddr::V4(Ipv4Addr::from(v4.ip())), v4.port())
        } else if let Some(v6) = peer.as_sockaddr_in6() {
            (IpAddr::V6(v6.ip()), v6.port())
        } else {
            // the inet predicates do not apply to other families
            return true;
        };

        if !self.permits(&ip, port) {
            log::warn!("refusing connection from {}", sockaddr_info(peer));
            return false;
        }
        true
    }

    fn permits(&self, ip: &IpAddr, port: u16) -> bool {
        if let Some(range) = &self.range {
            if !range.contains(ip) {
                return false;
            }
        }
        if let Some(sp) = self.source_port {
            if port != sp {
                return false;
            }
        }
        if self.low_port && port >= 1024 {
            return false;
        }
        true
    }
}
