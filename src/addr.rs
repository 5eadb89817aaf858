//! Address strings: the `inet:HOST:PORT`, `inet6:HOST:PORT`, `unix:/path`,
//! and `unix:@abstract` forms a [`Context`](crate::context::Context) binds,
//! listens, or connects to (spec.md §6).
//!
//! The teacher only ever dials a single hardcoded Unix socket
//! (`lib.rs::connect_to_server`), so there's no address-parsing precedent to
//! adapt there; this follows `std::net::SocketAddr`'s own `FromStr`/`Display`
//! split instead, with the abstract-namespace case grounded in `nix`'s
//! `UnixAddr::new_abstract` (`dkder3k-nix/src/sys/socket/addr.rs`).

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::Error;

/// A parsed socket address in one of the three forms this crate accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `inet:HOST:PORT` or `inet6:HOST:PORT`.
    Inet(SocketAddr),
    /// `unix:/path/to/socket`, a filesystem-pathname Unix socket.
    UnixPath(PathBuf),
    /// `unix:@name`, a Linux abstract-namespace Unix socket (the name does
    /// not include the leading NUL byte the kernel prepends).
    UnixAbstract(Vec<u8>),
}

impl Address {
    /// Parses an address string.
    ///
    /// `HOST` for `inet`/`inet6` may be a literal IP or a hostname; hostname
    /// resolution is synchronous and picks the first result, since this
    /// crate has no asynchronous DNS resolver of its own.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Some(rest) = s.strip_prefix("inet6:").or_else(|| s.strip_prefix("inet:")) {
            let want_v6 = s.starts_with("inet6:");
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidArgument(format!("address \"{s}\" is missing a port")))?;
            let port: u16 = port
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("invalid port in \"{s}\": {e}")))?;

            let host = host.trim_start_matches('[').trim_end_matches(']');
            let resolved = (host, port)
                .to_socket_addrs()
                .map_err(|e| Error::InvalidArgument(format!("could not resolve \"{host}\": {e}")))?
                .find(|a| a.is_ipv6() == want_v6)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "\"{host}\" resolved to no {} address",
                        if want_v6 { "IPv6" } else { "IPv4" }
                    ))
                })?;

            return Ok(Address::Inet(resolved));
        }

        if let Some(rest) = s.strip_prefix("unix:") {
            return Ok(if let Some(name) = rest.strip_prefix('@') {
                Address::UnixAbstract(name.as_bytes().to_vec())
            } else {
                Address::UnixPath(PathBuf::from(rest))
            });
        }

        Err(Error::InvalidArgument(format!(
            "address \"{s}\" has no recognized \"inet:\", \"inet6:\", or \"unix:\" scheme"
        )))
    }

    /// True if this address carries file-descriptor-passing capability
    /// (only Unix-domain sockets do).
    pub fn supports_fd_passing(&self) -> bool {
        !matches!(self, Address::Inet(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(SocketAddr::V4(a)) => write!(f, "inet:{}:{}", a.ip(), a.port()),
            Address::Inet(SocketAddr::V6(a)) => write!(f, "inet6:[{}]:{}", a.ip(), a.port()),
            Address::UnixPath(p) => write!(f, "unix:{}", p.display()),
            Address::UnixAbstract(name) => write!(f, "unix:@{}", String::from_utf8_lossy(name)),
        }
    }
}
