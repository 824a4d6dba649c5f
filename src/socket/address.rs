use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// Port used when an address has none
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("failed to resolve '{name}': {source}")]
    Resolve {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' resolved to no address")]
    NoAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// A backend or listen address, resolved once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    name: String,
    addr: SocketAddr,
}

impl NetworkAddress {
    /// Resolve `host[:port]`, `[v6]:port` or a bare IPv6 literal
    pub fn resolve(name: &str) -> Result<Self, AddressError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AddressError::Empty);
        }

        let (host, port) = split_host_port(name)?;
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| AddressError::Resolve {
                name: name.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| AddressError::NoAddress(name.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            addr,
        })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            name: addr.to_string(),
            addr,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> AddressFamily {
        match self.addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn split_host_port(name: &str) -> Result<(&str, u16), AddressError> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(name.to_string()))
    };

    if let Some(rest) = name.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::InvalidPort(name.to_string()))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, parse_port(port)?)),
            None if tail.is_empty() => Ok((host, DEFAULT_MYSQL_PORT)),
            None => Err(AddressError::InvalidPort(name.to_string())),
        };
    }

    match name.matches(':').count() {
        0 => Ok((name, DEFAULT_MYSQL_PORT)),
        1 => {
            let (host, port) = name
                .split_once(':')
                .ok_or_else(|| AddressError::InvalidPort(name.to_string()))?;
            Ok((host, parse_port(port)?))
        }
        // bare IPv6 literal
        _ => Ok((name, DEFAULT_MYSQL_PORT)),
    }
}
