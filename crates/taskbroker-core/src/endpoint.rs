//! Endpoint addresses for broker channels.
//!
//! Three schemes are supported:
//!
//! - `tcp://host:port` - TCP. When binding, the host is replaced by the
//!   wildcard (`tcp://*:port`, i.e. `0.0.0.0:port`); connecting uses the
//!   address as written.
//! - `ipc://path` - Unix domain socket at `path`.
//! - `inproc://name` - In-process pipe registered under `name` in an
//!   [`InprocHub`](crate::transport::InprocHub).
//!
//! Malformed addresses are rejected when the [`Endpoint`] is constructed, so a
//! held `Endpoint` is always usable.

use crate::common::error::{Error, Result};
use core::{fmt, str::FromStr};

/// Transport scheme of an [`Endpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Ipc,
    Inproc,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ipc => "ipc",
            Self::Inproc => "inproc",
        }
    }
}

/// A validated endpoint address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    /// Everything after `scheme://`.
    address: String,
}

impl Endpoint {
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The scheme-specific part: `host:port`, a socket path, or a pipe name.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The form used for binding: `tcp` hosts become `*`, other schemes are
    /// unchanged.
    pub fn binding(&self) -> String {
        match self.scheme {
            Scheme::Tcp => format!("tcp://*:{}", self.port_str()),
            _ => self.to_string(),
        }
    }

    /// Socket address to bind a TCP listener to (`0.0.0.0:port`).
    pub fn tcp_bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port_str())
    }

    fn port_str(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or("", |(_, port)| port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.address)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidEndpoint {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("address is empty"));
        }

        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| invalid("expected `scheme://address`"))?;

        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "ipc" => Scheme::Ipc,
            "inproc" => Scheme::Inproc,
            _ => return Err(invalid("scheme must be one of tcp, ipc, inproc")),
        };

        if address.is_empty() {
            return Err(invalid("address part is empty"));
        }

        if scheme == Scheme::Tcp {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| invalid("tcp address requires `host:port`"))?;
            if host.is_empty() {
                return Err(invalid("tcp host is empty"));
            }
            if port.parse::<u16>().is_err() {
                return Err(invalid("tcp port must be a number in 0..=65535"));
            }
        }

        Ok(Self {
            scheme,
            address: address.to_string(),
        })
    }
}

impl TryFrom<&str> for Endpoint {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}
