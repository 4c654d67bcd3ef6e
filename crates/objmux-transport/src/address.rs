use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::tcp::TcpTransport;
use crate::traits::IpcStream;
#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// Where an endpoint listens or connects.
///
/// Parsed from `unix:/path/to.sock`, `tcp:host:port`, or a bare path
/// (treated as a Unix socket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(String),
}

impl Address {
    /// Open a connection to this address.
    pub fn connect(&self) -> Result<IpcStream> {
        match self {
            #[cfg(unix)]
            Address::Unix(path) => UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Address::Unix(_) => Err(TransportError::Unsupported("unix")),
            Address::Tcp(host) => TcpTransport::connect(resolve(host)?),
        }
    }

    /// Bind a listener on this address.
    pub fn bind(&self) -> Result<IpcListener> {
        match self {
            #[cfg(unix)]
            Address::Unix(path) => Ok(IpcListener::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Address::Unix(_) => Err(TransportError::Unsupported("unix")),
            Address::Tcp(host) => Ok(IpcListener::Tcp(TcpTransport::bind(resolve(host)?)?)),
        }
    }
}

fn resolve(host: &str) -> Result<SocketAddr> {
    host.to_socket_addrs()
        .map_err(|_| TransportError::InvalidAddress(host.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(host.to_string()))
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidAddress(input.to_string()));
        }
        if let Some(path) = input.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidAddress(input.to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        if let Some(host) = input.strip_prefix("tcp:") {
            let valid = host
                .rsplit_once(':')
                .is_some_and(|(h, port)| !h.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(TransportError::InvalidAddress(input.to_string()));
            }
            return Ok(Address::Tcp(host.to_string()));
        }
        Ok(Address::Unix(PathBuf::from(input)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
            Address::Tcp(host) => write!(f, "tcp:{host}"),
        }
    }
}

/// A bound listener of either transport kind.
pub enum IpcListener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpTransport),
}

impl IpcListener {
    /// Accept the next connection.
    pub fn accept(&self) -> Result<IpcStream> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix(socket) => socket.accept(),
            IpcListener::Tcp(socket) => socket.accept(),
        }
    }

    /// Switch `accept` between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix(socket) => socket.set_nonblocking(nonblocking),
            IpcListener::Tcp(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    /// The address clients should connect to.
    pub fn local_address(&self) -> Address {
        match self {
            #[cfg(unix)]
            IpcListener::Unix(socket) => Address::Unix(socket.path().to_path_buf()),
            IpcListener::Tcp(socket) => Address::Tcp(socket.local_addr().to_string()),
        }
    }
}

impl fmt::Debug for IpcListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcListener")
            .field("address", &self.local_address().to_string())
            .finish()
    }
}
