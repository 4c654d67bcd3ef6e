use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// TCP listener producing [`IpcStream`]s.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on a TCP address. Port `0` picks an ephemeral port.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
            address: format!("{addr:?}"),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection.
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(stream.into())
    }

    /// Connect to a TCP listener (blocking).
    pub fn connect(addr: SocketAddr) -> Result<IpcStream> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            address: addr.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected over tcp");
        Ok(stream.into())
    }

    /// Switch `accept` between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// The address actually bound (resolves port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn bind_ephemeral_accept_connect() {
        let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let client = std::thread::spawn(move || {
            let mut stream = TcpTransport::connect(addr).unwrap();
            stream.write_all(b"tcp!").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"tcp!");
        assert_eq!(server.transport_name(), "tcp");
        assert!(server.peer_credentials().is_none());

        client.join().unwrap();
    }

    #[test]
    fn connect_refused_reports_address() {
        let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        drop(listener);

        let err = TcpTransport::connect(addr).unwrap_err();
        match err {
            TransportError::Connect { address, .. } => assert_eq!(address, addr.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
