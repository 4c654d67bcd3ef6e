//! Duplex byte-stream transports.
//!
//! Provides the physical connection objmux sessions run over:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of objmux. Everything else builds on top of
//! the [`IpcStream`] type provided here.

pub mod address;
pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use address::{Address, IpcListener};
pub use error::{Result, TransportError};
pub use tcp::TcpTransport;
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
