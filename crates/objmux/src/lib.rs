//! Multiplexed channels and distributed objects over one duplex stream.
//!
//! objmux runs many independent conversations over a single Unix socket or
//! TCP connection and builds a remoting layer on top: objects lent across
//! the connection, proxies that track them, and clients that rebind after
//! a reconnect.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket and TCP streams behind one address type
//! - [`frame`]: length-prefixed frames tagged with a channel id
//! - [`channel`]: the channel multiplexer and the connection handshake
//! - [`remoting`]: values, proxies, sessions, clients and servers

/// Re-export transport types.
pub mod transport {
    pub use objmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use objmux_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use objmux_channel::*;
}

/// Re-export remoting types.
pub mod remoting {
    pub use objmux_remoting::*;
}
