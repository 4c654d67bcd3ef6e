//! Channel multiplexing for objmux connections.
//!
//! A [`Channeller`] owns one physical connection and carries any number of
//! independent [`Channel`]s over it. Channel 0 is reserved for control
//! traffic: the identity handshake, then channel creation, association and
//! removal. Every other channel is a plain byte stream in each direction.

pub mod channel;
pub mod channeller;
pub mod connector;
pub mod control;
pub mod error;
pub mod handshake;
pub mod listener;

pub use channel::{Channel, ChannelState, DisposeReason};
pub use channeller::{Channeller, ChannellerConfig, Disposition, RemoteChannelHandler};
pub use connector::{client_over_stream, connect, connect_with_config};
pub use control::ControlMessage;
pub use error::{ChannelError, Result};
pub use handshake::{
    handshake_client, handshake_client_with_config, handshake_server, handshake_server_with_config,
    HandshakeConfig, HandshakeResult, Hello,
};
pub use listener::ChannelListener;
