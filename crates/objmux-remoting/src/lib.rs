//! Distributed objects over objmux channels.
//!
//! A [`RemotingServer`] and a [`RemotingClient`] share one multiplexed
//! connection per client. Either side can lend objects to the other: the
//! lender keeps them alive in a strong identity map, the borrower sees a
//! [`RemoteProxy`] held weakly in its own map. Dropped proxies are reported
//! back in batches so the lender can release its objects.
//!
//! Calls travel as [`Instruction`]s on a per-thread rpc channel and come back
//! as [`RemotingResult`]s. Objects describe their members with
//! [`InterfaceShape`]s and implement [`RemoteObject`] to serve them.
//!
//! ```no_run
//! use objmux_remoting::{EndpointConfig, RemotingClient, Value};
//!
//! let client = RemotingClient::new("/tmp/calc.sock".parse()?, EndpointConfig::default());
//! client.start()?;
//! let calc = client.create("Calculator", vec![])?;
//! let sum = calc.call("add", vec![Value::from(2), Value::from(3)])?;
//! assert_eq!(sum.as_i64(), Some(5));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod hooks;
mod identity;
mod marshal;
pub mod object;
pub mod proxy;
pub mod registry;
pub mod serializer;
mod server;
pub mod session;
pub mod shape;
pub mod user_channel;
pub mod value;
pub mod wire;

pub use client::{ClientState, Connector, RemotingClient};
pub use config::{ChannellerSettings, EndpointConfig, HandshakeSettings};
pub use error::{ExceptionKind, RemoteException, RemotingError, Result};
pub use hooks::{CallInfo, CallInterceptor, CallKind, Interception};
pub use object::{CallContext, EventHandlers, LocalDelegate, RecreateInfo, RemoteObject};
pub use proxy::{
    InvocationHandler, ReconnectOutcome, ReconnectPath, ReconnectStep, RemoteDelegate,
    RemoteProxy,
};
pub use registry::Registrar;
pub use serializer::{JsonSerializer, Serializer};
pub use server::{RemotingServer, ServerSession};
pub use session::Session;
pub use shape::{
    DelegateShape, EventShape, InterfaceShape, MemberKind, MemberRef, MethodShape, ParamMode,
    ParamShape, PropertyShape,
};
pub use user_channel::UserChannel;
pub use value::{DelegateHandle, ObjectHandle, Value};
pub use wire::{Collected, Instruction, ObjectDescriptor, RemotingResult, WireValue};
