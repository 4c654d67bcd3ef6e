use std::fmt;
use std::io;

use objmux_channel::ChannelError;
use objmux_frame::FrameError;
use objmux_remoting::{ExceptionKind, RemotingError};
use objmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidAddress(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Frame(err) => frame_error(context, err),
        ChannelError::HandshakeFailed(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        ChannelError::Timeout(_)
        | ChannelError::ReadTimeout { .. }
        | ChannelError::AssociationTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ChannelError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ChannelError::Disconnected(_)
        | ChannelError::ChannelClosed(_)
        | ChannelError::ChannelDisposed(_)
        | ChannelError::NotAssociated(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn remoting_error(context: &str, err: RemotingError) -> CliError {
    match err {
        RemotingError::Connection(err) => channel_error(context, err),
        RemotingError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RemotingError::Serialization(_) | RemotingError::Protocol(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        RemotingError::Remote(ref remote) => match remote.kind {
            ExceptionKind::InvalidArgument => {
                CliError::new(DATA_INVALID, format!("{context}: {err}"))
            }
            ExceptionKind::TypeNotRegistered
            | ExceptionKind::StaticMethodNotRegistered
            | ExceptionKind::MemberNotFound => CliError::new(USAGE, format!("{context}: {err}")),
            _ => CliError::new(FAILURE, format!("{context}: {err}")),
        },
        RemotingError::UnknownMember(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RemotingError::Spawn(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use objmux_remoting::RemoteException;

    use super::*;

    #[test]
    fn connection_errors_map_through_the_layers() {
        let refused = RemotingError::Connection(ChannelError::Transport(TransportError::Connect {
            address: "unix:/tmp/x.sock".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }));
        assert_eq!(remoting_error("connect", refused).code, PERMISSION_DENIED);

        let slow = RemotingError::Connection(ChannelError::ReadTimeout {
            channel: 3,
            timeout: Duration::from_millis(5),
        });
        assert_eq!(remoting_error("call", slow).code, TIMEOUT);

        let mismatch = ChannelError::HandshakeFailed("protocol mismatch".into());
        assert_eq!(channel_error("connect", mismatch).code, TRANSPORT_ERROR);
    }

    #[test]
    fn remote_exceptions_by_kind() {
        let missing = RemotingError::Remote(RemoteException::type_not_registered("Nope"));
        assert_eq!(remoting_error("create", missing).code, USAGE);

        let bad = RemotingError::Remote(RemoteException::invalid_argument("not an int"));
        assert_eq!(remoting_error("call", bad).code, DATA_INVALID);

        let thrown = RemotingError::Remote(RemoteException::invocation("boom"));
        let err = remoting_error("call", thrown);
        assert_eq!(err.code, FAILURE);
        assert!(err.message.starts_with("call: "));
    }
}
