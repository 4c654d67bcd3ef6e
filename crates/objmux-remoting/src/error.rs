use std::fmt;

use objmux_channel::ChannelError;
use serde::{Deserialize, Serialize};

/// Category of a failure raised while executing an instruction on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// The target member itself failed.
    Invocation,
    TypeNotRegistered,
    StaticMethodNotRegistered,
    /// The id is unknown to the lender, usually because it was collected.
    ObjectNotFound,
    MemberNotFound,
    InvalidArgument,
    /// The request could not be decoded or answered.
    Protocol,
}

impl ExceptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionKind::Invocation => "invocation",
            ExceptionKind::TypeNotRegistered => "type_not_registered",
            ExceptionKind::StaticMethodNotRegistered => "static_method_not_registered",
            ExceptionKind::ObjectNotFound => "object_not_found",
            ExceptionKind::MemberNotFound => "member_not_found",
            ExceptionKind::InvalidArgument => "invalid_argument",
            ExceptionKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that travelled back from the peer inside a result.
///
/// Remote exceptions are rethrown on the calling thread and never affect
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub kind: ExceptionKind,
    pub message: String,
    /// The object id the failure refers to, for `ObjectNotFound`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<i64>,
}

impl RemoteException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object_id: None,
        }
    }

    /// Failure raised by application code inside a member.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Invocation, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::InvalidArgument, message)
    }

    pub fn member_not_found(member: impl fmt::Display) -> Self {
        Self::new(
            ExceptionKind::MemberNotFound,
            format!("member '{member}' not found"),
        )
    }

    pub fn object_not_found(id: i64) -> Self {
        Self {
            kind: ExceptionKind::ObjectNotFound,
            message: format!("object {id} not found"),
            object_id: Some(id),
        }
    }

    pub fn type_not_registered(type_name: &str) -> Self {
        Self::new(
            ExceptionKind::TypeNotRegistered,
            format!("type '{type_name}' not registered"),
        )
    }

    pub fn static_method_not_registered(name: &str) -> Self {
        Self::new(
            ExceptionKind::StaticMethodNotRegistered,
            format!("static method '{name}' not registered"),
        )
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteException {}

/// Errors surfaced by remoting endpoints, sessions and proxies.
#[derive(Debug, thiserror::Error)]
pub enum RemotingError {
    /// Channel or connection failure.
    #[error(transparent)]
    Connection(#[from] ChannelError),

    /// A message could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer raised an exception while executing the instruction.
    #[error("remote exception: {0}")]
    Remote(RemoteException),

    /// The proxied object no longer exists on the lender.
    #[error("object {0} not found")]
    ObjectNotFound(i64),

    /// No interface of the proxy declares the member.
    #[error("unknown member '{0}'")]
    UnknownMember(String),

    /// Reconnection was attempted and failed.
    #[error("reconnection failed: {0}")]
    ReconnectionFailed(String),

    /// The proxy has neither a reconnect path nor recreate data.
    #[error("object {0} cannot be reconnected")]
    NotReconnectable(i64),

    /// Registrations are only accepted on the creating thread before start.
    #[error("registration closed: {0}")]
    RegistrationClosed(&'static str),

    #[error("endpoint not started")]
    NotStarted,

    #[error("endpoint already started")]
    AlreadyStarted,

    /// There is no live connection to carry the call.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The endpoint or session was disposed.
    #[error("disposed")]
    Disposed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A session thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl RemotingError {
    /// Whether the connection that carried the failing call is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            RemotingError::Connection(err) => err.is_connection_fatal(),
            RemotingError::NotConnected(_) => true,
            _ => false,
        }
    }

    /// The remote exception kind, when the peer raised one.
    pub fn exception_kind(&self) -> Option<ExceptionKind> {
        match self {
            RemotingError::Remote(exception) => Some(exception.kind),
            RemotingError::ObjectNotFound(_) => Some(ExceptionKind::ObjectNotFound),
            _ => None,
        }
    }
}

impl From<RemoteException> for RemotingError {
    fn from(exception: RemoteException) -> Self {
        RemotingError::Remote(exception)
    }
}

impl From<serde_json::Error> for RemotingError {
    fn from(err: serde_json::Error) -> Self {
        RemotingError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemotingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_json_shape() {
        let exception = RemoteException::object_not_found(7);
        let json = serde_json::to_value(&exception).expect("exception should serialize");
        assert_eq!(json["kind"], "object_not_found");
        assert_eq!(json["object_id"], 7);

        let plain = serde_json::to_value(RemoteException::invocation("boom"))
            .expect("exception should serialize");
        assert!(plain.get("object_id").is_none());
    }

    #[test]
    fn fatal_classification() {
        assert!(RemotingError::Connection(ChannelError::Disconnected("eof".into()))
            .is_connection_fatal());
        assert!(!RemotingError::Connection(ChannelError::ChannelDisposed(4)).is_connection_fatal());
        assert!(!RemotingError::Remote(RemoteException::invocation("x")).is_connection_fatal());
        assert!(!RemotingError::NotReconnectable(3).is_connection_fatal());
    }

    #[test]
    fn exception_kind_exposed() {
        let err = RemotingError::Remote(RemoteException::type_not_registered("Calc"));
        assert_eq!(err.exception_kind(), Some(ExceptionKind::TypeNotRegistered));
        assert_eq!(
            err.to_string(),
            "remote exception: type_not_registered: type 'Calc' not registered"
        );
        assert_eq!(
            RemotingError::ObjectNotFound(2).exception_kind(),
            Some(ExceptionKind::ObjectNotFound)
        );
    }
}
