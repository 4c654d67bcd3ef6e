use std::time::Duration;

/// Errors that can occur in channel and channeller operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] objmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] objmux_frame::FrameError),

    /// Handshake failed. Never retried.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection is gone; carries the reason it was torn down.
    #[error("connection closed: {0}")]
    Disconnected(String),

    /// The channel was disposed locally.
    #[error("channel {0} disposed")]
    ChannelDisposed(i32),

    /// The peer has not associated the channel yet; nothing can be sent.
    #[error("channel {0} not associated yet")]
    NotAssociated(i32),

    /// The peer removed the channel; no more data can be written.
    #[error("channel {0} closed by peer")]
    ChannelClosed(i32),

    /// A read on the channel did not complete in time.
    #[error("channel {channel} read timed out after {timeout:?}")]
    ReadTimeout { channel: i32, timeout: Duration },

    /// The peer did not associate a newly created channel in time.
    #[error("channel {channel} not associated within {timeout:?}")]
    AssociationTimeout { channel: i32, timeout: Duration },

    /// No more channel ids are available on this connection.
    #[error("channel ids exhausted")]
    IdsExhausted,

    /// The channeller was already started.
    #[error("channeller already started")]
    AlreadyStarted,

    /// The channeller has not been started yet.
    #[error("channeller not started")]
    NotStarted,

    /// A channeller thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Handshake did not finish in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    /// Whether this error means the whole connection is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Transport(_)
                | ChannelError::Frame(_)
                | ChannelError::HandshakeFailed(_)
                | ChannelError::Disconnected(_)
                | ChannelError::IdsExhausted
                | ChannelError::Timeout(_)
        )
    }
}

impl From<ChannelError> for std::io::Error {
    fn from(err: ChannelError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            ChannelError::ReadTimeout { .. }
            | ChannelError::AssociationTimeout { .. }
            | ChannelError::Timeout(_) => ErrorKind::TimedOut,
            ChannelError::Disconnected(_) => ErrorKind::ConnectionAborted,
            ChannelError::ChannelClosed(_) => ErrorKind::BrokenPipe,
            ChannelError::ChannelDisposed(_) | ChannelError::NotAssociated(_) => {
                ErrorKind::NotConnected
            }
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
