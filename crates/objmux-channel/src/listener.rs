use objmux_transport::{Address, IpcListener, IpcStream, TransportError};

use crate::channeller::{Channeller, ChannellerConfig};
use crate::connector::handshake_framing;
use crate::error::{ChannelError, Result};
use crate::handshake::{handshake_server_with_config, HandshakeConfig};

/// Listens for connections and performs the server side of the handshake.
pub struct ChannelListener {
    listener: IpcListener,
    handshake_config: HandshakeConfig,
    channeller_config: ChannellerConfig,
}

impl ChannelListener {
    /// Bind to an address.
    pub fn bind(address: &Address) -> Result<Self> {
        Ok(Self {
            listener: address.bind()?,
            handshake_config: HandshakeConfig::default(),
            channeller_config: ChannellerConfig::default(),
        })
    }

    /// Override handshake config.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Override the configuration of accepted channellers.
    pub fn with_channeller_config(mut self, config: ChannellerConfig) -> Self {
        self.channeller_config = config;
        self
    }

    /// Accept the next connection and handshake it. The channeller is not
    /// started.
    pub fn accept(&self) -> Result<Channeller> {
        let stream = self.listener.accept()?;
        self.handshake(stream)
    }

    /// Accept without blocking. `Ok(None)` means no connection is pending;
    /// requires [`ChannelListener::set_nonblocking`].
    pub fn try_accept(&self) -> Result<Option<Channeller>> {
        match self.try_accept_stream()? {
            Some(stream) => self.handshake(stream).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`ChannelListener::try_accept`] but leaves the handshake to the
    /// caller, so a slow peer does not hold up the accept loop. The
    /// returned stream is in blocking mode.
    pub fn try_accept_stream(&self) -> Result<Option<IpcStream>> {
        match self.listener.accept() {
            Ok(stream) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(TransportError::Accept(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run the server handshake over an accepted stream.
    pub fn handshake(&self, stream: IpcStream) -> Result<Channeller> {
        let (mut reader, mut writer) = handshake_framing(stream, &self.handshake_config)?;
        let handshake =
            handshake_server_with_config(&mut reader, &mut writer, &self.handshake_config)?;
        writer
            .get_ref()
            .set_write_timeout(None)
            .map_err(ChannelError::from)?;
        Channeller::with_handshake(reader, writer, self.channeller_config.clone(), handshake)
    }

    /// Switch `accept` between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// The address clients should connect to.
    pub fn local_address(&self) -> Address {
        self.listener.local_address()
    }
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("address", &self.local_address().to_string())
            .finish()
    }
}
