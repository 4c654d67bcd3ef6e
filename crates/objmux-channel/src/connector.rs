use objmux_frame::{FrameConfig, FrameReader, FrameWriter};
use objmux_transport::{Address, IpcStream};

use crate::channeller::{Channeller, ChannellerConfig};
use crate::error::Result;
use crate::handshake::{handshake_client_with_config, HandshakeConfig};

/// Connect to a listening endpoint with default configuration.
///
/// The returned channeller is handshaken but not started.
pub fn connect(address: &Address) -> Result<Channeller> {
    connect_with_config(
        address,
        &HandshakeConfig::default(),
        ChannellerConfig::default(),
    )
}

/// Connect with explicit configuration.
pub fn connect_with_config(
    address: &Address,
    handshake_config: &HandshakeConfig,
    channeller_config: ChannellerConfig,
) -> Result<Channeller> {
    let stream = address.connect()?;
    tracing::debug!(%address, "connected; starting handshake");
    client_over_stream(stream, handshake_config, channeller_config)
}

/// Run the client handshake over an already connected stream.
pub fn client_over_stream(
    stream: IpcStream,
    handshake_config: &HandshakeConfig,
    channeller_config: ChannellerConfig,
) -> Result<Channeller> {
    let (mut reader, mut writer) = handshake_framing(stream, handshake_config)?;
    let handshake = handshake_client_with_config(&mut reader, &mut writer, handshake_config)?;
    writer.get_ref().set_write_timeout(None)?;
    Channeller::with_handshake(reader, writer, channeller_config, handshake)
}

/// Frame reader/writer bounded by the handshake's timeout and payload budget.
pub(crate) fn handshake_framing(
    stream: IpcStream,
    config: &HandshakeConfig,
) -> Result<(FrameReader<IpcStream>, FrameWriter<IpcStream>)> {
    let reader_stream = stream.try_clone()?;
    let frame_config = FrameConfig {
        max_payload_size: config.max_handshake_payload,
        read_timeout: Some(config.timeout),
        write_timeout: Some(config.timeout),
    };
    let reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
    let writer = FrameWriter::with_config_ipc(stream, frame_config)?;
    Ok((reader, writer))
}
