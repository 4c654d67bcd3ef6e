use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use objmux_frame::{FrameError, FrameReader, FrameWriter, CONTROL};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChannelError, Result};

const MAX_PROTOCOL_LEN: usize = 64;
const MAX_VERSION_LEN: usize = 32;

/// Identity announced by each side on CONTROL before any other traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Protocol identity string.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Identity the peer announced (equal to ours on success).
    pub peer: Hello,
    /// Time taken by the exchange.
    pub elapsed: Duration,
}

/// Configuration for the identity exchange.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for the whole exchange.
    pub timeout: Duration,
    /// Protocol identity; must match the peer's exactly.
    pub protocol_name: String,
    /// Protocol version; must match the peer's exactly.
    pub protocol_version: String,
    /// Maximum hello payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "objmux".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 4 * 1024,
        }
    }
}

impl HandshakeConfig {
    fn hello(&self) -> Hello {
        Hello {
            protocol: self.protocol_name.clone(),
            version: self.protocol_version.clone(),
        }
    }
}

/// Perform client-side handshake using default configuration.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<HandshakeResult> {
    handshake_client_with_config(reader, writer, &HandshakeConfig::default())
}

/// Client side: announce our identity, then check the server's.
pub fn handshake_client_with_config<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let started = Instant::now();
    let local = config.hello();
    validate_hello(&local)?;

    send_hello(writer, &local)?;
    let peer = recv_hello(reader, started + config.timeout, config)?;
    check_identity(&local, &peer)?;

    debug!(protocol = %peer.protocol, version = %peer.version, "client handshake complete");
    Ok(HandshakeResult {
        peer,
        elapsed: started.elapsed(),
    })
}

/// Perform server-side handshake using default configuration.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<HandshakeResult> {
    handshake_server_with_config(reader, writer, &HandshakeConfig::default())
}

/// Server side: read the client's identity, always answer with ours, then
/// check for a match. Answering first lets a mismatched client report
/// `HandshakeFailed` instead of a bare disconnect.
pub fn handshake_server_with_config<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let started = Instant::now();
    let local = config.hello();
    validate_hello(&local)?;

    let peer = recv_hello(reader, started + config.timeout, config)?;
    send_hello(writer, &local)?;
    check_identity(&local, &peer)?;

    debug!(protocol = %peer.protocol, version = %peer.version, "server handshake complete");
    Ok(HandshakeResult {
        peer,
        elapsed: started.elapsed(),
    })
}

fn send_hello<W: Write>(writer: &mut FrameWriter<W>, hello: &Hello) -> Result<()> {
    let payload = serde_json::to_vec(hello)?;
    writer.send(CONTROL, &payload)?;
    Ok(())
}

fn recv_hello<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    config: &HandshakeConfig,
) -> Result<Hello> {
    loop {
        if Instant::now() >= deadline {
            return Err(ChannelError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.channel != CONTROL {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "expected CONTROL channel {}, got {}",
                        CONTROL, frame.channel
                    )));
                }
                if frame.payload.len() > config.max_handshake_payload {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                let hello: Hello = serde_json::from_slice(&frame.payload).map_err(|err| {
                    ChannelError::HandshakeFailed(format!("malformed hello: {err}"))
                })?;
                validate_hello(&hello)?;
                return Ok(hello);
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(ChannelError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(ChannelError::Frame(err)),
        }
    }
}

fn check_identity(local: &Hello, peer: &Hello) -> Result<()> {
    if local.protocol != peer.protocol {
        return Err(ChannelError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            peer.protocol, local.protocol
        )));
    }
    if local.version != peer.version {
        return Err(ChannelError::HandshakeFailed(format!(
            "version mismatch: peer '{}', local '{}'",
            peer.version, local.version
        )));
    }
    Ok(())
}

fn validate_hello(hello: &Hello) -> Result<()> {
    if hello.protocol.is_empty() || hello.protocol.len() > MAX_PROTOCOL_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            hello.protocol.len()
        )));
    }
    if hello.version.is_empty() || hello.version.len() > MAX_VERSION_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            hello.version.len()
        )));
    }
    Ok(())
}
