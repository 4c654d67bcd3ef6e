use std::time::{Duration, Instant};

use objmux_channel::{connect_with_config, ChannelError, Channeller, HandshakeConfig};
use objmux_remoting::EndpointConfig;
use objmux_transport::{Address, TransportError};
use serde::Serialize;

use crate::cmd::{parse_address, parse_duration, round_ms, InfoArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_json, print_rows, OutputFormat};

#[derive(Serialize)]
struct PeerCreds {
    uid: u32,
    gid: u32,
    pid: u32,
}

#[derive(Serialize)]
struct InfoOutput {
    address: String,
    transport: &'static str,
    protocol: String,
    protocol_version: String,
    handshake_ms: Option<f64>,
    peer_credentials: Option<PeerCreds>,
    connected: bool,
}

pub fn run(args: InfoArgs, format: OutputFormat, config: EndpointConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let address = parse_address(&args.address)?;
    let handshake_config = HandshakeConfig {
        timeout,
        ..config.handshake_config()
    };

    let channeller = connect_with_timeout(&address, &handshake_config, &config, timeout)?;
    let handshake = channeller.handshake();
    let out = InfoOutput {
        address: address.to_string(),
        transport: channeller.transport_name(),
        protocol: handshake
            .map(|h| h.peer.protocol.clone())
            .unwrap_or_else(|| handshake_config.protocol_name.clone()),
        protocol_version: handshake
            .map(|h| h.peer.version.clone())
            .unwrap_or_else(|| handshake_config.protocol_version.clone()),
        handshake_ms: handshake.map(|h| round_ms(h.elapsed)),
        peer_credentials: channeller
            .peer_credentials()
            .map(|(uid, gid, pid)| PeerCreds { uid, gid, pid }),
        connected: true,
    };
    channeller.dispose();

    print_info(&out, format);
    Ok(SUCCESS)
}

fn connect_with_timeout(
    address: &Address,
    handshake_config: &HandshakeConfig,
    config: &EndpointConfig,
    timeout: Duration,
) -> CliResult<Channeller> {
    let start = Instant::now();
    loop {
        match connect_with_config(address, handshake_config, config.channeller_config()) {
            Ok(channeller) => return Ok(channeller),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(channel_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect timed out after {timeout:?}"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn is_retryable_connect_error(err: &ChannelError) -> bool {
    match err {
        ChannelError::Transport(TransportError::Connect { source, .. }) => {
            source.kind() == std::io::ErrorKind::NotFound
                || source.kind() == std::io::ErrorKind::ConnectionRefused
        }
        _ => false,
    }
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Raw => println!("{} {}", out.protocol, out.protocol_version),
        OutputFormat::Table | OutputFormat::Pretty => {
            let handshake = match out.handshake_ms {
                Some(ms) => format!("{ms:.2}ms"),
                None => "unavailable".to_string(),
            };
            let creds = match &out.peer_credentials {
                Some(c) => format!("uid={} gid={} pid={}", c.uid, c.gid, c.pid),
                None => "unavailable".to_string(),
            };
            print_rows(
                "Connection Info",
                &[
                    ("address", out.address.clone()),
                    ("transport", out.transport.to_string()),
                    (
                        "protocol",
                        format!("{} {}", out.protocol, out.protocol_version),
                    ),
                    ("handshake", handshake),
                    ("peer credentials", creds),
                ],
                format,
            );
        }
    }
}
