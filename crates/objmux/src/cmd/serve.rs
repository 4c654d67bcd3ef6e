use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use objmux_remoting::{EndpointConfig, RemotingServer};
use serde::Serialize;

use crate::cmd::{parse_address, ServeArgs};
use crate::demo;
use crate::exit::{remoting_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_json, print_rows, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct ListeningOutput {
    event: &'static str,
    address: String,
    protocol: String,
    protocol_version: String,
    types: Vec<&'static str>,
    static_methods: Vec<&'static str>,
}

pub fn run(args: ServeArgs, format: OutputFormat, config: EndpointConfig) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let server =
        RemotingServer::bind(&address, config).map_err(|err| remoting_error("bind failed", err))?;
    demo::register(&server).map_err(|err| remoting_error("registration failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;
    server
        .start()
        .map_err(|err| remoting_error("start failed", err))?;

    print_listening(
        &ListeningOutput {
            event: "listening",
            address: server.local_address().to_string(),
            protocol: server.config().handshake.protocol_name.clone(),
            protocol_version: server.config().handshake.protocol_version.clone(),
            types: vec!["Calculator"],
            static_methods: vec!["math.square"],
        },
        format,
    );

    let mut sessions = 0;
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL);
        let count = server.session_count();
        if count != sessions {
            tracing::info!(sessions = count, "connected clients changed");
            sessions = count;
        }
    }

    tracing::info!("shutting down");
    server.dispose();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn print_listening(out: &ListeningOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Raw => println!("{}", out.address),
        OutputFormat::Table | OutputFormat::Pretty => print_rows(
            "Listening",
            &[
                ("address", out.address.clone()),
                (
                    "protocol",
                    format!("{} {}", out.protocol, out.protocol_version),
                ),
                ("types", out.types.join(", ")),
                ("static methods", out.static_methods.join(", ")),
            ],
            format,
        ),
    }
}
