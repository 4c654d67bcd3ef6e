use std::time::Duration;

use clap::{Args, Subcommand};
use objmux_remoting::EndpointConfig;
use objmux_transport::Address;

use crate::exit::{transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod invoke;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the demo Calculator type and math.square until interrupted.
    Serve(ServeArgs),
    /// Call a static method, or create an object and call one of its methods.
    Invoke(InvokeArgs),
    /// Probe an endpoint and print the negotiated handshake.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: EndpointConfig) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format, config),
        Command::Invoke(args) => invoke::run(args, format, config),
        Command::Info(args) => info::run(args, format, config),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on: a socket path, `unix:PATH` or `tcp:HOST:PORT`.
    pub address: String,
}

#[derive(Args, Debug)]
pub struct InvokeArgs {
    /// Address to connect to.
    pub address: String,
    /// Type to create before calling `--method` on it.
    #[arg(long = "type", value_name = "TYPE", requires = "method")]
    pub type_name: Option<String>,
    /// Constructor argument for `--type` (repeatable).
    #[arg(long = "ctor-arg", value_name = "ARG", requires = "type_name")]
    pub ctor_args: Vec<String>,
    /// Method to call on the created object.
    #[arg(long, value_name = "METHOD", requires = "type_name")]
    pub method: Option<String>,
    /// Static method to call instead of creating an object.
    #[arg(long = "static", value_name = "NAME", conflicts_with = "type_name")]
    pub static_method: Option<String>,
    /// Call timeout, overriding the configured one (e.g. 5s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Call arguments. Each is parsed as JSON, falling back to a string.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Address to connect to.
    pub address: String,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_address(input: &str) -> CliResult<Address> {
    input
        .parse()
        .map_err(|err| transport_error("invalid address", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn round_ms(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
