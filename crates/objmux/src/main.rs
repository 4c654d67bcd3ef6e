mod cmd;
mod demo;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;
use objmux_remoting::EndpointConfig;

use crate::cmd::Command;
use crate::exit::{remoting_error, CliResult};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "objmux", version, about = "Multiplexed remoting CLI")]
struct Cli {
    /// Endpoint configuration (JSON, durations in milliseconds).
    #[arg(long, value_name = "PATH", env = "OBJMUX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&PathBuf>) -> CliResult<EndpointConfig> {
    match path {
        Some(path) => {
            EndpointConfig::from_file(path).map_err(|err| remoting_error("invalid config", err))
        }
        None => Ok(EndpointConfig::default()),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = load_config(cli.config.as_ref())
        .and_then(|config| cmd::run(cli.command, format, config));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_invoke_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "objmux",
            "invoke",
            "/tmp/calc.sock",
            "--static",
            "math.square",
            "7",
        ])
        .expect("invoke args should parse");

        let Command::Invoke(args) = cli.command else {
            panic!("expected invoke");
        };
        assert_eq!(args.static_method.as_deref(), Some("math.square"));
        assert_eq!(args.args, vec!["7".to_string()]);
    }

    #[test]
    fn rejects_static_together_with_type() {
        let err = Cli::try_parse_from([
            "objmux",
            "invoke",
            "/tmp/calc.sock",
            "--static",
            "math.square",
            "--type",
            "Calculator",
            "--method",
            "add",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn method_requires_a_type() {
        let err = Cli::try_parse_from(["objmux", "invoke", "/tmp/calc.sock", "--method", "add"])
            .expect_err("--method alone should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from([
            "objmux",
            "info",
            "/tmp/calc.sock",
            "--config",
            "/etc/objmux.json",
            "--timeout",
            "3s",
        ])
        .expect("info args should parse");
        assert!(matches!(cli.command, Command::Info(_)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/objmux.json")));
    }

    #[test]
    fn missing_config_file_is_a_usage_error() {
        let err = load_config(Some(&PathBuf::from("/nonexistent/objmux.json")))
            .expect_err("missing file");
        assert_eq!(err.code, exit::USAGE);
    }
}
