use std::time::Instant;

use objmux_remoting::value::parse_plain_arg;
use objmux_remoting::{EndpointConfig, RemotingClient, Value};
use serde::Serialize;

use crate::cmd::{parse_address, parse_duration, round_ms, InvokeArgs};
use crate::exit::{remoting_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, print_rows, OutputFormat};

#[derive(Serialize)]
struct InvokeOutput {
    target: String,
    result: serde_json::Value,
    result_type: &'static str,
    elapsed_ms: f64,
}

enum Target {
    Static(String),
    Method {
        type_name: String,
        ctor_args: Vec<Value>,
        method: String,
    },
}

impl Target {
    fn from_args(args: &InvokeArgs) -> CliResult<Self> {
        match (&args.static_method, &args.type_name, &args.method) {
            (Some(name), None, None) => Ok(Target::Static(name.clone())),
            (None, Some(type_name), Some(method)) => Ok(Target::Method {
                type_name: type_name.clone(),
                ctor_args: args.ctor_args.iter().map(|a| parse_plain_arg(a)).collect(),
                method: method.clone(),
            }),
            _ => Err(CliError::new(
                USAGE,
                "either --static NAME or --type TYPE --method METHOD is required",
            )),
        }
    }

    fn label(&self) -> String {
        match self {
            Target::Static(name) => name.clone(),
            Target::Method {
                type_name, method, ..
            } => format!("{type_name}.{method}"),
        }
    }
}

pub fn run(args: InvokeArgs, format: OutputFormat, mut config: EndpointConfig) -> CliResult<i32> {
    let target = Target::from_args(&args)?;
    let address = parse_address(&args.address)?;
    if let Some(timeout) = &args.timeout {
        config.call_timeout = Some(parse_duration(timeout)?);
    }
    let call_args: Vec<Value> = args.args.iter().map(|a| parse_plain_arg(a)).collect();
    let label = target.label();

    let client = RemotingClient::new(address, config.with_reconnect(false));
    client
        .start()
        .map_err(|err| remoting_error("connect failed", err))?;

    let started = Instant::now();
    let result = match target {
        Target::Static(name) => client
            .invoke_static(&name, call_args)
            .map_err(|err| remoting_error(&format!("{label} failed"), err)),
        Target::Method {
            type_name,
            ctor_args,
            method,
        } => client
            .create(&type_name, ctor_args)
            .map_err(|err| remoting_error(&format!("create {type_name} failed"), err))
            .and_then(|proxy| {
                proxy
                    .call(&method, call_args)
                    .map_err(|err| remoting_error(&format!("{label} failed"), err))
            }),
    };
    let elapsed = started.elapsed();
    client.dispose();
    let result = result?;
    tracing::debug!(call = %label, ?elapsed, "call completed");

    let out = InvokeOutput {
        target: label,
        result: result.to_json(),
        result_type: result.type_name(),
        elapsed_ms: round_ms(elapsed),
    };
    print_invoke(&out, &result, format);
    Ok(SUCCESS)
}

fn print_invoke(out: &InvokeOutput, result: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Raw => println!("{result}"),
        OutputFormat::Table | OutputFormat::Pretty => print_rows(
            "Result",
            &[
                ("target", out.target.clone()),
                ("result", result.to_string()),
                ("type", out.result_type.to_string()),
                ("elapsed", format!("{:.2}ms", out.elapsed_ms)),
            ],
            format,
        ),
    }
}
