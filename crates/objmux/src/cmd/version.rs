use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("objmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let handshake = objmux_channel::HandshakeConfig::default();
    println!("name: objmux");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol: {} {}",
        handshake.protocol_name, handshake.protocol_version
    );
    println!(
        "build_target: {}",
        option_env!("OBJMUX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "transports: unix={}, tcp=true",
        cfg!(unix)
    );

    Ok(SUCCESS)
}
