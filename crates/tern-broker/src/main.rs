//! tern - a small MQTT 3.1.1 broker.

use std::sync::Arc;

use log::error;

use tern_broker::config::Config;
use tern_broker::server::Server;

struct Args {
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("broker - tern MQTT 3.1.1 broker");
                println!();
                println!("Usage: broker [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (TOML, optional)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Without a config file the broker listens on 0.0.0.0:1883.");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match args.config_path {
        Some(ref path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load configuration from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    let mut server = match Server::new(Arc::new(config)) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start broker: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("Broker error: {}", e);
        std::process::exit(1);
    }
}
