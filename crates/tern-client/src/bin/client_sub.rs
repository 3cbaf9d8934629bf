//! client_sub - subscribe to topics and print incoming messages.
//!
//! Connects, subscribes to every filter given on the command line, and
//! prints message payloads as they arrive. Ctrl-C sends a clean DISCONNECT
//! before exiting.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tern_client::{Client, ClientConfig, ClientEvent};
use tern_core::packet::{QoS, SubackCode};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

struct Options {
    broker_host: String,
    broker_port: u16,
    client_id: String,
    topics: Vec<String>,
    qos: QoS,
    clean_session: bool,
}

fn usage() {
    println!("client_sub - subscribe to MQTT topics");
    println!();
    println!("Usage: client_sub -t <topic> [-t <topic> ...] [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -b, --broker-host <HOST>   Broker host (default: localhost)");
    println!("  -p, --broker-port <PORT>   Broker port (default: 1883)");
    println!("  -i, --client-id <ID>       Client id (default: broker assigned)");
    println!("  -t, --topic <FILTER>       Topic filter, repeatable (required)");
    println!("  -q, --qos <0|1|2>          Requested quality of service (default: 0)");
    println!("  -c, --clean-session        Do not persist the session (implied");
    println!("                             when no client id is given)");
    println!("  -h, --help                 Show this help message");
    println!();
    println!("Ctrl-C disconnects cleanly.");
}

fn parse_arguments() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        broker_host: "localhost".to_string(),
        broker_port: 1883,
        client_id: String::new(),
        topics: Vec::new(),
        qos: QoS::AtMostOnce,
        clean_session: false,
    };

    let mut i = 1;
    while i < args.len() {
        let needs_value = |i: usize| {
            if i + 1 >= args.len() {
                eprintln!("Error: {} requires a value", args[i]);
                exit(1);
            }
            args[i + 1].clone()
        };

        match args[i].as_str() {
            "-b" | "--broker-host" => {
                options.broker_host = needs_value(i);
                i += 2;
            }
            "-p" | "--broker-port" => {
                options.broker_port = match needs_value(i).parse() {
                    Ok(p) => p,
                    Err(_) => {
                        eprintln!("Error: invalid port: {}", args[i + 1]);
                        exit(1);
                    }
                };
                i += 2;
            }
            "-i" | "--client-id" => {
                options.client_id = needs_value(i);
                i += 2;
            }
            "-t" | "--topic" => {
                options.topics.push(needs_value(i));
                i += 2;
            }
            "-q" | "--qos" => {
                options.qos = match needs_value(i).as_str() {
                    "0" => QoS::AtMostOnce,
                    "1" => QoS::AtLeastOnce,
                    "2" => QoS::ExactlyOnce,
                    other => {
                        eprintln!("Error: invalid qos: {}", other);
                        exit(1);
                    }
                };
                i += 2;
            }
            "-c" | "--clean-session" => {
                options.clean_session = true;
                i += 1;
            }
            "-h" | "--help" => {
                usage();
                exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                exit(1);
            }
        }
    }

    if options.topics.is_empty() {
        eprintln!("Error: at least one topic filter is required (-t)");
        exit(1);
    }

    // An anonymous session cannot be resumed later, so a broker-assigned
    // client id only makes sense with a clean session.
    if options.client_id.is_empty() {
        options.clean_session = true;
    }

    options
}

fn main() {
    env_logger::init();
    let options = parse_arguments();

    let handler = handle_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    let mut client = match Client::new(ClientConfig {
        address: format!("{}:{}", options.broker_host, options.broker_port),
        client_id: options.client_id.clone(),
        clean_session: options.clean_session,
        ..ClientConfig::default()
    }) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("client setup failed: {}", e);
            exit(1);
        }
    };

    if let Err(e) = client.connect() {
        eprintln!("error connecting to broker: {}", e);
        exit(1);
    }

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            let _ = client.disconnect();
        }

        if let Err(e) = client.poll(Some(Duration::from_millis(200))) {
            eprintln!("{}", e);
            exit(1);
        }

        while let Some(event) = client.next_event() {
            match event {
                ClientEvent::Connected { session_present } => {
                    if session_present {
                        eprintln!("resumed existing session");
                    }
                    let filters: Vec<(&str, QoS)> = options
                        .topics
                        .iter()
                        .map(|t| (t.as_str(), options.qos))
                        .collect();
                    if let Err(e) = client.subscribe(&filters) {
                        eprintln!("subscribe failed: {}", e);
                        exit(1);
                    }
                }
                ClientEvent::SubAck { return_codes, .. } => {
                    for (filter, code) in options.topics.iter().zip(return_codes.iter()) {
                        match code {
                            SubackCode::Failure => {
                                eprintln!("subscription to {} failed", filter);
                            }
                            granted => {
                                let granted_qos = *granted as u8;
                                if granted_qos < options.qos as u8 {
                                    eprintln!(
                                        "subscription to {} downgraded to qos {}",
                                        filter, granted_qos
                                    );
                                }
                            }
                        }
                    }
                }
                ClientEvent::Message { topic, payload, .. } => {
                    println!("{}: {}", topic, String::from_utf8_lossy(&payload));
                }
                ClientEvent::Disconnected { reason } => {
                    if let Some(reason) = reason {
                        eprintln!("disconnected: {}", reason);
                        exit(1);
                    }
                    exit(0);
                }
                _ => {}
            }
        }
    }
}
