//! client_pub - publish one message to an MQTT broker.
//!
//! Connects, publishes the message given on the command line at the
//! requested QoS, waits for the acknowledgment flow to finish, then
//! disconnects cleanly.

use std::process::exit;
use std::time::Duration;

use tern_client::{Client, ClientConfig, ClientEvent};
use tern_core::packet::QoS;

struct Options {
    broker_host: String,
    broker_port: u16,
    client_id: String,
    topic: String,
    message: String,
    qos: QoS,
    clean_session: bool,
}

fn usage() {
    println!("client_pub - publish a message over MQTT");
    println!();
    println!("Usage: client_pub -t <topic> -m <message> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -b, --broker-host <HOST>   Broker host (default: localhost)");
    println!("  -p, --broker-port <PORT>   Broker port (default: 1883)");
    println!("  -i, --client-id <ID>       Client id (default: broker assigned)");
    println!("  -t, --topic <TOPIC>        Topic to publish to (required)");
    println!("  -m, --message <TEXT>       Message payload (required)");
    println!("  -q, --qos <0|1|2>          Quality of service (default: 0)");
    println!("  -c, --clean-session        Do not persist the session (implied");
    println!("                             when no client id is given)");
    println!("  -h, --help                 Show this help message");
}

fn parse_arguments() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        broker_host: "localhost".to_string(),
        broker_port: 1883,
        client_id: String::new(),
        topic: String::new(),
        message: String::new(),
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
                options.topic = needs_value(i);
                i += 2;
            }
            "-m" | "--message" => {
                options.message = needs_value(i);
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

    if options.topic.is_empty() {
        eprintln!("Error: a topic is required (-t)");
        exit(1);
    }
    if options.message.is_empty() {
        eprintln!("Error: a message is required (-m)");
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

    // The id of the publish we sent, for matching the acknowledgments.
    let mut published_id: Option<u16> = None;

    loop {
        if let Err(e) = client.poll(Some(Duration::from_millis(100))) {
            eprintln!("{}", e);
            exit(1);
        }

        while let Some(event) = client.next_event() {
            match event {
                ClientEvent::Connected { .. } => {
                    published_id = match client.publish(
                        &options.topic,
                        options.message.as_bytes(),
                        options.qos,
                        false,
                    ) {
                        Ok(id) => id,
                        Err(e) => {
                            eprintln!("publish failed: {}", e);
                            exit(1);
                        }
                    };
                    if options.qos == QoS::AtMostOnce {
                        let _ = client.disconnect();
                    }
                }
                ClientEvent::PubAck { packet_id } => {
                    if published_id != Some(packet_id) {
                        println!(
                            "puback packet id mismatch: sent {:?} received {}",
                            published_id, packet_id
                        );
                    }
                    let _ = client.disconnect();
                }
                ClientEvent::PubRec { packet_id } => {
                    if published_id != Some(packet_id) {
                        println!(
                            "pubrec packet id mismatch: sent {:?} received {}",
                            published_id, packet_id
                        );
                    }
                    // The client library already answered with PUBREL.
                }
                ClientEvent::PubComp { packet_id } => {
                    if published_id == Some(packet_id) {
                        let _ = client.disconnect();
                    } else {
                        println!(
                            "pubcomp packet id mismatch: sent {:?} received {}",
                            published_id, packet_id
                        );
                    }
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
