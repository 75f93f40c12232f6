//! # relaybus CLI
//!
//! Command-line utilities for poking at a relaybus broker: resolve topics,
//! listen on one, publish to one.

use std::env;

use anyhow::{Context, Result};
use bytes::Bytes;

use relaybus_client::{ClientConfig, ClientError, ClientSession};
use relaybus_proto::{AddressMode, Outbound, TopicResolver};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "resolve" => {
            if args.len() < 5 {
                eprintln!("Usage: relaybus resolve <mode> <collective> <agent> [target]");
                std::process::exit(1);
            }
            let mode = AddressMode::parse(&args[2]).context("Unknown addressing mode")?;
            let identity =
                env::var("RELAYBUS_IDENTITY").context("RELAYBUS_IDENTITY must be set")?;
            let resolver = TopicResolver::new(identity, std::process::id());
            let envelope = resolver.resolve(
                mode,
                &args[3],
                &args[4],
                args.get(5).map(String::as_str),
                None,
            )?;
            println!("topic: {}", envelope.topic);
            if let Some(reply_to) = envelope.reply_to {
                println!("reply-to: {reply_to}");
            }
        }
        "listen" => {
            if args.len() < 3 {
                eprintln!("Usage: relaybus listen <topic>");
                std::process::exit(1);
            }
            let config = ClientConfig::from_env()?;
            let session = ClientSession::from_config(config);
            session.connect().await?;
            session.subscribe(&args[2]).await?;
            eprintln!("listening on '{}'", args[2]);
            loop {
                match session.receive().await {
                    Ok(delivery) => {
                        println!(
                            "[{}] {}",
                            delivery.topic,
                            String::from_utf8_lossy(&delivery.payload)
                        );
                    }
                    Err(ClientError::MessageNotReceived { backoff }) => {
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        "publish" => {
            if args.len() < 5 {
                eprintln!("Usage: relaybus publish <collective> <agent> <payload>");
                std::process::exit(1);
            }
            let config = ClientConfig::from_env()?;
            let session = ClientSession::from_config(config);
            session.connect().await?;
            let payload = Bytes::copy_from_slice(args[4].as_bytes());
            let message = Outbound::broadcast(args[2].as_str(), args[3].as_str(), payload);
            session.publish(&message).await?;
            session.disconnect(true).await;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"relaybus CLI

USAGE:
    relaybus <COMMAND> [OPTIONS]

COMMANDS:
    resolve <mode> <collective> <agent> [target]  Print the topic a message resolves to
    listen <topic>                                Subscribe and print deliveries
    publish <collective> <agent> <payload>        Broadcast one payload
    help                                          Show this help message

ENVIRONMENT:
    RELAYBUS_IDENTITY  node identity (required)
    RELAYBUS_BROKER    broker URL, e.g. tcp://localhost:61616 (required for listen/publish)

EXAMPLES:
    relaybus resolve broadcast prod myagent
    relaybus listen "prod myagent"
    relaybus publish prod myagent ping
"#
    );
}
