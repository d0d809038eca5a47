//! Send a message through a running bridge
//!
//! ## Usage
//!
//! ```bash
//! # Publish on a hierarchical topic
//! send-mqtt --topic chat/room/42 --payload '{"text": "hello"}'
//!
//! # Retained message against a remote bridge with basic auth
//! send-mqtt --url http://arkadiko:8890 --user admin --pass secret \
//!   --topic status/service --payload '{"up": true}' --retained
//! ```

use arkadiko::client::{BridgeClient, BridgeClientConfig};
use clap::Parser;
use serde_json::Value;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "send-mqtt",
    about = "Publish a JSON payload through an arkadiko bridge"
)]
struct Args {
    /// Bridge base URL
    #[arg(long, default_value = "http://localhost:8890", env = "ARKADIKO_URL")]
    url: String,

    /// Destination topic
    #[arg(long, required = true)]
    topic: String,

    /// JSON object to publish
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Ask the broker to retain the message
    #[arg(long)]
    retained: bool,

    /// Basic auth user
    #[arg(long, default_value = "")]
    user: String,

    /// Basic auth password
    #[arg(long, default_value = "", env = "ARKADIKO_PASS")]
    pass: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let payload: Value = match serde_json::from_str(&args.payload) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("❌ Payload is not valid JSON: {e}");
            process::exit(2);
        }
    };

    let config = BridgeClientConfig::new(&args.url)
        .with_credentials(&args.user, &args.pass)
        .with_timeout(Duration::from_millis(args.timeout_ms));

    let client = match BridgeClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("❌ Failed to build client: {e}");
            process::exit(1);
        }
    };

    println!("📤 Sending to {} on topic {}", args.url, args.topic);

    match client.send_mqtt(&args.topic, &payload, args.retained).await {
        Ok(response) => {
            println!("✅ Published (retained: {})", response.retained);
            match serde_json::to_string_pretty(&response.payload) {
                Ok(echo) => println!("{echo}"),
                Err(_) => println!("{}", response.payload),
            }
        }
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}
