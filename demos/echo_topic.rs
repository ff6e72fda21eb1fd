//! Echo the latest frame of a topic.
//!
//! Demonstrates:
//! - Connecting a session to a rosbridge server
//! - Listing advertised topics and looking up a topic's type
//! - Subscribing with a consumer that prints decoded frames
//! - Notifications drained from a channel sink
//!
//! Usage:
//!   cargo run --example echo_topic -- --host localhost --port 9090 --topic /chatter
//!   cargo run --example echo_topic -- --topic /camera/image --debug
//!   cargo run --example echo_topic -- --no-wait

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bridge_session::{
    BridgeSession, ChannelSink, DecodedFrame, RosbridgeFactory, SessionConfig, config,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    host: String,
    port: u16,
    topic: String,
    debug: bool,
    no_wait: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let value = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };

        Self {
            host: value("--host").unwrap_or_else(|| config::DEFAULT_HOST.to_string()),
            port: value("--port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(config::DEFAULT_PORT),
            topic: value("--topic").unwrap_or_else(|| "/chatter".to_string()),
            debug: args.iter().any(|a| a == "--debug"),
            no_wait: args.iter().any(|a| a == "--no-wait"),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== Echo Topic ===\n");

    // ========================================================================
    // Create Session
    // ========================================================================

    let config = SessionConfig::new().with_endpoint(&args.host, args.port);
    let (sink, mut notifications) = ChannelSink::new();
    let session = BridgeSession::new(
        config.clone(),
        Arc::new(RosbridgeFactory::new(&config)),
        Arc::new(sink),
    )?;

    tokio::spawn(async move {
        while let Some(note) = notifications.recv().await {
            println!("[{}] {}", note.severity, note.message);
        }
    });

    // ========================================================================
    // Connect
    // ========================================================================

    println!("[1] Connecting to {}:{}...", args.host, args.port);
    session.connect(&args.host, args.port).await?;
    println!("    ✓ Connected\n");

    let topics = session.available_topics().await?;
    println!("[2] Broker advertises {} topics", topics.len());
    for topic in topics.iter().take(10) {
        println!("    {} ({})", topic.name, topic.message_type);
    }
    println!();

    // ========================================================================
    // Subscribe
    // ========================================================================

    let message_type = session
        .topic_type(&args.topic)
        .await
        .ok_or_else(|| anyhow::anyhow!("broker does not know {}", args.topic))?;

    let registry = session.registry();
    registry.add_topic(&args.topic, &message_type)?;
    registry.set_consumer(&args.topic, |topic: &str, frame: &DecodedFrame| match frame {
        DecodedFrame::Text { text } => println!("    {topic}: {text}"),
        DecodedFrame::Image(image) => println!(
            "    {topic}: {}x{} {} ({} bytes png)",
            image.width,
            image.height,
            image.encoding,
            image.png_base64.len()
        ),
        DecodedFrame::Dump { json } => println!("    {topic}: {json}"),
        DecodedFrame::Undecodable { reason, .. } => println!("    {topic}: <undecodable: {reason}>"),
    })?;

    println!("[3] Subscribing to {} ({message_type})", args.topic);
    registry.subscribe(&args.topic).await?;

    // ========================================================================
    // Echo
    // ========================================================================

    if args.no_wait {
        tokio::time::sleep(Duration::from_secs(2)).await;
    } else {
        println!("Press Ctrl+C to exit...");
        tokio::signal::ctrl_c().await.ok();
    }

    if let Some(status) = registry.topic(&args.topic) {
        println!("\n[4] Received {} frames on {}", status.frame_count, status.name);
    }

    session.disconnect().await;
    println!("\n=== Done ===");
    Ok(())
}

// ============================================================================
// Functions
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "bridge_session=debug"
    } else {
        "bridge_session=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
