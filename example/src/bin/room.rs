use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use duo_webrtc::{LocalRelay, RoomId, SessionConfig};
use std::time::Duration;

use example::*;

/// runs two participants in one process. they find each other through an
/// in-memory relay and connect with real webrtc
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// the shared room name
    #[arg(long, default_value = "demo")]
    room: String,
    /// topic prefix on the relay
    #[arg(long, default_value = "duo")]
    prefix: String,
    /// sent from each side once connected
    #[arg(long, default_value = "hello")]
    message: String,
    /// seconds to wait for the connection
    #[arg(long, default_value_t = 20)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger(log::LevelFilter::Debug);
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);

    let config = SessionConfig {
        topic_prefix: cli.prefix.clone(),
        // host candidates are enough on one machine
        ice_servers: vec![],
        ..SessionConfig::default()
    };
    let room = RoomId::new(&cli.room)?;
    let relay = LocalRelay::new();

    let mut alice = Participant::new("alice", &relay, config.clone())?;
    let mut bob = Participant::new("bob", &relay, config)?;

    alice.join(&room).await?;
    bob.join(&room).await?;

    let result = tokio::select! {
        r = exchange(&mut alice, &mut bob, &cli.message, timeout) => r,
        _ = tokio::signal::ctrl_c() => {
            println!();
            Ok(())
        }
    };

    alice.controller.leave().await;
    bob.controller.leave().await;
    result
}

async fn exchange(
    alice: &mut Participant,
    bob: &mut Participant,
    message: &str,
    timeout: Duration,
) -> Result<()> {
    alice.await_connected(timeout).await?;
    bob.await_connected(timeout).await?;
    for p in [&*alice, &*bob] {
        if let Some(snapshot) = p.controller.snapshot() {
            println!("{} is {} as {}", p.name, snapshot.local_id, snapshot.role);
        }
    }

    // the data channel may still be opening right after the transport connects
    tokio::time::sleep(Duration::from_millis(500)).await;

    let payload = Bytes::from(message.to_string());
    alice
        .controller
        .send_application_message(payload.clone())
        .await?;
    bob.controller.send_application_message(payload).await?;

    let to_bob = bob.receive(timeout).await?;
    let to_alice = alice.receive(timeout).await?;
    println!("bob received: {}", String::from_utf8_lossy(&to_bob));
    println!("alice received: {}", String::from_utf8_lossy(&to_alice));
    Ok(())
}
