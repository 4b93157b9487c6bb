//! JMS Relay - Entry Point
//!
//! Listens on a source destination and forwards every message to a target.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jms_relay::run().await
}
