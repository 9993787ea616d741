use async_trait::async_trait;
use socketshuttle::{
    CloseEvent, ConnectionError, Error, InterfaceType, ManualReachability, Message,
    ShuttleConfig, ShuttleExt,
};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

struct Printer;

#[async_trait]
impl ShuttleExt for Printer {
    async fn on_message(&self, message: Message) -> Result<(), Error> {
        tracing::info!("received: {message:?}");
        Ok(())
    }

    async fn on_open(&self) -> Result<(), Error> {
        tracing::info!("connected, type lines to send them");
        Ok(())
    }

    async fn on_failure(&self, error: &ConnectionError) -> Result<(), Error> {
        tracing::warn!(reason = ?error.reason, "failed: {error}");
        Ok(())
    }

    async fn on_close(&self, event: &CloseEvent) -> Result<(), Error> {
        tracing::info!(code = %event.code, reason = %event.reason, "closed");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080".to_owned());

    let reachability = ManualReachability::new(InterfaceType::Wifi);
    let observer = Arc::new(Printer);
    let config = ShuttleConfig::new(url).timeout(Duration::from_secs(10));
    let (shuttle, _) = socketshuttle::tungstenite::connect(config, &reachability, &observer);

    let (lines, mut input) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines.send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = input.recv().await {
        match line.as_str() {
            "/quit" => break,
            "/disconnect" => shuttle.disconnect(),
            "/connect" => shuttle.ensure_connected(),
            "/offline" => reachability.set(InterfaceType::None),
            "/online" => reachability.set(InterfaceType::Wifi),
            "/state" => tracing::info!(state = %shuttle.state(), "current state"),
            _ => {
                if let Err(err) = shuttle.text(line.as_str()) {
                    tracing::warn!("not sent: {err}");
                }
            }
        }
    }
    shuttle.disconnect();
}
