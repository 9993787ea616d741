#![allow(dead_code)]

use async_trait::async_trait;
use socketshuttle::config::Endpoint;
use socketshuttle::transport::{Transport, TransportEvents};
use socketshuttle::{
    CloseEvent, CloseFrame, ConnectionError, Error, ErrorReason, Message, ShuttleExt,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the session asked the transport to do.
#[derive(Debug)]
pub enum Call {
    Open { url: String, events: TransportEvents },
    Send(Message),
    Close(Option<CloseFrame>),
}

/// Transport that records calls and lets the test play the network.
pub struct MockTransport {
    calls: mpsc::UnboundedSender<Call>,
}

impl Transport for MockTransport {
    fn open(&mut self, endpoint: Endpoint, events: TransportEvents) {
        let _ = self.calls.send(Call::Open {
            url: endpoint.url(),
            events,
        });
    }

    fn send(&mut self, message: Message) {
        let _ = self.calls.send(Call::Send(message));
    }

    fn close(&mut self, frame: Option<CloseFrame>) {
        let _ = self.calls.send(Call::Close(frame));
    }
}

pub fn mock_transport() -> (MockTransport, mpsc::UnboundedReceiver<Call>) {
    let (calls, receiver) = mpsc::unbounded_channel();
    (MockTransport { calls }, receiver)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Open,
    Message(Message),
    Failure { reason: ErrorReason, detail: Option<String> },
    Close(CloseEvent),
}

/// Observer forwarding everything it sees. Fails on text messages equal to `fail_on`.
pub struct Recorder {
    notifications: mpsc::UnboundedSender<Notification>,
    fail_on: Option<String>,
}

#[async_trait]
impl ShuttleExt for Recorder {
    async fn on_message(&self, message: Message) -> Result<(), Error> {
        if let (Message::Text(text), Some(fail_on)) = (&message, &self.fail_on) {
            if text == fail_on {
                return Err(eyre::eyre!("cannot handle {text}"));
            }
        }
        let _ = self.notifications.send(Notification::Message(message));
        Ok(())
    }

    async fn on_open(&self) -> Result<(), Error> {
        let _ = self.notifications.send(Notification::Open);
        Ok(())
    }

    async fn on_failure(&self, error: &ConnectionError) -> Result<(), Error> {
        let _ = self.notifications.send(Notification::Failure {
            reason: error.reason,
            detail: error.detail.as_ref().map(ToString::to_string),
        });
        Ok(())
    }

    async fn on_close(&self, event: &CloseEvent) -> Result<(), Error> {
        let _ = self.notifications.send(Notification::Close(event.clone()));
        Ok(())
    }
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Notification>) {
    recorder_failing_on(None)
}

pub fn recorder_failing_on(
    fail_on: Option<&str>,
) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Notification>) {
    let (notifications, receiver) = mpsc::unbounded_channel();
    let recorder = Recorder {
        notifications,
        fail_on: fail_on.map(str::to_owned),
    };
    (Arc::new(recorder), receiver)
}

/// Lets the session task process everything queued so far without moving the clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn expect_open(calls: &mut mpsc::UnboundedReceiver<Call>) -> TransportEvents {
    match calls.recv().await {
        Some(Call::Open { events, .. }) => events,
        other => panic!("expected an open call, got {other:?}"),
    }
}

pub async fn expect_close(calls: &mut mpsc::UnboundedReceiver<Call>) -> Option<CloseFrame> {
    match calls.recv().await {
        Some(Call::Close(frame)) => frame,
        other => panic!("expected a close call, got {other:?}"),
    }
}

pub fn drain<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = receiver.try_recv() {
        items.push(item);
    }
    items
}
