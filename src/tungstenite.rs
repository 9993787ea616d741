use crate::config::{Endpoint, HeartbeatConfig, ShuttleConfig};
use crate::reachability::ReachabilityMonitor;
use crate::transport::{FailureKind, Transport, TransportEvents};
use crate::{CloseCode, CloseFrame, Message, Shuttle, ShuttleExt};
use chrono::{TimeZone, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::frame::coding::CloseCode as TungsteniteCloseCode;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server to answer our Close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

impl<'t> From<tungstenite::protocol::CloseFrame<'t>> for CloseFrame {
    fn from(frame: tungstenite::protocol::CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.into(),
        }
    }
}

impl<'t> From<CloseFrame> for tungstenite::protocol::CloseFrame<'t> {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.into(),
        }
    }
}

impl From<CloseCode> for TungsteniteCloseCode {
    fn from(code: CloseCode) -> Self {
        Self::from(u16::from(code))
    }
}

impl From<TungsteniteCloseCode> for CloseCode {
    fn from(code: TungsteniteCloseCode) -> Self {
        Self::from(u16::from(code))
    }
}

impl From<Message> for tungstenite::Message {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Self::Text(text),
            Message::Binary(bytes) => Self::Binary(bytes),
        }
    }
}

fn classify(error: &tungstenite::Error) -> FailureKind {
    match error {
        tungstenite::Error::Http(_) => FailureKind::Refused,
        tungstenite::Error::Io(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            FailureKind::Refused
        }
        tungstenite::Error::Io(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            FailureKind::Dropped
        }
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            FailureKind::Dropped
        }
        _ => FailureKind::Other,
    }
}

#[derive(Debug)]
enum Outgoing {
    Message(Message),
    Close(Option<CloseFrame>),
}

#[derive(Debug)]
struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

/// [`Transport`] over tokio-tungstenite, with a Ping/Pong heartbeat.
#[derive(Debug)]
pub struct TungsteniteTransport {
    heartbeat: Option<HeartbeatConfig>,
    connection: Option<Connection>,
}

impl TungsteniteTransport {
    /// `None` disables the heartbeat.
    pub fn new(heartbeat: Option<HeartbeatConfig>) -> Self {
        Self {
            heartbeat,
            connection: None,
        }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(Some(HeartbeatConfig::default()))
    }
}

impl Transport for TungsteniteTransport {
    fn open(&mut self, endpoint: Endpoint, events: TransportEvents) {
        if self.connection.is_some() {
            self.close(None);
        }
        let (outgoing, mut commands) = mpsc::unbounded_channel();
        let heartbeat = self.heartbeat;
        let task = tokio::spawn(async move {
            let Some(socket) = establish(endpoint, &events, &mut commands).await else {
                return;
            };
            tracing::debug!(attempt = events.attempt(), "websocket handshake done");
            events.open();
            run_connection(socket, &mut commands, &events, heartbeat).await;
        });
        self.connection = Some(Connection { outgoing, task });
    }

    fn send(&mut self, message: Message) {
        match &self.connection {
            Some(connection) => {
                if connection.outgoing.send(Outgoing::Message(message)).is_err() {
                    tracing::warn!("dropping message, connection task has ended");
                }
            }
            None => tracing::warn!("dropping message, transport is not open"),
        }
    }

    fn close(&mut self, frame: Option<CloseFrame>) {
        if let Some(connection) = self.connection.take() {
            if connection.outgoing.send(Outgoing::Close(frame)).is_err() {
                connection.task.abort();
            }
        }
    }
}

impl Drop for TungsteniteTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }
}

fn handshake_request(endpoint: Endpoint) -> Result<crate::Request, tungstenite::Error> {
    match endpoint {
        Endpoint::Url(url) => url.as_str().into_client_request(),
        Endpoint::Request(request) => {
            let mut generated = request.uri().clone().into_client_request()?;
            let headers = generated.headers_mut();
            // caller's headers replace generated ones, repeated names keep every value
            for name in request.headers().keys() {
                headers.remove(name);
            }
            for (name, value) in request.headers() {
                headers.append(name.clone(), value.clone());
            }
            Ok(generated)
        }
    }
}

/// Runs the handshake. Gives up without reporting when the attempt is closed first.
async fn establish(
    endpoint: Endpoint,
    events: &TransportEvents,
    commands: &mut mpsc::UnboundedReceiver<Outgoing>,
) -> Option<WsStream> {
    let request = match handshake_request(endpoint) {
        Ok(request) => request,
        Err(err) => {
            events.failure(FailureKind::Other, err);
            return None;
        }
    };
    let url = request.uri().to_string();
    let connect = tokio_tungstenite::connect_async(request);
    tokio::pin!(connect);
    loop {
        tokio::select! {
            result = &mut connect => {
                return match result {
                    Ok((socket, _response)) => Some(socket),
                    Err(err) => {
                        let kind = classify(&err);
                        tracing::debug!(%url, ?kind, "websocket connect error: {err}");
                        events.failure(kind, err);
                        None
                    }
                };
            }
            command = commands.recv() => match command {
                Some(Outgoing::Message(_)) => {
                    tracing::warn!("dropping message sent before the handshake finished");
                }
                Some(Outgoing::Close(_)) | None => {
                    tracing::debug!(%url, "connect attempt abandoned");
                    return None;
                }
            }
        }
    }
}

async fn run_connection(
    socket: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &TransportEvents,
    heartbeat: Option<HeartbeatConfig>,
) {
    let (mut sink, mut stream) = socket.split();
    let period = heartbeat.map_or(Duration::from_secs(3600), |heartbeat| heartbeat.interval);
    let mut interval = tokio::time::interval(period);
    let mut last_alive = Instant::now();
    loop {
        tokio::select! {
            _tick = interval.tick(), if heartbeat.is_some() => {
                if events.is_closed() {
                    tracing::debug!("session is gone, closing connection");
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: String::from("session dropped"),
                    };
                    close_handshake(&mut sink, &mut stream, Some(frame)).await;
                    return;
                }
                let timeout = heartbeat.map_or(period, |heartbeat| heartbeat.timeout);
                if last_alive.elapsed() > timeout {
                    tracing::info!("closing connection due to timeout");
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::from("server didn't respond to Ping frame"),
                    };
                    let _ = sink.send(tungstenite::Message::Close(Some(frame.into()))).await;
                    events.failure(
                        FailureKind::Dropped,
                        eyre::eyre!("no Pong received within {timeout:?}"),
                    );
                    return;
                }
                let timestamp = Utc::now().timestamp_micros();
                let bytes = timestamp.to_be_bytes();
                if let Err(err) = sink.send(tungstenite::Message::Ping(bytes.to_vec())).await {
                    events.failure(classify(&err), err);
                    return;
                }
            }
            message = stream.next() => match message {
                Some(Ok(tungstenite::Message::Text(text))) => events.message(Message::Text(text)),
                Some(Ok(tungstenite::Message::Binary(bytes))) => {
                    events.message(Message::Binary(bytes))
                }
                Some(Ok(tungstenite::Message::Pong(pong))) => {
                    if let Ok(bytes) = <[u8; 8]>::try_from(pong.as_slice()) {
                        let timestamp = i64::from_be_bytes(bytes);
                        if let Some(sent) = Utc.timestamp_micros(timestamp).single() {
                            let latency = (Utc::now() - sent).num_milliseconds();
                            tracing::trace!("latency: {}ms", latency);
                        }
                    }
                    last_alive = Instant::now();
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    // flushes the close reply tungstenite queued
                    let _ = sink.close().await;
                    report_close(events, frame.map(CloseFrame::from), true);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    events.failure(classify(&err), err);
                    return;
                }
                None => {
                    events.failure(
                        FailureKind::Dropped,
                        eyre::eyre!("connection ended without a closing handshake"),
                    );
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Outgoing::Message(message)) => {
                    tracing::trace!(len = message.len(), "sending message");
                    if let Err(err) = sink.send(message.into()).await {
                        events.failure(classify(&err), err);
                        return;
                    }
                }
                Some(Outgoing::Close(frame)) => {
                    let clean = close_handshake(&mut sink, &mut stream, frame.clone()).await;
                    report_close(events, frame, clean);
                    return;
                }
                None => {
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: String::from("transport dropped"),
                    };
                    close_handshake(&mut sink, &mut stream, Some(frame)).await;
                    return;
                }
            }
        }
    }
}

/// Sends our Close frame and waits for the server's. Returns whether the handshake completed.
async fn close_handshake(
    sink: &mut SplitSink<WsStream, tungstenite::Message>,
    stream: &mut SplitStream<WsStream>,
    frame: Option<CloseFrame>,
) -> bool {
    let message = tungstenite::Message::Close(frame.map(Into::into));
    if let Err(err) = sink.send(message).await {
        tracing::debug!("failed to send close frame: {err}");
        return false;
    }
    let reply = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(tungstenite::Message::Close(_)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    })
    .await;
    reply.unwrap_or(false)
}

fn report_close(events: &TransportEvents, frame: Option<CloseFrame>, was_clean: bool) {
    match frame {
        Some(CloseFrame { code, reason }) => events.close(code, reason, was_clean),
        None => events.close(CloseCode::Status, "", was_clean),
    }
}

/// Starts a session over a [`TungsteniteTransport`] with the default heartbeat.
pub fn connect<E, R>(
    config: ShuttleConfig,
    reachability: &R,
    observer: &Arc<E>,
) -> (Shuttle, JoinHandle<()>)
where
    E: ShuttleExt,
    R: ReachabilityMonitor + ?Sized,
{
    Shuttle::create(config, TungsteniteTransport::default(), reachability, observer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_and_dropped_errors_are_told_apart() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            classify(&tungstenite::Error::Io(refused)),
            FailureKind::Refused
        );

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(classify(&tungstenite::Error::Io(reset)), FailureKind::Dropped);
        assert_eq!(
            classify(&tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake
            )),
            FailureKind::Dropped
        );
        assert_eq!(
            classify(&tungstenite::Error::ConnectionClosed),
            FailureKind::Dropped
        );
        assert_eq!(classify(&tungstenite::Error::Utf8), FailureKind::Other);
    }

    #[test]
    fn close_frames_convert_both_ways() {
        let frame = CloseFrame {
            code: CloseCode::Other(4001),
            reason: String::from("custom"),
        };
        let converted: tungstenite::protocol::CloseFrame<'static> = frame.clone().into();
        assert_eq!(u16::from(converted.code), 4001);
        assert_eq!(CloseFrame::from(converted), frame);

        assert_eq!(
            CloseCode::from(TungsteniteCloseCode::Away),
            CloseCode::Away
        );
        assert_eq!(
            TungsteniteCloseCode::from(CloseCode::Error),
            TungsteniteCloseCode::Error
        );
    }

    #[test]
    fn prebuilt_request_keeps_custom_headers() {
        let request = http::Request::builder()
            .uri("ws://example.com/socket")
            .header("Authorization", "Bearer token")
            .body(())
            .unwrap();
        let request = handshake_request(Endpoint::Request(request)).unwrap();

        assert_eq!(request.headers()["Authorization"], "Bearer token");
        assert_eq!(request.uri(), "ws://example.com/socket");
    }

    #[test]
    fn prebuilt_request_keeps_repeated_headers() {
        let request = http::Request::builder()
            .uri("ws://example.com/socket")
            .header("Sec-WebSocket-Protocol", "v1")
            .header("Sec-WebSocket-Protocol", "v2")
            .header("Host", "proxy.example.com")
            .body(())
            .unwrap();
        let request = handshake_request(Endpoint::Request(request)).unwrap();

        let protocols: Vec<_> = request
            .headers()
            .get_all("Sec-WebSocket-Protocol")
            .iter()
            .collect();
        assert_eq!(protocols, ["v1", "v2"]);
        let hosts: Vec<_> = request.headers().get_all("Host").iter().collect();
        assert_eq!(hosts, ["proxy.example.com"]);
        assert!(request.headers().contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn messages_convert_to_frames() {
        assert_eq!(
            tungstenite::Message::from(Message::Text("hi".to_owned())),
            tungstenite::Message::Text("hi".to_owned())
        );
        assert_eq!(
            tungstenite::Message::from(Message::Binary(vec![9])),
            tungstenite::Message::Binary(vec![9])
        );
    }
}
