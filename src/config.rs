use crate::reachability::ConnectCondition;
use crate::Request;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a [`crate::Shuttle`] connects to: either a plain URL or a prebuilt handshake request
/// carrying custom headers.
#[derive(Debug)]
pub enum Endpoint {
    Url(String),
    Request(Request),
}

impl Endpoint {
    /// Server URL of this endpoint.
    pub fn url(&self) -> String {
        match self {
            Endpoint::Url(url) => url.clone(),
            Endpoint::Request(request) => request.uri().to_string(),
        }
    }
}

impl Clone for Endpoint {
    fn clone(&self) -> Self {
        match self {
            Endpoint::Url(url) => Endpoint::Url(url.clone()),
            Endpoint::Request(request) => {
                let mut copy = Request::new(());
                *copy.method_mut() = request.method().clone();
                *copy.uri_mut() = request.uri().clone();
                *copy.version_mut() = request.version();
                *copy.headers_mut() = request.headers().clone();
                Endpoint::Request(copy)
            }
        }
    }
}

impl From<&str> for Endpoint {
    fn from(url: &str) -> Self {
        Self::Url(url.to_owned())
    }
}

impl From<String> for Endpoint {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<Request> for Endpoint {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

#[derive(Clone, Debug)]
pub struct ShuttleConfig {
    pub endpoint: Endpoint,
    pub connect_condition: ConnectCondition,
    /// Applies to each connect attempt separately.
    pub timeout: Duration,
    /// Attempt a connection as soon as the session starts, if the network allows it.
    pub connect_on_start: bool,
}

impl ShuttleConfig {
    pub fn new(endpoint: impl Into<Endpoint>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_condition: ConnectCondition::default(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_on_start: true,
        }
    }

    pub fn connect_condition(mut self, condition: ConnectCondition) -> Self {
        self.connect_condition = condition;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_on_start(mut self, connect_on_start: bool) -> Self {
        self.connect_on_start = connect_on_start;
        self
    }
}

/// Keep-alive settings of the tungstenite transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often a Ping is sent.
    pub interval: Duration,
    /// How long the server may stay silent before the connection counts as dropped.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}
