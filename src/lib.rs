//! WebSocket client sessions that know about the network they run on. This crate provides:
//! - Connection state tracking (`Offline`, `Connecting`, `Connected`, `Disconnected`).
//! - Reachability awareness, including a WLAN-only connect condition.
//! - A connect timeout, with every failure reported once through a single observer trait.
//!
//! Refer to [`shuttle`] for the session itself and [`transport`] for plugging in a socket.

mod socket;

pub use socket::CloseCode;
pub use socket::CloseEvent;
pub use socket::CloseFrame;
pub use socket::Message;

#[cfg(feature = "tokio-tungstenite")]
pub mod tungstenite;

pub mod config;
pub mod error;
pub mod reachability;
pub mod shuttle;
pub mod transport;

pub use config::Endpoint;
pub use config::ShuttleConfig;

pub use error::ConnectionError;
pub use error::ErrorReason;
pub use error::SendError;

pub use reachability::ConnectCondition;
pub use reachability::InterfaceType;
pub use reachability::ManualReachability;
pub use reachability::ReachabilityMonitor;

pub use shuttle::Shuttle;
pub use shuttle::ShuttleExt;
pub use shuttle::SocketState;

pub use transport::Transport;

pub type Error = eyre::Error;
pub type Request = http::Request<()>;
