//! Network reachability as seen by a [`crate::Shuttle`].
//!
//! The OS-specific polling lives outside this crate. An embedding application reports what the
//! platform tells it through a [`ReachabilityMonitor`], for example by feeding a
//! [`ManualReachability`] from its reachability callback.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Kind of network interface currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceType {
    #[default]
    None,
    Cellular,
    Wifi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reachability {
    pub interface: InterfaceType,
}

impl Reachability {
    pub const OFFLINE: Self = Self::new(InterfaceType::None);
    pub const CELLULAR: Self = Self::new(InterfaceType::Cellular);
    pub const WIFI: Self = Self::new(InterfaceType::Wifi);

    pub const fn new(interface: InterfaceType) -> Self {
        Self { interface }
    }

    pub fn is_reachable(&self) -> bool {
        self.interface != InterfaceType::None
    }
}

/// When a session may open a connection on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectCondition {
    /// Any reachable network.
    #[default]
    Always,
    /// WiFi only. On cellular the session waits for WLAN.
    RequireWlan,
}

impl ConnectCondition {
    pub fn permits(&self, reachability: Reachability) -> bool {
        match self {
            ConnectCondition::Always => reachability.is_reachable(),
            ConnectCondition::RequireWlan => reachability.interface == InterfaceType::Wifi,
        }
    }
}

pub trait ReachabilityMonitor: Send + Sync {
    /// Latest known status.
    fn status(&self) -> Reachability;

    /// Current status together with a feed of every later change, in order. Short flaps such
    /// as `None` then `Wifi` arrive as two separate changes.
    fn subscribe(&self) -> (Reachability, mpsc::UnboundedReceiver<Reachability>);

    fn is_reachable(&self) -> bool {
        self.status().is_reachable()
    }

    fn interface_type(&self) -> InterfaceType {
        self.status().interface
    }
}

#[derive(Debug)]
struct Subscribers {
    status: Reachability,
    feeds: Vec<mpsc::UnboundedSender<Reachability>>,
}

/// Reachability driven by whoever holds it, typically an OS reachability callback.
#[derive(Debug)]
pub struct ManualReachability {
    inner: Mutex<Subscribers>,
}

impl ManualReachability {
    pub fn new(interface: InterfaceType) -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                status: Reachability::new(interface),
                feeds: Vec::new(),
            }),
        }
    }

    /// Reports a new interface. Subscribers only hear about actual changes.
    pub fn set(&self, interface: InterfaceType) {
        let reachability = Reachability::new(interface);
        let mut inner = self.lock();
        if inner.status == reachability {
            return;
        }
        tracing::debug!(?interface, "reachability changed");
        inner.status = reachability;
        inner.feeds.retain(|feed| feed.send(reachability).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new(InterfaceType::Wifi)
    }
}

impl ReachabilityMonitor for ManualReachability {
    fn status(&self) -> Reachability {
        self.lock().status
    }

    fn subscribe(&self) -> (Reachability, mpsc::UnboundedReceiver<Reachability>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.feeds.push(sender);
        (inner.status, receiver)
    }
}
