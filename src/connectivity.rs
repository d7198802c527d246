use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityEvent::Connected => write!(f, "connected"),
            ConnectivityEvent::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Turns raw reachability reports into edge events.
///
/// Starts detached and with no known state, so the first report after
/// attaching always produces an event.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    last: Option<bool>,
    attached: bool,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn attach(&mut self) {
        if self.attached {
            debug!("Connectivity monitor already attached");
            return;
        }
        info!("Connectivity monitor attached");
        self.attached = true;
    }

    pub fn detach(&mut self) {
        if !self.attached {
            debug!("Connectivity monitor detached twice, ignoring");
            return;
        }
        info!("Connectivity monitor detached");
        self.attached = false;
        self.last = None;
    }

    pub fn on_network_changed(&mut self, is_connected: bool) -> Option<ConnectivityEvent> {
        if !self.attached {
            debug!("Ignoring network report while detached");
            return None;
        }
        if self.last == Some(is_connected) {
            return None;
        }

        self.last = Some(is_connected);
        let event = if is_connected {
            ConnectivityEvent::Connected
        } else {
            ConnectivityEvent::Disconnected
        };
        info!("Network {}", event);
        Some(event)
    }
}

/// Periodically checks whether `address` accepts TCP connections and reports
/// the result. Stops when `token` is cancelled or the receiver goes away.
pub fn spawn_reachability_check(
    address: String,
    interval: Duration,
    timeout: Duration,
    reports: mpsc::UnboundedSender<bool>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reachable = tokio::select! {
                _ = token.cancelled() => break,
                reachable = check_once(&address, timeout) => reachable,
            };

            if reports.send(reachable).is_err() {
                break;
            }
        }
        debug!("Reachability check for {} stopped", address);
    })
}

async fn check_once(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Reachability check of {} failed: {}", address, e);
            false
        }
        Err(_) => {
            warn!("Reachability check of {} timed out after {:?}", address, timeout);
            false
        }
    }
}
