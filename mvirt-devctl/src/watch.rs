//! Hotplug status watches.
//!
//! A wait subscribes to store events for one path, re-reads the path after
//! registration and after every relevant notification, and resolves on the
//! first terminal status. If none arrives before the deadline the wait
//! resolves to [`HotplugStatus::Timeout`]. Dropping the wait unsubscribes.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::store::{Event, Result, Store};
use crate::xenbus::{
    HOTPLUG_STATUS_BUSY, HOTPLUG_STATUS_CONNECTED, HOTPLUG_STATUS_ERROR, XenbusState,
};

/// Outcome of a status wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugStatus {
    Pending,
    Connected,
    Error,
    Busy,
    Timeout,
    Missing,
    Disconnected,
}

impl HotplugStatus {
    pub fn is_terminal(self) -> bool {
        self != HotplugStatus::Pending
    }
}

impl fmt::Display for HotplugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which transition a wait is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Hotplug agent reports on a new device.
    Hotplug,
    /// Hotplug agent clears the status node after teardown.
    Destroy,
    /// Backend `state` returns to Connected after reconfiguration.
    Reconfigure,
}

impl WaitKind {
    /// Map the current raw value of the watched node to a status.
    pub fn evaluate(self, raw: Option<&str>) -> HotplugStatus {
        match self {
            WaitKind::Hotplug => match raw {
                Some(HOTPLUG_STATUS_CONNECTED) => HotplugStatus::Connected,
                Some(HOTPLUG_STATUS_ERROR) => HotplugStatus::Error,
                Some(HOTPLUG_STATUS_BUSY) => HotplugStatus::Busy,
                _ => HotplugStatus::Pending,
            },
            WaitKind::Destroy => match raw {
                None => HotplugStatus::Disconnected,
                Some(_) => HotplugStatus::Pending,
            },
            WaitKind::Reconfigure => match raw.and_then(XenbusState::from_value) {
                Some(XenbusState::Connected) => HotplugStatus::Connected,
                _ => HotplugStatus::Pending,
            },
        }
    }
}

/// Subscription to changes at or below one path.
pub struct Watch {
    path: String,
    events: broadcast::Receiver<Event>,
}

impl Watch {
    pub fn new(store: &dyn Store, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            events: store.subscribe(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next notification affecting the watched path.
    ///
    /// Returns `false` once the store has gone away and no further
    /// notifications can arrive.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.events.recv().await {
                Ok(event) if event.affects(&self.path) => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed events may have touched us; re-read to be sure.
                    trace!(path = %self.path, skipped, "watch lagged");
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }
}

/// Block until `path` reaches a terminal status for `kind`, or `timeout`
/// elapses.
pub async fn wait_for_status(
    store: &dyn Store,
    path: &str,
    kind: WaitKind,
    timeout: Duration,
) -> Result<HotplugStatus> {
    // Subscribe before the first read so no change slips in between.
    let mut watch = Watch::new(store, path);
    let deadline = Instant::now() + timeout;

    let outcome =
        tokio::time::timeout_at(deadline, until_terminal(store, path, kind, &mut watch)).await;

    match outcome {
        Ok(result) => {
            if let Ok(status) = &result {
                debug!(path, %status, "watch resolved");
            }
            result
        }
        Err(_) => {
            debug!(path, ?kind, "watch timed out");
            Ok(HotplugStatus::Timeout)
        }
    }
}

async fn until_terminal(
    store: &dyn Store,
    path: &str,
    kind: WaitKind,
    watch: &mut Watch,
) -> Result<HotplugStatus> {
    loop {
        let raw = store.read(path).await?;
        let status = kind.evaluate(raw.as_deref());
        if status.is_terminal() {
            return Ok(status);
        }
        if !watch.changed().await {
            // Nothing will change any more; let the deadline decide.
            std::future::pending::<()>().await;
        }
    }
}
