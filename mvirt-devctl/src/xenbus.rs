//! Xenbus protocol constants shared with the hotplug agent and guest drivers.

use std::fmt;

/// Leaf below a backend (or phantom) path where the hotplug agent reports.
pub const HOTPLUG_STATUS_NODE: &str = "hotplug-status";
/// Sibling leaf carrying the hotplug agent's diagnostic text.
pub const HOTPLUG_ERROR_NODE: &str = "hotplug-error";

pub const HOTPLUG_STATUS_CONNECTED: &str = "connected";
pub const HOTPLUG_STATUS_ERROR: &str = "error";
pub const HOTPLUG_STATUS_BUSY: &str = "busy";

/// Frontend key pointing at a phantom device whose status must be awaited
/// before the primary device.
pub const PHANTOM_NODE: &str = "phantom_vbd";

/// Connection state of a frontend or backend, stored as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XenbusState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
    Reconfiguring = 7,
    Reconfigured = 8,
}

impl XenbusState {
    /// Store representation.
    pub fn as_value(self) -> String {
        (self as u8).to_string()
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value.trim().parse::<u8>().ok()? {
            0 => Some(Self::Unknown),
            1 => Some(Self::Initialising),
            2 => Some(Self::InitWait),
            3 => Some(Self::Initialised),
            4 => Some(Self::Connected),
            5 => Some(Self::Closing),
            6 => Some(Self::Closed),
            7 => Some(Self::Reconfiguring),
            8 => Some(Self::Reconfigured),
            _ => None,
        }
    }
}

impl fmt::Display for XenbusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
