//! Device controller error types.

use std::fmt;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::class::DeviceClass;
use crate::migration::MigrationStep;
use crate::pool::PoolError;
use crate::store::StoreError;

/// What the controller was waiting for when the hotplug agent timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Connect,
    Disconnect,
    Reconfigure,
}

impl fmt::Display for HotplugAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugAction::Connect => write!(f, "connected"),
            HotplugAction::Disconnect => write!(f, "disconnected"),
            HotplugAction::Reconfigure => write!(f, "reconfigured"),
        }
    }
}

/// Errors raised by device controller operations.
///
/// Variants tied to a device carry its class and id.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {} is already connected", describe(.devid, .class, .name))]
    AlreadyConnected {
        class: DeviceClass,
        devid: u32,
        name: Option<String>,
    },

    #[error("cannot configure device {devid} ({class}) for unknown backend {backend}")]
    BackendUnresolved {
        class: DeviceClass,
        devid: u32,
        backend: String,
    },

    #[error("device {devid} ({class}) not connected")]
    DeviceNotConnected { class: DeviceClass, devid: u32 },

    #[error("device {devid} ({class}) could not be connected: device not found")]
    DeviceNotFound { class: DeviceClass, devid: u32 },

    #[error("device {devid} ({class}) could not be {action}: hotplug scripts not working")]
    HotplugTimeout {
        class: DeviceClass,
        devid: u32,
        action: HotplugAction,
    },

    #[error(
        "device {devid} ({class}) could not be connected: {}",
        .detail.as_deref().unwrap_or("backend device not found")
    )]
    HotplugError {
        class: DeviceClass,
        devid: u32,
        detail: Option<String>,
    },

    #[error(
        "device {devid} ({class}) could not be connected: {}",
        .detail.as_deref().unwrap_or("busy")
    )]
    HotplugBusy {
        class: DeviceClass,
        devid: u32,
        detail: Option<String>,
    },

    #[error("{class} devices may not be reconfigured (device {devid})")]
    ReconfigureUnsupported { class: DeviceClass, devid: u32 },

    #[error("migration tool returned {code} for {class} at step {step}")]
    MigrationToolFailure {
        class: DeviceClass,
        step: MigrationStep,
        code: i32,
    },

    #[error("failed to run migration tool for {class}: {source}")]
    MigrationToolSpawn {
        class: DeviceClass,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {class} configuration: {reason}")]
    InvalidConfig { class: DeviceClass, reason: String },

    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("unknown device class: {0}")]
    UnknownClass(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("resource pool: {0}")]
    Pool(#[from] PoolError),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl DeviceError {
    pub(crate) fn invalid_config(class: DeviceClass, reason: impl Into<String>) -> Self {
        DeviceError::InvalidConfig {
            class,
            reason: reason.into(),
        }
    }
}

fn describe(devid: &u32, class: &DeviceClass, name: &Option<String>) -> String {
    match name {
        Some(name) => format!("{} ({}, {})", name, devid, class),
        None => format!("{} ({})", devid, class),
    }
}

/// Result type for device controller operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_connected_message() {
        let err = DeviceError::AlreadyConnected {
            class: DeviceClass::Vbd,
            devid: 51712,
            name: Some("xvda".into()),
        };
        assert_eq!(
            err.to_string(),
            "device xvda (51712, vbd) is already connected"
        );

        let err = DeviceError::AlreadyConnected {
            class: DeviceClass::Vif,
            devid: 2,
            name: None,
        };
        assert_eq!(err.to_string(), "device 2 (vif) is already connected");
    }

    #[test]
    fn test_hotplug_error_message() {
        let err = DeviceError::HotplugError {
            class: DeviceClass::Vbd,
            devid: 768,
            detail: None,
        };
        assert_eq!(
            err.to_string(),
            "device 768 (vbd) could not be connected: backend device not found"
        );

        let err = DeviceError::HotplugTimeout {
            class: DeviceClass::Vif,
            devid: 0,
            action: HotplugAction::Disconnect,
        };
        assert_eq!(
            err.to_string(),
            "device 0 (vif) could not be disconnected: hotplug scripts not working"
        );
    }
}
