//! Device classes.
//!
//! The set of device kinds is closed. Each class supplies the pieces of the
//! lifecycle that depend on the device type: how a configuration maps to
//! backend and frontend records, how a device is reconfigured, and how its
//! configuration is read back from the store. Everything else lives in
//! [`DevController`].

mod console;
mod vbd;
mod vfb;
mod vif;

use std::fmt;
use std::str::FromStr;

use crate::controller::DevController;
use crate::device::{DeviceConfig, DeviceDetails};
use crate::error::{DeviceError, Result};

pub use vbd::blkdev_name_to_number;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Virtual block device.
    Vbd,
    /// Virtual network interface.
    Vif,
    /// Paravirtual console.
    Console,
    /// Virtual framebuffer.
    Vfb,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [
        DeviceClass::Vbd,
        DeviceClass::Vif,
        DeviceClass::Console,
        DeviceClass::Vfb,
    ];

    /// Name used in store paths.
    pub fn name(self) -> &'static str {
        match self {
            DeviceClass::Vbd => "vbd",
            DeviceClass::Vif => "vif",
            DeviceClass::Console => "console",
            DeviceClass::Vfb => "vfb",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| DeviceError::UnknownClass(name.to_string()))
    }

    /// Whether devices of this class wait for a hotplug agent by default.
    pub fn hotplug(self) -> bool {
        matches!(self, DeviceClass::Vbd | DeviceClass::Vif)
    }

    /// Compute the device id and the class-specific store records.
    ///
    /// `None` means the configuration asks for no device at all.
    pub(crate) async fn device_details(
        self,
        ctl: &DevController,
        config: &DeviceConfig,
    ) -> Result<Option<DeviceDetails>> {
        match self {
            DeviceClass::Vbd => vbd::device_details(config).map(Some),
            DeviceClass::Vif => vif::device_details(ctl, config).await.map(Some),
            DeviceClass::Console => console::device_details(ctl, config).await.map(Some),
            DeviceClass::Vfb => Ok(vfb::device_details(config)),
        }
    }

    /// Prepare host-side resources before anything is written to the store.
    pub(crate) async fn setup_device(self, config: &DeviceConfig) -> Result<()> {
        match self {
            DeviceClass::Vbd => vbd::setup_device(config).await,
            DeviceClass::Vif | DeviceClass::Console | DeviceClass::Vfb => Ok(()),
        }
    }

    pub(crate) async fn reconfigure(
        self,
        ctl: &DevController,
        devid: u32,
        config: &DeviceConfig,
    ) -> Result<()> {
        match self {
            DeviceClass::Vbd => vbd::reconfigure(ctl, devid, config).await,
            DeviceClass::Vif => vif::reconfigure(ctl, devid, config).await,
            DeviceClass::Console | DeviceClass::Vfb => Err(DeviceError::ReconfigureUnsupported {
                class: self,
                devid,
            }),
        }
    }

    /// Add the class-specific keys of an existing device to `config`.
    pub(crate) async fn configuration(
        self,
        ctl: &DevController,
        devid: u32,
        config: &mut DeviceConfig,
    ) -> Result<()> {
        match self {
            DeviceClass::Vbd => vbd::configuration(ctl, devid, config).await,
            DeviceClass::Vif => vif::configuration(ctl, devid, config).await,
            DeviceClass::Console => console::configuration(ctl, devid, config).await,
            DeviceClass::Vfb => vfb::configuration(ctl, devid, config).await,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceClass {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}
