//! Paravirtual device lifecycle controller.
//!
//! Devices of a guest domain are negotiated through a hierarchical,
//! watchable key-value store shared with the backend domain and its hotplug
//! agent. A [`DevController`] creates the frontend and backend records of a
//! device, waits for the hotplug agent to report, reconfigures and tears
//! devices down, and reads their configuration back.

pub mod checkpoint;
pub mod class;
pub mod config;
pub mod context;
pub mod controller;
pub mod device;
pub mod domain;
pub mod error;
pub mod migration;
pub mod pool;
pub mod store;
pub mod transaction;
pub mod watch;
pub mod xenbus;

pub use class::DeviceClass;
pub use config::{ConfigError, Options};
pub use context::Context;
pub use controller::DevController;
pub use device::{DeviceConfig, DeviceDetails, DeviceRef};
pub use domain::{Domain, DomainLookup, DomainTable};
pub use error::{DeviceError, HotplugAction, Result};
pub use store::{MemoryStore, Store, StoreError};
pub use watch::HotplugStatus;
