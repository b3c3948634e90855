//! Device configuration records and device references.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};
use crate::store::Fields;

/// Configuration of one device, as accepted by
/// [`DevController::create_device`](crate::controller::DevController::create_device)
/// and returned by
/// [`DevController::configuration`](crate::controller::DevController::configuration).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, String>);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value of `key`, treating empty strings as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Output of a device class's detail computation.
///
/// `back` and `front` hold only class-specific keys; the controller adds the
/// cross references and initial state before writing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub devid: u32,
    pub back: Fields,
    pub front: Fields,
}

/// A device named either by id or by something ending in the id, such as
/// `"vbd/768"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    Id(u32),
    Name(String),
}

impl DeviceRef {
    /// Resolve to a numeric device id.
    pub fn resolve(&self) -> Result<u32> {
        match self {
            DeviceRef::Id(id) => Ok(*id),
            DeviceRef::Name(name) => {
                let trimmed = name.trim();
                trimmed
                    .parse::<u32>()
                    .ok()
                    .or_else(|| trimmed.rsplit('/').next()?.parse::<u32>().ok())
                    .ok_or_else(|| DeviceError::InvalidDeviceId(name.clone()))
            }
        }
    }
}

impl From<u32> for DeviceRef {
    fn from(id: u32) -> Self {
        DeviceRef::Id(id)
    }
}

impl From<&str> for DeviceRef {
    fn from(name: &str) -> Self {
        DeviceRef::Name(name.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(name: String) -> Self {
        DeviceRef::Name(name)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Id(id) => write!(f, "{}", id),
            DeviceRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Copy of `fields` with secrets masked, for logging.
pub(crate) fn scrub_secrets(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(k, v)| {
            if k.contains("passwd") || k.contains("password") {
                (k.clone(), "XXXXXXXX".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
