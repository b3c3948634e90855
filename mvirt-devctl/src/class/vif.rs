//! Virtual network interfaces.

use rand::Rng;

use crate::controller::DevController;
use crate::device::{DeviceConfig, DeviceDetails};
use crate::error::{DeviceError, Result};
use crate::store::Fields;

use super::DeviceClass;

const CLASS: DeviceClass = DeviceClass::Vif;

const DEFAULT_SCRIPT: &str = "vif-bridge";

/// Xen OUI; generated MACs are locally unique within it.
const XEN_OUI: [u8; 3] = [0x00, 0x16, 0x3e];

/// Optional keys copied verbatim between configuration and backend.
const OPTIONAL_KEYS: [&str; 6] = ["bridge", "ip", "vifname", "rate", "model", "uuid"];

fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    // Keep the top bit of the fourth octet clear.
    let tail: [u8; 3] = [rng.gen_range(0x00..=0x7f), rng.r#gen(), rng.r#gen()];
    format_mac(&[XEN_OUI[0], XEN_OUI[1], XEN_OUI[2], tail[0], tail[1], tail[2]])
}

fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|o| format!("{:02x}", o))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_mac(mac: &str) -> Result<String> {
    let octets: Vec<u8> = mac
        .split(':')
        .map(|part| {
            if part.len() == 2 {
                u8::from_str_radix(part, 16).ok()
            } else {
                None
            }
        })
        .collect::<Option<_>>()
        .ok_or_else(|| DeviceError::invalid_config(CLASS, format!("invalid mac {:?}", mac)))?;

    let octets: [u8; 6] = octets
        .try_into()
        .map_err(|_| DeviceError::invalid_config(CLASS, format!("invalid mac {:?}", mac)))?;
    Ok(format_mac(&octets))
}

/// Backend keys derived from `config`, without `handle`.
fn backend_fields(config: &DeviceConfig, mac: &str) -> Fields {
    let mut back = Fields::new();
    back.insert("mac".into(), mac.to_string());
    back.insert(
        "script".into(),
        config.get("script").unwrap_or(DEFAULT_SCRIPT).to_string(),
    );
    for key in OPTIONAL_KEYS {
        if let Some(value) = config.get(key) {
            back.insert(key.into(), value.to_string());
        }
    }
    back
}

pub(super) async fn device_details(ctl: &DevController, config: &DeviceConfig) -> Result<DeviceDetails> {
    let mac = match config.get("mac") {
        Some(mac) => parse_mac(mac)?,
        None => random_mac(),
    };

    let devid = ctl.allocate_device_id().await?;

    let mut back = backend_fields(config, &mac);
    back.insert("handle".into(), devid.to_string());

    let mut front = Fields::new();
    front.insert("handle".into(), devid.to_string());
    front.insert("mac".into(), mac);

    Ok(DeviceDetails { devid, back, front })
}

/// Rewrite backend keys that differ from `config`.
///
/// The MAC address is fixed for the lifetime of the device.
pub(super) async fn reconfigure(
    ctl: &DevController,
    devid: u32,
    config: &DeviceConfig,
) -> Result<()> {
    let current_mac = ctl
        .read_backend(devid, "mac")
        .await?
        .ok_or(DeviceError::DeviceNotConnected { class: CLASS, devid })?;

    if let Some(mac) = config.get("mac") {
        if parse_mac(mac)? != current_mac {
            return Err(DeviceError::invalid_config(
                CLASS,
                format!("mac of device {} cannot be changed", devid),
            ));
        }
    }

    let wanted = backend_fields(config, &current_mac);
    let mut changed = Fields::new();
    for (key, value) in &wanted {
        if ctl.read_backend(devid, key).await?.as_deref() != Some(value.as_str()) {
            changed.insert(key.clone(), value.clone());
        }
    }

    let mut dropped = Vec::new();
    for key in OPTIONAL_KEYS {
        if !wanted.contains_key(key) && ctl.read_backend(devid, key).await?.is_some() {
            dropped.push(key);
        }
    }

    if !changed.is_empty() || !dropped.is_empty() {
        ctl.update_backend(devid, &changed, &dropped).await?;
    }
    Ok(())
}

pub(super) async fn configuration(
    ctl: &DevController,
    devid: u32,
    config: &mut DeviceConfig,
) -> Result<()> {
    for key in ["mac", "script"].into_iter().chain(OPTIONAL_KEYS) {
        if let Some(value) = ctl.read_backend(devid, key).await? {
            config.insert(key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_in_xen_range() {
        for _ in 0..32 {
            let mac = random_mac();
            assert!(mac.starts_with("00:16:3e:"), "{}", mac);
            assert_eq!(parse_mac(&mac).unwrap(), mac);
            let fourth = u8::from_str_radix(&mac[9..11], 16).unwrap();
            assert!(fourth < 0x80);
        }
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("00:16:3E:AA:bb:01").unwrap(), "00:16:3e:aa:bb:01");
        assert!(parse_mac("00:16:3e:aa:bb").is_err());
        assert!(parse_mac("00:16:3e:aa:bb:zz").is_err());
        assert!(parse_mac("0:16:3e:aa:bb:01").is_err());
    }

    #[test]
    fn test_backend_fields_defaults() {
        let config = DeviceConfig::new().with("bridge", "xenbr0").with("ip", "");
        let back = backend_fields(&config, "00:16:3e:00:00:01");

        assert_eq!(back["script"], DEFAULT_SCRIPT);
        assert_eq!(back["bridge"], "xenbr0");
        assert!(!back.contains_key("ip"));
        assert!(!back.contains_key("handle"));
    }
}
