//! Virtual framebuffer.
//!
//! A domain has at most one framebuffer, always device 0. It is only created
//! when the configuration asks for a display: `type` set to `vnc` or `sdl`,
//! or `vnc=1` / `sdl=1`.

use crate::controller::DevController;
use crate::device::{DeviceConfig, DeviceDetails};
use crate::error::Result;
use crate::store::Fields;

const VFB_DEVID: u32 = 0;

const BACKEND_KEYS: [&str; 10] = [
    "type",
    "vnc",
    "vnclisten",
    "vncdisplay",
    "vncunused",
    "vncpasswd",
    "sdl",
    "display",
    "xauthority",
    "keymap",
];

fn wants_display(config: &DeviceConfig) -> bool {
    config.get("type").is_some() || config.get("vnc") == Some("1") || config.get("sdl") == Some("1")
}

pub(super) fn device_details(config: &DeviceConfig) -> Option<DeviceDetails> {
    if !wants_display(config) {
        return None;
    }

    let back: Fields = BACKEND_KEYS
        .iter()
        .filter_map(|&key| config.get(key).map(|v| (key.to_string(), v.to_string())))
        .collect();

    Some(DeviceDetails {
        devid: VFB_DEVID,
        back,
        front: Fields::new(),
    })
}

pub(super) async fn configuration(
    ctl: &DevController,
    devid: u32,
    config: &mut DeviceConfig,
) -> Result<()> {
    for key in BACKEND_KEYS {
        if let Some(value) = ctl.read_backend(devid, key).await? {
            config.insert(key, value);
        }
    }
    Ok(())
}
