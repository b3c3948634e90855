//! Virtual block devices.
//!
//! Configuration keys: `dev` (guest device name, optionally suffixed with
//! `:cdrom` or `:disk`), `uname` (`<type>:<params>`, e.g. `phy:/dev/vg/root`
//! or `tap:aio:/img/root.img`), `mode` (`r`, `w` or `w!`, default `r`) and
//! `bootable`. The device id is the Linux block device number of `dev`.

use crate::controller::DevController;
use crate::device::{DeviceConfig, DeviceDetails};
use crate::error::{DeviceError, Result};
use crate::store::Fields;

use super::DeviceClass;

const CLASS: DeviceClass = DeviceClass::Vbd;

const XVD_MAJOR: u32 = 202;
const IDE_MAJORS: [u32; 10] = [3, 22, 33, 34, 56, 57, 88, 89, 90, 91];
const SCSI_MAJORS: [u32; 2] = [8, 65];
const EXTENDED: u32 = 1 << 28;

const MODES: [&str; 3] = ["r", "w", "w!"];

/// Convert a guest block device name to its device number.
///
/// Accepts `xvd*`, `hd*` and `sd*` names with an optional `/dev/` prefix and
/// partition number, as well as plain decimal or `0x` hex numbers. Xen disks
/// beyond `xvdp` use the extended numbering scheme.
pub fn blkdev_name_to_number(name: &str) -> Option<u32> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);

    if let Some(rest) = name.strip_prefix("xvd") {
        let (disk, part) = split_disk(rest)?;
        if part > 15 {
            return None;
        }
        return match disk {
            Disk::Single(d) if d < 16 => Some((XVD_MAJOR << 8) | (d << 4) | part),
            Disk::Single(d) => Some(EXTENDED | (d << 8) | part),
            // xvdaa .. xvdiz
            Disk::Double(first, second) if first < 9 => {
                let d = (first + 1) * 26 + second;
                Some(EXTENDED | (d << 8) | part)
            }
            Disk::Double(..) => None,
        };
    }

    if let Some(rest) = name.strip_prefix("hd") {
        let (Disk::Single(d), part) = split_disk(rest)? else {
            return None;
        };
        if d >= 20 || part > 63 {
            return None;
        }
        let major = IDE_MAJORS[(d / 2) as usize];
        return Some((major << 8) | ((d % 2) << 6) | part);
    }

    if let Some(rest) = name.strip_prefix("sd") {
        let (Disk::Single(d), part) = split_disk(rest)? else {
            return None;
        };
        if part > 15 {
            return None;
        }
        let major = SCSI_MAJORS[(d / 16) as usize];
        return Some((major << 8) | ((d % 16) << 4) | part);
    }

    if let Some(hex) = name.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok();
    }

    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        return name.parse().ok();
    }

    None
}

enum Disk {
    Single(u32),
    Double(u32, u32),
}

/// Split `a12` / `ab3` into disk letters and partition number.
fn split_disk(rest: &str) -> Option<(Disk, u32)> {
    let letters = rest.bytes().take_while(u8::is_ascii_lowercase).count();
    let (disk, part) = rest.split_at(letters);

    let disk = match disk.as_bytes() {
        [a] => Disk::Single(u32::from(a - b'a')),
        [a, b] => Disk::Double(u32::from(a - b'a'), u32::from(b - b'a')),
        _ => return None,
    };

    let part = if part.is_empty() {
        0
    } else if part.starts_with('0') || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    } else {
        part.parse().ok()?
    };

    Some((disk, part))
}

/// Guest device name and device type (`disk` or `cdrom`).
fn parse_dev(dev: &str) -> Result<(&str, &str)> {
    match dev.split_once(':') {
        Some((name, kind @ ("disk" | "cdrom"))) => Ok((name, kind)),
        Some((_, kind)) => Err(DeviceError::invalid_config(
            CLASS,
            format!("unknown device type {:?}", kind),
        )),
        None => Ok((dev, "disk")),
    }
}

fn parse_uname(uname: &str) -> Result<(&str, &str)> {
    match uname.split_once(':') {
        Some((kind, params)) if !kind.is_empty() => Ok((kind, params)),
        _ => Err(DeviceError::invalid_config(
            CLASS,
            format!("uname {:?} is not of the form <type>:<params>", uname),
        )),
    }
}

fn devid_for(name: &str) -> Result<u32> {
    blkdev_name_to_number(name).ok_or_else(|| {
        DeviceError::invalid_config(CLASS, format!("cannot map device name {:?}", name))
    })
}

pub(super) fn device_details(config: &DeviceConfig) -> Result<DeviceDetails> {
    let dev = config
        .get("dev")
        .ok_or_else(|| DeviceError::invalid_config(CLASS, "dev is required"))?;
    let (name, device_type) = parse_dev(dev)?;
    let devid = devid_for(name)?;

    // A cdrom may start without media.
    let (kind, params) = match config.get("uname") {
        Some(uname) => parse_uname(uname)?,
        None if device_type == "cdrom" => ("", ""),
        None => return Err(DeviceError::invalid_config(CLASS, "uname is required")),
    };

    let mode = config.get("mode").unwrap_or("r");
    if !MODES.contains(&mode) {
        return Err(DeviceError::invalid_config(
            CLASS,
            format!("invalid mode {:?}", mode),
        ));
    }

    let mut back = Fields::new();
    back.insert("dev".into(), name.to_string());
    back.insert("type".into(), kind.to_string());
    back.insert("params".into(), params.to_string());
    back.insert("mode".into(), mode.to_string());
    if let Some(bootable) = config.get("bootable") {
        back.insert("bootable".into(), bootable.to_string());
    }

    let mut front = Fields::new();
    front.insert("virtual-device".into(), devid.to_string());
    front.insert("device-type".into(), device_type.to_string());

    Ok(DeviceDetails { devid, back, front })
}

pub(super) async fn setup_device(config: &DeviceConfig) -> Result<()> {
    let Some(uname) = config.get("uname") else {
        return Ok(());
    };
    let (kind, params) = parse_uname(uname)?;
    if kind == "file" && tokio::fs::metadata(params).await.is_err() {
        return Err(DeviceError::invalid_config(
            CLASS,
            format!("image {} does not exist", params),
        ));
    }
    Ok(())
}

/// Change the media of a cdrom device.
pub(super) async fn reconfigure(
    ctl: &DevController,
    devid: u32,
    config: &DeviceConfig,
) -> Result<()> {
    let device_type = ctl
        .read_frontend(devid, "device-type")
        .await?
        .ok_or(DeviceError::DeviceNotConnected { class: CLASS, devid })?;
    if device_type != "cdrom" {
        return Err(DeviceError::invalid_config(
            CLASS,
            format!("device {} is not a cdrom; only media can be changed", devid),
        ));
    }

    if let Some(dev) = config.get("dev") {
        let (name, _) = parse_dev(dev)?;
        if devid_for(name)? != devid {
            return Err(DeviceError::invalid_config(
                CLASS,
                format!("{} does not name device {}", dev, devid),
            ));
        }
    }

    let (kind, params) = match config.get("uname") {
        Some(uname) => parse_uname(uname)?,
        None => ("", ""),
    };

    let mut fields = Fields::new();
    fields.insert("type".into(), kind.to_string());
    fields.insert("params".into(), params.to_string());
    ctl.write_backend(devid, &fields).await
}

pub(super) async fn configuration(
    ctl: &DevController,
    devid: u32,
    config: &mut DeviceConfig,
) -> Result<()> {
    let dev = ctl.read_backend(devid, "dev").await?.unwrap_or_default();
    match ctl.read_frontend(devid, "device-type").await?.as_deref() {
        Some("cdrom") => config.insert("dev", format!("{}:cdrom", dev)),
        _ => config.insert("dev", dev),
    }

    let kind = ctl.read_backend(devid, "type").await?.unwrap_or_default();
    let params = ctl.read_backend(devid, "params").await?.unwrap_or_default();
    if !kind.is_empty() {
        config.insert("uname", format!("{}:{}", kind, params));
    }

    if let Some(mode) = ctl.read_backend(devid, "mode").await? {
        config.insert("mode", mode);
    }
    if let Some(bootable) = ctl.read_backend(devid, "bootable").await? {
        config.insert("bootable", bootable);
    }
    Ok(())
}
