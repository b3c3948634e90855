use crate::controller::DevController;
use crate::device::{DeviceConfig, DeviceDetails};
use crate::error::Result;
use crate::store::Fields;

const DEFAULT_PROTOCOL: &str = "vt100";

pub(super) async fn device_details(ctl: &DevController, config: &DeviceConfig) -> Result<DeviceDetails> {
    let devid = ctl.allocate_device_id().await?;

    let mut back = Fields::new();
    back.insert(
        "protocol".into(),
        config.get("protocol").unwrap_or(DEFAULT_PROTOCOL).to_string(),
    );
    if let Some(location) = config.get("location") {
        back.insert("location".into(), location.to_string());
    }

    Ok(DeviceDetails {
        devid,
        back,
        front: Fields::new(),
    })
}

pub(super) async fn configuration(
    ctl: &DevController,
    devid: u32,
    config: &mut DeviceConfig,
) -> Result<()> {
    for key in ["protocol", "location"] {
        if let Some(value) = ctl.read_backend(devid, key).await? {
            config.insert(key, value);
        }
    }
    Ok(())
}
