//! Generic device lifecycle protocol.
//!
//! A [`DevController`] manages all devices of one class for one domain. Each
//! device is represented in the store by three records:
//!
//! - the frontend at `<domPath>/device/<class>/<devid>`, read by the guest,
//! - the backend at `<backDomPath>/backend/<class>/<domid>/<devid>`, read by
//!   the backend domain and its hotplug agent,
//! - the device record at `<vmPath>/device/<class>/<devid>`, pointing at both.
//!
//! Creation writes all three in one transaction. The hotplug agent then
//! reports on the backend's `hotplug-status` node, which
//! [`DevController::wait_for_device`] watches.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::checkpoint::{
    self, BufferedNic, DiskControl, NetBuffer, Replication, ReplicatedDisk,
};
use crate::class::DeviceClass;
use crate::context::Context;
use crate::device::{DeviceConfig, DeviceDetails, DeviceRef, scrub_secrets};
use crate::domain::Domain;
use crate::error::{DeviceError, HotplugAction, Result};
use crate::migration::MigrationStep;
use crate::pool::{Liveness, ResourcePool};
use crate::store::{Fields, Permission, Store, StoreError, join};
use crate::transaction::{RetryPolicy, transact};
use crate::watch::{HotplugStatus, WaitKind, wait_for_status};
use crate::xenbus::{HOTPLUG_ERROR_NODE, HOTPLUG_STATUS_NODE, PHANTOM_NODE, XenbusState};

/// Creation conflicts are retried forever; log progress this often.
const CREATE_RETRY_LOG_INTERVAL: u32 = 50;

const NEXT_DEVICE_ID: &str = "nextDeviceID";

pub struct DevController {
    ctx: Context,
    domain: Domain,
    class: DeviceClass,
    hotplug: bool,
}

impl DevController {
    pub fn new(ctx: Context, domain: Domain, class: DeviceClass) -> Self {
        Self {
            hotplug: class.hotplug(),
            ctx,
            domain,
            class,
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn hotplug(&self) -> bool {
        self.hotplug
    }

    /// Enable or disable waiting for the hotplug agent.
    pub fn set_hotplug(&mut self, enabled: bool) {
        self.hotplug = enabled;
    }

    fn store(&self) -> &dyn Store {
        self.ctx.store.as_ref()
    }

    // Paths

    pub fn frontend_root(&self) -> String {
        format!("{}/device/{}", self.domain.dom_path, self.class)
    }

    pub fn frontend_path(&self, devid: u32) -> String {
        format!("{}/{}", self.frontend_root(), devid)
    }

    pub fn frontend_misc_path(&self) -> String {
        format!("{}/device-misc/{}", self.domain.dom_path, self.class)
    }

    pub fn device_root(&self) -> String {
        format!("{}/device/{}", self.domain.vm_path, self.class)
    }

    pub fn device_path(&self, devid: u32) -> String {
        format!("{}/{}", self.device_root(), devid)
    }

    pub fn backend_path(&self, backdom: &Domain, devid: u32) -> String {
        format!(
            "{}/backend/{}/{}/{}",
            backdom.dom_path, self.class, self.domain.domid, devid
        )
    }

    // Lifecycle

    /// Create a device and return its id.
    ///
    /// Returns 0 without touching the store when the configuration asks for
    /// no device. Does not wait for the hotplug agent; see
    /// [`DevController::wait_for_device`].
    pub async fn create_device(&self, config: &DeviceConfig) -> Result<u32> {
        let Some(DeviceDetails {
            devid,
            mut back,
            mut front,
        }) = self.class.device_details(self, config).await?
        else {
            debug!(class = %self.class, domid = self.domain.domid, "No device requested");
            return Ok(0);
        };

        self.class.setup_device(config).await?;

        let backdom = self.backend_domain(config, devid).await?;
        let frontpath = self.frontend_path(devid);
        let backpath = self.backend_path(&backdom, devid);
        let devpath = self.device_path(devid);
        let initialising = XenbusState::Initialising.as_value();

        front.insert("backend".into(), backpath.clone());
        front.insert("backend-id".into(), backdom.domid.to_string());
        front.insert("state".into(), initialising.clone());
        if let Some(protocol) = &self.domain.native_protocol {
            front.insert("protocol".into(), protocol.clone());
        }

        back.insert("domain".into(), self.domain.name.clone());
        back.insert("frontend".into(), frontpath.clone());
        back.insert("frontend-id".into(), self.domain.domid.to_string());
        back.insert("state".into(), initialising);
        back.insert("online".into(), "1".into());

        let mut record = Fields::new();
        record.insert("backend".into(), backpath.clone());
        record.insert("backend-id".into(), backdom.domid.to_string());
        record.insert("frontend".into(), frontpath.clone());
        record.insert("frontend-id".into(), self.domain.domid.to_string());

        let class = self.class;
        let owner = self.domain.domid;
        let backdomid = backdom.domid;
        let root = self.device_root();
        let policy = RetryPolicy::Unbounded {
            log_every: CREATE_RETRY_LOG_INTERVAL,
        };

        transact::<_, DeviceError, _>(self.store(), policy, |t, attempt| {
            let (root, frontpath, backpath, devpath) = (
                root.clone(),
                frontpath.clone(),
                backpath.clone(),
                devpath.clone(),
            );
            let (front, back, record) = (front.clone(), back.clone(), record.clone());
            Box::pin(async move {
                if t.list(&root).await?.contains(&devid.to_string()) {
                    return Err(DeviceError::AlreadyConnected {
                        class,
                        devid,
                        name: back.get("dev").cloned(),
                    });
                }

                if attempt == 0 {
                    debug!(
                        class = %class,
                        devid,
                        frontend = %frontpath,
                        backend = %backpath,
                        front = ?front,
                        back = ?scrub_secrets(&back),
                        "Writing device records"
                    );
                }

                t.remove(&frontpath).await?;
                t.remove(&backpath).await?;
                t.remove(&devpath).await?;

                t.mkdir(&backpath).await?;
                t.set_permissions(
                    &backpath,
                    &[Permission::owner(backdomid), Permission::read(owner)],
                )
                .await?;
                t.mkdir(&frontpath).await?;
                t.set_permissions(
                    &frontpath,
                    &[Permission::owner(owner), Permission::read(backdomid)],
                )
                .await?;

                t.write_fields(&frontpath, &front).await?;
                t.write_fields(&backpath, &back).await?;
                t.write_fields(&devpath, &record).await?;
                Ok(())
            })
        })
        .await?;

        info!(
            class = %self.class,
            domid = owner,
            devid,
            backend_domid = backdomid,
            "Device created"
        );
        Ok(devid)
    }

    async fn backend_domain(&self, config: &DeviceConfig, devid: u32) -> Result<Domain> {
        let backdom = match config.get("backend") {
            Some(name) => self.ctx.domains.lookup(name).await,
            None => self.ctx.domains.privileged().await,
        };
        backdom.ok_or_else(|| DeviceError::BackendUnresolved {
            class: self.class,
            devid,
            backend: config.get("backend").unwrap_or("privileged domain").to_string(),
        })
    }

    /// Wait for every registered device of this class.
    ///
    /// All waits run to completion, including the teardown of failed
    /// devices; the first failure in device id order is returned.
    pub async fn wait_for_devices(&self) -> Result<()> {
        let ids = self.device_ids().await?;
        debug!(class = %self.class, domid = self.domain.domid, count = ids.len(), "Waiting for devices");
        join_all(ids.into_iter().map(|devid| self.wait_for_device(devid)))
            .await
            .into_iter()
            .collect()
    }

    /// Wait for the hotplug agent to bring `devid` up.
    ///
    /// On timeout, error or busy the device is torn down (without force)
    /// before the error is returned.
    pub async fn wait_for_device(&self, devid: u32) -> Result<()> {
        if !self.hotplug {
            return Ok(());
        }
        debug!(class = %self.class, devid, "Waiting for device");

        let class = self.class;
        let (status, detail) = self.wait_for_backend(devid).await?;
        match status {
            HotplugStatus::Connected => Ok(()),
            HotplugStatus::Missing => Err(DeviceError::DeviceNotFound { class, devid }),
            HotplugStatus::Error => {
                self.destroy_after_failure(devid).await;
                Err(DeviceError::HotplugError {
                    class,
                    devid,
                    detail,
                })
            }
            HotplugStatus::Busy => {
                self.destroy_after_failure(devid).await;
                Err(DeviceError::HotplugBusy {
                    class,
                    devid,
                    detail,
                })
            }
            HotplugStatus::Timeout | HotplugStatus::Pending | HotplugStatus::Disconnected => {
                self.destroy_after_failure(devid).await;
                Err(DeviceError::HotplugTimeout {
                    class,
                    devid,
                    action: HotplugAction::Connect,
                })
            }
        }
    }

    async fn destroy_after_failure(&self, devid: u32) {
        if let Err(e) = self.destroy_device(devid, false).await {
            warn!(class = %self.class, devid, error = %e, "Failed to tear down device after hotplug failure");
        }
    }

    /// Wait for the phantom device, if any, then for the backend's hotplug
    /// status. Returns the status and the agent's `hotplug-error` text.
    pub async fn wait_for_backend(&self, devid: u32) -> Result<(HotplugStatus, Option<String>)> {
        let store = self.store();
        let timeout = self.ctx.options.device_create_timeout();

        let frontpath = self.frontend_path(devid);
        if let Some(phantom) = store.read_at(&frontpath, PHANTOM_NODE).await? {
            debug!(class = %self.class, devid, phantom = %phantom, "Waiting for phantom device");
            let status_path = join(&phantom, HOTPLUG_STATUS_NODE);
            let status = wait_for_status(store, &status_path, WaitKind::Hotplug, timeout).await?;
            if status != HotplugStatus::Connected {
                let detail = store.read_at(&phantom, HOTPLUG_ERROR_NODE).await?;
                return Ok((status, detail));
            }
        }

        let Some(backpath) = self.read_vm(devid, "backend").await? else {
            return Ok((HotplugStatus::Missing, None));
        };

        let status_path = join(&backpath, HOTPLUG_STATUS_NODE);
        let status = wait_for_status(store, &status_path, WaitKind::Hotplug, timeout).await?;
        let detail = store.read_at(&backpath, HOTPLUG_ERROR_NODE).await?;
        Ok((status, detail))
    }

    /// Wait for the hotplug agent to finish tearing down the backend at
    /// `backpath`.
    pub async fn wait_for_device_destroy(&self, devid: u32, backpath: &str) -> Result<()> {
        if !self.hotplug {
            return Ok(());
        }
        debug!(class = %self.class, devid, "Waiting for device teardown");

        let status_path = join(backpath, HOTPLUG_STATUS_NODE);
        let timeout = self.ctx.options.device_destroy_timeout();
        match wait_for_status(self.store(), &status_path, WaitKind::Destroy, timeout).await? {
            HotplugStatus::Disconnected => Ok(()),
            _ => Err(DeviceError::HotplugTimeout {
                class: self.class,
                devid,
                action: HotplugAction::Disconnect,
            }),
        }
    }

    /// Wait for the backend to return to Connected after a reconfiguration.
    pub async fn wait_for_device_reconfigure(&self, devid: u32) -> Result<()> {
        debug!(class = %self.class, devid, "Waiting for device reconfiguration");

        let Some(backpath) = self.read_frontend(devid, "backend").await? else {
            return Err(DeviceError::DeviceNotConnected {
                class: self.class,
                devid,
            });
        };

        let state_path = join(&backpath, "state");
        let timeout = self.ctx.options.device_reconfigure_timeout();
        match wait_for_status(self.store(), &state_path, WaitKind::Reconfigure, timeout).await? {
            HotplugStatus::Connected => Ok(()),
            _ => Err(DeviceError::HotplugTimeout {
                class: self.class,
                devid,
                action: HotplugAction::Reconfigure,
            }),
        }
    }

    pub async fn reconfigure_device(&self, devid: u32, config: &DeviceConfig) -> Result<()> {
        self.class.reconfigure(self, devid, config).await?;
        info!(class = %self.class, domid = self.domain.domid, devid, "Device reconfigured");
        Ok(())
    }

    /// Tear a device down.
    ///
    /// `online` is cleared before `state` moves to Closing, since backend
    /// drivers watch `state`. With `force`, all three records are removed
    /// as well; this succeeds even if the backend has already gone.
    pub async fn destroy_device(&self, devid: impl Into<DeviceRef>, force: bool) -> Result<()> {
        let devid = devid.into().resolve()?;
        let store = self.store();
        let backpath = self.read_vm(devid, "backend").await?;

        match &backpath {
            Some(backpath) if store.exists(backpath).await? => {
                store.write(&join(backpath, "online"), "0").await?;
                store
                    .write(&join(backpath, "state"), &XenbusState::Closing.as_value())
                    .await?;
            }
            Some(backpath) => {
                debug!(class = %self.class, devid, backend = %backpath, "Backend already gone");
            }
            None if force => {
                debug!(class = %self.class, devid, "No device record, removing leftovers");
            }
            None => {
                return Err(DeviceError::DeviceNotConnected {
                    class: self.class,
                    devid,
                });
            }
        }

        if force {
            if let Some(backpath) = &backpath {
                store.remove(backpath).await?;
            }
            store.remove(&self.frontend_path(devid)).await?;
            store.remove(&self.device_path(devid)).await?;
        }

        info!(class = %self.class, domid = self.domain.domid, devid, force, "Device destroyed");
        Ok(())
    }

    // Configuration

    /// Configuration of `devid` in a form accepted by
    /// [`DevController::create_device`].
    pub async fn configuration(&self, devid: u32) -> Result<DeviceConfig> {
        let mut config = self.get_device_configuration(devid).await?;
        self.class.configuration(self, devid, &mut config).await?;
        Ok(config)
    }

    pub async fn configurations(&self) -> Result<Vec<DeviceConfig>> {
        let mut configs = Vec::new();
        for devid in self.device_ids().await? {
            configs.push(self.configuration(devid).await?);
        }
        Ok(configs)
    }

    /// Class-independent part of the configuration: the backend domain id.
    pub async fn get_device_configuration(&self, devid: u32) -> Result<DeviceConfig> {
        let backend_id = self
            .read_vm(devid, "backend-id")
            .await?
            .ok_or(DeviceError::DeviceNotConnected {
                class: self.class,
                devid,
            })?;
        Ok(DeviceConfig::new().with("backend", backend_id))
    }

    pub async fn all_device_configurations(&self) -> Result<BTreeMap<u32, DeviceConfig>> {
        let mut all = BTreeMap::new();
        for devid in self.device_ids().await? {
            all.insert(devid, self.get_device_configuration(devid).await?);
        }
        Ok(all)
    }

    /// Everything below the frontend root, keyed by relative path.
    pub async fn frontend_tree(&self) -> Result<Fields> {
        Ok(self.store().list_recursive(&self.frontend_root()).await?)
    }

    // Migration

    /// Run one migration step for this class's devices.
    ///
    /// Succeeds immediately if no external migration tool is configured.
    pub async fn migrate(
        &self,
        network: bool,
        dst: &str,
        step: MigrationStep,
        dom_name: &str,
    ) -> Result<()> {
        self.run_migration_tool(network, dst, step, dom_name, false).await
    }

    /// Undo a migration whose last successful step was `step`.
    pub async fn recover_migrate(
        &self,
        network: bool,
        dst: &str,
        step: MigrationStep,
        dom_name: &str,
    ) -> Result<()> {
        self.run_migration_tool(network, dst, step, dom_name, true).await
    }

    async fn run_migration_tool(
        &self,
        network: bool,
        dst: &str,
        step: MigrationStep,
        dom_name: &str,
        recover: bool,
    ) -> Result<()> {
        let Some(tool) = self.ctx.migration_tool() else {
            debug!(class = %self.class, %step, "No external migration tool configured");
            return Ok(());
        };
        debug!(class = %self.class, %step, network, recover, "Migrating devices");
        tool.run(self.class, step, dst, dom_name, recover).await
    }

    // Checkpointing

    /// Checkpoint proxies for the domain's replicated disks.
    ///
    /// Disks that are not replicated are skipped. `open` connects to the
    /// control channel of each replicated disk.
    pub async fn replicated_disks<C, F>(&self, mut open: F) -> Result<Vec<ReplicatedDisk<C>>>
    where
        C: DiskControl,
        F: FnMut(&Replication) -> checkpoint::Result<C>,
    {
        self.require_class(DeviceClass::Vbd)?;
        let mut disks = Vec::new();
        for devid in self.device_ids().await? {
            let kind = self.read_backend(devid, "type").await?.unwrap_or_default();
            let params = self.read_backend(devid, "params").await?.unwrap_or_default();
            let uname = format!("{}:{}", kind, params);
            let replication = match Replication::from_uname(&uname) {
                Ok(replication) => replication,
                Err(e) => {
                    debug!(class = %self.class, devid, error = %e, "Skipping disk");
                    continue;
                }
            };
            let control = open(&replication)?;
            disks.push(ReplicatedDisk::new(&uname, control)?);
        }
        Ok(disks)
    }

    /// Buffer the output of every network interface of the domain through
    /// a device claimed from `pool`.
    pub async fn buffered_nics<B, L, F>(
        &self,
        pool: &Arc<ResourcePool<L>>,
        mut buffer: F,
    ) -> Result<Vec<BufferedNic<B, L>>>
    where
        B: NetBuffer,
        L: Liveness,
        F: FnMut() -> B,
    {
        self.require_class(DeviceClass::Vif)?;
        let mut nics = Vec::new();
        for devid in self.device_ids().await? {
            let vif = match self.read_backend(devid, "vifname").await? {
                Some(name) => name,
                None => format!("vif{}.{}", self.domain.domid, devid),
            };
            nics.push(BufferedNic::new(vif, buffer(), Arc::clone(pool))?);
        }
        Ok(nics)
    }

    fn require_class(&self, class: DeviceClass) -> Result<()> {
        if self.class == class {
            return Ok(());
        }
        Err(DeviceError::invalid_config(
            self.class,
            format!("checkpoint proxies need {} devices", class),
        ))
    }

    // Device ids

    /// Allocate the next device id for this domain and class.
    pub async fn allocate_device_id(&self) -> Result<u32> {
        let path = join(&self.frontend_misc_path(), NEXT_DEVICE_ID);
        let policy = RetryPolicy::Bounded(self.ctx.options.transaction_retries);

        transact::<_, DeviceError, _>(self.store(), policy, |t, _| {
            let path = path.clone();
            Box::pin(async move {
                let current = match t.read(&path).await? {
                    Some(value) if !value.is_empty() => value.parse::<u32>().map_err(|_| {
                        StoreError::Internal(format!("corrupt device id counter {:?}", value))
                    })?,
                    _ => 0,
                };
                let next = current.checked_add(1).ok_or_else(|| {
                    StoreError::Internal("device id counter exhausted".to_string())
                })?;
                t.write(&path, &next.to_string()).await?;
                Ok(current)
            })
        })
        .await
    }

    /// Ids of all registered devices, ascending.
    pub async fn device_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .store()
            .list(&self.device_root())
            .await?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // Store accessors

    pub async fn read_vm(&self, devid: u32, key: &str) -> Result<Option<String>> {
        Ok(self.store().read_at(&self.device_path(devid), key).await?)
    }

    pub async fn read_frontend(&self, devid: u32, key: &str) -> Result<Option<String>> {
        Ok(self.store().read_at(&self.frontend_path(devid), key).await?)
    }

    async fn require_backend(&self, devid: u32) -> Result<String> {
        self.read_vm(devid, "backend")
            .await?
            .ok_or(DeviceError::DeviceNotConnected {
                class: self.class,
                devid,
            })
    }

    pub async fn read_backend(&self, devid: u32, key: &str) -> Result<Option<String>> {
        let backpath = self.require_backend(devid).await?;
        Ok(self.store().read_at(&backpath, key).await?)
    }

    /// Write `fields` below the backend of `devid` in one transaction.
    pub async fn write_backend(&self, devid: u32, fields: &Fields) -> Result<()> {
        self.update_backend(devid, fields, &[]).await
    }

    /// Write `fields` and remove `dropped` keys below the backend of `devid`
    /// in one transaction.
    pub async fn update_backend(&self, devid: u32, fields: &Fields, dropped: &[&str]) -> Result<()> {
        let backpath = self.require_backend(devid).await?;
        let dropped: Vec<String> = dropped.iter().map(|key| join(&backpath, key)).collect();
        let policy = RetryPolicy::Bounded(self.ctx.options.transaction_retries);

        transact::<_, DeviceError, _>(self.store(), policy, |t, _| {
            let backpath = backpath.clone();
            let fields = fields.clone();
            let dropped = dropped.clone();
            Box::pin(async move {
                for path in &dropped {
                    t.remove(path).await?;
                }
                t.write_fields(&backpath, &fields).await?;
                Ok(())
            })
        })
        .await
    }

    /// Remove `key` below the backend of `devid`, or the whole backend if
    /// `key` is empty.
    pub async fn remove_backend(&self, devid: u32, key: &str) -> Result<()> {
        let backpath = self.require_backend(devid).await?;
        Ok(self.store().remove(&join(&backpath, key)).await?)
    }
}
