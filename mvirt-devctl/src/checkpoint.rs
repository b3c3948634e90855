//! Checkpoint hooks for continuously replicated domains.
//!
//! While a domain is being checkpointed, every protected device gets three
//! callbacks per round: after the guest is suspended, before it resumes, and
//! once the backup has acknowledged the checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pool::{Liveness, PoolError, ProcessLiveness, ResourcePool};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("{device}: {reason}")]
    Device { device: String, reason: String },

    #[error("{device}: {source}")]
    Io {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("disk {uname:?} is not replicated")]
    NotReplicated { uname: String },

    #[error("network buffer {bufdev}: {reason}")]
    Buffer { bufdev: String, reason: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// A device that takes part in checkpoint rounds.
pub trait CheckpointedDevice: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called after the guest is suspended.
    fn postsuspend(&mut self) -> Result<()>;

    /// Called before the guest is resumed.
    fn preresume(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once the backup has acknowledged the checkpoint.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ordered collection of checkpointed devices.
///
/// Each hook runs on every device in registration order and stops at the
/// first error.
#[derive(Default)]
pub struct CheckpointSet {
    devices: Vec<Box<dyn CheckpointedDevice>>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: Box<dyn CheckpointedDevice>) {
        self.devices.push(device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn postsuspend(&mut self) -> Result<()> {
        self.each("postsuspend", |d| d.postsuspend())
    }

    pub fn preresume(&mut self) -> Result<()> {
        self.each("preresume", |d| d.preresume())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.each("commit", |d| d.commit())
    }

    fn each<F>(&mut self, hook: &'static str, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn CheckpointedDevice) -> Result<()>,
    {
        for device in &mut self.devices {
            if let Err(e) = f(device.as_mut()) {
                warn!(device = device.name(), hook, error = %e, "Checkpoint hook failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

/// How a replicated disk is told about checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    /// Tap disk with a control fifo and a `.msg` reply fifo.
    Tap { fifo: String },
    /// DRBD resource running the checkpointing protocol.
    Drbd { resource: String },
}

impl Replication {
    /// Replication channel of a disk given as `<type>:<params>`.
    pub fn from_uname(uname: &str) -> Result<Self> {
        let not_replicated = || CheckpointError::NotReplicated {
            uname: uname.to_string(),
        };

        if let Some(resource) = uname.strip_prefix("drbd:") {
            if resource.is_empty() {
                return Err(not_replicated());
            }
            return Ok(Replication::Drbd {
                resource: resource.to_string(),
            });
        }

        if !(uname.starts_with("tap:remus:") || uname.starts_with("tap:tapdisk:remus:")) {
            return Err(not_replicated());
        }
        // tap:remus:<host>:<port>|<inner disk>
        let head = &uname[..uname.rfind('|').ok_or_else(not_replicated)?];
        let start = head.rfind("remus").ok_or_else(not_replicated)?;
        Ok(Replication::Tap {
            fifo: head[start..].replace(':', "_"),
        })
    }
}

/// Checkpoint control channel of a replicated disk.
pub trait DiskControl: Send {
    /// Tell a tap disk to flush the current epoch to the backup.
    fn flush(&mut self) -> Result<()>;

    /// Ask DRBD to send a checkpoint. Returns true if it was acknowledged
    /// right away.
    fn send_checkpoint(&mut self) -> Result<bool>;

    /// Block until DRBD acknowledges the last checkpoint.
    fn wait_checkpoint_ack(&mut self) -> Result<()>;

    /// Next reply from a tap disk, normally `done`.
    fn read_message(&mut self) -> Result<String>;

    /// Release the channel.
    fn close(&mut self) {}
}

/// Control fifos of a replicated tap disk.
pub struct TapFifo {
    path: PathBuf,
    ctl: File,
    msg: File,
}

impl TapFifo {
    /// Open `<dir>/<fifo>` and its `.msg` reply fifo.
    pub fn open(dir: &Path, fifo: &str) -> Result<Self> {
        let path = dir.join(fifo);
        let msg_path = dir.join(format!("{}.msg", fifo));
        let open = |p: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(p)
                .map_err(|source| CheckpointError::Io {
                    device: p.display().to_string(),
                    source,
                })
        };
        Ok(Self {
            ctl: open(&path)?,
            msg: open(&msg_path)?,
            path,
        })
    }

    fn io_err(&self, source: io::Error) -> CheckpointError {
        CheckpointError::Io {
            device: self.path.display().to_string(),
            source,
        }
    }

    fn unsupported(&self) -> CheckpointError {
        CheckpointError::Device {
            device: self.path.display().to_string(),
            reason: "tap disks do not take checkpoint ioctls".to_string(),
        }
    }
}

impl DiskControl for TapFifo {
    fn flush(&mut self) -> Result<()> {
        self.ctl.write_all(b"flush").map_err(|e| self.io_err(e))
    }

    fn send_checkpoint(&mut self) -> Result<bool> {
        Err(self.unsupported())
    }

    fn wait_checkpoint_ack(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    fn read_message(&mut self) -> Result<String> {
        let mut buf = [0u8; 4];
        let n = self.msg.read(&mut buf).map_err(|e| self.io_err(e))?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}

/// Sends checkpoint messages to a replicated disk while the guest is paused
/// between epochs.
pub struct ReplicatedDisk<C: DiskControl> {
    name: String,
    replication: Replication,
    control: Option<C>,
    ackwait: bool,
}

impl<C: DiskControl> ReplicatedDisk<C> {
    pub fn new(uname: &str, control: C) -> Result<Self> {
        let replication = Replication::from_uname(uname)?;
        info!(uname, "Replicating disk");
        Ok(Self {
            name: format!("disk:{}", uname),
            replication,
            control: Some(control),
            ackwait: false,
        })
    }

    pub fn replication(&self) -> &Replication {
        &self.replication
    }

    /// True while a DRBD checkpoint has been sent but not acknowledged.
    pub fn awaiting_ack(&self) -> bool {
        self.ackwait
    }

    fn control(&mut self) -> Result<&mut C> {
        let name = &self.name;
        self.control.as_mut().ok_or_else(|| CheckpointError::Device {
            device: name.clone(),
            reason: "control channel closed".to_string(),
        })
    }

    /// Close the control channel. Later hooks fail.
    pub fn uninstall(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.close();
            debug!(device = %self.name, "Disk control channel closed");
        }
    }
}

impl<C: DiskControl> CheckpointedDevice for ReplicatedDisk<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn postsuspend(&mut self) -> Result<()> {
        match self.replication {
            Replication::Tap { .. } => self.control()?.flush(),
            Replication::Drbd { .. } => {
                if !self.ackwait {
                    let acked = self.control()?.send_checkpoint()?;
                    self.ackwait = !acked;
                }
                Ok(())
            }
        }
    }

    fn preresume(&mut self) -> Result<()> {
        if matches!(self.replication, Replication::Drbd { .. }) && self.ackwait {
            self.control()?.wait_checkpoint_ack()?;
            self.ackwait = false;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if matches!(self.replication, Replication::Tap { .. }) {
            let msg = self.control()?.read_message()?;
            if msg != "done" {
                warn!(device = %self.name, msg, "Unknown message from replicated disk");
            }
        }
        Ok(())
    }
}

impl<C: DiskControl> Drop for ReplicatedDisk<C> {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Message sent to an installed plug queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugAction {
    /// Start buffering output of the new epoch.
    Checkpoint,
    /// Release output buffered up to the last checkpoint.
    Release,
}

/// Traffic control operations on a buffer device.
///
/// Implemented by the host networking layer; the checkpoint code only
/// sequences the calls.
pub trait NetBuffer: Send {
    /// Redirect outbound traffic of `vif` through `bufdev`.
    fn attach(&mut self, bufdev: &str, vif: &str) -> Result<()>;

    /// Install the plug queue on `bufdev`.
    fn install(&mut self, bufdev: &str) -> Result<()>;

    fn send(&mut self, bufdev: &str, action: PlugAction) -> Result<()>;

    /// Remove the plug queue from `bufdev`.
    fn uninstall(&mut self, bufdev: &str) -> Result<()>;

    /// Undo [`NetBuffer::attach`].
    fn detach(&mut self, bufdev: &str) -> Result<()>;
}

/// Buffers a protected domain's network output between checkpoints, so that
/// nothing leaves the host that a failover would not know about.
pub struct BufferedNic<B: NetBuffer, L: Liveness = ProcessLiveness> {
    vif: String,
    name: String,
    bufdev: Option<String>,
    installed: bool,
    buffer: B,
    pool: Arc<ResourcePool<L>>,
}

impl<B: NetBuffer, L: Liveness> BufferedNic<B, L> {
    /// Claim a buffer device from `pool` and attach it to `vif`.
    pub fn new(vif: impl Into<String>, mut buffer: B, pool: Arc<ResourcePool<L>>) -> Result<Self> {
        let vif = vif.into();
        let bufdev = pool.get()?;

        if let Err(e) = buffer.attach(&bufdev, &vif) {
            if let Err(put_err) = pool.put(&bufdev) {
                warn!(bufdev, error = %put_err, "Failed to return buffer device");
            }
            return Err(e);
        }

        info!(vif, bufdev, "Buffering network output");
        Ok(Self {
            name: format!("netbuf:{}", vif),
            vif,
            bufdev: Some(bufdev),
            installed: false,
            buffer,
            pool,
        })
    }

    pub fn vif(&self) -> &str {
        &self.vif
    }

    pub fn bufdev(&self) -> Option<&str> {
        self.bufdev.as_deref()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    fn bufdev_or_err(&self) -> Result<String> {
        self.bufdev.clone().ok_or_else(|| CheckpointError::Device {
            device: self.name.clone(),
            reason: "buffer already uninstalled".to_string(),
        })
    }

    /// Remove the plug and return the buffer device to the pool.
    ///
    /// Traffic control failures are logged and ignored.
    pub fn uninstall(&mut self) -> Result<()> {
        let Some(bufdev) = self.bufdev.take() else {
            return Ok(());
        };

        if self.installed {
            if let Err(e) = self.buffer.uninstall(&bufdev) {
                warn!(bufdev, error = %e, "Failed to remove plug queue");
            }
            self.installed = false;
        }
        if let Err(e) = self.buffer.detach(&bufdev) {
            warn!(bufdev, error = %e, "Failed to detach buffer device");
        }

        debug!(vif = %self.vif, bufdev, "Buffer device released");
        self.pool.put(&bufdev)?;
        Ok(())
    }
}

impl<B: NetBuffer, L: Liveness> CheckpointedDevice for BufferedNic<B, L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn postsuspend(&mut self) -> Result<()> {
        let bufdev = self.bufdev_or_err()?;
        if !self.installed {
            self.buffer.install(&bufdev)?;
            self.installed = true;
        }
        self.buffer.send(&bufdev, PlugAction::Checkpoint)
    }

    fn commit(&mut self) -> Result<()> {
        let bufdev = self.bufdev_or_err()?;
        self.buffer.send(&bufdev, PlugAction::Release)
    }
}

impl<B: NetBuffer, L: Liveness> Drop for BufferedNic<B, L> {
    fn drop(&mut self) {
        if let Err(e) = self.uninstall() {
            warn!(vif = %self.vif, error = %e, "Failed to uninstall network buffer");
        }
    }
}
