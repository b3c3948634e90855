//! External device migration tool.
//!
//! Device migration is delegated to an external program, invoked once per
//! migration step as
//! `<tool> -type <class> -step <n> -host <dst> -domname <name> [-recover]`.
//! Its output is logged line by line and a non-zero exit fails the step.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use crate::class::DeviceClass;
use crate::error::{DeviceError, Result};

/// Phase of a device migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStep {
    /// Check whether the device can be migrated at all.
    Check = 0,
    /// Migration of the guest kernel has started.
    Start = 1,
    /// Guest is suspended; initiate the transfer and return without waiting
    /// for it to complete.
    Transfer = 2,
    /// Block until the transfer started in [`MigrationStep::Transfer`] is done.
    Finish = 3,
}

impl MigrationStep {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Check),
            1 => Some(Self::Start),
            2 => Some(Self::Transfer),
            3 => Some(Self::Finish),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Handle to the configured migration program.
#[derive(Debug, Clone)]
pub struct MigrationTool {
    path: PathBuf,
}

impl MigrationTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Command line arguments for one invocation.
    pub fn args(
        class: DeviceClass,
        step: MigrationStep,
        host: &str,
        dom_name: &str,
        recover: bool,
    ) -> Vec<String> {
        let mut args = vec![
            "-type".to_string(),
            class.name().to_string(),
            "-step".to_string(),
            step.number().to_string(),
            "-host".to_string(),
            host.to_string(),
            "-domname".to_string(),
            dom_name.to_string(),
        ];
        if recover {
            args.push("-recover".to_string());
        }
        args
    }

    /// Run the tool for one step and wait for it to exit.
    pub async fn run(
        &self,
        class: DeviceClass,
        step: MigrationStep,
        host: &str,
        dom_name: &str,
        recover: bool,
    ) -> Result<()> {
        info!(
            class = %class,
            step = %step,
            host,
            domain = dom_name,
            recover,
            "Calling external migration tool"
        );

        let spawn_err = |source| DeviceError::MigrationToolSpawn { class, source };

        let mut child = Command::new(&self.path)
            .args(Self::args(class, step, host, dom_name, recover))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(spawn_err)? {
                info!(class = %class, step = %step, "{}", line.trim_end());
            }
        }

        let status = child.wait().await.map_err(spawn_err)?;
        if !status.success() {
            // Killed by a signal has no exit code.
            let code = status.code().unwrap_or(-1);
            return Err(DeviceError::MigrationToolFailure { class, step, code });
        }
        Ok(())
    }
}
