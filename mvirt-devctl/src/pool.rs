//! Host-wide resource pools.
//!
//! A pool hands out named host resources (for example `ifb` network devices
//! used for checkpoint buffering) to processes on the same host. Each pool
//! keeps an allocation table at `<pool_dir>/<class>` with one `<name> <pid>`
//! line per claimed resource. Every get and put holds an exclusive `flock` on
//! `<pool_dir>/<class>.lock` while it reads, updates and saves the table.
//!
//! Claims whose owning process has exited are reclaimed on the next get.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to lock pool table: {0}")]
    Lock(Errno),

    #[error("no free {class} resources")]
    Exhausted { class: String },

    #[error("corrupt pool table {}: {line:?}", .path.display())]
    Corrupt { path: PathBuf, line: String },
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Decides whether the process that claimed a resource is still running.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Checks liveness with a null signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Allocation table for one resource class.
pub struct ResourcePool<L = ProcessLiveness> {
    class: String,
    dir: PathBuf,
    candidates: Vec<String>,
    liveness: L,
}

impl ResourcePool<ProcessLiveness> {
    pub fn new(
        dir: impl Into<PathBuf>,
        class: impl Into<String>,
        candidates: impl IntoIterator<Item = String>,
    ) -> Self {
        Self::with_liveness(dir, class, candidates, ProcessLiveness)
    }
}

impl<L: Liveness> ResourcePool<L> {
    pub fn with_liveness(
        dir: impl Into<PathBuf>,
        class: impl Into<String>,
        candidates: impl IntoIterator<Item = String>,
        liveness: L,
    ) -> Self {
        Self {
            class: class.into(),
            dir: dir.into(),
            candidates: candidates.into_iter().collect(),
            liveness,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn table_path(&self) -> PathBuf {
        self.dir.join(&self.class)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.class))
    }

    /// Claim a free resource for the calling process.
    pub fn get(&self) -> Result<String> {
        self.get_for(std::process::id())
    }

    /// Claim a free resource on behalf of `pid`.
    pub fn get_for(&self, pid: u32) -> Result<String> {
        let _lock = self.lock()?;
        let path = self.table_path();
        let mut table = load_table(&path)?;

        let mut chosen = None;
        for name in &self.candidates {
            match table.get(name) {
                None => {
                    chosen = Some(name.clone());
                    break;
                }
                Some(&owner) if !self.liveness.is_alive(owner) => {
                    info!(class = %self.class, name, owner, "Reclaiming resource from dead owner");
                    chosen = Some(name.clone());
                    break;
                }
                Some(_) => {}
            }
        }

        let name = chosen.ok_or_else(|| PoolError::Exhausted {
            class: self.class.clone(),
        })?;
        table.insert(name.clone(), pid);
        save_table(&path, &table)?;

        debug!(class = %self.class, name, pid, "Resource claimed");
        Ok(name)
    }

    /// Return a resource to the pool. Unknown names are ignored.
    pub fn put(&self, name: &str) -> Result<()> {
        let _lock = self.lock()?;
        let path = self.table_path();
        let mut table = load_table(&path)?;

        if table.remove(name).is_none() {
            warn!(class = %self.class, name, "Released resource was not claimed");
            return Ok(());
        }
        save_table(&path, &table)?;

        debug!(class = %self.class, name, "Resource released");
        Ok(())
    }

    /// Current claims, by resource name.
    pub fn claims(&self) -> Result<BTreeMap<String, u32>> {
        let _lock = self.lock()?;
        load_table(&self.table_path())
    }

    fn lock(&self) -> Result<Flock<File>> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| PoolError::Lock(errno))
    }
}

fn load_table(path: &Path) -> Result<BTreeMap<String, u32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut table = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let corrupt = || PoolError::Corrupt {
            path: path.to_path_buf(),
            line: line.to_string(),
        };
        let (name, pid) = line.split_once(char::is_whitespace).ok_or_else(corrupt)?;
        let pid = pid.trim().parse::<u32>().map_err(|_| corrupt())?;
        table.insert(name.to_string(), pid);
    }
    Ok(table)
}

fn save_table(path: &Path, table: &BTreeMap<String, u32>) -> Result<()> {
    let mut out = String::new();
    for (name, pid) in table {
        out.push_str(&format!("{} {}\n", name, pid));
    }
    fs::write(path, out)?;
    Ok(())
}

/// Names of network devices listed in `dir` (normally `/sys/class/net`)
/// that start with `prefix`, sorted.
pub fn netdevs_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
