//! Store and transaction trait definitions.
//!
//! These traits abstract away the store client, allowing the controller to
//! work against a real store connection or the in-memory store in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::Result;
use super::event::Event;
use super::join;

/// Flat record of string keys to string values, written below one path.
pub type Fields = BTreeMap<String, String>;

/// One access-control entry of a node.
///
/// The first entry of a permission list names the owning domain; its flags
/// are the default access of every domain not listed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub domid: u32,
    pub read: bool,
    pub write: bool,
}

impl Permission {
    /// Owner entry granting no default access to other domains.
    pub fn owner(domid: u32) -> Self {
        Self {
            domid,
            read: false,
            write: false,
        }
    }

    /// Read-only access for `domid`.
    pub fn read(domid: u32) -> Self {
        Self {
            domid,
            read: true,
            write: false,
        }
    }
}

/// An open store transaction.
///
/// All writes become visible at once on [`Transaction::commit`]. A commit
/// returns `Ok(false)` when a concurrent change touched a path this
/// transaction read or wrote; the caller then starts over.
#[async_trait]
pub trait Transaction: Send {
    async fn read(&mut self, path: &str) -> Result<Option<String>>;

    async fn write(&mut self, path: &str, value: &str) -> Result<()>;

    /// Remove a node and its subtree. Missing nodes are not an error.
    async fn remove(&mut self, path: &str) -> Result<()>;

    /// Create an empty node unless it already exists.
    async fn mkdir(&mut self, path: &str) -> Result<()>;

    /// Names of the direct children of `path`, empty if it does not exist.
    async fn list(&mut self, path: &str) -> Result<Vec<String>>;

    async fn set_permissions(&mut self, path: &str, perms: &[Permission]) -> Result<()>;

    /// Commit, returning `false` on conflict.
    async fn commit(&mut self) -> Result<bool>;

    async fn abort(&mut self);

    /// Write every entry of `fields` below `base`.
    async fn write_fields(&mut self, base: &str, fields: &Fields) -> Result<()> {
        for (key, value) in fields {
            self.write(&join(base, key), value).await?;
        }
        Ok(())
    }
}

/// Hierarchical, watchable key-value store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    async fn read(&self, path: &str) -> Result<Option<String>>;

    async fn write(&self, path: &str, value: &str) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to change events.
    ///
    /// Every change to the store is broadcast; watches filter by path.
    fn subscribe(&self) -> broadcast::Receiver<Event>;

    /// Whether a node exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path).await?.is_some())
    }

    /// Read `key` relative to `base`.
    async fn read_at(&self, base: &str, key: &str) -> Result<Option<String>> {
        self.read(&join(base, key)).await
    }

    /// All values below `path`, keyed by path relative to `path`.
    async fn list_recursive(&self, path: &str) -> Result<Fields> {
        let mut out = Fields::new();
        let mut pending = vec![String::new()];
        while let Some(rel) = pending.pop() {
            let abs = join(path, &rel);
            for child in self.list(&abs).await? {
                let child_rel = if rel.is_empty() {
                    child.clone()
                } else {
                    format!("{}/{}", rel, child)
                };
                if let Some(value) = self.read(&join(path, &child_rel)).await? {
                    out.insert(child_rel.clone(), value);
                }
                pending.push(child_rel);
            }
        }
        Ok(out)
    }
}
