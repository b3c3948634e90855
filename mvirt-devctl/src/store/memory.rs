//! In-memory store with optimistic transactions.
//!
//! Every mutation bumps a global generation and stamps the touched node (and
//! the parent of created or removed nodes) with it. A transaction remembers
//! the generation it started at plus every path it read, listed, or wrote;
//! commit fails if any of those paths was stamped later.
//!
//! Stamps are only kept while some open transaction could still conflict
//! with them: anything at or below the oldest open base generation is
//! pruned after each mutation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

use super::error::{Result, StoreError};
use super::event::Event;
use super::traits::{Permission, Store, Transaction};
use super::{is_descendant, parent};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    value: String,
    perms: Vec<Permission>,
}

#[derive(Debug, Clone)]
enum Op {
    Write { path: String, value: String },
    Mkdir { path: String },
    Remove { path: String },
    SetPermissions { path: String, perms: Vec<Permission> },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    modified: HashMap<String, u64>,
    generation: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                value: String::new(),
                perms: vec![Permission::owner(0)],
            },
        );
        Self {
            nodes,
            modified: HashMap::new(),
            generation: 0,
        }
    }

    fn read(&self, path: &str) -> Option<String> {
        self.nodes.get(path).map(|n| n.value.clone())
    }

    fn list(&self, path: &str) -> Vec<String> {
        if !self.nodes.contains_key(path) {
            return Vec::new();
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    /// Forget stamps no open transaction can conflict with.
    fn prune(&mut self, horizon: Option<u64>) {
        match horizon {
            None => self.modified.clear(),
            Some(base) => self.modified.retain(|_, generation| *generation > base),
        }
    }

    /// Node contents without stamps, for a transaction's private view.
    fn snapshot(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            modified: HashMap::new(),
            generation: self.generation,
        }
    }

    fn stamp(&mut self, path: &str) {
        self.modified.insert(path.to_string(), self.generation);
    }

    /// Create `path` and any missing ancestors. Returns true if `path` was new.
    fn ensure(&mut self, path: &str) -> bool {
        if self.nodes.contains_key(path) {
            return false;
        }
        let perms = match parent(path) {
            Some(p) => {
                self.ensure(p);
                self.stamp(p);
                self.nodes
                    .get(p)
                    .map(|n| n.perms.clone())
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };
        self.nodes.insert(
            path.to_string(),
            Node {
                value: String::new(),
                perms,
            },
        );
        self.stamp(path);
        true
    }

    fn apply(&mut self, op: &Op) -> Result<Option<Event>> {
        self.generation += 1;
        match op {
            Op::Write { path, value } => {
                self.ensure(path);
                if let Some(node) = self.nodes.get_mut(path) {
                    node.value = value.clone();
                }
                self.stamp(path);
                Ok(Some(Event::Written { path: path.clone() }))
            }
            Op::Mkdir { path } => {
                if self.ensure(path) {
                    Ok(Some(Event::Written { path: path.clone() }))
                } else {
                    Ok(None)
                }
            }
            Op::Remove { path } => {
                if path == "/" {
                    return Err(StoreError::InvalidPath(path.clone()));
                }
                if !self.nodes.contains_key(path) {
                    return Ok(None);
                }
                let doomed: Vec<String> = self
                    .nodes
                    .range(path.clone()..)
                    .take_while(|(k, _)| k.starts_with(path.as_str()))
                    .filter(|(k, _)| k.as_str() == path.as_str() || is_descendant(k, path))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    self.nodes.remove(&key);
                    self.stamp(&key);
                }
                if let Some(p) = parent(path) {
                    self.stamp(p);
                }
                Ok(Some(Event::Removed { path: path.clone() }))
            }
            Op::SetPermissions { path, perms } => {
                let node = self
                    .nodes
                    .get_mut(path)
                    .ok_or_else(|| StoreError::NotFound(path.clone()))?;
                node.perms = perms.clone();
                self.stamp(path);
                Ok(Some(Event::Written { path: path.clone() }))
            }
        }
    }
}

/// Base generations of open transactions, with a count per generation.
#[derive(Debug, Default)]
struct OpenTransactions(SyncMutex<BTreeMap<u64, usize>>);

impl OpenTransactions {
    fn register(&self, base: u64) {
        let mut open = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *open.entry(base).or_default() += 1;
    }

    fn release(&self, base: u64) {
        let mut open = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = open.get_mut(&base) {
            *count -= 1;
            if *count == 0 {
                open.remove(&base);
            }
        }
    }

    /// Oldest open base generation.
    fn horizon(&self) -> Option<u64> {
        let open = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        open.keys().next().copied()
    }
}

fn validate(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// In-process store implementation.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
    open: Arc<OpenTransactions>,
    events: broadcast::Sender<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            open: Arc::default(),
            events,
        }
    }

    /// Permission list of a node, if it exists.
    pub async fn permissions(&self, path: &str) -> Option<Vec<Permission>> {
        let tree = self.tree.lock().await;
        tree.nodes.get(path).map(|n| n.perms.clone())
    }

    async fn apply(&self, op: Op) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let event = tree.apply(&op)?;
        tree.prune(self.open.horizon());
        if let Some(event) = event {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tree = self.tree.lock().await;
        self.open.register(tree.generation);
        Ok(Box::new(MemoryTransaction {
            tree: Arc::clone(&self.tree),
            open: Arc::clone(&self.open),
            events: self.events.clone(),
            base: tree.generation,
            view: tree.snapshot(),
            ops: Vec::new(),
            touched: HashSet::new(),
            finished: false,
        }))
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        validate(path)?;
        Ok(self.tree.lock().await.read(path))
    }

    async fn write(&self, path: &str, value: &str) -> Result<()> {
        validate(path)?;
        self.apply(Op::Write {
            path: path.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        validate(path)?;
        self.apply(Op::Remove {
            path: path.to_string(),
        })
        .await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        validate(path)?;
        Ok(self.tree.lock().await.list(path))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

struct MemoryTransaction {
    tree: Arc<Mutex<Tree>>,
    open: Arc<OpenTransactions>,
    events: broadcast::Sender<Event>,
    base: u64,
    view: Tree,
    ops: Vec<Op>,
    touched: HashSet<String>,
    finished: bool,
}

impl MemoryTransaction {
    fn check(&mut self, path: &str) -> Result<()> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        validate(path)?;
        self.touched.insert(path.to_string());
        Ok(())
    }

    /// Mark the transaction finished and stop holding back pruning.
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.open.release(self.base);
        }
    }

    fn stage(&mut self, op: Op) -> Result<()> {
        self.view.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn read(&mut self, path: &str) -> Result<Option<String>> {
        self.check(path)?;
        Ok(self.view.read(path))
    }

    async fn write(&mut self, path: &str, value: &str) -> Result<()> {
        self.check(path)?;
        self.stage(Op::Write {
            path: path.to_string(),
            value: value.to_string(),
        })
    }

    async fn remove(&mut self, path: &str) -> Result<()> {
        self.check(path)?;
        self.stage(Op::Remove {
            path: path.to_string(),
        })
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        self.check(path)?;
        self.stage(Op::Mkdir {
            path: path.to_string(),
        })
    }

    async fn list(&mut self, path: &str) -> Result<Vec<String>> {
        self.check(path)?;
        Ok(self.view.list(path))
    }

    async fn set_permissions(&mut self, path: &str, perms: &[Permission]) -> Result<()> {
        self.check(path)?;
        self.stage(Op::SetPermissions {
            path: path.to_string(),
            perms: perms.to_vec(),
        })
    }

    async fn commit(&mut self) -> Result<bool> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }

        // Stay registered until the lock is held so no stamp we check is pruned.
        let shared = Arc::clone(&self.tree);
        let mut tree = shared.lock().await;
        self.finish();
        let conflicted = self
            .touched
            .iter()
            .any(|p| tree.modified.get(p).is_some_and(|g| *g > self.base));
        if conflicted {
            tree.prune(self.open.horizon());
            trace!(base = self.base, current = tree.generation, "transaction conflict");
            return Ok(false);
        }

        // Apply to a copy first so a failing op leaves the live tree untouched.
        let mut next = tree.clone();
        let mut events = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            if let Some(event) = next.apply(op)? {
                events.push(event);
            }
        }
        next.prune(self.open.horizon());
        *tree = next;
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(true)
    }

    async fn abort(&mut self) {
        self.finish();
        self.ops.clear();
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
