//! Shared handles passed to every device controller.

use std::sync::Arc;

use crate::config::Options;
use crate::domain::DomainLookup;
use crate::error::Result;
use crate::migration::MigrationTool;
use crate::pool::{ResourcePool, netdevs_with_prefix};
use crate::store::Store;

const NETBUF_CLASS: &str = "ifb";

/// Store client, domain registry and options for a set of controllers.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub domains: Arc<dyn DomainLookup>,
    pub options: Arc<Options>,
}

impl Context {
    pub fn new(store: Arc<dyn Store>, domains: Arc<dyn DomainLookup>, options: Options) -> Self {
        Self {
            store,
            domains,
            options: Arc::new(options),
        }
    }

    /// The configured external migration tool, if any.
    pub fn migration_tool(&self) -> Option<MigrationTool> {
        self.options
            .external_migration_tool
            .as_ref()
            .map(MigrationTool::new)
    }

    /// Pool of host resources of `class` below the configured pool directory.
    pub fn resource_pool(
        &self,
        class: impl Into<String>,
        candidates: impl IntoIterator<Item = String>,
    ) -> ResourcePool {
        ResourcePool::new(&self.options.pool_dir, class, candidates)
    }

    /// Pool of the host's `ifb` devices, used to buffer checkpointed
    /// network output.
    pub fn netbuf_pool(&self) -> Result<ResourcePool> {
        Ok(self.resource_pool(NETBUF_CLASS, netdevs_with_prefix(&self.options.netdev_dir, NETBUF_CLASS)?))
    }
}
