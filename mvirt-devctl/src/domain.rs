//! Domains referenced by device controllers.
//!
//! Domains are created and destroyed by an external domain manager. The
//! controller only needs their ids, names and store paths, obtained through
//! [`DomainLookup`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Id of the privileged domain.
pub const DOM0_ID: u32 = 0;

/// A virtual machine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub domid: u32,
    pub name: String,
    /// Root of the domain's own subtree, e.g. `/local/domain/5`.
    pub dom_path: String,
    /// Root of the VM's persistent subtree, e.g. `/vm/<uuid>`.
    pub vm_path: String,
    /// Guest ABI written into frontends as `protocol`, if it differs from the
    /// backend's.
    pub native_protocol: Option<String>,
}

impl Domain {
    pub fn new(domid: u32, name: impl Into<String>) -> Self {
        Self {
            domid,
            name: name.into(),
            dom_path: format!("/local/domain/{}", domid),
            vm_path: format!("/vm/{}", Uuid::new_v4()),
            native_protocol: None,
        }
    }

    pub fn with_vm_path(mut self, vm_path: impl Into<String>) -> Self {
        self.vm_path = vm_path.into();
        self
    }

    pub fn with_native_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.native_protocol = Some(protocol.into());
        self
    }
}

/// Resolves backend domains named in device configurations.
#[async_trait]
pub trait DomainLookup: Send + Sync {
    /// Look up a domain by name or numeric id.
    async fn lookup(&self, name_or_id: &str) -> Option<Domain>;

    /// The privileged domain hosting backends by default.
    async fn privileged(&self) -> Option<Domain>;
}

/// In-memory domain registry.
#[derive(Default)]
pub struct DomainTable {
    domains: RwLock<HashMap<u32, Domain>>,
}

impl DomainTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, domain: Domain) {
        self.domains.write().await.insert(domain.domid, domain);
    }

    pub async fn remove(&self, domid: u32) -> Option<Domain> {
        self.domains.write().await.remove(&domid)
    }

    pub async fn get(&self, domid: u32) -> Option<Domain> {
        self.domains.read().await.get(&domid).cloned()
    }
}

#[async_trait]
impl DomainLookup for DomainTable {
    async fn lookup(&self, name_or_id: &str) -> Option<Domain> {
        let domains = self.domains.read().await;
        if let Ok(domid) = name_or_id.trim().parse::<u32>() {
            return domains.get(&domid).cloned();
        }
        domains.values().find(|d| d.name == name_or_id).cloned()
    }

    async fn privileged(&self) -> Option<Domain> {
        self.get(DOM0_ID).await
    }
}
