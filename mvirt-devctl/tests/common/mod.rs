//! Test helpers for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mvirt_devctl::store::{Event, MemoryStore, Store, join};
use mvirt_devctl::{Context, DevController, DeviceClass, Domain, DomainTable, Options};
use tokio::task::JoinHandle;

pub const GUEST_DOMID: u32 = 5;
pub const GUEST_VM_PATH: &str = "/vm/guest-5";

/// In-memory store with dom0 and one guest domain registered.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub domains: Arc<DomainTable>,
    pub ctx: Context,
    pub guest: Domain,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(Options::default()).await
    }

    pub async fn with_options(options: Options) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let domains = Arc::new(DomainTable::new());
        domains.insert(Domain::new(0, "Domain-0")).await;

        let guest = Domain::new(GUEST_DOMID, "guest").with_vm_path(GUEST_VM_PATH);
        domains.insert(guest.clone()).await;

        let ctx = Context::new(store.clone(), domains.clone(), options);
        Self {
            store,
            domains,
            ctx,
            guest,
        }
    }

    pub fn controller(&self, class: DeviceClass) -> DevController {
        DevController::new(self.ctx.clone(), self.guest.clone(), class)
    }

    pub async fn read(&self, path: &str) -> Option<String> {
        self.store.read(path).await.unwrap()
    }
}

/// What the fake hotplug agent reports for new backends.
#[derive(Debug, Clone, Copy)]
pub enum AgentReply {
    Connected,
    Error(&'static str),
    Busy,
}

/// Stand-in for the backend domain's hotplug agent.
///
/// Reports on every backend brought online and clears the status node when
/// a backend goes offline.
pub fn spawn_hotplug_agent(store: Arc<MemoryStore>, reply: AgentReply) -> JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let Event::Written { path } = event else {
                continue;
            };
            let Some(backpath) = path.strip_suffix("/online") else {
                continue;
            };
            if !backpath.contains("/backend/") {
                continue;
            }

            let status = join(backpath, "hotplug-status");
            match store.read(&path).await.unwrap().as_deref() {
                Some("1") => match reply {
                    AgentReply::Connected => store.write(&status, "connected").await.unwrap(),
                    AgentReply::Busy => store.write(&status, "busy").await.unwrap(),
                    AgentReply::Error(detail) => {
                        store
                            .write(&join(backpath, "hotplug-error"), detail)
                            .await
                            .unwrap();
                        store.write(&status, "error").await.unwrap();
                    }
                },
                Some("0") => store.remove(&status).await.unwrap(),
                _ => {}
            }
        }
    })
}
