//! End-to-end device lifecycle against the in-memory store.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{AgentReply, GUEST_VM_PATH, Harness, spawn_hotplug_agent};
use mvirt_devctl::migration::MigrationStep;
use mvirt_devctl::store::{self, Event, MemoryStore, Permission, Store, StoreError, Transaction};
use mvirt_devctl::{
    Context, DevController, DeviceClass, DeviceConfig, DeviceError, Domain, HotplugAction,
    Options,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const VIF_BACKEND: &str = "/local/domain/0/backend/vif/5/0";

fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Empty) => return seen,
            Err(e) => panic!("unexpected receive error: {}", e),
        }
    }
}

fn disk(dev: &str) -> DeviceConfig {
    DeviceConfig::new()
        .with("dev", dev)
        .with("uname", "phy:/dev/vg0/guest-root")
        .with("mode", "w")
}

#[tokio::test]
async fn test_vif_create_and_connect() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Connected);
    let ctl = h.controller(DeviceClass::Vif);

    let config = DeviceConfig::new()
        .with("mac", "00:16:3e:00:00:01")
        .with("bridge", "xenbr0");
    let devid = ctl.create_device(&config).await.unwrap();
    assert_eq!(devid, 0);

    assert_eq!(ctl.backend_path(&Domain::new(0, "Domain-0"), devid), VIF_BACKEND);
    let backend = h.store.list_recursive(VIF_BACKEND).await.unwrap();
    assert_eq!(backend["online"], "1");
    assert_eq!(backend["state"], "1");
    assert_eq!(backend["domain"], "guest");
    assert_eq!(backend["frontend"], "/local/domain/5/device/vif/0");
    assert_eq!(backend["frontend-id"], "5");
    assert_eq!(backend["mac"], "00:16:3e:00:00:01");
    assert_eq!(backend["bridge"], "xenbr0");
    assert_eq!(backend["script"], "vif-bridge");
    assert_eq!(backend["handle"], "0");

    let frontend = h.store.list_recursive("/local/domain/5/device/vif/0").await.unwrap();
    assert_eq!(frontend["backend"], VIF_BACKEND);
    assert_eq!(frontend["backend-id"], "0");
    assert_eq!(frontend["state"], "1");
    assert_eq!(frontend["mac"], "00:16:3e:00:00:01");
    assert!(!frontend.contains_key("protocol"));

    let record = format!("{}/device/vif/0", GUEST_VM_PATH);
    assert_eq!(h.read(&format!("{}/backend", record)).await.unwrap(), VIF_BACKEND);
    assert_eq!(h.read(&format!("{}/frontend-id", record)).await.unwrap(), "5");

    ctl.wait_for_device(devid).await.unwrap();
    assert_eq!(
        h.read(&format!("{}/hotplug-status", VIF_BACKEND)).await.unwrap(),
        "connected"
    );

    agent.abort();
}

#[tokio::test]
async fn test_create_twice_already_connected() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);

    assert_eq!(ctl.create_device(&disk("xvda")).await.unwrap(), 51712);
    let err = ctl.create_device(&disk("xvda")).await.unwrap_err();

    assert!(matches!(
        &err,
        DeviceError::AlreadyConnected { class: DeviceClass::Vbd, devid: 51712, name: Some(name) }
            if name == "xvda"
    ));
    assert_eq!(err.to_string(), "device xvda (51712, vbd) is already connected");
}

#[tokio::test]
async fn test_device_ids_increase_per_class() {
    let h = Harness::new().await;
    let vif = h.controller(DeviceClass::Vif);
    let console = h.controller(DeviceClass::Console);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(vif.create_device(&DeviceConfig::new()).await.unwrap());
    }
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(console.create_device(&DeviceConfig::new()).await.unwrap(), 0);

    // Removing a device never hands its id out again.
    vif.destroy_device(2, true).await.unwrap();
    assert_eq!(vif.allocate_device_id().await.unwrap(), 3);
    assert_eq!(vif.device_ids().await.unwrap(), vec![0, 1]);
    assert_eq!(
        h.read("/local/domain/5/device-misc/vif/nextDeviceID").await.unwrap(),
        "4"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation() {
    let h = Harness::new().await;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ctl = h.controller(DeviceClass::Vif);
            tokio::spawn(async move { ctl.allocate_device_id().await })
        })
        .collect();

    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }
    assert_eq!(ids, (0..8).collect::<BTreeSet<u32>>());
    assert_eq!(
        h.read("/local/domain/5/device-misc/vif/nextDeviceID").await.unwrap(),
        "8"
    );
}

#[tokio::test]
async fn test_exhausted_device_id_counter() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vif);
    let counter = format!("{}/nextDeviceID", ctl.frontend_misc_path());
    h.store.write(&counter, &u32::MAX.to_string()).await.unwrap();

    assert!(matches!(
        ctl.allocate_device_id().await,
        Err(DeviceError::Store(StoreError::Internal(_)))
    ));
    assert_eq!(h.read(&counter).await.unwrap(), u32::MAX.to_string());

    assert!(matches!(
        ctl.create_device(&DeviceConfig::new()).await,
        Err(DeviceError::Store(_))
    ));
    assert!(ctl.device_ids().await.unwrap().is_empty());
}

/// Store whose first commit of a transaction listing `root` races with
/// another writer adding a device under `root`.
struct InterferingStore {
    inner: Arc<MemoryStore>,
    root: String,
    interfered: Arc<AtomicBool>,
    commits: Arc<AtomicU32>,
}

struct InterferingTransaction {
    inner: Box<dyn Transaction>,
    store: Arc<MemoryStore>,
    root: String,
    listed_root: bool,
    interfered: Arc<AtomicBool>,
    commits: Arc<AtomicU32>,
}

#[async_trait]
impl Store for InterferingStore {
    async fn begin(&self) -> store::Result<Box<dyn Transaction>> {
        Ok(Box::new(InterferingTransaction {
            inner: self.inner.begin().await?,
            store: Arc::clone(&self.inner),
            root: self.root.clone(),
            listed_root: false,
            interfered: Arc::clone(&self.interfered),
            commits: Arc::clone(&self.commits),
        }))
    }

    async fn read(&self, path: &str) -> store::Result<Option<String>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, value: &str) -> store::Result<()> {
        self.inner.write(path, value).await
    }

    async fn remove(&self, path: &str) -> store::Result<()> {
        self.inner.remove(path).await
    }

    async fn list(&self, path: &str) -> store::Result<Vec<String>> {
        self.inner.list(path).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.subscribe()
    }
}

#[async_trait]
impl Transaction for InterferingTransaction {
    async fn read(&mut self, path: &str) -> store::Result<Option<String>> {
        self.inner.read(path).await
    }

    async fn write(&mut self, path: &str, value: &str) -> store::Result<()> {
        self.inner.write(path, value).await
    }

    async fn remove(&mut self, path: &str) -> store::Result<()> {
        self.inner.remove(path).await
    }

    async fn mkdir(&mut self, path: &str) -> store::Result<()> {
        self.inner.mkdir(path).await
    }

    async fn list(&mut self, path: &str) -> store::Result<Vec<String>> {
        if path == self.root {
            self.listed_root = true;
        }
        self.inner.list(path).await
    }

    async fn set_permissions(&mut self, path: &str, perms: &[Permission]) -> store::Result<()> {
        self.inner.set_permissions(path, perms).await
    }

    async fn commit(&mut self) -> store::Result<bool> {
        if self.listed_root {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if !self.interfered.swap(true, Ordering::SeqCst) {
                self.store
                    .write(&format!("{}/99/backend", self.root), "/elsewhere")
                    .await?;
            }
        }
        self.inner.commit().await
    }

    async fn abort(&mut self) {
        self.inner.abort().await
    }
}

#[tokio::test]
async fn test_create_retries_after_commit_conflict() {
    let h = Harness::new().await;
    let commits = Arc::new(AtomicU32::new(0));
    let store = InterferingStore {
        inner: h.store.clone(),
        root: format!("{}/device/vif", GUEST_VM_PATH),
        interfered: Arc::new(AtomicBool::new(false)),
        commits: Arc::clone(&commits),
    };
    let ctx = Context::new(Arc::new(store), h.domains.clone(), Options::default());
    let ctl = DevController::new(ctx, h.guest.clone(), DeviceClass::Vif);

    let config = DeviceConfig::new().with("mac", "00:16:3e:00:00:07");
    assert_eq!(ctl.create_device(&config).await.unwrap(), 0);

    assert_eq!(commits.load(Ordering::SeqCst), 2);
    assert_eq!(ctl.device_ids().await.unwrap(), vec![0, 99]);
    assert_eq!(
        h.read(&format!("{}/mac", VIF_BACKEND)).await.unwrap(),
        "00:16:3e:00:00:07"
    );
}

#[tokio::test]
async fn test_destroy_clears_online_before_closing() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl.create_device(&disk("xvdb")).await.unwrap();
    let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();

    let mut events = h.store.subscribe();
    ctl.destroy_device(devid, false).await.unwrap();

    let written: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            Event::Written { path } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(
        written,
        vec![format!("{}/online", backpath), format!("{}/state", backpath)]
    );
    assert_eq!(h.read(&format!("{}/online", backpath)).await.unwrap(), "0");
    assert_eq!(h.read(&format!("{}/state", backpath)).await.unwrap(), "5");

    // Not forced: the records stay.
    assert_eq!(ctl.device_ids().await.unwrap(), vec![devid]);
}

#[tokio::test]
async fn test_forced_destroy_with_vanished_backend() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl.create_device(&disk("xvdc")).await.unwrap();
    let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();

    h.store.remove(&backpath).await.unwrap();
    ctl.destroy_device(format!("vbd/{}", devid), true).await.unwrap();

    assert!(h.read(&backpath).await.is_none());
    assert!(h.read(&ctl.frontend_path(devid)).await.is_none());
    assert!(h.read(&ctl.device_path(devid)).await.is_none());

    // Destroying again is harmless when forced, an error otherwise.
    ctl.destroy_device(devid, true).await.unwrap();
    assert!(matches!(
        ctl.destroy_device(devid, false).await,
        Err(DeviceError::DeviceNotConnected { .. })
    ));
}

#[tokio::test]
async fn test_configuration_round_trip() {
    let h = Harness::new().await;

    let cases = [
        (DeviceClass::Vbd, disk("xvda").with("bootable", "1")),
        (DeviceClass::Vbd, DeviceConfig::new().with("dev", "hdc:cdrom")),
        (
            DeviceClass::Vif,
            DeviceConfig::new()
                .with("mac", "00:16:3e:12:34:56")
                .with("bridge", "xenbr1")
                .with("rate", "10Mb/s"),
        ),
        (DeviceClass::Console, DeviceConfig::new().with("location", "2")),
        (
            DeviceClass::Vfb,
            DeviceConfig::new()
                .with("vnc", "1")
                .with("vnclisten", "127.0.0.1")
                .with("keymap", "de"),
        ),
    ];

    for (class, config) in cases {
        let ctl = h.controller(class);
        let devid = ctl.create_device(&config).await.unwrap();
        let first = ctl.configuration(devid).await.unwrap();
        assert_eq!(first.get("backend"), Some("0"), "{}", class);
        for (key, value) in config.iter() {
            assert_eq!(first.get(key), Some(value), "{} {}", class, key);
        }

        ctl.destroy_device(devid, true).await.unwrap();
        let devid = ctl.create_device(&first).await.unwrap();
        let second = ctl.configuration(devid).await.unwrap();
        assert_eq!(first, second, "{}", class);
    }
}

#[tokio::test]
async fn test_configurations_list_all_devices() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Console);
    ctl.create_device(&DeviceConfig::new()).await.unwrap();
    ctl.create_device(&DeviceConfig::new().with("protocol", "raw"))
        .await
        .unwrap();

    let configs = ctl.configurations().await.unwrap();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].get("protocol"), Some("vt100"));
    assert_eq!(configs[1].get("protocol"), Some("raw"));

    let raw = ctl.all_device_configurations().await.unwrap();
    assert_eq!(raw.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(raw[&1], DeviceConfig::new().with("backend", "0"));

    let tree = ctl.frontend_tree().await.unwrap();
    assert_eq!(tree["0/backend-id"], "0");
    assert_eq!(tree["1/state"], "1");
}

#[tokio::test(start_paused = true)]
async fn test_hotplug_timeout_tears_down() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl.create_device(&disk("xvda")).await.unwrap();
    let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();

    let start = tokio::time::Instant::now();
    let err = ctl.wait_for_device(devid).await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_secs(100));
    assert!(matches!(
        err,
        DeviceError::HotplugTimeout {
            class: DeviceClass::Vbd,
            devid: 51712,
            action: HotplugAction::Connect
        }
    ));
    assert_eq!(h.read(&format!("{}/online", backpath)).await.unwrap(), "0");
    assert_eq!(h.read(&format!("{}/state", backpath)).await.unwrap(), "5");
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_is_configurable() {
    let options = Options {
        device_create_timeout_secs: 3,
        ..Options::default()
    };
    let h = Harness::with_options(options).await;
    let ctl = h.controller(DeviceClass::Vif);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();

    let start = tokio::time::Instant::now();
    assert!(ctl.wait_for_device(devid).await.is_err());
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test]
async fn test_hotplug_error_carries_detail() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Error("losetup failed"));
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl.create_device(&disk("xvda")).await.unwrap();

    let err = ctl.wait_for_device(devid).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "device 51712 (vbd) could not be connected: losetup failed"
    );
    assert_eq!(
        ctl.read_backend(devid, "online").await.unwrap().as_deref(),
        Some("0")
    );

    agent.abort();
}

#[tokio::test]
async fn test_hotplug_busy() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Busy);
    let ctl = h.controller(DeviceClass::Vif);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();

    let err = ctl.wait_for_device(devid).await.unwrap_err();
    assert!(matches!(err, DeviceError::HotplugBusy { detail: None, .. }));

    agent.abort();
}

#[tokio::test]
async fn test_wait_for_unknown_device_is_missing() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);

    let err = ctl.wait_for_device(768).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::DeviceNotFound {
            class: DeviceClass::Vbd,
            devid: 768
        }
    ));
}

#[tokio::test]
async fn test_wait_for_devices() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Connected);
    let ctl = h.controller(DeviceClass::Vbd);
    ctl.create_device(&disk("xvda")).await.unwrap();
    ctl.create_device(&disk("xvdb")).await.unwrap();

    ctl.wait_for_devices().await.unwrap();

    agent.abort();
}

#[tokio::test]
async fn test_wait_for_devices_tears_down_every_failure() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Error("no such device"));
    let ctl = h.controller(DeviceClass::Vbd);
    ctl.create_device(&disk("xvda")).await.unwrap();
    ctl.create_device(&disk("xvdb")).await.unwrap();

    let err = ctl.wait_for_devices().await.unwrap_err();
    assert!(matches!(err, DeviceError::HotplugError { devid: 51712, .. }));

    for devid in ctl.device_ids().await.unwrap() {
        let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();
        assert_eq!(h.read(&format!("{}/online", backpath)).await.unwrap(), "0");
        assert_eq!(h.read(&format!("{}/state", backpath)).await.unwrap(), "5");
    }

    agent.abort();
}

#[tokio::test]
async fn test_hotplug_disabled_skips_wait() {
    let h = Harness::new().await;
    let console = h.controller(DeviceClass::Console);
    let devid = console.create_device(&DeviceConfig::new()).await.unwrap();
    console.wait_for_device(devid).await.unwrap();

    let mut vbd = h.controller(DeviceClass::Vbd);
    vbd.set_hotplug(false);
    let devid = vbd.create_device(&disk("xvda")).await.unwrap();
    vbd.wait_for_device(devid).await.unwrap();
}

#[tokio::test]
async fn test_phantom_error_reported() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl.create_device(&disk("xvda")).await.unwrap();

    let phantom = "/local/domain/0/backend/vbd/5/51728";
    h.store
        .write(&format!("{}/phantom_vbd", ctl.frontend_path(devid)), phantom)
        .await
        .unwrap();
    h.store
        .write(&format!("{}/hotplug-error", phantom), "tapdisk exited")
        .await
        .unwrap();
    h.store
        .write(&format!("{}/hotplug-status", phantom), "error")
        .await
        .unwrap();

    let err = ctl.wait_for_device(devid).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::HotplugError { detail: Some(ref d), .. } if d == "tapdisk exited"
    ));
}

#[tokio::test]
async fn test_wait_for_device_destroy() {
    let h = Harness::new().await;
    let agent = spawn_hotplug_agent(h.store.clone(), AgentReply::Connected);
    let ctl = h.controller(DeviceClass::Vif);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();
    ctl.wait_for_device(devid).await.unwrap();

    let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();
    ctl.destroy_device(devid, false).await.unwrap();
    ctl.wait_for_device_destroy(devid, &backpath).await.unwrap();
    assert!(h.read(&format!("{}/hotplug-status", backpath)).await.is_none());

    agent.abort();
}

#[tokio::test(start_paused = true)]
async fn test_destroy_wait_times_out() {
    let options = Options {
        device_destroy_timeout_secs: 7,
        ..Options::default()
    };
    let h = Harness::with_options(options).await;
    let ctl = h.controller(DeviceClass::Vif);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();
    let backpath = ctl.read_vm(devid, "backend").await.unwrap().unwrap();

    // Connected, but nobody reacts to the teardown.
    h.store
        .write(&format!("{}/hotplug-status", backpath), "connected")
        .await
        .unwrap();
    ctl.destroy_device(devid, false).await.unwrap();

    let start = tokio::time::Instant::now();
    let err = ctl.wait_for_device_destroy(devid, &backpath).await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert!(matches!(
        err,
        DeviceError::HotplugTimeout {
            class: DeviceClass::Vif,
            devid: 0,
            action: HotplugAction::Disconnect
        }
    ));
}

#[tokio::test]
async fn test_reconfigure_unsupported() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Console);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();

    let err = ctl
        .reconfigure_device(devid, &DeviceConfig::new().with("protocol", "raw"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "console devices may not be reconfigured (device 0)");
}

#[tokio::test]
async fn test_vif_reconfigure() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vif);
    let config = DeviceConfig::new()
        .with("mac", "00:16:3e:00:00:02")
        .with("bridge", "xenbr0")
        .with("ip", "10.0.0.2");
    let devid = ctl.create_device(&config).await.unwrap();

    let update = DeviceConfig::new().with("bridge", "xenbr1");
    ctl.reconfigure_device(devid, &update).await.unwrap();

    assert_eq!(ctl.read_backend(devid, "bridge").await.unwrap().as_deref(), Some("xenbr1"));
    assert_eq!(ctl.read_backend(devid, "ip").await.unwrap(), None);
    assert_eq!(
        ctl.read_backend(devid, "mac").await.unwrap().as_deref(),
        Some("00:16:3e:00:00:02")
    );

    let change_mac = DeviceConfig::new().with("mac", "00:16:3e:00:00:03");
    assert!(matches!(
        ctl.reconfigure_device(devid, &change_mac).await,
        Err(DeviceError::InvalidConfig { .. })
    ));

    // The backend acknowledges by returning to Connected.
    ctl.write_backend(devid, &[("state".to_string(), "4".to_string())].into())
        .await
        .unwrap();
    ctl.wait_for_device_reconfigure(devid).await.unwrap();
}

#[tokio::test]
async fn test_update_backend_in_one_commit() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vif);
    let config = DeviceConfig::new()
        .with("bridge", "xenbr0")
        .with("ip", "10.0.0.2");
    let devid = ctl.create_device(&config).await.unwrap();

    let mut events = h.store.subscribe();
    ctl.update_backend(devid, &[("bridge".to_string(), "xenbr2".to_string())].into(), &["ip", "rate"])
        .await
        .unwrap();
    assert_eq!(
        drain(&mut events),
        vec![
            Event::Removed {
                path: format!("{}/ip", VIF_BACKEND)
            },
            Event::Written {
                path: format!("{}/bridge", VIF_BACKEND)
            },
        ]
    );

    ctl.remove_backend(devid, "bridge").await.unwrap();
    assert_eq!(ctl.read_backend(devid, "bridge").await.unwrap(), None);
    assert!(matches!(
        ctl.remove_backend(7, "bridge").await,
        Err(DeviceError::DeviceNotConnected { devid: 7, .. })
    ));
}

#[tokio::test]
async fn test_cdrom_media_change() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    let devid = ctl
        .create_device(&DeviceConfig::new().with("dev", "hdc:cdrom"))
        .await
        .unwrap();

    let insert = DeviceConfig::new()
        .with("dev", "hdc:cdrom")
        .with("uname", "file:/isos/install.iso");
    ctl.reconfigure_device(devid, &insert).await.unwrap();
    assert_eq!(ctl.read_backend(devid, "type").await.unwrap().as_deref(), Some("file"));
    assert_eq!(
        ctl.read_backend(devid, "params").await.unwrap().as_deref(),
        Some("/isos/install.iso")
    );

    let disk_ctl = h.controller(DeviceClass::Vbd);
    let disk_id = disk_ctl.create_device(&disk("xvda")).await.unwrap();
    assert!(matches!(
        disk_ctl.reconfigure_device(disk_id, &insert).await,
        Err(DeviceError::InvalidConfig { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_wait_times_out() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vif);
    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();

    let err = ctl.wait_for_device_reconfigure(devid).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::HotplugTimeout {
            action: HotplugAction::Reconfigure,
            ..
        }
    ));
}

#[tokio::test]
async fn test_backend_domain_resolution() {
    let h = Harness::new().await;
    h.domains.insert(Domain::new(3, "netdom")).await;
    let ctl = h.controller(DeviceClass::Vif);

    let devid = ctl
        .create_device(&DeviceConfig::new().with("backend", "netdom"))
        .await
        .unwrap();
    assert_eq!(
        ctl.read_vm(devid, "backend").await.unwrap().as_deref(),
        Some("/local/domain/3/backend/vif/5/0")
    );
    assert_eq!(
        ctl.configuration(devid).await.unwrap().get("backend"),
        Some("3")
    );

    let err = ctl
        .create_device(&DeviceConfig::new().with("backend", "nosuch"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::BackendUnresolved { .. }));
}

#[tokio::test]
async fn test_frontend_protocol() {
    let h = Harness::new().await;
    let guest = h.guest.clone().with_native_protocol("x86_32-abi");
    let ctl = mvirt_devctl::DevController::new(h.ctx.clone(), guest, DeviceClass::Vbd);

    let devid = ctl.create_device(&disk("xvda")).await.unwrap();
    assert_eq!(
        ctl.read_frontend(devid, "protocol").await.unwrap().as_deref(),
        Some("x86_32-abi")
    );
}

#[tokio::test]
async fn test_vfb_without_display_creates_nothing() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vfb);

    let devid = ctl.create_device(&DeviceConfig::new()).await.unwrap();
    assert_eq!(devid, 0);
    assert!(ctl.device_ids().await.unwrap().is_empty());
    assert!(h.read("/local/domain/5/device").await.is_none());
}

#[tokio::test]
async fn test_migrate_without_tool() {
    let h = Harness::new().await;
    let ctl = h.controller(DeviceClass::Vbd);
    ctl.migrate(true, "dst.example", MigrationStep::Check, "guest")
        .await
        .unwrap();
    ctl.recover_migrate(true, "dst.example", MigrationStep::Transfer, "guest")
        .await
        .unwrap();
}
