#![allow(dead_code)]

use std::{
    fs,
    net::Ipv4Addr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tempfile::TempDir;
use wg_peer_manager::{
    config::{KeyBackend, ManagerConfig},
    control::{InterfaceControl, ServiceStatus},
    keys::{KeyPair, KeyPairProvider, NativeKeys},
    lifecycle::{CancelToken, PeerLifecycleManager},
    lock::ConfigLock,
    peer::{PeerName, PeerRecord},
    registry::{ClientRegistry, JsonFileRegistry},
    server_conf::ServerConfigDoc,
    Error, Result,
};

pub const SERVER_HEADER: &str = "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 51820\nPrivateKey = cHJpdmF0ZS1rZXktcGxhY2Vob2xkZXItZm9yLXRlc3Q=\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadFailure {
    Tool,
    Timeout,
}

/// Records every call; reload can be made to fail, to leave the service down, or to trip a cancel token.
#[derive(Default)]
pub struct FakeControl {
    pub calls: Mutex<Vec<String>>,
    pub reload_failure: Mutex<Option<ReloadFailure>>,
    pub cancel_on_reload: Mutex<Option<CancelToken>>,
    pub dump: Mutex<String>,
    pub inactive: AtomicBool,
}

impl FakeControl {
    pub fn fail_reloads(&self, failure: ReloadFailure) {
        *self.reload_failure.lock() = Some(failure);
    }

    pub fn set_inactive(&self, inactive: bool) {
        self.inactive.store(inactive, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        *self.reload_failure.lock() = None;
    }

    pub fn set_dump(&self, dump: &str) {
        *self.dump.lock() = dump.to_string();
    }

    pub fn reloads(&self) -> usize {
        self.calls.lock().iter().filter(|c| *c == "reload").count()
    }

    pub fn status_queries(&self) -> usize {
        self.calls.lock().iter().filter(|c| *c == "service_status").count()
    }

    fn call(&self, name: &str) {
        self.calls.lock().push(name.to_string());
    }
}

impl InterfaceControl for FakeControl {
    fn reload(&self) -> Result<()> {
        self.call("reload");
        if let Some(token) = self.cancel_on_reload.lock().take() {
            token.cancel();
        }
        match *self.reload_failure.lock() {
            Some(ReloadFailure::Tool) => {
                return Err(Error::ExternalTool {
                    command: "systemctl restart wg-quick@wg0".into(),
                    detail: "Job for wg-quick@wg0.service failed".into(),
                })
            }
            Some(ReloadFailure::Timeout) => {
                return Err(Error::Timeout {
                    command: "systemctl restart wg-quick@wg0".into(),
                    after: Duration::from_secs(10),
                })
            }
            None => {}
        }
        let status = self.service_status()?;
        if !status.is_active {
            return Err(Error::ExternalTool {
                command: "reload wg-quick@wg0".into(),
                detail: status.detail,
            });
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.call("start");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.call("stop");
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        self.call("restart");
        Ok(())
    }

    fn service_status(&self) -> Result<ServiceStatus> {
        self.call("service_status");
        let active = !self.inactive.load(Ordering::SeqCst);
        Ok(ServiceStatus {
            is_active: active,
            detail: if active { "Active: active (exited)" } else { "Active: failed" }.into(),
        })
    }

    fn peer_dump(&self) -> Result<String> {
        self.call("peer_dump");
        Ok(self.dump.lock().clone())
    }
}

pub struct FailingKeys;

impl KeyPairProvider for FailingKeys {
    fn generate_keypair(&self) -> Result<KeyPair> {
        Err(Error::ExternalTool {
            command: "wg genkey".into(),
            detail: "wg: command not found".into(),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub cfg: ManagerConfig,
    pub control: Arc<FakeControl>,
    pub registry: Arc<JsonFileRegistry>,
    pub manager: PeerLifecycleManager,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Manager over a temp dir with a `[Interface]`-only server config.
pub fn harness_with(tweak: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let server = NativeKeys.generate_keypair().unwrap();
    fs::write(root.join("server_private.key"), format!("{}\n", server.private_key)).unwrap();
    fs::write(root.join("wg0.conf"), SERVER_HEADER).unwrap();

    let mut cfg = ManagerConfig {
        server_config_path: root.join("wg0.conf"),
        server_private_key_path: root.join("server_private.key"),
        server_public_key_path: root.join("server_public.key"),
        clients_dir: root.join("clients"),
        registry_path: root.join("registry.json"),
        audit_log_path: root.join("audit.log"),
        sessions_path: root.join("sessions.json"),
        endpoint_host: "vpn.example.com".into(),
        key_backend: KeyBackend::Native,
        ..Default::default()
    };
    tweak(&mut cfg);

    let control = Arc::new(FakeControl::default());
    let registry = Arc::new(JsonFileRegistry::open(cfg.registry_path.clone()));
    let manager = build(&cfg, Arc::new(NativeKeys), registry.clone(), control.clone());
    Harness {
        dir,
        cfg,
        control,
        registry,
        manager,
    }
}

pub fn build(
    cfg: &ManagerConfig,
    keys: Arc<dyn KeyPairProvider>,
    registry: Arc<JsonFileRegistry>,
    control: Arc<FakeControl>,
) -> PeerLifecycleManager {
    PeerLifecycleManager::new(
        cfg.clone(),
        keys,
        registry,
        control,
        ConfigLock::for_file(&cfg.server_config_path),
    )
}

impl Harness {
    pub fn with_keys(&self, keys: Arc<dyn KeyPairProvider>) -> PeerLifecycleManager {
        build(&self.cfg, keys, self.registry.clone(), self.control.clone())
    }

    pub fn with_cancel(&self, cancel: CancelToken) -> PeerLifecycleManager {
        build(&self.cfg, Arc::new(NativeKeys), self.registry.clone(), self.control.clone())
            .with_cancel(cancel)
    }

    pub fn server_text(&self) -> String {
        fs::read_to_string(&self.cfg.server_config_path).unwrap()
    }

    pub fn server_doc(&self) -> ServerConfigDoc {
        ServerConfigDoc::parse(&self.server_text())
    }

    pub fn client_path(&self, name: &str) -> PathBuf {
        self.cfg.clients_dir.join(name).join(format!("{name}.conf"))
    }

    pub fn record(&self, name: &str) -> Option<PeerRecord> {
        self.registry.get(&peer(name)).unwrap()
    }

    pub fn stanza_address(&self, name: &str) -> Option<Ipv4Addr> {
        self.server_doc()
            .find(name)
            .and_then(|s| s.allowed_ips.first().cloned())
            .and_then(|ip| wg_peer_manager::server_conf::host_address(&ip))
    }

    pub fn audit_text(&self) -> String {
        fs::read_to_string(&self.cfg.audit_log_path).unwrap_or_default()
    }
}

pub fn peer(name: &str) -> PeerName {
    PeerName::parse(name).unwrap()
}
