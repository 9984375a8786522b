//! Peer lifecycle orchestration.
//!
//! The manager is the only writer of the registry, the client config files and the server
//! configuration. Every mutating operation runs as a sequence of [`Stage`]s; each applied
//! side effect is journaled and undone in reverse order when a later stage fails or the
//! operation is cancelled between stages.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use log::{debug, error, info, warn};

use crate::{
    allocator::AddressPool,
    audit::AuditLog,
    client_conf::{render_client_config, ClientIdentity, ClientStore, ServerParams},
    config::{KeyBackend, ManagerConfig},
    control::{InterfaceControl, SystemdInterface},
    error::{Error, Result},
    keys::{self, KeyPair, KeyPairProvider, NativeKeys, WgToolKeys},
    lock::{ConfigGuard, ConfigLock},
    peer::{PeerName, PeerRecord, PeerRequest, ProvisionState},
    reconciler::{RemoveOutcome, ServerConfigReconciler},
    registry::{ClientRegistry, JsonFileRegistry},
    server_conf::ServerConfigDoc,
    sessions::SessionLog,
    status::{PeerStatus, StatusInspector},
};

const USAGE_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
    Activate,
    Deactivate,
    Block,
    Unblock,
    Regenerate,
    Reconcile,
    Usage,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Activate => "activate",
            Operation::Deactivate => "deactivate",
            Operation::Block => "block",
            Operation::Unblock => "unblock",
            Operation::Regenerate => "regenerate",
            Operation::Reconcile => "reconcile",
            Operation::Usage => "usage",
        })
    }
}

/// Stages of the lifecycle state machines. A failure is tagged with the stage that was
/// being entered when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Requested,
    KeysGenerated,
    AddressAllocated,
    ClientConfigWritten,
    ServerConfigUpdated,
    ServerConfigPeerRemoved,
    InterfaceReloaded,
    FilesRemoved,
    Committed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Requested => "requested",
            Stage::KeysGenerated => "keys-generated",
            Stage::AddressAllocated => "address-allocated",
            Stage::ClientConfigWritten => "client-config-written",
            Stage::ServerConfigUpdated => "server-config-updated",
            Stage::ServerConfigPeerRemoved => "server-config-peer-removed",
            Stage::InterfaceReloaded => "interface-reloaded",
            Stage::FilesRemoved => "files-removed",
            Stage::Committed => "committed",
        })
    }
}

/// Cooperative cancellation, checked between stages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A freshly provisioned peer and the artifacts handed to outer layers.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub record: PeerRecord,
    pub config_path: PathBuf,
    pub client_config: String,
}

#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub record: PeerRecord,
    pub stanza_found: bool,
    pub client_file_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Crash after all artifacts were written; record promoted.
    CommittedPending(String),
    /// Crash mid-create; leftovers removed.
    RolledBackPending(String),
    /// Registry said routable, server config had no stanza; record marked inactive.
    Quarantined(String),
    /// Blocked peer still present in the server config; stanza removed.
    BlockedStanzaRemoved(String),
    /// Inactive record with a live stanza; record marked active.
    Reactivated(String),
    /// Stanza and record disagree on the public key; left for the operator.
    KeyMismatch(String),
    /// Tagged stanza with no registry record; left for the operator.
    OrphanStanza(String),
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::CommittedPending(n) => write!(f, "{n}: pending record committed"),
            ReconcileAction::RolledBackPending(n) => write!(f, "{n}: pending record rolled back"),
            ReconcileAction::Quarantined(n) => write!(f, "{n}: no stanza, marked inactive"),
            ReconcileAction::BlockedStanzaRemoved(n) => write!(f, "{n}: blocked, stanza removed"),
            ReconcileAction::Reactivated(n) => write!(f, "{n}: stanza present, marked active"),
            ReconcileAction::KeyMismatch(n) => write!(f, "{n}: public key differs from stanza (left untouched)"),
            ReconcileAction::OrphanStanza(n) => write!(f, "{n}: stanza without registry record (left untouched)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub actions: Vec<ReconcileAction>,
    pub reloaded: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Side effects applied so far, in order; undone in reverse.
enum Undo {
    RemoveRecord(PeerName),
    RemoveClientFile(PeerName),
    RestoreClientFile(PeerName, String),
    RemoveStanza { label: String, public_key: String },
    RestoreServerConfig(ServerConfigDoc),
}

#[derive(Default)]
struct Journal {
    steps: Vec<Undo>,
    reload_attempted: bool,
}

impl Journal {
    fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }
}

pub struct PeerLifecycleManager {
    cfg: ManagerConfig,
    keys: Arc<dyn KeyPairProvider>,
    registry: Arc<dyn ClientRegistry>,
    reconciler: ServerConfigReconciler,
    status: StatusInspector,
    control: Arc<dyn InterfaceControl>,
    clients: ClientStore,
    lock: ConfigLock,
    pool: AddressPool,
    audit: AuditLog,
    sessions: SessionLog,
    cancel: CancelToken,
}

impl PeerLifecycleManager {
    pub fn new(
        cfg: ManagerConfig,
        keys: Arc<dyn KeyPairProvider>,
        registry: Arc<dyn ClientRegistry>,
        control: Arc<dyn InterfaceControl>,
        lock: ConfigLock,
    ) -> Self {
        Self {
            reconciler: ServerConfigReconciler::new(cfg.server_config_path.clone(), control.clone()),
            status: StatusInspector::new(control.clone(), cfg.status_backend, cfg.interface_name.clone()),
            clients: ClientStore::new(cfg.clients_dir.clone()),
            pool: AddressPool::new(cfg.subnet, cfg.server_address),
            audit: AuditLog::new(cfg.audit_log_path.clone()),
            sessions: SessionLog::open(cfg.sessions_path.clone()),
            cancel: CancelToken::default(),
            keys,
            registry,
            control,
            lock,
            cfg,
        }
    }

    /// Production wiring: systemd + wg tools, JSON registry, cross-process config lock.
    pub fn from_config(cfg: ManagerConfig) -> Self {
        let keys: Arc<dyn KeyPairProvider> = match cfg.key_backend {
            KeyBackend::WgTool => Arc::new(WgToolKeys::new(cfg.command_timeout())),
            KeyBackend::Native => Arc::new(NativeKeys),
        };
        let registry = Arc::new(JsonFileRegistry::open(cfg.registry_path.clone()));
        let control = Arc::new(SystemdInterface::from_config(&cfg));
        let lock = ConfigLock::for_file(&cfg.server_config_path);
        Self::new(cfg, keys, registry, control, lock)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &dyn ClientRegistry {
        self.registry.as_ref()
    }

    pub fn status(&self) -> &StatusInspector {
        &self.status
    }

    pub fn control(&self) -> &dyn InterfaceControl {
        self.control.as_ref()
    }

    pub fn clients(&self) -> &ClientStore {
        &self.clients
    }

    pub fn sessions(&self) -> &SessionLog {
        &self.sessions
    }

    fn server_params(&self) -> Result<ServerParams> {
        Ok(ServerParams {
            public_key: self.cfg.server_public_key()?,
            endpoint: self.cfg.endpoint(),
            dns: self.cfg.dns.clone(),
            persistent_keepalive: self.cfg.persistent_keepalive,
        })
    }

    fn checkpoint(&self, stage: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        Ok(())
    }

    /// Cancellation check plus stage tagging around one stage body.
    fn stage<T>(&self, op: Operation, stage: Stage, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.checkpoint(stage)
            .and_then(|()| body())
            .map_err(|e| Error::stage(op, stage, e))
    }


    /**
     * @brief Provision a new peer: keys, address, client file, server stanza, reload, commit.
     * On any failure every artifact written so far is removed again before the error returns.
     * @param req Name and optional metadata.
     * @return The committed record and the rendered client config.
     */
    pub fn create(&self, req: PeerRequest) -> Result<Provisioned> {
        let op = Operation::Create;
        let name = req.name.clone();
        if let Some(email) = req.email.as_deref() {
            if !email.contains('@') {
                return Err(Error::Validation(format!("'{email}' is not an email address")));
            }
        }
        if self.registry.get(&name)?.is_some() {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }
        let server = self.server_params().map_err(|e| Error::stage(op, Stage::Requested, e))?;

        let pair = self.stage(op, Stage::KeysGenerated, || self.keys.generate_keypair())?;
        debug!("generated keys for {name} ({}...)", keys::short(&pair.public_key));

        let guard = self.lock.acquire()?;
        let address = self.stage(op, Stage::AddressAllocated, || {
            let doc = self.reconciler.read(&guard)?;
            if doc.find(name.as_str()).is_some() {
                return Err(Error::DuplicateName {
                    name: name.to_string(),
                });
            }
            self.pool.next_available(&doc.used_addresses(&self.pool.subnet))
        })?;

        let mut journal = Journal::default();
        match self.create_stages(&guard, &req, &pair, address, &server, &mut journal) {
            Ok(provisioned) => {
                info!("Created peer {name} at {address}");
                self.audit.record(
                    "create",
                    &format!("{name} {address} key={}...", keys::short(&pair.public_key)),
                );
                Ok(provisioned)
            }
            Err(e) => {
                warn!("create {name} failed, rolling back: {e}");
                self.rollback(&guard, journal);
                Err(e)
            }
        }
    }

    fn create_stages(
        &self,
        guard: &ConfigGuard<'_>,
        req: &PeerRequest,
        pair: &KeyPair,
        address: Ipv4Net,
        server: &ServerParams,
        journal: &mut Journal,
    ) -> Result<Provisioned> {
        let op = Operation::Create;
        let name = &req.name;

        let (pending, client_config, config_path) = self.stage(op, Stage::ClientConfigWritten, || {
            // Intent first, inactive, so a crash from here on is visible to `reconcile`.
            let pending = self.registry.insert(PeerRecord {
                name: name.clone(),
                public_key: pair.public_key.clone(),
                address,
                created_at: Utc::now(),
                expires_at: req.expires_at,
                is_active: false,
                is_blocked: false,
                data_used: 0,
                data_limit: req.data_limit,
                last_connection: None,
                owner_id: req.owner_id,
                email: req.email.clone(),
                provision: ProvisionState::Pending,
                counter_snapshot: None,
                revision: 0,
            })?;
            journal.push(Undo::RemoveRecord(name.clone()));

            let identity = ClientIdentity {
                private_key: pair.private_key.clone(),
                address,
            };
            let text = render_client_config(&identity, server);
            let path = self.clients.write(name, &text)?;
            journal.push(Undo::RemoveClientFile(name.clone()));
            Ok((pending, text, path))
        })?;

        self.stage(op, Stage::ServerConfigUpdated, || {
            self.reconciler
                .append_stanza(guard, &pair.public_key, &address.to_string(), name.as_str())?;
            journal.push(Undo::RemoveStanza {
                label: name.to_string(),
                public_key: pair.public_key.clone(),
            });
            Ok(())
        })?;

        self.stage(op, Stage::InterfaceReloaded, || {
            journal.reload_attempted = true;
            self.reconciler.reload(guard)
        })?;

        let record = self.stage(op, Stage::Committed, || {
            let mut committed = pending;
            committed.provision = ProvisionState::Committed;
            committed.is_active = true;
            self.registry.update(committed)
        })?;

        Ok(Provisioned {
            record,
            config_path,
            client_config,
        })
    }

    /**
     * @brief Remove a peer: stanza, reload, client files, then the registry record.
     * The interface stops routing the peer before any file of it disappears.
     */
    pub fn delete(&self, name: &PeerName) -> Result<DeleteReport> {
        let op = Operation::Delete;
        let record = self.registry.require(name)?;
        let guard = self.lock.acquire()?;
        let mut journal = Journal::default();

        match self.delete_stages(&guard, &record, &mut journal) {
            Ok(report) => {
                info!("Deleted peer {name}");
                if let Err(e) = self.sessions.purge(name) {
                    warn!("dropping session history of {name}: {e}");
                }
                self.audit.record(
                    "delete",
                    &format!("{name} {} data_used={}", record.address, record.data_used),
                );
                Ok(report)
            }
            Err(e) => {
                warn!("{op} {name} failed, restoring: {e}");
                self.rollback(&guard, journal);
                Err(e)
            }
        }
    }

    fn delete_stages(&self, guard: &ConfigGuard<'_>, record: &PeerRecord, journal: &mut Journal) -> Result<DeleteReport> {
        let op = Operation::Delete;
        let name = &record.name;

        let stanza_found = self.stage(op, Stage::ServerConfigPeerRemoved, || {
            let before = self.reconciler.read(guard)?;
            match self.reconciler.remove_stanza(guard, name.as_str(), &record.public_key)? {
                RemoveOutcome::Removed => {
                    journal.push(Undo::RestoreServerConfig(before));
                    Ok(true)
                }
                RemoveOutcome::NotFound => {
                    if record.is_routable() && record.provision == ProvisionState::Committed {
                        warn!("{}", Error::Drift(format!("no stanza for active peer {name}; treating as removed")));
                    }
                    Ok(false)
                }
            }
        })?;

        if stanza_found {
            self.stage(op, Stage::InterfaceReloaded, || {
                journal.reload_attempted = true;
                self.reconciler.reload(guard)
            })?;
        }

        let client_file_removed = self.stage(op, Stage::FilesRemoved, || {
            let saved = match self.clients.read(name) {
                Ok(text) => Some(text),
                Err(Error::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let removed = self.clients.remove(name)?;
            if let Some(text) = saved {
                journal.push(Undo::RestoreClientFile(name.clone(), text));
            }
            Ok(removed)
        })?;

        self.stage(op, Stage::Committed, || {
            self.registry.remove(name)?;
            Ok(())
        })?;

        Ok(DeleteReport {
            record: record.clone(),
            stanza_found,
            client_file_removed,
        })
    }

    pub fn activate(&self, name: &PeerName) -> Result<PeerRecord> {
        self.update_flags(name, Operation::Activate, |r| r.is_active = true)
    }

    pub fn deactivate(&self, name: &PeerName) -> Result<PeerRecord> {
        self.update_flags(name, Operation::Deactivate, |r| r.is_active = false)
    }

    pub fn block(&self, name: &PeerName) -> Result<PeerRecord> {
        self.update_flags(name, Operation::Block, |r| r.is_blocked = true)
    }

    pub fn unblock(&self, name: &PeerName) -> Result<PeerRecord> {
        self.update_flags(name, Operation::Unblock, |r| r.is_blocked = false)
    }

    /**
     * @brief Flip registry flags and bring the server config in line with them.
     * The stanza exists iff the peer is active and not blocked.
     */
    fn update_flags(&self, name: &PeerName, op: Operation, change: impl FnOnce(&mut PeerRecord)) -> Result<PeerRecord> {
        let record = self.registry.require(name)?;
        if record.provision == ProvisionState::Pending {
            return Err(Error::Validation(format!(
                "peer {name} is still being provisioned; run reconcile first"
            )));
        }
        let mut next = record.clone();
        change(&mut next);
        if next == record {
            return Ok(record);
        }

        let guard = self.lock.acquire()?;
        let mut journal = Journal::default();
        let result = match (record.is_routable(), next.is_routable()) {
            (false, true) => self.attach(&guard, op, next, &mut journal),
            (true, false) => self.detach(&guard, op, next, &mut journal),
            _ => self.stage(op, Stage::Committed, || self.registry.update(next)),
        };

        match result {
            Ok(updated) => {
                info!("{op} {name}: now {}", updated.state_label());
                self.audit.record(&op.to_string(), &format!("{name} {}", updated.state_label()));
                Ok(updated)
            }
            Err(e) => {
                warn!("{op} {name} failed, rolling back: {e}");
                self.rollback(&guard, journal);
                Err(e)
            }
        }
    }

    /// Put the peer back into the server config, moving it if its address was reused.
    fn attach(&self, guard: &ConfigGuard<'_>, op: Operation, mut next: PeerRecord, journal: &mut Journal) -> Result<PeerRecord> {
        let name = next.name.clone();
        let doc = self.stage(op, Stage::AddressAllocated, || self.reconciler.read(guard))?;

        let already = doc
            .find(name.as_str())
            .is_some_and(|s| s.public_key.as_deref() == Some(next.public_key.as_str()));
        if !already {
            let used = doc.used_addresses(&self.pool.subnet);
            if used.contains(&next.address.addr()) || !self.pool.subnet.contains(&next.address.addr()) {
                let moved = self.stage(op, Stage::AddressAllocated, || self.pool.next_available(&used))?;
                self.stage(op, Stage::ClientConfigWritten, || {
                    let server = self.server_params()?;
                    let old = self.clients.read(&name)?;
                    let mut identity = self.clients.read_identity(&name)?;
                    identity.address = moved;
                    self.clients.write(&name, &render_client_config(&identity, &server))?;
                    journal.push(Undo::RestoreClientFile(name.clone(), old));
                    Ok(())
                })?;
                info!("{name}: address {} was reused, moved to {moved}", next.address);
                next.address = moved;
            }

            self.stage(op, Stage::ServerConfigUpdated, || {
                self.reconciler
                    .append_stanza(guard, &next.public_key, &next.address.to_string(), name.as_str())?;
                journal.push(Undo::RemoveStanza {
                    label: name.to_string(),
                    public_key: next.public_key.clone(),
                });
                Ok(())
            })?;
            self.stage(op, Stage::InterfaceReloaded, || {
                journal.reload_attempted = true;
                self.reconciler.reload(guard)
            })?;
        }

        self.stage(op, Stage::Committed, || self.registry.update(next))
    }

    /// Take the peer out of the server config so the interface stops routing it.
    fn detach(&self, guard: &ConfigGuard<'_>, op: Operation, next: PeerRecord, journal: &mut Journal) -> Result<PeerRecord> {
        let name = next.name.clone();
        let removed = self.stage(op, Stage::ServerConfigPeerRemoved, || {
            let before = self.reconciler.read(guard)?;
            let outcome = self.reconciler.remove_stanza(guard, name.as_str(), &next.public_key)?;
            if outcome == RemoveOutcome::Removed {
                journal.push(Undo::RestoreServerConfig(before));
            } else {
                warn!("{}", Error::Drift(format!("no stanza for {name}; already detached")));
            }
            Ok(outcome == RemoveOutcome::Removed)
        })?;
        if removed {
            self.stage(op, Stage::InterfaceReloaded, || {
                journal.reload_attempted = true;
                self.reconciler.reload(guard)
            })?;
        }
        self.stage(op, Stage::Committed, || self.registry.update(next))
    }

    fn rollback(&self, guard: &ConfigGuard<'_>, journal: Journal) {
        let mut server_config_touched = false;
        for step in journal.steps.into_iter().rev() {
            let (what, result) = match step {
                Undo::RemoveRecord(name) => (
                    format!("remove record {name}"),
                    self.registry.remove(&name).map(|_| ()),
                ),
                Undo::RemoveClientFile(name) => (
                    format!("remove client config {name}"),
                    self.clients.remove(&name).map(|_| ()),
                ),
                Undo::RestoreClientFile(name, text) => (
                    format!("restore client config {name}"),
                    self.clients.write(&name, &text).map(|_| ()),
                ),
                Undo::RemoveStanza { label, public_key } => {
                    server_config_touched = true;
                    (
                        format!("remove stanza {label}"),
                        self.reconciler
                            .remove_stanza(guard, &label, &public_key)
                            .map(|_| ()),
                    )
                }
                Undo::RestoreServerConfig(doc) => {
                    server_config_touched = true;
                    ("restore server config".to_string(), self.reconciler.restore(guard, &doc))
                }
            };
            match result {
                Ok(()) => debug!("rollback: {what}"),
                Err(e) => error!("rollback: {what} failed: {e}"),
            }
        }
        if server_config_touched && journal.reload_attempted {
            if let Err(e) = self.reconciler.reload(guard) {
                error!("rollback: reload after restoring server config failed: {e}");
            }
        }
    }

    /// Render the client config from the stored identity and current server parameters.
    pub fn client_config(&self, name: &PeerName) -> Result<String> {
        let record = self.registry.require(name)?;
        let mut identity = self.clients.read_identity(name)?;
        if identity.address != record.address {
            warn!(
                "{}",
                Error::Drift(format!(
                    "{name}: client file has {}, registry has {}",
                    identity.address, record.address
                ))
            );
            identity.address = record.address;
        }
        Ok(render_client_config(&identity, &self.server_params()?))
    }

    /// Rewrite the client file, e.g. after the endpoint or DNS changed.
    pub fn regenerate(&self, name: &PeerName) -> Result<PathBuf> {
        let text = self
            .client_config(name)
            .map_err(|e| Error::stage(Operation::Regenerate, Stage::ClientConfigWritten, e))?;
        let path = self
            .clients
            .write(name, &text)
            .map_err(|e| Error::stage(Operation::Regenerate, Stage::ClientConfigWritten, e))?;
        self.audit.record("regenerate", name.as_str());
        Ok(path)
    }

    /**
     * @brief Add transferred bytes to a peer's usage.
     * @param rx Bytes received since the last report.
     * @param tx Bytes sent since the last report.
     */
    pub fn record_usage(&self, name: &PeerName, rx: u64, tx: u64) -> Result<PeerRecord> {
        self.update_usage(name, |r| r.add_usage(rx.saturating_add(tx), Utc::now()))
    }

    /**
     * @brief Account an interface counter reading for a peer.
     * A reading below the previous snapshot means the interface restarted and counts
     * from zero again, so the whole reading is new traffic.
     */
    pub fn account_counters(&self, name: &PeerName, total: u64, at: DateTime<Utc>) -> Result<PeerRecord> {
        self.update_usage(name, |r| {
            let delta = match r.counter_snapshot {
                Some(prev) if total >= prev => total - prev,
                _ => total,
            };
            r.add_usage(delta, at);
            r.counter_snapshot = Some(total);
        })
    }

    fn update_usage(&self, name: &PeerName, change: impl Fn(&mut PeerRecord)) -> Result<PeerRecord> {
        let mut last = None;
        for _ in 0..USAGE_RETRIES {
            let mut record = self.registry.require(name)?;
            change(&mut record);
            match self.registry.update(record) {
                Ok(r) => return Ok(r),
                Err(e @ Error::Conflict { .. }) => {
                    debug!("usage update for {name} raced, retrying: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(Error::stage(Operation::Usage, Stage::Committed, e)),
            }
        }
        Err(Error::stage(
            Operation::Usage,
            Stage::Committed,
            last.unwrap_or_else(|| Error::Registry("usage update retries exhausted".into())),
        ))
    }

    /// Live peers paired with the registry name owning each public key.
    pub fn peer_statuses(&self) -> Result<Vec<(Option<PeerName>, PeerStatus)>> {
        let by_key: HashMap<String, PeerName> = self
            .registry
            .list()?
            .into_iter()
            .map(|r| (r.public_key, r.name))
            .collect();
        Ok(self
            .status
            .list_active_peers()?
            .into_iter()
            .map(|p| (by_key.get(&p.public_key).cloned(), p))
            .collect())
    }

    /**
     * @brief Compare registry and server config and repair what a crash can leave behind.
     * The server config stanza is treated as ground truth, except that a blocked peer is
     * always removed from it. Ambiguous cases are reported and left alone.
     */
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let op = Operation::Reconcile;
        let guard = self.lock.acquire()?;
        let mut report = ReconcileReport::default();
        let mut doc = self.reconciler.read(&guard).map_err(|e| Error::stage(op, Stage::Requested, e))?;
        let original = doc.clone();
        let records = self.registry.list()?;
        let mut record_updates = Vec::new();
        let mut record_removals = Vec::new();
        let mut client_removals = Vec::new();

        for record in &records {
            let name = record.name.as_str();
            let stanza = doc.find(name).cloned();
            let key_matches = stanza
                .as_ref()
                .is_some_and(|s| s.public_key.as_deref() == Some(record.public_key.as_str()));

            if stanza.is_some() && !key_matches {
                warn!("{}", Error::Drift(format!("{name}: stanza key differs from registry")));
                report.actions.push(ReconcileAction::KeyMismatch(name.to_string()));
                continue;
            }

            match record.provision {
                ProvisionState::Pending => {
                    if key_matches && self.clients.exists(&record.name) {
                        let mut r = record.clone();
                        r.provision = ProvisionState::Committed;
                        r.is_active = true;
                        record_updates.push(r);
                        report.actions.push(ReconcileAction::CommittedPending(name.to_string()));
                    } else {
                        if key_matches {
                            doc.remove_stanza(name, Some(&record.public_key));
                        }
                        client_removals.push(record.name.clone());
                        record_removals.push(record.name.clone());
                        report.actions.push(ReconcileAction::RolledBackPending(name.to_string()));
                    }
                }
                ProvisionState::Committed => {
                    if record.is_routable() && !key_matches {
                        let mut r = record.clone();
                        r.is_active = false;
                        record_updates.push(r);
                        report.actions.push(ReconcileAction::Quarantined(name.to_string()));
                    } else if record.is_blocked && key_matches {
                        doc.remove_stanza(name, Some(&record.public_key));
                        report.actions.push(ReconcileAction::BlockedStanzaRemoved(name.to_string()));
                    } else if !record.is_active && !record.is_blocked && key_matches {
                        let mut r = record.clone();
                        r.is_active = true;
                        record_updates.push(r);
                        report.actions.push(ReconcileAction::Reactivated(name.to_string()));
                    }
                }
            }
        }

        for stanza in doc.stanzas() {
            if !records.iter().any(|r| r.name.as_str() == stanza.label) {
                warn!("{}", Error::Drift(format!("stanza {} has no registry record", stanza.label)));
                report.actions.push(ReconcileAction::OrphanStanza(stanza.label.clone()));
            }
        }

        if doc != original {
            self.apply_reconciled(&guard, &doc, &original)?;
            report.reloaded = true;
        }

        for name in &client_removals {
            if let Err(e) = self.clients.remove(name) {
                error!("reconcile: removing client config of {name}: {e}");
            }
        }

        for r in record_updates {
            self.registry
                .update(r)
                .map_err(|e| Error::stage(op, Stage::Committed, e))?;
        }
        for name in record_removals {
            self.registry
                .remove(&name)
                .map_err(|e| Error::stage(op, Stage::Committed, e))?;
        }

        for action in &report.actions {
            info!("reconcile: {action}");
            self.audit.record("reconcile", &action.to_string());
        }
        Ok(report)
    }

    /// Write the repaired server config and reload; on failure the original file is put back.
    fn apply_reconciled(&self, guard: &ConfigGuard<'_>, doc: &ServerConfigDoc, original: &ServerConfigDoc) -> Result<()> {
        let op = Operation::Reconcile;
        self.reconciler
            .restore(guard, doc)
            .map_err(|e| Error::stage(op, Stage::ServerConfigUpdated, e))?;
        let Err(e) = self.reconciler.reload(guard) else {
            return Ok(());
        };
        warn!("{op} reload failed, restoring server config: {e}");
        if let Err(re) = self.reconciler.restore(guard, original) {
            error!("reconcile: restoring server config: {re}");
        } else if let Err(re) = self.reconciler.reload(guard) {
            error!("reconcile: reloading restored server config: {re}");
        }
        Err(Error::stage(op, Stage::InterfaceReloaded, e))
    }
}
