use std::{
    collections::BTreeSet,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use ipnet::Ipv4Net;
use log::{info, warn};

use crate::{
    atomic,
    control::InterfaceControl,
    error::{Error, Result},
    keys,
    lock::ConfigGuard,
    server_conf::{Removal, ServerConfigDoc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Owns every mutation of the server configuration file and the reload that applies it.
/// Mutating calls take a [`ConfigGuard`] so they can only run under the config lock.
pub struct ServerConfigReconciler {
    path: PathBuf,
    control: Arc<dyn InterfaceControl>,
}

impl ServerConfigReconciler {
    pub fn new(path: impl Into<PathBuf>, control: Arc<dyn InterfaceControl>) -> Self {
        Self {
            path: path.into(),
            control,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read without the lock. Writes are atomic renames, so a reader sees either version.
    pub fn snapshot(&self) -> Result<ServerConfigDoc> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("server config {}: {e}", self.path.display()),
            )
        })?;
        Ok(ServerConfigDoc::parse(&content))
    }

    pub fn read(&self, _guard: &ConfigGuard<'_>) -> Result<ServerConfigDoc> {
        self.snapshot()
    }

    pub fn used_addresses(&self, guard: &ConfigGuard<'_>, subnet: &Ipv4Net) -> Result<BTreeSet<Ipv4Addr>> {
        Ok(self.read(guard)?.used_addresses(subnet))
    }

    fn write(&self, _guard: &ConfigGuard<'_>, doc: &ServerConfigDoc) -> Result<()> {
        atomic::write(&self.path, doc.render().as_bytes())
    }

    /**
     * @brief Append a tagged `[Peer]` stanza to the file, without reloading.
     * @param public_key Peer public key.
     * @param allowed_ip Server-side route, normally the peer's /32.
     * @param label Peer name for the marker comment.
     */
    pub fn append_stanza(
        &self,
        guard: &ConfigGuard<'_>,
        public_key: &str,
        allowed_ip: &str,
        label: &str,
    ) -> Result<()> {
        let mut doc = self.read(guard)?;
        if doc.find(label).is_some() {
            return Err(Error::DuplicateName {
                name: label.to_string(),
            });
        }
        if doc.contains_key(public_key) {
            return Err(Error::Validation(format!(
                "public key {}... is already present in the server config",
                keys::short(public_key)
            )));
        }
        doc.append_stanza(label, public_key, allowed_ip, Local::now());
        self.write(guard, &doc)?;
        info!("Added stanza for {label} ({allowed_ip})");
        Ok(())
    }

    /**
     * @brief Remove exactly the stanza tagged `label` with `public_key`, without reloading.
     * A missing stanza is reported as `NotFound` and leaves the file untouched.
     */
    pub fn remove_stanza(&self, guard: &ConfigGuard<'_>, label: &str, public_key: &str) -> Result<RemoveOutcome> {
        let mut doc = self.read(guard)?;
        match doc.remove_stanza(label, Some(public_key)) {
            Removal::Removed(_) => {
                self.write(guard, &doc)?;
                info!("Removed stanza for {label}");
                Ok(RemoveOutcome::Removed)
            }
            Removal::NotFound => Ok(RemoveOutcome::NotFound),
            Removal::KeyMismatch { found } => {
                warn!(
                    "Stanza for {label} carries key {}..., expected {}...; left in place",
                    found.as_deref().map_or("<none>", keys::short),
                    keys::short(public_key)
                );
                Ok(RemoveOutcome::NotFound)
            }
        }
    }

    /// Put back a previously read document verbatim (rollback path).
    pub fn restore(&self, guard: &ConfigGuard<'_>, doc: &ServerConfigDoc) -> Result<()> {
        self.write(guard, doc)
    }

    pub fn reload(&self, _guard: &ConfigGuard<'_>) -> Result<()> {
        self.control.reload()
    }

    pub fn add_peer(&self, guard: &ConfigGuard<'_>, public_key: &str, allowed_ip: &str, label: &str) -> Result<()> {
        self.append_stanza(guard, public_key, allowed_ip, label)?;
        self.reload(guard)
    }

    pub fn remove_peer(&self, guard: &ConfigGuard<'_>, label: &str, public_key: &str) -> Result<RemoveOutcome> {
        let outcome = self.remove_stanza(guard, label, public_key)?;
        if outcome == RemoveOutcome::Removed {
            self.reload(guard)?;
        }
        Ok(outcome)
    }
}
