use std::{fs, path::PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    atomic,
    error::{Error, Result},
    lock::ConfigLock,
    peer::{PeerName, PeerRecord},
};

/// Persistent store of peer records.
///
/// `update` is optimistic: the caller passes back the record it read, and the write is
/// refused with `Error::Conflict` when the stored revision moved in the meantime.
pub trait ClientRegistry: Send + Sync {
    fn insert(&self, record: PeerRecord) -> Result<PeerRecord>;
    fn get(&self, name: &PeerName) -> Result<Option<PeerRecord>>;
    fn list(&self) -> Result<Vec<PeerRecord>>;
    fn update(&self, record: PeerRecord) -> Result<PeerRecord>;
    fn remove(&self, name: &PeerName) -> Result<Option<PeerRecord>>;

    fn require(&self, name: &PeerName) -> Result<PeerRecord> {
        self.get(name)?.ok_or_else(|| Error::NotFound {
            name: name.to_string(),
        })
    }

    fn find_by_public_key(&self, public_key: &str) -> Result<Option<PeerRecord>> {
        Ok(self.list()?.into_iter().find(|r| r.public_key == public_key))
    }

    fn find_by_owner(&self, owner_id: i64) -> Result<Vec<PeerRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.owner_id == Some(owner_id))
            .collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

/// Registry kept as one JSON document, rewritten atomically on every change.
pub struct JsonFileRegistry {
    path: PathBuf,
    lock: ConfigLock,
}

impl JsonFileRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock: ConfigLock::for_file(&path),
            path,
        }
    }

    fn load(&self) -> Result<RegistryFile> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(RegistryFile::default()),
            Ok(s) => serde_json::from_str(&s)
                .map_err(|e| Error::Registry(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, file: &RegistryFile) -> Result<()> {
        let body = serde_json::to_vec_pretty(file).map_err(|e| Error::Registry(e.to_string()))?;
        atomic::write(&self.path, &body)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut RegistryFile) -> Result<T>) -> Result<T> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let _guard = self.lock.acquire()?;
        let mut file = self.load()?;
        let out = f(&mut file)?;
        self.store(&file)?;
        Ok(out)
    }
}

impl ClientRegistry for JsonFileRegistry {
    fn insert(&self, mut record: PeerRecord) -> Result<PeerRecord> {
        self.modify(|file| {
            if file.peers.iter().any(|r| r.name == record.name) {
                return Err(Error::DuplicateName {
                    name: record.name.to_string(),
                });
            }
            record.revision = 1;
            file.peers.push(record.clone());
            debug!("registry: inserted {}", record.name);
            Ok(record)
        })
    }

    fn get(&self, name: &PeerName) -> Result<Option<PeerRecord>> {
        Ok(self.load()?.peers.into_iter().find(|r| &r.name == name))
    }

    fn list(&self) -> Result<Vec<PeerRecord>> {
        let mut peers = self.load()?.peers;
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(peers)
    }

    fn update(&self, mut record: PeerRecord) -> Result<PeerRecord> {
        self.modify(|file| {
            let stored = file
                .peers
                .iter_mut()
                .find(|r| r.name == record.name)
                .ok_or_else(|| Error::NotFound {
                    name: record.name.to_string(),
                })?;
            if stored.revision != record.revision {
                return Err(Error::Conflict {
                    name: record.name.to_string(),
                    expected: record.revision,
                    found: stored.revision,
                });
            }
            record.revision += 1;
            *stored = record.clone();
            Ok(record)
        })
    }

    fn remove(&self, name: &PeerName) -> Result<Option<PeerRecord>> {
        self.modify(|file| {
            let idx = file.peers.iter().position(|r| &r.name == name);
            Ok(idx.map(|i| file.peers.remove(i)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ProvisionState;
    use chrono::Utc;

    fn record(name: &str) -> PeerRecord {
        PeerRecord {
            name: PeerName::parse(name).unwrap(),
            public_key: format!("{name}-pub"),
            address: "10.0.0.2/32".parse().unwrap(),
            created_at: Utc::now(),
            expires_at: None,
            is_active: false,
            is_blocked: false,
            data_used: 0,
            data_limit: None,
            last_connection: None,
            owner_id: Some(7),
            email: None,
            provision: ProvisionState::Pending,
            counter_snapshot: None,
            revision: 0,
        }
    }

    #[test]
    fn insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JsonFileRegistry::open(dir.path().join("registry.json"));
        let alice = reg.insert(record("alice")).unwrap();
        assert_eq!(alice.revision, 1);
        assert!(matches!(
            reg.insert(record("alice")),
            Err(Error::DuplicateName { .. })
        ));
        assert_eq!(reg.get(&alice.name).unwrap(), Some(alice.clone()));
        assert_eq!(reg.find_by_owner(7).unwrap().len(), 1);
        assert_eq!(
            reg.find_by_public_key("alice-pub").unwrap().map(|r| r.name),
            Some(alice.name.clone())
        );
        assert_eq!(reg.remove(&alice.name).unwrap(), Some(alice.clone()));
        assert_eq!(reg.remove(&alice.name).unwrap(), None);
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn stale_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JsonFileRegistry::open(dir.path().join("registry.json"));
        let first = reg.insert(record("bob")).unwrap();
        let stale = first.clone();

        let mut fresh = first;
        fresh.is_active = true;
        let fresh = reg.update(fresh).unwrap();
        assert_eq!(fresh.revision, 2);

        let mut stale = stale;
        stale.is_blocked = true;
        match reg.update(stale) {
            Err(Error::Conflict { expected, found, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let stored = reg.require(&fresh.name).unwrap();
        assert!(stored.is_active);
        assert!(!stored.is_blocked);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");
        JsonFileRegistry::open(&path).insert(record("carol")).unwrap();
        let reopened = JsonFileRegistry::open(&path);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
